//! Modbus protocol handling
//!
//! [`ConnectionManager`] owns the single TCP session to the controller and
//! serializes every request through it.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::ControllerConfig;

pub mod client;
pub mod planner;
pub mod reader;

use client::{BoxTransport, Connector, ModbusError, Request, Response, TcpConnector};

/// Reconnect behaviour after failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// No connect attempt until this long after the last failure
    pub reconnect_delay: Duration,
    /// Minimum spacing between connect attempts while cooling off
    pub attempt_interval: Duration,
    /// Reconnect-and-retry attempts after a transport error within one request
    pub retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(30),
            attempt_interval: Duration::from_secs(1),
            retries: 1,
        }
    }
}

impl From<&ControllerConfig> for ReconnectPolicy {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            reconnect_delay: config.reconnect_delay(),
            attempt_interval: config.attempt_interval(),
            retries: config.retries,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    CoolingOff,
    /// Shut down; no further connects
    Closed,
}

enum Link {
    Disconnected,
    Connected(BoxTransport),
    CoolingOff { since: Instant },
    Closed,
}

struct Session {
    link: Link,
    last_attempt: Option<Instant>,
}

/// Single point of Modbus I/O for one controller.
///
/// All operations share one lock: at most one request is in flight, and
/// connect policy is applied inside the same critical section.
pub struct ConnectionManager {
    connector: Box<dyn Connector + Send + Sync>,
    endpoint: String,
    policy: ReconnectPolicy,
    session: Mutex<Session>,
}

impl ConnectionManager {
    pub fn new(connector: Box<dyn Connector + Send + Sync>, policy: ReconnectPolicy) -> Self {
        let endpoint = connector.endpoint();
        Self {
            connector,
            endpoint,
            policy,
            session: Mutex::new(Session {
                link: Link::Disconnected,
                last_attempt: None,
            }),
        }
    }

    /// Manager for a Modbus TCP controller
    pub fn tcp(config: &ControllerConfig) -> Self {
        info!(
            "Initializing Modbus client for {}:{} (unit {})",
            config.host, config.port, config.device_id
        );
        let connector = TcpConnector::new(
            config.host.clone(),
            config.port,
            config.device_id,
            config.timeout(),
        );
        Self::new(Box::new(connector), ReconnectPolicy::from(config))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn state(&self) -> ConnectionState {
        match self.session.lock().await.link {
            Link::Disconnected => ConnectionState::Disconnected,
            Link::Connected(_) => ConnectionState::Connected,
            Link::CoolingOff { .. } => ConnectionState::CoolingOff,
            Link::Closed => ConnectionState::Closed,
        }
    }

    /// Make sure a session exists, connecting if the policy allows it
    pub async fn ensure_connected(&self) -> bool {
        let mut session = self.session.lock().await;
        self.connect_locked(&mut session).await
    }

    async fn connect_locked(&self, session: &mut Session) -> bool {
        let now = Instant::now();
        match session.link {
            Link::Connected(_) => return true,
            Link::Closed => {
                debug!("Connection to {} is closed, not reconnecting", self.endpoint);
                return false;
            }
            Link::CoolingOff { since } => {
                let cooling = now.duration_since(since) < self.policy.reconnect_delay;
                let throttled = session
                    .last_attempt
                    .is_some_and(|last| now.duration_since(last) < self.policy.attempt_interval);
                if cooling || throttled {
                    debug!("Not reconnecting to {} yet, cooling off", self.endpoint);
                    return false;
                }
            }
            Link::Disconnected => {}
        }

        session.last_attempt = Some(now);
        match self.connector.connect().await {
            Ok(transport) => {
                info!("Connected to Modbus controller at {}", self.endpoint);
                session.link = Link::Connected(transport);
                true
            }
            Err(e) => {
                debug!("Could not connect to {}: {}", self.endpoint, e);
                session.link = Link::CoolingOff {
                    since: Instant::now(),
                };
                false
            }
        }
    }

    /// Run one request, reconnecting and retrying on transport errors.
    ///
    /// Exception responses leave the session open. A transport error
    /// discards the session; once retries are used up the manager cools off.
    async fn call(&self, request: Request) -> Result<Response, ModbusError> {
        let mut session = self.session.lock().await;
        let mut attempt = 0;

        loop {
            if !self.connect_locked(&mut session).await {
                return Err(ModbusError::NotConnected);
            }
            let Link::Connected(transport) = &mut session.link else {
                return Err(ModbusError::NotConnected);
            };

            debug!("{} {:?} on {}", request.name(), request, self.endpoint);
            match transport.call(request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_exception() => {
                    debug!("{} rejected by {}: {}", request.name(), self.endpoint, e);
                    return Err(e);
                }
                Err(e) if attempt < self.policy.retries => {
                    attempt += 1;
                    debug!(
                        "{} failed on {}: {}, reconnecting (retry {}/{})",
                        request.name(),
                        self.endpoint,
                        e,
                        attempt,
                        self.policy.retries
                    );
                    session.link = Link::Disconnected;
                }
                Err(e) => {
                    debug!("{} failed on {}: {}", request.name(), self.endpoint, e);
                    info!("Lost connection to {}, cooling off", self.endpoint);
                    session.link = Link::CoolingOff {
                        since: Instant::now(),
                    };
                    return Err(e);
                }
            }
        }
    }

    pub async fn read_coils(&self, addr: u16, cnt: u16) -> Result<Vec<bool>, ModbusError> {
        match self.call(Request::ReadCoils(addr, cnt)).await? {
            Response::Bits(bits) => Ok(bits),
            _ => Err(ModbusError::UnexpectedResponse("read coils")),
        }
    }

    pub async fn read_discrete_inputs(
        &self,
        addr: u16,
        cnt: u16,
    ) -> Result<Vec<bool>, ModbusError> {
        match self.call(Request::ReadDiscreteInputs(addr, cnt)).await? {
            Response::Bits(bits) => Ok(bits),
            _ => Err(ModbusError::UnexpectedResponse("read discrete inputs")),
        }
    }

    pub async fn read_input_registers(
        &self,
        addr: u16,
        cnt: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        match self.call(Request::ReadInputRegisters(addr, cnt)).await? {
            Response::Words(words) => Ok(words),
            _ => Err(ModbusError::UnexpectedResponse("read input registers")),
        }
    }

    pub async fn read_holding_registers(
        &self,
        addr: u16,
        cnt: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        match self.call(Request::ReadHoldingRegisters(addr, cnt)).await? {
            Response::Words(words) => Ok(words),
            _ => Err(ModbusError::UnexpectedResponse("read holding registers")),
        }
    }

    /// Write a single holding register
    pub async fn write_holding_register(&self, addr: u16, value: u16) -> Result<(), ModbusError> {
        match self.call(Request::WriteSingleRegister(addr, value)).await? {
            Response::Written => {
                info!(
                    "Wrote value {} to register {} on {}",
                    value, addr, self.endpoint
                );
                Ok(())
            }
            _ => Err(ModbusError::UnexpectedResponse("write single register")),
        }
    }

    /// Drop the session for good. Every later request fails with
    /// `NotConnected`. Safe to call repeatedly.
    pub async fn close(&self) {
        let mut session = self.session.lock().await;
        if matches!(session.link, Link::Connected(_)) {
            info!("Closing connection to {}", self.endpoint);
        }
        session.link = Link::Closed;
    }
}
