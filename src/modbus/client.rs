//! Modbus transport types
//!
//! The connection manager talks to the controller through the [`Connector`]
//! and [`Transport`] traits; [`TcpConnector`] is the tokio-modbus backed
//! implementation.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::timeout;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tokio_modbus::Exception;
use tracing::debug;

/// Error type for Modbus operations
#[derive(Debug, thiserror::Error)]
pub enum ModbusError {
    #[error("Modbus exception: {0:?}")]
    Exception(Exception),
    #[error("Transport error: {0}")]
    Transport(#[from] tokio_modbus::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Not connected")]
    NotConnected,
    #[error("Unexpected response to {0}")]
    UnexpectedResponse(&'static str),
}

impl ModbusError {
    /// Device answered with an exception response; the session is still usable
    pub fn is_exception(&self) -> bool {
        matches!(self, ModbusError::Exception(_))
    }
}

/// The subset of Modbus requests the bridge issues, with wire addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    ReadCoils(u16, u16),
    ReadDiscreteInputs(u16, u16),
    ReadInputRegisters(u16, u16),
    ReadHoldingRegisters(u16, u16),
    WriteSingleRegister(u16, u16),
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::ReadCoils(..) => "read coils",
            Request::ReadDiscreteInputs(..) => "read discrete inputs",
            Request::ReadInputRegisters(..) => "read input registers",
            Request::ReadHoldingRegisters(..) => "read holding registers",
            Request::WriteSingleRegister(..) => "write single register",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Bits(Vec<bool>),
    Words(Vec<u16>),
    Written,
}

/// An established session with the controller
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport {
    async fn call(&mut self, request: Request) -> Result<Response, ModbusError>;
}

pub type BoxTransport = Box<dyn Transport + Send>;

/// Opens new sessions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector {
    async fn connect(&self) -> Result<BoxTransport, ModbusError>;

    /// Human-readable endpoint for logs
    fn endpoint(&self) -> String;
}

/// Modbus TCP connector
pub struct TcpConnector {
    host: String,
    port: u16,
    unit_id: u8,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
            timeout,
        }
    }

    async fn resolve(&self) -> Result<SocketAddr, ModbusError> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                ModbusError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address for {}", self.host),
                ))
            })
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<BoxTransport, ModbusError> {
        let connect = async {
            let addr = self.resolve().await?;
            debug!("Connecting to Modbus TCP: {} (unit {})", addr, self.unit_id);
            let ctx = tcp::connect_slave(addr, Slave(self.unit_id)).await?;
            Ok::<_, ModbusError>(ctx)
        };

        let ctx = timeout(self.timeout, connect)
            .await
            .map_err(|_| ModbusError::Timeout(self.timeout))??;

        Ok(Box::new(TcpTransport {
            ctx,
            timeout: self.timeout,
        }))
    }

    fn endpoint(&self) -> String {
        format!("{}:{} (unit {})", self.host, self.port, self.unit_id)
    }
}

/// Live tokio-modbus TCP session
pub struct TcpTransport {
    ctx: Context,
    timeout: Duration,
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&mut self, request: Request) -> Result<Response, ModbusError> {
        let ctx = &mut self.ctx;
        let exchange = async move {
            let response = match request {
                Request::ReadCoils(addr, cnt) => {
                    Response::Bits(ctx.read_coils(addr, cnt).await?.map_err(ModbusError::Exception)?)
                }
                Request::ReadDiscreteInputs(addr, cnt) => Response::Bits(
                    ctx.read_discrete_inputs(addr, cnt)
                        .await?
                        .map_err(ModbusError::Exception)?,
                ),
                Request::ReadInputRegisters(addr, cnt) => Response::Words(
                    ctx.read_input_registers(addr, cnt)
                        .await?
                        .map_err(ModbusError::Exception)?,
                ),
                Request::ReadHoldingRegisters(addr, cnt) => Response::Words(
                    ctx.read_holding_registers(addr, cnt)
                        .await?
                        .map_err(ModbusError::Exception)?,
                ),
                Request::WriteSingleRegister(addr, value) => {
                    ctx.write_single_register(addr, value)
                        .await?
                        .map_err(ModbusError::Exception)?;
                    Response::Written
                }
            };
            Ok::<_, ModbusError>(response)
        };

        timeout(self.timeout, exchange)
            .await
            .map_err(|_| ModbusError::Timeout(self.timeout))?
    }
}
