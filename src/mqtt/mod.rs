//! MQTT adapter
//!
//! Publishes snapshot values to `{prefix}/{data_point}` and accepts writes on
//! `{prefix}/{data_point}/set`. Controller availability is published retained
//! on `{prefix}/status`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::codec::Value;
use crate::config::MqttConfig;
use crate::modbus::reader::{Coordinator, SnapshotEvent};

/// A write requested over MQTT
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: String,
    pub value: Value,
}

/// Map a configured QoS level, falling back to at-least-once
pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => {
            warn!("Invalid QoS level {}, using 1", level);
            QoS::AtLeastOnce
        }
    }
}

pub fn value_topic(prefix: &str, id: &str) -> String {
    format!("{}/{}", prefix, id)
}

pub fn status_topic(prefix: &str) -> String {
    format!("{}/status", prefix)
}

pub fn command_filter(prefix: &str) -> String {
    format!("{}/+/set", prefix)
}

/// Data point id addressed by a `{prefix}/{id}/set` topic
pub fn command_id<'a>(prefix: &str, topic: &'a str) -> Option<&'a str> {
    let id = topic
        .strip_prefix(prefix)?
        .strip_prefix('/')?
        .strip_suffix("/set")?;
    (!id.is_empty() && !id.contains('/')).then_some(id)
}

/// Parse a command payload: a JSON scalar, or bare text as an option label
pub fn parse_command(payload: &[u8]) -> Option<Value> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(text) {
        Ok(value) => Some(value),
        Err(_) => Some(Value::Text(text.to_string())),
    }
}

/// JSON body published for one data point; absent values are `null`
pub fn value_payload(
    value: Option<&Value>,
    unit: Option<&str>,
    timestamp: Option<DateTime<Utc>>,
) -> serde_json::Value {
    serde_json::json!({
        "value": value,
        "unit": unit,
        "timestamp": timestamp,
    })
}

/// Bridges a [`Coordinator`] to an MQTT broker
pub struct MqttBridge {
    client: AsyncClient,
    coordinator: Arc<Coordinator>,
    topic_prefix: String,
    qos: QoS,
    retain: bool,
    /// Broker session state, driven by the event loop
    connected: watch::Receiver<bool>,
    controller_online: AtomicBool,
}

impl MqttBridge {
    /// Connect to the broker and start forwarding `/set` commands
    pub fn new(config: &MqttConfig, coordinator: Arc<Coordinator>) -> Result<Self> {
        let qos = qos_from_level(config.qos);
        let status = status_topic(&config.topic_prefix);

        let mut mqttoptions = MqttOptions::new(&config.client_id, &config.host, config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);
        mqttoptions.set_last_will(LastWill::new(&status, "offline", qos, true));

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            mqttoptions.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);
        let (connected_tx, connected) = watch::channel(false);
        let (commands, command_rx) = mpsc::channel(32);

        Self::spawn_event_loop(
            eventloop,
            client.clone(),
            connected_tx,
            config.topic_prefix.clone(),
            qos,
            commands,
        );
        Self::spawn_command_worker(coordinator.clone(), command_rx);

        info!(
            "MQTT bridge initialized: {}:{} (prefix: {}, qos: {})",
            config.host, config.port, config.topic_prefix, config.qos
        );

        Ok(Self {
            client,
            coordinator,
            topic_prefix: config.topic_prefix.clone(),
            qos,
            retain: config.retain,
            connected,
            controller_online: AtomicBool::new(false),
        })
    }

    fn spawn_event_loop(
        mut eventloop: EventLoop,
        client: AsyncClient,
        connected: watch::Sender<bool>,
        prefix: String,
        qos: QoS,
        commands: mpsc::Sender<Command>,
    ) {
        let filter = command_filter(&prefix);
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == rumqttc::ConnectReturnCode::Success {
                            connected.send_replace(true);
                            info!("Connected to MQTT broker, subscribing to {}", filter);
                            if let Err(e) = client.try_subscribe(&filter, qos) {
                                error!("Failed to subscribe to {}: {}", filter, e);
                            }
                        } else {
                            error!("MQTT connection rejected: {:?}", ack.code);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Some(id) = command_id(&prefix, &publish.topic) else {
                            continue;
                        };
                        match parse_command(&publish.payload) {
                            Some(value) => {
                                let command = Command {
                                    id: id.to_string(),
                                    value,
                                };
                                if let Err(e) = commands.try_send(command) {
                                    warn!("Dropping MQTT command for {}: {}", id, e);
                                }
                            }
                            None => warn!("Ignoring empty or invalid command on {}", publish.topic),
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        connected.send_replace(false);
                        warn!("Disconnected from MQTT broker");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if connected.send_replace(false) {
                            warn!("Lost connection to MQTT broker");
                        }
                        error!("MQTT error: {:?}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });
    }

    fn spawn_command_worker(coordinator: Arc<Coordinator>, mut commands: mpsc::Receiver<Command>) {
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                debug!("MQTT command: {} = {}", command.id, command.value);
                match coordinator.write(&command.id, &command.value).await {
                    Ok(()) => {}
                    Err(e) if e.is_rejected() => warn!("{}", e),
                    Err(e) => error!("{}", e),
                }
            }
        });
    }

    /// True while the broker session is up
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    async fn publish_value(
        &self,
        id: &str,
        value: Option<&Value>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let unit = self
            .coordinator
            .registers()
            .get(id)
            .and_then(|point| point.unit.as_deref());
        let topic = value_topic(&self.topic_prefix, id);
        let payload = serde_json::to_string(&value_payload(value, unit, timestamp))
            .with_context(|| "Failed to serialize payload")?;

        self.client
            .publish(&topic, self.qos, self.retain, payload.as_bytes())
            .await
            .with_context(|| format!("Failed to publish to {}", topic))?;

        debug!("MQTT published to {}: {}", topic, payload);
        Ok(())
    }

    /// Publish controller availability (retained), only when it changes
    pub async fn publish_status(&self, online: bool) -> Result<()> {
        if self.controller_online.swap(online, Ordering::SeqCst) == online {
            return Ok(());
        }
        self.send_status(online).await
    }

    async fn send_status(&self, online: bool) -> Result<()> {
        let topic = status_topic(&self.topic_prefix);
        let payload = if online { "online" } else { "offline" };

        self.client
            .publish(&topic, self.qos, true, payload.as_bytes())
            .await
            .with_context(|| format!("Failed to publish status to {}", topic))?;

        info!("MQTT status: {} = {}", topic, payload);
        Ok(())
    }

    /// Publish availability and every value of the current snapshot.
    /// Sent whenever the broker session comes up, so retained topics
    /// recover from the last will.
    async fn publish_current(&self) -> Result<()> {
        let snapshot = self.coordinator.snapshot().await;
        if snapshot.updated_at.is_none() {
            return Ok(());
        }
        let online = snapshot.values.values().any(Option::is_some);
        self.controller_online.store(online, Ordering::SeqCst);
        self.send_status(online).await?;
        for (id, value) in &snapshot.values {
            self.publish_value(id, value.as_ref(), snapshot.updated_at)
                .await?;
        }
        Ok(())
    }

    /// Publish one snapshot event; skipped while the broker is down
    async fn handle_event(&self, event: SnapshotEvent) -> Result<()> {
        if !self.is_connected() {
            debug!("MQTT broker not connected, skipping {:?}", event);
            return Ok(());
        }
        match event {
            SnapshotEvent::Refreshed(snapshot) => {
                self.publish_status(true).await?;
                for (id, value) in &snapshot.values {
                    self.publish_value(id, value.as_ref(), snapshot.updated_at)
                        .await?;
                }
            }
            SnapshotEvent::PointRefreshed { id, value } => {
                self.publish_value(&id, value.as_ref(), Some(Utc::now()))
                    .await?;
            }
            SnapshotEvent::CycleFailed => {
                self.publish_status(false).await?;
            }
        }
        Ok(())
    }

    /// Forward snapshot events until the coordinator goes away, and
    /// republish the current snapshot each time the broker session comes up
    pub async fn start_publishing(self: Arc<Self>, mut events: broadcast::Receiver<SnapshotEvent>) {
        info!("MQTT publishing loop started");
        let mut connected = self.connected.clone();

        if *connected.borrow_and_update() {
            if let Err(e) = self.publish_current().await {
                error!("MQTT publish error: {}", e);
            }
        }

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Err(e) = self.handle_event(event).await {
                            error!("MQTT publish error: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("MQTT publisher lagged, missed {} updates", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Snapshot channel closed, stopping MQTT publisher");
                        break;
                    }
                },
                changed = connected.changed() => {
                    if changed.is_err() {
                        info!("MQTT event loop stopped, stopping MQTT publisher");
                        break;
                    }
                    if *connected.borrow_and_update() {
                        if let Err(e) = self.publish_current().await {
                            error!("MQTT publish error: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Mark the bridge offline and disconnect
    pub async fn shutdown(&self) {
        self.controller_online.store(false, Ordering::SeqCst);
        if self.is_connected() {
            if let Err(e) = self.send_status(false).await {
                debug!("Could not publish offline status: {}", e);
            }
        }
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect failed: {}", e);
        }
    }
}
