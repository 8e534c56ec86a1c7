//! Configuration management for the Lambdatronic bridge

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::modbus::planner::PlannerConfig;

/// Largest register count a single Modbus read response can carry.
pub const MODBUS_MAX_READ: u32 = 125;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Controller endpoint and connection policy
    pub controller: ControllerConfig,
    /// Poll schedule and enabled data points
    pub polling: PollingConfig,
    /// MQTT broker configuration
    pub mqtt: MqttConfig,
    /// Prometheus exporter
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Host name or IP of the Modbus TCP gateway
    pub host: String,
    /// Port (default: 502)
    pub port: u16,
    /// Modbus unit ID (default: 2)
    pub device_id: u8,
    /// Timeout for connect and for each request
    pub timeout_secs: u64,
    /// Extra attempts after a transport error within one request
    pub retries: u32,
    /// Cool-off after a failed connect or a transport error
    pub reconnect_delay_secs: u64,
    /// Minimum spacing between connect attempts while cooling off
    pub attempt_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Seconds between full poll cycles
    pub update_interval_secs: u64,
    /// Largest address distance merged into one read
    pub max_gap: u32,
    /// Upper bound (exclusive) on a read block's span
    pub max_block_size: u32,
    /// Data point ids to poll
    pub enabled: Vec<String>,
    /// Categories whose data points are polled
    pub categories: Vec<String>,
    /// Register map file replacing the built-in catalog
    pub register_map: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Publish snapshots to MQTT
    pub enabled: bool,
    /// MQTT broker host
    pub host: String,
    /// MQTT broker port
    pub port: u16,
    /// Client ID
    pub client_id: String,
    /// Topic prefix
    pub topic_prefix: String,
    /// QoS level (0, 1, or 2)
    pub qos: u8,
    /// Retain value messages
    pub retain: bool,
    /// Username (optional)
    pub username: Option<String>,
    /// Password (optional)
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics
    pub enabled: bool,
    /// Listen address of the exporter
    pub listen: SocketAddr,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 502,
            device_id: 2,
            timeout_secs: 10,
            retries: 1,
            reconnect_delay_secs: 30,
            attempt_interval_secs: 1,
        }
    }
}

impl ControllerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn attempt_interval(&self) -> Duration {
        Duration::from_secs(self.attempt_interval_secs)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: 60,
            max_gap: 5,
            max_block_size: 122,
            enabled: vec![],
            categories: vec![],
            register_map: None,
        }
    }
}

impl PollingConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn planner(&self) -> PlannerConfig {
        PlannerConfig {
            max_gap: self.max_gap,
            max_block_size: self.max_block_size,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 1883,
            client_id: "lambdatronic-bridge".to_string(),
            topic_prefix: "lambdatronic".to_string(),
            qos: 1,
            retain: false,
            username: None,
            password: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: SocketAddr::from(([0, 0, 0, 0], 9100)),
        }
    }
}

impl Config {
    /// Reject settings the poll engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.controller.host.trim().is_empty() {
            bail!("controller.host must not be empty");
        }
        if self.controller.timeout_secs == 0 {
            bail!("controller.timeout_secs must be at least 1");
        }
        if self.polling.update_interval_secs == 0 {
            bail!("polling.update_interval_secs must be at least 1");
        }
        if self.polling.max_block_size < 2 || self.polling.max_block_size > MODBUS_MAX_READ {
            bail!(
                "polling.max_block_size must be between 2 and {}, got {}",
                MODBUS_MAX_READ,
                self.polling.max_block_size
            );
        }
        Ok(())
    }
}

/// Load configuration from file and environment, or use defaults
pub fn load_config() -> Result<Config> {
    let config_path =
        std::env::var("LAMBDATRONIC_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());

    load_config_from(&config_path)
}

/// Load configuration from `path` (if present) with `LAMBDATRONIC__*` overrides
pub fn load_config_from(path: &str) -> Result<Config> {
    if !std::path::Path::new(path).exists() {
        tracing::warn!("Config file {} not found, using defaults", path);
    }

    let settings = config::Config::builder()
        .add_source(config::File::new(path, config::FileFormat::Yaml).required(false))
        .add_source(
            config::Environment::with_prefix("LAMBDATRONIC")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to read config file: {}", path))?;

    let config: Config = settings
        .try_deserialize()
        .with_context(|| "Failed to parse config file")?;

    config.validate()?;
    Ok(config)
}
