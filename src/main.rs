use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lambdatronic_bridge::config::load_config;
use lambdatronic_bridge::modbus::reader::Coordinator;
use lambdatronic_bridge::modbus::ConnectionManager;
use lambdatronic_bridge::mqtt::MqttBridge;
use lambdatronic_bridge::registers::RegisterMap;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;

    let registers = RegisterMap::load(config.polling.register_map.as_deref())
        .context("Failed to load register map")?;
    info!("Loaded register map with {} data points", registers.len());

    if config.metrics.enabled {
        PrometheusBuilder::new()
            .with_http_listener(config.metrics.listen)
            .install()
            .context("Failed to start Prometheus exporter")?;
        info!("Serving metrics on {}", config.metrics.listen);
    }

    let connection = Arc::new(ConnectionManager::tcp(&config.controller));
    let coordinator = Arc::new(Coordinator::new(
        Arc::new(registers),
        connection,
        &config.polling,
    ));

    coordinator
        .refresh()
        .await
        .with_context(|| format!("Initial poll of {} failed", config.controller.host))?;

    let mqtt = if config.mqtt.enabled {
        let bridge = Arc::new(MqttBridge::new(&config.mqtt, coordinator.clone())?);
        tokio::spawn(bridge.clone().start_publishing(coordinator.subscribe()));
        Some(bridge)
    } else {
        None
    };

    let poller = tokio::spawn(coordinator.clone().run());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");

    coordinator.shutdown().await;
    if let Err(e) = poller.await {
        warn!("Poll task ended abnormally: {}", e);
    }
    if let Some(bridge) = mqtt {
        bridge.shutdown().await;
    }

    Ok(())
}
