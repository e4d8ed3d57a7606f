//! MQTT bridge for Beckhoff/TwinCAT ADS devices.
//!
//! Mirrors PLC variables to MQTT topics and writes broker commands back to
//! the device.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use mqtt_bridge_ads::bridge::BridgeIdentity;
use mqtt_bridge_ads::config::BridgeConfig;
use mqtt_bridge_ads::controller::BridgeController;
use mqtt_bridge_ads::device::AdsClient;
use mqtt_bridge_ads::mqtt::MqttLink;

/// MQTT bridge for ADS devices.
#[derive(Parser, Debug)]
#[command(name = "mqtt-bridge-ads")]
#[command(about = "Mirrors ADS device variables to MQTT and back")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = BridgeConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    mqtt_bridge_ads::init_tracing(&level)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting mqtt-bridge-ads {}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from {:?}", args.config);

    let identity = BridgeIdentity::new(config.ads.plc_host.clone());

    info!(
        "Connecting to ADS device at {}:{}...",
        config.ads.plc_host, config.ads.tcp_port
    );
    let (device, notifications) = AdsClient::connect(&config.ads)
        .await
        .with_context(|| format!("Failed to connect to ADS device '{}'", config.ads.plc_host))?;
    let device = Arc::new(device);

    info!(
        "Connecting to MQTT broker at {}:{}...",
        config.mqtt.host, config.mqtt.port
    );
    let (broker, commands) = MqttLink::connect(&config.mqtt, &identity.command_filter())
        .await
        .with_context(|| format!("Failed to connect to MQTT broker '{}'", config.mqtt.host))?;
    let broker = Arc::new(broker);

    let controller = BridgeController::new(&config, device, broker, notifications, commands);
    controller.run().await?;

    info!("Goodbye!");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_is_positional() {
        let args = Args::try_parse_from(["mqtt-bridge-ads", "bridge.json5"]).unwrap();
        assert_eq!(args.config, PathBuf::from("bridge.json5"));
        assert!(args.log_level.is_none());
    }

    #[test]
    fn test_missing_config_path_is_rejected() {
        assert!(Args::try_parse_from(["mqtt-bridge-ads"]).is_err());
    }

    #[test]
    fn test_log_level_override() {
        let args =
            Args::try_parse_from(["mqtt-bridge-ads", "bridge.json5", "--log-level", "debug"])
                .unwrap();
        assert_eq!(args.config, PathBuf::from("bridge.json5"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
    }
}
