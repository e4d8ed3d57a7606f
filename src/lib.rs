//! MQTT bridge for Beckhoff/TwinCAT ADS devices.
//!
//! The bridge subscribes to value-change notifications on a set of PLC
//! variables and republishes each value to an MQTT broker. The reverse path
//! accepts broker messages and writes them back to the device.
//!
//! # Topics
//!
//! ```text
//! plc/<plc_host>/<variable>         device → broker, one value per message
//! plc/<plc_host>/set/<variable>     broker → device, payload written verbatim
//! ```
//!
//! Where `<plc_host>` is the configured device host and `<variable>` the PLC
//! symbol name (for example `Main.Temperature`).

pub mod ams;
pub mod bridge;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod mock;
pub mod mqtt;
pub mod registry;

pub use bridge::{BridgeIdentity, TranslationBridge};
pub use config::BridgeConfig;
pub use controller::BridgeController;
pub use device::{AdsClient, DeviceClient};
pub use error::{BridgeError, Result};
pub use mqtt::{BrokerClient, MqttLink};
pub use registry::SubscriptionRegistry;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .map_err(|e| {
            BridgeError::Config(config::ConfigError::Validation(format!(
                "failed to initialize tracing: {e}"
            )))
        })?;

    Ok(())
}
