//! Configuration for the ADS bridge.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::ams::AmsNetId;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// MQTT broker settings
    pub mqtt: MqttConfig,

    /// ADS device settings
    pub ads: AdsConfig,

    /// Device variables to mirror, keyed by symbol name
    pub variables: BTreeMap<String, VariableConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// MQTT broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host (IP or hostname)
    pub host: String,

    /// Broker port (default: 1883)
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Initial connection timeout in milliseconds
    #[serde(default = "default_mqtt_timeout_ms")]
    pub timeout_ms: u64,

    /// Client id; derived from the process id when omitted
    #[serde(default)]
    pub client_id: Option<String>,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    60
}

fn default_mqtt_timeout_ms() -> u64 {
    5000
}

/// ADS device connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdsConfig {
    /// Device host identifier; used as the TCP host to connect to and as the
    /// second segment of every topic (`plc/<plc_host>/...`)
    pub plc_host: String,

    /// Explicit AMS net id; defaults to "<plc_host>.1.1"
    #[serde(default)]
    pub ams_net_id: Option<String>,

    /// Target AMS port (default: 851, TwinCAT 3 PLC runtime 1)
    #[serde(default = "default_ams_port")]
    pub port: u16,

    /// AMS/TCP router port (default: 48898)
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// Connection and request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Default notification cycle time in milliseconds
    #[serde(default = "default_cycle_time_ms")]
    pub cycle_time_ms: u64,

    /// Default maximum notification delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Pause between notification registrations at startup
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,

    /// Heartbeat check period in seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

fn default_ams_port() -> u16 {
    851
}

fn default_tcp_port() -> u16 {
    crate::ams::ADS_TCP_PORT
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_cycle_time_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    1000
}

fn default_stagger_ms() -> u64 {
    100
}

fn default_heartbeat_secs() -> u64 {
    10
}

impl AdsConfig {
    /// Resolve the target AMS net id.
    pub fn net_id(&self) -> Result<AmsNetId, ConfigError> {
        let raw = match &self.ams_net_id {
            Some(id) => id.clone(),
            None => format!("{}.1.1", self.plc_host),
        };
        raw.parse()
            .map_err(|e| ConfigError::Validation(format!("{e}")))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Configuration for a single bridged variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableConfig {
    /// PLC data type of the symbol
    pub data_type: DataType,

    /// Notification transmission mode
    #[serde(default)]
    pub mode: TransmissionMode,

    /// Cycle time override in milliseconds
    #[serde(default)]
    pub cycle_time_ms: Option<u64>,

    /// Max delay override in milliseconds
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

/// PLC STRING(80) buffer length including the trailing NUL.
pub const STRING_BUFFER_LEN: usize = 81;

/// Data types a bridged variable can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// BOOL
    Bool,
    /// USINT / BYTE
    U8,
    /// SINT
    I8,
    /// UINT / WORD
    U16,
    /// INT
    I16,
    /// UDINT / DWORD
    U32,
    /// DINT
    I32,
    /// ULINT
    U64,
    /// LINT
    I64,
    /// REAL
    F32,
    /// LREAL
    F64,
    /// STRING(80)
    String,
}

impl DataType {
    /// Byte length of one sample of this type on the wire.
    pub fn size(&self) -> usize {
        match self {
            DataType::Bool | DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::U64 | DataType::I64 | DataType::F64 => 8,
            DataType::String => STRING_BUFFER_LEN,
        }
    }

    /// Return the string name for this data type.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::U8 => "u8",
            DataType::I8 => "i8",
            DataType::U16 => "u16",
            DataType::I16 => "i16",
            DataType::U32 => "u32",
            DataType::I32 => "i32",
            DataType::U64 => "u64",
            DataType::I64 => "i64",
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::String => "string",
        }
    }
}

/// Notification transmission modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmissionMode {
    /// Notify on every server cycle
    ServerCycle,
    /// Notify only when the value changes (default)
    #[default]
    ServerOnChange,
}

impl TransmissionMode {
    /// ADS wire encoding of this mode.
    pub fn wire_value(self) -> u32 {
        match self {
            TransmissionMode::ServerCycle => 3,
            TransmissionMode::ServerOnChange => 4,
        }
    }
}

/// A variable binding with all defaults resolved. Immutable once built.
#[derive(Debug, Clone)]
pub struct VariableBinding {
    pub name: String,
    pub data_type: DataType,
    pub mode: TransmissionMode,
    pub cycle_time: Duration,
    pub max_delay: Duration,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl BridgeConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.host.is_empty() {
            return Err(ConfigError::Validation(
                "mqtt.host cannot be empty".to_string(),
            ));
        }

        if self.ads.plc_host.is_empty() {
            return Err(ConfigError::Validation(
                "ads.plc_host cannot be empty".to_string(),
            ));
        }

        if self.variables.is_empty() {
            return Err(ConfigError::Validation(
                "at least one variable must be configured".to_string(),
            ));
        }

        if self.ads.net_id().is_err() {
            return Err(ConfigError::Validation(format!(
                "ads.ams_net_id is required when plc_host '{}' is not a dotted IPv4 address",
                self.ads.plc_host
            )));
        }

        Ok(())
    }

    /// Resolve the configured variables into bindings, applying the `ads`
    /// section defaults where a variable gives no override.
    pub fn bindings(&self) -> Vec<VariableBinding> {
        self.variables
            .iter()
            .map(|(name, var)| VariableBinding {
                name: name.clone(),
                data_type: var.data_type,
                mode: var.mode,
                cycle_time: Duration::from_millis(
                    var.cycle_time_ms.unwrap_or(self.ads.cycle_time_ms),
                ),
                max_delay: Duration::from_millis(
                    var.max_delay_ms.unwrap_or(self.ads.max_delay_ms),
                ),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> BridgeConfig {
        json5::from_str(json).unwrap()
    }

    const MINIMAL: &str = r#"{
        mqtt: { host: "localhost" },
        ads: { plc_host: "192.168.0.10" },
        variables: {
            "Main.Temperature": { data_type: "f32" },
        },
    }"#;

    #[test]
    fn test_parse_minimal_config() {
        let config = parse(MINIMAL);
        config.validate().unwrap();

        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.timeout_ms, 5000);
        assert_eq!(config.ads.port, 851);
        assert_eq!(config.ads.tcp_port, 48898);
        assert_eq!(config.ads.stagger_ms, 100);
        assert_eq!(config.ads.heartbeat_secs, 10);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.ads.net_id().unwrap().to_string(), "192.168.0.10.1.1");

        let var = &config.variables["Main.Temperature"];
        assert_eq!(var.data_type, DataType::F32);
        assert_eq!(var.mode, TransmissionMode::ServerOnChange);
    }

    #[test]
    fn test_binding_fallbacks() {
        let config = parse(
            r#"{
            mqtt: { host: "localhost" },
            ads: { plc_host: "192.168.0.10", cycle_time_ms: 200, max_delay_ms: 400 },
            variables: {
                "Fast": { data_type: "u16", mode: "server_cycle", cycle_time_ms: 50 },
                "Slow": { data_type: "bool" },
            },
        }"#,
        );

        let bindings = config.bindings();
        assert_eq!(bindings.len(), 2);

        // BTreeMap iteration order is the registration order
        assert_eq!(bindings[0].name, "Fast");
        assert_eq!(bindings[0].mode, TransmissionMode::ServerCycle);
        assert_eq!(bindings[0].cycle_time, Duration::from_millis(50));
        assert_eq!(bindings[0].max_delay, Duration::from_millis(400));

        assert_eq!(bindings[1].name, "Slow");
        assert_eq!(bindings[1].cycle_time, Duration::from_millis(200));
    }

    #[test]
    fn test_validate_empty_variables() {
        let config = parse(
            r#"{
            mqtt: { host: "localhost" },
            ads: { plc_host: "192.168.0.10" },
            variables: {},
        }"#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hostname_requires_explicit_net_id() {
        let mut config = parse(MINIMAL);
        config.ads.plc_host = "wago1".to_string();
        assert!(config.validate().is_err());

        config.ads.ams_net_id = Some("5.39.71.10.1.1".to_string());
        config.validate().unwrap();
        assert_eq!(config.ads.net_id().unwrap().to_string(), "5.39.71.10.1.1");
    }

    #[test]
    fn test_data_type_sizes() {
        assert_eq!(DataType::Bool.size(), 1);
        assert_eq!(DataType::I16.size(), 2);
        assert_eq!(DataType::F32.size(), 4);
        assert_eq!(DataType::F64.size(), 8);
        assert_eq!(DataType::String.size(), STRING_BUFFER_LEN);
    }

    #[test]
    fn test_transmission_mode_wire_values() {
        assert_eq!(TransmissionMode::ServerCycle.wire_value(), 3);
        assert_eq!(TransmissionMode::ServerOnChange.wire_value(), 4);
    }
}
