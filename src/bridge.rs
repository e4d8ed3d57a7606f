//! Translation between device notifications and broker messages.
//!
//! Both directions share the same failure policy: anything that goes wrong
//! for one event is logged and that event is dropped. A bad sample or a bad
//! command never affects other variables and never stops the bridge.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::ams;
use crate::config::DataType;
use crate::device::{DeviceClient, Notification};
use crate::mqtt::{BrokerClient, InboundMessage};
use crate::registry::SubscriptionRegistry;

/// Identity of the bridged device, fixed at startup and read-only after.
#[derive(Debug, Clone)]
pub struct BridgeIdentity {
    plc_host: String,
}

impl BridgeIdentity {
    pub fn new(plc_host: impl Into<String>) -> Self {
        Self {
            plc_host: plc_host.into(),
        }
    }

    pub fn plc_host(&self) -> &str {
        &self.plc_host
    }

    /// Topic a variable's values are published on.
    pub fn publish_topic(&self, variable: &str) -> String {
        format!("plc/{}/{}", self.plc_host, variable)
    }

    /// Subscription filter matching every command message for this device.
    pub fn command_filter(&self) -> String {
        format!("plc/{}/set/#", self.plc_host)
    }

    /// Prefix stripped from a command topic to recover the variable name.
    pub fn command_prefix(&self) -> String {
        format!("plc/{}/set/", self.plc_host)
    }
}

/// A decoded device value.
#[derive(Debug, Clone, PartialEq)]
pub enum PlcValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
}

impl fmt::Display for PlcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlcValue::Bool(v) => write!(f, "{v}"),
            PlcValue::Int(v) => write!(f, "{v}"),
            PlcValue::UInt(v) => write!(f, "{v}"),
            PlcValue::Float(v) => write!(f, "{v}"),
            PlcValue::Text(v) => f.write_str(v),
        }
    }
}

/// Errors decoding a notification sample.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload length {got} does not match the {expected} expected for {data_type}")]
    Length {
        data_type: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("string payload is not valid UTF-8")]
    Utf8,
}

/// Decode a raw notification sample according to the variable's declared
/// type.
pub fn decode_value(data: &[u8], data_type: DataType) -> Result<PlcValue, DecodeError> {
    let expected = data_type.size();
    if data_type != DataType::String && data.len() != expected {
        return Err(DecodeError::Length {
            data_type: data_type.as_str(),
            expected,
            got: data.len(),
        });
    }

    let value = match data_type {
        DataType::Bool => PlcValue::Bool(data[0] != 0),
        DataType::U8 => PlcValue::UInt(data[0] as u64),
        DataType::I8 => PlcValue::Int(data[0] as i8 as i64),
        DataType::U16 => PlcValue::UInt(u16::from_le_bytes([data[0], data[1]]) as u64),
        DataType::I16 => PlcValue::Int(i16::from_le_bytes([data[0], data[1]]) as i64),
        DataType::U32 => {
            PlcValue::UInt(u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as u64)
        }
        DataType::I32 => {
            PlcValue::Int(i32::from_le_bytes([data[0], data[1], data[2], data[3]]) as i64)
        }
        DataType::U64 => PlcValue::UInt(u64::from_le_bytes([
            data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
        ])),
        DataType::I64 => PlcValue::Int(i64::from_le_bytes([
            data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
        ])),
        DataType::F32 => {
            PlcValue::Float(f32::from_le_bytes([data[0], data[1], data[2], data[3]]) as f64)
        }
        DataType::F64 => PlcValue::Float(f64::from_le_bytes([
            data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
        ])),
        DataType::String => {
            // the sample carries the full buffer, the value ends at the NUL
            let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
            let text = std::str::from_utf8(&data[..end]).map_err(|_| DecodeError::Utf8)?;
            PlcValue::Text(text.to_string())
        }
    };
    Ok(value)
}

/// The two translation paths between device and broker.
pub struct TranslationBridge {
    identity: BridgeIdentity,
    registry: Arc<SubscriptionRegistry>,
    device: Arc<dyn DeviceClient>,
    broker: Arc<dyn BrokerClient>,
}

impl TranslationBridge {
    pub fn new(
        identity: BridgeIdentity,
        registry: Arc<SubscriptionRegistry>,
        device: Arc<dyn DeviceClient>,
        broker: Arc<dyn BrokerClient>,
    ) -> Self {
        Self {
            identity,
            registry,
            device,
            broker,
        }
    }

    /// Device → broker: decode a notification and publish it.
    pub async fn handle_notification(&self, notification: Notification) {
        let Some(binding) = self.registry.lookup(notification.handle).await else {
            warn!(handle = notification.handle, "notification for unknown handle, dropping");
            return;
        };

        let value = match decode_value(&notification.data, binding.data_type) {
            Ok(value) => value,
            Err(e) => {
                warn!(variable = %binding.name, error = %e, "failed to decode notification, dropping");
                return;
            }
        };

        let topic = self.identity.publish_topic(&binding.name);
        debug!(
            topic = %topic,
            value = %value,
            at = %ams::filetime_to_datetime(notification.timestamp).to_rfc3339(),
            "publishing device value"
        );
        if let Err(e) = self.broker.publish(&topic, value.to_string().into_bytes()).await {
            warn!(topic = %topic, error = %e, "publish failed, value dropped");
        }
    }

    /// Broker → device: recover the variable name from the command topic and
    /// write the payload verbatim.
    ///
    /// A topic without the expected command prefix aborts the write; the
    /// payload is never written under a guessed variable name.
    pub async fn handle_command(&self, message: InboundMessage) {
        let prefix = self.identity.command_prefix();
        let Some(variable) = message.topic.strip_prefix(&prefix) else {
            warn!(topic = %message.topic, "command topic does not start with '{prefix}', dropping");
            return;
        };
        if variable.is_empty() {
            warn!(topic = %message.topic, "command topic names no variable, dropping");
            return;
        }

        debug!(variable, bytes = message.payload.len(), "writing device variable");
        if let Err(e) = self.device.write_by_name(variable, &message.payload).await {
            warn!(variable, error = %e, "device write failed, command dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TransmissionMode, VariableBinding};
    use crate::mock::{MockBroker, MockDeviceClient};
    use std::time::Duration;

    fn binding(name: &str, data_type: DataType) -> VariableBinding {
        VariableBinding {
            name: name.to_string(),
            data_type,
            mode: TransmissionMode::ServerOnChange,
            cycle_time: Duration::from_millis(100),
            max_delay: Duration::from_millis(200),
        }
    }

    fn bridge_with(
        device: Arc<MockDeviceClient>,
        broker: Arc<MockBroker>,
    ) -> (TranslationBridge, Arc<SubscriptionRegistry>) {
        let registry = Arc::new(SubscriptionRegistry::new(device.clone()));
        let bridge = TranslationBridge::new(
            BridgeIdentity::new("wago1"),
            registry.clone(),
            device,
            broker,
        );
        (bridge, registry)
    }

    #[test]
    fn test_topic_layout() {
        let identity = BridgeIdentity::new("wago1");
        assert_eq!(identity.publish_topic("Temperature"), "plc/wago1/Temperature");
        assert_eq!(identity.command_filter(), "plc/wago1/set/#");
        assert_eq!(identity.command_prefix(), "plc/wago1/set/");
    }

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode_value(&[1], DataType::Bool).unwrap(), PlcValue::Bool(true));
        assert_eq!(decode_value(&[0], DataType::Bool).unwrap(), PlcValue::Bool(false));
        assert_eq!(
            decode_value(&0x2A2Bu16.to_le_bytes(), DataType::U16).unwrap(),
            PlcValue::UInt(0x2A2B)
        );
        assert_eq!(
            decode_value(&(-7i32).to_le_bytes(), DataType::I32).unwrap(),
            PlcValue::Int(-7)
        );
        assert_eq!(
            decode_value(&42.5f32.to_le_bytes(), DataType::F32).unwrap(),
            PlcValue::Float(42.5)
        );
        assert_eq!(
            decode_value(&(-1.25f64).to_le_bytes(), DataType::F64).unwrap(),
            PlcValue::Float(-1.25)
        );
    }

    #[test]
    fn test_decode_string_ends_at_nul() {
        let mut data = vec![0u8; 81];
        data[..5].copy_from_slice(b"hello");
        assert_eq!(
            decode_value(&data, DataType::String).unwrap(),
            PlcValue::Text("hello".to_string())
        );
    }

    #[test]
    fn test_decode_length_mismatch() {
        assert_eq!(
            decode_value(&[1, 2, 3], DataType::U16),
            Err(DecodeError::Length {
                data_type: "u16",
                expected: 2,
                got: 3,
            })
        );
    }

    #[test]
    fn test_value_rendering() {
        assert_eq!(PlcValue::Bool(true).to_string(), "true");
        assert_eq!(PlcValue::Int(-5).to_string(), "-5");
        assert_eq!(PlcValue::Float(42.5).to_string(), "42.5");
        assert_eq!(PlcValue::Text("on".to_string()).to_string(), "on");
    }

    #[tokio::test]
    async fn test_notification_published_on_exact_topic() {
        let device = Arc::new(MockDeviceClient::new());
        let broker = Arc::new(MockBroker::new());
        let (bridge, registry) = bridge_with(device.clone(), broker.clone());

        let handle = registry
            .register(&binding("Temperature", DataType::F32))
            .await
            .unwrap();

        bridge
            .handle_notification(Notification {
                handle: handle.notification,
                timestamp: 132_223_104_000_000_000,
                data: 21.5f32.to_le_bytes().to_vec(),
            })
            .await;

        assert_eq!(
            broker.published(),
            vec![("plc/wago1/Temperature".to_string(), b"21.5".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_decode_failure_does_not_affect_other_variables() {
        let device = Arc::new(MockDeviceClient::new());
        let broker = Arc::new(MockBroker::new());
        let (bridge, registry) = bridge_with(device.clone(), broker.clone());

        let bad = registry.register(&binding("Bad", DataType::U32)).await.unwrap();
        let good = registry.register(&binding("Good", DataType::U16)).await.unwrap();

        // wrong payload length for Bad: dropped
        bridge
            .handle_notification(Notification {
                handle: bad.notification,
                timestamp: 0,
                data: vec![1],
            })
            .await;
        assert!(broker.published().is_empty());

        // a well-formed sample for Good still goes out
        bridge
            .handle_notification(Notification {
                handle: good.notification,
                timestamp: 0,
                data: 99u16.to_le_bytes().to_vec(),
            })
            .await;
        assert_eq!(
            broker.published(),
            vec![("plc/wago1/Good".to_string(), b"99".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_unknown_handle_dropped() {
        let device = Arc::new(MockDeviceClient::new());
        let broker = Arc::new(MockBroker::new());
        let (bridge, _registry) = bridge_with(device.clone(), broker.clone());

        bridge
            .handle_notification(Notification {
                handle: 999,
                timestamp: 0,
                data: vec![1],
            })
            .await;
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_command_writes_variable() {
        let device = Arc::new(MockDeviceClient::new());
        let broker = Arc::new(MockBroker::new());
        let (bridge, _registry) = bridge_with(device.clone(), broker.clone());

        bridge
            .handle_command(InboundMessage {
                topic: "plc/wago1/set/Speed".to_string(),
                payload: b"42".to_vec(),
            })
            .await;

        assert_eq!(device.writes(), vec![("Speed".to_string(), b"42".to_vec())]);
    }

    #[tokio::test]
    async fn test_command_with_foreign_topic_writes_nothing() {
        let device = Arc::new(MockDeviceClient::new());
        let broker = Arc::new(MockBroker::new());
        let (bridge, _registry) = bridge_with(device.clone(), broker.clone());

        bridge
            .handle_command(InboundMessage {
                topic: "plc/other/set/Speed".to_string(),
                payload: b"42".to_vec(),
            })
            .await;
        bridge
            .handle_command(InboundMessage {
                topic: "plc/wago1/set/".to_string(),
                payload: b"42".to_vec(),
            })
            .await;

        assert!(device.writes().is_empty());
    }

    #[tokio::test]
    async fn test_command_write_failure_is_contained() {
        let device = Arc::new(MockDeviceClient::new());
        device.fail_writes(true);
        let broker = Arc::new(MockBroker::new());
        let (bridge, _registry) = bridge_with(device.clone(), broker.clone());

        // must not panic or propagate
        bridge
            .handle_command(InboundMessage {
                topic: "plc/wago1/set/Speed".to_string(),
                payload: b"42".to_vec(),
            })
            .await;
        assert!(device.writes().is_empty());
    }
}
