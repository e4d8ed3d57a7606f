//! MQTT broker link.
//!
//! [`BrokerClient`] is the seam the translation paths are written against;
//! [`MqttLink`] is the rumqttc implementation. The network event loop runs
//! as a spawned task and forwards inbound command messages over an `mpsc`
//! channel.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::MqttConfig;
use crate::error::BridgeError;

/// Capacity of the inbound command channel.
const COMMAND_QUEUE: usize = 256;

/// An inbound message delivered from the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Operations the bridge needs from the messaging transport.
///
/// [`MqttLink`] is the production implementation; tests use
/// [`crate::mock::MockBroker`]. `publish` must be safe to call from
/// concurrent tasks.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Publish one message, fire-and-forget.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError>;

    /// Disconnect from the broker.
    async fn disconnect(&self) -> Result<(), BridgeError>;
}

/// MQTT client plus its running event loop.
pub struct MqttLink {
    client: AsyncClient,
    event_loop: JoinHandle<()>,
}

impl MqttLink {
    /// Connect to the broker, subscribe to the command filter, and start the
    /// network event loop.
    ///
    /// Fails when the broker does not acknowledge the session within the
    /// configured timeout; an unreachable broker at startup is fatal, not
    /// retried. Returns the link and the stream of inbound command messages.
    pub async fn connect(
        config: &MqttConfig,
        command_filter: &str,
    ) -> Result<(Self, mpsc::Receiver<InboundMessage>), BridgeError> {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("mqtt-bridge-ads-{}", std::process::id()));

        let mut options = MqttOptions::new(client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        client
            .subscribe(command_filter, QoS::AtMostOnce)
            .await
            .map_err(|e| BridgeError::Broker(format!("subscribe to '{command_filter}' failed: {e}")))?;

        // drive the event loop until the broker acknowledges the session
        let handshake = async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => {
                        return Err(BridgeError::Broker(format!(
                            "connection to {}:{} failed: {e}",
                            config.host, config.port
                        )));
                    }
                }
            }
        };
        tokio::time::timeout(Duration::from_millis(config.timeout_ms), handshake)
            .await
            .map_err(|_| {
                BridgeError::Broker(format!(
                    "connection to {}:{} timed out",
                    config.host, config.port
                ))
            })??;
        debug!(filter = %command_filter, "connected to MQTT broker");

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let filter = command_filter.to_string();
        let event_loop = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = InboundMessage {
                            topic: publish.topic,
                            payload: publish.payload.to_vec(),
                        };
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        debug!(filter = %filter, "reconnected to MQTT broker");
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "MQTT connection error, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            debug!("MQTT event loop stopped");
        });

        Ok((Self { client, event_loop }, rx))
    }
}

#[async_trait]
impl BrokerClient for MqttLink {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| BridgeError::Publish(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), BridgeError> {
        if let Err(e) = self.client.disconnect().await {
            // the event loop will not see the disconnect, stop it directly
            self.event_loop.abort();
            return Err(BridgeError::Broker(e.to_string()));
        }
        Ok(())
    }
}
