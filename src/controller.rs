//! Bridge lifecycle: staggered startup, heartbeat supervision, and ordered
//! shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::bridge::{BridgeIdentity, TranslationBridge};
use crate::config::{BridgeConfig, VariableBinding};
use crate::device::{DeviceClient, EXPECTED_RUN_STATE, Notification};
use crate::error::{BridgeError, Result};
use crate::mqtt::{BrokerClient, InboundMessage};
use crate::registry::SubscriptionRegistry;

/// Runs the bridge from startup to shutdown.
///
/// The controller owns both message streams. It registers the configured
/// subscriptions one by one with a pause in between, then supervises the
/// device with a periodic heartbeat. Whether the run ends in a shutdown
/// signal or a heartbeat failure, the same teardown sequence executes
/// exactly once: release all subscriptions, close the device connection,
/// disconnect from the broker.
pub struct BridgeController {
    bindings: Vec<VariableBinding>,
    stagger: Duration,
    heartbeat: Duration,
    bridge: Arc<TranslationBridge>,
    registry: Arc<SubscriptionRegistry>,
    device: Arc<dyn DeviceClient>,
    broker: Arc<dyn BrokerClient>,
    notifications: mpsc::Receiver<Notification>,
    commands: mpsc::Receiver<InboundMessage>,
}

impl BridgeController {
    pub fn new(
        config: &BridgeConfig,
        device: Arc<dyn DeviceClient>,
        broker: Arc<dyn BrokerClient>,
        notifications: mpsc::Receiver<Notification>,
        commands: mpsc::Receiver<InboundMessage>,
    ) -> Self {
        let identity = BridgeIdentity::new(config.ads.plc_host.clone());
        let registry = Arc::new(SubscriptionRegistry::new(device.clone()));
        let bridge = Arc::new(TranslationBridge::new(
            identity,
            registry.clone(),
            device.clone(),
            broker.clone(),
        ));

        Self {
            bindings: config.bindings(),
            stagger: Duration::from_millis(config.ads.stagger_ms),
            heartbeat: Duration::from_secs(config.ads.heartbeat_secs),
            bridge,
            registry,
            device,
            broker,
            notifications,
            commands,
        }
    }

    /// Run until a shutdown signal arrives or the heartbeat fails.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Like [`run`](Self::run), with the shutdown trigger supplied by the
    /// caller.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let Self {
            bindings,
            stagger,
            heartbeat,
            bridge,
            registry,
            device,
            broker,
            mut notifications,
            mut commands,
        } = self;

        let notify_bridge = bridge.clone();
        let notify_pump = tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                notify_bridge.handle_notification(notification).await;
            }
        });

        let command_bridge = bridge.clone();
        let command_pump = tokio::spawn(async move {
            while let Some(message) = commands.recv().await {
                command_bridge.handle_command(message).await;
            }
        });

        let result = tokio::select! {
            result = serve(&registry, &device, &bindings, stagger, heartbeat) => result,
            _ = shutdown => {
                info!("shutdown signal received");
                Ok(())
            }
        };
        if let Err(e) = &result {
            error!(error = %e, "bridge failed, shutting down");
        }

        notify_pump.abort();
        command_pump.abort();

        registry.unregister_all().await;
        if let Err(e) = device.close().await {
            warn!(error = %e, "closing device connection failed");
        }
        if let Err(e) = broker.disconnect().await {
            warn!(error = %e, "broker disconnect failed");
        }

        result
    }
}

/// Register every subscription, then watch the device until something goes
/// wrong. Only returns on error.
async fn serve(
    registry: &SubscriptionRegistry,
    device: &Arc<dyn DeviceClient>,
    bindings: &[VariableBinding],
    stagger: Duration,
    heartbeat: Duration,
) -> Result<()> {
    for binding in bindings {
        match registry.register(binding).await {
            Ok(_) => info!(variable = %binding.name, type_ = binding.data_type.as_str(), "subscribed"),
            Err(e) => warn!(variable = %binding.name, error = %e, "subscription failed, skipping"),
        }
        // pacing between registrations keeps the device's ADS router responsive
        sleep(stagger).await;
    }
    let subscriptions = registry.len().await;
    info!(subscriptions, "startup complete, bridging");

    loop {
        sleep(heartbeat).await;
        check_health(device.as_ref()).await?;
    }
}

/// One heartbeat probe. The device must answer and report the running state.
async fn check_health(device: &dyn DeviceClient) -> Result<()> {
    if !device.is_open() {
        return Err(BridgeError::Heartbeat(
            "device connection closed".to_string(),
        ));
    }
    let state = device
        .read_state()
        .await
        .map_err(|e| BridgeError::Heartbeat(format!("state read failed: {e}")))?;
    if state != EXPECTED_RUN_STATE {
        return Err(BridgeError::Heartbeat(format!(
            "device reported {state}, expected {EXPECTED_RUN_STATE}"
        )));
    }
    Ok(())
}

/// Resolves when the process receives SIGINT or SIGTERM.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler, falling back to ctrl-c only");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            return;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "failed to listen for ctrl-c");
            }
        }
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
    }
}
