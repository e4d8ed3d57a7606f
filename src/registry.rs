//! Tracking of active device-notification subscriptions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::VariableBinding;
use crate::device::{DeviceClient, NotificationHandle};
use crate::error::BridgeError;

#[derive(Default)]
struct RegistryInner {
    /// Handles in registration order.
    handles: Vec<(String, NotificationHandle)>,
    /// Notification-handle → binding lookup for the decode path.
    bindings: HashMap<u32, VariableBinding>,
}

/// Owns every active subscription handle and guarantees each is released
/// exactly once.
///
/// Registration happens from the controller's startup sequence; the drain in
/// [`unregister_all`](Self::unregister_all) can race with it when shutdown is
/// triggered mid-startup, so all access goes through one async mutex.
pub struct SubscriptionRegistry {
    device: Arc<dyn DeviceClient>,
    inner: Mutex<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new(device: Arc<dyn DeviceClient>) -> Self {
        Self {
            device,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Create a device subscription for `binding` and track its handle.
    ///
    /// At most one subscription may exist per variable name. A failure
    /// leaves previously registered handles untouched.
    pub async fn register(
        &self,
        binding: &VariableBinding,
    ) -> Result<NotificationHandle, BridgeError> {
        let mut inner = self.inner.lock().await;

        if inner.handles.iter().any(|(name, _)| name == &binding.name) {
            return Err(BridgeError::DuplicateSubscription(binding.name.clone()));
        }

        let handle = self.device.add_notification(binding).await?;
        inner.handles.push((binding.name.clone(), handle));
        inner.bindings.insert(handle.notification, binding.clone());
        debug!(variable = %binding.name, "subscription registered");
        Ok(handle)
    }

    /// Look up the binding served by a notification handle.
    pub async fn lookup(&self, notification_handle: u32) -> Option<VariableBinding> {
        self.inner
            .lock()
            .await
            .bindings
            .get(&notification_handle)
            .cloned()
    }

    /// Number of active subscriptions.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.handles.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Release every tracked handle and empty the registry.
    ///
    /// Idempotent: a second call finds nothing to release and is a no-op.
    /// Individual release failures are logged and do not stop the drain.
    pub async fn unregister_all(&self) {
        let mut inner = self.inner.lock().await;
        if inner.handles.is_empty() {
            return;
        }

        let handles = std::mem::take(&mut inner.handles);
        inner.bindings.clear();

        for (name, handle) in handles {
            match self.device.del_notification(handle).await {
                Ok(()) => debug!(variable = %name, "subscription released"),
                Err(e) => warn!(variable = %name, error = %e, "failed to release subscription"),
            }
        }
    }
}
