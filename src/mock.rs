//! In-memory test doubles for the device and broker seams.
//!
//! Shipped as a normal module so integration tests can drive the full
//! controller without a PLC or a broker.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::VariableBinding;
use crate::device::{
    DeviceClient, DeviceError, DeviceState, EXPECTED_RUN_STATE, NotificationHandle,
};
use crate::error::BridgeError;
use crate::mqtt::BrokerClient;

/// Scripted [`DeviceClient`] that records every call.
///
/// Notification handles are allocated sequentially starting at 1.
pub struct MockDeviceClient {
    state: Mutex<DeviceState>,
    open: AtomicBool,
    closed: AtomicBool,
    fail_registration: Mutex<Vec<String>>,
    fail_releases: AtomicBool,
    fail_writes: AtomicBool,
    fail_state_reads: AtomicBool,
    next_handle: AtomicU32,
    registered: Mutex<Vec<String>>,
    released: Mutex<Vec<NotificationHandle>>,
    writes: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MockDeviceClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EXPECTED_RUN_STATE),
            open: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            fail_registration: Mutex::new(Vec::new()),
            fail_releases: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_state_reads: AtomicBool::new(false),
            next_handle: AtomicU32::new(1),
            registered: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// The state subsequent [`read_state`](DeviceClient::read_state) calls
    /// report.
    pub fn set_state(&self, state: DeviceState) {
        *self.state.lock() = state;
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Make registration fail for the named variable.
    pub fn fail_registration(&self, name: &str) {
        self.fail_registration.lock().push(name.to_string());
    }

    pub fn fail_releases(&self, fail: bool) {
        self.fail_releases.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_state_reads(&self, fail: bool) {
        self.fail_state_reads.store(fail, Ordering::SeqCst);
    }

    /// Variable names registered so far, in call order.
    pub fn registered_names(&self) -> Vec<String> {
        self.registered.lock().clone()
    }

    /// Handles released so far, in call order.
    pub fn released(&self) -> Vec<NotificationHandle> {
        self.released.lock().clone()
    }

    /// Writes performed so far, in call order.
    pub fn writes(&self) -> Vec<(String, Vec<u8>)> {
        self.writes.lock().clone()
    }

    /// Whether [`close`](DeviceClient::close) has been called.
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for MockDeviceClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceClient for MockDeviceClient {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn read_state(&self) -> Result<DeviceState, DeviceError> {
        if self.fail_state_reads.load(Ordering::SeqCst) {
            return Err(DeviceError::Timeout);
        }
        Ok(*self.state.lock())
    }

    async fn add_notification(
        &self,
        binding: &VariableBinding,
    ) -> Result<NotificationHandle, DeviceError> {
        if self.fail_registration.lock().contains(&binding.name) {
            // symbol not found
            return Err(DeviceError::Ads { code: 0x710 });
        }
        let notification = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.registered.lock().push(binding.name.clone());
        Ok(NotificationHandle {
            notification,
            symbol: notification + 0x1000,
        })
    }

    async fn del_notification(&self, handle: NotificationHandle) -> Result<(), DeviceError> {
        if self.fail_releases.load(Ordering::SeqCst) {
            return Err(DeviceError::Timeout);
        }
        self.released.lock().push(handle);
        Ok(())
    }

    async fn write_by_name(&self, name: &str, payload: &[u8]) -> Result<(), DeviceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DeviceError::Timeout);
        }
        self.writes.lock().push((name.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn close(&self) -> Result<(), DeviceError> {
        self.open.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Recording [`BrokerClient`].
pub struct MockBroker {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    fail_publishes: AtomicBool,
    disconnected: AtomicBool,
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            fail_publishes: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Messages published so far, in call order.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().clone()
    }

    pub fn disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(BridgeError::Publish("mock publish failure".to_string()));
        }
        self.published.lock().push((topic.to_string(), payload));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BridgeError> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}
