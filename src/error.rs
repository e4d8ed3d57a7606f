//! Error types for the bridge.
//!
//! Two variants are fatal and terminate the process: [`BridgeError::Config`]
//! before any subscription exists, and [`BridgeError::Heartbeat`] during
//! operation. Everything else is contained where it occurs — logged, the
//! operation dropped, the bridge keeps running.

use thiserror::Error;

use crate::config::ConfigError;
use crate::device::DeviceError;

/// Result type alias using [`BridgeError`].
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur in the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Malformed or missing configuration; aborts startup.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A device operation failed.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// A subscription already exists for this variable name.
    #[error("subscription already registered for variable '{0}'")]
    DuplicateSubscription(String),

    /// Publishing a message to the broker failed.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Connecting to or disconnecting from the broker failed.
    #[error("broker error: {0}")]
    Broker(String),

    /// The device stopped answering or left the expected run state.
    #[error("heartbeat failed: {0}")]
    Heartbeat(String),
}
