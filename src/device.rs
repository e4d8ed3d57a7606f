//! ADS device client.
//!
//! [`DeviceClient`] is the seam the rest of the bridge is written against;
//! [`AdsClient`] is the production implementation over AMS/TCP. It covers
//! exactly what the bridge needs: run-state reads, named writes, and device
//! notifications. Requests are correlated by invoke id; a background reader
//! task routes responses to their waiters and notification frames to an
//! `mpsc` channel.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::ams::{self, AmsAddr, AmsFrame, AmsNetId, command, index_group};
use crate::config::{AdsConfig, VariableBinding};

/// AMS port this client identifies itself with.
const SOURCE_AMS_PORT: u16 = 32905;

/// Upper bound on a single AMS frame; anything larger is a protocol error.
const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Capacity of the notification channel between the reader task and the
/// translation path.
const NOTIFICATION_QUEUE: usize = 256;

/// ADS run states as reported by ReadState.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdsState {
    Invalid,
    Idle,
    Reset,
    Init,
    Start,
    Run,
    Stop,
    SaveConfig,
    LoadConfig,
    PowerFailure,
    PowerGood,
    Error,
    Shutdown,
    Suspend,
    Resume,
    Config,
    Reconfig,
    Other(u16),
}

impl AdsState {
    pub fn from_wire(raw: u16) -> Self {
        match raw {
            0 => AdsState::Invalid,
            1 => AdsState::Idle,
            2 => AdsState::Reset,
            3 => AdsState::Init,
            4 => AdsState::Start,
            5 => AdsState::Run,
            6 => AdsState::Stop,
            7 => AdsState::SaveConfig,
            8 => AdsState::LoadConfig,
            9 => AdsState::PowerFailure,
            10 => AdsState::PowerGood,
            11 => AdsState::Error,
            12 => AdsState::Shutdown,
            13 => AdsState::Suspend,
            14 => AdsState::Resume,
            15 => AdsState::Config,
            16 => AdsState::Reconfig,
            other => AdsState::Other(other),
        }
    }
}

impl fmt::Display for AdsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdsState::Other(raw) => write!(f, "state {raw}"),
            other => write!(f, "{}", format!("{other:?}").to_lowercase()),
        }
    }
}

/// The device status pair reported by ReadState.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceState {
    pub ads_state: AdsState,
    pub device_state: u16,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (device state {})", self.ads_state, self.device_state)
    }
}

/// The state a healthy device must report: running, no error.
pub const EXPECTED_RUN_STATE: DeviceState = DeviceState {
    ads_state: AdsState::Run,
    device_state: 0,
};

/// Opaque pair identifying one active device notification.
///
/// Released exactly once via [`DeviceClient::del_notification`]; never
/// reused afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationHandle {
    pub notification: u32,
    pub symbol: u32,
}

/// A value-change event pushed by the device.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Notification handle the sample belongs to.
    pub handle: u32,
    /// Windows FILETIME as carried on the wire.
    pub timestamp: u64,
    /// Raw sample bytes, decoded later per the variable's data type.
    pub data: Vec<u8>,
}

/// Errors from device operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("ADS error {code:#06x}: {}", ams::error_string(*code))]
    Ads { code: u32 },

    #[error("malformed frame: {0}")]
    Frame(#[from] ams::FrameError),

    #[error("invalid device configuration: {0}")]
    Config(String),
}

/// Operations the bridge needs from a device connection.
///
/// [`AdsClient`] is the production implementation; tests use
/// [`crate::mock::MockDeviceClient`].
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Whether the underlying connection is still open.
    fn is_open(&self) -> bool;

    /// Read the device run state.
    async fn read_state(&self) -> Result<DeviceState, DeviceError>;

    /// Create a device notification for the bound variable.
    async fn add_notification(
        &self,
        binding: &VariableBinding,
    ) -> Result<NotificationHandle, DeviceError>;

    /// Release a notification created by [`Self::add_notification`].
    async fn del_notification(&self, handle: NotificationHandle) -> Result<(), DeviceError>;

    /// Write `payload` verbatim to the named variable.
    async fn write_by_name(&self, name: &str, payload: &[u8]) -> Result<(), DeviceError>;

    /// Close the connection.
    async fn close(&self) -> Result<(), DeviceError>;
}

type PendingMap = Arc<SyncMutex<HashMap<u32, oneshot::Sender<AmsFrame>>>>;

/// ADS client over AMS/TCP.
pub struct AdsClient {
    target: AmsAddr,
    source: AmsAddr,
    writer: Mutex<OwnedWriteHalf>,
    pending: PendingMap,
    invoke_id: AtomicU32,
    open: Arc<AtomicBool>,
    timeout: Duration,
    reader: JoinHandle<()>,
}

impl AdsClient {
    /// Open the AMS/TCP connection and start the frame reader.
    ///
    /// Returns the client and the stream of device notifications.
    pub async fn connect(
        config: &AdsConfig,
    ) -> Result<(Self, mpsc::Receiver<Notification>), DeviceError> {
        let net_id = config
            .net_id()
            .map_err(|e| DeviceError::Config(e.to_string()))?;
        let timeout = config.timeout();

        let stream = tokio::time::timeout(
            timeout,
            TcpStream::connect((config.plc_host.as_str(), config.tcp_port)),
        )
        .await
        .map_err(|_| DeviceError::Timeout)??;
        stream.set_nodelay(true)?;

        let source_net_id = match stream.local_addr()?.ip() {
            IpAddr::V4(ip) => AmsNetId::from_ipv4(ip),
            IpAddr::V6(_) => AmsNetId::from_ipv4(std::net::Ipv4Addr::LOCALHOST),
        };

        let target = AmsAddr {
            net_id,
            port: config.port,
        };
        let source = AmsAddr {
            net_id: source_net_id,
            port: SOURCE_AMS_PORT,
        };

        debug!(target = %target.net_id, port = target.port, "ADS connection open");

        let (read_half, write_half) = stream.into_split();
        let pending: PendingMap = Arc::new(SyncMutex::new(HashMap::new()));
        let open = Arc::new(AtomicBool::new(true));
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFICATION_QUEUE);
        let reader = tokio::spawn(read_loop(
            read_half,
            pending.clone(),
            notify_tx,
            open.clone(),
        ));

        Ok((
            Self {
                target,
                source,
                writer: Mutex::new(write_half),
                pending,
                invoke_id: AtomicU32::new(1),
                open,
                timeout,
                reader,
            },
            notify_rx,
        ))
    }

    /// Send one request and wait for the matching response.
    async fn request(&self, cmd: u16, payload: Vec<u8>) -> Result<AmsFrame, DeviceError> {
        if !self.is_open() {
            return Err(DeviceError::Closed);
        }

        let invoke_id = self.invoke_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(invoke_id, tx);

        let frame = ams::encode_request(self.target, self.source, cmd, invoke_id, &payload);
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(&frame).await {
                self.pending.lock().remove(&invoke_id);
                return Err(e.into());
            }
        }

        let reply = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(frame)) => frame,
            // reader task dropped the sender: connection is gone
            Ok(Err(_)) => return Err(DeviceError::Closed),
            Err(_) => {
                self.pending.lock().remove(&invoke_id);
                return Err(DeviceError::Timeout);
            }
        };

        if reply.error_code != 0 {
            return Err(DeviceError::Ads {
                code: reply.error_code,
            });
        }
        Ok(reply)
    }

    fn check(code: u32) -> Result<(), DeviceError> {
        if code != 0 {
            return Err(DeviceError::Ads { code });
        }
        Ok(())
    }

    /// Resolve a symbol name to its runtime handle.
    async fn symbol_handle(&self, name: &str) -> Result<u32, DeviceError> {
        let payload =
            ams::read_write_request(index_group::SYM_HANDLE_BY_NAME, 0, 4, name.as_bytes());
        let reply = self.request(command::READ_WRITE, payload).await?;
        let (code, data) = ams::parse_read_write_response(&reply.payload)?;
        Self::check(code)?;
        if data.len() < 4 {
            return Err(ams::FrameError::Truncated {
                expected: 4,
                got: data.len(),
            }
            .into());
        }
        Ok(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
    }

    async fn release_symbol_handle(&self, handle: u32) -> Result<(), DeviceError> {
        let payload = ams::write_request(index_group::SYM_RELEASE_HANDLE, 0, &handle.to_le_bytes());
        let reply = self.request(command::WRITE, payload).await?;
        Self::check(ams::parse_result(&reply.payload)?)
    }
}

#[async_trait]
impl DeviceClient for AdsClient {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn read_state(&self) -> Result<DeviceState, DeviceError> {
        let reply = self.request(command::READ_STATE, Vec::new()).await?;
        let (code, ads_state, device_state) = ams::parse_state_response(&reply.payload)?;
        Self::check(code)?;
        Ok(DeviceState {
            ads_state: AdsState::from_wire(ads_state),
            device_state,
        })
    }

    async fn add_notification(
        &self,
        binding: &VariableBinding,
    ) -> Result<NotificationHandle, DeviceError> {
        let symbol = self.symbol_handle(&binding.name).await?;
        let payload = ams::add_notification_request(
            index_group::SYM_VALUE_BY_HANDLE,
            symbol,
            binding.data_type.size() as u32,
            binding.mode.wire_value(),
            binding.max_delay,
            binding.cycle_time,
        );
        let reply = match self.request(command::ADD_DEVICE_NOTIFICATION, payload).await {
            Ok(reply) => reply,
            Err(e) => {
                let _ = self.release_symbol_handle(symbol).await;
                return Err(e);
            }
        };
        let (code, notification) = ams::parse_add_notification_response(&reply.payload)?;
        if code != 0 {
            let _ = self.release_symbol_handle(symbol).await;
            return Err(DeviceError::Ads { code });
        }
        debug!(variable = %binding.name, notification, symbol, "notification registered");
        Ok(NotificationHandle {
            notification,
            symbol,
        })
    }

    async fn del_notification(&self, handle: NotificationHandle) -> Result<(), DeviceError> {
        let reply = self
            .request(
                command::DELETE_DEVICE_NOTIFICATION,
                ams::delete_notification_request(handle.notification),
            )
            .await?;
        let deleted = Self::check(ams::parse_result(&reply.payload)?);
        // the symbol handle is released even when the delete itself failed
        let released = self.release_symbol_handle(handle.symbol).await;
        deleted.and(released)
    }

    async fn write_by_name(&self, name: &str, payload: &[u8]) -> Result<(), DeviceError> {
        let symbol = self.symbol_handle(name).await?;
        let request = ams::write_request(index_group::SYM_VALUE_BY_HANDLE, symbol, payload);
        let written = async {
            let reply = self.request(command::WRITE, request).await?;
            Self::check(ams::parse_result(&reply.payload)?)
        }
        .await;
        let released = self.release_symbol_handle(symbol).await;
        written.and(released)
    }

    async fn close(&self) -> Result<(), DeviceError> {
        self.open.store(false, Ordering::SeqCst);
        self.reader.abort();
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

/// Read frames until the connection drops, routing responses to their
/// waiters and notification samples to the bridge.
async fn read_loop(
    mut reader: OwnedReadHalf,
    pending: PendingMap,
    notify_tx: mpsc::Sender<Notification>,
    open: Arc<AtomicBool>,
) {
    loop {
        let mut head = [0u8; ams::AMS_TCP_HEADER_LEN];
        if let Err(e) = reader.read_exact(&mut head).await {
            debug!(error = %e, "ADS connection closed");
            break;
        }
        let len = u32::from_le_bytes([head[2], head[3], head[4], head[5]]) as usize;
        if len > MAX_FRAME_LEN {
            warn!(len, "oversized AMS frame, closing connection");
            break;
        }
        let mut body = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut body).await {
            debug!(error = %e, "ADS connection closed");
            break;
        }

        let frame = match ams::parse_frame(&body) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping malformed AMS frame");
                continue;
            }
        };

        if frame.command == command::DEVICE_NOTIFICATION {
            match ams::parse_notification_stream(&frame.payload) {
                Ok(samples) => {
                    for sample in samples {
                        let notification = Notification {
                            handle: sample.handle,
                            timestamp: sample.timestamp,
                            data: sample.data,
                        };
                        if notify_tx.send(notification).await.is_err() {
                            // receiver gone, the bridge is shutting down
                            open.store(false, Ordering::SeqCst);
                            return;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "dropping malformed notification stream"),
            }
        } else if let Some(tx) = pending.lock().remove(&frame.invoke_id) {
            let _ = tx.send(frame);
        } else {
            debug!(invoke_id = frame.invoke_id, "unmatched AMS response");
        }
    }

    open.store(false, Ordering::SeqCst);
    // wake every pending waiter with a closed-connection error
    pending.lock().clear();
}
