//! AMS/ADS wire framing.
//!
//! The subset of the ADS protocol the bridge speaks: the AMS/TCP envelope,
//! the 32-byte AMS header, the request payloads for state reads, symbol
//! writes and device notifications, and the stamped notification stream the
//! device pushes back. Everything here is pure byte shuffling; the socket
//! handling lives in [`crate::device`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// TCP port of the AMS router on the target.
pub const ADS_TCP_PORT: u16 = 48898;

/// Length of the AMS/TCP envelope (2 reserved bytes + u32 frame length).
pub const AMS_TCP_HEADER_LEN: usize = 6;

/// Length of the AMS header that follows the envelope.
pub const AMS_HEADER_LEN: usize = 32;

/// State flags of a request frame.
pub const STATE_FLAGS_REQUEST: u16 = 0x0004;

/// State flags of a response frame.
pub const STATE_FLAGS_RESPONSE: u16 = 0x0005;

/// ADS command ids.
pub mod command {
    pub const READ: u16 = 2;
    pub const WRITE: u16 = 3;
    pub const READ_STATE: u16 = 4;
    pub const ADD_DEVICE_NOTIFICATION: u16 = 6;
    pub const DELETE_DEVICE_NOTIFICATION: u16 = 7;
    pub const DEVICE_NOTIFICATION: u16 = 8;
    pub const READ_WRITE: u16 = 9;
}

/// Index groups for runtime symbol access.
pub mod index_group {
    /// Resolve a symbol name to a runtime handle (via ReadWrite).
    pub const SYM_HANDLE_BY_NAME: u32 = 0xF003;
    /// Read or write a symbol value through its handle.
    pub const SYM_VALUE_BY_HANDLE: u32 = 0xF005;
    /// Release a previously acquired symbol handle.
    pub const SYM_RELEASE_HANDLE: u32 = 0xF006;
}

/// Errors raised while encoding or decoding AMS frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated: expected at least {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("invalid AMS net id '{0}'")]
    InvalidNetId(String),
}

/// Human-readable text for the ADS return codes the bridge runs into.
pub fn error_string(code: u32) -> &'static str {
    match code {
        0x1 => "internal error",
        0x6 => "target port not found",
        0x7 => "target machine not found",
        0x701 => "service is not supported by server",
        0x702 => "invalid index group",
        0x703 => "invalid index offset",
        0x705 => "invalid parameter value(s)",
        0x706 => "device is not in a ready state",
        0x70A => "object does not exist",
        0x710 => "symbol not found",
        0x712 => "invalid symbol version",
        0x714 => "notification handle is invalid",
        0x745 => "timeout elapsed",
        _ => "unknown ADS error",
    }
}

/// A six-octet AMS net id, conventionally the device IPv4 address plus ".1.1".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmsNetId(pub [u8; 6]);

impl AmsNetId {
    /// Net id derived from an IPv4 address, as TwinCAT assigns them.
    pub fn from_ipv4(ip: std::net::Ipv4Addr) -> Self {
        let [a, b, c, d] = ip.octets();
        AmsNetId([a, b, c, d, 1, 1])
    }
}

impl FromStr for AmsNetId {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split('.');
        for octet in &mut octets {
            *octet = parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| FrameError::InvalidNetId(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(FrameError::InvalidNetId(s.to_string()));
        }
        Ok(AmsNetId(octets))
    }
}

impl fmt::Display for AmsNetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a}.{b}.{c}.{d}.{e}.{g}")
    }
}

/// An AMS endpoint: net id plus AMS port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmsAddr {
    pub net_id: AmsNetId,
    pub port: u16,
}

/// A decoded AMS frame (header fields plus command payload).
#[derive(Debug, Clone)]
pub struct AmsFrame {
    pub command: u16,
    pub state_flags: u16,
    pub error_code: u32,
    pub invoke_id: u32,
    pub payload: Vec<u8>,
}

/// Encode a complete frame including the AMS/TCP envelope.
pub fn encode_frame(
    target: AmsAddr,
    source: AmsAddr,
    cmd: u16,
    state_flags: u16,
    error_code: u32,
    invoke_id: u32,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(AMS_TCP_HEADER_LEN + AMS_HEADER_LEN + payload.len());
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(&((AMS_HEADER_LEN + payload.len()) as u32).to_le_bytes());
    buf.extend_from_slice(&target.net_id.0);
    buf.extend_from_slice(&target.port.to_le_bytes());
    buf.extend_from_slice(&source.net_id.0);
    buf.extend_from_slice(&source.port.to_le_bytes());
    buf.extend_from_slice(&cmd.to_le_bytes());
    buf.extend_from_slice(&state_flags.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&error_code.to_le_bytes());
    buf.extend_from_slice(&invoke_id.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Encode a request frame.
pub fn encode_request(
    target: AmsAddr,
    source: AmsAddr,
    cmd: u16,
    invoke_id: u32,
    payload: &[u8],
) -> Vec<u8> {
    encode_frame(target, source, cmd, STATE_FLAGS_REQUEST, 0, invoke_id, payload)
}

/// Parse an AMS frame body (everything after the TCP envelope).
pub fn parse_frame(body: &[u8]) -> Result<AmsFrame, FrameError> {
    need(body, AMS_HEADER_LEN)?;
    let command = read_u16(body, 16);
    let state_flags = read_u16(body, 18);
    let data_len = read_u32(body, 20) as usize;
    let error_code = read_u32(body, 24);
    let invoke_id = read_u32(body, 28);
    need(body, AMS_HEADER_LEN + data_len)?;
    Ok(AmsFrame {
        command,
        state_flags,
        error_code,
        invoke_id,
        payload: body[AMS_HEADER_LEN..AMS_HEADER_LEN + data_len].to_vec(),
    })
}

/// Payload of a Write request.
pub fn write_request(group: u32, offset: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + data.len());
    buf.extend_from_slice(&group.to_le_bytes());
    buf.extend_from_slice(&offset.to_le_bytes());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Payload of a ReadWrite request.
pub fn read_write_request(group: u32, offset: u32, read_len: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + data.len());
    buf.extend_from_slice(&group.to_le_bytes());
    buf.extend_from_slice(&offset.to_le_bytes());
    buf.extend_from_slice(&read_len.to_le_bytes());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Payload of an AddDeviceNotification request.
///
/// Delay and cycle time are carried in 100 ns units on the wire.
pub fn add_notification_request(
    group: u32,
    offset: u32,
    length: u32,
    mode: u32,
    max_delay: std::time::Duration,
    cycle_time: std::time::Duration,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(40);
    buf.extend_from_slice(&group.to_le_bytes());
    buf.extend_from_slice(&offset.to_le_bytes());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&mode.to_le_bytes());
    buf.extend_from_slice(&duration_ticks(max_delay).to_le_bytes());
    buf.extend_from_slice(&duration_ticks(cycle_time).to_le_bytes());
    buf.extend_from_slice(&[0u8; 16]);
    buf
}

/// A duration in the wire's 100 ns ticks, saturating at the u32 field limit
/// (about 7 minutes) instead of wrapping.
fn duration_ticks(duration: std::time::Duration) -> u32 {
    (duration.as_nanos() / 100).min(u32::MAX as u128) as u32
}

/// Payload of a DeleteDeviceNotification request.
pub fn delete_notification_request(handle: u32) -> Vec<u8> {
    handle.to_le_bytes().to_vec()
}

/// First u32 of a response payload: the ADS result code.
pub fn parse_result(payload: &[u8]) -> Result<u32, FrameError> {
    need(payload, 4)?;
    Ok(read_u32(payload, 0))
}

/// ReadState response: result code, ADS state, device state.
pub fn parse_state_response(payload: &[u8]) -> Result<(u32, u16, u16), FrameError> {
    need(payload, 8)?;
    Ok((read_u32(payload, 0), read_u16(payload, 4), read_u16(payload, 6)))
}

/// ReadWrite response: result code plus the returned data.
pub fn parse_read_write_response(payload: &[u8]) -> Result<(u32, Vec<u8>), FrameError> {
    need(payload, 8)?;
    let result = read_u32(payload, 0);
    let len = read_u32(payload, 4) as usize;
    need(payload, 8 + len)?;
    Ok((result, payload[8..8 + len].to_vec()))
}

/// AddDeviceNotification response: result code plus the notification handle.
pub fn parse_add_notification_response(payload: &[u8]) -> Result<(u32, u32), FrameError> {
    need(payload, 8)?;
    Ok((read_u32(payload, 0), read_u32(payload, 4)))
}

/// One sample from a device-notification stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationSample {
    pub handle: u32,
    /// Windows FILETIME of the sample.
    pub timestamp: u64,
    pub data: Vec<u8>,
}

/// Parse a DeviceNotification payload into its flattened samples.
///
/// Layout: u32 stream length, u32 stamp count, then per stamp a u64
/// timestamp, u32 sample count and per sample a u32 handle, u32 size and the
/// raw data.
pub fn parse_notification_stream(payload: &[u8]) -> Result<Vec<NotificationSample>, FrameError> {
    need(payload, 8)?;
    let stamps = read_u32(payload, 4);
    let mut at = 8;
    let mut samples = Vec::new();
    for _ in 0..stamps {
        need(payload, at + 12)?;
        let timestamp = read_u64(payload, at);
        let count = read_u32(payload, at + 8);
        at += 12;
        for _ in 0..count {
            need(payload, at + 8)?;
            let handle = read_u32(payload, at);
            let size = read_u32(payload, at + 4) as usize;
            at += 8;
            need(payload, at + size)?;
            samples.push(NotificationSample {
                handle,
                timestamp,
                data: payload[at..at + size].to_vec(),
            });
            at += size;
        }
    }
    Ok(samples)
}

/// Offset between the Windows FILETIME epoch (1601) and the Unix epoch, in
/// 100 ns ticks.
const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

/// Convert a FILETIME to Unix milliseconds, saturating at the epoch.
pub fn filetime_to_unix_millis(filetime: u64) -> i64 {
    (filetime.saturating_sub(FILETIME_UNIX_EPOCH) / 10_000) as i64
}

/// Convert a FILETIME to a UTC timestamp.
pub fn filetime_to_datetime(filetime: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(filetime_to_unix_millis(filetime))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn need(buf: &[u8], len: usize) -> Result<(), FrameError> {
    if buf.len() < len {
        return Err(FrameError::Truncated {
            expected: len,
            got: buf.len(),
        });
    }
    Ok(())
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}
