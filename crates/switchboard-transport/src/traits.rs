//! Transport abstraction for Switchboard.
//!
//! The routing core never touches a socket directly. It addresses a
//! physical connection through a [`FrameSink`], which only has to accept
//! encoded frames and close requests without blocking.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use switchboard_protocol::{codec, Frame, ProtocolError};
use thiserror::Error;

/// Disambiguates IDs generated within the same clock tick.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a physical connection.
///
/// Every namespace socket opened over the same connection shares this ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// The outbound half of a physical connection.
///
/// Implementations must not block: delivery is fire-and-forget from the
/// caller's point of view and the transport owns buffering and backpressure.
pub trait FrameSink: Send + Sync {
    /// Queue pre-encoded frame bytes for delivery.
    ///
    /// Broadcasts encode once and hand the same buffer to every recipient.
    fn send_raw(&self, data: Bytes) -> Result<(), TransportError>;

    /// Ask the transport to tear down the connection.
    ///
    /// Unless `silent` is set, a `disconnect` frame for `namespace` is
    /// delivered before the connection closes.
    fn close(&self, namespace: &str, silent: bool) -> Result<(), TransportError>;

    /// Check if the connection still accepts frames.
    fn is_open(&self) -> bool;

    /// Encode and queue a frame.
    fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let data = codec::encode(frame)?;
        self.send_raw(data)
    }
}
