//! Message pipe types.

use bytes::Bytes;

/// A message handed to the client end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeMessage {
    /// Raw message bytes, forwarded unchanged.
    pub bytes: Bytes,
    /// Whether this is a re-delivery (cached handshake or orphaned request).
    pub replayed: bool,
}

impl PipeMessage {
    pub(crate) const fn fresh(bytes: Bytes) -> Self {
        Self {
            bytes,
            replayed: false,
        }
    }

    pub(crate) const fn replay(bytes: Bytes) -> Self {
        Self {
            bytes,
            replayed: true,
        }
    }
}

/// Snapshot of the pipe's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PipeStats {
    /// Requests delivered to the current client and not yet answered.
    pub in_flight: usize,
    /// Orphaned requests waiting to be replayed to the next client.
    pub queued_replays: usize,
    /// Whether a handshake message has been cached.
    pub handshake_cached: bool,
    /// Whether a client end is currently connected.
    pub client_connected: bool,
}

/// Message pipe errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipeError {
    #[error("Pipe end already connected: {end}")]
    AlreadyConnected { end: &'static str },

    #[error("Pipe disconnected")]
    Disconnected,

    #[error("Receive cancelled")]
    Cancelled,

    #[error("Malformed message: {0}")]
    MalformedMessage(String),
}
