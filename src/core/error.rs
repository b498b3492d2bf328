//! Protocol-level error types.
//!
//! Application glue uses `anyhow`; these enums exist where callers need to
//! match on the failure (relay replies, per-file transfer outcomes).

use thiserror::Error;

/// Reasons a relay request is refused. The `Display` text is sent verbatim
/// to the requesting client in an `error` message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("Room not found")]
    NotFound,
    #[error("Room is full")]
    Full,
    /// The requester's connection went away before the reply could be sent.
    #[error("Participant disconnected")]
    Gone,
}

/// Why a single file transfer did not complete.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The session closed while the operation was suspended.
    #[error("session closed")]
    Cancelled,
    #[error("timed out waiting for acknowledgement")]
    Timeout,
    /// The peer reported `transfer-failed` for this file.
    #[error("rejected by peer: {0}")]
    Rejected(String),
    #[error("source read failed: {0}")]
    Source(#[source] std::io::Error),
    #[error("sink write failed: {0}")]
    Sink(#[source] std::io::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// An acknowledgement wait was armed while another was outstanding.
    #[error("an acknowledgement is already outstanding")]
    Busy,
}

impl TransferError {
    /// Whether the failure originated locally and the peer should be told.
    pub fn should_notify_peer(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Source(_) | Self::Sink(_) | Self::Protocol(_)
        )
    }
}
