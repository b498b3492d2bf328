//! Centralized configuration constants for roomdrop.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (frame tag bytes) stay in
//! `core::protocol::router`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Default chunk size in bytes (16 KB).
///
/// Every chunk is a single data-channel message, so this stays well below
/// the 64 KB SCTP receive limit of webrtc-rs even with the 5 byte tag and
/// sequence header.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Largest single data-channel message the receiving webrtc-rs SCTP stack
/// accepts.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Upper bound for `--chunk-size`, leaving room for the frame header.
pub const MAX_CHUNK_SIZE: usize = MAX_MESSAGE_SIZE - 1024;

/// Upper bound for one encoded control frame. A catalog that does not fit
/// is refused before a room is opened.
pub const MAX_CONTROL_FRAME: usize = MAX_MESSAGE_SIZE;

/// How long the sender waits for a single acknowledgement (start or chunk)
/// before failing the file.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(60);

/// Untagged binary frames at or above this size are never sniffed as
/// control messages in legacy framing. Text frames are always control.
pub const LEGACY_CONTROL_THRESHOLD: usize = 5000;

// ── Relay ────────────────────────────────────────────────────────────────────

/// Default listen address for `roomdrop relay`.
pub const RELAY_LISTEN_ADDR: &str = "0.0.0.0:3000";

/// Default relay URL used by `send` / `receive`.
pub const RELAY_DEFAULT_URL: &str = "ws://127.0.0.1:3000";

/// Rooms older than this are reclaimed by the relay sweep, dead or not.
pub const ROOM_TTL: Duration = Duration::from_secs(3600);

/// Interval between relay garbage-collection sweeps.
pub const ROOM_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// ── Connection / Network ─────────────────────────────────────────────────────

/// Label of the single multiplexed data channel.
pub const DATA_CHANNEL_LABEL: &str = "roomdrop";

/// Whether to allow loopback candidates (same-machine testing).
pub const SCTP_USE_LOOPBACK: bool = false;

/// WebRTC peer connection timeout.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for ICE candidate gathering.
pub const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(15);

// ── Runtime configuration ────────────────────────────────────────────────────

/// How frames are tagged on the data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// One tag byte per frame; classification is exact.
    #[default]
    Tagged,
    /// Bare JSON / bare bytes, classified by sniffing the first byte.
    Legacy,
}

/// Per-session transfer tunables, built from CLI / config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub ack_timeout: Duration,
    pub framing: Framing,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            ack_timeout: ACK_TIMEOUT,
            framing: Framing::Tagged,
        }
    }
}
