//! Relay wire protocol: JSON text frames of the form `{"type": ..., ...}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client → relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    CreateRoom,
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String },
    /// `data` is forwarded verbatim to the other occupant.
    #[serde(rename_all = "camelCase")]
    Signal { room_id: String, data: Value },
}

/// Relay → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    RoomCreated { room_id: String },
    #[serde(rename_all = "camelCase")]
    RoomJoined { room_id: String },
    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: String },
    Signal { data: Value },
    Error { message: String },
}
