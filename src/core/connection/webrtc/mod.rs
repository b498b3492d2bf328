//! WebRTC transport for a [`SessionChannel`].
//!
//! One ordered, reliable data channel labelled
//! [`DATA_CHANNEL_LABEL`](crate::core::config::DATA_CHANNEL_LABEL) carries
//! the whole session. Negotiation is non-trickle: offers and answers are
//! sent only after ICE gathering completes, so a single relay `signal`
//! message per direction is enough.

mod bridge;
mod initializer;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use webrtc::peer_connection::RTCPeerConnection;

use super::channel::SessionChannel;

/// Opaque negotiation payload carried in relay `signal` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalingMessage {
    /// SDP offer with gathered candidates, JSON-encoded.
    Offer(String),
    /// SDP answer with gathered candidates, JSON-encoded.
    Answer(String),
}

pub struct WebRTCConnection {
    peer_connection: Arc<RTCPeerConnection>,
    channel: SessionChannel,
}

impl WebRTCConnection {
    pub fn channel(&self) -> &SessionChannel {
        &self.channel
    }

    /// Close the session channel and tear down the peer connection.
    pub async fn close(&self) {
        self.channel.close();
        if let Err(e) = self.peer_connection.close().await {
            warn!(event = "webrtc_close_failed", %e, "Error closing peer connection");
        } else {
            debug!(event = "webrtc_closed", "Peer connection closed");
        }
    }
}
