//! WebRTC connection initialization: offer/answer and ICE gathering.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{error, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::bridge::attach;
use super::{SignalingMessage, WebRTCConnection};
use crate::core::config::{DATA_CHANNEL_LABEL, ICE_GATHER_TIMEOUT, SCTP_USE_LOOPBACK};
use crate::core::connection::channel::{ChannelEvent, SessionChannel, TransportHandle};

impl WebRTCConnection {
    pub(crate) fn default_ice_servers() -> Vec<RTCIceServer> {
        vec![RTCIceServer {
            urls: vec!["stun:stun.l.google.com:19302".into()],
            username: String::new(),
            credential: String::new(),
        }]
    }

    async fn new_peer_connection() -> Result<Arc<RTCPeerConnection>> {
        let mut me = MediaEngine::default();
        let reg = register_default_interceptors(Registry::new(), &mut me)?;

        let mut se = SettingEngine::default();
        se.set_include_loopback_candidate(SCTP_USE_LOOPBACK);

        let api = APIBuilder::new()
            .with_setting_engine(se)
            .with_media_engine(me)
            .with_interceptor_registry(reg)
            .build();

        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers: Self::default_ice_servers(),
                ..Default::default()
            })
            .await?;
        Ok(Arc::new(pc))
    }

    /// Log connection state and turn a failed ICE connection into a
    /// terminal channel error.
    fn monitor_state(pc: &Arc<RTCPeerConnection>, handle: TransportHandle, role: &'static str) {
        pc.on_peer_connection_state_change(Box::new(move |s| {
            let handle = handle.clone();
            Box::pin(async move {
                match s {
                    RTCPeerConnectionState::Connected => {
                        info!(event = "webrtc_connected", role, "WebRTC connection established");
                    }
                    RTCPeerConnectionState::Failed => {
                        error!(event = "webrtc_failed", role, "WebRTC connection failed");
                        handle.mark_error("peer connection failed");
                    }
                    RTCPeerConnectionState::Disconnected => {
                        warn!(
                            event = "webrtc_disconnected",
                            role,
                            "WebRTC transient disconnect (ICE may recover)"
                        );
                    }
                    RTCPeerConnectionState::Closed => {
                        info!(event = "webrtc_closed", role, "WebRTC connection closed");
                        handle.mark_closed();
                    }
                    _ => {}
                }
            })
        }));
    }

    async fn local_description_json(pc: &Arc<RTCPeerConnection>) -> Result<String> {
        let desc = pc
            .local_description()
            .await
            .ok_or_else(|| anyhow!("No local description after ICE gathering"))?;
        Ok(serde_json::to_string(&desc)?)
    }

    /// Wait for ICE gathering to finish and return the complete local SDP.
    pub(crate) async fn gather_local_description(pc: &Arc<RTCPeerConnection>) -> Result<String> {
        if pc.ice_gathering_state() == RTCIceGatheringState::Complete {
            return Self::local_description_json(pc).await;
        }

        let (tx, rx) = oneshot::channel::<()>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        pc.on_ice_gathering_state_change(Box::new(move |state| {
            let tx = tx.clone();
            Box::pin(async move {
                if state == RTCIceGathererState::Complete
                    && let Ok(mut guard) = tx.lock()
                    && let Some(tx) = guard.take()
                {
                    let _ = tx.send(());
                }
            })
        }));

        // gathering may have completed while the handler was being installed
        if pc.ice_gathering_state() == RTCIceGatheringState::Complete {
            return Self::local_description_json(pc).await;
        }

        timeout(ICE_GATHER_TIMEOUT, rx)
            .await
            .context("ICE gathering timeout")?
            .context("ICE gathering channel closed")?;

        Self::local_description_json(pc).await
    }

    // ── Offer / Answer ───────────────────────────────────────────────────

    /// Offerer side: create the data channel and a complete offer.
    pub async fn create_offer() -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>, SignalingMessage)> {
        let pc = Self::new_peer_connection().await?;
        let (channel, end, events) = SessionChannel::new();
        Self::monitor_state(&pc, end.handle.clone(), "offerer");

        // Explicit ordered + fully reliable (SCTP default, no partial reliability).
        let dc_init = Some(RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        });
        let dc = pc.create_data_channel(DATA_CHANNEL_LABEL, dc_init).await?;
        attach(&dc, end);

        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer).await?;
        let gathered_sdp = Self::gather_local_description(&pc).await?;

        Ok((
            Self {
                peer_connection: pc,
                channel,
            },
            events,
            SignalingMessage::Offer(gathered_sdp),
        ))
    }

    /// Answerer side: accept an offer and produce a complete answer. The
    /// data channel arrives later through `on_data_channel`.
    pub async fn accept_offer(
        offer: SignalingMessage,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>, SignalingMessage)> {
        let SignalingMessage::Offer(sdp) = offer else {
            return Err(anyhow!("Expected Offer"));
        };

        let pc = Self::new_peer_connection().await?;
        let (channel, end, events) = SessionChannel::new();
        Self::monitor_state(&pc, end.handle.clone(), "answerer");

        let end = Arc::new(Mutex::new(Some(end)));
        pc.on_data_channel(Box::new(move |dc| {
            let end = end.clone();
            Box::pin(async move {
                if dc.label() != DATA_CHANNEL_LABEL {
                    warn!(event = "dc_unexpected", label = %dc.label(), "Ignoring unknown data channel");
                    return;
                }
                let taken = end.lock().ok().and_then(|mut guard| guard.take());
                match taken {
                    Some(end) => attach(&dc, end),
                    None => warn!(event = "dc_duplicate", "Session data channel already attached"),
                }
            })
        }));

        let desc: RTCSessionDescription = serde_json::from_str(&sdp).context("Malformed offer SDP")?;
        pc.set_remote_description(desc).await?;

        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer).await?;
        let gathered_sdp = Self::gather_local_description(&pc).await?;

        Ok((
            Self {
                peer_connection: pc,
                channel,
            },
            events,
            SignalingMessage::Answer(gathered_sdp),
        ))
    }

    pub async fn set_answer(&self, answer: SignalingMessage) -> Result<()> {
        let SignalingMessage::Answer(sdp) = answer else {
            return Err(anyhow!("Expected Answer"));
        };
        let desc: RTCSessionDescription = serde_json::from_str(&sdp).context("Malformed answer SDP")?;
        self.peer_connection.set_remote_description(desc).await?;
        Ok(())
    }
}
