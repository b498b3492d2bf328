//! Relay client used by both peers to pair up and exchange negotiation
//! payloads.

use anyhow::{Context, Result, anyhow};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::protocol::{ClientMessage, ServerMessage};

/// What the relay told us.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    RoomCreated(String),
    RoomJoined(String),
    PeerJoined(String),
    Signal(Value),
    Error(String),
    /// The relay connection ended.
    Closed,
}

impl From<ServerMessage> for RelayEvent {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::RoomCreated { room_id } => Self::RoomCreated(room_id),
            ServerMessage::RoomJoined { room_id } => Self::RoomJoined(room_id),
            ServerMessage::PeerJoined { peer_id } => Self::PeerJoined(peer_id),
            ServerMessage::Signal { data } => Self::Signal(data),
            ServerMessage::Error { message } => Self::Error(message),
        }
    }
}

pub struct RelayClient {
    out: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::UnboundedReceiver<RelayEvent>,
}

impl RelayClient {
    /// Open a WebSocket to the relay at `url` (e.g. `ws://host:3000`).
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .with_context(|| format!("cannot reach relay at {url}"))?;
        let (mut sink, mut source) = ws.split();

        let (out, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let Ok(text) = serde_json::to_string(&msg) else {
                    continue;
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let (events_tx, events) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            if events_tx.send(msg.into()).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(event = "relay_bad_reply", %e, "Unparseable relay message"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(event = "relay_read_error", %e, "Relay connection failed");
                        break;
                    }
                }
            }
            let _ = events_tx.send(RelayEvent::Closed);
        });

        Ok(Self { out, events })
    }

    fn send(&self, msg: ClientMessage) -> Result<()> {
        self.out
            .send(msg)
            .map_err(|_| anyhow!("relay connection closed"))
    }

    pub fn create_room(&self) -> Result<()> {
        self.send(ClientMessage::CreateRoom)
    }

    pub fn join_room(&self, room_id: &str) -> Result<()> {
        self.send(ClientMessage::JoinRoom {
            room_id: room_id.to_string(),
        })
    }

    pub fn signal(&self, room_id: &str, data: Value) -> Result<()> {
        self.send(ClientMessage::Signal {
            room_id: room_id.to_string(),
            data,
        })
    }

    /// Next relay event; `Closed` once the connection is gone, forever after.
    pub async fn next_event(&mut self) -> RelayEvent {
        self.events.recv().await.unwrap_or(RelayEvent::Closed)
    }
}
