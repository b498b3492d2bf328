//! WebSocket relay service hosting the [`RoomRegistry`].
//!
//! Each accepted connection becomes one [`Participant`] with an unbounded
//! outbound queue drained by a writer task. Inbound text frames are parsed
//! as [`ClientMessage`]s and applied to the shared registry.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::protocol::{ClientMessage, ServerMessage};
use super::rooms::{Participant, RoomRegistry};
use crate::utils::sos::SignalOfStop;

#[derive(Clone)]
struct Shared {
    registry: Arc<Mutex<RoomRegistry>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RoomRegistry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct RelayServer {
    listener: TcpListener,
    shared: Shared,
    sweep_interval: Duration,
}

impl RelayServer {
    pub async fn bind(addr: &str, room_ttl: Duration, sweep_interval: Duration) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("cannot listen on {addr}"))?;
        Ok(Self {
            listener,
            shared: Shared {
                registry: Arc::new(Mutex::new(RoomRegistry::new(room_ttl))),
            },
            sweep_interval,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `sos` fires.
    pub async fn serve(self, sos: SignalOfStop) -> Result<()> {
        info!(event = "relay_listening", addr = %self.local_addr()?, "Signaling relay running");
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let shared = self.shared.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(shared, stream, addr).await {
                                debug!(event = "relay_connection_error", %addr, %e, "Connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(event = "relay_accept_failed", %e, "Accept failed"),
                },
                _ = sweep.tick() => {
                    self.shared.lock().sweep(Instant::now());
                }
                _ = sos.wait() => {
                    info!(event = "relay_stopping", "Relay shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(shared: Shared, stream: TcpStream, addr: SocketAddr) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;
    let (mut sink, mut source) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let me = Participant::new(tx);
    info!(event = "relay_peer_connected", peer = %me.id, %addr, "User connected");

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    warn!(event = "relay_encode_failed", %e, "Could not encode reply");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_message(&shared, &me, &text),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(event = "relay_read_error", peer = %me.id, %e, "Read failed");
                break;
            }
        }
    }

    let dead = shared.lock().disconnect(me.id);
    info!(event = "relay_peer_disconnected", peer = %me.id, rooms = dead, "User disconnected");
    // rooms may still hold a clone of our sender, so stop the writer explicitly
    writer.abort();
    Ok(())
}

fn handle_message(shared: &Shared, me: &Participant, text: &str) {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(event = "relay_bad_message", peer = %me.id, %e, "Unparseable client message");
            let _ = me.tx.send(ServerMessage::Error {
                message: "Malformed message".into(),
            });
            return;
        }
    };

    match msg {
        ClientMessage::CreateRoom => {
            if let Err(e) = shared.lock().create_room(me.clone()) {
                debug!(event = "relay_create_failed", peer = %me.id, %e);
            }
        }
        ClientMessage::JoinRoom { room_id } => {
            if let Err(e) = shared.lock().join_room(me.clone(), &room_id) {
                warn!(event = "relay_join_refused", peer = %me.id, room = %room_id, %e, "Join refused");
                let _ = me.tx.send(ServerMessage::Error {
                    message: e.to_string(),
                });
            }
        }
        ClientMessage::Signal { room_id, data } => {
            shared.lock().relay_signal(me.id, &room_id, data);
        }
    }
}
