//! Room registry: pairs exactly two participants per room and forwards
//! signaling payloads between them.
//!
//! Pure state; the server wraps it in a mutex and feeds it connection
//! events. Replies are pushed straight onto each participant's outbound
//! queue.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::protocol::ServerMessage;
use crate::core::error::RoomError;

pub type PeerId = Uuid;

/// One connected client.
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: PeerId,
    pub tx: mpsc::UnboundedSender<ServerMessage>,
}

impl Participant {
    pub fn new(tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
        }
    }

    fn send(&self, msg: ServerMessage) -> bool {
        self.tx.send(msg).is_ok()
    }
}

struct Room {
    offerer: Participant,
    joiner: Option<Participant>,
    /// An occupant disconnected; the room never becomes usable again.
    dead: bool,
    created: Instant,
}

impl Room {
    fn other(&self, peer: PeerId) -> Option<&Participant> {
        if self.offerer.id == peer {
            self.joiner.as_ref()
        } else if self.joiner.as_ref().is_some_and(|j| j.id == peer) {
            Some(&self.offerer)
        } else {
            None
        }
    }

    fn has(&self, peer: PeerId) -> bool {
        self.offerer.id == peer || self.joiner.as_ref().is_some_and(|j| j.id == peer)
    }
}

pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
    ttl: Duration,
}

impl RoomRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            rooms: HashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// `None` if the room is unknown.
    #[cfg(test)]
    pub fn is_dead(&self, room_id: &str) -> Option<bool> {
        self.rooms.get(room_id).map(|r| r.dead)
    }

    /// Open a fresh room with `offerer` as its first occupant and reply
    /// `room-created`.
    pub fn create_room(&mut self, offerer: Participant) -> Result<String, RoomError> {
        if offerer.tx.is_closed() {
            return Err(RoomError::Gone);
        }
        let room_id = Uuid::new_v4().to_string();
        offerer.send(ServerMessage::RoomCreated {
            room_id: room_id.clone(),
        });
        info!(event = "room_created", room = %room_id, peer = %offerer.id, "Room created");
        self.rooms.insert(
            room_id.clone(),
            Room {
                offerer,
                joiner: None,
                dead: false,
                created: Instant::now(),
            },
        );
        Ok(room_id)
    }

    /// Register `joiner` as the second occupant, reply `room-joined` and
    /// tell the offerer `peer-joined`.
    pub fn join_room(&mut self, joiner: Participant, room_id: &str) -> Result<(), RoomError> {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return Err(RoomError::NotFound);
        };
        if room.joiner.is_some() || room.offerer.id == joiner.id {
            return Err(RoomError::Full);
        }
        if room.dead {
            return Err(RoomError::NotFound);
        }
        if joiner.tx.is_closed() {
            return Err(RoomError::Gone);
        }

        joiner.send(ServerMessage::RoomJoined {
            room_id: room_id.to_string(),
        });
        room.offerer.send(ServerMessage::PeerJoined {
            peer_id: joiner.id.to_string(),
        });
        info!(event = "room_joined", room = %room_id, peer = %joiner.id, "Peer joined room");
        room.joiner = Some(joiner);
        Ok(())
    }

    /// Forward `data` to the other occupant. Returns whether it was delivered.
    pub fn relay_signal(&self, from: PeerId, room_id: &str, data: Value) -> bool {
        let Some(room) = self.rooms.get(room_id) else {
            debug!(event = "signal_unknown_room", room = %room_id, "Dropping signal");
            return false;
        };
        if room.dead {
            return false;
        }
        match room.other(from) {
            Some(peer) => peer.send(ServerMessage::Signal { data }),
            None => {
                debug!(event = "signal_no_peer", room = %room_id, peer = %from, "Dropping signal");
                false
            }
        }
    }

    /// Mark every room `peer` occupies as dead. Returns how many.
    pub fn disconnect(&mut self, peer: PeerId) -> usize {
        let mut n = 0;
        for (id, room) in self.rooms.iter_mut() {
            if room.has(peer) && !room.dead {
                room.dead = true;
                n += 1;
                debug!(event = "room_dead", room = %id, peer = %peer, "Occupant left, room unusable");
            }
        }
        n
    }

    /// Drop dead rooms and rooms older than the TTL. Returns how many.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.len();
        let ttl = self.ttl;
        self.rooms
            .retain(|_, room| !room.dead && now.saturating_duration_since(room.created) < ttl);
        let removed = before - self.len();
        if removed > 0 {
            info!(event = "rooms_swept", removed, remaining = self.len(), "Reclaimed rooms");
        }
        removed
    }
}
