//! IngestEngine: the receiving side of a session.
//!
//! Adopts the sender's catalog, requests files one at a time from a FIFO
//! queue, and persists each file's chunks into a [`Sink`] in arrival order.
//! A chunk is acknowledged only after it has been written; a file is final
//! only once `file-end` arrives, regardless of how many bytes came in.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::notify;
use super::sink::{Sink, SinkOutput, SinkProvider};
use crate::core::config::Framing;
use crate::core::connection::channel::{ChannelEvent, Frame, SessionChannel};
use crate::core::error::TransferError;
use crate::core::protocol::{Adoption, Catalog, ControlMessage, FileMetadata, Inbound, MessageRouter};

/// Per-file progress on the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IngestState {
    #[default]
    NotStarted,
    StreamOpened,
    Receiving(u64),
    Finalized,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestEvent {
    Catalog(Vec<FileMetadata>),
    Started { file_id: String, name: String, size: u64 },
    Progress { file_id: String, received: u64, size: u64 },
    Completed { file_id: String, output: SinkOutput },
    Failed { file_id: String, reason: String },
    /// The request queue drained.
    AllDone,
    Closed,
}

/// External actions on a running engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestCommand {
    Request(Vec<String>),
}

struct ActiveFile {
    file_id: String,
    size: u64,
    received: u64,
    next_seq: u32,
    sink: Sink,
}

pub struct IngestEngine {
    channel: SessionChannel,
    router: MessageRouter,
    sinks: SinkProvider,
    catalog: Option<Catalog>,
    queue: VecDeque<String>,
    /// Requested, `file-start` not yet seen.
    in_flight: Option<String>,
    active: Option<ActiveFile>,
    states: HashMap<String, IngestState>,
    events: Option<mpsc::UnboundedSender<IngestEvent>>,
}

impl IngestEngine {
    pub fn new(
        channel: SessionChannel,
        framing: Framing,
        sinks: SinkProvider,
        events: Option<mpsc::UnboundedSender<IngestEvent>>,
    ) -> Self {
        Self {
            channel,
            router: MessageRouter::new(framing),
            sinks,
            catalog: None,
            queue: VecDeque::new(),
            in_flight: None,
            active: None,
            states: HashMap::new(),
            events,
        }
    }

    #[cfg(test)]
    pub fn catalog(&self) -> Option<&Catalog> {
        self.catalog.as_ref()
    }

    #[cfg(test)]
    pub fn state(&self, file_id: &str) -> IngestState {
        self.states.get(file_id).copied().unwrap_or_default()
    }

    /// Consume channel events and commands until the channel closes.
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<ChannelEvent>,
        mut commands: mpsc::UnboundedReceiver<IngestCommand>,
    ) {
        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(ChannelEvent::Data(frame)) => self.handle_frame(frame).await,
                    Some(ChannelEvent::Connected) => {
                        info!(event = "session_connected", "Waiting for catalog");
                    }
                    Some(ChannelEvent::Error(reason)) => {
                        warn!(event = "session_error", %reason, "Session channel error");
                    }
                    Some(ChannelEvent::Closed) | None => break,
                },
                Some(cmd) = commands.recv() => match cmd {
                    IngestCommand::Request(ids) => self.request(ids),
                },
            }
        }
        self.shutdown().await;
    }

    /// Queue files for download. Ids outside the catalog are skipped.
    pub fn request(&mut self, file_ids: Vec<String>) {
        let Some(catalog) = &self.catalog else {
            warn!(event = "request_before_catalog", "No catalog yet, ignoring request");
            return;
        };
        for id in file_ids {
            if catalog.contains(&id) {
                self.queue.push_back(id);
            } else {
                warn!(event = "request_unknown_file", file_id = %id, "Not in catalog, skipping");
            }
        }
        self.advance();
    }

    pub async fn handle_frame(&mut self, frame: Frame) {
        match self.router.classify(frame) {
            Some(Inbound::Control(msg)) => self.handle_control(msg).await,
            Some(Inbound::Chunk { seq, payload }) => self.handle_chunk(seq, payload).await,
            None => {}
        }
    }

    fn send(&self, msg: &ControlMessage) {
        match self.router.encode_control(msg) {
            Ok(frame) => {
                if !self.channel.send(frame) {
                    debug!(event = "send_dropped", kind = msg.kind(), "Channel not connected");
                }
            }
            Err(e) => warn!(event = "encode_failed", kind = msg.kind(), %e, "Could not encode control message"),
        }
    }

    fn set_state(&mut self, file_id: &str, state: IngestState) {
        debug!(event = "ingest_state", file_id, ?state);
        self.states.insert(file_id.to_string(), state);
    }

    /// Request the queue head if nothing is in progress.
    fn advance(&mut self) {
        if self.active.is_some() || self.in_flight.is_some() {
            return;
        }
        match self.queue.pop_front() {
            Some(file_id) => {
                debug!(event = "request_file", %file_id);
                self.send(&ControlMessage::RequestFile {
                    file_id: file_id.clone(),
                });
                self.in_flight = Some(file_id);
            }
            None => {
                info!(event = "all_done", "Request queue drained");
                notify(&self.events, IngestEvent::AllDone);
            }
        }
    }

    async fn handle_control(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::Metadata { files } => {
                let count = files.len();
                let announced = files.clone();
                match Catalog::adopt(&mut self.catalog, files) {
                    Adoption::Adopted => {
                        info!(event = "catalog_received", files = count, "Adopted sender catalog");
                        notify(&self.events, IngestEvent::Catalog(announced));
                    }
                    Adoption::Unchanged => debug!(event = "catalog_repeat", "Identical catalog, ignoring"),
                    Adoption::Conflict | Adoption::Invalid => {}
                }
            }
            ControlMessage::FileStart {
                file_id,
                size,
                name,
            } => self.on_file_start(file_id, size, name).await,
            ControlMessage::FileEnd { file_id } => self.on_file_end(file_id).await,
            ControlMessage::TransferFailed { file_id, reason } => {
                let reason = format!("sender failed: {reason}");
                if self.active.as_ref().is_some_and(|a| a.file_id == file_id) {
                    self.fail_active(reason, false).await;
                } else if self.in_flight.as_deref() == Some(file_id.as_str()) {
                    self.in_flight = None;
                    self.mark_failed(&file_id, reason);
                    self.advance();
                } else {
                    debug!(event = "stale_failure", %file_id, "Failure for a file not in progress");
                }
            }
            other => {
                warn!(event = "unexpected_control", kind = other.kind(), "Ignoring message not meant for the receiver");
            }
        }
    }

    async fn on_file_start(&mut self, file_id: String, size: u64, name: String) {
        let Some(meta) = self.catalog.as_ref().and_then(|c| c.get(&file_id)).cloned() else {
            warn!(event = "file_start_unknown", %file_id, "file-start for a file not in the catalog");
            return;
        };
        if self.active.is_some() || self.in_flight.as_deref() != Some(file_id.as_str()) {
            warn!(event = "file_start_unrequested", %file_id, "file-start for a file that was not requested");
            self.send(&ControlMessage::TransferFailed {
                file_id,
                reason: "not requested".into(),
            });
            return;
        }
        if size != meta.size {
            warn!(event = "size_mismatch", %file_id, catalog = meta.size, announced = size, "Using announced size");
        }

        self.in_flight = None;
        let sink = self.sinks.open(&meta).await;
        self.active = Some(ActiveFile {
            file_id: file_id.clone(),
            size,
            received: 0,
            next_seq: 0,
            sink,
        });
        self.set_state(&file_id, IngestState::StreamOpened);
        info!(event = "file_receiving", %file_id, %name, size, "Receiving file");
        notify(
            &self.events,
            IngestEvent::Started {
                file_id: file_id.clone(),
                name,
                size,
            },
        );
        self.send(&ControlMessage::StartAck { file_id });
    }

    async fn handle_chunk(&mut self, seq: Option<u32>, payload: Bytes) {
        let Some(active) = self.active.as_mut() else {
            warn!(event = "chunk_without_file", bytes = payload.len(), "Dropping chunk, no active file");
            return;
        };

        let seq = seq.unwrap_or(active.next_seq);
        if seq != active.next_seq {
            let reason = TransferError::Protocol(format!("expected chunk {}, got {seq}", active.next_seq));
            self.fail_active(reason.to_string(), true).await;
            return;
        }
        if active.received + payload.len() as u64 > active.size {
            let reason = TransferError::Protocol(format!("chunk overruns declared size {}", active.size));
            self.fail_active(reason.to_string(), true).await;
            return;
        }
        let written = active.sink.write(&payload).await;
        if let Err(e) = written {
            self.fail_active(TransferError::Sink(e).to_string(), true).await;
            return;
        }

        active.received += payload.len() as u64;
        active.next_seq += 1;
        let (file_id, received, size) = (active.file_id.clone(), active.received, active.size);
        self.set_state(&file_id, IngestState::Receiving(received));
        self.send(&ControlMessage::ChunkAck {
            file_id: file_id.clone(),
            seq: Some(seq),
        });
        notify(
            &self.events,
            IngestEvent::Progress {
                file_id,
                received,
                size,
            },
        );
    }

    async fn on_file_end(&mut self, file_id: String) {
        if !self.active.as_ref().is_some_and(|a| a.file_id == file_id) {
            warn!(event = "file_end_unexpected", %file_id, "file-end for a file that is not active");
            return;
        }
        let Some(active) = self.active.take() else {
            return;
        };

        if active.received != active.size {
            active.sink.abort().await;
            let reason = format!("stream ended at {} of {} bytes", active.received, active.size);
            self.mark_failed(&file_id, reason);
            self.advance();
            return;
        }

        match active.sink.commit().await {
            Ok(output) => {
                self.set_state(&file_id, IngestState::Finalized);
                info!(event = "file_received", %file_id, bytes = active.size, "File complete");
                notify(&self.events, IngestEvent::Completed { file_id, output });
            }
            Err(e) => self.mark_failed(&file_id, TransferError::Sink(e).to_string()),
        }
        self.advance();
    }

    /// Abort the active file. With `tell_peer`, the sender is sent
    /// `transfer-failed` so it stops waiting for an ack that will not come.
    async fn fail_active(&mut self, reason: String, tell_peer: bool) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.sink.abort().await;
        if tell_peer {
            self.send(&ControlMessage::TransferFailed {
                file_id: active.file_id.clone(),
                reason: reason.clone(),
            });
        }
        self.mark_failed(&active.file_id, reason);
        self.advance();
    }

    fn mark_failed(&mut self, file_id: &str, reason: String) {
        warn!(event = "file_receive_failed", file_id, %reason, "File transfer failed");
        self.set_state(file_id, IngestState::Failed);
        notify(
            &self.events,
            IngestEvent::Failed {
                file_id: file_id.to_string(),
                reason,
            },
        );
    }

    async fn shutdown(&mut self) {
        if let Some(active) = self.active.take() {
            info!(event = "receive_interrupted", file_id = %active.file_id, "Session closed mid-file, discarding");
            active.sink.abort().await;
            self.set_state(&active.file_id, IngestState::Failed);
        }
        notify(&self.events, IngestEvent::Closed);
    }
}
