//! TransferEngine: the sending side of a session.
//!
//! Two tasks cooperate:
//!
//! - the **router loop** (`run`) consumes channel events, publishes the
//!   catalog on connect, queues `request-file`s and feeds acknowledgements
//!   into the [`AckWaiter`];
//! - the **stream worker** pops file ids off the FIFO transfer queue and
//!   streams one file at a time, never sending a frame while an ack is
//!   outstanding.
//!
//! Per file: `file-start` → start ack → (chunk → chunk ack)* → `file-end`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::acks::{AckKey, AckSignal, AckWaiter};
use super::notify;
use super::source::{FileSource, spawn_reader};
use crate::core::config::TransferConfig;
use crate::core::connection::channel::{ChannelEvent, Frame, SessionChannel};
use crate::core::error::TransferError;
use crate::core::protocol::{ControlMessage, Inbound, MessageRouter};

/// Per-file progress on the sending side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferState {
    #[default]
    Idle,
    Requested,
    AwaitingStartAck,
    Streaming,
    Finished,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    CatalogPublished { files: usize, bytes: u64 },
    Started { file_id: String, name: String, size: u64 },
    Progress { file_id: String, sent: u64, size: u64 },
    Finished { file_id: String },
    Failed { file_id: String, reason: String },
    Closed,
}

struct Inner {
    channel: SessionChannel,
    router: MessageRouter,
    source: FileSource,
    config: TransferConfig,
    acks: AckWaiter,
    states: Mutex<HashMap<String, TransferState>>,
    events: Option<mpsc::UnboundedSender<TransferEvent>>,
}

#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<Inner>,
}

impl TransferEngine {
    pub fn new(
        channel: SessionChannel,
        source: FileSource,
        config: TransferConfig,
        events: Option<mpsc::UnboundedSender<TransferEvent>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                channel,
                router: MessageRouter::new(config.framing),
                source,
                config,
                acks: AckWaiter::new(),
                states: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn state(&self, file_id: &str) -> TransferState {
        self.inner.state(file_id)
    }

    /// Drive the session until the channel closes.
    pub async fn run(self, mut inbound: mpsc::UnboundedReceiver<ChannelEvent>) {
        let inner = self.inner;
        let (queue_tx, queue_rx) = mpsc::unbounded_channel::<String>();
        let worker = tokio::spawn(stream_worker(inner.clone(), queue_rx));
        let mut published = false;

        while let Some(event) = inbound.recv().await {
            match event {
                ChannelEvent::Connected => {
                    if !published {
                        inner.publish_catalog();
                        published = true;
                    }
                }
                ChannelEvent::Data(frame) => match inner.router.classify(frame) {
                    Some(Inbound::Control(msg)) => inner.handle_control(msg, &queue_tx),
                    Some(Inbound::Chunk { .. }) => {
                        warn!(event = "unexpected_chunk", "Sender received chunk data, ignoring");
                    }
                    None => {}
                },
                ChannelEvent::Error(reason) => {
                    warn!(event = "session_error", %reason, "Session channel error");
                }
                ChannelEvent::Closed => break,
            }
        }

        info!(event = "sender_closing", "Session closed, stopping transfer engine");
        inner.acks.cancel_all();
        drop(queue_tx);
        if let Err(e) = worker.await {
            warn!(event = "stream_worker_panicked", %e, "Stream worker ended abnormally");
        }
        notify(&inner.events, TransferEvent::Closed);
    }
}

impl Inner {
    fn state(&self, file_id: &str) -> TransferState {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(file_id)
            .copied()
            .unwrap_or_default()
    }

    fn set_state(&self, file_id: &str, state: TransferState) {
        debug!(event = "transfer_state", file_id, ?state);
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(file_id.to_string(), state);
    }

    fn send_control(&self, msg: &ControlMessage) -> Result<(), TransferError> {
        let frame = self
            .router
            .encode_control(msg)
            .map_err(|e| TransferError::Protocol(e.to_string()))?;
        if self.channel.send(frame) {
            Ok(())
        } else {
            Err(TransferError::Cancelled)
        }
    }

    fn publish_catalog(&self) {
        let catalog = self.source.catalog();
        match self.send_control(&catalog.to_message()) {
            Ok(()) => {
                info!(
                    event = "catalog_published",
                    files = catalog.len(),
                    bytes = catalog.total_size(),
                    "Published file catalog"
                );
                notify(
                    &self.events,
                    TransferEvent::CatalogPublished {
                        files: catalog.len(),
                        bytes: catalog.total_size(),
                    },
                );
            }
            Err(e) => warn!(event = "catalog_publish_failed", %e, "Could not publish catalog"),
        }
    }

    fn handle_control(&self, msg: ControlMessage, queue: &mpsc::UnboundedSender<String>) {
        match msg {
            ControlMessage::RequestFile { file_id } => {
                if !self.source.catalog().contains(&file_id) {
                    warn!(event = "unknown_file_requested", %file_id, "Peer requested a file not in the catalog");
                    let _ = self.send_control(&ControlMessage::TransferFailed {
                        file_id,
                        reason: "unknown file".into(),
                    });
                    return;
                }
                debug!(event = "file_queued", %file_id, "Queued requested file");
                let _ = queue.send(file_id);
            }
            ControlMessage::StartAck { file_id } => {
                self.acks.resolve(AckSignal::Start(file_id));
            }
            ControlMessage::ChunkAck { file_id, seq } => {
                self.acks.resolve(AckSignal::Chunk { file_id, seq });
            }
            ControlMessage::TransferFailed { file_id, reason } => {
                warn!(event = "peer_failed_file", %file_id, %reason, "Receiver gave up on file");
                self.acks.resolve(AckSignal::Failed { file_id, reason });
            }
            other => {
                warn!(
                    event = "unexpected_control",
                    kind = other.kind(),
                    file_id = other.file_id().unwrap_or("-"),
                    "Ignoring message not meant for the sender"
                );
            }
        }
    }

    /// Stream one file. Every frame is sent only after the previous one was
    /// acknowledged.
    async fn send_file(&self, file_id: &str) -> Result<(), TransferError> {
        let entry = self
            .source
            .entry(file_id)
            .ok_or_else(|| TransferError::Protocol(format!("unknown file {file_id}")))?;
        let size = entry.meta.size;
        let limit = self.config.ack_timeout;

        self.set_state(file_id, TransferState::Requested);
        notify(
            &self.events,
            TransferEvent::Started {
                file_id: file_id.to_string(),
                name: entry.meta.name.clone(),
                size,
            },
        );

        let ack = self.acks.arm(AckKey::Start(file_id.to_string()))?;
        self.send_control(&ControlMessage::FileStart {
            file_id: file_id.to_string(),
            size,
            name: entry.meta.name.clone(),
        })?;
        self.set_state(file_id, TransferState::AwaitingStartAck);
        self.acks.wait(ack, limit).await?;

        self.set_state(file_id, TransferState::Streaming);
        let mut chunks = spawn_reader(entry.path.clone(), size, self.config.chunk_size);
        let mut frame = Vec::with_capacity(self.config.chunk_size + 8);
        let mut sent = 0u64;

        while let Some(chunk) = chunks.recv().await {
            let chunk = chunk.map_err(TransferError::Source)?;
            let ack = self.acks.arm(AckKey::Chunk(file_id.to_string(), chunk.seq))?;
            self.router.encode_chunk_into(&mut frame, chunk.seq, &chunk.data);
            if !self.channel.send(Frame::Binary(Bytes::copy_from_slice(&frame))) {
                return Err(TransferError::Cancelled);
            }
            self.acks.wait(ack, limit).await?;

            sent += chunk.data.len() as u64;
            notify(
                &self.events,
                TransferEvent::Progress {
                    file_id: file_id.to_string(),
                    sent,
                    size,
                },
            );
        }

        if sent != size {
            return Err(TransferError::Source(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read {sent} of {size} bytes"),
            )));
        }

        self.send_control(&ControlMessage::FileEnd {
            file_id: file_id.to_string(),
        })?;
        self.set_state(file_id, TransferState::Finished);
        info!(event = "file_sent", file_id, bytes = size, "File transfer finished");
        notify(
            &self.events,
            TransferEvent::Finished {
                file_id: file_id.to_string(),
            },
        );
        Ok(())
    }
}

/// Pop queued requests and stream them strictly one at a time.
async fn stream_worker(inner: Arc<Inner>, mut queue: mpsc::UnboundedReceiver<String>) {
    while let Some(file_id) = queue.recv().await {
        let result = inner.send_file(&file_id).await;
        let Err(err) = result else { continue };

        inner.acks.disarm();
        inner.set_state(&file_id, TransferState::Failed);
        let reason = err.to_string();
        notify(
            &inner.events,
            TransferEvent::Failed {
                file_id: file_id.clone(),
                reason: reason.clone(),
            },
        );

        if matches!(err, TransferError::Cancelled) {
            debug!(event = "stream_worker_cancelled", %file_id, "Session closed mid-transfer");
            break;
        }
        warn!(event = "file_send_failed", %file_id, %reason, "File transfer failed, moving on");
        if err.should_notify_peer() {
            let _ = inner.send_control(&ControlMessage::TransferFailed { file_id, reason });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{CHUNK_SIZE, Framing};
    use std::path::Path;
    use std::time::Duration;

    /// The far side of the channel, speaking the protocol by hand.
    struct FakeReceiver {
        channel: SessionChannel,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        router: MessageRouter,
    }

    impl FakeReceiver {
        async fn next(&mut self) -> Inbound {
            loop {
                let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                    .await
                    .expect("timed out waiting for frame")
                    .expect("channel ended");
                if let ChannelEvent::Data(frame) = event {
                    return self.router.classify(frame).expect("unclassifiable frame");
                }
            }
        }

        async fn next_control(&mut self) -> ControlMessage {
            match self.next().await {
                Inbound::Control(msg) => msg,
                other => panic!("expected control, got {other:?}"),
            }
        }

        /// Nothing arrives for a little while.
        async fn assert_quiet(&mut self) {
            let res = tokio::time::timeout(Duration::from_millis(100), self.events.recv()).await;
            assert!(res.is_err(), "unexpected frame: {res:?}");
        }

        fn send(&self, msg: ControlMessage) {
            assert!(self.channel.send(self.router.encode_control(&msg).unwrap()));
        }
    }

    fn setup(
        files: &[(&str, usize)],
        dir: &Path,
        config: TransferConfig,
    ) -> (
        TransferEngine,
        tokio::task::JoinHandle<()>,
        FakeReceiver,
        mpsc::UnboundedReceiver<TransferEvent>,
    ) {
        let mut paths = Vec::new();
        for (name, size) in files {
            let path = dir.join(name);
            std::fs::write(&path, (0..*size).map(|i| (i % 251) as u8).collect::<Vec<_>>()).unwrap();
            paths.push(path);
        }
        let source = FileSource::from_paths(&paths).unwrap();
        let ((a, a_events), (b, b_events)) = SessionChannel::pair();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let engine = TransferEngine::new(a, source, config, Some(ev_tx));
        let task = tokio::spawn(engine.clone().run(a_events));
        let peer = FakeReceiver {
            channel: b,
            events: b_events,
            router: MessageRouter::new(config.framing),
        };
        (engine, task, peer, ev_rx)
    }

    #[tokio::test]
    async fn single_file_is_gated_by_acks() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _task, mut peer, _events) =
            setup(&[("a.bin", 40_000)], dir.path(), TransferConfig::default());

        let ControlMessage::Metadata { files } = peer.next_control().await else {
            panic!("expected metadata first");
        };
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, 40_000);

        peer.send(ControlMessage::RequestFile { file_id: "0".into() });
        assert_eq!(
            peer.next_control().await,
            ControlMessage::FileStart {
                file_id: "0".into(),
                size: 40_000,
                name: "a.bin".into()
            }
        );
        peer.assert_quiet().await;
        assert_eq!(engine.state("0"), TransferState::AwaitingStartAck);
        peer.send(ControlMessage::StartAck { file_id: "0".into() });

        let mut sizes = Vec::new();
        for expected_seq in 0..3u32 {
            match peer.next().await {
                Inbound::Chunk { seq, payload } => {
                    assert_eq!(seq, Some(expected_seq));
                    sizes.push(payload.len());
                }
                other => panic!("expected chunk, got {other:?}"),
            }
            peer.assert_quiet().await;
            peer.send(ControlMessage::ChunkAck {
                file_id: "0".into(),
                seq: Some(expected_seq),
            });
        }
        assert_eq!(sizes, vec![CHUNK_SIZE, CHUNK_SIZE, 40_000 - 2 * CHUNK_SIZE]);
        assert_eq!(peer.next_control().await, ControlMessage::FileEnd { file_id: "0".into() });
        peer.assert_quiet().await;
        assert_eq!(engine.state("0"), TransferState::Finished);
    }

    #[tokio::test]
    async fn requests_are_served_in_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let (_engine, _task, mut peer, _events) = setup(
            &[("x", 10), ("y", 0), ("z", 20)],
            dir.path(),
            TransferConfig::default(),
        );
        peer.next_control().await;

        peer.send(ControlMessage::RequestFile { file_id: "2".into() });
        peer.send(ControlMessage::RequestFile { file_id: "0".into() });

        let mut order = Vec::new();
        for _ in 0..2 {
            let ControlMessage::FileStart { file_id, size, .. } = peer.next_control().await else {
                panic!("expected file-start");
            };
            order.push(file_id.clone());
            peer.send(ControlMessage::StartAck { file_id: file_id.clone() });
            if size > 0 {
                assert!(matches!(peer.next().await, Inbound::Chunk { seq: Some(0), .. }));
                peer.send(ControlMessage::ChunkAck { file_id: file_id.clone(), seq: Some(0) });
            }
            assert_eq!(peer.next_control().await, ControlMessage::FileEnd { file_id });
        }
        assert_eq!(order, vec!["2", "0"]);
    }

    #[tokio::test]
    async fn empty_file_goes_straight_to_file_end() {
        let dir = tempfile::tempdir().unwrap();
        let (_engine, _task, mut peer, _events) =
            setup(&[("empty", 0)], dir.path(), TransferConfig::default());
        peer.next_control().await;
        peer.send(ControlMessage::RequestFile { file_id: "0".into() });
        assert!(matches!(peer.next_control().await, ControlMessage::FileStart { size: 0, .. }));
        peer.send(ControlMessage::StartAck { file_id: "0".into() });
        assert_eq!(peer.next_control().await, ControlMessage::FileEnd { file_id: "0".into() });
    }

    #[tokio::test]
    async fn unknown_request_is_answered_with_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (_engine, _task, mut peer, _events) =
            setup(&[("a", 1)], dir.path(), TransferConfig::default());
        peer.next_control().await;
        peer.send(ControlMessage::RequestFile { file_id: "99".into() });
        assert_eq!(
            peer.next_control().await,
            ControlMessage::TransferFailed {
                file_id: "99".into(),
                reason: "unknown file".into()
            }
        );
    }

    #[tokio::test]
    async fn peer_failure_skips_to_next_file() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _task, mut peer, mut events) =
            setup(&[("a", 100), ("b", 5)], dir.path(), TransferConfig::default());
        peer.next_control().await;
        peer.send(ControlMessage::RequestFile { file_id: "0".into() });
        peer.send(ControlMessage::RequestFile { file_id: "1".into() });

        peer.next_control().await;
        peer.send(ControlMessage::StartAck { file_id: "0".into() });
        assert!(matches!(peer.next().await, Inbound::Chunk { .. }));
        peer.send(ControlMessage::TransferFailed {
            file_id: "0".into(),
            reason: "disk full".into(),
        });

        assert!(matches!(
            peer.next_control().await,
            ControlMessage::FileStart { file_id, .. } if file_id == "1"
        ));
        assert_eq!(engine.state("0"), TransferState::Failed);

        let mut saw_failure = false;
        while let Ok(ev) = events.try_recv() {
            if let TransferEvent::Failed { file_id, reason } = ev {
                assert_eq!(file_id, "0");
                assert!(reason.contains("disk full"));
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_timeout_fails_file_and_notifies_peer() {
        let dir = tempfile::tempdir().unwrap();
        let config = TransferConfig {
            ack_timeout: Duration::from_secs(2),
            ..TransferConfig::default()
        };
        let (engine, _task, mut peer, _events) = setup(&[("slow", 10)], dir.path(), config);
        peer.next_control().await;
        peer.send(ControlMessage::RequestFile { file_id: "0".into() });
        peer.next_control().await;

        assert!(matches!(
            peer.next_control().await,
            ControlMessage::TransferFailed { file_id, .. } if file_id == "0"
        ));
        assert_eq!(engine.state("0"), TransferState::Failed);
    }

    #[tokio::test]
    async fn close_releases_pending_ack_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, task, mut peer, mut events) =
            setup(&[("a", 10)], dir.path(), TransferConfig::default());
        peer.next_control().await;
        peer.send(ControlMessage::RequestFile { file_id: "0".into() });
        peer.next_control().await;

        peer.channel.close();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(engine.state("0"), TransferState::Failed);

        let mut last = None;
        while let Ok(ev) = events.try_recv() {
            last = Some(ev);
        }
        assert_eq!(last, Some(TransferEvent::Closed));
    }

    #[tokio::test]
    async fn legacy_peer_acks_by_file_id() {
        let dir = tempfile::tempdir().unwrap();
        let config = TransferConfig {
            framing: Framing::Legacy,
            ..TransferConfig::default()
        };
        let (_engine, _task, mut peer, _events) = setup(&[("a", 20_000)], dir.path(), config);
        peer.next_control().await;
        peer.send(ControlMessage::RequestFile { file_id: "0".into() });
        peer.next_control().await;
        peer.send(ControlMessage::ChunkAck { file_id: "0".into(), seq: None });

        for _ in 0..2 {
            assert!(matches!(peer.next().await, Inbound::Chunk { seq: None, .. }));
            peer.send(ControlMessage::ChunkAck { file_id: "0".into(), seq: None });
        }
        assert_eq!(peer.next_control().await, ControlMessage::FileEnd { file_id: "0".into() });
    }
}
