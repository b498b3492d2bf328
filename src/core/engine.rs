//! Peer orchestration: relay pairing → WebRTC negotiation → session engines.
//!
//! The sender creates a room, waits for a peer, offers, and serves requests
//! until the receiver hangs up. The receiver joins, answers, requests the
//! files it wants and closes the session once its queue drains.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::core::config::{CONNECTION_TIMEOUT, MAX_CONTROL_FRAME, TransferConfig};
use crate::core::connection::{
    ChannelEvent, ChannelState, SessionChannel, SignalingMessage, WebRTCConnection,
};
use crate::core::pipeline::receiver::IngestCommand;
use crate::core::pipeline::{
    FileSource, IngestEngine, IngestEvent, SinkOutput, SinkProvider, TransferEngine, TransferEvent,
    TransferState,
};
use crate::core::protocol::{FileMetadata, MessageRouter};
use crate::core::relay::{RelayClient, RelayEvent};
use crate::utils::sos::SignalOfStop;

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub relay_url: String,
    pub paths: Vec<PathBuf>,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    pub relay_url: String,
    pub room_id: String,
    pub output: PathBuf,
    /// File ids or relative paths to fetch; everything when empty.
    pub only: Vec<String>,
    pub transfer: TransferConfig,
}

/// Totals reported when a receive session ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveSummary {
    pub completed: usize,
    pub failed: usize,
    pub bytes: u64,
}

// ── Relay helpers ────────────────────────────────────────────────────────────

async fn cancellable<F: Future>(sos: &SignalOfStop, fut: F) -> Result<F::Output> {
    sos.select(fut).await.ok_or_else(|| anyhow!("Cancelled"))
}

/// Wait for the next relay event that `pick` accepts. Relay errors and a
/// lost relay connection abort.
async fn expect_event<T>(
    relay: &mut RelayClient,
    sos: &SignalOfStop,
    what: &str,
    mut pick: impl FnMut(RelayEvent) -> Option<T>,
) -> Result<T> {
    loop {
        let event = cancellable(sos, relay.next_event()).await?;
        match event {
            RelayEvent::Error(message) => bail!("{message}"),
            RelayEvent::Closed => bail!("Relay connection lost while waiting for {what}"),
            other => match pick(other) {
                Some(v) => return Ok(v),
                None => continue,
            },
        }
    }
}

async fn expect_signal(relay: &mut RelayClient, sos: &SignalOfStop) -> Result<SignalingMessage> {
    let data = expect_event(relay, sos, "negotiation", |e| match e {
        RelayEvent::Signal(data) => Some(data),
        _ => None,
    })
    .await?;
    serde_json::from_value(data).context("Malformed negotiation payload")
}

async fn wait_connected(channel: &SessionChannel) -> Result<()> {
    let mut state = channel.watch_state();
    let reached = timeout(
        CONNECTION_TIMEOUT,
        state.wait_for(|s| *s != ChannelState::Negotiating),
    )
    .await
    .context("Connection timeout")?
    .map(|s| *s)
    .map_err(|_| anyhow!("Session channel dropped"))?;
    if reached != ChannelState::Connected {
        bail!("Session closed before it connected");
    }
    Ok(())
}

// ── Progress ─────────────────────────────────────────────────────────────────

/// Turns per-chunk progress into one report per 10% step of each file.
#[derive(Debug, Default)]
struct ProgressTicker {
    reported: HashMap<String, u64>,
}

impl ProgressTicker {
    fn start(&mut self, file_id: &str) {
        self.reported.insert(file_id.to_string(), 0);
    }

    /// Percentage to report, if `done` crossed a new step.
    fn step(&mut self, file_id: &str, done: u64, size: u64) -> Option<u64> {
        let percent = if size == 0 {
            100
        } else {
            (done.min(size) * 100 / size) / 10 * 10
        };
        let last = self.reported.entry(file_id.to_string()).or_insert(0);
        if percent > *last {
            *last = percent;
            Some(percent)
        } else {
            None
        }
    }
}

// ── Sender ───────────────────────────────────────────────────────────────────

/// The catalog travels as a single data-channel message, so it must be
/// refused up front when it cannot fit in one.
fn check_catalog_fits(source: &FileSource, config: &TransferConfig) -> Result<()> {
    let frame = MessageRouter::new(config.framing).encode_control(&source.catalog().to_message())?;
    if frame.len() > MAX_CONTROL_FRAME {
        bail!(
            "Catalog of {} files is {} bytes, more than the {} bytes one message can carry; send fewer files per room",
            source.catalog().len(),
            frame.len(),
            MAX_CONTROL_FRAME
        );
    }
    Ok(())
}

pub async fn run_sender(opts: SendOptions, sos: SignalOfStop) -> Result<()> {
    let source = FileSource::from_paths(&opts.paths)?;
    if source.catalog().is_empty() {
        bail!("Nothing to send");
    }
    check_catalog_fits(&source, &opts.transfer)?;

    let mut relay = RelayClient::connect(&opts.relay_url).await?;
    relay.create_room()?;
    let room_id = expect_event(&mut relay, &sos, "room", |e| match e {
        RelayEvent::RoomCreated(id) => Some(id),
        _ => None,
    })
    .await?;

    println!("Room: {room_id}");
    println!("Run on the receiving side:  roomdrop receive {room_id}");

    let peer = expect_event(&mut relay, &sos, "a peer", |e| match e {
        RelayEvent::PeerJoined(id) => Some(id),
        _ => None,
    })
    .await?;
    info!(event = "peer_joined", %peer, "Peer joined, negotiating");

    let (conn, events, offer) = WebRTCConnection::create_offer().await?;
    relay.signal(&room_id, serde_json::to_value(&offer)?)?;
    let answer = expect_signal(&mut relay, &sos).await?;
    conn.set_answer(answer).await?;

    let result = serve(&conn, events, source, opts.transfer, &sos).await;
    conn.close().await;
    result
}

async fn serve(
    conn: &WebRTCConnection,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    source: FileSource,
    config: TransferConfig,
    sos: &SignalOfStop,
) -> Result<()> {
    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
    let ids: Vec<String> = source.catalog().ids().map(str::to_string).collect();
    let engine = TransferEngine::new(conn.channel().clone(), source, config, Some(ev_tx));
    let task = tokio::spawn(engine.clone().run(events));

    cancellable(sos, wait_connected(conn.channel())).await??;
    info!(event = "session_connected", "Peer connected");

    let mut ticker = ProgressTicker::default();
    loop {
        tokio::select! {
            ev = ev_rx.recv() => match ev {
                Some(TransferEvent::CatalogPublished { files, bytes }) => {
                    info!(event = "offer_sent", files, bytes, "Offered files to peer");
                }
                Some(TransferEvent::Started { file_id, name, size }) => {
                    ticker.start(&file_id);
                    info!(event = "send_started", %file_id, %name, size, "Sending");
                }
                Some(TransferEvent::Progress { file_id, sent, size }) => {
                    debug!(event = "send_progress", %file_id, sent, size);
                    if let Some(percent) = ticker.step(&file_id, sent, size) {
                        info!(event = "send_progress", %file_id, sent, size, percent, "Sending {percent}%");
                    }
                }
                Some(TransferEvent::Finished { file_id }) => {
                    info!(event = "send_finished", %file_id, "Sent");
                }
                Some(TransferEvent::Failed { file_id, reason }) => {
                    warn!(event = "send_failed", %file_id, %reason, "Send failed");
                }
                Some(TransferEvent::Closed) | None => break,
            },
            _ = sos.wait() => {
                conn.channel().close();
                break;
            }
        }
    }

    if let Err(e) = task.await {
        warn!(event = "engine_task_failed", %e, "Transfer engine ended abnormally");
    }
    let count = |wanted: TransferState| ids.iter().filter(|id| engine.state(id) == wanted).count();
    let (sent, failed) = (count(TransferState::Finished), count(TransferState::Failed));
    println!("Session ended: {sent} sent, {failed} failed");
    Ok(())
}

// ── Receiver ─────────────────────────────────────────────────────────────────

/// Which catalog entries to request.
pub fn select_files(files: &[FileMetadata], only: &[String]) -> Vec<String> {
    files
        .iter()
        .filter(|f| {
            only.is_empty()
                || only
                    .iter()
                    .any(|want| *want == f.id || *want == f.relative_path || *want == f.name)
        })
        .map(|f| f.id.clone())
        .collect()
}

pub async fn run_receiver(opts: ReceiveOptions, sos: SignalOfStop) -> Result<ReceiveSummary> {
    let mut relay = RelayClient::connect(&opts.relay_url).await?;
    relay.join_room(&opts.room_id)?;
    expect_event(&mut relay, &sos, "room", |e| match e {
        RelayEvent::RoomJoined(_) => Some(()),
        _ => None,
    })
    .await
    .with_context(|| format!("Cannot join room {}", opts.room_id))?;
    info!(event = "room_joined", room = %opts.room_id, "Joined room, waiting for offer");

    let offer = expect_signal(&mut relay, &sos).await?;
    let (conn, events, answer) = WebRTCConnection::accept_offer(offer).await?;
    relay.signal(&opts.room_id, serde_json::to_value(&answer)?)?;

    let result = ingest(&conn, events, &opts, &sos).await;
    conn.close().await;
    result
}

async fn ingest(
    conn: &WebRTCConnection,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    opts: &ReceiveOptions,
    sos: &SignalOfStop,
) -> Result<ReceiveSummary> {
    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let engine = IngestEngine::new(
        conn.channel().clone(),
        opts.transfer.framing,
        SinkProvider::Directory(opts.output.clone()),
        Some(ev_tx),
    );
    let task = tokio::spawn(engine.run(events, cmd_rx));

    cancellable(sos, wait_connected(conn.channel())).await??;
    info!(event = "session_connected", "Peer connected");

    let mut summary = ReceiveSummary::default();
    let mut ticker = ProgressTicker::default();
    loop {
        tokio::select! {
            ev = ev_rx.recv() => match ev {
                Some(IngestEvent::Catalog(files)) => {
                    let ids = select_files(&files, &opts.only);
                    println!("Offered {} file(s), requesting {}", files.len(), ids.len());
                    let _ = cmd_tx.send(IngestCommand::Request(ids));
                }
                Some(IngestEvent::Started { file_id, name, size }) => {
                    ticker.start(&file_id);
                    info!(event = "receive_started", %file_id, %name, size, "Receiving");
                }
                Some(IngestEvent::Progress { file_id, received, size }) => {
                    debug!(event = "receive_progress", %file_id, received, size);
                    if let Some(percent) = ticker.step(&file_id, received, size) {
                        info!(event = "receive_progress", %file_id, received, size, percent, "Receiving {percent}%");
                    }
                }
                Some(IngestEvent::Completed { file_id, output }) => {
                    summary.completed += 1;
                    match output {
                        SinkOutput::Saved(path) => {
                            if let Ok(meta) = std::fs::metadata(&path) {
                                summary.bytes += meta.len();
                            }
                            println!("Saved {}", path.display());
                        }
                        SinkOutput::Memory(bytes) => {
                            summary.bytes += bytes.len() as u64;
                            warn!(
                                event = "received_in_memory",
                                %file_id,
                                bytes = bytes.len(),
                                "Destination unavailable, file was not saved"
                            );
                        }
                    }
                }
                Some(IngestEvent::Failed { file_id, reason }) => {
                    summary.failed += 1;
                    warn!(event = "receive_failed", %file_id, %reason, "File failed");
                }
                Some(IngestEvent::AllDone) => {
                    conn.channel().close();
                }
                Some(IngestEvent::Closed) | None => break,
            },
            _ = sos.wait() => {
                conn.channel().close();
                break;
            }
        }
    }

    if let Err(e) = task.await {
        warn!(event = "engine_task_failed", %e, "Ingest engine ended abnormally");
    }
    println!(
        "Session ended: {} received ({} bytes), {} failed",
        summary.completed, summary.bytes, summary.failed
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Framing;

    fn meta(id: &str, path: &str) -> FileMetadata {
        FileMetadata {
            id: id.into(),
            name: path.rsplit('/').next().unwrap_or(path).into(),
            size: 1,
            mime_type: String::new(),
            relative_path: path.into(),
        }
    }

    #[test]
    fn empty_selection_requests_everything_in_catalog_order() {
        let files = vec![meta("0", "a"), meta("1", "d/b"), meta("2", "c")];
        assert_eq!(select_files(&files, &[]), vec!["0", "1", "2"]);
    }

    #[test]
    fn selection_matches_id_path_or_name() {
        let files = vec![meta("0", "a.txt"), meta("1", "d/b.txt"), meta("2", "c.txt")];
        let only = vec!["2".to_string(), "d/b.txt".to_string(), "missing".to_string()];
        assert_eq!(select_files(&files, &only), vec!["1", "2"]);
        assert_eq!(select_files(&files, &["b.txt".to_string()]), vec!["1"]);
    }

    #[test]
    fn progress_reports_each_ten_percent_once() {
        let mut ticker = ProgressTicker::default();
        ticker.start("0");
        assert_eq!(ticker.step("0", 5, 1000), None);
        assert_eq!(ticker.step("0", 100, 1000), Some(10));
        assert_eq!(ticker.step("0", 150, 1000), None);
        assert_eq!(ticker.step("0", 390, 1000), Some(30));
        assert_eq!(ticker.step("0", 1000, 1000), Some(100));
        assert_eq!(ticker.step("0", 1000, 1000), None);

        ticker.start("0");
        assert_eq!(ticker.step("0", 500, 1000), Some(50));
        assert_eq!(ticker.step("1", 0, 0), Some(100));
    }

    #[test]
    fn oversized_catalog_is_refused_before_pairing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("bulk");
        std::fs::create_dir_all(&root).unwrap();
        let stem = "x".repeat(120);
        for i in 0..400 {
            std::fs::write(root.join(format!("{stem}-{i:04}.txt")), b"x").unwrap();
        }
        let source = FileSource::from_paths(&[root]).unwrap();

        for framing in [Framing::Tagged, Framing::Legacy] {
            let config = TransferConfig { framing, ..TransferConfig::default() };
            let err = check_catalog_fits(&source, &config).unwrap_err();
            assert!(format!("{err}").contains("Catalog of 400 files"));
        }
    }

    #[test]
    fn ordinary_catalog_fits() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, b"hello").unwrap();
        let source = FileSource::from_paths(&[file]).unwrap();
        assert!(check_catalog_fits(&source, &TransferConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn wait_connected_fails_on_early_close() {
        let (channel, end, _events) = SessionChannel::new();
        end.handle.mark_closed();
        assert!(wait_connected(&channel).await.is_err());
    }

    #[tokio::test]
    async fn receiver_reports_unknown_room() {
        let server = crate::core::relay::RelayServer::bind(
            "127.0.0.1:0",
            std::time::Duration::from_secs(60),
            std::time::Duration::from_secs(60),
        )
        .await
        .unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());
        let sos = SignalOfStop::new();
        tokio::spawn(server.serve(sos.clone()));

        let opts = ReceiveOptions {
            relay_url: url,
            room_id: "nope".into(),
            output: std::env::temp_dir(),
            only: Vec::new(),
            transfer: TransferConfig::default(),
        };
        let err = run_receiver(opts, sos.clone()).await.unwrap_err();
        assert!(format!("{err:#}").contains("Room not found"));
        sos.cancel();
    }
}
