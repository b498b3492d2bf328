//! Sending-side file source: builds the catalog from local paths and streams
//! file contents with a small read-ahead.
//!
//! ```text
//! ┌──────────┐   bounded chan   ┌──────────────────┐
//! │ DiskRead │ ────────────────►│ TransferEngine   │──► SessionChannel
//! │ (async)  │  READ_AHEAD deep │ (one chunk/ack)  │
//! └──────────┘                  └──────────────────┘
//! ```

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::mpsc;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::core::protocol::{Catalog, FileMetadata};

/// Chunks read ahead of the send loop. One is in flight at a time, so a
/// couple is enough to hide disk latency.
const READ_AHEAD_CHUNKS: usize = 4;

/// One offered file and where it lives locally.
#[derive(Debug, Clone)]
pub struct SourceEntry {
    pub meta: FileMetadata,
    pub path: PathBuf,
}

/// The ordered set of local files offered in a session.
#[derive(Debug, Clone)]
pub struct FileSource {
    entries: Vec<SourceEntry>,
    catalog: Catalog,
}

impl FileSource {
    /// Collect files from `paths`. Directories are walked recursively in
    /// file-name order and keep their own name as the first path component.
    /// Ids are assigned `"0".."n-1"` in that order.
    pub fn from_paths<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut found: Vec<(PathBuf, String, u64)> = Vec::new();

        for path in paths {
            let path = path.as_ref();
            let meta = std::fs::metadata(path)
                .with_context(|| format!("cannot read {}", path.display()))?;

            if meta.is_file() {
                found.push((path.to_path_buf(), display_name(path), meta.len()));
                continue;
            }
            if !meta.is_dir() {
                bail!("{} is neither a file nor a directory", path.display());
            }

            let root_name = display_name(path);
            for entry in WalkDir::new(path).sort_by_file_name() {
                let entry = entry.with_context(|| format!("walking {}", path.display()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(path)
                    .with_context(|| format!("{} escaped its root", entry.path().display()))?;
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let size = file_size(entry.path(), entry.metadata().map_err(io::Error::from))?;
                found.push((entry.path().to_path_buf(), format!("{root_name}/{rel}"), size));
            }
        }

        let entries: Vec<SourceEntry> = found
            .into_iter()
            .enumerate()
            .map(|(i, (path, relative_path, size))| {
                let name = relative_path
                    .rsplit('/')
                    .next()
                    .unwrap_or(&relative_path)
                    .to_string();
                SourceEntry {
                    meta: FileMetadata {
                        id: i.to_string(),
                        mime_type: mime_for(&name).to_string(),
                        name,
                        size,
                        relative_path,
                    },
                    path,
                }
            })
            .collect();

        let catalog = Catalog::new(entries.iter().map(|e| e.meta.clone()).collect())?;
        info!(
            event = "source_ready",
            files = catalog.len(),
            bytes = catalog.total_size(),
            "Collected files to offer"
        );
        Ok(Self { entries, catalog })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn entry(&self, id: &str) -> Option<&SourceEntry> {
        self.entries.iter().find(|e| e.meta.id == id)
    }
}

/// Size of a walked file. An unreadable entry fails the whole catalog so it
/// is never offered with a made-up size.
fn file_size(path: &Path, meta: io::Result<std::fs::Metadata>) -> Result<u64> {
    meta.map(|m| m.len())
        .with_context(|| format!("cannot read {}", path.display()))
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string())
}

/// Best-effort MIME type from the file extension.
pub fn mime_for(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "js" => "text/javascript",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// A chunk read from disk, ready to be framed and sent.
#[derive(Debug)]
pub struct ReadChunk {
    /// 0-based sequence number.
    pub seq: u32,
    pub data: Vec<u8>,
}

/// Spawn a disk reader that prefetches chunks of `file_path` into a bounded
/// channel. A read error is delivered in-band and ends the stream; the
/// reader also stops once the receiving side is dropped.
pub fn spawn_reader(
    file_path: PathBuf,
    filesize: u64,
    chunk_size: usize,
) -> mpsc::Receiver<io::Result<ReadChunk>> {
    let (tx, rx) = mpsc::channel(READ_AHEAD_CHUNKS);
    let total_chunks = filesize.div_ceil(chunk_size as u64);

    tokio::spawn(async move {
        let mut file = match tokio::fs::File::open(&file_path).await {
            Ok(f) => f,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        for seq in 0..total_chunks {
            let offset = seq * chunk_size as u64;
            let len = (chunk_size as u64).min(filesize - offset) as usize;

            let mut buf = vec![0u8; len];
            let read = async {
                file.seek(SeekFrom::Start(offset)).await?;
                file.read_exact(&mut buf).await?;
                Ok::<_, io::Error>(())
            }
            .await;

            let item = match read {
                Ok(()) => Ok(ReadChunk {
                    seq: seq as u32,
                    data: buf,
                }),
                Err(e) => Err(e),
            };
            let failed = item.is_err();
            if tx.send(item).await.is_err() {
                debug!(event = "reader_dropped", path = %file_path.display(), "Send loop gone, stopping reader");
                return;
            }
            if failed {
                return;
            }
        }
    });

    rx
}
