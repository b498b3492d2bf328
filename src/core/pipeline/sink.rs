//! Receive-side storage for one file.
//!
//! A [`FileSink`] streams into `<dest>.roomdrop-tmp` and renames it into
//! place on commit, so a partially received file never appears under its
//! final name. A [`MemorySink`] buffers in RAM and is the fallback when the
//! destination cannot be opened.

use std::io;
use std::path::PathBuf;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::core::protocol::FileMetadata;

const TEMP_SUFFIX: &str = ".roomdrop-tmp";

/// Where committed bytes ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOutput {
    Saved(PathBuf),
    Memory(Vec<u8>),
}

pub struct FileSink {
    file: fs::File,
    temp_path: PathBuf,
    final_path: PathBuf,
    written: u64,
}

impl FileSink {
    /// Create the temp file next to `final_path`, creating parent dirs.
    pub async fn create(final_path: PathBuf) -> io::Result<Self> {
        let temp_path = {
            let mut name = final_path.as_os_str().to_owned();
            name.push(TEMP_SUFFIX);
            PathBuf::from(name)
        };

        if let Some(parent) = temp_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;

        Ok(Self {
            file,
            temp_path,
            final_path,
            written: 0,
        })
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    async fn commit(mut self) -> io::Result<PathBuf> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);
        fs::rename(&self.temp_path, &self.final_path).await?;
        info!(
            event = "file_saved",
            path = %self.final_path.display(),
            bytes = self.written,
            "File committed"
        );
        Ok(self.final_path)
    }

    async fn abort(self) {
        drop(self.file);
        if let Err(e) = fs::remove_file(&self.temp_path).await
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(event = "temp_cleanup_failed", path = %self.temp_path.display(), %e, "Could not remove temp file");
        }
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    buf: Vec<u8>,
    /// Writes past this many bytes fail. `None` means unbounded.
    limit: Option<u64>,
}

impl MemorySink {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if let Some(limit) = self.limit
            && self.buf.len() as u64 + data.len() as u64 > limit
        {
            return Err(io::Error::new(
                io::ErrorKind::StorageFull,
                format!("memory sink limit of {limit} bytes exceeded"),
            ));
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }
}

/// Storage for the active file. Consumed exactly once by `commit` or `abort`.
pub enum Sink {
    File(FileSink),
    Memory(MemorySink),
}

impl Sink {
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Self::File(f) => f.write(data).await,
            Self::Memory(m) => m.write(data),
        }
    }

    #[cfg(test)]
    pub fn bytes_written(&self) -> u64 {
        match self {
            Self::File(f) => f.written,
            Self::Memory(m) => m.buf.len() as u64,
        }
    }

    pub async fn commit(self) -> io::Result<SinkOutput> {
        match self {
            Self::File(f) => f.commit().await.map(SinkOutput::Saved),
            Self::Memory(m) => Ok(SinkOutput::Memory(m.buf)),
        }
    }

    /// Discard everything written so far.
    pub async fn abort(self) {
        if let Self::File(f) = self {
            f.abort().await;
        }
    }
}

/// Opens a sink per incoming file.
#[derive(Debug, Clone)]
pub enum SinkProvider {
    /// Save under this directory at the file's sanitized relative path.
    Directory(PathBuf),
    /// Keep files in memory, each capped at `limit` bytes.
    #[cfg(test)]
    Memory { limit: Option<u64> },
}

impl SinkProvider {
    /// Open storage for `meta`. When the destination cannot be created the
    /// bytes go to an unbounded in-memory sink instead.
    pub async fn open(&self, meta: &FileMetadata) -> Sink {
        match self {
            Self::Directory(root) => {
                let dest = meta.destination(root);
                match FileSink::create(dest.clone()).await {
                    Ok(sink) => Sink::File(sink),
                    Err(e) => {
                        warn!(
                            event = "sink_open_failed",
                            file_id = %meta.id,
                            path = %dest.display(),
                            %e,
                            "Cannot open destination, buffering in memory"
                        );
                        Sink::Memory(MemorySink::new(None))
                    }
                }
            }
            #[cfg(test)]
            Self::Memory { limit } => Sink::Memory(MemorySink::new(*limit)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(path: &str) -> FileMetadata {
        FileMetadata {
            id: "0".into(),
            name: path.rsplit('/').next().unwrap_or(path).into(),
            size: 6,
            mime_type: "text/plain".into(),
            relative_path: path.into(),
        }
    }

    #[tokio::test]
    async fn file_sink_commits_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let provider = SinkProvider::Directory(dir.path().to_path_buf());
        let mut sink = provider.open(&meta("docs/a.txt")).await;
        assert!(matches!(sink, Sink::File(_)));

        sink.write(b"abc").await.unwrap();
        sink.write(b"def").await.unwrap();
        let dest = dir.path().join("docs/a.txt");
        assert!(!dest.exists());
        assert!(dir.path().join("docs/a.txt.roomdrop-tmp").exists());

        assert_eq!(sink.commit().await.unwrap(), SinkOutput::Saved(dest.clone()));
        assert_eq!(std::fs::read(&dest).unwrap(), b"abcdef");
        assert!(!dir.path().join("docs/a.txt.roomdrop-tmp").exists());
    }

    #[tokio::test]
    async fn abort_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let provider = SinkProvider::Directory(dir.path().to_path_buf());
        let mut sink = provider.open(&meta("b.bin")).await;
        sink.write(b"partial").await.unwrap();
        sink.abort().await;
        assert!(!dir.path().join("b.bin").exists());
        assert!(!dir.path().join("b.bin.roomdrop-tmp").exists());
    }

    #[tokio::test]
    async fn unopenable_destination_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        // a regular file where a directory is needed
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let provider = SinkProvider::Directory(blocker);
        let mut sink = provider.open(&meta("sub/c.txt")).await;
        assert!(matches!(sink, Sink::Memory(_)));
        sink.write(b"kept").await.unwrap();
        assert_eq!(sink.commit().await.unwrap(), SinkOutput::Memory(b"kept".to_vec()));
    }

    #[tokio::test]
    async fn memory_limit_fails_the_write() {
        let provider = SinkProvider::Memory { limit: Some(4) };
        let mut sink = provider.open(&meta("d")).await;
        sink.write(b"1234").await.unwrap();
        assert!(sink.write(b"5").await.is_err());
        assert_eq!(sink.bytes_written(), 4);
    }
}
