//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file (`--config`, or `roomdrop.toml` in the working directory)
//! - Merging CLI with file config (CLI takes precedence)

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::core::config::{
    ACK_TIMEOUT, CHUNK_SIZE, Framing, MAX_CHUNK_SIZE, RELAY_DEFAULT_URL, RELAY_LISTEN_ADDR, ROOM_TTL,
    TransferConfig,
};

const DEFAULT_CONFIG_FILE: &str = "roomdrop.toml";

/// Roomdrop - room-paired peer-to-peer file transfer.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// TOML file with defaults for the options below.
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// WebSocket URL of the negotiation relay.
    #[clap(long, global = true)]
    pub relay: Option<String>,

    /// Also append logs to this file.
    #[clap(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Frame format on the data channel. Both peers must agree.
    #[clap(long, value_enum, global = true)]
    pub framing: Option<Framing>,

    /// Chunk size in bytes.
    #[clap(long, global = true)]
    pub chunk_size: Option<usize>,

    /// Seconds to wait for each acknowledgement.
    #[clap(long, global = true)]
    pub ack_timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Run the negotiation relay.
    Relay {
        /// Address to listen on.
        #[clap(long)]
        listen: Option<String>,

        /// Seconds before an idle room is swept.
        #[clap(long)]
        room_ttl: Option<u64>,
    },
    /// Offer files or directories to one peer.
    Send {
        #[clap(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Join a room and download what it offers.
    Receive {
        room_id: String,

        /// Directory to save into. Defaults to the download directory.
        #[clap(short, long)]
        output: Option<PathBuf>,

        /// Only fetch these file ids or relative paths (repeatable).
        #[clap(long)]
        only: Vec<String>,
    },
}

/// Values a config file may provide. Every field is optional.
#[derive(Deserialize, Default, Clone, Debug, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct FileConfig {
    pub verbose: Option<u8>,
    pub relay: Option<String>,
    pub log_file: Option<PathBuf>,
    pub framing: Option<Framing>,
    pub chunk_size: Option<usize>,
    pub ack_timeout: Option<u64>,
    pub listen: Option<String>,
    pub room_ttl: Option<u64>,
    pub output: Option<PathBuf>,
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> anyhow::Result<Self> {
        let mut cli_args = Args::parse();
        cli_args.log_file = cli_args.log_file.map(Self::resolve_path);

        let explicit = cli_args.config.is_some();
        let path = cli_args
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        match Self::from_file(&path)? {
            Some(file) => Ok(Self::merge(file, cli_args)),
            None if explicit => anyhow::bail!("Config file {} not found", path.display()),
            None => Ok(cli_args),
        }
    }

    /// Resolve a potentially relative path to an absolute one.
    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    /// Load a config file. A missing file is `None`; a malformed one is an error.
    fn from_file(path: &Path) -> anyhow::Result<Option<FileConfig>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        let parsed = toml::from_str::<FileConfig>(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {e}", path.display()))?;
        Ok(Some(parsed))
    }

    /// Merge file config into CLI args (CLI takes precedence).
    fn merge(file: FileConfig, mut cli: Args) -> Args {
        if cli.verbose == 0 {
            cli.verbose = file.verbose.unwrap_or(0);
        }
        cli.relay = cli.relay.or(file.relay);
        cli.log_file = cli.log_file.or(file.log_file.map(Self::resolve_path));
        cli.framing = cli.framing.or(file.framing);
        cli.chunk_size = cli.chunk_size.or(file.chunk_size);
        cli.ack_timeout = cli.ack_timeout.or(file.ack_timeout);

        match &mut cli.command {
            Command::Relay { listen, room_ttl } => {
                if listen.is_none() {
                    *listen = file.listen;
                }
                if room_ttl.is_none() {
                    *room_ttl = file.room_ttl;
                }
            }
            Command::Receive { output, .. } => {
                if output.is_none() {
                    *output = file.output;
                }
            }
            Command::Send { .. } => {}
        }
        cli
    }

    pub fn relay_url(&self) -> String {
        self.relay
            .clone()
            .unwrap_or_else(|| RELAY_DEFAULT_URL.to_string())
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            chunk_size: self.chunk_size(),
            ack_timeout: self
                .ack_timeout
                .map(Duration::from_secs)
                .unwrap_or(ACK_TIMEOUT),
            framing: self.framing.unwrap_or_default(),
        }
    }

    /// `--chunk-size`, with 0 meaning the default and anything that would not
    /// fit in one data-channel message clamped down.
    fn chunk_size(&self) -> usize {
        match self.chunk_size {
            None | Some(0) => CHUNK_SIZE,
            Some(n) if n > MAX_CHUNK_SIZE => {
                warn!(
                    event = "chunk_size_clamped",
                    requested = n,
                    max = MAX_CHUNK_SIZE,
                    "Chunk size too large, clamping"
                );
                MAX_CHUNK_SIZE
            }
            Some(n) => n,
        }
    }
}

/// Resolved `relay` subcommand settings.
pub fn relay_settings(listen: Option<&str>, room_ttl: Option<u64>) -> (String, Duration) {
    (
        listen.unwrap_or(RELAY_LISTEN_ADDR).to_string(),
        room_ttl.map(Duration::from_secs).unwrap_or(ROOM_TTL),
    )
}

/// Where received files land when `--output` is not given.
pub fn default_output_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}
