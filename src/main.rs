mod core;
mod utils;
mod workers;

use crate::core::config::ROOM_SWEEP_INTERVAL;
use crate::core::engine::{self, ReceiveOptions, SendOptions};
use crate::core::relay::RelayServer;
use crate::utils::log_file::FileLogLayer;
use crate::utils::sos::SignalOfStop;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use workers::args::{self, Args, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load()?;

    // webrtc_ice reports late STUN responses as "unknown TransactionID"; keep it quiet.
    let filter = match args.verbose {
        0 => "warn,roomdrop=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };

    let file_layer = args.log_file.as_deref().map(FileLogLayer::new).transpose()?;

    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    match args.command.clone() {
        Command::Relay { listen, room_ttl } => {
            let (addr, ttl) = args::relay_settings(listen.as_deref(), room_ttl);
            let server = RelayServer::bind(&addr, ttl, ROOM_SWEEP_INTERVAL).await?;
            server.serve(sos).await
        }
        Command::Send { paths } => {
            let opts = SendOptions {
                relay_url: args.relay_url(),
                paths,
                transfer: args.transfer_config(),
            };
            engine::run_sender(opts, sos).await
        }
        Command::Receive {
            room_id,
            output,
            only,
        } => {
            let opts = ReceiveOptions {
                relay_url: args.relay_url(),
                room_id,
                output: output.unwrap_or_else(args::default_output_dir),
                only,
                transfer: args.transfer_config(),
            };
            let summary = engine::run_receiver(opts, sos).await?;
            if summary.failed > 0 {
                anyhow::bail!("{} file(s) failed", summary.failed);
            }
            Ok(())
        }
    }
}
