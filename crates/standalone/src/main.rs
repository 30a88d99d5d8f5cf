//! `cortexd` — the Cortex storage daemon.

use clap::Parser;
use cortex_core::{server, Config};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "cortexd", version, about = "Local record-store daemon with UID-scoped tables")]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the Unix socket path.
    #[arg(long)]
    socket_path: Option<PathBuf>,

    /// Override the data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.apply_env();
    if let Some(path) = args.socket_path {
        config.socket_path = path;
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }

    let cancel = CancellationToken::new();
    tokio::spawn(wait_for_shutdown_signal(cancel.clone()));

    server::run(config, cancel).await
}

async fn wait_for_shutdown_signal(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(e) => {
            log::error!("cannot install SIGTERM handler: {e}");
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("received SIGINT"),
        _ = terminate.recv() => log::info!("received SIGTERM"),
    }
    cancel.cancel();
}
