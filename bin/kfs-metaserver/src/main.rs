//! KFS Metadata Server
//!
//! Recovers the metadata tree from checkpoint + logs, starts the core
//! threads, and serves the line-oriented client/chunkserver protocol.

mod server;

use anyhow::{Context, Result};
use clap::Parser;
use kfs_common::MetaConfig;
use kfs_meta::MetaCore;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "kfs-metaserver")]
#[command(about = "KFS Metadata Server")]
#[command(version)]
struct Args {
    /// Directory for operation log files
    #[arg(short = 'l', long, default_value = "./kfslog")]
    log_dir: PathBuf,

    /// Directory for checkpoint files
    #[arg(short = 'c', long, default_value = "./kfscp")]
    cp_dir: PathBuf,

    /// Listen address for client and chunkserver connections
    #[arg(long, default_value = "0.0.0.0:20000")]
    listen: String,

    /// Seconds between checkpoint attempts
    #[arg(long, default_value = "600")]
    cp_max_secs: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting KFS Metadata Server");

    let mut config = MetaConfig::default();
    config.log_dir = args.log_dir;
    config.cp_dir = args.cp_dir;
    config.timers.cp_max_secs = args.cp_max_secs;

    let (core, out_rx) =
        MetaCore::start(&config).context("metaserver initialisation failed")?;
    let core = Arc::new(core);

    let listener = TcpListener::bind(&args.listen)
        .with_context(|| format!("cannot listen on {}", args.listen))?;
    info!("Listening on {}", args.listen);

    server::serve(listener, Arc::clone(&core), out_rx);

    // The accept loop only returns when the listener dies; drain and stop.
    match Arc::try_unwrap(core) {
        Ok(core) => core.shutdown(),
        Err(_) => info!("connections still active at shutdown"),
    }
    info!("Metadata Server shut down");
    Ok(())
}
