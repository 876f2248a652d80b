//! Junction coordination hub daemon.
//!
//! Binds the per-channel sockets, records the endpoints file for
//! collaborating processes, and runs the hub until a `done` request arrives.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

use junction_common::config::{ExecMode, HubConfig};
use junction_common::endpoints::Endpoints;
use junctiond::pool::ProcessSpawner;
use junctiond::tap::RelayLayer;
use junctiond::Hub;

#[derive(Parser, Debug)]
#[command(name = "junctiond", version)]
#[command(about = "Coordination hub for workflow executors")]
struct Cli {
    /// Path to the hub configuration (junction.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Execution mode: master, slave or both
    #[arg(long)]
    mode: Option<ExecMode>,

    /// Directory for the channel sockets and the endpoints file
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    /// Ceiling on concurrently running substep workers
    #[arg(long)]
    max_procs: Option<usize>,

    /// Disable the single-line progress bar
    #[arg(long)]
    no_progress: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => HubConfig::load(path)?,
        None => {
            // pick up ./junction.toml when present
            let candidate = std::env::current_dir()
                .ok()
                .map(|dir| dir.join("junction.toml"));
            match candidate {
                Some(path) if path.is_file() => HubConfig::load(&path)?,
                _ => HubConfig::default(),
            }
        }
    };
    if let Some(mode) = cli.mode {
        config.exec_mode = mode;
    }
    if let Some(dir) = cli.runtime_dir.clone() {
        config.runtime_dir = Some(dir);
    }
    if let Some(max_procs) = cli.max_procs {
        config.max_procs = max_procs;
    }
    if cli.no_progress {
        config.progress_bar = false;
    }

    init_logging(&cli, &config)?;

    let mut hub = Hub::bind(config.clone())?;
    let spawner = ProcessSpawner::resolve(config.worker_binary.as_deref(), hub.endpoints_file())?;
    hub.set_worker_spawner(Box::new(spawner));

    let summary = hub.run().await?;
    // give worker stop frames and relayed logs a moment to flush
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!(
        steps = summary.steps,
        completed = summary.completed,
        ignored = summary.ignored,
        succeeded = summary.succeeded,
        "junctiond exiting"
    );
    Ok(())
}

fn init_logging(cli: &Cli, config: &HubConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.debug { "debug" } else { "info" }));

    // a slave hub relays its own logging to the master hub
    if config.exec_mode == ExecMode::Slave {
        if let Some(path) = &config.master_endpoints {
            let master = Endpoints::load(path)?;
            let relay = RelayLayer::connect(&master)?;
            tracing_subscriber::registry().with(filter).with(relay).init();
            return Ok(());
        }
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
    Ok(())
}
