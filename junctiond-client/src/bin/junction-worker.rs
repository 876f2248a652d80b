//! Default substep worker: pulls units from the hub's backend channel and
//! reports progress back through the control channel.

use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use serde_json::Value;
use tracing::{debug, info, warn};

use junction_common::endpoints::Endpoints;
use junction_common::protocol::WorkerCommand;
use junctiond_client::{HubClient, WorkerConnection};

#[derive(Parser, Debug)]
#[command(name = "junction-worker")]
#[command(about = "Substep worker for the junction hub")]
struct Cli {
    /// Path to the hub's endpoints file
    #[arg(long)]
    endpoints: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let endpoints = Endpoints::load(&cli.endpoints)?;
    let mut backend = WorkerConnection::connect(&endpoints).await?;
    let mut hub = HubClient::connect(&endpoints).await?;
    info!("Substep worker connected");

    loop {
        backend.ready().await?;
        match backend.next_command().await? {
            None => break,
            Some(WorkerCommand::Stop) => {
                debug!("Stop frame received; exiting");
                break;
            }
            Some(WorkerCommand::Job { payload }) => {
                if let Err(err) = execute_unit(&mut hub, &payload).await {
                    warn!("Substep failed: {:#}", err);
                }
            }
        }
    }
    Ok(())
}

/// Unit payloads are opaque to the hub; this worker understands the
/// `{"step": <name>, "ignore": <bool>}` shape and reports the matching
/// progress event.
async fn execute_unit(hub: &mut HubClient, payload: &Value) -> Result<()> {
    let step = payload
        .get("step")
        .and_then(Value::as_str)
        .unwrap_or("substep");
    if payload
        .get("ignore")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        hub.substep_ignored(step).await
    } else {
        hub.substep_completed(step).await
    }
}
