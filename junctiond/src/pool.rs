//! Substep worker pool.
//!
//! Workers announce themselves with a ready credit after connecting and after
//! every finished unit. A frontend request goes straight to the longest-idle
//! credit when one exists; otherwise it is queued oldest-first and, capacity
//! permitting, one more worker is spawned. Workers idle past the configured
//! timeout get a single stop frame and leave the active count.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use junction_common::protocol::WorkerCommand;

/// Spawns one worker process that will connect back on the substep backend
/// channel. The worker's execution logic is its own business; the hub only
/// relies on the ready/stop contract.
pub trait WorkerSpawner: Send {
    fn spawn(&mut self) -> Result<()>;
}

/// Placeholder until a real spawner is installed; frontend requests queue
/// until externally started workers connect.
pub struct NullSpawner;

impl WorkerSpawner for NullSpawner {
    fn spawn(&mut self) -> Result<()> {
        anyhow::bail!("no worker spawner configured")
    }
}

/// Spawns `junction-worker` processes pointed at the hub's endpoints file.
pub struct ProcessSpawner {
    binary: PathBuf,
    endpoints_file: PathBuf,
    children: Vec<tokio::process::Child>,
}

impl ProcessSpawner {
    pub fn new(binary: PathBuf, endpoints_file: PathBuf) -> Self {
        Self {
            binary,
            endpoints_file,
            children: Vec::new(),
        }
    }

    /// Use the configured binary, falling back to `junction-worker` on PATH.
    pub fn resolve(configured: Option<&std::path::Path>, endpoints_file: PathBuf) -> Result<Self> {
        let binary = match configured {
            Some(path) => path.to_path_buf(),
            None => which::which("junction-worker")
                .context("junction-worker not found on PATH; set worker_binary in the config")?,
        };
        Ok(Self::new(binary, endpoints_file))
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&mut self) -> Result<()> {
        let child = tokio::process::Command::new(&self.binary)
            .arg("--endpoints")
            .arg(&self.endpoints_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to spawn substep worker {}", self.binary.display()))?;
        debug!(pid = child.id(), "Spawned substep worker");
        self.children.push(child);
        Ok(())
    }
}

pub struct WorkerPool {
    max_procs: usize,
    spawner: Box<dyn WorkerSpawner>,
    links: HashMap<Uuid, UnboundedSender<WorkerCommand>>,
    /// Ready credits, newest at the front; dispatch and reaping both take
    /// from the back (longest idle first).
    idle: VecDeque<(Uuid, Instant)>,
    /// Queued unit requests, newest at the front; dispatch takes from the
    /// back (oldest first).
    pending: VecDeque<Value>,
    active: usize,
}

impl WorkerPool {
    pub fn new(max_procs: usize, spawner: Box<dyn WorkerSpawner>) -> Self {
        Self {
            max_procs,
            spawner,
            links: HashMap::new(),
            idle: VecDeque::new(),
            pending: VecDeque::new(),
            active: 0,
        }
    }

    pub fn set_spawner(&mut self, spawner: Box<dyn WorkerSpawner>) {
        self.spawner = spawner;
    }

    pub fn active(&self) -> usize {
        self.active
    }

    /// A worker connected on the backend channel.
    pub fn connected(&mut self, id: Uuid, link: UnboundedSender<WorkerCommand>) {
        self.links.insert(id, link);
    }

    /// A frontend unit request: consume an idle credit if one exists,
    /// otherwise queue the unit and grow the pool if capacity allows.
    /// `nprocs` is the externally reported step-process count; spawned
    /// workers plus those processes stay under the ceiling.
    pub fn unit_request(&mut self, payload: Value, nprocs: usize) {
        while let Some((id, _since)) = self.idle.pop_back() {
            match self.links.get(&id) {
                Some(link) if link.send(WorkerCommand::Job { payload: payload.clone() }).is_ok() => {
                    return;
                }
                // stale credit: the worker went away, try the next one
                _ => continue,
            }
        }

        self.pending.push_front(payload);
        if self.active == 0 || self.active + nprocs < self.max_procs {
            match self.spawner.spawn() {
                Ok(()) => {
                    self.active += 1;
                    debug!("Started a substep worker, {} in total", self.active);
                }
                Err(err) => warn!("Failed to start a substep worker: {:#}", err),
            }
        }
    }

    /// Ready credit from a worker: hand it the oldest queued unit or park it
    /// with an idle timestamp.
    pub fn worker_ready(&mut self, id: Uuid) {
        let Some(link) = self.links.get(&id) else {
            warn!(worker = %id, "Ready token from unknown worker");
            return;
        };
        if let Some(payload) = self.pending.pop_back() {
            if let Err(err) = link.send(WorkerCommand::Job { payload }) {
                warn!(worker = %id, "Worker went away before taking a unit");
                if let WorkerCommand::Job { payload } = err.0 {
                    self.pending.push_back(payload);
                }
            }
        } else {
            self.idle.push_front((id, Instant::now()));
        }
    }

    /// The worker's connection closed.
    pub fn worker_gone(&mut self, id: Uuid) {
        if self.links.remove(&id).is_some() {
            self.active = self.active.saturating_sub(1);
        }
        self.idle.retain(|(worker, _)| *worker != id);
    }

    /// Periodic sweep: one stop frame per expired idle worker.
    pub fn reap_idle(&mut self, timeout: Duration) -> usize {
        let now = Instant::now();
        let mut stopped = 0;
        while let Some((id, since)) = self.idle.back().copied() {
            if now.duration_since(since) < timeout {
                break;
            }
            self.idle.pop_back();
            if let Some(link) = self.links.remove(&id) {
                let _ = link.send(WorkerCommand::Stop);
            }
            self.active = self.active.saturating_sub(1);
            stopped += 1;
        }
        if stopped > 0 {
            debug!("Stopped {} idle substep workers, {} remain", stopped, self.active);
        }
        stopped
    }

    /// Shutdown path: poison every idle worker.
    pub fn stop_idle(&mut self) {
        while let Some((id, _since)) = self.idle.pop_front() {
            if let Some(link) = self.links.remove(&id) {
                let _ = link.send(WorkerCommand::Stop);
            }
            self.active = self.active.saturating_sub(1);
        }
    }
}
