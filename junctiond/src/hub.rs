//! The hub core.
//!
//! [`Hub::bind`] stakes out one socket per logical channel and records the
//! paths in the endpoints file; [`Hub::run`] is the event loop. Every piece
//! of mutable state (stores, counters, the completed-step index, the worker
//! pool) is owned by the run task, so no locking is needed anywhere: the
//! transport listener tasks only parse frames and forward them over
//! channels. The only suspension point is the `select!`; once a channel
//! fires, its backlog is drained without yielding, which bounds how stale any
//! channel can get to one full drain of the others.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use junction_common::config::HubConfig;
use junction_common::endpoints::{Channel, Endpoints, ENDPOINTS_FILE};
use junction_common::protocol::{
    ControlEvent, ControlRequest, ListenerEvent, LogRecord, ProgressUpdate, SignatureEvent,
    SignatureRequest, StepStatus, BYE, OK,
};

use crate::pool::{NullSpawner, WorkerPool, WorkerSpawner};
use crate::progress::ProgressBar;
use crate::store::{
    FileStepStore, FileWorkflowStore, MemoryStepStore, MemoryWorkflowStore, StepStore,
    WorkflowStore,
};
use crate::tap::{self, ListenerSink, LogListenerSink};
use crate::transport::{self, BackendEvent, ReqSender};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// Settle delay for frames still in flight on the sockets when a shutdown
/// drain runs.
const DRAIN_SETTLE: Duration = Duration::from_millis(50);
const PULSE_INTERVAL: Duration = Duration::from_secs(1);

/// Counters reported when the hub stops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Distinct step names that reported any substep activity.
    pub steps: usize,
    pub completed: u64,
    pub ignored: u64,
    pub succeeded: bool,
}

struct HubChannels {
    sig_push_rx: mpsc::UnboundedReceiver<SignatureEvent>,
    sig_req_rx: mpsc::UnboundedReceiver<(SignatureRequest, oneshot::Sender<Value>)>,
    ctl_push_rx: mpsc::UnboundedReceiver<ControlEvent>,
    ctl_req_rx: mpsc::UnboundedReceiver<(ControlRequest, oneshot::Sender<Value>)>,
    frontend_rx: mpsc::UnboundedReceiver<Value>,
    backend_rx: mpsc::UnboundedReceiver<BackendEvent>,
    tap_logging_rx: mpsc::UnboundedReceiver<LogRecord>,
    tap_listener_rx: mpsc::UnboundedReceiver<ListenerEvent>,
}

/// Keeps every channel's sender half alive for the whole run so quiet
/// receivers park instead of closing.
#[allow(dead_code)]
struct HubSenders {
    sig_push: mpsc::UnboundedSender<SignatureEvent>,
    sig_req: ReqSender<SignatureRequest>,
    ctl_push: mpsc::UnboundedSender<ControlEvent>,
    ctl_req: ReqSender<ControlRequest>,
    frontend: mpsc::UnboundedSender<Value>,
    backend: mpsc::UnboundedSender<BackendEvent>,
    tap_logging: mpsc::UnboundedSender<LogRecord>,
    tap_listener: mpsc::UnboundedSender<ListenerEvent>,
}

pub struct Hub {
    config: HubConfig,
    runtime_dir: PathBuf,
    endpoints: Endpoints,
    channels: Option<HubChannels>,
    _senders: HubSenders,
    listeners: Vec<JoinHandle<()>>,

    workflow_store: Box<dyn WorkflowStore>,
    step_store: Box<dyn StepStore>,
    pool: WorkerPool,
    progress: Option<ProgressBar>,
    listener_sink: Box<dyn ListenerSink>,

    nprocs: usize,
    completed: HashMap<String, u64>,
    ignored: HashMap<String, u64>,
    step_status: BTreeMap<String, StepStatus>,
    completed_steps: BTreeMap<String, Value>,
}

impl Hub {
    /// Bind every channel socket and write the endpoints file. Clients may
    /// connect as soon as this returns; frames queue until [`Hub::run`].
    pub fn bind(config: HubConfig) -> Result<Self> {
        let runtime_dir = match &config.runtime_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir().join(format!("junctiond-{}", std::process::id())),
        };
        std::fs::create_dir_all(&runtime_dir)
            .with_context(|| format!("failed to create runtime dir {}", runtime_dir.display()))?;

        let mut endpoints = Endpoints::default();
        let mut listeners = Vec::new();

        let (sig_push_tx, sig_push_rx) = mpsc::unbounded_channel();
        let (listener, path) = transport::bind(&runtime_dir, Channel::SignaturePush)?;
        endpoints.insert(Channel::SignaturePush, path);
        listeners.push(transport::spawn_push_listener(
            Channel::SignaturePush,
            listener,
            sig_push_tx.clone(),
        ));

        let (sig_req_tx, sig_req_rx) = mpsc::unbounded_channel();
        let (listener, path) = transport::bind(&runtime_dir, Channel::SignatureReq)?;
        endpoints.insert(Channel::SignatureReq, path);
        listeners.push(transport::spawn_req_listener(
            Channel::SignatureReq,
            listener,
            sig_req_tx.clone(),
        ));

        let (ctl_push_tx, ctl_push_rx) = mpsc::unbounded_channel();
        let (listener, path) = transport::bind(&runtime_dir, Channel::ControlPush)?;
        endpoints.insert(Channel::ControlPush, path);
        listeners.push(transport::spawn_push_listener(
            Channel::ControlPush,
            listener,
            ctl_push_tx.clone(),
        ));

        let (ctl_req_tx, ctl_req_rx) = mpsc::unbounded_channel();
        let (listener, path) = transport::bind(&runtime_dir, Channel::ControlReq)?;
        endpoints.insert(Channel::ControlReq, path);
        listeners.push(transport::spawn_req_listener(
            Channel::ControlReq,
            listener,
            ctl_req_tx.clone(),
        ));

        let (frontend_tx, frontend_rx) = mpsc::unbounded_channel();
        let (listener, path) = transport::bind(&runtime_dir, Channel::SubstepFrontend)?;
        endpoints.insert(Channel::SubstepFrontend, path);
        listeners.push(transport::spawn_push_listener(
            Channel::SubstepFrontend,
            listener,
            frontend_tx.clone(),
        ));

        let (backend_tx, backend_rx) = mpsc::unbounded_channel();
        let (listener, path) = transport::bind(&runtime_dir, Channel::SubstepBackend)?;
        endpoints.insert(Channel::SubstepBackend, path);
        listeners.push(transport::spawn_backend_listener(listener, backend_tx.clone()));

        let (tap_logging_tx, tap_logging_rx) = mpsc::unbounded_channel();
        let (tap_listener_tx, tap_listener_rx) = mpsc::unbounded_channel();
        if config.exec_mode.taps_bound() {
            let (listener, path) = transport::bind(&runtime_dir, Channel::TapLogging)?;
            endpoints.insert(Channel::TapLogging, path);
            listeners.push(transport::spawn_push_listener(
                Channel::TapLogging,
                listener,
                tap_logging_tx.clone(),
            ));

            let (listener, path) = transport::bind(&runtime_dir, Channel::TapListener)?;
            endpoints.insert(Channel::TapListener, path);
            listeners.push(transport::spawn_push_listener(
                Channel::TapListener,
                listener,
                tap_listener_tx.clone(),
            ));

            let (listener, path) = transport::bind(&runtime_dir, Channel::TapHandshake)?;
            endpoints.insert(Channel::TapHandshake, path);
            listeners.push(tap::spawn_handshake_listener(listener));
        } else {
            // slave: attach to the master hub's handshake channel
            let master_path = config
                .master_endpoints
                .as_ref()
                .context("slave mode requires master_endpoints in the config")?;
            let master = Endpoints::load(master_path)?;
            listeners.push(tap::spawn_handshake_client(master));
        }

        let (workflow_store, step_store): (Box<dyn WorkflowStore>, Box<dyn StepStore>) =
            match &config.signature_dir {
                Some(dir) => (
                    Box::new(FileWorkflowStore::open(dir.join("workflow_facts.jsonl"))?),
                    Box::new(FileStepStore::open(dir.join("step_signatures.jsonl"))?),
                ),
                None => (
                    Box::new(MemoryWorkflowStore::default()),
                    Box::new(MemoryStepStore::default()),
                ),
            };

        endpoints.save(&runtime_dir.join(ENDPOINTS_FILE))?;

        let pool = WorkerPool::new(config.max_procs, Box::new(NullSpawner));
        Ok(Self {
            config,
            runtime_dir,
            endpoints,
            channels: Some(HubChannels {
                sig_push_rx,
                sig_req_rx,
                ctl_push_rx,
                ctl_req_rx,
                frontend_rx,
                backend_rx,
                tap_logging_rx,
                tap_listener_rx,
            }),
            _senders: HubSenders {
                sig_push: sig_push_tx,
                sig_req: sig_req_tx,
                ctl_push: ctl_push_tx,
                ctl_req: ctl_req_tx,
                frontend: frontend_tx,
                backend: backend_tx,
                tap_logging: tap_logging_tx,
                tap_listener: tap_listener_tx,
            },
            listeners,
            workflow_store,
            step_store,
            pool,
            progress: None,
            listener_sink: Box::new(LogListenerSink),
            nprocs: 0,
            completed: HashMap::new(),
            ignored: HashMap::new(),
            step_status: BTreeMap::new(),
            completed_steps: BTreeMap::new(),
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn endpoints_file(&self) -> PathBuf {
        self.runtime_dir.join(ENDPOINTS_FILE)
    }

    pub fn set_worker_spawner(&mut self, spawner: Box<dyn WorkerSpawner>) {
        self.pool.set_spawner(spawner);
    }

    pub fn set_stores(&mut self, workflow: Box<dyn WorkflowStore>, step: Box<dyn StepStore>) {
        self.workflow_store = workflow;
        self.step_store = step;
    }

    pub fn set_listener_sink(&mut self, sink: Box<dyn ListenerSink>) {
        self.listener_sink = sink;
    }

    /// Drive the hub until a `done` request (or an interrupt) has been fully
    /// drained and acknowledged.
    pub async fn run(mut self) -> Result<RunSummary> {
        let Some(mut ch) = self.channels.take() else {
            bail!("hub is already running");
        };
        if self.config.progress_bar && !self.config.interactive {
            self.progress = Some(ProgressBar::start(PULSE_INTERVAL));
        }
        info!(
            mode = %self.config.exec_mode,
            dir = %self.runtime_dir.display(),
            "Hub listening"
        );

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut succeeded = true;
        loop {
            tokio::select! {
                Some(event) = ch.sig_push_rx.recv() => {
                    self.on_signature_event(event);
                    while let Ok(event) = ch.sig_push_rx.try_recv() {
                        self.on_signature_event(event);
                    }
                }
                Some((request, reply)) = ch.sig_req_rx.recv() => {
                    // facts pushed before the query must be visible to it
                    while let Ok(event) = ch.sig_push_rx.try_recv() {
                        self.on_signature_event(event);
                    }
                    let _ = reply.send(self.on_signature_request(request));
                }
                Some(event) = ch.ctl_push_rx.recv() => {
                    self.on_control_event(event);
                    while let Ok(event) = ch.ctl_push_rx.try_recv() {
                        self.on_control_event(event);
                    }
                }
                Some((request, reply)) = ch.ctl_req_rx.recv() => {
                    while let Ok(event) = ch.sig_push_rx.try_recv() {
                        self.on_signature_event(event);
                    }
                    while let Ok(event) = ch.ctl_push_rx.try_recv() {
                        self.on_control_event(event);
                    }
                    match request {
                        ControlRequest::Done { succeeded: ok } => {
                            succeeded = ok;
                            self.drain_for_shutdown(&mut ch).await;
                            let _ = reply.send(Value::String(BYE.to_string()));
                            break;
                        }
                        request => {
                            let _ = reply.send(self.on_control_request(request));
                        }
                    }
                }
                Some(payload) = ch.frontend_rx.recv() => {
                    self.pool.unit_request(payload, self.nprocs);
                    while let Ok(payload) = ch.frontend_rx.try_recv() {
                        self.pool.unit_request(payload, self.nprocs);
                    }
                }
                Some(event) = ch.backend_rx.recv() => {
                    self.on_backend_event(event);
                    while let Ok(event) = ch.backend_rx.try_recv() {
                        self.on_backend_event(event);
                    }
                }
                Some(record) = ch.tap_logging_rx.recv() => {
                    tap::emit_log_record(&record, self.config.exec_mode);
                }
                Some(event) = ch.tap_listener_rx.recv() => {
                    self.listener_sink.forward(&event);
                }
                _ = sweep.tick() => {
                    self.pool.reap_idle(self.config.idle_timeout());
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupt received; draining and shutting down");
                    succeeded = false;
                    self.drain_for_shutdown(&mut ch).await;
                    break;
                }
            }
        }

        let summary = self.summary(succeeded);
        if let Some(bar) = self.progress.take() {
            bar.done(&format_summary(&summary));
        }
        self.teardown();
        info!(
            steps = summary.steps,
            completed = summary.completed,
            ignored = summary.ignored,
            "Hub stopped"
        );
        Ok(summary)
    }

    /// Flush everything still queued so no fact or progress update sent
    /// before the shutdown request is lost. The settle pass picks up frames
    /// that were still in flight on the sockets when it started.
    async fn drain_for_shutdown(&mut self, ch: &mut HubChannels) {
        for pass in 0..3 {
            if pass > 0 {
                tokio::time::sleep(DRAIN_SETTLE).await;
            }
            while let Ok(event) = ch.sig_push_rx.try_recv() {
                self.on_signature_event(event);
            }
            while let Ok(event) = ch.ctl_push_rx.try_recv() {
                self.on_control_event(event);
            }
            while let Ok(event) = ch.backend_rx.try_recv() {
                self.on_backend_event(event);
            }
            if self.config.exec_mode.taps_bound() {
                while let Ok(record) = ch.tap_logging_rx.try_recv() {
                    tap::emit_log_record(&record, self.config.exec_mode);
                }
                while let Ok(event) = ch.tap_listener_rx.try_recv() {
                    self.listener_sink.forward(&event);
                }
            }
        }
    }

    fn on_signature_event(&mut self, event: SignatureEvent) {
        let result = match &event {
            SignatureEvent::Workflow {
                workflow_id,
                entry_type,
                payload,
            } => self
                .workflow_store
                .write(workflow_id, entry_type, payload.clone()),
            SignatureEvent::Step { step_id, signature } => {
                self.step_store.set(step_id, signature.clone())
            }
            SignatureEvent::Commit => self
                .workflow_store
                .commit()
                .and_then(|()| self.step_store.commit()),
        };
        if let Err(err) = result {
            warn!("Failed to record signature fact {:?}: {:#}", event, err);
        }
    }

    fn on_signature_request(&mut self, request: SignatureRequest) -> Value {
        match self.signature_reply(&request) {
            Ok(reply) => reply,
            Err(err) => {
                warn!("Failed to respond to signature request {:?}: {:#}", request, err);
                Value::Null
            }
        }
    }

    fn signature_reply(&mut self, request: &SignatureRequest) -> Result<Value> {
        Ok(match request {
            SignatureRequest::WorkflowClear => {
                self.workflow_store.clear()?;
                Value::String(OK.to_string())
            }
            SignatureRequest::WorkflowPlaceholders { workflow_id } => {
                Value::Array(self.workflow_store.placeholders(workflow_id)?)
            }
            SignatureRequest::WorkflowRecords { workflow_id } => {
                Value::Array(self.workflow_store.records(workflow_id)?)
            }
            SignatureRequest::StepGet { step_id } => {
                self.step_store.get(step_id)?.unwrap_or(Value::Null)
            }
        })
    }

    fn on_control_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Nprocs { count } => {
                debug!("Active step-process count set to {}", count);
                self.nprocs = count;
            }
            ControlEvent::Progress { update } => self.on_progress_update(update),
        }
    }

    fn on_progress_update(&mut self, update: ProgressUpdate) {
        match &update {
            ProgressUpdate::SubstepIgnored { step } => {
                *self.ignored.entry(step.clone()).or_insert(0) += 1;
            }
            ProgressUpdate::SubstepCompleted { step } => {
                *self.completed.entry(step.clone()).or_insert(0) += 1;
            }
            ProgressUpdate::StepCompleted {
                status,
                step,
                output,
            } => {
                self.step_status.insert(step.clone(), *status);
                self.completed_steps.insert(step.clone(), output.clone());
            }
        }
        if let Some(bar) = self.progress.as_mut() {
            match update {
                ProgressUpdate::SubstepIgnored { .. } => bar.substep_ignored(),
                ProgressUpdate::SubstepCompleted { .. } => bar.substep_completed(),
                ProgressUpdate::StepCompleted { status, .. } => bar.step_completed(status),
            }
        }
    }

    fn on_control_request(&mut self, request: ControlRequest) -> Value {
        match request {
            ControlRequest::Nprocs => Value::from(self.nprocs as u64),
            ControlRequest::HasStep { name } => {
                let hit = self.completed_steps.contains_key(&name)
                    || self
                        .completed_steps
                        .keys()
                        .any(|step| workflow_prefix(step) == Some(name.as_str()));
                Value::Bool(hit)
            }
            ControlRequest::StepOutput { name } => {
                if let Some(output) = self.completed_steps.get(&name) {
                    output.clone()
                } else {
                    // workflow-level lookup: the lexicographically last step
                    // of that workflow wins (BTreeMap iteration is sorted)
                    self.completed_steps
                        .iter()
                        .rev()
                        .find(|(step, _)| workflow_prefix(step) == Some(name.as_str()))
                        .map(|(_, output)| output.clone())
                        .unwrap_or(Value::Null)
                }
            }
            ControlRequest::NamedOutput { label } => self
                .completed_steps
                .values()
                .find_map(|output| {
                    output
                        .get("labels")
                        .and_then(|labels| labels.get(&label))
                        .cloned()
                })
                .unwrap_or(Value::Null),
            // the run loop intercepts done before dispatching here
            ControlRequest::Done { .. } => Value::Null,
        }
    }

    fn on_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Connected { id, link } => self.pool.connected(id, link),
            BackendEvent::Ready { id } => self.pool.worker_ready(id),
            BackendEvent::Gone { id } => self.pool.worker_gone(id),
        }
    }

    fn summary(&self, succeeded: bool) -> RunSummary {
        let steps = self
            .completed
            .keys()
            .chain(self.ignored.keys())
            .chain(self.step_status.keys())
            .collect::<HashSet<_>>()
            .len();
        RunSummary {
            steps,
            completed: self.completed.values().sum(),
            ignored: self.ignored.values().sum(),
            succeeded,
        }
    }

    fn teardown(&mut self) {
        self.pool.stop_idle();
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
        for path in self.endpoints.paths() {
            let _ = std::fs::remove_file(path);
        }
        let _ = std::fs::remove_file(self.endpoints_file());
    }
}

/// `"align_2"` belongs to workflow `"align"`; a name without an index suffix
/// has no workflow prefix.
fn workflow_prefix(step: &str) -> Option<&str> {
    step.rsplit_once('_').map(|(prefix, _)| prefix)
}

pub(crate) fn format_summary(summary: &RunSummary) -> String {
    let plural = |n: u64| if n > 1 { "s" } else { "" };
    let steps_text = format!(
        "{} step{} processed",
        summary.steps,
        if summary.steps > 1 { "s" } else { "" }
    );
    let completed_text = if summary.completed > 0 {
        format!("{} job{} completed", summary.completed, plural(summary.completed))
    } else {
        String::new()
    };
    let ignored_text = if summary.ignored > 0 {
        format!("{} job{} ignored", summary.ignored, plural(summary.ignored))
    } else {
        String::new()
    };
    let sep = if summary.completed > 0 && summary.ignored > 0 {
        ", "
    } else {
        ""
    };
    let prefix = if summary.succeeded { "" } else { "Failed with " };
    format!("{prefix}{steps_text} ({completed_text}{sep}{ignored_text})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_line_matches_reference_wording() {
        let line = format_summary(&RunSummary {
            steps: 3,
            completed: 5,
            ignored: 1,
            succeeded: true,
        });
        assert_eq!(line, "3 steps processed (5 jobs completed, 1 job ignored)");

        let line = format_summary(&RunSummary {
            steps: 1,
            completed: 0,
            ignored: 2,
            succeeded: false,
        });
        assert_eq!(line, "Failed with 1 step processed (2 jobs ignored)");
    }

    #[test]
    fn workflow_prefix_strips_one_index_suffix() {
        assert_eq!(workflow_prefix("align_2"), Some("align"));
        assert_eq!(workflow_prefix("a_b_c"), Some("a_b"));
        assert_eq!(workflow_prefix("align"), None);
    }
}
