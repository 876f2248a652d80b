//! Wire frames exchanged with the hub.
//!
//! Every frame is one JSON object per line whose `type` field is the
//! discriminator the hub dispatches on. Push channels are fire-and-forget;
//! request channels get exactly one reply per frame, a bare JSON value
//! (`null` is the absent/error sentinel so a requester is never left
//! blocked).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reply to the `done` request once every queue has been drained.
pub const BYE: &str = "bye";
/// Reply to state-changing signature requests.
pub const OK: &str = "ok";

/// Facts written through the signature push channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignatureEvent {
    /// Append a workflow-level fact.
    Workflow {
        workflow_id: String,
        entry_type: String,
        payload: Value,
    },
    /// Set (or overwrite) one step's signature.
    Step { step_id: String, signature: Value },
    /// Flush the write-ahead buffers of both stores.
    Commit,
}

/// Queries served on the signature request channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignatureRequest {
    WorkflowClear,
    WorkflowPlaceholders { workflow_id: String },
    WorkflowRecords { workflow_id: String },
    StepGet { step_id: String },
}

/// Fire-and-forget events on the control push channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    /// Scheduler feedback: number of concurrently running step processes.
    Nprocs { count: usize },
    Progress { update: ProgressUpdate },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressUpdate {
    SubstepIgnored { step: String },
    SubstepCompleted { step: String },
    StepCompleted { status: StepStatus, step: String, output: Value },
}

/// How much of a finished step actually ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Every substep executed and the step carries a final signature.
    Complete,
    /// Every substep was restored from signatures; nothing ran.
    Skipped,
    /// Some substeps ran, the rest were restored.
    Partial,
    /// The step finished without any signature.
    Untracked,
}

/// Queries served on the control request channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    Nprocs,
    /// Is this step name (or a step of this workflow) completed?
    HasStep { name: String },
    /// Output handle of a completed step; for a workflow name, the
    /// lexicographically last step of that workflow.
    StepOutput { name: String },
    /// First completed-step output carrying this label.
    NamedOutput { label: String },
    /// Drain everything and shut the hub down.
    Done { succeeded: bool },
}

/// Worker-to-hub frames on the substep backend channel. Anything else on
/// that channel is a contract violation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerSignal {
    /// Credit: ready for the next unit of work.
    Ready,
}

/// Hub-to-worker frames on the substep backend channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// A unit of work pulled from the frontend queue; the payload is opaque
    /// to the hub.
    Job { payload: Value },
    /// Poison frame: the worker should exit.
    Stop,
}

/// A log event relayed from a child hub to its master.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
    /// Verbatim console output, bypassing level filtering.
    Print,
}

/// An interactive-front-end event relayed through the tap listener channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListenerEvent {
    pub msg_type: String,
    pub data: Value,
}

/// Mode-handshake frames between companion hubs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Handshake {
    Ping,
    Ok,
}
