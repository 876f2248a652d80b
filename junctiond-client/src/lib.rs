//! Client library for the junction coordination hub.
//!
//! An executor holds one persistent push connection per event channel and one
//! request connection per query channel. Requests are strictly one at a time
//! per connection, which is what gives the hub its per-socket FIFO guarantee.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use junction_common::endpoints::{Channel, Endpoints};
use junction_common::framing::{next_frame, next_line, write_frame};
use junction_common::protocol::{
    ControlEvent, ControlRequest, ListenerEvent, LogLevel, LogRecord, ProgressUpdate,
    SignatureEvent, SignatureRequest, StepStatus, WorkerCommand, WorkerSignal, BYE,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("hub disconnected")]
    Disconnected,
    #[error("invalid reply: {0}")]
    InvalidReply(String),
}

struct ReqChannel {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ReqChannel {
    async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer,
        })
    }

    async fn roundtrip<T: Serialize>(&mut self, request: &T) -> Result<Value> {
        write_frame(&mut self.writer, request).await?;
        let raw = next_line(&mut self.reader)
            .await?
            .ok_or(ClientError::Disconnected)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Connection bundle for step executors and front-ends.
pub struct HubClient {
    sig_push: UnixStream,
    ctl_push: UnixStream,
    frontend: UnixStream,
    sig_req: ReqChannel,
    ctl_req: ReqChannel,
}

impl HubClient {
    /// Connect every always-bound channel of a hub.
    pub async fn connect(endpoints: &Endpoints) -> Result<Self> {
        Ok(Self {
            sig_push: UnixStream::connect(endpoints.socket(Channel::SignaturePush)?).await?,
            ctl_push: UnixStream::connect(endpoints.socket(Channel::ControlPush)?).await?,
            frontend: UnixStream::connect(endpoints.socket(Channel::SubstepFrontend)?).await?,
            sig_req: ReqChannel::connect(endpoints.socket(Channel::SignatureReq)?).await?,
            ctl_req: ReqChannel::connect(endpoints.socket(Channel::ControlReq)?).await?,
        })
    }

    // --- signature events (fire and forget) ---

    pub async fn write_workflow_fact(
        &mut self,
        workflow_id: &str,
        entry_type: &str,
        payload: Value,
    ) -> Result<()> {
        write_frame(
            &mut self.sig_push,
            &SignatureEvent::Workflow {
                workflow_id: workflow_id.to_string(),
                entry_type: entry_type.to_string(),
                payload,
            },
        )
        .await
    }

    pub async fn set_step_signature(&mut self, step_id: &str, signature: Value) -> Result<()> {
        write_frame(
            &mut self.sig_push,
            &SignatureEvent::Step {
                step_id: step_id.to_string(),
                signature,
            },
        )
        .await
    }

    pub async fn commit_signatures(&mut self) -> Result<()> {
        write_frame(&mut self.sig_push, &SignatureEvent::Commit).await
    }

    // --- signature queries ---

    pub async fn clear_workflow_facts(&mut self) -> Result<Value> {
        self.sig_req.roundtrip(&SignatureRequest::WorkflowClear).await
    }

    pub async fn workflow_records(&mut self, workflow_id: &str) -> Result<Value> {
        self.sig_req
            .roundtrip(&SignatureRequest::WorkflowRecords {
                workflow_id: workflow_id.to_string(),
            })
            .await
    }

    pub async fn workflow_placeholders(&mut self, workflow_id: &str) -> Result<Value> {
        self.sig_req
            .roundtrip(&SignatureRequest::WorkflowPlaceholders {
                workflow_id: workflow_id.to_string(),
            })
            .await
    }

    /// The stored signature, or JSON null when absent.
    pub async fn step_signature(&mut self, step_id: &str) -> Result<Value> {
        self.sig_req
            .roundtrip(&SignatureRequest::StepGet {
                step_id: step_id.to_string(),
            })
            .await
    }

    // --- control events (fire and forget) ---

    pub async fn set_active_procs(&mut self, count: usize) -> Result<()> {
        write_frame(&mut self.ctl_push, &ControlEvent::Nprocs { count }).await
    }

    pub async fn substep_ignored(&mut self, step: &str) -> Result<()> {
        self.progress(ProgressUpdate::SubstepIgnored {
            step: step.to_string(),
        })
        .await
    }

    pub async fn substep_completed(&mut self, step: &str) -> Result<()> {
        self.progress(ProgressUpdate::SubstepCompleted {
            step: step.to_string(),
        })
        .await
    }

    pub async fn step_completed(
        &mut self,
        status: StepStatus,
        step: &str,
        output: Value,
    ) -> Result<()> {
        self.progress(ProgressUpdate::StepCompleted {
            status,
            step: step.to_string(),
            output,
        })
        .await
    }

    async fn progress(&mut self, update: ProgressUpdate) -> Result<()> {
        write_frame(&mut self.ctl_push, &ControlEvent::Progress { update }).await
    }

    // --- control queries ---

    pub async fn active_procs(&mut self) -> Result<u64> {
        let reply = self.ctl_req.roundtrip(&ControlRequest::Nprocs).await?;
        reply
            .as_u64()
            .ok_or_else(|| ClientError::InvalidReply(reply.to_string()).into())
    }

    pub async fn has_step(&mut self, name: &str) -> Result<bool> {
        let reply = self
            .ctl_req
            .roundtrip(&ControlRequest::HasStep {
                name: name.to_string(),
            })
            .await?;
        reply
            .as_bool()
            .ok_or_else(|| ClientError::InvalidReply(reply.to_string()).into())
    }

    pub async fn step_output(&mut self, name: &str) -> Result<Value> {
        self.ctl_req
            .roundtrip(&ControlRequest::StepOutput {
                name: name.to_string(),
            })
            .await
    }

    pub async fn named_output(&mut self, label: &str) -> Result<Value> {
        self.ctl_req
            .roundtrip(&ControlRequest::NamedOutput {
                label: label.to_string(),
            })
            .await
    }

    /// Ask the hub to drain every channel and shut down; resolves once the
    /// hub has acknowledged with `bye`.
    pub async fn done(&mut self, succeeded: bool) -> Result<()> {
        let reply = self
            .ctl_req
            .roundtrip(&ControlRequest::Done { succeeded })
            .await?;
        if reply.as_str() == Some(BYE) {
            Ok(())
        } else {
            Err(ClientError::InvalidReply(reply.to_string()).into())
        }
    }

    // --- substep dispatch ---

    /// Fire-and-forget a unit of work into the frontend queue; the payload is
    /// opaque to the hub.
    pub async fn submit_substep(&mut self, payload: &Value) -> Result<()> {
        write_frame(&mut self.frontend, payload).await
    }
}

/// Worker side of the load-balancer contract: send `ready` on start and after
/// every finished unit, exit on `stop`.
pub struct WorkerConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl WorkerConnection {
    pub async fn connect(endpoints: &Endpoints) -> Result<Self> {
        let stream = UnixStream::connect(endpoints.socket(Channel::SubstepBackend)?).await?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer,
        })
    }

    pub async fn ready(&mut self) -> Result<()> {
        write_frame(&mut self.writer, &WorkerSignal::Ready).await
    }

    /// Next command from the hub; `None` when the hub went away.
    pub async fn next_command(&mut self) -> Result<Option<WorkerCommand>> {
        next_frame(&mut self.reader).await
    }
}

/// Push relayed log records into a master hub (slave executors).
pub struct LogRelay {
    stream: UnixStream,
}

impl LogRelay {
    pub async fn connect(endpoints: &Endpoints) -> Result<Self> {
        Ok(Self {
            stream: UnixStream::connect(endpoints.socket(Channel::TapLogging)?).await?,
        })
    }

    pub async fn send(&mut self, level: LogLevel, message: &str) -> Result<()> {
        write_frame(
            &mut self.stream,
            &LogRecord {
                level,
                message: message.to_string(),
            },
        )
        .await
    }
}

/// Push interactive front-end events into a master hub.
pub struct ListenerRelay {
    stream: UnixStream,
}

impl ListenerRelay {
    pub async fn connect(endpoints: &Endpoints) -> Result<Self> {
        Ok(Self {
            stream: UnixStream::connect(endpoints.socket(Channel::TapListener)?).await?,
        })
    }

    pub async fn send(&mut self, msg_type: &str, data: Value) -> Result<()> {
        write_frame(
            &mut self.stream,
            &ListenerEvent {
                msg_type: msg_type.to_string(),
                data,
            },
        )
        .await
    }
}
