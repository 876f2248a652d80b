//! Socket plumbing.
//!
//! One Unix listener per logical channel; connection tasks only parse frames
//! and forward them over channels to the hub core, which owns all state.
//! Per-socket FIFO falls out of the connection tasks reading, forwarding and
//! (for requests) awaiting the reply strictly in order.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use junction_common::endpoints::{socket_path, Channel};
use junction_common::framing::{next_line, write_frame};
use junction_common::protocol::{WorkerCommand, WorkerSignal};

pub(crate) type ReqSender<T> = mpsc::UnboundedSender<(T, oneshot::Sender<Value>)>;

/// What the backend channel reports to the pool.
pub(crate) enum BackendEvent {
    Connected {
        id: Uuid,
        link: mpsc::UnboundedSender<WorkerCommand>,
    },
    Ready {
        id: Uuid,
    },
    Gone {
        id: Uuid,
    },
}

pub(crate) fn bind(dir: &Path, channel: Channel) -> Result<(UnixListener, PathBuf)> {
    let path = socket_path(dir, channel);
    // Remove a stale socket from a previous run
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)
        .with_context(|| format!("failed to bind {} socket at {}", channel, path.display()))?;
    Ok((listener, path))
}

/// Fire-and-forget channel: parsed frames are forwarded in arrival order, a
/// bad frame is logged and dropped.
pub(crate) fn spawn_push_listener<T>(
    channel: Channel,
    listener: UnixListener,
    tx: mpsc::UnboundedSender<T>,
) -> JoinHandle<()>
where
    T: DeserializeOwned + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let stream = match listener.accept().await {
                Ok((stream, _addr)) => stream,
                Err(err) => {
                    warn!(%channel, "Accept failed: {}", err);
                    continue;
                }
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Err(err) = pump_push(channel, stream, tx).await {
                    debug!(%channel, "Push connection closed: {}", err);
                }
            });
        }
    })
}

async fn pump_push<T>(
    channel: Channel,
    stream: UnixStream,
    tx: mpsc::UnboundedSender<T>,
) -> Result<()>
where
    T: DeserializeOwned,
{
    let mut reader = BufReader::new(stream);
    while let Some(raw) = next_line(&mut reader).await? {
        match serde_json::from_str::<T>(&raw) {
            Ok(frame) => {
                if tx.send(frame).is_err() {
                    break; // hub is gone
                }
            }
            Err(err) => warn!(%channel, "Dropping unrecognized message {:?}: {}", raw, err),
        }
    }
    Ok(())
}

/// Request/reply channel: exactly one reply per request, in order. A request
/// that cannot be parsed is answered with JSON null so the caller is never
/// left blocked.
pub(crate) fn spawn_req_listener<T>(
    channel: Channel,
    listener: UnixListener,
    tx: ReqSender<T>,
) -> JoinHandle<()>
where
    T: DeserializeOwned + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let stream = match listener.accept().await {
                Ok((stream, _addr)) => stream,
                Err(err) => {
                    warn!(%channel, "Accept failed: {}", err);
                    continue;
                }
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Err(err) = pump_req(channel, stream, tx).await {
                    debug!(%channel, "Request connection closed: {}", err);
                }
            });
        }
    })
}

async fn pump_req<T>(channel: Channel, stream: UnixStream, tx: ReqSender<T>) -> Result<()>
where
    T: DeserializeOwned,
{
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    while let Some(raw) = next_line(&mut reader).await? {
        let request = match serde_json::from_str::<T>(&raw) {
            Ok(request) => request,
            Err(err) => {
                warn!(%channel, "Unrecognized request {:?}: {}", raw, err);
                write_frame(&mut write_half, &Value::Null).await?;
                continue;
            }
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if tx.send((request, reply_tx)).is_err() {
            break; // hub is gone
        }
        let reply = reply_rx.await.unwrap_or(Value::Null);
        write_frame(&mut write_half, &reply).await?;
    }
    Ok(())
}

/// Substep backend channel: each connection is one worker. Only ready tokens
/// are legal from the worker side; anything else breaks the pool contract and
/// aborts this connection's handling.
pub(crate) fn spawn_backend_listener(
    listener: UnixListener,
    tx: mpsc::UnboundedSender<BackendEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let stream = match listener.accept().await {
                Ok((stream, _addr)) => stream,
                Err(err) => {
                    warn!("Backend accept failed: {}", err);
                    continue;
                }
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let id = Uuid::new_v4();
                if let Err(err) = pump_worker(id, stream, tx).await {
                    error!(worker = %id, "Substep worker connection aborted: {:#}", err);
                }
            });
        }
    })
}

async fn pump_worker(
    id: Uuid,
    stream: UnixStream,
    tx: mpsc::UnboundedSender<BackendEvent>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let (link, mut commands) = mpsc::unbounded_channel::<WorkerCommand>();
    if tx.send(BackendEvent::Connected { id, link }).is_err() {
        return Ok(());
    }

    let writer = tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            let stop = matches!(command, WorkerCommand::Stop);
            if write_frame(&mut write_half, &command).await.is_err() {
                break;
            }
            if stop {
                break;
            }
        }
    });

    let mut reader = BufReader::new(read_half);
    let result = loop {
        match next_line(&mut reader).await {
            Ok(Some(raw)) => match serde_json::from_str::<WorkerSignal>(&raw) {
                Ok(WorkerSignal::Ready) => {
                    if tx.send(BackendEvent::Ready { id }).is_err() {
                        break Ok(());
                    }
                }
                Err(_) => {
                    break Err(anyhow::anyhow!(
                        "substep worker may only send ready tokens, received {:?}",
                        raw
                    ))
                }
            },
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        }
    };
    let _ = tx.send(BackendEvent::Gone { id });
    writer.abort();
    result
}
