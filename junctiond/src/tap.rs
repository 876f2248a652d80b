//! Tapping: relaying log and front-end events between companion hubs.
//!
//! A master (or both-mode) hub consumes frames from its children; a slave hub
//! answers the master's handshake pings and forwards its own logging through
//! [`RelayLayer`].

use std::io::Write as _;
use std::sync::Mutex;

use anyhow::{Context as _, Result};
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use junction_common::config::ExecMode;
use junction_common::endpoints::{Channel, Endpoints};
use junction_common::framing::{next_line, write_frame};
use junction_common::protocol::{Handshake, ListenerEvent, LogLevel, LogRecord};

/// Re-emit a relayed log record through this hub's own logging; in both mode
/// the record goes verbatim to stdout.
pub(crate) fn emit_log_record(record: &LogRecord, mode: ExecMode) {
    if mode == ExecMode::Both {
        println!("{}", record.message);
        return;
    }
    match record.level {
        LogLevel::Error => error!(target: "relay", "{}", record.message),
        LogLevel::Warn => warn!(target: "relay", "{}", record.message),
        LogLevel::Info => info!(target: "relay", "{}", record.message),
        LogLevel::Debug => debug!(target: "relay", "{}", record.message),
        LogLevel::Trace => tracing::trace!(target: "relay", "{}", record.message),
        LogLevel::Print => println!("{}", record.message),
    }
}

/// Destination for interactive-front-end events relayed by child hubs.
pub trait ListenerSink: Send {
    fn forward(&mut self, event: &ListenerEvent);
}

/// Default sink when no front-end is attached.
pub struct LogListenerSink;

impl ListenerSink for LogListenerSink {
    fn forward(&mut self, event: &ListenerEvent) {
        debug!(msg_type = %event.msg_type, "Dropping listener event (no front-end attached)");
    }
}

/// Master side of the mode handshake: ping each connecting companion hub and
/// hold the connection open so the companion can watch for master exit.
pub(crate) fn spawn_handshake_listener(listener: UnixListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let stream = match listener.accept().await {
                Ok((stream, _addr)) => stream,
                Err(err) => {
                    warn!("Handshake accept failed: {}", err);
                    continue;
                }
            };
            tokio::spawn(async move {
                if let Err(err) = greet(stream).await {
                    warn!("Handshake with companion hub failed: {:#}", err);
                }
            });
        }
    })
}

async fn greet(stream: UnixStream) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    write_frame(&mut write_half, &Handshake::Ping).await?;
    let mut reader = BufReader::new(read_half);
    match next_line(&mut reader).await? {
        Some(raw) if matches!(serde_json::from_str(&raw), Ok(Handshake::Ok)) => {
            info!("Companion hub attached");
        }
        other => anyhow::bail!("unexpected handshake reply: {:?}", other),
    }
    while next_line(&mut reader).await?.is_some() {}
    Ok(())
}

/// Slave side: connect to the master's handshake channel and answer pings.
pub(crate) fn spawn_handshake_client(master: Endpoints) -> JoinHandle<()> {
    tokio::spawn(async move {
        match handshake_loop(&master).await {
            Ok(()) => debug!("Master handshake channel closed"),
            Err(err) => warn!("Lost handshake channel to master hub: {:#}", err),
        }
    })
}

async fn handshake_loop(master: &Endpoints) -> Result<()> {
    let path = master.socket(Channel::TapHandshake)?;
    let stream = UnixStream::connect(path)
        .await
        .with_context(|| format!("failed to connect to master handshake at {}", path.display()))?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    while let Some(raw) = next_line(&mut reader).await? {
        match serde_json::from_str::<Handshake>(&raw) {
            Ok(Handshake::Ping) => write_frame(&mut write_half, &Handshake::Ok).await?,
            _ => warn!("Unexpected handshake frame: {:?}", raw),
        }
    }
    Ok(())
}

/// `tracing` layer that forwards this process's log events to the master
/// hub's logging channel (slave mode).
pub struct RelayLayer {
    stream: Mutex<std::os::unix::net::UnixStream>,
}

impl RelayLayer {
    pub fn connect(master: &Endpoints) -> Result<Self> {
        let path = master.socket(Channel::TapLogging)?;
        let stream = std::os::unix::net::UnixStream::connect(path).with_context(|| {
            format!("failed to connect to master logging channel at {}", path.display())
        })?;
        Ok(Self {
            stream: Mutex::new(stream),
        })
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for RelayLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let metadata_level = *event.metadata().level();
        let level = if metadata_level == tracing::Level::ERROR {
            LogLevel::Error
        } else if metadata_level == tracing::Level::WARN {
            LogLevel::Warn
        } else if metadata_level == tracing::Level::INFO {
            LogLevel::Info
        } else if metadata_level == tracing::Level::DEBUG {
            LogLevel::Debug
        } else {
            LogLevel::Trace
        };
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let record = LogRecord {
            level,
            message: visitor.0,
        };
        if let Ok(line) = serde_json::to_string(&record) {
            if let Ok(mut stream) = self.stream.lock() {
                let _ = writeln!(stream, "{}", line);
            }
        }
    }
}

#[derive(Default)]
struct MessageVisitor(String);

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        use std::fmt::Write as _;
        if field.name() == "message" {
            let mut message = format!("{:?}", value);
            if !self.0.is_empty() {
                let _ = write!(message, " {}", self.0);
            }
            self.0 = message;
        } else {
            if !self.0.is_empty() {
                self.0.push(' ');
            }
            let _ = write!(self.0, "{}={:?}", field.name(), value);
        }
    }
}
