//! Hub configuration, loaded from TOML with serde defaults.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_PROCS: usize = 4;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;

/// Which optional tap channels this hub binds and which side of the log
/// relay it sits on. A master (or both-mode) hub consumes relayed events
/// from children; a slave hub forwards its own logging to its master.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    Master,
    Slave,
    Both,
}

impl ExecMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecMode::Master => "master",
            ExecMode::Slave => "slave",
            ExecMode::Both => "both",
        }
    }

    /// Does this hub bind the tap logging/listener/handshake channels?
    pub fn taps_bound(&self) -> bool {
        matches!(self, ExecMode::Master | ExecMode::Both)
    }
}

impl Default for ExecMode {
    fn default() -> Self {
        ExecMode::Master
    }
}

impl std::fmt::Display for ExecMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "master" => Ok(ExecMode::Master),
            "slave" => Ok(ExecMode::Slave),
            "both" => Ok(ExecMode::Both),
            other => bail!("unknown exec mode '{other}' (expected master, slave or both)"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub exec_mode: ExecMode,
    /// Ceiling on concurrently running substep workers; also bounded by the
    /// reported active step-process count.
    pub max_procs: usize,
    /// Single-line progress bar on stderr.
    pub progress_bar: bool,
    /// Interactive runs suppress the progress bar even when enabled.
    pub interactive: bool,
    /// Directory for the channel sockets and the endpoints file. A per-pid
    /// directory under the system temp dir when unset.
    pub runtime_dir: Option<PathBuf>,
    /// Where the signature logs live; in-memory stores when unset.
    pub signature_dir: Option<PathBuf>,
    /// Idle workers older than this are sent a stop frame.
    pub worker_idle_timeout_secs: u64,
    /// Substep worker binary; looked up on PATH when unset.
    pub worker_binary: Option<PathBuf>,
    /// The master hub's endpoints file; required in slave mode.
    pub master_endpoints: Option<PathBuf>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            exec_mode: ExecMode::default(),
            max_procs: DEFAULT_MAX_PROCS,
            progress_bar: true,
            interactive: false,
            runtime_dir: None,
            signature_dir: None,
            worker_idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            worker_binary: None,
            master_endpoints: None,
        }
    }
}

impl HubConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read hub config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("malformed hub config {}", path.display()))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_idle_timeout_secs)
    }
}
