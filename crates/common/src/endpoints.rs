//! Channel registry for a running hub.
//!
//! The hub binds one local socket per logical channel and records the bound
//! paths here, keyed by channel name. The registry is saved as JSON in the
//! hub's runtime directory so collaborating processes (step executors, the
//! interactive front-end, substep workers) can discover and connect to them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// File name of the registry inside the hub's runtime directory.
pub const ENDPOINTS_FILE: &str = "endpoints.json";

/// Logical channels a hub can bind. The tap channels exist only in master or
/// both mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Channel {
    SignaturePush,
    SignatureReq,
    ControlPush,
    ControlReq,
    SubstepFrontend,
    SubstepBackend,
    TapLogging,
    TapListener,
    TapHandshake,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::SignaturePush => "signature_push",
            Channel::SignatureReq => "signature_req",
            Channel::ControlPush => "control_push",
            Channel::ControlReq => "control_req",
            Channel::SubstepFrontend => "substep_frontend",
            Channel::SubstepBackend => "substep_backend",
            Channel::TapLogging => "tap_logging",
            Channel::TapListener => "tap_listener",
            Channel::TapHandshake => "tap_handshake",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conventional socket path for a channel inside a runtime directory.
pub fn socket_path(dir: &Path, channel: Channel) -> PathBuf {
    dir.join(format!("{}.sock", channel.as_str()))
}

/// Map from channel name to bound socket path.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Endpoints {
    sockets: BTreeMap<String, PathBuf>,
}

impl Endpoints {
    pub fn insert(&mut self, channel: Channel, path: PathBuf) {
        self.sockets.insert(channel.as_str().to_string(), path);
    }

    pub fn socket(&self, channel: Channel) -> Result<&Path> {
        match self.sockets.get(channel.as_str()) {
            Some(path) => Ok(path),
            None => bail!("channel {} is not bound by this hub", channel),
        }
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.sockets.contains_key(channel.as_str())
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.sockets.values().map(PathBuf::as_path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write endpoints file {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read endpoints file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("malformed endpoints file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut endpoints = Endpoints::default();
        endpoints.insert(Channel::SignaturePush, socket_path(dir.path(), Channel::SignaturePush));
        endpoints.insert(Channel::ControlReq, socket_path(dir.path(), Channel::ControlReq));

        let file = dir.path().join(ENDPOINTS_FILE);
        endpoints.save(&file)?;
        let loaded = Endpoints::load(&file)?;

        assert_eq!(
            loaded.socket(Channel::ControlReq)?,
            socket_path(dir.path(), Channel::ControlReq)
        );
        assert!(!loaded.contains(Channel::TapLogging));
        assert!(loaded.socket(Channel::TapLogging).is_err());
        Ok(())
    }
}
