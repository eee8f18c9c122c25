//! PID markers for enforcement daemons
//!
//! A marker names the daemon process enforcing one user's lease on this
//! worker. `kill` reads it to find whom to signal; the daemon removes it on
//! the way out, but only while it still names the daemon itself.

use kiwi_util::{Username, pid_marker_path, pid_marker_path_in};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct PidMarker {
    path: PathBuf,
}

impl PidMarker {
    /// Marker in the default runtime directory
    pub fn for_user(user: &Username) -> Self {
        Self {
            path: pid_marker_path(user.as_str()),
        }
    }

    pub fn in_dir(dir: &Path, user: &Username) -> Self {
        Self {
            path: pid_marker_path_in(dir, user.as_str()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record `pid`, replacing whatever an earlier daemon left behind
    pub fn write(&self, pid: u32) -> StoreResult<()> {
        std::fs::write(&self.path, pid.to_string())?;
        debug!(path = %self.path.display(), pid, "PID marker written");
        Ok(())
    }

    pub fn read(&self) -> StoreResult<u32> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StoreError::NotFound(self.path.clone()),
            _ => StoreError::Io(e),
        })?;

        content.trim().parse().map_err(|_| StoreError::Malformed {
            path: self.path.clone(),
            reason: format!("not a process id: '{}'", content.trim()),
        })
    }

    /// Remove the marker if it still names `pid`. Returns whether it did.
    pub fn remove_if_owned(&self, pid: u32) -> StoreResult<bool> {
        match self.read() {
            Ok(found) if found == pid => {}
            Ok(_) => return Ok(false),
            Err(e) if e.is_vanished_or_malformed() => return Ok(false),
            Err(e) => return Err(e),
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
