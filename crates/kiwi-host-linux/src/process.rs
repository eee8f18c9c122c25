//! Process reaping by owner

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{Uid, User};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use kiwi_host_api::{HostError, HostResult, ProcessReaper, ReapReport};
use kiwi_util::Username;

use crate::signal::to_pid;

/// Terminates a user's processes with SIGTERM
///
/// Processes are found by the owner of their `/proc/<pid>` entry. The
/// calling process is always skipped, so a daemon running as the user it
/// reaps survives long enough to release the lease.
#[derive(Debug, Clone)]
pub struct LinuxReaper {
    proc_root: PathBuf,
}

impl LinuxReaper {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }

    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    fn resolve_uid(user: &Username) -> HostResult<Uid> {
        match User::from_name(user.as_str()) {
            Ok(Some(entry)) => Ok(entry.uid),
            Ok(None) => Err(HostError::UnknownUser(user.clone())),
            Err(e) => Err(HostError::Internal(format!(
                "Failed to look up user {}: {}",
                user, e
            ))),
        }
    }
}

impl Default for LinuxReaper {
    fn default() -> Self {
        Self::new()
    }
}

/// Pids under `proc_root` whose entry is owned by `uid`, ascending
pub fn pids_owned_by(proc_root: &Path, uid: Uid) -> HostResult<Vec<u32>> {
    let mut pids = Vec::new();
    for entry in std::fs::read_dir(proc_root)? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // Processes exit while we scan
        let Ok(meta) = entry.metadata() else { continue };
        if meta.uid() == uid.as_raw() {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    Ok(pids)
}

impl ProcessReaper for LinuxReaper {
    fn terminate_user_processes(&self, user: &Username) -> HostResult<ReapReport> {
        let uid = Self::resolve_uid(user)?;
        let own_pid = std::process::id();
        let mut report = ReapReport::default();

        for pid in pids_owned_by(&self.proc_root, uid)? {
            if pid == own_pid {
                continue;
            }
            let target = match to_pid(pid) {
                Ok(target) => target,
                Err(e) => {
                    report.failed.push((pid, e.to_string()));
                    continue;
                }
            };

            match signal::kill(target, Signal::SIGTERM) {
                Ok(()) => {
                    debug!(pid, user = %user, "Sent SIGTERM");
                    report.signalled.push(pid);
                }
                Err(Errno::ESRCH) => {
                    // Already gone
                }
                Err(e) => {
                    warn!(pid, user = %user, error = %e, "Failed to terminate process");
                    report.failed.push((pid, e.to_string()));
                }
            }
        }

        info!(
            user = %user,
            signalled = report.signalled.len(),
            failed = report.failed.len(),
            "User processes terminated"
        );
        Ok(report)
    }
}
