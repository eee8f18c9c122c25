//! Cancellation signal delivery

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::debug;

use kiwi_host_api::{HostError, HostResult};

/// Signal that asks an enforcement daemon to end its lease early
pub const CANCEL_SIGNAL: Signal = Signal::SIGUSR2;

/// Deliver the cancellation signal to the daemon with `pid`
pub fn send_cancel(pid: u32) -> HostResult<()> {
    let target = to_pid(pid)?;
    match signal::kill(target, CANCEL_SIGNAL) {
        Ok(()) => {
            debug!(pid, "Sent cancellation signal");
            Ok(())
        }
        Err(Errno::ESRCH) => Err(HostError::Internal(format!("No process with pid {}", pid))),
        Err(e) => Err(HostError::Internal(format!(
            "Failed to signal pid {}: {}",
            pid, e
        ))),
    }
}

/// Whether a process with `pid` exists
pub fn is_alive(pid: u32) -> bool {
    match to_pid(pid) {
        Ok(target) => !matches!(signal::kill(target, None), Err(Errno::ESRCH)),
        Err(_) => false,
    }
}

pub(crate) fn to_pid(pid: u32) -> HostResult<Pid> {
    // Zero and anything past i32 would address process groups
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(Pid::from_raw(raw)),
        _ => Err(HostError::Internal(format!("Invalid pid {}", pid))),
    }
}
