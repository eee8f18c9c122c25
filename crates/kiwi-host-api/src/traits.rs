//! Host traits

use async_trait::async_trait;
use kiwi_util::{LeaseError, NodeName, Username};
use std::time::Duration;
use thiserror::Error;

/// Errors from host operations
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Failed to start enforcement daemon on {node}: {reason}")]
    StartFailed { node: NodeName, reason: String },

    #[error("Failed to signal enforcement daemon on {node}: {reason}")]
    SignalFailed { node: NodeName, reason: String },

    #[error("Interactive shell on {node} failed: {reason}")]
    ShellFailed { node: NodeName, reason: String },

    #[error("Unknown user: {0}")]
    UnknownUser(Username),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type HostResult<T> = Result<T, HostError>;

impl From<HostError> for LeaseError {
    fn from(e: HostError) -> Self {
        LeaseError::remote(e.to_string())
    }
}

/// Where a worker's remote actions are sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTarget {
    pub name: NodeName,
    pub host: String,
    pub port: u16,
}

impl WorkerTarget {
    pub fn new(name: NodeName, host: impl Into<String>, port: u16) -> Self {
        Self {
            name,
            host: host.into(),
            port,
        }
    }
}

/// Outcome of terminating one user's processes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Processes that accepted the termination request
    pub signalled: Vec<u32>,
    /// Processes the request could not be delivered to, with the reason
    pub failed: Vec<(u32, String)>,
}

/// Runs lease actions on a worker node on behalf of a user
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Start the enforcement daemon for `user` on the worker.
    ///
    /// Returns once the daemon has confirmed the lease and detached, so an
    /// `Err` means the lease was not confirmed.
    async fn start_daemon(
        &self,
        target: &WorkerTarget,
        user: &Username,
        duration: Duration,
    ) -> HostResult<()>;

    /// Deliver the cancellation signal to `user`'s daemon on the worker
    async fn signal_daemon(&self, target: &WorkerTarget, user: &Username) -> HostResult<()>;

    /// Open an interactive shell on the worker and wait for it to exit.
    /// Returns the shell's exit code when it has one.
    async fn open_shell(&self, target: &WorkerTarget, user: &Username) -> HostResult<Option<i32>>;
}

/// Terminates every process of one user on the local machine
pub trait ProcessReaper: Send + Sync {
    /// Request termination of all of `user`'s processes except the caller.
    /// Per-process failures are reported, not returned as errors.
    fn terminate_user_processes(&self, user: &Username) -> HostResult<ReapReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_errors_become_remote_failures() {
        let err: LeaseError = HostError::StartFailed {
            node: NodeName::new("gpu1"),
            reason: "exit status 255".into(),
        }
        .into();

        assert!(matches!(err, LeaseError::RemoteActionFailed(_)));
        assert!(err.to_string().contains("gpu1"));
    }
}
