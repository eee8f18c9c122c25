//! Remote execution over ssh

use async_trait::async_trait;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use kiwi_host_api::{HostError, HostResult, RemoteExecutor, WorkerTarget};
use kiwi_util::{Username, record_path};

/// Name of the enforcement daemon binary inside the install directory
pub const HOUSEKEEPER_BIN: &str = "kiwi-housekeeper";

/// Runs lease actions on workers by invoking `ssh` as the leasing user
#[derive(Debug, Clone)]
pub struct SshExecutor {
    ssh_program: String,
    install_path: PathBuf,
    worker_shared_path: PathBuf,
}

impl SshExecutor {
    /// `install_path` and `worker_shared_path` are as seen from the workers
    pub fn new(install_path: impl Into<PathBuf>, worker_shared_path: impl Into<PathBuf>) -> Self {
        Self {
            ssh_program: "ssh".into(),
            install_path: install_path.into(),
            worker_shared_path: worker_shared_path.into(),
        }
    }

    pub fn with_ssh_program(mut self, program: impl Into<String>) -> Self {
        self.ssh_program = program.into();
        self
    }

    fn housekeeper(&self) -> PathBuf {
        self.install_path.join(HOUSEKEEPER_BIN)
    }

    fn command(&self, target: &WorkerTarget, user: &Username, remote: Option<String>) -> Command {
        let mut cmd = Command::new(&self.ssh_program);
        cmd.args(ssh_args(target, user, remote.is_none()));
        if let Some(remote) = remote {
            cmd.arg(remote);
        }
        cmd.stdin(Stdio::null());
        cmd
    }
}

/// Arguments for `ssh` up to and including the destination
pub fn ssh_args(target: &WorkerTarget, user: &Username, interactive: bool) -> Vec<String> {
    let mut args = Vec::new();
    if interactive {
        args.push("-t".to_string());
    }
    args.push("-p".to_string());
    args.push(target.port.to_string());
    args.push(format!("{}@{}", user, target.host));
    args
}

/// Worker-side command line that starts the daemon detached
pub fn remote_start_command(
    housekeeper: &Path,
    user: &Username,
    duration: Duration,
    record: &Path,
) -> String {
    let words = [
        housekeeper.to_string_lossy(),
        Cow::Borrowed("run"),
        Cow::Borrowed("--detach"),
        Cow::Borrowed(user.as_str()),
        Cow::Owned(duration.as_secs().to_string()),
        record.to_string_lossy(),
    ];
    join_escaped(words)
}

/// Worker-side command line that cancels `user`'s lease
pub fn remote_kill_command(housekeeper: &Path, user: &Username) -> String {
    let words = [
        housekeeper.to_string_lossy(),
        Cow::Borrowed("kill"),
        Cow::Borrowed(user.as_str()),
    ];
    join_escaped(words)
}

fn join_escaped<'a>(words: impl IntoIterator<Item = Cow<'a, str>>) -> String {
    words
        .into_iter()
        .map(|w| shell_escape::unix::escape(w).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn describe_failure(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        output.status.to_string()
    } else {
        format!("{}: {}", output.status, stderr)
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn start_daemon(
        &self,
        target: &WorkerTarget,
        user: &Username,
        duration: Duration,
    ) -> HostResult<()> {
        let record = record_path(&self.worker_shared_path, target.name.as_str());
        let remote = remote_start_command(&self.housekeeper(), user, duration, &record);
        debug!(node = %target.name, command = %remote, "Starting enforcement daemon");

        let output = self
            .command(target, user, Some(remote))
            .output()
            .await
            .map_err(|e| HostError::StartFailed {
                node: target.name.clone(),
                reason: format!("failed to run {}: {}", self.ssh_program, e),
            })?;

        if !output.status.success() {
            return Err(HostError::StartFailed {
                node: target.name.clone(),
                reason: describe_failure(&output),
            });
        }

        info!(node = %target.name, user = %user, secs = duration.as_secs(), "Enforcement daemon started");
        Ok(())
    }

    async fn signal_daemon(&self, target: &WorkerTarget, user: &Username) -> HostResult<()> {
        let remote = remote_kill_command(&self.housekeeper(), user);
        debug!(node = %target.name, command = %remote, "Signalling enforcement daemon");

        let output = self
            .command(target, user, Some(remote))
            .output()
            .await
            .map_err(|e| HostError::SignalFailed {
                node: target.name.clone(),
                reason: format!("failed to run {}: {}", self.ssh_program, e),
            })?;

        if !output.status.success() {
            return Err(HostError::SignalFailed {
                node: target.name.clone(),
                reason: describe_failure(&output),
            });
        }
        Ok(())
    }

    async fn open_shell(&self, target: &WorkerTarget, user: &Username) -> HostResult<Option<i32>> {
        let mut cmd = self.command(target, user, None);
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let status = cmd.status().await.map_err(|e| HostError::ShellFailed {
            node: target.name.clone(),
            reason: e.to_string(),
        })?;

        if !status.success() {
            warn!(node = %target.name, status = %status, "Interactive shell exited abnormally");
        }
        Ok(status.code())
    }
}
