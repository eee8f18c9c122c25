//! kiwi-housekeeper - the enforcement daemon
//!
//! Started on a worker over ssh by `kiwi alloc`. It confirms the lease
//! before detaching, so the ssh exit status tells the client whether the
//! lease took. Afterwards it waits out the lease and reclaims the node.
//!
//! `kiwi-housekeeper kill <user>` delivers the cancellation signal to the
//! daemon enforcing `<user>`'s lease on this worker.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kiwi_core::{DaemonOutcome, Housekeeper};
use kiwi_host_linux::{LinuxReaper, send_cancel};
use kiwi_store::{PidMarker, RecordStore};
use kiwi_util::{Username, default_log_dir};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// kiwi-housekeeper - Enforces one lease on this worker
#[derive(Parser, Debug)]
#[command(name = "kiwi-housekeeper")]
#[command(about = "Enforces one lease on this worker", long_about = None)]
struct Args {
    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Confirm a claimed lease and enforce it until it ends
    Run {
        /// Detach from the terminal once the lease is confirmed
        #[arg(long)]
        detach: bool,

        /// Log directory (default: $XDG_STATE_HOME/kiwi)
        #[arg(long, env = "KIWI_LOG_DIR")]
        log_dir: Option<PathBuf>,

        /// Lease holder
        user: String,

        /// Lease duration in seconds
        seconds: u64,

        /// The node's lease record on shared storage
        record: PathBuf,
    },

    /// Ask the daemon enforcing USER's lease to end it now
    Kill {
        /// Lease holder
        user: String,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    let result = match args.command {
        Command::Run {
            detach,
            log_dir,
            user,
            seconds,
            record,
        } => run(
            &args.log_level,
            detach,
            log_dir.unwrap_or_else(default_log_dir),
            Username::new(user),
            Duration::from_secs(seconds),
            record,
        ),
        Command::Kill { user } => {
            init_stderr_logging(&args.log_level);
            kill(&Username::new(user))
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "kiwi-housekeeper failed");
            eprintln!("kiwi-housekeeper: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(
    log_level: &str,
    detach: bool,
    log_dir: PathBuf,
    user: Username,
    duration: Duration,
    record: PathBuf,
) -> Result<()> {
    init_file_logging(log_level, &log_dir, &user)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        user = %user,
        secs = duration.as_secs(),
        record = %record.display(),
        "kiwi-housekeeper starting"
    );

    let housekeeper = Housekeeper::new(
        RecordStore::open(record),
        user.clone(),
        duration,
        Arc::new(LinuxReaper::new()),
        PidMarker::for_user(&user),
    );

    let snapshot = housekeeper
        .confirm()
        .with_context(|| format!("Failed to confirm lease for {}", user))?;

    if detach {
        // Must happen before the runtime starts any threads
        nix::unistd::daemon(false, false).context("Failed to detach")?;
        info!(pid = std::process::id(), "Detached");
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
    let outcome = runtime.block_on(async {
        let cancel = CancellationToken::new();
        let mut usr2 =
            signal(SignalKind::user_defined2()).context("Failed to create SIGUSR2 handler")?;

        let token = cancel.clone();
        tokio::spawn(async move {
            while usr2.recv().await.is_some() {
                info!("Received cancellation signal");
                token.cancel();
            }
        });

        let outcome = housekeeper.watch(&snapshot, &cancel).await?;
        Ok::<_, anyhow::Error>(outcome)
    })?;

    match outcome {
        DaemonOutcome::Expired | DaemonOutcome::Cancelled => {
            info!(outcome = ?outcome, "Lease reclaimed")
        }
        DaemonOutcome::Superseded | DaemonOutcome::AlreadyReclaimed => {
            info!(outcome = ?outcome, "Exiting without reclaim")
        }
    }
    Ok(())
}

fn kill(user: &Username) -> Result<()> {
    let marker = PidMarker::for_user(user);
    let pid = marker
        .read()
        .with_context(|| format!("No enforcement daemon registered for {}", user))?;

    send_cancel(pid).with_context(|| format!("Failed to signal daemon {} of {}", pid, user))?;
    info!(user = %user, pid, "Cancellation signal delivered");
    Ok(())
}

fn filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}

fn init_stderr_logging(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(filter(log_level))
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

/// Log to `<log_dir>/housekeeper-<user>.log`; a detached daemon has no terminal
fn init_file_logging(log_level: &str, log_dir: &Path, user: &Username) -> Result<()> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let path = log_dir.join(format!("housekeeper-{}.log", user));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter(log_level))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
        .init();
    Ok(())
}
