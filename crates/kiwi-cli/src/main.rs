//! kiwi - operator tool for worker node leases
//!
//! Resolves the shared directory from the command line or the install-side
//! local configuration, loads the cluster configuration found there, and
//! runs one lease operation.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use kiwi_config::{LocalConfig, RawWorker, load_config};
use kiwi_core::{
    DEFAULT_STALE_INIT_GRACE, KillOutcome, LeaseClient, NodeStatus, init_master, register_node,
};
use kiwi_host_linux::SshExecutor;
use kiwi_store::{LeaseState, NodeDirectory};
use kiwi_util::{NodeName, Username, config_path, default_local_config_path, format_epoch};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// kiwi - Exclusive leases on shared worker nodes
#[derive(Parser, Debug)]
#[command(name = "kiwi")]
#[command(about = "Exclusive leases on shared worker nodes", long_about = None)]
struct Args {
    /// Shared directory override (or set KIWI_SHARED_PATH env var)
    #[arg(short, long, env = "KIWI_SHARED_PATH", global = true)]
    shared_path: Option<PathBuf>,

    /// Install-side configuration listing the shared directories
    #[arg(long, env = "KIWI_LOCAL_CONFIG", default_value_os_t = default_local_config_path(), global = true)]
    local_config: PathBuf,

    /// Partition label (default: first partition)
    #[arg(short, long, global = true)]
    partition: Option<String>,

    /// Log level
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lease a node
    Alloc {
        #[command(flatten)]
        lease: LeaseArgs,
    },

    /// Lease a node, open a shell on it, and end the lease when the shell exits
    Run {
        #[command(flatten)]
        lease: LeaseArgs,
    },

    /// End a lease
    Kill {
        /// Node to release
        #[arg(short, long)]
        worker: String,

        /// Lease holder (default: you)
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Show every node and who holds it
    Info,

    /// Roll back claims no daemon ever confirmed
    Reap {
        /// Age in seconds after which an unconfirmed claim is abandoned
        #[arg(long, default_value_t = DEFAULT_STALE_INIT_GRACE.as_secs())]
        grace: u64,
    },

    /// Create the shared directory, an empty configuration, and switch the login gate on
    InitMaster,

    /// Register a worker node and create its idle record
    AddNode {
        #[arg(long)]
        name: String,

        /// SSH host name or address
        #[arg(long)]
        host: String,

        #[arg(long, default_value_t = 22)]
        port: u16,

        /// Reservation windows, e.g. "09:00-18:00,22:00-02:00"
        #[arg(long)]
        reservation: Option<String>,

        #[arg(long)]
        label: Option<String>,
    },

    /// Add a shared directory to the local configuration, or relabel it
    AddPartition {
        path: PathBuf,

        label: String,
    },
}

#[derive(clap::Args, Debug)]
struct LeaseArgs {
    /// Node to lease
    #[arg(short, long)]
    worker: String,

    /// Lease holder (default: you)
    #[arg(short, long)]
    user: Option<String>,

    /// Lease duration in seconds
    #[arg(short = 't', long, default_value_t = 3600)]
    time: u64,
}

fn resolve_shared(
    shared_path: Option<&PathBuf>,
    local_config: &Path,
    partition: Option<&str>,
) -> Result<PathBuf> {
    if let Some(path) = shared_path {
        return Ok(path.clone());
    }

    let local = LocalConfig::load(local_config).with_context(|| {
        format!("Failed to read local configuration {}", local_config.display())
    })?;
    Ok(local.shared_path(partition)?.to_path_buf())
}

fn add_partition(local_config: &Path, path: PathBuf, label: String) -> Result<()> {
    let mut local = if local_config.exists() {
        LocalConfig::load(local_config)?
    } else {
        LocalConfig::default()
    };
    println!("Partition {} -> {}", label, path.display());
    local.set_partition(path, label);
    std::fs::write(local_config, local.render())
        .with_context(|| format!("Failed to write {}", local_config.display()))?;
    Ok(())
}

fn invoking_user() -> Result<Username> {
    let user = nix::unistd::User::from_uid(nix::unistd::Uid::current())
        .context("Failed to look up the invoking user")?
        .context("The invoking user has no passwd entry")?;
    Ok(Username::new(user.name))
}

fn resolve_user(user: Option<String>) -> Result<Username> {
    let user = match user {
        Some(name) => Username::new(name),
        None => invoking_user()?,
    };
    if !user.is_valid() {
        bail!("Invalid user name '{}'", user);
    }
    Ok(user)
}

fn client(shared: PathBuf) -> Result<LeaseClient<SshExecutor>> {
    let config_file = config_path(&shared);
    let config = load_config(&config_file)
        .with_context(|| format!("Failed to load config from {}", config_file.display()))?;
    debug!(workers = config.workers.len(), "Configuration loaded");

    let worker_shared = config
        .worker_shared_path
        .clone()
        .unwrap_or_else(|| shared.clone());
    let executor = SshExecutor::new(config.worker_install_path.clone(), worker_shared);

    Ok(LeaseClient::new(config, NodeDirectory::new(shared), executor))
}

fn print_table(statuses: &[NodeStatus]) {
    println!(
        "{:<16} {:<16} {:>8} {:<20} {:>10}",
        "Node", "User", "JobId", "Start", "Duration"
    );
    for status in statuses {
        match &status.record {
            Ok(record) if record.state.is_idle() => {
                println!("{:<16} {}", status.node, record.state);
            }
            Ok(record) => println!(
                "{:<16} {:<16} {:>8} {:<20} {:>10}",
                status.node,
                record.state,
                record.job_id,
                format_epoch(record.start),
                record.duration
            ),
            Err(e) => println!("{:<16} <unreadable: {}>", status.node, e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    let Args {
        shared_path,
        local_config,
        partition,
        command,
        ..
    } = args;
    let shared = || {
        let shared = resolve_shared(shared_path.as_ref(), &local_config, partition.as_deref())?;
        info!(shared = %shared.display(), "Using shared directory");
        Ok::<_, anyhow::Error>(shared)
    };

    match command {
        Command::Alloc { lease } => {
            let client = client(shared()?)?;
            let node = NodeName::new(lease.worker);
            let user = resolve_user(lease.user)?;

            let record = client
                .allocate(&node, &user, Duration::from_secs(lease.time))
                .await
                .with_context(|| format!("Failed to allocate {}", node))?;
            println!(
                "{} allocated to {} for {}s (job {})",
                node, user, record.duration, record.job_id
            );
        }
        Command::Run { lease } => {
            let client = client(shared()?)?;
            let node = NodeName::new(lease.worker);
            let user = resolve_user(lease.user)?;

            let code = client
                .run(&node, &user, Duration::from_secs(lease.time))
                .await
                .with_context(|| format!("Failed to run on {}", node))?;
            debug!(code = ?code, "Shell exited");
        }
        Command::Kill { worker, user } => {
            let client = client(shared()?)?;
            let node = NodeName::new(worker);
            let user = resolve_user(user)?;

            let outcome = client
                .kill(&node, &user)
                .await
                .with_context(|| format!("Failed to release {}", node))?;
            match outcome {
                KillOutcome::RolledBack => println!("Claim on {} rolled back", node),
                KillOutcome::Signalled => println!("Lease on {} is ending", node),
            }
        }
        Command::Info => {
            let client = client(shared()?)?;
            print_table(&client.list()?);
        }
        Command::Reap { grace } => {
            let client = client(shared()?)?;
            let reaped = client.reconcile(Duration::from_secs(grace))?;
            for (node, record) in &reaped {
                if let LeaseState::Initializing(user) = &record.state {
                    println!("{}: abandoned claim by {} (job {}) rolled back", node, user, record.job_id);
                }
            }
            println!("{} claim(s) rolled back", reaped.len());
        }
        Command::InitMaster => {
            let shared = shared()?;
            init_master(&shared)
                .with_context(|| format!("Failed to initialize {}", shared.display()))?;
            println!(
                "Initialized {}. Edit {} to finish the setup.",
                shared.display(),
                config_path(&shared).display()
            );
        }
        Command::AddNode {
            name,
            host,
            port,
            reservation,
            label,
        } => {
            let node = NodeName::new(name);
            register_node(
                &shared()?,
                &node,
                RawWorker {
                    host,
                    port,
                    reservation,
                    label,
                },
            )
            .with_context(|| format!("Failed to register {}", node))?;
            println!("{} registered", node);
        }
        Command::AddPartition { path, label } => add_partition(&local_config, path, label)?,
    }

    Ok(())
}
