//! kiwi-ssh-check - login gate for `pam_exec`
//!
//! Exits 0 to admit the login named by `PAM_USER` and 1 to deny it. Anything
//! that goes wrong on the way to a decision admits.

use clap::Parser;
use kiwi_core::{Decision, SystemGateEnv, check_login};
use kiwi_util::default_local_config_path;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// kiwi-ssh-check - Admits only the lease holder to this worker
#[derive(Parser, Debug)]
#[command(name = "kiwi-ssh-check")]
#[command(about = "Admits only the lease holder to this worker", long_about = None)]
struct Args {
    /// Install-side configuration listing the shared directories
    #[arg(long, env = "KIWI_LOCAL_CONFIG", default_value_os_t = default_local_config_path())]
    local_config: PathBuf,

    /// Partition label (default: first partition)
    #[arg(short, long)]
    partition: Option<String>,

    /// Log level
    #[arg(short, long, default_value = "warn")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // Even a bad invocation must not lock anyone out
            eprintln!("kiwi-ssh-check: {}", e);
            return ExitCode::SUCCESS;
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let env = SystemGateEnv::new(args.local_config, args.partition);
    let decision = check_login(&env);
    info!(decision = %decision, "Login checked");

    if let Decision::Deny { identity, owner } = &decision {
        println!(
            "{} is not allowed to log in: this node is leased to {}.",
            identity,
            owner
                .holder()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "nobody".into())
        );
    }

    ExitCode::from(decision.exit_code())
}
