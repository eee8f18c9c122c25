//! Config validation CLI tool
//!
//! Validates a kiwi cluster configuration file and reports any errors.

use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("Usage: validate-config <shared-dir>/config.toml");
            eprintln!();
            eprintln!("Validates a kiwi cluster configuration file.");
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match kiwi_config::load_config(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Summary:");
            println!("  Config version: {}", kiwi_config::CURRENT_CONFIG_VERSION);
            println!("  Install path: {}", config.worker_install_path.display());
            println!("  Bypass logins: {}", config.bypass.len());
            println!("  Workers: {}", config.workers.len());

            if !config.workers.is_empty() {
                println!();
                println!("Workers:");
                for worker in config.workers.values() {
                    let window = worker
                        .reservation
                        .as_ref()
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "any time".into());
                    println!(
                        "  - {} [{}:{}]: {}",
                        worker.name, worker.host, worker.port, window
                    );
                }
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed");
            eprintln!();
            match &e {
                kiwi_config::ConfigError::ValidationFailed { errors } => {
                    eprintln!("Validation errors ({}):", errors.len());
                    for err in errors {
                        eprintln!("  - {}", err);
                    }
                }
                kiwi_config::ConfigError::UnsupportedVersion(ver) => {
                    eprintln!(
                        "Unsupported config version: {} (expected {})",
                        ver,
                        kiwi_config::CURRENT_CONFIG_VERSION
                    );
                }
                other => eprintln!("{}", other),
            }
            ExitCode::from(1)
        }
    }
}
