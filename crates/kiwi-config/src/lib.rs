//! Configuration parsing and validation for kiwi
//!
//! Two files are involved:
//! - the cluster configuration, `config.toml` on shared storage, listing
//!   workers, bypass logins and reservation windows
//! - the install-side `local_config.txt`, pointing a host at one or more
//!   shared directories (partitions)

mod local;
mod policy;
mod schema;
mod validation;

pub use local::*;
pub use policy::*;
pub use schema::*;
pub use validation::*;

use kiwi_util::LeaseError;
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize TOML: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Validation failed: {errors:?}")]
    ValidationFailed { errors: Vec<ValidationError> },

    #[error("Unsupported config version: {0}")]
    UnsupportedVersion(u32),

    #[error("Local configuration: {0}")]
    LocalConfig(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

impl From<ConfigError> for LeaseError {
    fn from(e: ConfigError) -> Self {
        LeaseError::config(e.to_string())
    }
}

/// Current supported config version
pub const CURRENT_CONFIG_VERSION: u32 = 1;

/// Load and validate configuration from a TOML file
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<ClusterConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration from a TOML string
pub fn parse_config(content: &str) -> ConfigResult<ClusterConfig> {
    let raw = parse_raw_config(content)?;
    Ok(ClusterConfig::from_raw(raw))
}

/// Load the raw configuration for editing, validated
pub fn load_raw_config(path: impl AsRef<Path>) -> ConfigResult<RawConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_raw_config(&content)
}

fn parse_raw_config(content: &str) -> ConfigResult<RawConfig> {
    let raw: RawConfig = toml::from_str(content)?;

    if raw.config_version != CURRENT_CONFIG_VERSION {
        return Err(ConfigError::UnsupportedVersion(raw.config_version));
    }

    check(&raw)?;
    Ok(raw)
}

/// Validate and write a raw configuration
pub fn save_config(path: impl AsRef<Path>, raw: &RawConfig) -> ConfigResult<()> {
    check(raw)?;
    std::fs::write(path, toml::to_string_pretty(raw)?)?;
    Ok(())
}

fn check(raw: &RawConfig) -> ConfigResult<()> {
    let errors = validate_config(raw);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationFailed { errors })
    }
}
