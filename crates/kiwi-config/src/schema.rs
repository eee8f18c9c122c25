//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Raw cluster configuration as parsed from `<shared>/config.toml`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Where the kiwi binaries are installed on the workers
    pub worker_install_path: Option<PathBuf>,

    /// The shared directory as mounted on the workers
    pub worker_shared_path: Option<PathBuf>,

    /// Logins the gate always admits
    #[serde(default)]
    pub worker_ssh_bypass: Vec<String>,

    /// UTC offset used to evaluate reservation windows (local time if absent)
    pub timezone_offset_hours: Option<i32>,

    /// Registered workers, keyed by node name
    #[serde(default)]
    pub workers: BTreeMap<String, RawWorker>,
}

impl RawConfig {
    /// An empty configuration for a freshly bootstrapped shared directory
    pub fn empty() -> Self {
        Self {
            config_version: crate::CURRENT_CONFIG_VERSION,
            worker_install_path: None,
            worker_shared_path: None,
            worker_ssh_bypass: vec!["root".into()],
            timezone_offset_hours: None,
            workers: BTreeMap::new(),
        }
    }
}

/// Raw worker definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawWorker {
    /// SSH host name or address
    pub host: String,

    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Reservation windows as comma-separated `HH:MM-HH:MM` ranges
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation: Option<String>,

    /// Free-form label shown in listings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

fn default_port() -> u16 {
    22
}
