//! Default paths for kiwi components
//!
//! Shared storage layout (one tree per partition):
//! - `<shared>/config.toml`: cluster configuration
//! - `<shared>/fail_safe.txt`: present while the login gate is enforcing
//! - `<shared>/<node>/status.txt`: the node's lease record
//!
//! Worker-local paths:
//! - PID markers: `$KIWI_RUNTIME_DIR/kiwi-<user>.pid` or `/tmp/kiwi-<user>.pid`
//! - Logs: `$XDG_STATE_HOME/kiwi` or `~/.local/state/kiwi`

use std::path::{Path, PathBuf};

/// Environment variable for overriding the local configuration file
pub const KIWI_LOCAL_CONFIG_ENV: &str = "KIWI_LOCAL_CONFIG";

/// Environment variable for overriding the directory holding PID markers
pub const KIWI_RUNTIME_DIR_ENV: &str = "KIWI_RUNTIME_DIR";

/// Record filename within a node directory
pub const RECORD_FILENAME: &str = "status.txt";

/// Cluster configuration filename within the shared directory
pub const CONFIG_FILENAME: &str = "config.toml";

/// Gate enforcement marker within the shared directory
pub const FAIL_SAFE_FILENAME: &str = "fail_safe.txt";

/// Application subdirectory name
const APP_DIR: &str = "kiwi";

/// Get the local (install-side) configuration path.
///
/// Order of precedence:
/// 1. `$KIWI_LOCAL_CONFIG` environment variable (if set)
/// 2. `/etc/kiwi/local_config.txt`
pub fn default_local_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(KIWI_LOCAL_CONFIG_ENV) {
        return PathBuf::from(path);
    }

    PathBuf::from("/etc").join(APP_DIR).join("local_config.txt")
}

/// Directory holding the PID markers of running enforcement daemons
pub fn runtime_dir() -> PathBuf {
    std::env::var(KIWI_RUNTIME_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// PID marker path for the daemon enforcing `user`'s lease on this node
pub fn pid_marker_path(user: &str) -> PathBuf {
    pid_marker_path_in(&runtime_dir(), user)
}

pub fn pid_marker_path_in(dir: &Path, user: &str) -> PathBuf {
    dir.join(format!("{}-{}.pid", APP_DIR, user))
}

/// Lease record path for `node` under a shared directory
pub fn record_path(shared: &Path, node: &str) -> PathBuf {
    shared.join(node).join(RECORD_FILENAME)
}

pub fn config_path(shared: &Path) -> PathBuf {
    shared.join(CONFIG_FILENAME)
}

pub fn fail_safe_path(shared: &Path) -> PathBuf {
    shared.join(FAIL_SAFE_FILENAME)
}

/// Get the default log directory.
///
/// Order of precedence:
/// 1. `$XDG_STATE_HOME/kiwi` (if XDG_STATE_HOME is set)
/// 2. the platform state directory (`~/.local/state/kiwi`)
/// 3. `/tmp/kiwi/logs`
pub fn default_log_dir() -> PathBuf {
    if let Ok(state_home) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(state_home).join(APP_DIR);
    }

    if let Some(state) = dirs::state_dir() {
        return state.join(APP_DIR);
    }

    // Last resort
    PathBuf::from("/tmp").join(APP_DIR).join("logs")
}
