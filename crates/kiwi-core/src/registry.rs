//! Cluster bootstrap and node registration

use kiwi_config::{RawConfig, RawWorker, is_valid_node_name, load_raw_config, save_config};
use kiwi_store::RecordStore;
use kiwi_util::{LeaseError, NodeName, Result, config_path, fail_safe_path};
use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::info;

/// Set up a fresh shared directory: an empty cluster configuration and the
/// marker that switches the login gate on. Refuses to touch an existing
/// configuration.
pub fn init_master(shared: &Path) -> Result<()> {
    let path = config_path(shared);
    if path.exists() {
        return Err(LeaseError::precondition(format!(
            "{} already exists; delete it to start over",
            path.display()
        )));
    }

    std::fs::create_dir_all(shared)?;
    std::fs::set_permissions(shared, Permissions::from_mode(0o755))?;

    save_config(&path, &RawConfig::empty())?;
    std::fs::set_permissions(&path, Permissions::from_mode(0o644))?;

    let marker = fail_safe_path(shared);
    std::fs::File::create(&marker)?;
    std::fs::set_permissions(&marker, Permissions::from_mode(0o644))?;

    info!(shared = %shared.display(), "Shared directory initialized");
    Ok(())
}

/// Add `name` to the cluster configuration under `shared` and create its
/// idle record. A missing configuration is bootstrapped.
pub fn register_node(shared: &Path, name: &NodeName, worker: RawWorker) -> Result<()> {
    if !is_valid_node_name(name.as_str()) {
        return Err(LeaseError::config(format!("Invalid node name '{}'", name)));
    }

    let path = config_path(shared);
    let mut raw = if path.exists() {
        load_raw_config(&path)?
    } else {
        RawConfig::empty()
    };

    if raw.workers.contains_key(name.as_str()) {
        return Err(LeaseError::precondition(format!("Node {} is already registered", name)));
    }

    let store = RecordStore::for_node(shared, name);
    if store.exists() {
        return Err(LeaseError::precondition(format!(
            "Node {} already has a record at {}",
            name,
            store.path().display()
        )));
    }

    raw.workers.insert(name.as_str().to_string(), worker);
    save_config(&path, &raw)?;
    store.initialize()?;

    info!(node = %name, path = %store.path().display(), "Node registered");
    Ok(())
}
