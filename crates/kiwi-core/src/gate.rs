//! Login gate
//!
//! Decides whether a login to this worker is admitted. Only the lease holder
//! and bypass logins get in while the node is enforced. Any failure to
//! evaluate the decision admits: a broken gate must never lock everybody
//! out of the cluster.

use kiwi_config::{LocalConfig, load_config};
use kiwi_store::{LeaseState, RecordStore};
use kiwi_util::{
    LeaseError, NodeName, Result, Username, config_path, default_local_config_path, fail_safe_path,
};
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Environment variable carrying the login identity under `pam_exec`
pub const PAM_USER_ENV: &str = "PAM_USER";

/// What the gate needs to know about the login and the machine
pub trait GateEnv {
    fn hostname(&self) -> Result<NodeName>;
    fn login_identity(&self) -> Result<Username>;
    fn shared_path(&self) -> Result<PathBuf>;
}

/// The gate environment of a real PAM session
#[derive(Debug, Clone)]
pub struct SystemGateEnv {
    local_config: PathBuf,
    partition: Option<String>,
}

impl SystemGateEnv {
    pub fn new(local_config: PathBuf, partition: Option<String>) -> Self {
        Self {
            local_config,
            partition,
        }
    }
}

impl Default for SystemGateEnv {
    fn default() -> Self {
        Self::new(default_local_config_path(), None)
    }
}

impl GateEnv for SystemGateEnv {
    fn hostname(&self) -> Result<NodeName> {
        let name = nix::unistd::gethostname()
            .map_err(|e| LeaseError::gatekeeper(format!("hostname unavailable: {}", e)))?;
        name.into_string()
            .map(NodeName::new)
            .map_err(|_| LeaseError::gatekeeper("hostname is not valid UTF-8"))
    }

    fn login_identity(&self) -> Result<Username> {
        match std::env::var(PAM_USER_ENV) {
            Ok(user) if !user.is_empty() => Ok(Username::new(user)),
            _ => Err(LeaseError::gatekeeper(format!("{} is not set", PAM_USER_ENV))),
        }
    }

    fn shared_path(&self) -> Result<PathBuf> {
        let local = LocalConfig::load(&self.local_config)?;
        Ok(local.shared_path(self.partition.as_deref())?.to_path_buf())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitReason {
    /// The node is not under enforcement (no fail-safe marker)
    NotEnforcing,
    /// A configured bypass login
    Bypass,
    /// The lease holder, confirmed or not
    Holder,
    /// The decision could not be evaluated
    FailOpen(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Admit(AdmitReason),
    Deny { identity: Username, owner: LeaseState },
}

impl Decision {
    pub fn is_admit(&self) -> bool {
        matches!(self, Self::Admit(_))
    }

    /// Exit status for `pam_exec`: 0 admits, 1 denies
    pub fn exit_code(&self) -> u8 {
        if self.is_admit() { 0 } else { 1 }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admit(AdmitReason::FailOpen(reason)) => write!(f, "admit (fail-open: {})", reason),
            Self::Admit(reason) => write!(f, "admit ({:?})", reason),
            Self::Deny { identity, owner } => {
                write!(f, "deny {} (node held by {})", identity, owner)
            }
        }
    }
}

/// Decide on a login. Never fails: every internal error admits.
pub fn check_login(env: &impl GateEnv) -> Decision {
    match evaluate(env) {
        Ok(decision) => decision,
        Err(e) => {
            warn!(error = %e, "Gate could not evaluate login, admitting");
            Decision::Admit(AdmitReason::FailOpen(e.to_string()))
        }
    }
}

fn evaluate(env: &impl GateEnv) -> Result<Decision> {
    let shared = env.shared_path()?;
    if !fail_safe_path(&shared).is_file() {
        debug!(shared = %shared.display(), "No fail-safe marker, not enforcing");
        return Ok(Decision::Admit(AdmitReason::NotEnforcing));
    }

    let identity = env.login_identity()?;
    let config = load_config(config_path(&shared))?;
    if config.is_bypass(&identity) {
        return Ok(Decision::Admit(AdmitReason::Bypass));
    }

    let node = env.hostname()?;
    let record = RecordStore::for_node(&shared, &node).read()?;
    if record.state.is_held_by(&identity) {
        return Ok(Decision::Admit(AdmitReason::Holder));
    }

    debug!(identity = %identity, node = %node, owner = %record.state, "Login denied");
    Ok(Decision::Deny {
        identity,
        owner: record.state,
    })
}
