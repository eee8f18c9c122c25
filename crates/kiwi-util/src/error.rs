//! Error taxonomy for lease operations

use thiserror::Error;

use crate::NodeName;

/// Core error type for kiwi lease operations
///
/// Each crate keeps its own error enum for the details of its concern and
/// converts into this one at the lease protocol boundary.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// The record on shared storage is malformed. Fatal for the reader,
    /// never repaired automatically.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The record is not in the state the transition requires.
    #[error("{0}")]
    PreconditionFailed(String),

    /// The record changed since this actor last observed it. Someone else
    /// already resolved the lease.
    #[error("Record changed underneath: {0}")]
    RaceDetected(String),

    /// Starting or signalling the remote enforcement daemon failed.
    #[error("Remote action failed: {0}")]
    RemoteActionFailed(String),

    /// The gatekeeper could not evaluate a login. Always resolves to admit.
    #[error("Gatekeeper internal error: {0}")]
    GatekeeperInternalError(String),

    #[error("Node {0} cannot be reserved for the requested period")]
    NotReservable(NodeName),

    #[error("No lease record at {0}")]
    RecordMissing(String),

    #[error("Unknown worker: {0}")]
    UnknownWorker(NodeName),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LeaseError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionFailed(msg.into())
    }

    pub fn race(msg: impl Into<String>) -> Self {
        Self::RaceDetected(msg.into())
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Self::RemoteActionFailed(msg.into())
    }

    pub fn gatekeeper(msg: impl Into<String>) -> Self {
        Self::GatekeeperInternalError(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error means another actor already reconciled the lease
    /// and the caller should stop quietly.
    pub fn is_race(&self) -> bool {
        matches!(self, Self::RaceDetected(_))
    }
}

pub type Result<T> = std::result::Result<T, LeaseError>;
