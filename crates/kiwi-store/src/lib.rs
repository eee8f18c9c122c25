//! Persistence layer for kiwi
//!
//! Provides:
//! - The lease record and its one-line wire encoding
//! - A record store whose mutations run under an exclusive `flock`
//! - Enumeration of node records under a shared directory
//! - PID markers naming the enforcement daemon of a lease

mod pid;
mod record;
mod store;

pub use pid::*;
pub use record::*;
pub use store::*;

use kiwi_util::LeaseError;
use std::path::PathBuf;
use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Malformed record {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("Record not found: {0}")]
    NotFound(PathBuf),

    #[error("Record already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Failed to lock {path}: {reason}")]
    Lock { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether the record is gone or unreadable as a record, i.e. some other
    /// actor has already taken the node out of our hands
    pub fn is_vanished_or_malformed(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Malformed { .. })
    }
}

impl From<StoreError> for LeaseError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Malformed { .. } => LeaseError::protocol(e.to_string()),
            StoreError::NotFound(path) => LeaseError::RecordMissing(path.display().to_string()),
            StoreError::AlreadyExists(_) => LeaseError::precondition(e.to_string()),
            StoreError::Lock { .. } => LeaseError::Io(std::io::Error::other(e.to_string())),
            StoreError::Io(io) => LeaseError::Io(io),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
