//! Configuration validation

use crate::schema::{RawConfig, RawWorker};
use kiwi_util::{ReservationSchedule, Username};
use thiserror::Error;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Worker '{worker}': {message}")]
    WorkerError { worker: String, message: String },

    #[error("Invalid reservation '{value}' for worker '{worker}': {message}")]
    InvalidReservation {
        worker: String,
        value: String,
        message: String,
    },

    #[error("Invalid bypass login: '{0}'")]
    InvalidBypassLogin(String),

    #[error("Global config error: {0}")]
    GlobalError(String),
}

/// Validate a raw configuration
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for (field, path) in [
        ("worker_install_path", &config.worker_install_path),
        ("worker_shared_path", &config.worker_shared_path),
    ] {
        if let Some(path) = path
            && !path.is_absolute()
        {
            errors.push(ValidationError::GlobalError(format!(
                "{} must be absolute, got {}",
                field,
                path.display()
            )));
        }
    }

    if let Some(offset) = config.timezone_offset_hours
        && !(-23..=23).contains(&offset)
    {
        errors.push(ValidationError::GlobalError(format!(
            "timezone_offset_hours must be within -23..=23, got {}",
            offset
        )));
    }

    for login in &config.worker_ssh_bypass {
        if !Username::new(login.as_str()).is_valid() {
            errors.push(ValidationError::InvalidBypassLogin(login.clone()));
        }
    }

    for (name, worker) in &config.workers {
        errors.extend(validate_worker(name, worker));
    }

    errors
}

fn validate_worker(name: &str, worker: &RawWorker) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let fail = |message: &str| ValidationError::WorkerError {
        worker: name.to_string(),
        message: message.into(),
    };

    // The name doubles as a directory under the shared path
    if !is_valid_node_name(name) {
        errors.push(fail("name must be a single path component without whitespace"));
    }

    if worker.host.trim().is_empty() {
        errors.push(fail("host cannot be empty"));
    }

    if worker.port == 0 {
        errors.push(fail("port cannot be 0"));
    }

    if let Some(reservation) = &worker.reservation
        && let Err(message) = reservation.parse::<ReservationSchedule>()
    {
        errors.push(ValidationError::InvalidReservation {
            worker: name.to_string(),
            value: reservation.clone(),
            message,
        });
    }

    errors
}

pub fn is_valid_node_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.chars().any(char::is_whitespace)
}
