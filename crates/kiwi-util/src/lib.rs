//! Shared utilities for kiwi
//!
//! This crate provides:
//! - Identifier types (NodeName, Username)
//! - The lease error taxonomy shared by every component
//! - Time utilities (mock time, wall clock, reservation windows)
//! - Default paths for the local configuration, PID markers and logs

mod error;
mod ids;
mod paths;
mod time;

pub use error::*;
pub use ids::*;
pub use paths::*;
pub use time::*;
