//! Linux host implementation for kiwi
//!
//! Provides:
//! - Remote execution over `ssh` (daemon start, cancellation, interactive shell)
//! - Termination of every process owned by a user, found through `/proc`
//! - Delivery of the cancellation signal to an enforcement daemon

mod process;
mod signal;
mod ssh;

pub use process::*;
pub use signal::*;
pub use ssh::*;
