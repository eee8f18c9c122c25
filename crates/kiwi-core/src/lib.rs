//! Core lease protocol for kiwi
//!
//! This crate implements:
//! - The lease state machine over the shared record
//! - The enforcement daemon that confirms, watches and reclaims a lease
//! - The lease client used by operators (allocate, kill, run, reconcile)
//! - The login gate consulted by PAM on every worker
//! - Node registration

mod client;
mod daemon;
mod gate;
mod lease;
mod registry;

pub use client::*;
pub use daemon::*;
pub use gate::*;
pub use lease::*;
pub use registry::*;
