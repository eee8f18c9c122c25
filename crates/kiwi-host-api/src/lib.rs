//! Host interfaces for kiwi
//!
//! This crate defines the seam between the lease protocol and the machines
//! it runs on: starting and signalling the enforcement daemon on a worker,
//! and terminating a user's processes. It contains no platform code itself.

mod mock;
mod traits;

pub use mock::*;
pub use traits::*;
