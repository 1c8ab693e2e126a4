//! App-update lifecycle.
//!
//! The `UpdateMonitor` watches the worker registration for a newly
//! installed version, runs user-initiated checks, applies a waiting
//! version with a reload, and offers a cache-bypassing force refresh.

pub mod error;
pub mod monitor;

pub use error::UpdateError;
pub use monitor::{ApplyOutcome, UpdateMonitor, UpdateSettings};
