//! Conductor: coordination core for parallel coding-agent workers.
//!
//! Every cooperating process shares one database file; status changes,
//! file locks, and escalations are committed there atomically.

pub mod config;
pub mod error;
pub mod escalation;
pub mod faults;
pub mod locks;
pub mod model;
pub mod safety;
pub mod scheduler;
pub mod store;
pub mod transitions;
