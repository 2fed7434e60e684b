//! Persistence layer: libSQL-backed storage for work items, transitions,
//! file locks, worker telemetry, and escalations.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    AppliedTransition, Database, HistoryFilter, ImportedTransition, LockAttempt, LockPolicy,
    TransitionRequest,
};
