//! Error types for conductor.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Transition error: {0}")]
    Transition(#[from] TransitionError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Subprocess error: {0}")]
    Subprocess(#[from] SubprocessError),

    #[error("Worker safety check failed: {running} task(s) still in progress")]
    WorkersRunning { running: usize },
}

impl Error {
    /// Taxonomy name surfaced by the CLI alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::Database(_) => "DatastoreError",
            Self::Validation(_) => "ValidationError",
            Self::Transition(TransitionError::Database(_)) => "DatastoreError",
            Self::Transition(TransitionError::LockConflict { .. }) => "LockConflict",
            Self::Transition(_) => "TransitionError",
            Self::Lock(LockError::Conflict { .. }) => "LockConflict",
            Self::Lock(LockError::Database(_)) => "DatastoreError",
            Self::Lock(LockError::Validation(_)) => "ValidationError",
            Self::Subprocess(_) => "SubprocessFailure",
            Self::WorkersRunning { .. } => "WorkerSafetyError",
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Bad caller input. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Unknown {entity} status: {value}")]
    UnknownStatus { entity: String, value: String },

    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Unknown escalation type: {0}")]
    UnknownEscalationType(String),

    #[error("Invalid file path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidField { field: String, reason: String },
}

/// Refused or failed status transitions.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("{entity_type} {entity_id} not found")]
    NotFound {
        entity_type: String,
        entity_id: String,
    },

    #[error("Invalid {entity_type} transition for {entity_id}: {from} -> {to}")]
    InvalidTransition {
        entity_type: String,
        entity_id: String,
        from: String,
        to: String,
    },

    #[error("Role {role} may not move {entity_type} {entity_id} from {from} to {to}")]
    ForbiddenTransition {
        entity_type: String,
        entity_id: String,
        from: String,
        to: String,
        role: String,
    },

    #[error("Task {entity_id} cannot enter IN_PROGRESS: {path} is locked by task {holder}")]
    LockConflict {
        entity_id: String,
        path: String,
        holder: String,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// File lock errors.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("{path} in project {project_id} is locked by task {holder}")]
    Conflict {
        project_id: String,
        path: String,
        holder: String,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Worker subprocess failures.
#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
    #[error("Failed to spawn worker for task {task_id}: {reason}")]
    Spawn { task_id: String, reason: String },

    #[error("Worker for task {task_id} exited with code {code:?}")]
    NonZeroExit { task_id: String, code: Option<i32> },

    #[error("Worker for task {task_id} timed out after {timeout:?}")]
    Timeout { task_id: String, timeout: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for conductor.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_follow_taxonomy() {
        let err: Error = LockError::Conflict {
            project_id: "p".into(),
            path: "a.py".into(),
            holder: "T1".into(),
        }
        .into();
        assert_eq!(err.kind(), "LockConflict");

        let err: Error = TransitionError::LockConflict {
            entity_id: "T1".into(),
            path: "a.py".into(),
            holder: "T2".into(),
        }
        .into();
        assert_eq!(err.kind(), "LockConflict");

        let err: Error = TransitionError::Database(DatabaseError::Query("boom".into())).into();
        assert_eq!(err.kind(), "DatastoreError");

        let err: Error = TransitionError::NotFound {
            entity_type: "task".into(),
            entity_id: "T9".into(),
        }
        .into();
        assert_eq!(err.kind(), "TransitionError");
        assert_eq!(err.to_string(), "Transition error: task T9 not found");
    }
}
