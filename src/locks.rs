//! File lock manager: exclusive per-path claims scoped to a project.
//!
//! Acquisition is all-or-nothing and fails fast; the caller decides
//! whether to retry on a later launch cycle.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{DatabaseError, LockError, ValidationError};
use crate::model::FileLock;
use crate::store::{Database, LockAttempt};

/// Normalise a declared target path: trim, strip leading `./`, collapse
/// repeated separators, drop a trailing separator.
pub fn normalize_path(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    let mut rest = trimmed;
    while let Some(stripped) = rest.strip_prefix("./") {
        rest = stripped;
    }

    let absolute = rest.starts_with('/');
    let parts: Vec<&str> = rest
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect();

    if parts.is_empty() {
        return Err(ValidationError::InvalidPath {
            path: raw.to_string(),
            reason: "empty path".into(),
        });
    }
    if parts.contains(&"..") {
        return Err(ValidationError::InvalidPath {
            path: raw.to_string(),
            reason: "parent directory components are not allowed".into(),
        });
    }

    let joined = parts.join("/");
    Ok(if absolute { format!("/{joined}") } else { joined })
}

/// Normalise every path, keeping first-seen order and dropping repeats.
pub fn normalize_paths<S: AsRef<str>>(paths: &[S]) -> Result<Vec<String>, ValidationError> {
    let mut out: Vec<String> = Vec::with_capacity(paths.len());
    for raw in paths {
        let path = normalize_path(raw.as_ref())?;
        if !out.contains(&path) {
            out.push(path);
        }
    }
    Ok(out)
}

#[derive(Clone)]
pub struct LockManager {
    db: Arc<dyn Database>,
}

impl LockManager {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Lock every path for the task or none. The first conflicting path in
    /// input order is reported.
    pub async fn acquire<S: AsRef<str>>(
        &self,
        project_id: &str,
        task_id: &str,
        paths: &[S],
    ) -> Result<usize, LockError> {
        let paths = normalize_paths(paths)?;
        match self.db.acquire_locks(project_id, task_id, &paths).await? {
            LockAttempt::Acquired { newly_locked } => {
                debug!(project_id, task_id, newly_locked, "File locks acquired");
                Ok(newly_locked)
            }
            LockAttempt::Conflict { path, holder } => {
                info!(project_id, task_id, %path, %holder, "File lock conflict");
                Err(LockError::Conflict {
                    project_id: project_id.to_string(),
                    path,
                    holder,
                })
            }
        }
    }

    /// Same check as `acquire`, writing nothing.
    pub async fn probe<S: AsRef<str>>(
        &self,
        project_id: &str,
        task_id: &str,
        paths: &[S],
    ) -> Result<(), LockError> {
        let paths = normalize_paths(paths)?;
        match self.db.probe_locks(project_id, task_id, &paths).await? {
            LockAttempt::Acquired { .. } => Ok(()),
            LockAttempt::Conflict { path, holder } => Err(LockError::Conflict {
                project_id: project_id.to_string(),
                path,
                holder,
            }),
        }
    }

    /// Release every lock the task holds. Idempotent.
    pub async fn release(&self, project_id: &str, task_id: &str) -> Result<usize, DatabaseError> {
        let released = self.db.release_locks(project_id, task_id).await?;
        if released > 0 {
            debug!(project_id, task_id, released, "File locks released");
        }
        Ok(released)
    }

    /// Drop the lock on one path regardless of owner (operator recovery).
    pub async fn force_release(&self, project_id: &str, path: &str) -> Result<bool, LockError> {
        let path = normalize_path(path)?;
        let released = self.db.release_lock_path(project_id, &path).await?;
        if released {
            info!(project_id, %path, "File lock force-released");
        }
        Ok(released)
    }

    pub async fn list_locks(&self, project_id: Option<&str>) -> Result<Vec<FileLock>, DatabaseError> {
        self.db.list_locks(project_id).await
    }
}
