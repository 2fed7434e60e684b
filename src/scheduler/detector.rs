//! Dependency/conflict detector: selects the next launch batch.
//!
//! Read-only: the same database state always yields the same plan.
//! Selection is greedy by `(priority, id)`; it is not a maximum-cardinality
//! conflict-free set.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::error::{Error, ValidationError};
use crate::locks::normalize_paths;
use crate::model::{Task, TaskStatus};
use crate::store::Database;

/// A QUEUED task waiting on unfinished or missing dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyBlock {
    pub task_id: String,
    /// Dependency id → its status, or `MISSING`.
    pub waiting_on: BTreeMap<String, String>,
}

/// Who holds a path a candidate needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "task_id", rename_all = "snake_case")]
pub enum LockHolder {
    /// A live lock row.
    Locked(String),
    /// A task accepted earlier in this batch.
    Batch(String),
}

impl LockHolder {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Locked(id) | Self::Batch(id) => id,
        }
    }
}

/// A QUEUED task whose files intersect held locks or the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockBlock {
    pub task_id: String,
    pub path: String,
    pub holder: LockHolder,
}

/// A QUEUED task whose declared files cannot be locked as written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidPathBlock {
    pub task_id: String,
    pub path: String,
    pub reason: String,
}

/// Output of one detection pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LaunchPlan {
    /// Accepted tasks in selection order.
    pub launchable: Vec<Task>,
    pub blocked_by_dependency: Vec<DependencyBlock>,
    pub blocked_by_lock: Vec<LockBlock>,
    pub blocked_by_invalid_path: Vec<InvalidPathBlock>,
    /// Eligible tasks left out because the batch was full.
    pub deferred: Vec<String>,
}

impl LaunchPlan {
    pub fn launchable_ids(&self) -> Vec<&str> {
        self.launchable.iter().map(|t| t.id.as_str()).collect()
    }

    /// Whether anything is held back by a dependency, a lock, or a bad path.
    pub fn has_blocks(&self) -> bool {
        !self.blocked_by_dependency.is_empty()
            || !self.blocked_by_lock.is_empty()
            || !self.blocked_by_invalid_path.is_empty()
    }
}

#[derive(Clone)]
pub struct Detector {
    db: Arc<dyn Database>,
}

impl Detector {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Compute the launchable set for one order, accepting at most
    /// `max_tasks` tasks.
    pub async fn compute_launchable(
        &self,
        project_id: &str,
        order_id: &str,
        max_tasks: usize,
    ) -> Result<LaunchPlan, Error> {
        let queued = self
            .db
            .list_tasks_by_order(project_id, order_id, Some(TaskStatus::Queued))
            .await?;

        let mut plan = LaunchPlan::default();
        let mut dep_status: HashMap<String, Option<TaskStatus>> = HashMap::new();
        let mut candidates = Vec::new();

        for task in queued {
            let mut waiting_on = BTreeMap::new();
            for dep in &task.depends_on {
                if !dep_status.contains_key(dep) {
                    let status = self.db.get_task(project_id, dep).await?.map(|t| t.status);
                    dep_status.insert(dep.clone(), status);
                }
                match dep_status.get(dep).copied().flatten() {
                    Some(status) if status.satisfies_dependency() => {}
                    Some(status) => {
                        waiting_on.insert(dep.clone(), status.as_str().to_string());
                    }
                    None => {
                        waiting_on.insert(dep.clone(), "MISSING".to_string());
                    }
                }
            }

            if waiting_on.is_empty() {
                candidates.push(task);
            } else {
                plan.blocked_by_dependency.push(DependencyBlock {
                    task_id: task.id.clone(),
                    waiting_on,
                });
            }
        }

        candidates.sort_by(|a, b| (a.priority, &a.id).cmp(&(b.priority, &b.id)));

        let held: HashMap<String, String> = self
            .db
            .list_locks(Some(project_id))
            .await?
            .into_iter()
            .map(|lock| (lock.file_path, lock.task_id))
            .collect();
        let mut batch_files: HashMap<String, String> = HashMap::new();

        for task in candidates {
            let paths = match normalize_paths(&task.target_files) {
                Ok(paths) => paths,
                Err(err) => {
                    let (path, reason) = match err {
                        ValidationError::InvalidPath { path, reason } => (path, reason),
                        other => (String::new(), other.to_string()),
                    };
                    plan.blocked_by_invalid_path.push(InvalidPathBlock {
                        task_id: task.id.clone(),
                        path,
                        reason,
                    });
                    continue;
                }
            };

            let conflict = paths.iter().find_map(|path| {
                if let Some(holder) = held.get(path) {
                    if holder != &task.id {
                        return Some((path.clone(), LockHolder::Locked(holder.clone())));
                    }
                }
                batch_files
                    .get(path)
                    .map(|owner| (path.clone(), LockHolder::Batch(owner.clone())))
            });

            if let Some((path, holder)) = conflict {
                plan.blocked_by_lock.push(LockBlock {
                    task_id: task.id.clone(),
                    path,
                    holder,
                });
                continue;
            }

            if plan.launchable.len() >= max_tasks {
                plan.deferred.push(task.id.clone());
                continue;
            }

            let unique: HashSet<&String> = paths.iter().collect();
            for path in unique {
                batch_files.insert(path.clone(), task.id.clone());
            }
            plan.launchable.push(task);
        }

        debug!(
            project_id,
            order_id,
            launchable = plan.launchable.len(),
            blocked_by_dependency = plan.blocked_by_dependency.len(),
            blocked_by_lock = plan.blocked_by_lock.len(),
            blocked_by_invalid_path = plan.blocked_by_invalid_path.len(),
            deferred = plan.deferred.len(),
            "Launch plan computed"
        );
        Ok(plan)
    }
}
