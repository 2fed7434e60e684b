//! Worker safety gate: refuses schema changes while workers are running.
//!
//! Probes the same datastore the launcher writes to, so a migration run from
//! any process sees every IN_PROGRESS task.

use serde::Serialize;
use tracing::warn;

use crate::error::{DatabaseError, Error};
use crate::model::TaskStatus;
use crate::store::Database;

/// A task a running worker may still be writing for.
#[derive(Debug, Clone, Serialize)]
pub struct RunningTask {
    pub project_id: String,
    pub order_id: String,
    pub task_id: String,
    pub title: String,
}

/// Result of a safety probe.
#[derive(Debug, Clone, Serialize)]
pub struct SafetyReport {
    pub safe: bool,
    pub running_tasks: Vec<RunningTask>,
}

/// List IN_PROGRESS tasks in one project, or everywhere.
pub async fn check_worker_safety(
    db: &dyn Database,
    project_id: Option<&str>,
) -> Result<SafetyReport, DatabaseError> {
    let running_tasks: Vec<RunningTask> = db
        .list_tasks_by_status(project_id, TaskStatus::InProgress)
        .await?
        .into_iter()
        .map(|t| RunningTask {
            project_id: t.project_id,
            order_id: t.order_id,
            task_id: t.id,
            title: t.title,
        })
        .collect();

    Ok(SafetyReport {
        safe: running_tasks.is_empty(),
        running_tasks,
    })
}

/// Guard for schema-mutating operations. With `force`, an unsafe state is
/// logged and allowed.
pub async fn require_worker_safety(db: &dyn Database, force: bool) -> Result<SafetyReport, Error> {
    let report = check_worker_safety(db, None).await?;
    if report.safe {
        return Ok(report);
    }
    if force {
        warn!(
            running = report.running_tasks.len(),
            "Proceeding despite running workers (forced)"
        );
        return Ok(report);
    }
    Err(Error::WorkersRunning {
        running: report.running_tasks.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Project, Task};
    use crate::store::LibSqlBackend;

    async fn db_with(tasks: Vec<Task>) -> LibSqlBackend {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.insert_project(&Project::new("p1", "Demo")).await.unwrap();
        db.insert_project(&Project::new("p2", "Other")).await.unwrap();
        for task in tasks {
            db.insert_task(&task).await.unwrap();
        }
        db
    }

    #[tokio::test]
    async fn idle_datastore_is_safe() {
        let db = db_with(vec![Task::new("p1", "O1", "T1", "queued")]).await;
        let report = check_worker_safety(&db, None).await.unwrap();
        assert!(report.safe);
        assert!(require_worker_safety(&db, false).await.is_ok());
    }

    #[tokio::test]
    async fn running_worker_blocks_unless_forced() {
        let db = db_with(vec![
            Task::new("p2", "O1", "T1", "busy").with_status(TaskStatus::InProgress),
        ])
        .await;

        let report = check_worker_safety(&db, None).await.unwrap();
        assert!(!report.safe);
        assert_eq!(report.running_tasks[0].task_id, "T1");

        // Scoped probe ignores other projects.
        assert!(check_worker_safety(&db, Some("p1")).await.unwrap().safe);

        let err = require_worker_safety(&db, false).await.unwrap_err();
        assert!(matches!(err, Error::WorkersRunning { running: 1 }));
        assert_eq!(err.kind(), "WorkerSafetyError");

        let forced = require_worker_safety(&db, true).await.unwrap();
        assert!(!forced.safe);
    }
}
