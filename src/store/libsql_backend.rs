//! libSQL backend: async `Database` trait implementation.
//!
//! One connection per process, shared behind an async mutex so the
//! statements of one atomic unit never interleave with another tokio
//! task's. Cross-process exclusion comes from SQLite itself: WAL mode,
//! a busy timeout, and IMMEDIATE transactions for every unit that checks
//! then writes.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, TransactionBehavior, params};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, TransitionError};
use crate::escalation::{
    EntityRef, Escalation, EscalationFilter, EscalationStats, EscalationStatus,
};
use crate::model::{
    Entity, EntityType, FileLock, Order, Project, Task, TaskStatus, TransitionRecord,
    WorkerOutcome, WorkerRun,
};
use crate::store::migrations;
use crate::store::traits::{
    AppliedTransition, Database, HistoryFilter, ImportedTransition, LockAttempt, LockPolicy,
    TransitionRequest,
};
use crate::transitions::rules::{RuleStore, TransitionRule};

/// How long a writer waits on another process's write lock.
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// libSQL database backend.
pub struct LibSqlBackend {
    _db: libsql::Database,
    conn: Mutex<Connection>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        let backend = Self::open_local(path).await?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Open a local database file without touching the schema.
    pub async fn open_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        pragma(&conn, "PRAGMA journal_mode = WAL").await?;
        pragma(&conn, &format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}")).await?;

        Ok(Self {
            _db: db,
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            _db: db,
            conn: Mutex::new(conn),
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Get a lock on the connection for the duration of one unit.
    async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

// ── Helper functions ────────────────────────────────────────────────

async fn pragma(conn: &Connection, sql: &str) -> Result<(), DatabaseError> {
    let mut rows = conn
        .query(sql, ())
        .await
        .map_err(|e| DatabaseError::Pool(format!("{sql}: {e}")))?;
    while let Ok(Some(_)) = rows.next().await {}
    Ok(())
}

/// Canonical write format: fixed-width UTC so string order is time order.
fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: &Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_ts(dt)),
        None => libsql::Value::Null,
    }
}

fn to_json_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

fn parse_json_list(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

fn query_err(context: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{context}: {e}"))
}

fn parse_err(e: crate::error::ValidationError) -> DatabaseError {
    DatabaseError::Serialization(e.to_string())
}

const PROJECT_COLUMNS: &str = "id, name, status, supervisor_id, root_path, created_at, updated_at";

const ORDER_COLUMNS: &str =
    "project_id, id, title, priority, status, target_modules, created_at, updated_at";

const TASK_COLUMNS: &str = "project_id, id, order_id, title, description, status, priority, assignee, target_files, depends_on, reject_count, started_at, completed_at, created_at, updated_at";

const HISTORY_COLUMNS: &str =
    "id, entity_type, project_id, entity_id, from_status, to_status, role, actor, reason, created_at";

const WORKER_RUN_COLUMNS: &str = "id, project_id, task_id, pid, log_path, outcome, exit_code, output_tail, started_at, last_heartbeat_at, finished_at, log_offset";

const ESCALATION_COLUMNS: &str = "id, escalation_type, project_id, order_id, task_id, title, description, status, metadata, created_at, updated_at";

fn row_to_project(row: &libsql::Row) -> Result<Project, DatabaseError> {
    let q = query_err("project row");
    let status: String = row.get(2).map_err(&q)?;
    let created: String = row.get(5).map_err(&q)?;
    let updated: String = row.get(6).map_err(&q)?;
    Ok(Project {
        id: row.get(0).map_err(&q)?,
        name: row.get(1).map_err(&q)?,
        status: status.parse().map_err(parse_err)?,
        supervisor_id: row.get(3).ok(),
        root_path: row.get(4).ok(),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_order(row: &libsql::Row) -> Result<Order, DatabaseError> {
    let q = query_err("order row");
    let priority: String = row.get(3).map_err(&q)?;
    let status: String = row.get(4).map_err(&q)?;
    let modules: String = row.get(5).map_err(&q)?;
    let created: String = row.get(6).map_err(&q)?;
    let updated: String = row.get(7).map_err(&q)?;
    Ok(Order {
        project_id: row.get(0).map_err(&q)?,
        id: row.get(1).map_err(&q)?,
        title: row.get(2).map_err(&q)?,
        priority: priority.parse().map_err(parse_err)?,
        status: status.parse().map_err(parse_err)?,
        target_modules: parse_json_list(&modules),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let q = query_err("task row");
    let status: String = row.get(5).map_err(&q)?;
    let priority: String = row.get(6).map_err(&q)?;
    let files: String = row.get(8).map_err(&q)?;
    let deps: String = row.get(9).map_err(&q)?;
    let reject_count: i64 = row.get(10).map_err(&q)?;
    let started: Option<String> = row.get(11).ok();
    let completed: Option<String> = row.get(12).ok();
    let created: String = row.get(13).map_err(&q)?;
    let updated: String = row.get(14).map_err(&q)?;
    Ok(Task {
        project_id: row.get(0).map_err(&q)?,
        id: row.get(1).map_err(&q)?,
        order_id: row.get(2).map_err(&q)?,
        title: row.get(3).map_err(&q)?,
        description: row.get(4).ok(),
        status: status.parse().map_err(parse_err)?,
        priority: priority.parse().map_err(parse_err)?,
        assignee: row.get(7).ok(),
        target_files: parse_json_list(&files),
        depends_on: parse_json_list(&deps),
        reject_count: reject_count.max(0) as u32,
        started_at: parse_optional_datetime(&started),
        completed_at: parse_optional_datetime(&completed),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_history(row: &libsql::Row) -> Result<TransitionRecord, DatabaseError> {
    let q = query_err("history row");
    let entity_type: String = row.get(1).map_err(&q)?;
    let created: String = row.get(9).map_err(&q)?;
    Ok(TransitionRecord {
        id: row.get(0).map_err(&q)?,
        entity_type: entity_type.parse().map_err(parse_err)?,
        project_id: row.get(2).map_err(&q)?,
        entity_id: row.get(3).map_err(&q)?,
        from_status: row.get(4).map_err(&q)?,
        to_status: row.get(5).map_err(&q)?,
        role: row.get(6).map_err(&q)?,
        actor: row.get(7).map_err(&q)?,
        reason: row.get(8).ok(),
        created_at: parse_datetime(&created),
    })
}

fn row_to_worker_run(row: &libsql::Row) -> Result<WorkerRun, DatabaseError> {
    let q = query_err("worker run row");
    let pid: Option<i64> = row.get(3).ok();
    let outcome: String = row.get(5).map_err(&q)?;
    let exit_code: Option<i64> = row.get(6).ok();
    let started: String = row.get(8).map_err(&q)?;
    let heartbeat: String = row.get(9).map_err(&q)?;
    let finished: Option<String> = row.get(10).ok();
    let log_offset: i64 = row.get(11).unwrap_or(0);
    Ok(WorkerRun {
        id: row.get(0).map_err(&q)?,
        project_id: row.get(1).map_err(&q)?,
        task_id: row.get(2).map_err(&q)?,
        pid: pid.map(|p| p as u32),
        log_path: row.get(4).ok(),
        log_offset: log_offset.max(0) as u64,
        outcome: outcome.parse().map_err(parse_err)?,
        exit_code: exit_code.map(|c| c as i32),
        output_tail: row.get(7).ok(),
        started_at: parse_datetime(&started),
        last_heartbeat_at: parse_datetime(&heartbeat),
        finished_at: parse_optional_datetime(&finished),
    })
}

fn row_to_escalation(row: &libsql::Row) -> Result<Escalation, DatabaseError> {
    let q = query_err("escalation row");
    let id: String = row.get(0).map_err(&q)?;
    let escalation_type: String = row.get(1).map_err(&q)?;
    let status: String = row.get(7).map_err(&q)?;
    let metadata: String = row.get(8).map_err(&q)?;
    let created: String = row.get(9).map_err(&q)?;
    let updated: String = row.get(10).map_err(&q)?;
    Ok(Escalation {
        id: Uuid::parse_str(&id).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        escalation_type: escalation_type.parse().map_err(parse_err)?,
        entity: EntityRef {
            project_id: row.get(2).map_err(&q)?,
            order_id: row.get(3).ok(),
            task_id: row.get(4).ok(),
        },
        title: row.get(5).map_err(&q)?,
        description: row.get(6).map_err(&q)?,
        status: status.parse().map_err(parse_err)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

async fn query_task(
    conn: &Connection,
    project_id: &str,
    id: &str,
) -> Result<Option<Task>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE project_id = ?1 AND id = ?2"),
            params![project_id, id],
        )
        .await
        .map_err(query_err("get_task"))?;

    match rows.next().await.map_err(query_err("get_task"))? {
        Some(row) => Ok(Some(row_to_task(&row)?)),
        None => Ok(None),
    }
}

async fn query_order(
    conn: &Connection,
    project_id: &str,
    id: &str,
) -> Result<Option<Order>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE project_id = ?1 AND id = ?2"),
            params![project_id, id],
        )
        .await
        .map_err(query_err("get_order"))?;

    match rows.next().await.map_err(query_err("get_order"))? {
        Some(row) => Ok(Some(row_to_order(&row)?)),
        None => Ok(None),
    }
}

async fn collect_tasks(mut rows: libsql::Rows) -> Result<Vec<Task>, DatabaseError> {
    let mut tasks = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err("task rows"))? {
        tasks.push(row_to_task(&row)?);
    }
    Ok(tasks)
}

/// Status check, rule check, lock bookkeeping, CAS write, and history
/// append. Runs inside the caller's transaction.
async fn apply_in_tx(
    conn: &Connection,
    request: &TransitionRequest,
    rules: &RuleStore,
) -> Result<AppliedTransition, TransitionError> {
    request.entity_type.validate_status(&request.to_status)?;

    let (from, target_files) = match request.entity_type {
        EntityType::Task => query_task(conn, &request.project_id, &request.entity_id)
            .await?
            .map(|t| (t.status.as_str(), t.target_files)),
        EntityType::Order => query_order(conn, &request.project_id, &request.entity_id)
            .await?
            .map(|o| (o.status.as_str(), Vec::new())),
    }
    .ok_or_else(|| TransitionError::NotFound {
        entity_type: request.entity_type.to_string(),
        entity_id: request.entity_id.clone(),
    })?;

    rules.validate(
        request.entity_type,
        &request.entity_id,
        from,
        &request.to_status,
        request.role,
    )?;

    let in_progress = TaskStatus::InProgress.as_str();
    let is_task = request.entity_type == EntityType::Task;
    if is_task
        && request.to_status == in_progress
        && from != in_progress
        && request.locks == LockPolicy::Acquire
    {
        let paths = crate::locks::normalize_paths(&target_files)?;
        if let LockAttempt::Conflict { path, holder } =
            acquire_in_tx(conn, &request.project_id, &request.entity_id, &paths).await?
        {
            return Err(TransitionError::LockConflict {
                entity_id: request.entity_id.clone(),
                path,
                holder,
            });
        }
    }

    let now = fmt_ts(&Utc::now());
    let updated = match request.entity_type {
        EntityType::Task => {
            let reject_increment: i64 = i64::from(
                from == TaskStatus::Rework.as_str()
                    && request.to_status == TaskStatus::Rejected.as_str(),
            );
            conn.execute(
                "UPDATE tasks SET
                    status = ?1,
                    updated_at = ?2,
                    started_at = CASE WHEN ?1 = 'IN_PROGRESS' THEN ?2 ELSE started_at END,
                    completed_at = CASE
                        WHEN ?1 IN ('DONE', 'COMPLETED') THEN ?2
                        WHEN ?1 IN ('QUEUED', 'IN_PROGRESS') THEN NULL
                        ELSE completed_at END,
                    reject_count = reject_count + ?3
                 WHERE project_id = ?4 AND id = ?5 AND status = ?6",
                params![
                    request.to_status.as_str(),
                    now.as_str(),
                    reject_increment,
                    request.project_id.as_str(),
                    request.entity_id.as_str(),
                    from
                ],
            )
            .await
            .map_err(query_err("apply_transition update task"))?
        }
        EntityType::Order => conn
            .execute(
                "UPDATE orders SET status = ?1, updated_at = ?2
                 WHERE project_id = ?3 AND id = ?4 AND status = ?5",
                params![
                    request.to_status.as_str(),
                    now.as_str(),
                    request.project_id.as_str(),
                    request.entity_id.as_str(),
                    from
                ],
            )
            .await
            .map_err(query_err("apply_transition update order"))?,
    };
    if updated != 1 {
        return Err(DatabaseError::Constraint(format!(
            "{} {} changed status during transition",
            request.entity_type, request.entity_id
        ))
        .into());
    }

    if is_task && from == in_progress && request.to_status != in_progress {
        let released = conn
            .execute(
                "DELETE FROM file_locks WHERE project_id = ?1 AND task_id = ?2",
                params![request.project_id.as_str(), request.entity_id.as_str()],
            )
            .await
            .map_err(query_err("apply_transition release locks"))?;
        debug!(task_id = %request.entity_id, released, "Locks released with status change");
    }

    conn.execute(
        "INSERT INTO status_transition_history
            (entity_type, project_id, entity_id, from_status, to_status, role, actor, reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            request.entity_type.as_str(),
            request.project_id.as_str(),
            request.entity_id.as_str(),
            from,
            request.to_status.as_str(),
            request.role.as_str(),
            request.actor.as_str(),
            opt_text(request.reason.as_deref()),
            now.as_str()
        ],
    )
    .await
    .map_err(query_err("apply_transition history"))?;

    let entity = match request.entity_type {
        EntityType::Task => query_task(conn, &request.project_id, &request.entity_id)
            .await?
            .map(Entity::Task),
        EntityType::Order => query_order(conn, &request.project_id, &request.entity_id)
            .await?
            .map(Entity::Order),
    }
    .ok_or_else(|| TransitionError::NotFound {
        entity_type: request.entity_type.to_string(),
        entity_id: request.entity_id.clone(),
    })?;

    Ok(AppliedTransition {
        from_status: from.to_string(),
        entity,
    })
}

/// First path (input order) held by a task other than `task_id`, plus
/// the count of distinct paths not yet held by anyone.
async fn check_locks(
    conn: &Connection,
    project_id: &str,
    task_id: &str,
    paths: &[String],
) -> Result<(Option<LockAttempt>, usize), DatabaseError> {
    let mut free = 0;
    let mut seen = std::collections::HashSet::new();
    for path in paths {
        if !seen.insert(path.as_str()) {
            continue;
        }
        let mut rows = conn
            .query(
                "SELECT task_id FROM file_locks WHERE project_id = ?1 AND file_path = ?2",
                params![project_id, path.as_str()],
            )
            .await
            .map_err(query_err("check_locks"))?;

        match rows.next().await.map_err(query_err("check_locks"))? {
            Some(row) => {
                let holder: String = row.get(0).map_err(query_err("check_locks row"))?;
                if holder != task_id {
                    return Ok((
                        Some(LockAttempt::Conflict {
                            path: path.clone(),
                            holder,
                        }),
                        free,
                    ));
                }
            }
            None => free += 1,
        }
    }
    Ok((None, free))
}

async fn acquire_in_tx(
    conn: &Connection,
    project_id: &str,
    task_id: &str,
    paths: &[String],
) -> Result<LockAttempt, DatabaseError> {
    if let (Some(conflict), _) = check_locks(conn, project_id, task_id, paths).await? {
        return Ok(conflict);
    }

    let now = fmt_ts(&Utc::now());
    let mut newly_locked = 0;
    for path in paths {
        newly_locked += conn
            .execute(
                "INSERT INTO file_locks (project_id, file_path, task_id, acquired_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (project_id, file_path) DO NOTHING",
                params![project_id, path.as_str(), task_id, now.as_str()],
            )
            .await
            .map_err(query_err("acquire_locks insert"))? as usize;
    }
    Ok(LockAttempt::Acquired { newly_locked })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        migrations::run_migrations(&conn).await
    }

    async fn pending_migrations(&self) -> Result<usize, DatabaseError> {
        let conn = self.conn().await;
        migrations::pending_count(&conn).await
    }

    // ── Projects ────────────────────────────────────────────────────

    async fn insert_project(&self, project: &Project) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn.execute(
            &format!("INSERT INTO projects ({PROJECT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                project.id.as_str(),
                project.name.as_str(),
                project.status.as_str(),
                opt_text(project.supervisor_id.as_deref()),
                opt_text(project.root_path.as_deref()),
                fmt_ts(&project.created_at),
                fmt_ts(&project.updated_at)
            ],
        )
        .await
        .map_err(query_err("insert_project"))?;

        debug!(project_id = %project.id, "Project inserted into DB");
        Ok(())
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(query_err("get_project"))?;

        match rows.next().await.map_err(query_err("get_project"))? {
            Some(row) => Ok(Some(row_to_project(&row)?)),
            None => Ok(None),
        }
    }

    // ── Orders ──────────────────────────────────────────────────────

    async fn insert_order(&self, order: &Order) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn.execute(
            &format!("INSERT INTO orders ({ORDER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                order.project_id.as_str(),
                order.id.as_str(),
                order.title.as_str(),
                order.priority.as_str(),
                order.status.as_str(),
                to_json_list(&order.target_modules),
                fmt_ts(&order.created_at),
                fmt_ts(&order.updated_at)
            ],
        )
        .await
        .map_err(query_err("insert_order"))?;

        debug!(project_id = %order.project_id, order_id = %order.id, "Order inserted into DB");
        Ok(())
    }

    async fn get_order(&self, project_id: &str, id: &str) -> Result<Option<Order>, DatabaseError> {
        let conn = self.conn().await;
        query_order(&conn, project_id, id).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn.execute(
            &format!(
                "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                task.project_id.as_str(),
                task.id.as_str(),
                task.order_id.as_str(),
                task.title.as_str(),
                opt_text(task.description.as_deref()),
                task.status.as_str(),
                task.priority.as_str(),
                opt_text(task.assignee.as_deref()),
                to_json_list(&task.target_files),
                to_json_list(&task.depends_on),
                i64::from(task.reject_count),
                opt_ts(&task.started_at),
                opt_ts(&task.completed_at),
                fmt_ts(&task.created_at),
                fmt_ts(&task.updated_at)
            ],
        )
        .await
        .map_err(query_err("insert_task"))?;

        debug!(project_id = %task.project_id, task_id = %task.id, "Task inserted into DB");
        Ok(())
    }

    async fn get_task(&self, project_id: &str, id: &str) -> Result<Option<Task>, DatabaseError> {
        let conn = self.conn().await;
        query_task(&conn, project_id, id).await
    }

    async fn list_tasks_by_order(
        &self,
        project_id: &str,
        order_id: &str,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.conn().await;
        let rows = conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE project_id = ?1 AND order_id = ?2 AND (?3 IS NULL OR status = ?3)
                     ORDER BY id ASC"
                ),
                params![project_id, order_id, opt_text(status.map(|s| s.as_str()))],
            )
            .await
            .map_err(query_err("list_tasks_by_order"))?;
        collect_tasks(rows).await
    }

    async fn list_tasks_by_status(
        &self,
        project_id: Option<&str>,
        status: TaskStatus,
    ) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.conn().await;
        let rows = conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE (?1 IS NULL OR project_id = ?1) AND status = ?2
                     ORDER BY project_id ASC, id ASC"
                ),
                params![opt_text(project_id), status.as_str()],
            )
            .await
            .map_err(query_err("list_tasks_by_status"))?;
        collect_tasks(rows).await
    }

    // ── Status transitions ──────────────────────────────────────────

    async fn load_transition_rules(&self) -> Result<Vec<TransitionRule>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT entity_type, from_status, to_status, allowed_role, description
                 FROM status_transitions ORDER BY id ASC",
                (),
            )
            .await
            .map_err(query_err("load_transition_rules"))?;

        let mut rules = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("load_transition_rules"))? {
            let q = query_err("transition rule row");
            let entity_type: String = row.get(0).map_err(&q)?;
            let allowed_role: String = row.get(3).map_err(&q)?;
            rules.push(TransitionRule {
                entity_type: entity_type.parse().map_err(parse_err)?,
                from_status: row.get(1).map_err(&q)?,
                to_status: row.get(2).map_err(&q)?,
                allowed_role: allowed_role.parse().map_err(parse_err)?,
                description: row.get(4).unwrap_or_default(),
            });
        }
        Ok(rules)
    }

    async fn apply_transition(
        &self,
        request: &TransitionRequest,
        rules: &RuleStore,
    ) -> Result<AppliedTransition, TransitionError> {
        let conn = self.conn().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(query_err("apply_transition begin"))?;

        match apply_in_tx(&tx, request, rules).await {
            Ok(applied) => {
                tx.commit()
                    .await
                    .map_err(query_err("apply_transition commit"))?;
                debug!(
                    entity_type = %request.entity_type,
                    entity_id = %request.entity_id,
                    from = %applied.from_status,
                    to = %request.to_status,
                    "Transition committed"
                );
                Ok(applied)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "apply_transition rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn list_transition_history(
        &self,
        filter: &HistoryFilter,
    ) -> Result<Vec<TransitionRecord>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {HISTORY_COLUMNS} FROM status_transition_history
                     WHERE (?1 IS NULL OR entity_type = ?1)
                       AND (?2 IS NULL OR project_id = ?2)
                       AND (?3 IS NULL OR entity_id = ?3)
                     ORDER BY id ASC"
                ),
                params![
                    opt_text(filter.entity_type.map(|t| t.as_str())),
                    opt_text(filter.project_id.as_deref()),
                    opt_text(filter.entity_id.as_deref())
                ],
            )
            .await
            .map_err(query_err("list_transition_history"))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(query_err("list_transition_history"))?
        {
            records.push(row_to_history(&row)?);
        }
        Ok(records)
    }

    async fn import_transition_record(
        &self,
        record: &ImportedTransition,
    ) -> Result<i64, DatabaseError> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO status_transition_history
                (entity_type, project_id, entity_id, from_status, to_status, role, actor, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.entity_type.as_str(),
                record.project_id.as_str(),
                record.entity_id.as_str(),
                record.from_status.as_str(),
                record.to_status.as_str(),
                record.role.as_str(),
                record.actor.as_str(),
                opt_text(record.reason.as_deref()),
                fmt_ts(&Utc::now())
            ],
        )
        .await
        .map_err(query_err("import_transition_record"))?;
        Ok(conn.last_insert_rowid())
    }

    // ── File locks ──────────────────────────────────────────────────

    async fn acquire_locks(
        &self,
        project_id: &str,
        task_id: &str,
        paths: &[String],
    ) -> Result<LockAttempt, DatabaseError> {
        let conn = self.conn().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(query_err("acquire_locks begin"))?;

        match acquire_in_tx(&tx, project_id, task_id, paths).await {
            Ok(attempt @ LockAttempt::Acquired { .. }) => {
                tx.commit().await.map_err(query_err("acquire_locks commit"))?;
                Ok(attempt)
            }
            Ok(conflict) => {
                tx.rollback()
                    .await
                    .map_err(query_err("acquire_locks rollback"))?;
                Ok(conflict)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "acquire_locks rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn probe_locks(
        &self,
        project_id: &str,
        task_id: &str,
        paths: &[String],
    ) -> Result<LockAttempt, DatabaseError> {
        let conn = self.conn().await;
        match check_locks(&conn, project_id, task_id, paths).await? {
            (Some(conflict), _) => Ok(conflict),
            (None, free) => Ok(LockAttempt::Acquired { newly_locked: free }),
        }
    }

    async fn release_locks(&self, project_id: &str, task_id: &str) -> Result<usize, DatabaseError> {
        let conn = self.conn().await;
        let count = conn
            .execute(
                "DELETE FROM file_locks WHERE project_id = ?1 AND task_id = ?2",
                params![project_id, task_id],
            )
            .await
            .map_err(query_err("release_locks"))?;
        Ok(count as usize)
    }

    async fn release_lock_path(
        &self,
        project_id: &str,
        path: &str,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let count = conn
            .execute(
                "DELETE FROM file_locks WHERE project_id = ?1 AND file_path = ?2",
                params![project_id, path],
            )
            .await
            .map_err(query_err("release_lock_path"))?;
        Ok(count > 0)
    }

    async fn list_locks(&self, project_id: Option<&str>) -> Result<Vec<FileLock>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT project_id, file_path, task_id, acquired_at FROM file_locks
                 WHERE (?1 IS NULL OR project_id = ?1)
                 ORDER BY project_id ASC, file_path ASC",
                params![opt_text(project_id)],
            )
            .await
            .map_err(query_err("list_locks"))?;

        let mut locks = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_locks"))? {
            let q = query_err("lock row");
            let acquired: String = row.get(3).map_err(&q)?;
            locks.push(FileLock {
                project_id: row.get(0).map_err(&q)?,
                file_path: row.get(1).map_err(&q)?,
                task_id: row.get(2).map_err(&q)?,
                acquired_at: parse_datetime(&acquired),
            });
        }
        Ok(locks)
    }

    // ── Worker runs ─────────────────────────────────────────────────

    async fn insert_worker_run(&self, run: &WorkerRun) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn.execute(
            &format!(
                "INSERT INTO worker_runs ({WORKER_RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                run.id.as_str(),
                run.project_id.as_str(),
                run.task_id.as_str(),
                match run.pid {
                    Some(pid) => libsql::Value::Integer(i64::from(pid)),
                    None => libsql::Value::Null,
                },
                opt_text(run.log_path.as_deref()),
                run.outcome.as_str(),
                match run.exit_code {
                    Some(code) => libsql::Value::Integer(i64::from(code)),
                    None => libsql::Value::Null,
                },
                opt_text(run.output_tail.as_deref()),
                fmt_ts(&run.started_at),
                fmt_ts(&run.last_heartbeat_at),
                opt_ts(&run.finished_at),
                i64::try_from(run.log_offset).unwrap_or(i64::MAX)
            ],
        )
        .await
        .map_err(query_err("insert_worker_run"))?;

        debug!(run_id = %run.id, task_id = %run.task_id, "Worker run inserted into DB");
        Ok(())
    }

    async fn touch_worker_run(&self, run_id: &str) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn.execute(
            "UPDATE worker_runs SET last_heartbeat_at = ?1 WHERE id = ?2",
            params![fmt_ts(&Utc::now()), run_id],
        )
        .await
        .map_err(query_err("touch_worker_run"))?;
        Ok(())
    }

    async fn finish_worker_run(
        &self,
        run_id: &str,
        outcome: WorkerOutcome,
        exit_code: Option<i32>,
        output_tail: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        let now = fmt_ts(&Utc::now());
        conn.execute(
            "UPDATE worker_runs SET outcome = ?1, exit_code = ?2, output_tail = ?3,
                finished_at = ?4, last_heartbeat_at = ?4
             WHERE id = ?5",
            params![
                outcome.as_str(),
                match exit_code {
                    Some(code) => libsql::Value::Integer(i64::from(code)),
                    None => libsql::Value::Null,
                },
                opt_text(output_tail),
                now.as_str(),
                run_id
            ],
        )
        .await
        .map_err(query_err("finish_worker_run"))?;

        debug!(run_id, outcome = outcome.as_str(), "Worker run finished in DB");
        Ok(())
    }

    async fn latest_worker_run(
        &self,
        project_id: &str,
        task_id: &str,
    ) -> Result<Option<WorkerRun>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {WORKER_RUN_COLUMNS} FROM worker_runs
                     WHERE project_id = ?1 AND task_id = ?2
                     ORDER BY started_at DESC, rowid DESC LIMIT 1"
                ),
                params![project_id, task_id],
            )
            .await
            .map_err(query_err("latest_worker_run"))?;

        match rows.next().await.map_err(query_err("latest_worker_run"))? {
            Some(row) => Ok(Some(row_to_worker_run(&row)?)),
            None => Ok(None),
        }
    }

    // ── Escalations ─────────────────────────────────────────────────

    async fn insert_escalation(&self, escalation: &Escalation) -> Result<(), DatabaseError> {
        let metadata = serde_json::to_string(&escalation.metadata)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let conn = self.conn().await;
        conn.execute(
            &format!(
                "INSERT INTO escalations ({ESCALATION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                escalation.id.to_string(),
                escalation.escalation_type.as_str(),
                escalation.entity.project_id.as_str(),
                opt_text(escalation.entity.order_id.as_deref()),
                opt_text(escalation.entity.task_id.as_deref()),
                escalation.title.as_str(),
                escalation.description.as_str(),
                escalation.status.as_str(),
                metadata,
                fmt_ts(&escalation.created_at),
                fmt_ts(&escalation.updated_at)
            ],
        )
        .await
        .map_err(query_err("insert_escalation"))?;
        Ok(())
    }

    async fn get_escalation(&self, id: Uuid) -> Result<Option<Escalation>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {ESCALATION_COLUMNS} FROM escalations WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_escalation"))?;

        match rows.next().await.map_err(query_err("get_escalation"))? {
            Some(row) => Ok(Some(row_to_escalation(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_escalations(
        &self,
        filter: &EscalationFilter,
    ) -> Result<Vec<Escalation>, DatabaseError> {
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ESCALATION_COLUMNS} FROM escalations
                     WHERE (?1 IS NULL OR project_id = ?1)
                       AND (?2 IS NULL OR task_id = ?2)
                       AND (?3 IS NULL OR escalation_type = ?3)
                       AND (?4 IS NULL OR status = ?4)
                       AND (?5 IS NULL OR json_extract(metadata, '$.fingerprint') = ?5)
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT ?6"
                ),
                params![
                    opt_text(filter.project_id.as_deref()),
                    opt_text(filter.task_id.as_deref()),
                    opt_text(filter.escalation_type.map(|t| t.as_str())),
                    opt_text(filter.status.map(|s| s.as_str())),
                    opt_text(filter.fingerprint.as_deref()),
                    limit
                ],
            )
            .await
            .map_err(query_err("list_escalations"))?;

        let mut escalations = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_escalations"))? {
            escalations.push(row_to_escalation(&row)?);
        }
        Ok(escalations)
    }

    async fn escalation_counts(
        &self,
        filter: &EscalationFilter,
    ) -> Result<EscalationStats, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT escalation_type, status, COUNT(*) FROM escalations
                 WHERE (?1 IS NULL OR project_id = ?1)
                   AND (?2 IS NULL OR task_id = ?2)
                   AND (?3 IS NULL OR escalation_type = ?3)
                   AND (?4 IS NULL OR status = ?4)
                   AND (?5 IS NULL OR json_extract(metadata, '$.fingerprint') = ?5)
                 GROUP BY escalation_type, status",
                params![
                    opt_text(filter.project_id.as_deref()),
                    opt_text(filter.task_id.as_deref()),
                    opt_text(filter.escalation_type.map(|t| t.as_str())),
                    opt_text(filter.status.map(|s| s.as_str())),
                    opt_text(filter.fingerprint.as_deref())
                ],
            )
            .await
            .map_err(query_err("escalation_counts"))?;

        let mut stats = EscalationStats::default();
        while let Some(row) = rows.next().await.map_err(query_err("escalation_counts"))? {
            let escalation_type: String = row.get(0).unwrap_or_default();
            let status: String = row.get(1).unwrap_or_default();
            let count = row.get::<i64>(2).unwrap_or(0).max(0) as u64;
            stats.total += count;
            *stats.by_type.entry(escalation_type).or_default() += count;
            *stats.by_status.entry(status).or_default() += count;
        }
        Ok(stats)
    }

    async fn update_escalation_status(
        &self,
        id: Uuid,
        from: EscalationStatus,
        to: EscalationStatus,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let count = conn
            .execute(
                "UPDATE escalations SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![to.as_str(), fmt_ts(&Utc::now()), id.to_string(), from.as_str()],
            )
            .await
            .map_err(query_err("update_escalation_status"))?;
        Ok(count == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Order, OrderStatus, Role};

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    async fn seeded_db() -> LibSqlBackend {
        let db = test_db().await;
        db.insert_project(&Project::new("p1", "Demo")).await.unwrap();
        db.insert_order(&Order::new("p1", "O1", "First order").with_status(OrderStatus::InProgress))
            .await
            .unwrap();
        db
    }

    fn paths(ps: &[&str]) -> Vec<String> {
        ps.iter().map(|p| p.to_string()).collect()
    }

    fn request(task: &str, to: TaskStatus, role: Role) -> TransitionRequest {
        TransitionRequest {
            entity_type: EntityType::Task,
            project_id: "p1".into(),
            entity_id: task.into(),
            to_status: to.as_str().into(),
            role,
            actor: "test".into(),
            reason: None,
            locks: LockPolicy::Acquire,
        }
    }

    // ── Work item tests ─────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_get_task() {
        let db = seeded_db().await;
        let task = Task::new("p1", "O1", "T1", "Write parser")
            .with_files(["src/a.py", "src/b.py"])
            .with_depends_on(["T0"])
            .with_description("parse things");
        db.insert_task(&task).await.unwrap();

        let fetched = db.get_task("p1", "T1").await.unwrap().unwrap();
        assert_eq!(fetched.title, "Write parser");
        assert_eq!(fetched.target_files, vec!["src/a.py", "src/b.py"]);
        assert_eq!(fetched.depends_on, vec!["T0"]);
        assert_eq!(fetched.status, TaskStatus::Queued);
        assert_eq!(fetched.description.as_deref(), Some("parse things"));
        assert!(fetched.started_at.is_none());
    }

    #[tokio::test]
    async fn get_task_not_found() {
        let db = seeded_db().await;
        assert!(db.get_task("p1", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn order_ids_are_scoped_by_project() {
        let db = seeded_db().await;
        db.insert_project(&Project::new("p2", "Other")).await.unwrap();
        db.insert_order(&Order::new("p2", "O1", "Same id, other project"))
            .await
            .unwrap();

        let p1 = db.get_order("p1", "O1").await.unwrap().unwrap();
        let p2 = db.get_order("p2", "O1").await.unwrap().unwrap();
        assert_eq!(p1.status, OrderStatus::InProgress);
        assert_eq!(p2.status, OrderStatus::Planning);
    }

    #[tokio::test]
    async fn list_tasks_filters_by_order_and_status() {
        let db = seeded_db().await;
        db.insert_task(&Task::new("p1", "O1", "T2", "b")).await.unwrap();
        db.insert_task(&Task::new("p1", "O1", "T1", "a")).await.unwrap();
        db.insert_task(&Task::new("p1", "O1", "T3", "c").with_status(TaskStatus::Done))
            .await
            .unwrap();
        db.insert_task(&Task::new("p1", "O2", "T4", "d")).await.unwrap();

        let queued = db
            .list_tasks_by_order("p1", "O1", Some(TaskStatus::Queued))
            .await
            .unwrap();
        let ids: Vec<&str> = queued.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["T1", "T2"]);

        let all = db.list_tasks_by_order("p1", "O1", None).await.unwrap();
        assert_eq!(all.len(), 3);

        let done = db
            .list_tasks_by_status(None, TaskStatus::Done)
            .await
            .unwrap();
        assert_eq!(done.len(), 1);
    }

    // ── Transition tests ────────────────────────────────────────────

    #[tokio::test]
    async fn seeded_rules_load() {
        let db = test_db().await;
        let rules = RuleStore::load(&db).await.unwrap();
        assert!(rules.contains_edge(EntityType::Task, "QUEUED", "IN_PROGRESS"));
        assert!(rules.contains_edge(EntityType::Order, "REVIEW", "PENDING_RELEASE"));
        assert!(!rules.contains_edge(EntityType::Task, "DONE", "QUEUED"));
    }

    #[tokio::test]
    async fn apply_transition_writes_status_and_history() {
        let db = seeded_db().await;
        db.insert_task(&Task::new("p1", "O1", "T1", "a")).await.unwrap();
        let rules = RuleStore::load(&db).await.unwrap();

        let applied = db
            .apply_transition(&request("T1", TaskStatus::InProgress, Role::System), &rules)
            .await
            .unwrap();
        assert_eq!(applied.from_status, "QUEUED");
        match applied.entity {
            Entity::Task(t) => {
                assert_eq!(t.status, TaskStatus::InProgress);
                assert!(t.started_at.is_some());
            }
            other => panic!("expected task, got {other:?}"),
        }

        let history = db
            .list_transition_history(&HistoryFilter {
                entity_id: Some("T1".into()),
                ..HistoryFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from_status, "QUEUED");
        assert_eq!(history[0].to_status, "IN_PROGRESS");
        assert_eq!(history[0].role, "SYSTEM");
    }

    #[tokio::test]
    async fn rejected_transition_leaves_no_trace() {
        let db = seeded_db().await;
        db.insert_task(&Task::new("p1", "O1", "T1", "a")).await.unwrap();
        let rules = RuleStore::load(&db).await.unwrap();

        let err = db
            .apply_transition(&request("T1", TaskStatus::Completed, Role::Pm), &rules)
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::InvalidTransition { .. }));

        let task = db.get_task("p1", "T1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        let history = db
            .list_transition_history(&HistoryFilter::default())
            .await
            .unwrap();
        assert!(history.is_empty());

        // Connection is usable after the rollback.
        db.apply_transition(&request("T1", TaskStatus::InProgress, Role::System), &rules)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn order_transition_uses_order_rules() {
        let db = seeded_db().await;
        let rules = RuleStore::load(&db).await.unwrap();
        let req = TransitionRequest {
            entity_type: EntityType::Order,
            project_id: "p1".into(),
            entity_id: "O1".into(),
            to_status: "REVIEW".into(),
            role: Role::Pm,
            actor: "pm".into(),
            reason: Some("all tasks done".into()),
            locks: LockPolicy::default(),
        };
        let applied = db.apply_transition(&req, &rules).await.unwrap();
        assert_eq!(applied.entity.status_str(), "REVIEW");
        let order = db.get_order("p1", "O1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Review);
    }

    async fn lock_holders(db: &LibSqlBackend) -> Vec<(String, String)> {
        db.list_locks(Some("p1"))
            .await
            .unwrap()
            .into_iter()
            .map(|l| (l.file_path, l.task_id))
            .collect()
    }

    #[tokio::test]
    async fn leaving_in_progress_releases_locks() {
        let db = seeded_db().await;
        let rules = RuleStore::load(&db).await.unwrap();

        for (id, to, role) in [
            ("T1", TaskStatus::Cancelled, Role::Pm),
            ("T2", TaskStatus::WaitingInput, Role::Worker),
            ("T3", TaskStatus::Queued, Role::System),
            ("T4", TaskStatus::Done, Role::Worker),
        ] {
            let file = format!("{id}.py");
            db.insert_task(&Task::new("p1", "O1", id, id).with_files([file.as_str()]))
                .await
                .unwrap();
            db.apply_transition(&request(id, TaskStatus::InProgress, Role::System), &rules)
                .await
                .unwrap();
            assert_eq!(lock_holders(&db).await, vec![(file, id.to_string())]);

            db.apply_transition(&request(id, to, role), &rules)
                .await
                .unwrap();
            assert!(lock_holders(&db).await.is_empty(), "{id} -> {to} kept its locks");
        }
    }

    #[tokio::test]
    async fn reentry_from_waiting_input_takes_locks_or_is_refused() {
        let db = seeded_db().await;
        let rules = RuleStore::load(&db).await.unwrap();
        db.insert_task(&Task::new("p1", "O1", "T1", "a").with_files(["./a.py", "b.py"]))
            .await
            .unwrap();
        db.apply_transition(&request("T1", TaskStatus::InProgress, Role::System), &rules)
            .await
            .unwrap();
        db.apply_transition(&request("T1", TaskStatus::WaitingInput, Role::Worker), &rules)
            .await
            .unwrap();

        // Another task takes one of the paths while T1 waits.
        db.acquire_locks("p1", "T2", &paths(&["b.py"])).await.unwrap();
        let err = db
            .apply_transition(&request("T1", TaskStatus::InProgress, Role::Worker), &rules)
            .await
            .unwrap_err();
        match err {
            TransitionError::LockConflict { path, holder, .. } => {
                assert_eq!(path, "b.py");
                assert_eq!(holder, "T2");
            }
            other => panic!("expected lock conflict, got {other:?}"),
        }
        let task = db.get_task("p1", "T1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::WaitingInput);
        assert_eq!(lock_holders(&db).await, vec![("b.py".into(), "T2".into())]);
        let history = db
            .list_transition_history(&HistoryFilter::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 2);

        db.release_locks("p1", "T2").await.unwrap();
        db.apply_transition(&request("T1", TaskStatus::InProgress, Role::Worker), &rules)
            .await
            .unwrap();
        assert_eq!(
            lock_holders(&db).await,
            vec![("a.py".into(), "T1".into()), ("b.py".into(), "T1".into())]
        );
    }

    #[tokio::test]
    async fn deferred_claim_leaves_locks_to_the_caller() {
        let db = seeded_db().await;
        let rules = RuleStore::load(&db).await.unwrap();
        db.insert_task(&Task::new("p1", "O1", "T1", "a").with_files(["a.py"]))
            .await
            .unwrap();
        db.acquire_locks("p1", "T2", &paths(&["a.py"])).await.unwrap();

        let mut claim = request("T1", TaskStatus::InProgress, Role::System);
        claim.locks = LockPolicy::Deferred;
        db.apply_transition(&claim, &rules).await.unwrap();
        assert_eq!(lock_holders(&db).await, vec![("a.py".into(), "T2".into())]);
    }

    #[tokio::test]
    async fn import_bypasses_rules() {
        let db = seeded_db().await;
        let id = db
            .import_transition_record(&ImportedTransition {
                entity_type: EntityType::Task,
                project_id: "p1".into(),
                entity_id: "T9".into(),
                from_status: "DONE".into(),
                to_status: "QUEUED".into(),
                role: "HUMAN".into(),
                actor: "legacy".into(),
                reason: None,
            })
            .await
            .unwrap();
        assert!(id > 0);
        let history = db
            .list_transition_history(&HistoryFilter::default())
            .await
            .unwrap();
        assert_eq!(history[0].to_status, "QUEUED");
    }

    // ── Lock tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn acquire_and_list_locks() {
        let db = test_db().await;
        let attempt = db
            .acquire_locks("p1", "T1", &paths(&["a.py", "b.py", "a.py"]))
            .await
            .unwrap();
        assert_eq!(attempt, LockAttempt::Acquired { newly_locked: 2 });

        let locks = db.list_locks(Some("p1")).await.unwrap();
        let held: Vec<&str> = locks.iter().map(|l| l.file_path.as_str()).collect();
        assert_eq!(held, vec!["a.py", "b.py"]);
        assert!(locks.iter().all(|l| l.task_id == "T1"));
    }

    #[tokio::test]
    async fn conflicting_acquire_writes_nothing() {
        let db = test_db().await;
        db.acquire_locks("p1", "T1", &paths(&["b.py"])).await.unwrap();

        let attempt = db
            .acquire_locks("p1", "T2", &paths(&["a.py", "b.py", "c.py"]))
            .await
            .unwrap();
        assert_eq!(
            attempt,
            LockAttempt::Conflict {
                path: "b.py".into(),
                holder: "T1".into()
            }
        );

        let locks = db.list_locks(Some("p1")).await.unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].task_id, "T1");
    }

    #[tokio::test]
    async fn reacquire_by_owner_is_noop() {
        let db = test_db().await;
        db.acquire_locks("p1", "T1", &paths(&["a.py"])).await.unwrap();
        let attempt = db
            .acquire_locks("p1", "T1", &paths(&["a.py", "b.py"]))
            .await
            .unwrap();
        assert_eq!(attempt, LockAttempt::Acquired { newly_locked: 1 });
    }

    #[tokio::test]
    async fn locks_are_scoped_by_project() {
        let db = test_db().await;
        db.acquire_locks("p1", "T1", &paths(&["a.py"])).await.unwrap();
        let attempt = db.acquire_locks("p2", "T1", &paths(&["a.py"])).await.unwrap();
        assert_eq!(attempt, LockAttempt::Acquired { newly_locked: 1 });
        assert_eq!(db.list_locks(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn probe_never_writes() {
        let db = test_db().await;
        let attempt = db.probe_locks("p1", "T1", &paths(&["a.py"])).await.unwrap();
        assert_eq!(attempt, LockAttempt::Acquired { newly_locked: 1 });
        assert!(db.list_locks(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let db = test_db().await;
        db.acquire_locks("p1", "T1", &paths(&["a.py", "b.py"]))
            .await
            .unwrap();
        assert_eq!(db.release_locks("p1", "T1").await.unwrap(), 2);
        assert_eq!(db.release_locks("p1", "T1").await.unwrap(), 0);
        assert!(!db.release_lock_path("p1", "a.py").await.unwrap());
    }

    // ── Worker run tests ────────────────────────────────────────────

    #[tokio::test]
    async fn worker_run_lifecycle() {
        let db = test_db().await;
        let now = Utc::now();
        let run = WorkerRun {
            id: "run-1".into(),
            project_id: "p1".into(),
            task_id: "T1".into(),
            pid: Some(4242),
            log_path: Some("/tmp/T1.log".into()),
            log_offset: 512,
            outcome: WorkerOutcome::Running,
            exit_code: None,
            output_tail: None,
            started_at: now,
            last_heartbeat_at: now,
            finished_at: None,
        };
        db.insert_worker_run(&run).await.unwrap();
        db.finish_worker_run("run-1", WorkerOutcome::Failed, Some(3), Some("boom"))
            .await
            .unwrap();

        let latest = db.latest_worker_run("p1", "T1").await.unwrap().unwrap();
        assert_eq!(latest.outcome, WorkerOutcome::Failed);
        assert_eq!(latest.exit_code, Some(3));
        assert_eq!(latest.pid, Some(4242));
        assert_eq!(latest.log_offset, 512);
        assert_eq!(latest.output_tail.as_deref(), Some("boom"));
        assert!(latest.finished_at.is_some());
        assert!(db.latest_worker_run("p1", "T2").await.unwrap().is_none());
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let a = Utc::now();
        let b = a + chrono::Duration::milliseconds(1);
        assert!(fmt_ts(&a) < fmt_ts(&b));
        assert_eq!(parse_datetime(&fmt_ts(&a)).timestamp_micros(), a.timestamp_micros());
    }
}
