//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.
//! Transition rules are reference data: new edges ship as new migrations.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "work_items",
        sql: r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'ACTIVE',
                supervisor_id TEXT,
                root_path TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS orders (
                project_id TEXT NOT NULL REFERENCES projects(id),
                id TEXT NOT NULL,
                title TEXT NOT NULL,
                priority TEXT NOT NULL DEFAULT 'P2',
                status TEXT NOT NULL DEFAULT 'PLANNING',
                target_modules TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (project_id, id)
            );
            CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);

            CREATE TABLE IF NOT EXISTS tasks (
                project_id TEXT NOT NULL REFERENCES projects(id),
                id TEXT NOT NULL,
                order_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL DEFAULT 'QUEUED',
                priority TEXT NOT NULL DEFAULT 'P2',
                assignee TEXT,
                target_files TEXT NOT NULL DEFAULT '[]',
                depends_on TEXT NOT NULL DEFAULT '[]',
                reject_count INTEGER NOT NULL DEFAULT 0,
                started_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (project_id, id)
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_order ON tasks(project_id, order_id, status);
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        "#,
    },
    Migration {
        version: 2,
        name: "status_transitions",
        sql: r#"
            CREATE TABLE IF NOT EXISTS status_transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_type TEXT NOT NULL,
                from_status TEXT NOT NULL,
                to_status TEXT NOT NULL,
                allowed_role TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                UNIQUE (entity_type, from_status, to_status, allowed_role)
            );

            CREATE TABLE IF NOT EXISTS status_transition_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_type TEXT NOT NULL,
                project_id TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                from_status TEXT NOT NULL,
                to_status TEXT NOT NULL,
                role TEXT NOT NULL,
                actor TEXT NOT NULL,
                reason TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transition_history_entity
                ON status_transition_history(entity_type, project_id, entity_id);

            INSERT OR IGNORE INTO status_transitions (entity_type, from_status, to_status, allowed_role, description) VALUES
                ('task', 'QUEUED', 'IN_PROGRESS', 'SYSTEM', 'Launcher claims task'),
                ('task', 'QUEUED', 'IN_PROGRESS', 'WORKER', 'Worker picks up task'),
                ('task', 'QUEUED', 'BLOCKED', 'PM', 'Blocked by planning'),
                ('task', 'QUEUED', 'BLOCKED', 'SYSTEM', 'Blocked by dependency'),
                ('task', 'QUEUED', 'CANCELLED', 'PM', 'Cancelled before start'),
                ('task', 'QUEUED', 'SKIPPED', 'PM', 'Skipped by planning'),
                ('task', 'BLOCKED', 'QUEUED', 'PM', 'Unblocked by planning'),
                ('task', 'BLOCKED', 'QUEUED', 'SYSTEM', 'Dependency satisfied'),
                ('task', 'BLOCKED', 'CANCELLED', 'PM', 'Cancelled while blocked'),
                ('task', 'IN_PROGRESS', 'DONE', 'WORKER', 'Worker finished'),
                ('task', 'IN_PROGRESS', 'QUEUED', 'SYSTEM', 'Claim compensated or requeued'),
                ('task', 'IN_PROGRESS', 'WAITING_INPUT', 'WORKER', 'Worker needs input'),
                ('task', 'IN_PROGRESS', 'CANCELLED', 'PM', 'Cancelled mid-flight'),
                ('task', 'WAITING_INPUT', 'IN_PROGRESS', '*', 'Input supplied'),
                ('task', 'WAITING_INPUT', 'QUEUED', 'PM', 'Requeued after input'),
                ('task', 'DONE', 'COMPLETED', 'PM', 'Review approved'),
                ('task', 'DONE', 'REWORK', 'PM', 'Review requested rework'),
                ('task', 'REWORK', 'QUEUED', 'SYSTEM', 'Rework requeued'),
                ('task', 'REWORK', 'QUEUED', 'PM', 'Rework requeued by planning'),
                ('task', 'REWORK', 'REJECTED', 'PM', 'Rework rejected'),
                ('task', 'REJECTED', 'QUEUED', 'PM', 'Replanned after rejection'),
                ('task', 'REJECTED', 'CANCELLED', 'PM', 'Abandoned after rejection'),
                ('order', 'PLANNING', 'IN_PROGRESS', 'PM', 'Planning finished'),
                ('order', 'PLANNING', 'ON_HOLD', '*', 'Paused during planning'),
                ('order', 'PLANNING', 'CANCELLED', 'PM', 'Cancelled during planning'),
                ('order', 'PLANNING', 'CANCELLED', 'HUMAN', 'Cancelled during planning'),
                ('order', 'IN_PROGRESS', 'REVIEW', 'PM', 'All tasks finished'),
                ('order', 'IN_PROGRESS', 'REVIEW', 'SYSTEM', 'All tasks finished'),
                ('order', 'IN_PROGRESS', 'ON_HOLD', '*', 'Paused'),
                ('order', 'IN_PROGRESS', 'CANCELLED', 'PM', 'Cancelled mid-flight'),
                ('order', 'IN_PROGRESS', 'CANCELLED', 'HUMAN', 'Cancelled mid-flight'),
                ('order', 'REVIEW', 'IN_PROGRESS', 'PM', 'Review sent back'),
                ('order', 'REVIEW', 'PENDING_RELEASE', 'PM', 'Approved for release'),
                ('order', 'REVIEW', 'COMPLETED', 'PM', 'Approved without release'),
                ('order', 'REVIEW', 'ON_HOLD', '*', 'Paused in review'),
                ('order', 'PENDING_RELEASE', 'COMPLETED', '*', 'Released'),
                ('order', 'ON_HOLD', 'PLANNING', 'PM', 'Resumed into planning'),
                ('order', 'ON_HOLD', 'IN_PROGRESS', 'PM', 'Resumed'),
                ('order', 'ON_HOLD', 'CANCELLED', 'PM', 'Cancelled while paused'),
                ('order', 'ON_HOLD', 'CANCELLED', 'HUMAN', 'Cancelled while paused');
        "#,
    },
    Migration {
        version: 3,
        name: "file_locks",
        sql: r#"
            CREATE TABLE IF NOT EXISTS file_locks (
                project_id TEXT NOT NULL,
                file_path TEXT NOT NULL,
                task_id TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                PRIMARY KEY (project_id, file_path)
            );
            CREATE INDEX IF NOT EXISTS idx_file_locks_task ON file_locks(project_id, task_id);
        "#,
    },
    Migration {
        version: 4,
        name: "worker_runs_and_escalations",
        sql: r#"
            CREATE TABLE IF NOT EXISTS worker_runs (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                pid INTEGER,
                log_path TEXT,
                outcome TEXT NOT NULL DEFAULT 'RUNNING',
                exit_code INTEGER,
                output_tail TEXT,
                started_at TEXT NOT NULL,
                last_heartbeat_at TEXT NOT NULL,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_worker_runs_task
                ON worker_runs(project_id, task_id, started_at);

            CREATE TABLE IF NOT EXISTS escalations (
                id TEXT PRIMARY KEY,
                escalation_type TEXT NOT NULL,
                project_id TEXT NOT NULL,
                order_id TEXT,
                task_id TEXT,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'OPEN',
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_escalations_project ON escalations(project_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_escalations_task ON escalations(project_id, task_id);
            CREATE INDEX IF NOT EXISTS idx_escalations_type ON escalations(escalation_type);
        "#,
    },
    Migration {
        version: 5,
        name: "worker_run_log_offset",
        sql: r#"
            ALTER TABLE worker_runs ADD COLUMN log_offset INTEGER NOT NULL DEFAULT 0;
        "#,
    },
];

/// Latest schema version known to this build.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Number of migrations not yet applied on this connection.
pub async fn pending_count(conn: &Connection) -> Result<usize, DatabaseError> {
    ensure_tracking_table(conn).await?;
    let current = get_current_version(conn).await?;
    Ok(MIGRATIONS.iter().filter(|m| m.version > current).count())
}

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    ensure_tracking_table(conn).await?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

async fn ensure_tracking_table(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn count(conn: &Connection, sql: &str) -> i64 {
        let mut rows = conn.query(sql, ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        row.get(0).unwrap()
    }

    #[tokio::test]
    async fn migrations_run_on_a_spawned_task() {
        let conn = test_conn().await;
        let conn = tokio::spawn(async move {
            run_migrations(&conn).await.unwrap();
            conn
        })
        .await
        .unwrap();
        assert_eq!(pending_count(&conn).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "_migrations",
            "projects",
            "orders",
            "tasks",
            "status_transitions",
            "status_transition_history",
            "file_locks",
            "worker_runs",
            "escalations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        let rules = count(&conn, "SELECT COUNT(*) FROM status_transitions").await;

        run_migrations(&conn).await.unwrap();

        assert_eq!(get_current_version(&conn).await.unwrap(), latest_version());
        assert_eq!(
            count(&conn, "SELECT COUNT(*) FROM status_transitions").await,
            rules
        );
        assert_eq!(pending_count(&conn).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pending_count_on_fresh_db() {
        let conn = test_conn().await;
        assert_eq!(pending_count(&conn).await.unwrap(), MIGRATIONS.len());
    }

    #[tokio::test]
    async fn lock_table_rejects_duplicate_path() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO file_locks (project_id, file_path, task_id, acquired_at) VALUES ('p', 'a.py', 'T1', 'now')",
            (),
        )
        .await
        .unwrap();
        let dup = conn
            .execute(
                "INSERT INTO file_locks (project_id, file_path, task_id, acquired_at) VALUES ('p', 'a.py', 'T2', 'now')",
                (),
            )
            .await;
        assert!(dup.is_err());
    }
}
