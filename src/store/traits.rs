//! Unified `Database` trait: single async interface for all persistence.
//!
//! Every method is one atomic unit against the shared datastore. Methods
//! that enforce cross-process invariants (`apply_transition`,
//! `acquire_locks`) run inside an IMMEDIATE transaction so concurrent
//! processes serialise on the database write lock.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{DatabaseError, TransitionError};
use crate::escalation::{Escalation, EscalationFilter, EscalationStats, EscalationStatus};
use crate::model::{
    Entity, EntityType, FileLock, Order, Project, Role, Task, TaskStatus, TransitionRecord,
    WorkerOutcome, WorkerRun,
};
use crate::transitions::rules::{RuleStore, TransitionRule};

/// How a task move into IN_PROGRESS treats the task's file locks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockPolicy {
    /// Take every target file lock in the same unit as the status change.
    /// A conflict refuses the transition.
    #[default]
    Acquire,
    /// The caller acquires the locks as a separate step.
    Deferred,
}

/// A requested status change.
///
/// Leaving IN_PROGRESS always drops the task's locks in the same unit.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub entity_type: EntityType,
    pub project_id: String,
    pub entity_id: String,
    pub to_status: String,
    pub role: Role,
    pub actor: String,
    pub reason: Option<String>,
    pub locks: LockPolicy,
}

/// Result of a committed transition.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedTransition {
    pub from_status: String,
    pub entity: Entity,
}

/// Filter for transition history. Empty matches everything.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub entity_type: Option<EntityType>,
    pub project_id: Option<String>,
    pub entity_id: Option<String>,
}

/// Outcome of an all-or-nothing lock attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    /// Every path is held by the task; `newly_locked` rows were inserted.
    Acquired { newly_locked: usize },
    /// First path (in input order) held by another task. Nothing was written.
    Conflict { path: String, holder: String },
}

/// A history row written verbatim, bypassing rule validation.
#[derive(Debug, Clone)]
pub struct ImportedTransition {
    pub entity_type: EntityType,
    pub project_id: String,
    pub entity_id: String,
    pub from_status: String,
    pub to_status: String,
    pub role: String,
    pub actor: String,
    pub reason: Option<String>,
}

/// Backend-agnostic database trait covering work items, locks, history,
/// worker telemetry, and escalations.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// Number of schema migrations not yet applied.
    async fn pending_migrations(&self) -> Result<usize, DatabaseError>;

    // ── Projects ────────────────────────────────────────────────────

    async fn insert_project(&self, project: &Project) -> Result<(), DatabaseError>;

    async fn get_project(&self, id: &str) -> Result<Option<Project>, DatabaseError>;

    // ── Orders ──────────────────────────────────────────────────────

    async fn insert_order(&self, order: &Order) -> Result<(), DatabaseError>;

    async fn get_order(&self, project_id: &str, id: &str) -> Result<Option<Order>, DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    async fn get_task(&self, project_id: &str, id: &str) -> Result<Option<Task>, DatabaseError>;

    /// Tasks of one order, optionally restricted to a status, ordered by id.
    async fn list_tasks_by_order(
        &self,
        project_id: &str,
        order_id: &str,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>, DatabaseError>;

    /// Tasks in a status across one project (or all projects).
    async fn list_tasks_by_status(
        &self,
        project_id: Option<&str>,
        status: TaskStatus,
    ) -> Result<Vec<Task>, DatabaseError>;

    // ── Status transitions ──────────────────────────────────────────

    async fn load_transition_rules(&self) -> Result<Vec<TransitionRule>, DatabaseError>;

    /// Validate against `rules` and write status + history in one unit.
    ///
    /// Reads the current status inside the transaction, so a concurrent
    /// writer can never slip between the check and the write.
    async fn apply_transition(
        &self,
        request: &TransitionRequest,
        rules: &RuleStore,
    ) -> Result<AppliedTransition, TransitionError>;

    /// History rows matching the filter, oldest first.
    async fn list_transition_history(
        &self,
        filter: &HistoryFilter,
    ) -> Result<Vec<TransitionRecord>, DatabaseError>;

    /// Append a history row as-is (history import from another datastore).
    async fn import_transition_record(
        &self,
        record: &ImportedTransition,
    ) -> Result<i64, DatabaseError>;

    // ── File locks ──────────────────────────────────────────────────

    /// Lock every path for the task, or none of them.
    async fn acquire_locks(
        &self,
        project_id: &str,
        task_id: &str,
        paths: &[String],
    ) -> Result<LockAttempt, DatabaseError>;

    /// Same check as `acquire_locks` without writing anything.
    async fn probe_locks(
        &self,
        project_id: &str,
        task_id: &str,
        paths: &[String],
    ) -> Result<LockAttempt, DatabaseError>;

    /// Drop every lock held by the task. Returns the number released.
    async fn release_locks(&self, project_id: &str, task_id: &str) -> Result<usize, DatabaseError>;

    /// Drop the lock on one path regardless of owner.
    async fn release_lock_path(&self, project_id: &str, path: &str)
    -> Result<bool, DatabaseError>;

    /// Live locks, ordered by project then path.
    async fn list_locks(&self, project_id: Option<&str>) -> Result<Vec<FileLock>, DatabaseError>;

    // ── Worker runs ─────────────────────────────────────────────────

    async fn insert_worker_run(&self, run: &WorkerRun) -> Result<(), DatabaseError>;

    /// Bump `last_heartbeat_at` to now.
    async fn touch_worker_run(&self, run_id: &str) -> Result<(), DatabaseError>;

    async fn finish_worker_run(
        &self,
        run_id: &str,
        outcome: WorkerOutcome,
        exit_code: Option<i32>,
        output_tail: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Most recently started run for the task.
    async fn latest_worker_run(
        &self,
        project_id: &str,
        task_id: &str,
    ) -> Result<Option<WorkerRun>, DatabaseError>;

    // ── Escalations ─────────────────────────────────────────────────

    async fn insert_escalation(&self, escalation: &Escalation) -> Result<(), DatabaseError>;

    async fn get_escalation(&self, id: Uuid) -> Result<Option<Escalation>, DatabaseError>;

    /// Escalations matching the filter, newest first.
    async fn list_escalations(
        &self,
        filter: &EscalationFilter,
    ) -> Result<Vec<Escalation>, DatabaseError>;

    async fn escalation_counts(
        &self,
        filter: &EscalationFilter,
    ) -> Result<EscalationStats, DatabaseError>;

    /// Compare-and-swap the status column. Returns false if `from` no longer matches.
    async fn update_escalation_status(
        &self,
        id: Uuid,
        from: EscalationStatus,
        to: EscalationStatus,
    ) -> Result<bool, DatabaseError>;
}
