//! Work-item data model: projects, orders, tasks, locks, and worker runs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Kind of entity whose status is governed by the transition engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Order,
    Task,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Order => "order",
            Self::Task => "task",
        }
    }

    /// Check that `status` names a status of this entity type.
    pub fn validate_status(&self, status: &str) -> Result<(), ValidationError> {
        match self {
            Self::Order => status.parse::<OrderStatus>().map(|_| ()),
            Self::Task => status.parse::<TaskStatus>().map(|_| ()),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "order" => Ok(Self::Order),
            "task" => Ok(Self::Task),
            other => Err(ValidationError::InvalidField {
                field: "entity_type".into(),
                reason: format!("unknown entity type {other:?}"),
            }),
        }
    }
}

/// Actor role requesting a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Planning/review role (project manager agent or human PM).
    Pm,
    /// The worker agent executing a task.
    Worker,
    /// The orchestrator itself (launcher, compensation).
    System,
    /// A human operator.
    Human,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pm => "PM",
            Self::Worker => "WORKER",
            Self::System => "SYSTEM",
            Self::Human => "HUMAN",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PM" => Ok(Self::Pm),
            "WORKER" => Ok(Self::Worker),
            "SYSTEM" => Ok(Self::System),
            "HUMAN" => Ok(Self::Human),
            _ => Err(ValidationError::UnknownRole(s.to_string())),
        }
    }
}

/// Scheduling priority. `P0` sorts first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Priority {
    P0,
    P1,
    #[default]
    P2,
    P3,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P0 => "P0",
            Self::P1 => "P1",
            Self::P2 => "P2",
            Self::P3 => "P3",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "P0" => Ok(Self::P0),
            "P1" => Ok(Self::P1),
            "P2" => Ok(Self::P2),
            "P3" => Ok(Self::P3),
            other => Err(ValidationError::InvalidField {
                field: "priority".into(),
                reason: format!("expected P0..P3, got {other:?}"),
            }),
        }
    }
}

/// Project lifecycle. Projects are never hard-deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    #[default]
    Active,
    OnHold,
    Archived,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::OnHold => "ON_HOLD",
            Self::Archived => "ARCHIVED",
        }
    }
}

impl FromStr for ProjectStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "ON_HOLD" => Ok(Self::OnHold),
            "ARCHIVED" => Ok(Self::Archived),
            _ => Err(ValidationError::UnknownStatus {
                entity: "project".into(),
                value: s.to_string(),
            }),
        }
    }
}

/// Order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Planning,
    InProgress,
    Review,
    PendingRelease,
    Completed,
    OnHold,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "PLANNING",
            Self::InProgress => "IN_PROGRESS",
            Self::Review => "REVIEW",
            Self::PendingRelease => "PENDING_RELEASE",
            Self::Completed => "COMPLETED",
            Self::OnHold => "ON_HOLD",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PLANNING" => Ok(Self::Planning),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "REVIEW" => Ok(Self::Review),
            "PENDING_RELEASE" => Ok(Self::PendingRelease),
            "COMPLETED" => Ok(Self::Completed),
            "ON_HOLD" => Ok(Self::OnHold),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(ValidationError::UnknownStatus {
                entity: "order".into(),
                value: s.to_string(),
            }),
        }
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Blocked,
    InProgress,
    Done,
    Rework,
    Rejected,
    Completed,
    WaitingInput,
    Cancelled,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Blocked => "BLOCKED",
            Self::InProgress => "IN_PROGRESS",
            Self::Done => "DONE",
            Self::Rework => "REWORK",
            Self::Rejected => "REJECTED",
            Self::Completed => "COMPLETED",
            Self::WaitingInput => "WAITING_INPUT",
            Self::Cancelled => "CANCELLED",
            Self::Skipped => "SKIPPED",
        }
    }

    /// Statuses that satisfy a dependency on this task.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Done | Self::Completed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "BLOCKED" => Ok(Self::Blocked),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "DONE" => Ok(Self::Done),
            "REWORK" => Ok(Self::Rework),
            "REJECTED" => Ok(Self::Rejected),
            "COMPLETED" => Ok(Self::Completed),
            "WAITING_INPUT" => Ok(Self::WaitingInput),
            "CANCELLED" => Ok(Self::Cancelled),
            "SKIPPED" => Ok(Self::Skipped),
            _ => Err(ValidationError::UnknownStatus {
                entity: "task".into(),
                value: s.to_string(),
            }),
        }
    }
}

/// A project: the scope for orders, tasks, and file locks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub status: ProjectStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor_id: Option<String>,
    /// Working directory for workers; target files resolve against it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            status: ProjectStatus::Active,
            supervisor_id: None,
            root_path: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set the project root directory.
    pub fn with_root_path(mut self, root: impl Into<String>) -> Self {
        self.root_path = Some(root.into());
        self
    }
}

/// A unit of planned work containing tasks, scoped to one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub priority: Priority,
    pub status: OrderStatus,
    #[serde(default)]
    pub target_modules: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        project_id: impl Into<String>,
        id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            project_id: project_id.into(),
            title: title.into(),
            priority: Priority::default(),
            status: OrderStatus::Planning,
            target_modules: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set status.
    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.status = status;
        self
    }
}

/// The smallest unit of orchestrated work, run by one worker at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub order_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    /// Files the task will modify, in declaration order.
    #[serde(default)]
    pub target_files: Vec<String>,
    /// Task ids (same project) that must be DONE/COMPLETED first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub reject_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        project_id: impl Into<String>,
        order_id: impl Into<String>,
        id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            project_id: project_id.into(),
            order_id: order_id.into(),
            title: title.into(),
            description: None,
            status: TaskStatus::Queued,
            priority: Priority::default(),
            assignee: None,
            target_files: Vec::new(),
            depends_on: Vec::new(),
            reject_count: 0,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set target files.
    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_files = files.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set dependencies.
    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: set status.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Builder: set description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }
}

/// An entity returned by a successful transition.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "entity_type", content = "entity", rename_all = "snake_case")]
pub enum Entity {
    Order(Order),
    Task(Task),
}

impl Entity {
    pub fn status_str(&self) -> &'static str {
        match self {
            Self::Order(o) => o.status.as_str(),
            Self::Task(t) => t.status.as_str(),
        }
    }
}

/// One row of status transition history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: i64,
    pub entity_type: EntityType,
    pub project_id: String,
    pub entity_id: String,
    pub from_status: String,
    pub to_status: String,
    pub role: String,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An exclusive claim on a file path within a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLock {
    pub project_id: String,
    pub file_path: String,
    pub task_id: String,
    pub acquired_at: DateTime<Utc>,
}

/// How a worker subprocess ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerOutcome {
    Running,
    Succeeded,
    Failed,
    TimedOut,
    SpawnFailed,
}

impl WorkerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
            Self::SpawnFailed => "SPAWN_FAILED",
        }
    }

    /// Whether the run ended abnormally.
    pub fn is_crash(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut | Self::SpawnFailed)
    }
}

impl FromStr for WorkerOutcome {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "TIMED_OUT" => Ok(Self::TimedOut),
            "SPAWN_FAILED" => Ok(Self::SpawnFailed),
            _ => Err(ValidationError::InvalidField {
                field: "outcome".into(),
                reason: format!("unknown worker outcome {s:?}"),
            }),
        }
    }
}

/// Telemetry for one worker subprocess run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRun {
    pub id: String,
    pub project_id: String,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    /// Log file length when this run started; its own output begins here.
    #[serde(default)]
    pub log_offset: u64,
    pub outcome: WorkerOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_parse_and_display() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::InProgress,
            TaskStatus::WaitingInput,
            TaskStatus::Rejected,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("RUNNING".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn task_status_serde_matches_db_strings() {
        let json = serde_json::to_string(&TaskStatus::WaitingInput).unwrap();
        assert_eq!(json, "\"WAITING_INPUT\"");
        let json = serde_json::to_string(&OrderStatus::PendingRelease).unwrap();
        assert_eq!(json, "\"PENDING_RELEASE\"");
    }

    #[test]
    fn dependency_satisfaction() {
        assert!(TaskStatus::Done.satisfies_dependency());
        assert!(TaskStatus::Completed.satisfies_dependency());
        assert!(!TaskStatus::InProgress.satisfies_dependency());
        assert!(!TaskStatus::Rework.satisfies_dependency());
    }

    #[test]
    fn priority_orders_p0_first() {
        let mut ps = vec![Priority::P3, Priority::P0, Priority::P2];
        ps.sort();
        assert_eq!(ps, vec![Priority::P0, Priority::P2, Priority::P3]);
        assert_eq!("p1".parse::<Priority>().unwrap(), Priority::P1);
    }

    #[test]
    fn role_parse_is_case_insensitive() {
        assert_eq!("worker".parse::<Role>().unwrap(), Role::Worker);
        assert!("robot".parse::<Role>().is_err());
    }

    #[test]
    fn entity_type_validates_status_names() {
        assert!(EntityType::Order.validate_status("REVIEW").is_ok());
        assert!(EntityType::Task.validate_status("REVIEW").is_err());
    }
}
