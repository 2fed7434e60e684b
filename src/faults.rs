//! Fault detector: polling checks over tasks, history, and worker output.
//!
//! Each detector is read-only and can run on its own; `detect_all`
//! concatenates the four. Only `escalate` writes, and it skips faults whose
//! fingerprint already has an OPEN escalation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::escalation::{EntityRef, EscalationRecorder, EscalationType};
use crate::model::{EntityType, Task, TaskStatus};
use crate::scheduler::runner::{log_path_for, read_tail};
use crate::store::{Database, HistoryFilter};
use crate::transitions::RuleStore;

/// Bytes of log tail scanned for abnormal-termination markers.
const LOG_TAIL_BYTES: u64 = 8192;

const CRASH_PATTERN: &str = r"(?im)(panicked at|segmentation fault|core dumped|fatal error|traceback \(most recent call last\)|out of memory|^killed\b)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Stuck,
    InvalidTransition,
    SubagentCrash,
    FileWriteFailure,
}

impl FaultKind {
    pub fn escalation_type(&self) -> EscalationType {
        match self {
            Self::Stuck => EscalationType::StuckTask,
            Self::InvalidTransition => EscalationType::InvalidTransition,
            Self::SubagentCrash => EscalationType::SubagentCrash,
            Self::FileWriteFailure => EscalationType::FileWriteFailure,
        }
    }
}

/// One detected anomaly.
#[derive(Debug, Clone, Serialize)]
pub struct FaultReport {
    pub kind: FaultKind,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub summary: String,
    /// Identity of the underlying fault. Two reports with the same
    /// fingerprint describe the same problem.
    pub fingerprint: String,
    pub details: serde_json::Value,
}

impl FaultReport {
    fn for_task(kind: FaultKind, task: &Task, summary: String, details: serde_json::Value) -> Self {
        Self {
            kind,
            project_id: task.project_id.clone(),
            order_id: Some(task.order_id.clone()),
            task_id: Some(task.id.clone()),
            summary,
            fingerprint: format!(
                "{}:{}:task:{}",
                kind.escalation_type(),
                task.project_id,
                task.id
            ),
            details,
        }
    }

    /// Narrow the fingerprint to one occurrence within the entity.
    fn keyed(mut self, part: impl std::fmt::Display) -> Self {
        self.fingerprint = format!("{}:{part}", self.fingerprint);
        self
    }

    fn entity_ref(&self) -> EntityRef {
        EntityRef {
            project_id: self.project_id.clone(),
            order_id: self.order_id.clone(),
            task_id: self.task_id.clone(),
        }
    }
}

pub struct FaultDetector {
    db: Arc<dyn Database>,
    rules: Arc<RuleStore>,
    escalations: EscalationRecorder,
    stuck_threshold: Duration,
    worker_log_dir: PathBuf,
    crash_pattern: Option<Regex>,
}

impl FaultDetector {
    pub fn new(db: Arc<dyn Database>, rules: Arc<RuleStore>, worker_log_dir: PathBuf) -> Self {
        Self {
            escalations: EscalationRecorder::new(Arc::clone(&db)),
            db,
            rules,
            stuck_threshold: Duration::from_secs(30 * 60),
            worker_log_dir,
            crash_pattern: Regex::new(CRASH_PATTERN).ok(),
        }
    }

    pub fn with_stuck_threshold(mut self, threshold: Duration) -> Self {
        self.stuck_threshold = threshold;
        self
    }

    /// Replace the log marker pattern used by crash detection.
    pub fn with_crash_pattern(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.crash_pattern = Some(Regex::new(pattern)?);
        Ok(self)
    }

    /// Run all four detectors as of now.
    pub async fn detect_all(
        &self,
        project_id: Option<&str>,
    ) -> Result<Vec<FaultReport>, DatabaseError> {
        self.detect_all_at(project_id, Utc::now()).await
    }

    /// Run all four detectors as of `now`.
    pub async fn detect_all_at(
        &self,
        project_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<FaultReport>, DatabaseError> {
        let mut reports = self.detect_stuck(project_id, now).await?;
        reports.extend(self.detect_invalid_transitions(project_id).await?);
        reports.extend(self.detect_crashes(project_id).await?);
        reports.extend(self.detect_file_write_failures(project_id).await?);
        debug!(count = reports.len(), "Fault detection pass complete");
        Ok(reports)
    }

    /// IN_PROGRESS tasks with no activity for longer than the threshold.
    /// Activity is the latest of claim time, worker heartbeat, and log write.
    pub async fn detect_stuck(
        &self,
        project_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<FaultReport>, DatabaseError> {
        let threshold = chrono::Duration::from_std(self.stuck_threshold)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let mut reports = Vec::new();

        for task in self
            .db
            .list_tasks_by_status(project_id, TaskStatus::InProgress)
            .await?
        {
            let started = task.started_at.unwrap_or(task.updated_at);
            let mut last_activity = started;

            let run = self.db.latest_worker_run(&task.project_id, &task.id).await?;
            if let Some(run) = &run {
                if run.started_at >= started {
                    last_activity = last_activity.max(run.last_heartbeat_at);
                }
            }
            let log_path = self.log_path(&task, run.as_ref().and_then(|r| r.log_path.as_deref()));
            if let Some(modified) = file_mtime(&log_path).await {
                last_activity = last_activity.max(modified);
            }

            let idle = now - last_activity;
            if idle > threshold {
                let elapsed_minutes = (now - started).num_minutes();
                reports.push(FaultReport::for_task(
                    FaultKind::Stuck,
                    &task,
                    format!(
                        "Task {} in progress for {elapsed_minutes} min with no activity for {} min",
                        task.id,
                        idle.num_minutes()
                    ),
                    json!({
                        "elapsed_minutes": elapsed_minutes,
                        "idle_minutes": idle.num_minutes(),
                        "threshold_minutes": threshold.num_minutes(),
                        "last_activity_at": last_activity,
                    }),
                )
                .keyed(started.timestamp_millis()));
            }
        }
        Ok(reports)
    }

    /// History rows whose edge is absent from the rule store.
    pub async fn detect_invalid_transitions(
        &self,
        project_id: Option<&str>,
    ) -> Result<Vec<FaultReport>, DatabaseError> {
        let history = self
            .db
            .list_transition_history(&HistoryFilter {
                project_id: project_id.map(str::to_string),
                ..HistoryFilter::default()
            })
            .await?;

        Ok(history
            .into_iter()
            .filter(|row| {
                !self
                    .rules
                    .contains_edge(row.entity_type, &row.from_status, &row.to_status)
            })
            .map(|row| {
                let (order_id, task_id) = match row.entity_type {
                    EntityType::Order => (Some(row.entity_id.clone()), None),
                    EntityType::Task => (None, Some(row.entity_id.clone())),
                };
                FaultReport {
                    kind: FaultKind::InvalidTransition,
                    project_id: row.project_id.clone(),
                    order_id,
                    task_id,
                    summary: format!(
                        "{} {} moved {} -> {} outside the rule table",
                        row.entity_type, row.entity_id, row.from_status, row.to_status
                    ),
                    fingerprint: format!(
                        "{}:{}:history:{}",
                        EscalationType::InvalidTransition,
                        row.project_id,
                        row.id
                    ),
                    details: json!({ "history": row }),
                }
            })
            .collect())
    }

    /// IN_PROGRESS tasks whose current worker ended abnormally or whose
    /// output since it started shows a crash marker. Runs from before the
    /// task's latest claim are ignored.
    pub async fn detect_crashes(
        &self,
        project_id: Option<&str>,
    ) -> Result<Vec<FaultReport>, DatabaseError> {
        let mut reports = Vec::new();

        for task in self
            .db
            .list_tasks_by_status(project_id, TaskStatus::InProgress)
            .await?
        {
            let started = task.started_at.unwrap_or(task.updated_at);
            let Some(run) = self
                .db
                .latest_worker_run(&task.project_id, &task.id)
                .await?
                .filter(|run| run.started_at >= started)
            else {
                continue;
            };

            if run.outcome.is_crash() {
                reports.push(
                    FaultReport::for_task(
                        FaultKind::SubagentCrash,
                        &task,
                        format!(
                            "Worker for task {} ended {} (exit code {:?})",
                            task.id,
                            run.outcome.as_str(),
                            run.exit_code
                        ),
                        json!({
                            "run_id": run.id,
                            "outcome": run.outcome,
                            "exit_code": run.exit_code,
                            "timed_out": run.outcome == crate::model::WorkerOutcome::TimedOut,
                            "output_tail": run.output_tail,
                        }),
                    )
                    .keyed(format!("run:{}", run.id)),
                );
                continue;
            }

            let Some(pattern) = &self.crash_pattern else {
                continue;
            };
            let log_path = self.log_path(&task, run.log_path.as_deref());
            let Some(tail) = read_tail(&log_path, run.log_offset, LOG_TAIL_BYTES).await else {
                continue;
            };
            if let Some(marker) = pattern.find(&tail) {
                reports.push(
                    FaultReport::for_task(
                        FaultKind::SubagentCrash,
                        &task,
                        format!("Worker log for task {} shows {:?}", task.id, marker.as_str()),
                        json!({
                            "run_id": run.id,
                            "log_path": log_path.display().to_string(),
                            "log_offset": run.log_offset,
                            "marker": marker.as_str(),
                        }),
                    )
                    .keyed(format!("run:{}", run.id)),
                );
            }
        }
        Ok(reports)
    }

    /// Finished tasks whose declared files are missing or were not written
    /// after the task started.
    pub async fn detect_file_write_failures(
        &self,
        project_id: Option<&str>,
    ) -> Result<Vec<FaultReport>, DatabaseError> {
        let mut finished = self
            .db
            .list_tasks_by_status(project_id, TaskStatus::Done)
            .await?;
        finished.extend(
            self.db
                .list_tasks_by_status(project_id, TaskStatus::Completed)
                .await?,
        );

        let mut roots: HashMap<String, Option<PathBuf>> = HashMap::new();
        let mut reports = Vec::new();

        for task in finished {
            if !roots.contains_key(&task.project_id) {
                let root = self
                    .db
                    .get_project(&task.project_id)
                    .await?
                    .and_then(|p| p.root_path)
                    .map(PathBuf::from);
                roots.insert(task.project_id.clone(), root);
            }
            let Some(Some(root)) = roots.get(&task.project_id) else {
                continue;
            };

            for declared in &task.target_files {
                let Ok(relative) = crate::locks::normalize_path(declared) else {
                    continue;
                };
                let path = root.join(relative.trim_start_matches('/'));
                let problem = match file_mtime(&path).await {
                    None => Some("missing"),
                    Some(modified) => match task.started_at {
                        Some(started) if modified < started => Some("not modified since task start"),
                        _ => None,
                    },
                };
                if let Some(problem) = problem {
                    reports.push(FaultReport::for_task(
                        FaultKind::FileWriteFailure,
                        &task,
                        format!("Task {} target {declared} {problem}", task.id),
                        json!({
                            "path": declared,
                            "resolved_path": path.display().to_string(),
                            "problem": problem,
                            "started_at": task.started_at,
                        }),
                    )
                    .keyed(format!("path:{relative}")));
                }
            }
        }
        Ok(reports)
    }

    /// Persist reports as escalations. Returns ids of newly recorded rows.
    pub async fn escalate(&self, reports: &[FaultReport]) -> Result<Vec<Uuid>, DatabaseError> {
        let mut recorded = Vec::new();
        for report in reports {
            let escalation_type = report.kind.escalation_type();
            if self
                .escalations
                .has_open(escalation_type, &report.project_id, &report.fingerprint)
                .await?
            {
                debug!(
                    kind = ?report.kind,
                    fingerprint = %report.fingerprint,
                    "Open escalation exists; skipping"
                );
                continue;
            }
            let mut metadata = match &report.details {
                serde_json::Value::Object(map) => map.clone(),
                other => {
                    let mut map = serde_json::Map::new();
                    map.insert("details".into(), other.clone());
                    map
                }
            };
            metadata.insert("fingerprint".into(), report.fingerprint.clone().into());
            let id = self
                .escalations
                .record(
                    escalation_type,
                    report.entity_ref(),
                    report.summary.clone(),
                    report.summary.clone(),
                    serde_json::Value::Object(metadata),
                )
                .await?;
            recorded.push(id);
        }
        if !recorded.is_empty() {
            info!(count = recorded.len(), "Faults escalated");
        }
        Ok(recorded)
    }

    fn log_path(&self, task: &Task, recorded: Option<&str>) -> PathBuf {
        match recorded {
            Some(path) => PathBuf::from(path),
            None => log_path_for(&self.worker_log_dir, &task.project_id, &task.id),
        }
    }
}

async fn file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    metadata.modified().ok().map(DateTime::<Utc>::from)
}
