//! Parallel launcher: claims a launch batch and spawns one worker per task.
//!
//! A claim is two datastore units: QUEUED → IN_PROGRESS through the
//! transition engine, then all-or-nothing lock acquisition. If the locks are
//! lost to another process in between, the status change is compensated
//! back to QUEUED and the conflict is escalated. Every later move out of
//! IN_PROGRESS drops the task's locks in the same unit as the status change.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{DatabaseError, Error, LockError, TransitionError};
use crate::escalation::EntityRef;
use crate::locks::LockManager;
use crate::model::{EntityType, Role, Task, TaskStatus};
use crate::scheduler::detector::{Detector, LaunchPlan};
use crate::scheduler::runner::{WorkerJob, WorkerRunner};
use crate::store::Database;
use crate::transitions::TransitionEngine;

const LAUNCHER_ACTOR: &str = "launcher";

/// A task left out of a launch, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedTask {
    pub task_id: String,
    pub reason: String,
}

/// Result of one launch invocation.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchReport {
    pub launched_count: usize,
    pub launched_tasks: Vec<String>,
    pub skipped: Vec<SkippedTask>,
    pub dry_run: bool,
    pub message: String,
}

impl LaunchReport {
    fn new(dry_run: bool, launched_tasks: Vec<String>, skipped: Vec<SkippedTask>) -> Self {
        let verb = if dry_run { "Would launch" } else { "Launched" };
        let message = format!(
            "{verb} {} task(s), {} skipped",
            launched_tasks.len(),
            skipped.len()
        );
        Self {
            launched_count: launched_tasks.len(),
            launched_tasks,
            skipped,
            dry_run,
            message,
        }
    }

    /// Whether any task was held back by a conflict or dependency.
    pub fn has_conflicts(&self) -> bool {
        !self.skipped.is_empty()
    }
}

fn plan_skips(plan: &LaunchPlan) -> Vec<SkippedTask> {
    let mut skipped = Vec::new();
    for block in &plan.blocked_by_dependency {
        let waiting: Vec<String> = block
            .waiting_on
            .iter()
            .map(|(id, status)| format!("{id} ({status})"))
            .collect();
        skipped.push(SkippedTask {
            task_id: block.task_id.clone(),
            reason: format!("waiting on {}", waiting.join(", ")),
        });
    }
    for block in &plan.blocked_by_lock {
        skipped.push(SkippedTask {
            task_id: block.task_id.clone(),
            reason: format!("{} held by {}", block.path, block.holder.task_id()),
        });
    }
    for block in &plan.blocked_by_invalid_path {
        skipped.push(SkippedTask {
            task_id: block.task_id.clone(),
            reason: format!("invalid target path {:?}: {}", block.path, block.reason),
        });
    }
    for task_id in &plan.deferred {
        skipped.push(SkippedTask {
            task_id: task_id.clone(),
            reason: "deferred: worker budget exhausted".into(),
        });
    }
    skipped
}

type TaskKey = (String, String);

pub struct Launcher {
    db: Arc<dyn Database>,
    engine: Arc<TransitionEngine>,
    locks: LockManager,
    detector: Detector,
    runner: Arc<dyn WorkerRunner>,
    /// Worker completion tasks, keyed by (project, task).
    running: Arc<RwLock<HashMap<TaskKey, JoinHandle<()>>>>,
}

impl Launcher {
    pub fn new(
        db: Arc<dyn Database>,
        engine: Arc<TransitionEngine>,
        runner: Arc<dyn WorkerRunner>,
    ) -> Self {
        Self {
            locks: LockManager::new(Arc::clone(&db)),
            detector: Detector::new(Arc::clone(&db)),
            db,
            engine,
            runner,
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Select, claim, and start the next batch for an order.
    pub async fn launch(
        &self,
        project_id: &str,
        order_id: &str,
        max_workers: usize,
        dry_run: bool,
    ) -> Result<LaunchReport, Error> {
        let project = self
            .db
            .get_project(project_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "project".into(),
                id: project_id.to_string(),
            })?;
        if self.db.get_order(project_id, order_id).await?.is_none() {
            return Err(DatabaseError::NotFound {
                entity: "order".into(),
                id: order_id.to_string(),
            }
            .into());
        }

        let in_progress = self
            .db
            .list_tasks_by_order(project_id, order_id, Some(TaskStatus::InProgress))
            .await?
            .len();
        let budget = max_workers.saturating_sub(in_progress);

        let plan = self
            .detector
            .compute_launchable(project_id, order_id, budget)
            .await?;
        let mut skipped = plan_skips(&plan);

        if dry_run {
            let mut selected = Vec::new();
            for task in &plan.launchable {
                self.engine.validate(
                    EntityType::Task,
                    &task.id,
                    TaskStatus::Queued.as_str(),
                    TaskStatus::InProgress.as_str(),
                    Role::System,
                )?;
                match self.locks.probe(project_id, &task.id, &task.target_files).await {
                    Ok(()) => selected.push(task.id.clone()),
                    Err(LockError::Conflict { path, holder, .. }) => skipped.push(SkippedTask {
                        task_id: task.id.clone(),
                        reason: format!("{path} held by {holder}"),
                    }),
                    Err(e) => return Err(e.into()),
                }
            }
            let report = LaunchReport::new(true, selected, skipped);
            info!(project_id, order_id, message = %report.message, "Dry-run launch");
            return Ok(report);
        }

        let mut claimed: Vec<Task> = Vec::new();
        for task in plan.launchable {
            match self.claim(&task).await {
                Ok(task) => claimed.push(task),
                Err(Claim::Skipped(skip)) => skipped.push(skip),
                Err(Claim::Abort(err)) => {
                    self.unwind(&claimed).await;
                    return Err(err);
                }
            }
        }

        let workdir = project.root_path.as_ref().map(PathBuf::from);
        let mut launched = Vec::with_capacity(claimed.len());
        for task in claimed {
            launched.push(task.id.clone());
            self.spawn_worker(task, workdir.clone()).await;
        }

        let report = LaunchReport::new(false, launched, skipped);
        info!(
            project_id,
            order_id,
            launched = report.launched_count,
            skipped = report.skipped.len(),
            "Launch batch started"
        );
        Ok(report)
    }

    /// Claim one task: status first, then locks, compensating on conflict.
    async fn claim(&self, task: &Task) -> Result<Task, Claim> {
        let claimed = match self
            .engine
            .claim_task(
                &task.project_id,
                &task.id,
                LAUNCHER_ACTOR,
                Some("claimed for launch"),
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(TransitionError::InvalidTransition { from, .. })
                if from != TaskStatus::Queued.as_str() =>
            {
                info!(task_id = %task.id, now = %from, "Task claimed elsewhere; skipping");
                return Err(Claim::Skipped(SkippedTask {
                    task_id: task.id.clone(),
                    reason: format!("claimed elsewhere (now {from})"),
                }));
            }
            Err(e) => return Err(Claim::Abort(e.into())),
        };

        match self
            .locks
            .acquire(&task.project_id, &task.id, &task.target_files)
            .await
        {
            Ok(_) => Ok(claimed),
            Err(LockError::Conflict { path, holder, .. }) => {
                warn!(task_id = %task.id, %path, %holder, "Lock lost after claim; compensating");
                if let Err(e) = self.compensate(task, "file lock conflict after claim").await {
                    return Err(Claim::Abort(e));
                }
                self.record_lock_conflict(task, &path, &holder).await;
                Err(Claim::Skipped(SkippedTask {
                    task_id: task.id.clone(),
                    reason: format!("{path} held by {holder}"),
                }))
            }
            Err(e) => {
                if let Err(comp) = self.compensate(task, "lock acquisition failed").await {
                    error!(task_id = %task.id, error = %comp, "Compensation failed");
                }
                Err(Claim::Abort(e.into()))
            }
        }
    }

    /// Revert a claim: IN_PROGRESS → QUEUED, which also drops any locks.
    async fn compensate(&self, task: &Task, reason: &str) -> Result<(), Error> {
        self.engine
            .transition_task(
                &task.project_id,
                &task.id,
                TaskStatus::Queued,
                Role::System,
                LAUNCHER_ACTOR,
                Some(reason),
            )
            .await?;
        Ok(())
    }

    async fn unwind(&self, claimed: &[Task]) {
        for task in claimed {
            if let Err(e) = self.compensate(task, "launch aborted").await {
                error!(task_id = %task.id, error = %e, "Failed to unwind claim");
            }
        }
    }

    async fn record_lock_conflict(&self, task: &Task, path: &str, holder: &str) {
        self.engine
            .record_lock_conflict(
                EntityRef::task(&task.project_id, &task.id).with_order(&task.order_id),
                path,
                holder,
                format!("{path} was locked by task {holder} between claim and lock acquisition"),
            )
            .await;
    }

    async fn spawn_worker(&self, task: Task, workdir: Option<PathBuf>) {
        let key = (task.project_id.clone(), task.id.clone());
        let runner = Arc::clone(&self.runner);
        let engine = Arc::clone(&self.engine);

        let handle = tokio::spawn(async move {
            let project_id = task.project_id.clone();
            let task_id = task.id.clone();
            match runner.run(WorkerJob { task, workdir }).await {
                Ok(exit) => {
                    match engine
                        .transition_task(
                            &project_id,
                            &task_id,
                            TaskStatus::Done,
                            Role::Worker,
                            "worker",
                            Some(&format!("worker run {}", exit.run_id)),
                        )
                        .await
                    {
                        Ok(_) => info!(%task_id, "Task done"),
                        Err(e) => {
                            warn!(%task_id, error = %e, "Worker succeeded but DONE transition failed");
                        }
                    }
                }
                Err(e) => {
                    warn!(%task_id, error = %e, "Worker failed; task left IN_PROGRESS");
                }
            }
        });

        let mut running = self.running.write().await;
        running.retain(|_, h| !h.is_finished());
        running.insert(key, handle);
    }

    /// Number of worker completions still pending.
    pub async fn running_count(&self) -> usize {
        self.running
            .read()
            .await
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Wait for every spawned worker to finish and its outcome to be applied.
    pub async fn wait_all(&self) {
        let (keys, handles): (Vec<TaskKey>, Vec<JoinHandle<()>>) =
            self.running.write().await.drain().unzip();
        for ((_, task_id), result) in keys.into_iter().zip(join_all(handles).await) {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!(%task_id, error = %e, "Worker completion task panicked");
                }
            }
        }
    }

    /// Put an IN_PROGRESS task back in the queue; its locks go with the
    /// status change. Any worker still tracked for it is abandoned.
    pub async fn requeue(&self, project_id: &str, task_id: &str) -> Result<Task, Error> {
        if let Some(handle) = self
            .running
            .write()
            .await
            .remove(&(project_id.to_string(), task_id.to_string()))
        {
            handle.abort();
        }

        let task = self
            .engine
            .transition_task(
                project_id,
                task_id,
                TaskStatus::Queued,
                Role::System,
                "operator",
                Some("requeued"),
            )
            .await?;
        info!(project_id, task_id, "Task requeued");
        Ok(task)
    }
}

enum Claim {
    Skipped(SkippedTask),
    Abort(Error),
}

/// Drive `launch` periodically for one order.
pub fn spawn_launch_loop(
    launcher: Arc<Launcher>,
    project_id: String,
    order_id: String,
    max_workers: usize,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(%project_id, %order_id, interval_secs = interval.as_secs(), "Launch loop started");
        let mut tick = tokio::time::interval(interval);

        // First tick fires immediately
        loop {
            tick.tick().await;
            match launcher
                .launch(&project_id, &order_id, max_workers, false)
                .await
            {
                Ok(report) if report.launched_count > 0 => {
                    info!(%order_id, message = %report.message, "Launch cycle");
                }
                Ok(_) => {}
                Err(e) => warn!(%order_id, error = %e, kind = e.kind(), "Launch cycle failed"),
            }
        }
    })
}
