//! Transition engine: the single gate through which task and order
//! statuses change.
//!
//! Validation runs against the loaded `RuleStore`; the write itself is one
//! datastore unit (status CAS + side columns + lock bookkeeping + history
//! row). Refusals and review rejections are recorded as escalations after
//! the fact.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{DatabaseError, TransitionError};
use crate::escalation::{EntityRef, EscalationRecorder, EscalationType};
use crate::model::{
    Entity, EntityType, Order, OrderStatus, Role, Task, TaskStatus, TransitionRecord,
};
use crate::store::{AppliedTransition, Database, HistoryFilter, LockPolicy, TransitionRequest};
use crate::transitions::rules::RuleStore;

/// Rejections at or above this count ask for a stronger model.
pub const DEFAULT_REJECT_THRESHOLD: u32 = 2;

pub struct TransitionEngine {
    db: Arc<dyn Database>,
    rules: Arc<RuleStore>,
    escalations: EscalationRecorder,
    reject_threshold: u32,
}

impl TransitionEngine {
    pub fn new(db: Arc<dyn Database>, rules: RuleStore) -> Self {
        Self {
            escalations: EscalationRecorder::new(Arc::clone(&db)),
            db,
            rules: Arc::new(rules),
            reject_threshold: DEFAULT_REJECT_THRESHOLD,
        }
    }

    /// Build an engine over the rules currently stored in the database.
    pub async fn load(db: Arc<dyn Database>) -> Result<Self, DatabaseError> {
        let rules = RuleStore::load(db.as_ref()).await?;
        Ok(Self::new(db, rules))
    }

    pub fn with_reject_threshold(mut self, threshold: u32) -> Self {
        self.reject_threshold = threshold.max(1);
        self
    }

    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    pub fn escalations(&self) -> &EscalationRecorder {
        &self.escalations
    }

    /// Check a transition without touching the datastore.
    pub fn validate(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        from: &str,
        to: &str,
        role: Role,
    ) -> Result<(), TransitionError> {
        entity_type.validate_status(from)?;
        entity_type.validate_status(to)?;
        self.rules
            .validate(entity_type, entity_id, from, to, role)
            .map(|_| ())
    }

    /// Validate and commit a transition.
    pub async fn apply(
        &self,
        request: &TransitionRequest,
    ) -> Result<AppliedTransition, TransitionError> {
        self.apply_with(request, None).await
    }

    /// Like `apply`, but a refusal caused by the entity no longer being in
    /// `expected_from` is a lost race, not a rule violation, and is not
    /// escalated.
    async fn apply_with(
        &self,
        request: &TransitionRequest,
        expected_from: Option<&str>,
    ) -> Result<AppliedTransition, TransitionError> {
        match self.db.apply_transition(request, &self.rules).await {
            Ok(applied) => {
                info!(
                    entity_type = %request.entity_type,
                    project_id = %request.project_id,
                    entity_id = %request.entity_id,
                    from = %applied.from_status,
                    to = %request.to_status,
                    role = %request.role,
                    actor = %request.actor,
                    "Status transition applied"
                );
                if let Entity::Task(task) = &applied.entity {
                    if applied.from_status == TaskStatus::Rework.as_str()
                        && task.status == TaskStatus::Rejected
                    {
                        self.record_rejection(task).await;
                    }
                }
                Ok(applied)
            }
            Err(err) => {
                match &err {
                    TransitionError::InvalidTransition { from, .. }
                    | TransitionError::ForbiddenTransition { from, .. }
                        if expected_from.is_some_and(|expected| expected != from.as_str()) =>
                    {
                        debug!(
                            entity_id = %request.entity_id,
                            now = %from,
                            "Status moved before the transition; not escalated"
                        );
                    }
                    TransitionError::InvalidTransition { .. }
                    | TransitionError::ForbiddenTransition { .. } => {
                        self.record_refusal(request, &err).await;
                    }
                    TransitionError::LockConflict { path, holder, .. } => {
                        self.record_lock_conflict(
                            EntityRef::task(&request.project_id, &request.entity_id),
                            path,
                            holder,
                            format!(
                                "{path} is locked by task {holder}; {} refused",
                                request.to_status
                            ),
                        )
                        .await;
                    }
                    _ => {}
                }
                Err(err)
            }
        }
    }

    pub async fn transition_task(
        &self,
        project_id: &str,
        task_id: &str,
        to: TaskStatus,
        role: Role,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<Task, TransitionError> {
        let request = task_request(project_id, task_id, to, role, actor, reason);
        expect_task(self.apply(&request).await?, task_id)
    }

    /// Launcher claim: QUEUED -> IN_PROGRESS as SYSTEM without taking locks,
    /// which the launcher acquires as its own step. Losing the task to
    /// another claimer is returned as an error but never escalated.
    pub async fn claim_task(
        &self,
        project_id: &str,
        task_id: &str,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<Task, TransitionError> {
        let mut request = task_request(
            project_id,
            task_id,
            TaskStatus::InProgress,
            Role::System,
            actor,
            reason,
        );
        request.locks = LockPolicy::Deferred;
        let applied = self
            .apply_with(&request, Some(TaskStatus::Queued.as_str()))
            .await?;
        expect_task(applied, task_id)
    }

    pub async fn transition_order(
        &self,
        project_id: &str,
        order_id: &str,
        to: OrderStatus,
        role: Role,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<Order, TransitionError> {
        let request = TransitionRequest {
            entity_type: EntityType::Order,
            project_id: project_id.to_string(),
            entity_id: order_id.to_string(),
            to_status: to.as_str().to_string(),
            role,
            actor: actor.to_string(),
            reason: reason.map(str::to_string),
            locks: LockPolicy::default(),
        };
        match self.apply(&request).await?.entity {
            Entity::Order(order) => Ok(order),
            Entity::Task(_) => Err(DatabaseError::Serialization(format!(
                "transition of order {order_id} returned a task"
            ))
            .into()),
        }
    }

    /// Transition history of one entity, oldest first.
    pub async fn history(
        &self,
        entity_type: EntityType,
        project_id: &str,
        entity_id: &str,
    ) -> Result<Vec<TransitionRecord>, DatabaseError> {
        self.db
            .list_transition_history(&HistoryFilter {
                entity_type: Some(entity_type),
                project_id: Some(project_id.to_string()),
                entity_id: Some(entity_id.to_string()),
            })
            .await
    }

    async fn record_refusal(&self, request: &TransitionRequest, err: &TransitionError) {
        let entity = match request.entity_type {
            EntityType::Task => EntityRef::task(&request.project_id, &request.entity_id),
            EntityType::Order => {
                EntityRef::project(&request.project_id).with_order(&request.entity_id)
            }
        };
        let result = self
            .escalations
            .record(
                EscalationType::TransitionRejected,
                entity,
                format!(
                    "Transition refused for {} {}",
                    request.entity_type, request.entity_id
                ),
                err.to_string(),
                json!({
                    "to_status": request.to_status,
                    "role": request.role.as_str(),
                    "actor": request.actor,
                }),
            )
            .await;
        if let Err(e) = result {
            warn!(entity_id = %request.entity_id, error = %e, "Failed to record refused transition");
        }
    }

    /// Record a `lock_conflict` escalation. Failures are logged, not returned.
    pub async fn record_lock_conflict(
        &self,
        entity: EntityRef,
        path: &str,
        holder: &str,
        description: String,
    ) {
        let task_id = entity.task_id.clone().unwrap_or_default();
        let result = self
            .escalations
            .record(
                EscalationType::LockConflict,
                entity,
                format!("Task {task_id} lost lock on {path}"),
                description,
                json!({ "path": path, "holder": holder }),
            )
            .await;
        if let Err(e) = result {
            warn!(%task_id, error = %e, "Failed to record lock conflict");
        }
    }

    async fn record_rejection(&self, task: &Task) {
        let (escalation_type, title) = if task.reject_count >= self.reject_threshold {
            (
                EscalationType::ModelUpgrade,
                format!(
                    "Task {} rejected {} times; upgrade model",
                    task.id, task.reject_count
                ),
            )
        } else {
            (
                EscalationType::ReviewRejection,
                format!("Task {} rejected in review", task.id),
            )
        };
        let result = self
            .escalations
            .record(
                escalation_type,
                EntityRef::task(&task.project_id, &task.id).with_order(&task.order_id),
                title,
                format!("{} ({})", task.title, task.status),
                json!({
                    "reject_count": task.reject_count,
                    "threshold": self.reject_threshold,
                }),
            )
            .await;
        if let Err(e) = result {
            warn!(task_id = %task.id, error = %e, "Failed to record review rejection");
        }
    }
}

fn task_request(
    project_id: &str,
    task_id: &str,
    to: TaskStatus,
    role: Role,
    actor: &str,
    reason: Option<&str>,
) -> TransitionRequest {
    TransitionRequest {
        entity_type: EntityType::Task,
        project_id: project_id.to_string(),
        entity_id: task_id.to_string(),
        to_status: to.as_str().to_string(),
        role,
        actor: actor.to_string(),
        reason: reason.map(str::to_string),
        locks: LockPolicy::Acquire,
    }
}

fn expect_task(applied: AppliedTransition, task_id: &str) -> Result<Task, TransitionError> {
    match applied.entity {
        Entity::Task(task) => Ok(task),
        Entity::Order(_) => Err(DatabaseError::Serialization(format!(
            "transition of task {task_id} returned an order"
        ))
        .into()),
    }
}
