//! Escalation recorder: durable, append-only log of human-actionable events.
//!
//! Rows are never deleted and only their status moves
//! (OPEN → ACK → RESOLVED, or OPEN → RESOLVED). Statistics are aggregated
//! from the log on every call.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{DatabaseError, Error, ValidationError};
use crate::store::Database;

/// What kind of incident an escalation describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationType {
    /// Repeated rejection; the task should move to a stronger model.
    ModelUpgrade,
    ReviewRejection,
    StuckTask,
    SubagentCrash,
    InvalidTransition,
    FileWriteFailure,
    /// The transition engine refused a requested transition.
    TransitionRejected,
    /// A launch claim lost a file lock race and was compensated.
    LockConflict,
}

impl EscalationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModelUpgrade => "model_upgrade",
            Self::ReviewRejection => "review_rejection",
            Self::StuckTask => "stuck_task",
            Self::SubagentCrash => "subagent_crash",
            Self::InvalidTransition => "invalid_transition",
            Self::FileWriteFailure => "file_write_failure",
            Self::TransitionRejected => "transition_rejected",
            Self::LockConflict => "lock_conflict",
        }
    }
}

impl fmt::Display for EscalationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EscalationType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "model_upgrade" => Ok(Self::ModelUpgrade),
            "review_rejection" => Ok(Self::ReviewRejection),
            "stuck_task" => Ok(Self::StuckTask),
            "subagent_crash" => Ok(Self::SubagentCrash),
            "invalid_transition" => Ok(Self::InvalidTransition),
            "file_write_failure" => Ok(Self::FileWriteFailure),
            "transition_rejected" => Ok(Self::TransitionRejected),
            "lock_conflict" => Ok(Self::LockConflict),
            _ => Err(ValidationError::UnknownEscalationType(s.to_string())),
        }
    }
}

/// Human handling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationStatus {
    Open,
    Ack,
    Resolved,
}

impl EscalationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Ack => "ACK",
            Self::Resolved => "RESOLVED",
        }
    }

    fn can_move_to(&self, target: EscalationStatus) -> bool {
        use EscalationStatus::*;
        matches!((self, target), (Open, Ack) | (Open, Resolved) | (Ack, Resolved))
    }
}

impl fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EscalationStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OPEN" => Ok(Self::Open),
            "ACK" => Ok(Self::Ack),
            "RESOLVED" => Ok(Self::Resolved),
            _ => Err(ValidationError::UnknownStatus {
                entity: "escalation".into(),
                value: s.to_string(),
            }),
        }
    }
}

/// What an escalation points at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl EntityRef {
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Self::default()
        }
    }

    pub fn task(project_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            order_id: None,
            task_id: Some(task_id.into()),
        }
    }

    pub fn with_order(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }
}

/// A persisted escalation row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub id: Uuid,
    pub escalation_type: EscalationType,
    #[serde(flatten)]
    pub entity: EntityRef,
    pub title: String,
    pub description: String,
    pub status: EscalationStatus,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Query filter for history and statistics. Empty matches everything.
#[derive(Debug, Clone, Default)]
pub struct EscalationFilter {
    pub project_id: Option<String>,
    pub task_id: Option<String>,
    pub escalation_type: Option<EscalationType>,
    pub status: Option<EscalationStatus>,
    /// Matches `metadata.fingerprint` exactly.
    pub fingerprint: Option<String>,
    pub limit: Option<usize>,
}

impl EscalationFilter {
    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            ..Self::default()
        }
    }
}

/// Aggregate counts over a filtered escalation log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EscalationStats {
    pub total: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_status: BTreeMap<String, u64>,
}

/// Append-only recorder over the `escalations` table.
#[derive(Clone)]
pub struct EscalationRecorder {
    db: Arc<dyn Database>,
}

impl EscalationRecorder {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Append a new OPEN escalation. Returns its id.
    pub async fn record(
        &self,
        escalation_type: EscalationType,
        entity: EntityRef,
        title: impl Into<String>,
        description: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Result<Uuid, DatabaseError> {
        let now = Utc::now();
        let escalation = Escalation {
            id: Uuid::new_v4(),
            escalation_type,
            entity,
            title: title.into(),
            description: description.into(),
            status: EscalationStatus::Open,
            metadata,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_escalation(&escalation).await?;

        info!(
            escalation_id = %escalation.id,
            escalation_type = %escalation_type,
            project_id = %escalation.entity.project_id,
            task_id = ?escalation.entity.task_id,
            "Escalation recorded"
        );
        Ok(escalation.id)
    }

    /// Escalations matching the filter, newest first.
    pub async fn history(
        &self,
        filter: &EscalationFilter,
    ) -> Result<Vec<Escalation>, DatabaseError> {
        self.db.list_escalations(filter).await
    }

    /// Totals by type and status over the filtered log.
    pub async fn statistics(
        &self,
        filter: &EscalationFilter,
    ) -> Result<EscalationStats, DatabaseError> {
        self.db.escalation_counts(filter).await
    }

    /// Whether an OPEN escalation of this type carries the given fingerprint.
    pub async fn has_open(
        &self,
        escalation_type: EscalationType,
        project_id: &str,
        fingerprint: &str,
    ) -> Result<bool, DatabaseError> {
        let filter = EscalationFilter {
            project_id: Some(project_id.to_string()),
            escalation_type: Some(escalation_type),
            status: Some(EscalationStatus::Open),
            fingerprint: Some(fingerprint.to_string()),
            limit: Some(1),
            ..EscalationFilter::default()
        };
        Ok(!self.db.list_escalations(&filter).await?.is_empty())
    }

    pub async fn acknowledge(&self, id: Uuid) -> Result<Escalation, Error> {
        self.move_to(id, EscalationStatus::Ack).await
    }

    pub async fn resolve(&self, id: Uuid) -> Result<Escalation, Error> {
        self.move_to(id, EscalationStatus::Resolved).await
    }

    async fn move_to(&self, id: Uuid, target: EscalationStatus) -> Result<Escalation, Error> {
        let current = self
            .db
            .get_escalation(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "escalation".into(),
                id: id.to_string(),
            })?;

        if !current.status.can_move_to(target) {
            return Err(ValidationError::InvalidField {
                field: "status".into(),
                reason: format!("escalation {id} cannot move {} -> {target}", current.status),
            }
            .into());
        }

        if !self
            .db
            .update_escalation_status(id, current.status, target)
            .await?
        {
            return Err(DatabaseError::Constraint(format!(
                "escalation {id} changed status concurrently"
            ))
            .into());
        }

        info!(escalation_id = %id, status = %target, "Escalation status updated");
        Ok(Escalation {
            status: target,
            updated_at: Utc::now(),
            ..current
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    async fn recorder() -> EscalationRecorder {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        EscalationRecorder::new(db)
    }

    #[tokio::test]
    async fn record_and_query_history() {
        let rec = recorder().await;
        let id = rec
            .record(
                EscalationType::StuckTask,
                EntityRef::task("p1", "T1").with_order("O1"),
                "Task T1 stuck",
                "No heartbeat for 45 minutes",
                serde_json::json!({"elapsed_minutes": 45}),
            )
            .await
            .unwrap();

        let all = rec.history(&EscalationFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, id);
        assert_eq!(all[0].status, EscalationStatus::Open);
        assert_eq!(all[0].entity.order_id.as_deref(), Some("O1"));
        assert_eq!(all[0].metadata["elapsed_minutes"], 45);
    }

    #[tokio::test]
    async fn history_filters_by_task_and_type() {
        let rec = recorder().await;
        for (ty, task) in [
            (EscalationType::StuckTask, "T1"),
            (EscalationType::SubagentCrash, "T1"),
            (EscalationType::StuckTask, "T2"),
        ] {
            rec.record(ty, EntityRef::task("p1", task), "t", "d", serde_json::json!({}))
                .await
                .unwrap();
        }

        let filter = EscalationFilter {
            task_id: Some("T1".into()),
            ..EscalationFilter::for_project("p1")
        };
        assert_eq!(rec.history(&filter).await.unwrap().len(), 2);

        let filter = EscalationFilter {
            escalation_type: Some(EscalationType::StuckTask),
            ..EscalationFilter::default()
        };
        assert_eq!(rec.history(&filter).await.unwrap().len(), 2);

        let filter = EscalationFilter {
            limit: Some(1),
            ..EscalationFilter::default()
        };
        assert_eq!(rec.history(&filter).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn statistics_aggregate_by_type_and_status() {
        let rec = recorder().await;
        let first = rec
            .record(
                EscalationType::ReviewRejection,
                EntityRef::task("p1", "T1"),
                "t",
                "d",
                serde_json::json!({}),
            )
            .await
            .unwrap();
        rec.record(
            EscalationType::ReviewRejection,
            EntityRef::task("p1", "T2"),
            "t",
            "d",
            serde_json::json!({}),
        )
        .await
        .unwrap();
        rec.record(
            EscalationType::ModelUpgrade,
            EntityRef::task("p2", "T1"),
            "t",
            "d",
            serde_json::json!({}),
        )
        .await
        .unwrap();
        rec.acknowledge(first).await.unwrap();

        let stats = rec.statistics(&EscalationFilter::default()).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_type["review_rejection"], 2);
        assert_eq!(stats.by_type["model_upgrade"], 1);
        assert_eq!(stats.by_status["OPEN"], 2);
        assert_eq!(stats.by_status["ACK"], 1);

        let p1 = rec
            .statistics(&EscalationFilter::for_project("p1"))
            .await
            .unwrap();
        assert_eq!(p1.total, 2);
    }

    #[tokio::test]
    async fn status_only_moves_forward() {
        let rec = recorder().await;
        let id = rec
            .record(
                EscalationType::SubagentCrash,
                EntityRef::task("p1", "T1"),
                "t",
                "d",
                serde_json::json!({}),
            )
            .await
            .unwrap();

        let resolved = rec.resolve(id).await.unwrap();
        assert_eq!(resolved.status, EscalationStatus::Resolved);

        let err = rec.acknowledge(id).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn open_lookup_matches_fingerprint_only() {
        let rec = recorder().await;
        let id = rec
            .record(
                EscalationType::FileWriteFailure,
                EntityRef::task("p1", "T1"),
                "t",
                "d",
                serde_json::json!({"fingerprint": "file:p1:T1:a.py"}),
            )
            .await
            .unwrap();

        let ty = EscalationType::FileWriteFailure;
        assert!(rec.has_open(ty, "p1", "file:p1:T1:a.py").await.unwrap());
        assert!(!rec.has_open(ty, "p1", "file:p1:T1:b.py").await.unwrap());
        assert!(!rec.has_open(ty, "p2", "file:p1:T1:a.py").await.unwrap());

        rec.resolve(id).await.unwrap();
        assert!(!rec.has_open(ty, "p1", "file:p1:T1:a.py").await.unwrap());
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let rec = recorder().await;
        let err = rec.acknowledge(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Database(DatabaseError::NotFound { .. })
        ));
    }

    #[test]
    fn type_names_round_trip() {
        for ty in [
            EscalationType::ModelUpgrade,
            EscalationType::TransitionRejected,
            EscalationType::FileWriteFailure,
        ] {
            assert_eq!(ty.as_str().parse::<EscalationType>().unwrap(), ty);
        }
        assert!("page_oncall".parse::<EscalationType>().is_err());
    }
}
