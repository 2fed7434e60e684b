//! Transition rule store: the loaded table of legal status edges.
//!
//! Rules are keyed by `(entity_type, from, to)`. Each edge may be allowed
//! for several roles; `*` in the `allowed_role` column matches any role.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::{DatabaseError, TransitionError, ValidationError};
use crate::model::{EntityType, Role};
use crate::store::Database;

/// Role column of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowedRole {
    Any,
    Only(Role),
}

impl AllowedRole {
    pub fn permits(&self, role: Role) -> bool {
        match self {
            Self::Any => true,
            Self::Only(allowed) => *allowed == role,
        }
    }
}

impl fmt::Display for AllowedRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Only(role) => f.write_str(role.as_str()),
        }
    }
}

impl FromStr for AllowedRole {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim() == "*" {
            Ok(Self::Any)
        } else {
            s.trim().parse().map(Self::Only)
        }
    }
}

impl Serialize for AllowedRole {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A legal `(entity_type, from, to)` edge for a role.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRule {
    pub entity_type: EntityType,
    pub from_status: String,
    pub to_status: String,
    pub allowed_role: AllowedRole,
    pub description: String,
}

impl TransitionRule {
    pub fn new(
        entity_type: EntityType,
        from: impl Into<String>,
        to: impl Into<String>,
        allowed_role: AllowedRole,
    ) -> Self {
        Self {
            entity_type,
            from_status: from.into(),
            to_status: to.into(),
            allowed_role,
            description: String::new(),
        }
    }
}

type EdgeKey = (EntityType, String, String);

/// In-memory index over the `status_transitions` table.
#[derive(Debug, Clone, Default)]
pub struct RuleStore {
    edges: HashMap<EdgeKey, Vec<TransitionRule>>,
}

impl RuleStore {
    pub fn from_rules(rules: impl IntoIterator<Item = TransitionRule>) -> Self {
        let mut edges: HashMap<EdgeKey, Vec<TransitionRule>> = HashMap::new();
        for rule in rules {
            edges
                .entry((
                    rule.entity_type,
                    rule.from_status.clone(),
                    rule.to_status.clone(),
                ))
                .or_default()
                .push(rule);
        }
        Self { edges }
    }

    /// Load every rule row from the datastore.
    pub async fn load(db: &dyn Database) -> Result<Self, DatabaseError> {
        let rules = db.load_transition_rules().await?;
        tracing::debug!(count = rules.len(), "Transition rules loaded");
        Ok(Self::from_rules(rules))
    }

    /// Number of distinct edges.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Whether any role may take this edge.
    pub fn contains_edge(&self, entity_type: EntityType, from: &str, to: &str) -> bool {
        self.edges
            .contains_key(&(entity_type, from.to_string(), to.to_string()))
    }

    /// Statuses reachable from `from` by any role, sorted.
    pub fn targets_from(&self, entity_type: EntityType, from: &str) -> Vec<&str> {
        let mut targets: Vec<&str> = self
            .edges
            .keys()
            .filter(|(et, f, _)| *et == entity_type && f == from)
            .map(|(_, _, to)| to.as_str())
            .collect();
        targets.sort_unstable();
        targets
    }

    /// Check an edge for a role.
    ///
    /// Absent edge is `InvalidTransition`; present edge without a matching
    /// role is `ForbiddenTransition`.
    pub fn validate(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        from: &str,
        to: &str,
        role: Role,
    ) -> Result<&TransitionRule, TransitionError> {
        let rules = self
            .edges
            .get(&(entity_type, from.to_string(), to.to_string()))
            .ok_or_else(|| TransitionError::InvalidTransition {
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            })?;

        rules
            .iter()
            .find(|rule| rule.allowed_role.permits(role))
            .ok_or_else(|| TransitionError::ForbiddenTransition {
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
                role: role.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RuleStore {
        RuleStore::from_rules([
            TransitionRule::new(
                EntityType::Task,
                "QUEUED",
                "IN_PROGRESS",
                AllowedRole::Only(Role::System),
            ),
            TransitionRule::new(
                EntityType::Task,
                "QUEUED",
                "IN_PROGRESS",
                AllowedRole::Only(Role::Worker),
            ),
            TransitionRule::new(
                EntityType::Task,
                "WAITING_INPUT",
                "IN_PROGRESS",
                AllowedRole::Any,
            ),
        ])
    }

    #[test]
    fn absent_edge_is_invalid() {
        let err = store()
            .validate(EntityType::Task, "T1", "DONE", "QUEUED", Role::Pm)
            .unwrap_err();
        assert!(matches!(err, TransitionError::InvalidTransition { .. }));
    }

    #[test]
    fn self_transition_is_invalid_unless_listed() {
        let err = store()
            .validate(EntityType::Task, "T1", "QUEUED", "QUEUED", Role::System)
            .unwrap_err();
        assert!(matches!(err, TransitionError::InvalidTransition { .. }));
    }

    #[test]
    fn role_mismatch_is_forbidden() {
        let err = store()
            .validate(EntityType::Task, "T1", "QUEUED", "IN_PROGRESS", Role::Pm)
            .unwrap_err();
        assert!(matches!(err, TransitionError::ForbiddenTransition { .. }));
    }

    #[test]
    fn any_of_several_roles_matches() {
        let store = store();
        assert!(
            store
                .validate(EntityType::Task, "T1", "QUEUED", "IN_PROGRESS", Role::Worker)
                .is_ok()
        );
        assert!(
            store
                .validate(EntityType::Task, "T1", "QUEUED", "IN_PROGRESS", Role::System)
                .is_ok()
        );
    }

    #[test]
    fn wildcard_permits_every_role() {
        let store = store();
        for role in [Role::Pm, Role::Worker, Role::System, Role::Human] {
            assert!(
                store
                    .validate(EntityType::Task, "T1", "WAITING_INPUT", "IN_PROGRESS", role)
                    .is_ok()
            );
        }
    }

    #[test]
    fn edges_are_scoped_by_entity_type() {
        let store = store();
        assert!(store.contains_edge(EntityType::Task, "QUEUED", "IN_PROGRESS"));
        assert!(!store.contains_edge(EntityType::Order, "QUEUED", "IN_PROGRESS"));
        assert_eq!(store.len(), 2);
        assert_eq!(
            store.targets_from(EntityType::Task, "QUEUED"),
            vec!["IN_PROGRESS"]
        );
    }

    #[test]
    fn allowed_role_parses_wildcard() {
        assert_eq!("*".parse::<AllowedRole>().unwrap(), AllowedRole::Any);
        assert_eq!(
            "PM".parse::<AllowedRole>().unwrap(),
            AllowedRole::Only(Role::Pm)
        );
        assert_eq!(AllowedRole::Any.to_string(), "*");
    }
}
