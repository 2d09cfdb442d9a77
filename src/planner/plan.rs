//! Plan types: ordered create/update/delete actions for one environment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::config::Environment;
use crate::manifest::ResourceId;
use crate::secrets::mask;

/// Types of actions in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    /// Create a resource that does not exist.
    Create,
    /// Replace a resource whose document differs.
    Update,
    /// Delete a managed resource no longer in the target.
    Delete,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// A single planned action with its before/after documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Action type.
    pub action_type: ActionType,
    /// Target resource.
    pub id: ResourceId,
    /// Observed document (normalized), absent for creates.
    pub before: Option<Value>,
    /// Desired document, absent for deletes.
    pub after: Option<Value>,
}

impl Action {
    /// The action that undoes this one.
    #[must_use]
    pub fn inverse(&self) -> Self {
        let action_type = match self.action_type {
            ActionType::Create => ActionType::Delete,
            ActionType::Update => ActionType::Update,
            ActionType::Delete => ActionType::Create,
        };
        Self {
            action_type,
            id: self.id.clone(),
            before: self.after.clone(),
            after: self.before.clone(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action_type, self.id)
    }
}

/// Per-type action counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanCounts {
    /// Number of creates.
    pub creates: usize,
    /// Number of updates.
    pub updates: usize,
    /// Number of deletes.
    pub deletes: usize,
}

/// An ordered, immutable plan. Consumed by value when a rollout starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Unique plan id.
    pub id: String,
    /// Environment the plan targets.
    pub environment: Environment,
    /// When the plan was computed.
    pub created_at: DateTime<Utc>,
    /// Digest of the target manifest.
    pub manifest_digest: String,
    /// Capture time of the snapshot the plan was computed against.
    pub snapshot_captured_at: DateTime<Utc>,
    /// Actions in execution order.
    pub actions: Vec<Action>,
}

impl Plan {
    /// Builds a plan, putting the actions into execution order.
    #[must_use]
    pub fn new(
        environment: Environment,
        manifest_digest: impl Into<String>,
        snapshot_captured_at: DateTime<Utc>,
        mut actions: Vec<Action>,
    ) -> Self {
        order_actions(&mut actions);
        Self {
            id: Uuid::new_v4().to_string(),
            environment,
            created_at: Utc::now(),
            manifest_digest: manifest_digest.into(),
            snapshot_captured_at,
            actions,
        }
    }

    /// Returns true if there is nothing to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Counts actions by type.
    #[must_use]
    pub fn counts(&self) -> PlanCounts {
        self.actions.iter().fold(PlanCounts::default(), |mut counts, action| {
            match action.action_type {
                ActionType::Create => counts.creates += 1,
                ActionType::Update => counts.updates += 1,
                ActionType::Delete => counts.deletes += 1,
            }
            counts
        })
    }

    /// Copy safe for persistence: Secret values replaced by pins or the
    /// redaction marker.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut plan = self.clone();
        for action in &mut plan.actions {
            action.before = action.before.as_ref().map(mask);
            action.after = action.after.as_ref().map(mask);
        }
        plan
    }
}

/// Inverts applied actions, newest first.
#[must_use]
pub fn inverse_of(actions: &[Action]) -> Vec<Action> {
    actions.iter().rev().map(Action::inverse).collect()
}

/// Sorts actions: creates and updates by ascending kind priority, then
/// deletes by descending priority; ties by resource id.
pub fn order_actions(actions: &mut [Action]) {
    actions.sort_by(|a, b| {
        let rank = |action: &Action| {
            let priority = action.id.priority() as i8;
            match action.action_type {
                ActionType::Delete => (1, -priority),
                ActionType::Create | ActionType::Update => (0, priority),
            }
        };
        rank(a).cmp(&rank(b)).then_with(|| a.id.cmp(&b.id))
    });
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts = self.counts();
        writeln!(
            f,
            "Plan {} for {}: {} create, {} update, {} delete",
            self.id, self.environment, counts.creates, counts.updates, counts.deletes
        )?;
        for (i, action) in self.actions.iter().enumerate() {
            writeln!(f, "  {}. {action}", i + 1)?;
        }
        Ok(())
    }
}
