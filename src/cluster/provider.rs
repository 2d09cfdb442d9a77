//! Traits at the cluster boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::Environment;
use crate::error::ClusterError;
use crate::manifest::ResourceId;
use crate::planner::Action;

/// Observed state of one environment at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    /// Environment observed.
    pub environment: Environment,
    /// When the observation started.
    pub captured_at: DateTime<Utc>,
    /// Observed documents, as returned by the cluster.
    pub resources: BTreeMap<ResourceId, Value>,
}

impl ClusterSnapshot {
    /// Creates an empty snapshot captured now.
    #[must_use]
    pub fn empty(environment: Environment) -> Self {
        Self {
            environment,
            captured_at: Utc::now(),
            resources: BTreeMap::new(),
        }
    }
}

/// Reads and writes cluster objects for an environment.
///
/// Documents passed to `apply_action` are materialized: pinned secret
/// references have already been resolved to values.
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    /// Observes every resource of the environment.
    async fn fetch_snapshot(&self, environment: Environment) -> Result<ClusterSnapshot, ClusterError>;

    /// Creates or replaces `action.after`.
    async fn apply_action(&self, environment: Environment, action: &Action) -> Result<(), ClusterError>;

    /// Deletes `action.id`; deleting a missing resource succeeds.
    async fn delete_action(&self, environment: Environment, action: &Action) -> Result<(), ClusterError>;

    /// Gets the provider name.
    fn provider_name(&self) -> &'static str;
}

/// Readiness and failure signals for workloads.
#[async_trait]
pub trait HealthSignal: Send + Sync {
    /// Number of ready replicas of a workload.
    async fn ready_count(&self, environment: Environment, workload: &ResourceId) -> Result<u32, ClusterError>;

    /// Failure events (crash loops, failed probes, failed scheduling) seen
    /// for a workload within `window`.
    async fn recent_failure_events(
        &self,
        environment: Environment,
        workload: &ResourceId,
        window: Duration,
    ) -> Result<u32, ClusterError>;
}
