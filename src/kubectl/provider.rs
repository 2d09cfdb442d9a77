//! Cluster provider and health signal backed by `kubectl`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::client::KubectlClient;
use crate::cluster::{ClusterProvider, ClusterSnapshot, HealthSignal};
use crate::config::{ClusterConfig, Environment, EnvironmentSpec, Environments};
use crate::error::ClusterError;
use crate::manifest::{LAST_APPLIED_ANNOTATION, ResourceId};
use crate::planner::Action;

/// Event reasons counted as workload failures.
const FAILURE_REASONS: &[&str] = &[
    "BackOff",
    "CrashLoopBackOff",
    "Failed",
    "FailedCreate",
    "FailedScheduling",
    "FailedMount",
    "Unhealthy",
];

/// Real cluster access through the `kubectl` binary.
#[derive(Debug, Clone)]
pub struct KubectlCluster {
    client: KubectlClient,
    environments: Environments,
    kinds: Vec<String>,
}

impl KubectlCluster {
    /// Creates a provider for the configured environments.
    #[must_use]
    pub fn new(config: &ClusterConfig, environments: Environments) -> Self {
        Self {
            client: KubectlClient::new(config),
            environments,
            kinds: config.kinds.clone(),
        }
    }

    fn spec(&self, environment: Environment) -> &EnvironmentSpec {
        self.environments.get(environment)
    }
}

/// The document as last applied, falling back to the live object.
///
/// Comparing against the applied document keeps server-side defaults out of
/// the diff.
#[must_use]
pub fn observed_document(live: &Value) -> Value {
    live.pointer("/metadata/annotations")
        .and_then(|a| a.get(LAST_APPLIED_ANNOTATION))
        .and_then(Value::as_str)
        .and_then(|applied| serde_json::from_str::<Value>(applied).ok())
        .map_or_else(|| live.clone(), |mut applied| {
            // Ownership is decided by live labels.
            if let (Some(labels), Some(metadata)) = (
                live.pointer("/metadata/labels"),
                applied.get_mut("metadata").and_then(Value::as_object_mut),
            ) {
                metadata.insert(String::from("labels"), labels.clone());
            }
            applied
        })
}

/// Ready replicas reported in a workload's status.
#[must_use]
pub fn ready_replicas(kind: &str, live: &Value) -> u32 {
    let field = if kind == "DaemonSet" { "/status/numberReady" } else { "/status/readyReplicas" };
    live.pointer(field)
        .and_then(Value::as_u64)
        .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX))
}

/// Counts failure events for a workload or its pods newer than `since`.
#[must_use]
pub fn count_failure_events(events: &Value, workload: &str, since: DateTime<Utc>) -> u32 {
    let Some(items) = events.get("items").and_then(Value::as_array) else {
        return 0;
    };
    let prefix = format!("{workload}-");

    let count = items
        .iter()
        .filter(|event| event.get("type").and_then(Value::as_str) == Some("Warning"))
        .filter(|event| {
            event
                .get("reason")
                .and_then(Value::as_str)
                .is_some_and(|r| FAILURE_REASONS.contains(&r))
        })
        .filter(|event| {
            event
                .pointer("/involvedObject/name")
                .and_then(Value::as_str)
                .is_some_and(|name| name == workload || name.starts_with(&prefix))
        })
        .filter(|event| {
            ["lastTimestamp", "eventTime", "firstTimestamp"]
                .iter()
                .find_map(|field| event.get(*field).and_then(Value::as_str))
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .is_some_and(|ts| ts.with_timezone(&Utc) >= since)
        })
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

#[async_trait]
impl ClusterProvider for KubectlCluster {
    async fn fetch_snapshot(&self, environment: Environment) -> Result<ClusterSnapshot, ClusterError> {
        let captured_at = Utc::now();
        let spec = self.spec(environment);
        let kinds = self.kinds.join(",");
        info!("Fetching {environment} snapshot from namespace {}", spec.namespace);

        let output = self.client.read(spec, &["get", &kinds, "-o", "json"]).await?;
        let list: Value = serde_json::from_str(&output).map_err(|e| ClusterError::InvalidResponse {
            message: format!("Failed to parse kubectl list: {e}"),
        })?;

        let mut resources = BTreeMap::new();
        for item in list.get("items").and_then(Value::as_array).into_iter().flatten() {
            let document = observed_document(item);
            match ResourceId::from_document(&document) {
                Some(id) => {
                    resources.insert(id, document);
                }
                None => warn!("Skipping observed object without identity"),
            }
        }

        debug!("Observed {} resource(s) in {environment}", resources.len());
        Ok(ClusterSnapshot {
            environment,
            captured_at,
            resources,
        })
    }

    async fn apply_action(&self, environment: Environment, action: &Action) -> Result<(), ClusterError> {
        let document = action.after.as_ref().ok_or_else(|| ClusterError::Rejected {
            resource: action.id.to_string(),
            message: String::from("apply without a document"),
        })?;
        let body = serde_json::to_vec(document).map_err(|e| ClusterError::InvalidResponse {
            message: format!("Failed to serialize {}: {e}", action.id),
        })?;

        self.client
            .run(self.spec(environment), &["apply", "-f", "-"], Some(&body))
            .await
            .map_err(|e| with_resource(e, &action.id))?;
        debug!("kubectl applied {}", action.id);
        Ok(())
    }

    async fn delete_action(&self, environment: Environment, action: &Action) -> Result<(), ClusterError> {
        self.client
            .run(
                self.spec(environment),
                &["delete", &action.id.kind, &action.id.name, "--ignore-not-found", "--wait=false"],
                None,
            )
            .await
            .map_err(|e| with_resource(e, &action.id))?;
        debug!("kubectl deleted {}", action.id);
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "kubectl"
    }
}

#[async_trait]
impl HealthSignal for KubectlCluster {
    async fn ready_count(&self, environment: Environment, workload: &ResourceId) -> Result<u32, ClusterError> {
        let output = self
            .client
            .read(self.spec(environment), &["get", &workload.kind, &workload.name, "-o", "json"])
            .await;
        let output = match output {
            Ok(output) => output,
            Err(ClusterError::NotFound { .. }) => return Ok(0),
            Err(e) => return Err(e),
        };
        let live: Value = serde_json::from_str(&output).map_err(|e| ClusterError::InvalidResponse {
            message: format!("Failed to parse {workload}: {e}"),
        })?;
        Ok(ready_replicas(&workload.kind, &live))
    }

    async fn recent_failure_events(
        &self,
        environment: Environment,
        workload: &ResourceId,
        window: Duration,
    ) -> Result<u32, ClusterError> {
        let since = Utc::now() - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        let output = self
            .client
            .read(
                self.spec(environment),
                &["get", "events", "--field-selector", "type=Warning", "-o", "json"],
            )
            .await?;
        let events: Value = serde_json::from_str(&output).map_err(|e| ClusterError::InvalidResponse {
            message: format!("Failed to parse events: {e}"),
        })?;
        Ok(count_failure_events(&events, &workload.name, since))
    }
}

fn with_resource(error: ClusterError, id: &ResourceId) -> ClusterError {
    match error {
        ClusterError::Conflict { message, .. } => ClusterError::Conflict {
            resource: id.to_string(),
            message,
        },
        ClusterError::NotFound { .. } => ClusterError::NotFound {
            resource: id.to_string(),
        },
        ClusterError::Rejected { message, .. } => ClusterError::Rejected {
            resource: id.to_string(),
            message,
        },
        other => other,
    }
}
