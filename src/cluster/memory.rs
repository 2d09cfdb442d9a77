//! In-memory cluster used by `--simulate` and by the rollout tests.
//!
//! Behaves like an API server for the subset the controller needs: stores
//! applied documents with server-populated fields, reports readiness and
//! failure events, and can be told to fail specific writes.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::provider::{ClusterProvider, ClusterSnapshot, HealthSignal};
use crate::config::Environment;
use crate::error::ClusterError;
use crate::manifest::{LAST_APPLIED_ANNOTATION, ResourceId};
use crate::planner::{Action, ActionType};

/// A failure to return from writes to one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Conflict errors for the next `remaining` writes, then success.
    Transient {
        /// Writes left to fail.
        remaining: u32,
    },
    /// Every write is rejected.
    Permanent,
}

/// A write the cluster received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterOperation {
    /// Environment written.
    pub environment: Environment,
    /// Apply or delete.
    pub action_type: ActionType,
    /// Resource written.
    pub id: ResourceId,
    /// Whether the write succeeded.
    pub succeeded: bool,
}

impl std::fmt::Display for ClusterOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action_type, self.id)
    }
}

type Key = (Environment, ResourceId);

#[derive(Debug, Default)]
struct ClusterState {
    resources: HashMap<Environment, BTreeMap<ResourceId, Value>>,
    ready: HashMap<Key, VecDeque<u32>>,
    failure_events: HashMap<Key, u32>,
    failures: HashMap<Key, InjectedFailure>,
    operations: Vec<ClusterOperation>,
    next_version: u64,
    unavailable: bool,
}

/// In-memory cluster.
#[derive(Debug)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
    auto_ready: bool,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    /// Creates an empty cluster where workloads become ready as soon as
    /// they are applied.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClusterState::default()),
            auto_ready: true,
        }
    }

    /// Creates an empty cluster where workloads report zero ready replicas
    /// unless scripted with [`Self::set_ready`].
    #[must_use]
    pub fn without_auto_ready() -> Self {
        Self {
            state: Mutex::new(ClusterState::default()),
            auto_ready: false,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ClusterState>, ClusterError> {
        self.state.lock().map_err(|_| ClusterError::CommandFailed {
            message: String::from("in-memory cluster state poisoned"),
        })
    }

    /// Stores a document as if it had been applied earlier.
    ///
    /// # Errors
    ///
    /// Returns an error if the document has no identity.
    pub fn seed(&self, environment: Environment, document: Value) -> Result<ResourceId, ClusterError> {
        let id = ResourceId::from_document(&document).ok_or_else(|| ClusterError::InvalidResponse {
            message: String::from("seeded document lacks kind or metadata.name"),
        })?;
        let mut state = self.lock()?;
        state.store(environment, &id, &document);
        Ok(id)
    }

    /// Current document of a resource.
    #[must_use]
    pub fn get(&self, environment: Environment, id: &ResourceId) -> Option<Value> {
        self.lock()
            .ok()?
            .resources
            .get(&environment)
            .and_then(|r| r.get(id))
            .cloned()
    }

    /// Ids of all resources in an environment.
    #[must_use]
    pub fn resource_ids(&self, environment: Environment) -> Vec<ResourceId> {
        self.lock()
            .map(|state| {
                state
                    .resources
                    .get(&environment)
                    .map(|r| r.keys().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Scripts the ready counts reported for a workload, one per poll; the
    /// last value repeats.
    pub fn set_ready(&self, environment: Environment, id: &ResourceId, counts: impl IntoIterator<Item = u32>) {
        if let Ok(mut state) = self.lock() {
            state.ready.insert((environment, id.clone()), counts.into_iter().collect());
        }
    }

    /// Sets the failure-event count reported for a workload.
    pub fn set_failure_events(&self, environment: Environment, id: &ResourceId, count: u32) {
        if let Ok(mut state) = self.lock() {
            state.failure_events.insert((environment, id.clone()), count);
        }
    }

    /// Makes writes to a resource fail.
    pub fn fail_writes(&self, environment: Environment, id: &ResourceId, failure: InjectedFailure) {
        if let Ok(mut state) = self.lock() {
            state.failures.insert((environment, id.clone()), failure);
        }
    }

    /// Clears an injected write failure.
    pub fn clear_failure(&self, environment: Environment, id: &ResourceId) {
        if let Ok(mut state) = self.lock() {
            state.failures.remove(&(environment, id.clone()));
        }
    }

    /// Makes snapshot fetches fail with a network error.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.lock() {
            state.unavailable = unavailable;
        }
    }

    /// Writes received so far, in order.
    #[must_use]
    pub fn operations(&self) -> Vec<ClusterOperation> {
        self.lock().map(|s| s.operations.clone()).unwrap_or_default()
    }

    fn write(&self, environment: Environment, action: &Action) -> Result<(), ClusterError> {
        let mut state = self.lock()?;
        let key = (environment, action.id.clone());

        let injected = match state.failures.get_mut(&key) {
            Some(InjectedFailure::Transient { remaining }) if *remaining > 0 => {
                *remaining -= 1;
                Some(ClusterError::Conflict {
                    resource: action.id.to_string(),
                    message: String::from("the object has been modified"),
                })
            }
            Some(InjectedFailure::Permanent) => Some(ClusterError::Rejected {
                resource: action.id.to_string(),
                message: String::from("admission webhook denied the request"),
            }),
            _ => None,
        };

        let result = match injected {
            Some(err) => Err(err),
            None if action.action_type == ActionType::Delete => {
                if let Some(resources) = state.resources.get_mut(&environment) {
                    resources.remove(&action.id);
                }
                Ok(())
            }
            None => match &action.after {
                Some(document) => {
                    state.store(environment, &action.id, document);
                    Ok(())
                }
                None => Err(ClusterError::Rejected {
                    resource: action.id.to_string(),
                    message: String::from("apply without a document"),
                }),
            },
        };

        state.operations.push(ClusterOperation {
            environment,
            action_type: action.action_type,
            id: action.id.clone(),
            succeeded: result.is_ok(),
        });
        debug!("In-memory {action}: {}", if result.is_ok() { "ok" } else { "failed" });
        result
    }
}

impl ClusterState {
    fn store(&mut self, environment: Environment, id: &ResourceId, document: &Value) {
        self.next_version += 1;
        let version = self.next_version.to_string();
        let resources = self.resources.entry(environment).or_default();
        let existing = resources.get(id);
        let uid = existing
            .and_then(|d| d.pointer("/metadata/uid"))
            .cloned()
            .unwrap_or_else(|| json!(Uuid::new_v4().to_string()));
        let created = existing
            .and_then(|d| d.pointer("/metadata/creationTimestamp"))
            .cloned()
            .unwrap_or_else(|| json!(Utc::now().to_rfc3339()));

        let mut stored = document.clone();
        if let Some(metadata) = stored.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.insert(String::from("uid"), uid);
            metadata.insert(String::from("creationTimestamp"), created);
            metadata.insert(String::from("resourceVersion"), json!(version));
            let annotations = metadata
                .entry("annotations")
                .or_insert_with(|| json!({}));
            if let Some(annotations) = annotations.as_object_mut() {
                annotations.insert(
                    String::from(LAST_APPLIED_ANNOTATION),
                    Value::String(document.to_string()),
                );
            }
        }
        if let Some(obj) = stored.as_object_mut() {
            obj.insert(String::from("status"), json!({"observedGeneration": 1}));
        }
        resources.insert(id.clone(), stored);
    }
}

#[async_trait]
impl ClusterProvider for InMemoryCluster {
    async fn fetch_snapshot(&self, environment: Environment) -> Result<ClusterSnapshot, ClusterError> {
        let captured_at = Utc::now();
        let state = self.lock()?;
        if state.unavailable {
            return Err(ClusterError::network("in-memory cluster marked unavailable"));
        }
        Ok(ClusterSnapshot {
            environment,
            captured_at,
            resources: state.resources.get(&environment).cloned().unwrap_or_default(),
        })
    }

    async fn apply_action(&self, environment: Environment, action: &Action) -> Result<(), ClusterError> {
        self.write(environment, action)
    }

    async fn delete_action(&self, environment: Environment, action: &Action) -> Result<(), ClusterError> {
        self.write(environment, action)
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl HealthSignal for InMemoryCluster {
    async fn ready_count(&self, environment: Environment, workload: &ResourceId) -> Result<u32, ClusterError> {
        let mut state = self.lock()?;
        let key = (environment, workload.clone());

        if let Some(script) = state.ready.get_mut(&key) {
            let count = if script.len() > 1 { script.pop_front() } else { script.front().copied() };
            return Ok(count.unwrap_or(0));
        }

        if !self.auto_ready {
            return Ok(0);
        }
        let count = state
            .resources
            .get(&environment)
            .and_then(|r| r.get(workload))
            .map_or(0, |doc| {
                doc.pointer("/spec/replicas")
                    .and_then(Value::as_u64)
                    .map_or(1, |n| u32::try_from(n).unwrap_or(u32::MAX))
            });
        Ok(count)
    }

    async fn recent_failure_events(
        &self,
        environment: Environment,
        workload: &ResourceId,
        _window: Duration,
    ) -> Result<u32, ClusterError> {
        let state = self.lock()?;
        Ok(state
            .failure_events
            .get(&(environment, workload.clone()))
            .copied()
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(replicas: u32) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "shop-dev"},
            "spec": {"replicas": replicas}
        })
    }

    fn apply(doc: Value) -> Action {
        Action {
            action_type: ActionType::Create,
            id: ResourceId::from_document(&doc).unwrap(),
            before: None,
            after: Some(doc),
        }
    }

    #[tokio::test]
    async fn test_apply_adds_server_fields_and_keeps_uid() {
        let cluster = InMemoryCluster::new();
        let action = apply(deployment(2));
        cluster.apply_action(Environment::Dev, &action).await.unwrap();
        let first = cluster.get(Environment::Dev, &action.id).unwrap();
        assert!(first.pointer("/metadata/uid").is_some());
        assert!(first.get("status").is_some());

        cluster.apply_action(Environment::Dev, &apply(deployment(3))).await.unwrap();
        let second = cluster.get(Environment::Dev, &action.id).unwrap();
        assert_eq!(first["metadata"]["uid"], second["metadata"]["uid"]);
        assert_ne!(first["metadata"]["resourceVersion"], second["metadata"]["resourceVersion"]);

        let snapshot = cluster.fetch_snapshot(Environment::Dev).await.unwrap();
        assert_eq!(snapshot.resources.len(), 1);
        assert!(cluster.fetch_snapshot(Environment::Prod).await.unwrap().resources.is_empty());
    }

    #[tokio::test]
    async fn test_ready_counts() {
        let cluster = InMemoryCluster::new();
        let action = apply(deployment(2));
        assert_eq!(cluster.ready_count(Environment::Dev, &action.id).await.unwrap(), 0);

        cluster.apply_action(Environment::Dev, &action).await.unwrap();
        assert_eq!(cluster.ready_count(Environment::Dev, &action.id).await.unwrap(), 2);

        cluster.set_ready(Environment::Dev, &action.id, [2, 1]);
        assert_eq!(cluster.ready_count(Environment::Dev, &action.id).await.unwrap(), 2);
        assert_eq!(cluster.ready_count(Environment::Dev, &action.id).await.unwrap(), 1);
        assert_eq!(cluster.ready_count(Environment::Dev, &action.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let cluster = InMemoryCluster::new();
        let action = apply(deployment(1));

        cluster.fail_writes(Environment::Dev, &action.id, InjectedFailure::Transient { remaining: 1 });
        let err = cluster.apply_action(Environment::Dev, &action).await.unwrap_err();
        assert!(err.is_transient());
        cluster.apply_action(Environment::Dev, &action).await.unwrap();

        cluster.fail_writes(Environment::Dev, &action.id, InjectedFailure::Permanent);
        let err = cluster.apply_action(Environment::Dev, &action).await.unwrap_err();
        assert!(!err.is_transient());

        let ops = cluster.operations();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops.iter().filter(|o| o.succeeded).count(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let cluster = InMemoryCluster::new();
        let action = Action {
            action_type: ActionType::Delete,
            id: ResourceId::new("ConfigMap", "shop-dev", "gone"),
            before: None,
            after: None,
        };
        cluster.delete_action(Environment::Dev, &action).await.unwrap();
    }
}
