//! Diff engine for comparing a rendered manifest with an observed snapshot.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

use super::plan::{Action, ActionType, Plan};
use crate::cluster::ClusterSnapshot;
use crate::error::PlanError;
use crate::manifest::{LAST_APPLIED_ANNOTATION, ManifestSet, ResourceId, is_managed_by};
use crate::secrets::mask;
use crate::state::RolloutRecord;

/// Metadata fields written by the server, never part of the desired state.
const SERVER_METADATA: &[&str] = &[
    "creationTimestamp",
    "resourceVersion",
    "uid",
    "generation",
    "managedFields",
    "selfLink",
    "deletionTimestamp",
];

/// Engine for computing per-resource diffs.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiffEngine;

/// Difference for a single resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceDiff {
    /// Resource identity.
    pub id: ResourceId,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Changed fields, for updates.
    pub details: Vec<DiffDetail>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource needs to be updated.
    Update,
    /// Managed resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoChange,
    /// Observed resource that is not ours; left alone.
    Unmanaged,
}

/// Detail about a specific difference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffDetail {
    /// JSON pointer of the field that differs.
    pub field: String,
    /// Observed value.
    pub old_value: Option<String>,
    /// Desired value.
    pub new_value: Option<String>,
}

/// Complete diff result.
#[derive(Debug, Clone, Serialize)]
pub struct DiffResult {
    /// All resource diffs, in resource id order.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update.
    pub updates: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

/// Strips server-populated fields and masks Secret values so that a
/// document can be compared with, or persisted as, desired state.
#[must_use]
pub fn normalize(document: &Value) -> Value {
    let mut document = mask(document);
    let Some(obj) = document.as_object_mut() else {
        return document;
    };
    obj.remove("status");

    if let Some(metadata) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in SERVER_METADATA {
            metadata.remove(*field);
        }
        let empty_annotations = metadata
            .get_mut("annotations")
            .and_then(Value::as_object_mut)
            .is_some_and(|annotations| {
                annotations.remove(LAST_APPLIED_ANNOTATION);
                annotations.is_empty()
            });
        if empty_annotations {
            metadata.remove("annotations");
        }
    }
    document
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the diff between a target manifest and observed resources.
    ///
    /// Observed resources absent from the target are deleted only when they
    /// carry this environment's management labels.
    #[must_use]
    pub fn compute_diff(&self, target: &ManifestSet, snapshot: &ClusterSnapshot) -> DiffResult {
        let environment = target.environment();
        let ids: BTreeSet<&ResourceId> = target
            .iter()
            .map(|(id, _)| id)
            .chain(snapshot.resources.keys())
            .collect();

        let mut diffs = Vec::with_capacity(ids.len());
        for id in ids {
            let desired = target.get(id).map(normalize);
            let observed = snapshot.resources.get(id).map(normalize);

            let diff = match (desired, observed) {
                (Some(_), None) => {
                    debug!("{id} needs to be created");
                    ResourceDiff { id: id.clone(), diff_type: DiffType::Create, details: vec![] }
                }
                (Some(desired), Some(observed)) if desired == observed => {
                    ResourceDiff { id: id.clone(), diff_type: DiffType::NoChange, details: vec![] }
                }
                (Some(desired), Some(observed)) => {
                    let mut details = Vec::new();
                    changed_fields(&observed, &desired, "", &mut details);
                    debug!("{id} needs update ({} field(s))", details.len());
                    ResourceDiff { id: id.clone(), diff_type: DiffType::Update, details }
                }
                (None, Some(observed)) if is_managed_by(&observed, environment) => {
                    debug!("{id} is managed but no longer rendered");
                    ResourceDiff { id: id.clone(), diff_type: DiffType::Delete, details: vec![] }
                }
                (None, _) => {
                    ResourceDiff { id: id.clone(), diff_type: DiffType::Unmanaged, details: vec![] }
                }
            };
            diffs.push(diff);
        }

        let count = |t: DiffType| diffs.iter().filter(|d| d.diff_type == t).count();
        DiffResult {
            creates: count(DiffType::Create),
            updates: count(DiffType::Update),
            deletes: count(DiffType::Delete),
            unchanged: count(DiffType::NoChange),
            diffs,
        }
    }
}

fn changed_fields(old: &Value, new: &Value, path: &str, out: &mut Vec<DiffDetail>) {
    if let (Value::Object(old), Value::Object(new)) = (old, new) {
        let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
        for key in keys {
            let child = format!("{path}/{}", key.replace('~', "~0").replace('/', "~1"));
            match (old.get(key), new.get(key)) {
                (Some(a), Some(b)) if a == b => {}
                (Some(a @ Value::Object(_)), Some(b @ Value::Object(_))) => {
                    changed_fields(a, b, &child, out);
                }
                (a, b) => {
                    out.push(DiffDetail {
                        field: child,
                        old_value: a.map(Value::to_string),
                        new_value: b.map(Value::to_string),
                    });
                }
            }
        }
    } else if old != new {
        out.push(DiffDetail {
            field: if path.is_empty() { String::from("/") } else { path.to_string() },
            old_value: Some(old.to_string()),
            new_value: Some(new.to_string()),
        });
    }
}

/// Fields that differ between two documents, after normalization.
#[must_use]
pub fn field_changes(before: &Value, after: &Value) -> Vec<DiffDetail> {
    let mut details = Vec::new();
    changed_fields(&normalize(before), &normalize(after), "", &mut details);
    details
}

/// Computes an ordered plan bringing `snapshot` to `target`.
///
/// When `head` is given, the snapshot must not predate the head record's
/// latest activity.
///
/// # Errors
///
/// Returns [`PlanError::EnvironmentMismatch`] if target and snapshot belong
/// to different environments, or [`PlanError::SnapshotStale`] if the
/// snapshot is older than `head`.
pub fn plan(
    target: &ManifestSet,
    snapshot: &ClusterSnapshot,
    head: Option<&RolloutRecord>,
) -> Result<Plan, PlanError> {
    if target.environment() != snapshot.environment {
        return Err(PlanError::EnvironmentMismatch {
            target: target.environment(),
            observed: snapshot.environment,
        });
    }

    if let Some(head) = head {
        let recorded_at = head.last_activity();
        if snapshot.captured_at < recorded_at {
            return Err(PlanError::SnapshotStale {
                environment: snapshot.environment,
                captured_at: snapshot.captured_at.to_rfc3339(),
                record_id: head.id.clone(),
                recorded_at: recorded_at.to_rfc3339(),
            });
        }
    }

    let diff = DiffEngine::new().compute_diff(target, snapshot);
    let actions = diff
        .diffs
        .iter()
        .filter_map(|d| {
            let action_type = match d.diff_type {
                DiffType::Create => ActionType::Create,
                DiffType::Update => ActionType::Update,
                DiffType::Delete => ActionType::Delete,
                DiffType::NoChange | DiffType::Unmanaged => return None,
            };
            Some(Action {
                action_type,
                id: d.id.clone(),
                before: snapshot.resources.get(&d.id).map(normalize),
                after: target.get(&d.id).cloned(),
            })
        })
        .collect();

    Ok(Plan::new(target.environment(), target.digest(), snapshot.captured_at, actions))
}

impl DiffResult {
    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates > 0 || self.updates > 0 || self.deletes > 0
    }

    /// Returns the total number of changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.updates + self.deletes
    }

    /// Filters to only diffs that require action.
    #[must_use]
    pub fn actionable_diffs(&self) -> Vec<&ResourceDiff> {
        self.diffs
            .iter()
            .filter(|d| !matches!(d.diff_type, DiffType::NoChange | DiffType::Unmanaged))
            .collect()
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoChange => "no change",
            Self::Unmanaged => "unmanaged",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.id, self.diff_type)?;
        if !self.details.is_empty() {
            let fields: Vec<&str> = self.details.iter().map(|d| d.field.as_str()).collect();
            write!(f, " ({})", fields.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use crate::manifest::{ENVIRONMENT_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
    use crate::state::{RecordKind, ResultState};
    use chrono::{Duration, Utc};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn managed(kind: &str, name: &str, spec: Value) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": kind,
            "metadata": {
                "name": name,
                "namespace": "shop-dev",
                "labels": {MANAGED_BY_LABEL: MANAGED_BY_VALUE, ENVIRONMENT_LABEL: "dev"}
            },
            "spec": spec
        })
    }

    fn observed(doc: &Value) -> Value {
        let mut doc = doc.clone();
        doc["metadata"]["uid"] = json!("1234");
        doc["metadata"]["resourceVersion"] = json!("7");
        doc["metadata"]["annotations"] = json!({LAST_APPLIED_ANNOTATION: "{}"});
        doc["status"] = json!({"readyReplicas": 1});
        doc
    }

    fn snapshot(docs: Vec<Value>) -> ClusterSnapshot {
        let resources: BTreeMap<ResourceId, Value> = docs
            .into_iter()
            .filter_map(|d| ResourceId::from_document(&d).map(|id| (id, d)))
            .collect();
        ClusterSnapshot {
            environment: Environment::Dev,
            captured_at: Utc::now(),
            resources,
        }
    }

    fn target(docs: Vec<Value>) -> ManifestSet {
        ManifestSet::from_documents(Environment::Dev, docs).unwrap()
    }

    #[test]
    fn test_normalize_strips_server_fields() {
        let doc = managed("Deployment", "web", json!({"replicas": 2}));
        assert_eq!(normalize(&observed(&doc)), doc);
    }

    #[test]
    fn test_identical_state_gives_empty_plan() {
        let web = managed("Deployment", "web", json!({"replicas": 2}));
        let plan = plan(&target(vec![web.clone()]), &snapshot(vec![observed(&web)]), None).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_create_update_delete_and_unmanaged() {
        let web = managed("Deployment", "web", json!({"replicas": 3}));
        let old_web = managed("Deployment", "web", json!({"replicas": 2}));
        let cfg = managed("ConfigMap", "cfg", json!(null));
        let stale = managed("Service", "old", json!({"ports": []}));
        let foreign = json!({"kind": "Service", "metadata": {"name": "theirs", "namespace": "shop-dev"}});

        let snap = snapshot(vec![observed(&old_web), observed(&stale), foreign]);
        let result = DiffEngine::new().compute_diff(&target(vec![web.clone(), cfg]), &snap);
        assert_eq!((result.creates, result.updates, result.deletes), (1, 1, 1));
        assert_eq!(result.actionable_diffs().len(), 3);

        let update = result.diffs.iter().find(|d| d.diff_type == DiffType::Update).unwrap();
        assert_eq!(update.details.len(), 1);
        assert_eq!(update.details[0].field, "/spec/replicas");
        assert_eq!(update.details[0].new_value.as_deref(), Some("3"));

        let plan = plan(&target(vec![web, managed("ConfigMap", "cfg", json!(null))]), &snap, None).unwrap();
        let order: Vec<String> = plan.actions.iter().map(ToString::to_string).collect();
        assert_eq!(
            order,
            vec![
                "create ConfigMap/shop-dev/cfg",
                "update Deployment/shop-dev/web",
                "delete Service/shop-dev/old",
            ]
        );
        assert_eq!(plan.actions[1].before.as_ref().unwrap()["spec"]["replicas"], 2);
        assert!(plan.actions[1].before.as_ref().unwrap().get("status").is_none());
    }

    #[test]
    fn test_stale_snapshot_rejected() {
        let snap = snapshot(vec![]);
        let manifest = target(vec![]);
        let mut record = RolloutRecord::begin(
            Environment::Dev,
            "plan-1",
            RecordKind::Deploy,
            None,
            manifest.clone(),
            vec![],
        );
        record.applied_at = snap.captured_at + Duration::seconds(5);

        let err = plan(&manifest, &snap, Some(&record)).unwrap_err();
        assert!(matches!(err, PlanError::SnapshotStale { .. }));

        record.applied_at = snap.captured_at - Duration::seconds(60);
        record.completed_at = Some(snap.captured_at - Duration::seconds(1));
        record.result_state = ResultState::Succeeded;
        assert!(plan(&manifest, &snap, Some(&record)).is_ok());
    }

    #[test]
    fn test_field_changes_ignore_server_fields() {
        let before = observed(&managed("ConfigMap", "app", json!({"replicas": 1})));
        let after = managed("ConfigMap", "app", json!({"replicas": 3}));
        let changes = field_changes(&before, &after);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field, "/spec/replicas");
        assert_eq!(changes[0].new_value.as_deref(), Some("3"));
    }

    #[test]
    fn test_environment_mismatch() {
        let manifest = ManifestSet::empty(Environment::Prod);
        let err = plan(&manifest, &snapshot(vec![]), None).unwrap_err();
        assert!(matches!(err, PlanError::EnvironmentMismatch { .. }));
    }
}
