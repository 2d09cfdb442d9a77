//! Resource identities and rendered manifest sets.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::Environment;

/// Label marking resources owned by this tool.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Value of [`MANAGED_BY_LABEL`].
pub const MANAGED_BY_VALUE: &str = "rollwarden";
/// Label naming the owning environment.
pub const ENVIRONMENT_LABEL: &str = "rollwarden.io/environment";
/// Annotation overriding the minimum ready count of a workload.
pub const MIN_READY_ANNOTATION: &str = "rollwarden.io/min-ready";
/// Annotation recording the pinned secret references of a Secret.
pub const SECRET_REFS_ANNOTATION: &str = "rollwarden.io/secret-refs";
/// Annotation written by `kubectl apply`.
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Identity of a resource: kind, namespace and name.
///
/// Cluster-scoped kinds carry an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    /// Resource kind (e.g. `Deployment`).
    pub kind: String,
    /// Namespace, empty for cluster-scoped kinds.
    pub namespace: String,
    /// Resource name.
    pub name: String,
}

impl ResourceId {
    /// Creates a new resource identity.
    #[must_use]
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Extracts the identity of a document.
    ///
    /// Returns `None` if `kind` or `metadata.name` is missing.
    #[must_use]
    pub fn from_document(document: &Value) -> Option<Self> {
        let kind = document.get("kind")?.as_str()?;
        let metadata = document.get("metadata")?;
        let name = metadata.get("name")?.as_str()?;
        let namespace = if is_cluster_scoped(kind) {
            ""
        } else {
            metadata.get("namespace").and_then(Value::as_str).unwrap_or("")
        };
        Some(Self::new(kind, namespace, name))
    }

    /// Returns the apply priority of this resource's kind.
    #[must_use]
    pub fn priority(&self) -> KindPriority {
        KindPriority::of(&self.kind)
    }

    /// Returns true if this resource is a workload whose health is monitored.
    #[must_use]
    pub fn is_workload(&self) -> bool {
        is_monitored_workload(&self.kind)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Apply priority of a kind; dependencies come before dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KindPriority {
    /// Namespaces.
    Namespace,
    /// Config, secret, identity and storage claims.
    Config,
    /// Anything not otherwise classified.
    Other,
    /// Workloads.
    Workload,
    /// Objects that expose workloads on the network.
    Network,
}

impl KindPriority {
    /// Classifies a kind.
    #[must_use]
    pub fn of(kind: &str) -> Self {
        match kind {
            "Namespace" => Self::Namespace,
            "ConfigMap" | "Secret" | "ServiceAccount" | "PersistentVolumeClaim" | "Role"
            | "RoleBinding" | "ClusterRole" | "ClusterRoleBinding" | "PersistentVolume"
            | "StorageClass" | "CustomResourceDefinition" | "PriorityClass" => Self::Config,
            "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Job" | "CronJob"
            | "Pod" => Self::Workload,
            "Service" | "Ingress" | "NetworkPolicy" | "HorizontalPodAutoscaler"
            | "PodDisruptionBudget" => Self::Network,
            _ => Self::Other,
        }
    }
}

/// Returns true for kinds that have no namespace.
#[must_use]
pub fn is_cluster_scoped(kind: &str) -> bool {
    matches!(
        kind,
        "Namespace"
            | "ClusterRole"
            | "ClusterRoleBinding"
            | "PersistentVolume"
            | "StorageClass"
            | "CustomResourceDefinition"
            | "PriorityClass"
    )
}

/// Returns true for workload kinds whose readiness is monitored.
#[must_use]
pub fn is_monitored_workload(kind: &str) -> bool {
    matches!(kind, "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet")
}

/// JSON pointer to the pod spec of a workload kind.
#[must_use]
pub fn pod_spec_pointer(kind: &str) -> Option<&'static str> {
    match kind {
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Job" => Some("/spec/template/spec"),
        "CronJob" => Some("/spec/jobTemplate/spec/template/spec"),
        "Pod" => Some("/spec"),
        _ => None,
    }
}

/// Returns true if the document carries the management labels of `environment`.
#[must_use]
pub fn is_managed_by(document: &Value, environment: Environment) -> bool {
    let Some(labels) = document.pointer("/metadata/labels") else {
        return false;
    };
    labels.get(MANAGED_BY_LABEL).and_then(Value::as_str) == Some(MANAGED_BY_VALUE)
        && labels.get(ENVIRONMENT_LABEL).and_then(Value::as_str) == Some(environment.as_str())
}

/// The resolved desired state of one environment.
///
/// Sets are never mutated in place once built; transformations return a new
/// set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "StoredManifest", try_from = "StoredManifest")]
pub struct ManifestSet {
    environment: Environment,
    resources: BTreeMap<ResourceId, Value>,
}

impl ManifestSet {
    /// Builds a set from documents, rejecting documents without identity and
    /// duplicates.
    ///
    /// # Errors
    ///
    /// Returns a description of the first offending document.
    pub fn from_documents(
        environment: Environment,
        documents: impl IntoIterator<Item = Value>,
    ) -> Result<Self, String> {
        let mut resources = BTreeMap::new();
        for document in documents {
            let id = ResourceId::from_document(&document)
                .ok_or_else(|| String::from("document lacks kind or metadata.name"))?;
            if resources.contains_key(&id) {
                return Err(format!("duplicate resource {id}"));
            }
            resources.insert(id, document);
        }
        Ok(Self {
            environment,
            resources,
        })
    }

    /// Creates an empty set.
    #[must_use]
    pub const fn empty(environment: Environment) -> Self {
        Self {
            environment,
            resources: BTreeMap::new(),
        }
    }

    /// Returns the environment this set belongs to.
    #[must_use]
    pub const fn environment(&self) -> Environment {
        self.environment
    }

    /// Returns the document for an identity.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&Value> {
        self.resources.get(id)
    }

    /// Returns true if the identity is present.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.resources.contains_key(id)
    }

    /// Iterates over resources in identity order.
    pub fn iter(&self) -> impl Iterator<Item = (&ResourceId, &Value)> {
        self.resources.iter()
    }

    /// Number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Returns a new set with every document passed through `f`.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by `f`.
    pub fn try_map<E>(
        &self,
        mut f: impl FnMut(&ResourceId, &Value) -> Result<Value, E>,
    ) -> Result<Self, E> {
        let mut resources = BTreeMap::new();
        for (id, document) in &self.resources {
            resources.insert(id.clone(), f(id, document)?);
        }
        Ok(Self {
            environment: self.environment,
            resources,
        })
    }

    /// Canonical JSON form: documents in identity order with sorted keys.
    #[must_use]
    pub fn canonical_json(&self) -> String {
        let documents: Vec<&Value> = self.resources.values().collect();
        serde_json::to_string(&documents).unwrap_or_default()
    }

    /// SHA-256 digest of the canonical form.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Short digest for display.
    #[must_use]
    pub fn short_digest(&self) -> String {
        self.digest()[..12].to_string()
    }

    /// Renders the set as a multi-document YAML stream.
    ///
    /// # Errors
    ///
    /// Returns an error if a document cannot be serialized.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        let mut out = String::new();
        for document in self.resources.values() {
            out.push_str("---\n");
            out.push_str(&serde_yaml::to_string(document)?);
        }
        Ok(out)
    }
}

/// Persisted form of a [`ManifestSet`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredManifest {
    environment: Environment,
    documents: Vec<Value>,
}

impl From<ManifestSet> for StoredManifest {
    fn from(set: ManifestSet) -> Self {
        Self {
            environment: set.environment,
            documents: set.resources.into_values().collect(),
        }
    }
}

impl TryFrom<StoredManifest> for ManifestSet {
    type Error = String;

    fn try_from(stored: StoredManifest) -> Result<Self, Self::Error> {
        Self::from_documents(stored.environment, stored.documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(name: &str) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": name, "namespace": "shop-dev"},
            "spec": {"replicas": 2}
        })
    }

    #[test]
    fn test_resource_id_from_document() {
        let id = ResourceId::from_document(&deployment("web")).unwrap();
        assert_eq!(id, ResourceId::new("Deployment", "shop-dev", "web"));
        assert_eq!(id.to_string(), "Deployment/shop-dev/web");

        let ns = json!({"kind": "Namespace", "metadata": {"name": "shop-dev", "namespace": "x"}});
        assert_eq!(ResourceId::from_document(&ns).unwrap().namespace, "");

        assert!(ResourceId::from_document(&json!({"kind": "Service"})).is_none());
    }

    #[test]
    fn test_kind_priority_order() {
        assert!(KindPriority::of("Namespace") < KindPriority::of("Secret"));
        assert!(KindPriority::of("ConfigMap") < KindPriority::of("Deployment"));
        assert!(KindPriority::of("Deployment") < KindPriority::of("Service"));
        assert_eq!(KindPriority::of("Widget"), KindPriority::Other);
    }

    #[test]
    fn test_duplicate_documents_rejected() {
        let result = ManifestSet::from_documents(
            Environment::Dev,
            vec![deployment("web"), deployment("web")],
        );
        assert!(result.unwrap_err().contains("duplicate"));
    }

    #[test]
    fn test_digest_ignores_input_order() {
        let a = ManifestSet::from_documents(Environment::Dev, vec![deployment("a"), deployment("b")]).unwrap();
        let b = ManifestSet::from_documents(Environment::Dev, vec![deployment("b"), deployment("a")]).unwrap();
        assert_eq!(a.canonical_json(), b.canonical_json());
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.short_digest().len(), 12);
    }

    #[test]
    fn test_serde_preserves_documents() {
        let set = ManifestSet::from_documents(Environment::Stage, vec![deployment("web")]).unwrap();
        let json = serde_json::to_string(&set).unwrap();
        let back: ManifestSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn test_is_managed_by() {
        let mut doc = deployment("web");
        assert!(!is_managed_by(&doc, Environment::Dev));
        doc["metadata"]["labels"] = json!({
            MANAGED_BY_LABEL: MANAGED_BY_VALUE,
            ENVIRONMENT_LABEL: "dev"
        });
        assert!(is_managed_by(&doc, Environment::Dev));
        assert!(!is_managed_by(&doc, Environment::Prod));
    }
}
