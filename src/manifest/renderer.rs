//! Manifest rendering: base documents plus ordered overlays into a
//! [`ManifestSet`].

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::loader::load_overlay_inputs;
use super::patch::{MergeKeys, Overlay, Patch, set_path, strategic_merge};
use super::types::{
    ENVIRONMENT_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE, ManifestSet, ResourceId,
    is_cluster_scoped, pod_spec_pointer,
};
use crate::config::{Environment, EnvironmentSpec, Environments, ManifestsConfig, ResourceProfile};
use crate::error::RenderError;
use crate::secrets::parse_reference;

/// A document together with the file it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    /// File the document was read from.
    pub source: String,
    /// The parsed document.
    pub document: Value,
}

/// One overlay directory, parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayLayer {
    /// Directory the overlay was read from.
    pub source: String,
    /// The overlay definition.
    pub overlay: Overlay,
    /// Extra resources the overlay contributes.
    pub resources: Vec<SourceDocument>,
}

/// Everything needed to render one environment.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayInputs {
    /// Shared base documents.
    pub base: Vec<SourceDocument>,
    /// Overlays in declared order.
    pub overlays: Vec<OverlayLayer>,
}

/// Renders environments from the configured manifest layout.
#[derive(Debug, Clone)]
pub struct ManifestRenderer {
    environments: Environments,
    manifests: ManifestsConfig,
    root: std::path::PathBuf,
}

impl ManifestRenderer {
    /// Creates a renderer; relative manifest paths resolve against `root`.
    #[must_use]
    pub fn new(environments: Environments, manifests: ManifestsConfig, root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            environments,
            manifests,
            root: root.into(),
        }
    }

    /// Loads the overlay inputs and renders the environment.
    ///
    /// # Errors
    ///
    /// Returns a [`RenderError`] if inputs cannot be loaded or applied.
    pub fn render(&self, environment: Environment) -> Result<ManifestSet, RenderError> {
        let inputs = load_overlay_inputs(&self.manifests, &self.root, environment)?;
        render(self.environments.get(environment), &inputs)
    }
}

/// Renders an environment from already-loaded inputs.
///
/// Pure function of its arguments: identical inputs give a byte-identical
/// canonical form.
///
/// # Errors
///
/// Returns a [`RenderError`] describing the first problem found.
pub fn render(spec: &EnvironmentSpec, inputs: &OverlayInputs) -> Result<ManifestSet, RenderError> {
    let environment = spec.environment;
    if inputs.overlays.is_empty() {
        return Err(RenderError::unresolved(environment, "no overlay declared"));
    }

    let mut documents: BTreeMap<ResourceId, Value> = BTreeMap::new();
    let sources = inputs
        .base
        .iter()
        .chain(inputs.overlays.iter().flat_map(|layer| layer.resources.iter()));
    for source in sources {
        let document = with_namespace(&source.document, &spec.namespace);
        let id = ResourceId::from_document(&document).ok_or_else(|| {
            RenderError::unresolved(
                environment,
                format!("document in {} lacks kind or metadata.name", source.source),
            )
        })?;
        if documents.contains_key(&id) {
            return Err(RenderError::DuplicateResource {
                resource: id.to_string(),
            });
        }
        documents.insert(id, document);
    }

    let mut keys = MergeKeys::default();
    for layer in &inputs.overlays {
        keys = keys.extended(&layer.overlay.merge_keys);
        for patch in &layer.overlay.patches {
            apply_patch(&mut documents, patch, &keys, &spec.namespace)?;
        }
        debug!("Applied {} patch(es) from {}", layer.overlay.patches.len(), layer.source);
    }

    for (id, document) in &mut documents {
        label(document, environment);
        if let Some(pointer) = pod_spec_pointer(&id.kind) {
            apply_profile(document, pointer, &spec.resources);
        }
        if id.kind == "Secret" {
            check_secret(id, document)?;
        }
    }

    info!("Rendered {} resource(s) for {environment}", documents.len());
    ManifestSet::from_documents(environment, documents.into_values())
        .map_err(|message| RenderError::unresolved(environment, message))
}

fn apply_patch(
    documents: &mut BTreeMap<ResourceId, Value>,
    patch: &Patch,
    keys: &MergeKeys,
    namespace: &str,
) -> Result<(), RenderError> {
    let target_ns = if is_cluster_scoped(&patch.target.kind) {
        String::new()
    } else {
        patch.target.namespace.clone().unwrap_or_else(|| namespace.to_string())
    };
    let id = ResourceId::new(&patch.target.kind, target_ns, &patch.target.name);
    let label = id.to_string();

    let base = documents
        .get(&id)
        .ok_or_else(|| RenderError::MissingBase { target: label.clone() })?;

    let patched = match (&patch.merge, patch.set.is_empty()) {
        (Some(merge), true) => strategic_merge(base, merge, keys, &label)?,
        (None, false) => patch
            .set
            .iter()
            .try_fold(base.clone(), |doc, op| set_path(&doc, &op.path, &op.value, &label))?,
        (Some(_), false) => {
            return Err(RenderError::invalid_patch(&label, "/", "patch has both 'merge' and 'set'"));
        }
        (None, true) => {
            return Err(RenderError::invalid_patch(&label, "/", "patch has neither 'merge' nor 'set'"));
        }
    };

    if ResourceId::from_document(&patched).as_ref() != Some(&id) {
        return Err(RenderError::invalid_patch(
            &label,
            "/metadata",
            "patch may not change the resource identity",
        ));
    }

    documents.insert(id, patched);
    Ok(())
}

fn with_namespace(document: &Value, namespace: &str) -> Value {
    let mut document = document.clone();
    let kind = document.get("kind").and_then(Value::as_str).unwrap_or_default().to_string();
    if kind.is_empty() || is_cluster_scoped(&kind) {
        return document;
    }
    if let Some(metadata) = document.get_mut("metadata").and_then(Value::as_object_mut)
        && !metadata.contains_key("namespace")
    {
        metadata.insert(String::from("namespace"), Value::String(namespace.to_string()));
    }
    document
}

fn label(document: &mut Value, environment: Environment) {
    let Some(metadata) = document.get_mut("metadata").and_then(Value::as_object_mut) else {
        return;
    };
    let labels = metadata
        .entry("labels")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(labels) = labels.as_object_mut() {
        labels.insert(MANAGED_BY_LABEL.to_string(), Value::String(MANAGED_BY_VALUE.to_string()));
        labels.insert(
            ENVIRONMENT_LABEL.to_string(),
            Value::String(environment.as_str().to_string()),
        );
    }
}

fn apply_profile(document: &mut Value, pod_spec: &str, profile: &ResourceProfile) {
    if profile.is_empty() {
        return;
    }
    let Some(containers) = document
        .pointer_mut(&format!("{pod_spec}/containers"))
        .and_then(Value::as_array_mut)
    else {
        return;
    };

    for container in containers.iter_mut().filter_map(Value::as_object_mut) {
        let resources = container
            .entry("resources")
            .or_insert_with(|| Value::Object(Map::new()));
        let Some(resources) = resources.as_object_mut() else {
            continue;
        };
        if resources.contains_key("limits") {
            continue;
        }
        let mut limits = Map::new();
        if let Some(cpu) = &profile.cpu {
            limits.insert(String::from("cpu"), Value::String(cpu.clone()));
        }
        if let Some(memory) = &profile.memory {
            limits.insert(String::from("memory"), Value::String(memory.clone()));
        }
        resources.insert(String::from("limits"), Value::Object(limits));
    }
}

fn check_secret(id: &ResourceId, document: &Value) -> Result<(), RenderError> {
    if document.get("stringData").is_some() {
        return Err(RenderError::PlaintextSecret {
            resource: id.to_string(),
            path: String::from("/stringData"),
        });
    }
    let Some(data) = document.get("data") else {
        return Ok(());
    };
    let Some(data) = data.as_object() else {
        return Err(RenderError::invalid_patch(id.to_string(), "/data", "Secret data must be a map"));
    };
    for (key, value) in data {
        if value.as_str().and_then(parse_reference).is_none() {
            return Err(RenderError::PlaintextSecret {
                resource: id.to_string(),
                path: format!("/data/{key}"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::patch::{PatchTarget, SetOperation};
    use serde_json::json;

    fn spec(profile: ResourceProfile) -> EnvironmentSpec {
        EnvironmentSpec {
            environment: Environment::Dev,
            namespace: String::from("shop-dev"),
            requires_confirmation: false,
            resources: profile,
            context: None,
        }
    }

    fn doc(source: &str, document: Value) -> SourceDocument {
        SourceDocument {
            source: source.to_string(),
            document,
        }
    }

    fn base() -> Vec<SourceDocument> {
        vec![
            doc("base/web.yaml", json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "web"},
                "spec": {"replicas": 1, "template": {"spec": {"containers": [{"name": "web", "image": "shop/web:1"}]}}}
            })),
            doc("base/db.yaml", json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {"name": "db"},
                "data": {"password": "${secret:DB_PASSWORD}"}
            })),
            doc("base/ns.yaml", json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "shop-dev"}})),
        ]
    }

    fn layer(patches: Vec<Patch>) -> OverlayLayer {
        OverlayLayer {
            source: String::from("overlays/dev"),
            overlay: Overlay {
                patches,
                ..Overlay::default()
            },
            resources: Vec::new(),
        }
    }

    fn target(kind: &str, name: &str) -> PatchTarget {
        PatchTarget {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: None,
        }
    }

    fn merge_patch(kind: &str, name: &str, merge: Value) -> Patch {
        Patch {
            target: target(kind, name),
            merge: Some(merge),
            set: Vec::new(),
        }
    }

    #[test]
    fn test_render_applies_defaults_and_patches() {
        let inputs = OverlayInputs {
            base: base(),
            overlays: vec![layer(vec![
                merge_patch("Deployment", "web", json!({"spec": {"replicas": 2}})),
                Patch {
                    target: target("Deployment", "web"),
                    merge: None,
                    set: vec![SetOperation {
                        path: String::from("/spec/replicas"),
                        value: json!(3),
                    }],
                },
            ])],
        };
        let profile = ResourceProfile {
            cpu: Some(String::from("250m")),
            memory: None,
        };
        let set = render(&spec(profile), &inputs).unwrap();

        let web = set.get(&ResourceId::new("Deployment", "shop-dev", "web")).unwrap();
        assert_eq!(web["spec"]["replicas"], 3);
        assert_eq!(web["metadata"]["labels"][MANAGED_BY_LABEL], MANAGED_BY_VALUE);
        assert_eq!(web["metadata"]["labels"][ENVIRONMENT_LABEL], "dev");
        assert_eq!(
            web["spec"]["template"]["spec"]["containers"][0]["resources"]["limits"],
            json!({"cpu": "250m"})
        );

        let ns = set.get(&ResourceId::new("Namespace", "", "shop-dev")).unwrap();
        assert!(ns["metadata"].get("namespace").is_none());
    }

    #[test]
    fn test_render_is_deterministic() {
        let inputs = OverlayInputs {
            base: base(),
            overlays: vec![layer(vec![merge_patch("Deployment", "web", json!({"spec": {"replicas": 2}}))])],
        };
        let a = render(&spec(ResourceProfile::default()), &inputs).unwrap();
        let b = render(&spec(ResourceProfile::default()), &inputs).unwrap();
        assert_eq!(a.canonical_json(), b.canonical_json());
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_later_patches_win() {
        let inputs = OverlayInputs {
            base: base(),
            overlays: vec![
                layer(vec![merge_patch("Deployment", "web", json!({"spec": {"replicas": 2}}))]),
                layer(vec![merge_patch("Deployment", "web", json!({"spec": {"replicas": 4}}))]),
            ],
        };
        let set = render(&spec(ResourceProfile::default()), &inputs).unwrap();
        let web = set.get(&ResourceId::new("Deployment", "shop-dev", "web")).unwrap();
        assert_eq!(web["spec"]["replicas"], 4);
    }

    #[test]
    fn test_service_and_container_ports_patch() {
        let mut documents = base();
        documents.push(doc("base/svc.yaml", json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "web"},
            "spec": {"ports": [
                {"name": "http", "port": 80, "targetPort": 8080},
                {"name": "admin", "port": 8081, "targetPort": 8081}
            ]}
        })));
        let inputs = OverlayInputs {
            base: documents,
            overlays: vec![layer(vec![
                merge_patch("Service", "web", json!({"spec": {"ports": [{"name": "http", "port": 80, "targetPort": 9090}]}})),
                merge_patch("Deployment", "web", json!({"spec": {"template": {"spec": {"containers": [
                    {"name": "web", "ports": [{"containerPort": 9090}]}
                ]}}}})),
            ])],
        };
        let set = render(&spec(ResourceProfile::default()), &inputs).unwrap();

        let svc = set.get(&ResourceId::new("Service", "shop-dev", "web")).unwrap();
        assert_eq!(svc["spec"]["ports"][0]["targetPort"], 9090);
        assert_eq!(svc["spec"]["ports"][1]["name"], "admin");

        let web = set.get(&ResourceId::new("Deployment", "shop-dev", "web")).unwrap();
        assert_eq!(web["spec"]["template"]["spec"]["containers"][0]["ports"][0]["containerPort"], 9090);
    }

    #[test]
    fn test_patch_for_missing_base() {
        let inputs = OverlayInputs {
            base: base(),
            overlays: vec![layer(vec![merge_patch("Deployment", "api", json!({"spec": {}}))])],
        };
        let err = render(&spec(ResourceProfile::default()), &inputs).unwrap_err();
        assert!(matches!(err, RenderError::MissingBase { .. }));
    }

    #[test]
    fn test_no_overlay_is_unresolved() {
        let inputs = OverlayInputs {
            base: base(),
            overlays: Vec::new(),
        };
        let err = render(&spec(ResourceProfile::default()), &inputs).unwrap_err();
        assert!(matches!(err, RenderError::UnresolvedOverlay { .. }));
    }

    #[test]
    fn test_plaintext_secret_rejected() {
        let mut docs = base();
        docs[1].document["data"]["password"] = json!("aHVudGVyMg==");
        let inputs = OverlayInputs {
            base: docs,
            overlays: vec![layer(Vec::new())],
        };
        let err = render(&spec(ResourceProfile::default()), &inputs).unwrap_err();
        match err {
            RenderError::PlaintextSecret { path, .. } => assert_eq!(path, "/data/password"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_identity_change_rejected() {
        let inputs = OverlayInputs {
            base: base(),
            overlays: vec![layer(vec![merge_patch("Deployment", "web", json!({"metadata": {"name": "api"}}))])],
        };
        let err = render(&spec(ResourceProfile::default()), &inputs).unwrap_err();
        assert!(matches!(err, RenderError::InvalidPatch { .. }));
    }

    #[test]
    fn test_duplicate_resource() {
        let mut docs = base();
        docs.push(docs[0].clone());
        let inputs = OverlayInputs {
            base: docs,
            overlays: vec![layer(Vec::new())],
        };
        let err = render(&spec(ResourceProfile::default()), &inputs).unwrap_err();
        assert!(matches!(err, RenderError::DuplicateResource { .. }));
    }
}
