//! Reading base and overlay files from disk.
//!
//! All IO for rendering happens here so that [`super::render`] stays a pure
//! function of its inputs.

use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::patch::Overlay;
use super::renderer::{OverlayInputs, OverlayLayer, SourceDocument};
use crate::config::{Environment, ManifestsConfig};
use crate::error::RenderError;

/// Overlay definition file names, checked in order.
const OVERLAY_FILES: &[&str] = &["overlay.yaml", "overlay.yml"];

/// Files in a base directory that are not resources.
const SKIPPED_FILES: &[&str] = &["kustomization.yaml", "kustomization.yml"];

/// Loads the base documents and the environment's overlays.
///
/// Base files are read in file-name order; multi-document YAML streams are
/// split and empty documents skipped.
///
/// # Errors
///
/// Returns [`RenderError::UnresolvedOverlay`] if the environment declares no
/// overlay or any referenced file cannot be read or parsed.
pub fn load_overlay_inputs(
    manifests: &ManifestsConfig,
    root: &Path,
    environment: Environment,
) -> Result<OverlayInputs, RenderError> {
    let overlay_dirs = manifests
        .overlays
        .get(&environment)
        .filter(|dirs| !dirs.is_empty())
        .ok_or_else(|| RenderError::unresolved(environment, "no overlay declared in configuration"))?;

    let base_dir = resolve(root, &manifests.base);
    let base = load_dir(&base_dir, environment)?;
    debug!("Loaded {} base document(s) from {}", base.len(), base_dir.display());

    let overlays = overlay_dirs
        .iter()
        .map(|dir| load_layer(&resolve(root, dir), environment))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(OverlayInputs { base, overlays })
}

fn resolve(root: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() { path.to_path_buf() } else { root.join(path) }
}

fn load_dir(dir: &Path, environment: Environment) -> Result<Vec<SourceDocument>, RenderError> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        RenderError::unresolved(environment, format!("cannot read {}: {e}", dir.display()))
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            path.is_file()
                && (name.ends_with(".yaml") || name.ends_with(".yml"))
                && !SKIPPED_FILES.contains(&name)
                && !OVERLAY_FILES.contains(&name)
        })
        .collect();
    files.sort();

    let mut documents = Vec::new();
    for file in files {
        documents.extend(load_file(&file, environment)?);
    }
    Ok(documents)
}

fn load_file(path: &Path, environment: Environment) -> Result<Vec<SourceDocument>, RenderError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        RenderError::unresolved(environment, format!("cannot read {}: {e}", path.display()))
    })?;
    parse_documents(&text, &path.display().to_string())
        .map_err(|message| RenderError::unresolved(environment, message))
}

/// Splits a YAML stream into documents, skipping empty ones.
///
/// # Errors
///
/// Returns a description of the first document that fails to parse.
pub fn parse_documents(text: &str, source: &str) -> Result<Vec<SourceDocument>, String> {
    let mut documents = Vec::new();
    for (index, de) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let document = Value::deserialize(de)
            .map_err(|e| format!("cannot parse document {} of {source}: {e}", index + 1))?;
        if document.is_null() {
            continue;
        }
        documents.push(SourceDocument {
            source: source.to_string(),
            document,
        });
    }
    Ok(documents)
}

fn load_layer(dir: &Path, environment: Environment) -> Result<OverlayLayer, RenderError> {
    let overlay_file = OVERLAY_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
        .ok_or_else(|| {
            RenderError::unresolved(environment, format!("no overlay.yaml in {}", dir.display()))
        })?;

    let text = std::fs::read_to_string(&overlay_file).map_err(|e| {
        RenderError::unresolved(environment, format!("cannot read {}: {e}", overlay_file.display()))
    })?;
    let overlay: Overlay = serde_yaml::from_str(&text).map_err(|e| {
        RenderError::unresolved(environment, format!("cannot parse {}: {e}", overlay_file.display()))
    })?;

    let mut resources = Vec::new();
    for file in &overlay.resources {
        let path = dir.join(file);
        if !path.is_file() {
            return Err(RenderError::unresolved(
                environment,
                format!("resource {} referenced by {} not found", path.display(), overlay_file.display()),
            ));
        }
        resources.extend(load_file(&path, environment)?);
    }

    debug!(
        "Loaded overlay {} ({} patch(es), {} extra resource(s))",
        dir.display(),
        overlay.patches.len(),
        resources.len()
    );
    Ok(OverlayLayer {
        source: dir.display().to_string(),
        overlay,
        resources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(name), content).unwrap();
    }

    fn manifests(overlays: &[(Environment, &str)]) -> ManifestsConfig {
        let mut map = BTreeMap::new();
        for (env, dir) in overlays {
            map.insert(*env, vec![(*dir).to_string()]);
        }
        ManifestsConfig {
            base: String::from("base"),
            overlays: map,
        }
    }

    #[test]
    fn test_parse_multi_document_stream() {
        let text = "---\nkind: A\nmetadata: {name: a}\n---\n---\nkind: B\nmetadata: {name: b}\n";
        let docs = parse_documents(text, "x.yaml").unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].document["kind"], "B");
    }

    #[test]
    fn test_load_inputs() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(&root.join("base"), "b.yaml", "kind: Service\nmetadata: {name: web}\n");
        write(&root.join("base"), "a.yaml", "kind: ConfigMap\nmetadata: {name: cfg}\n");
        write(&root.join("base"), "kustomization.yaml", "resources: [a.yaml]\n");
        write(
            &root.join("overlays/dev"),
            "overlay.yaml",
            "patches:\n  - target: {kind: Service, name: web}\n    merge: {spec: {type: NodePort}}\nresources: [extra.yaml]\n",
        );
        write(&root.join("overlays/dev"), "extra.yaml", "kind: ConfigMap\nmetadata: {name: dev-only}\n");

        let inputs = load_overlay_inputs(&manifests(&[(Environment::Dev, "overlays/dev")]), root, Environment::Dev).unwrap();
        assert_eq!(inputs.base.len(), 2);
        assert_eq!(inputs.base[0].document["kind"], "ConfigMap");
        assert_eq!(inputs.overlays.len(), 1);
        assert_eq!(inputs.overlays[0].overlay.patches.len(), 1);
        assert_eq!(inputs.overlays[0].resources.len(), 1);
    }

    #[test]
    fn test_missing_overlay_declaration() {
        let temp = TempDir::new().unwrap();
        let err = load_overlay_inputs(&manifests(&[]), temp.path(), Environment::Prod).unwrap_err();
        assert!(matches!(err, RenderError::UnresolvedOverlay { .. }));
    }

    #[test]
    fn test_missing_overlay_file_and_extra_resource() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(&root.join("base"), "a.yaml", "kind: ConfigMap\nmetadata: {name: cfg}\n");
        std::fs::create_dir_all(root.join("overlays/stage")).unwrap();

        let config = manifests(&[(Environment::Stage, "overlays/stage")]);
        assert!(load_overlay_inputs(&config, root, Environment::Stage).is_err());

        write(&root.join("overlays/stage"), "overlay.yaml", "resources: [gone.yaml]\n");
        let err = load_overlay_inputs(&config, root, Environment::Stage).unwrap_err();
        assert!(err.to_string().contains("gone.yaml"));
    }
}
