//! Overlay patch application.
//!
//! Maps merge recursively and `null` deletes a field. A list merges by named
//! element only when its field has a merge key; otherwise the patch replaces
//! it. Positional merging never happens.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::RenderError;

/// Directive key inside a list element.
const PATCH_DIRECTIVE: &str = "$patch";

/// List field → merge key for named-element list merging.
///
/// An entry is either a bare field name (`env`) or a dotted path suffix
/// (`spec.ports`) that must align with whole path segments. The longest
/// matching entry wins, so `containers.ports` and `spec.ports` can key the
/// same field name differently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeKeys(BTreeMap<String, String>);

impl Default for MergeKeys {
    fn default() -> Self {
        let defaults = [
            ("containers", "name"),
            ("initContainers", "name"),
            ("env", "name"),
            ("volumes", "name"),
            ("imagePullSecrets", "name"),
            ("volumeMounts", "mountPath"),
            ("containers.ports", "containerPort"),
            ("initContainers.ports", "containerPort"),
            ("spec.ports", "port"),
        ];
        Self(
            defaults
                .iter()
                .map(|(field, key)| ((*field).to_string(), (*key).to_string()))
                .collect(),
        )
    }
}

impl MergeKeys {
    /// Returns a copy with additional or overriding keys.
    #[must_use]
    pub fn extended(&self, extra: &BTreeMap<String, String>) -> Self {
        let mut keys = self.0.clone();
        keys.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self(keys)
    }

    /// Merge key for the list at `path`, a patch path such as
    /// `/spec/template/spec/containers[name=web]/ports`.
    #[must_use]
    pub fn for_path(&self, path: &str) -> Option<&str> {
        let mut fields = String::with_capacity(path.len());
        let mut depth = 0usize;
        for c in path.chars() {
            match c {
                '[' => depth += 1,
                ']' => depth = depth.saturating_sub(1),
                _ if depth > 0 => {}
                c => fields.push(c),
            }
        }
        let dotted = fields
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join(".");

        self.0
            .iter()
            .filter(|(suffix, _)| {
                dotted == **suffix
                    || dotted
                        .strip_suffix(suffix.as_str())
                        .is_some_and(|rest| rest.ends_with('.'))
            })
            .max_by_key(|(suffix, _)| suffix.split('.').count())
            .map(|(_, key)| key.as_str())
    }
}

/// Which resource a patch applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchTarget {
    /// Resource kind.
    pub kind: String,
    /// Resource name.
    pub name: String,
    /// Namespace; defaults to the environment's namespace.
    #[serde(default)]
    pub namespace: Option<String>,
}

/// A single field assignment addressed by JSON pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetOperation {
    /// JSON pointer (e.g. `/spec/replicas`); its parent must resolve.
    pub path: String,
    /// Value to assign.
    pub value: Value,
}

/// One patch from an overlay file: either a merge document or set
/// operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    /// Target resource.
    pub target: PatchTarget,
    /// Strategic merge document.
    #[serde(default)]
    pub merge: Option<Value>,
    /// Field assignments.
    #[serde(default)]
    pub set: Vec<SetOperation>,
}

/// Contents of an `overlay.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overlay {
    /// Patches, applied in order.
    #[serde(default)]
    pub patches: Vec<Patch>,
    /// Additional merge keys for list fields.
    #[serde(default)]
    pub merge_keys: BTreeMap<String, String>,
    /// Extra resource files, relative to the overlay directory.
    #[serde(default)]
    pub resources: Vec<String>,
}

/// Applies a strategic merge patch, returning the merged document.
///
/// # Errors
///
/// Returns [`RenderError::InvalidPatch`] when the patch shape conflicts with
/// the base or a keyed list element lacks its merge key.
pub fn strategic_merge(
    base: &Value,
    patch: &Value,
    keys: &MergeKeys,
    target: &str,
) -> Result<Value, RenderError> {
    merge_value(base, patch, keys, target, "")
}

fn merge_value(
    base: &Value,
    patch: &Value,
    keys: &MergeKeys,
    target: &str,
    path: &str,
) -> Result<Value, RenderError> {
    let Some(patch_map) = patch.as_object() else {
        return Ok(patch.clone());
    };

    let mut merged = match base {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        _ => {
            return Err(RenderError::invalid_patch(
                target,
                display_path(path),
                "patch is an object but the base value is not",
            ));
        }
    };

    for (field, patch_value) in patch_map {
        let field_path = format!("{path}/{field}");
        if patch_value.is_null() {
            merged.remove(field);
            continue;
        }

        let base_value = merged.get(field).unwrap_or(&Value::Null);
        let new_value = match patch_value {
            Value::Object(_) => merge_value(base_value, patch_value, keys, target, &field_path)?,
            Value::Array(items) => match keys.for_path(&field_path) {
                Some(merge_key) => merge_list(base_value, items, merge_key, keys, target, &field_path)?,
                None => patch_value.clone(),
            },
            scalar => {
                if base_value.is_object() || base_value.is_array() {
                    return Err(RenderError::invalid_patch(
                        target,
                        field_path,
                        "patch is a scalar but the base value is structured",
                    ));
                }
                scalar.clone()
            }
        };
        merged.insert(field.clone(), new_value);
    }

    Ok(Value::Object(merged))
}

fn merge_list(
    base: &Value,
    items: &[Value],
    merge_key: &str,
    keys: &MergeKeys,
    target: &str,
    path: &str,
) -> Result<Value, RenderError> {
    let mut merged = match base {
        Value::Array(list) => list.clone(),
        Value::Null => Vec::new(),
        _ => {
            return Err(RenderError::invalid_patch(
                target,
                path,
                "patch is a list but the base value is not",
            ));
        }
    };

    for item in items {
        let Some(key_value) = item.get(merge_key).filter(|v| !v.is_null()) else {
            return Err(RenderError::invalid_patch(
                target,
                path,
                format!("list element lacks merge key '{merge_key}'"),
            ));
        };
        let position = merged.iter().position(|e| e.get(merge_key) == Some(key_value));
        let element_path = format!("{path}[{merge_key}={}]", scalar_text(key_value));

        if item.get(PATCH_DIRECTIVE).and_then(Value::as_str) == Some("delete") {
            if let Some(index) = position {
                merged.remove(index);
            }
            continue;
        }

        match position {
            Some(index) => {
                merged[index] = merge_value(&merged[index], item, keys, target, &element_path)?;
            }
            None => merged.push(strip_directives(item)),
        }
    }

    Ok(Value::Array(merged))
}

/// Removes `null` fields and directives from a value being added fresh.
fn strip_directives(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, v)| k.as_str() != PATCH_DIRECTIVE && !v.is_null())
                .map(|(k, v)| (k.clone(), strip_directives(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_directives).collect()),
        other => other.clone(),
    }
}

/// Assigns `value` at a JSON pointer, returning the updated document.
///
/// # Errors
///
/// Returns [`RenderError::InvalidPatch`] if the parent path does not resolve
/// or the last segment cannot address it.
pub fn set_path(document: &Value, pointer: &str, value: &Value, target: &str) -> Result<Value, RenderError> {
    let invalid = |message: &str| RenderError::invalid_patch(target, pointer, message);

    if !pointer.starts_with('/') {
        return Err(invalid("path must be a JSON pointer starting with '/'"));
    }
    let (parent_pointer, last) = pointer.rsplit_once('/').unwrap_or(("", pointer));
    let last = unescape(last);

    let mut updated = document.clone();
    let parent = updated
        .pointer_mut(parent_pointer)
        .ok_or_else(|| invalid("parent path does not resolve"))?;

    match parent {
        Value::Object(map) => {
            if value.is_null() {
                map.remove(&last);
            } else {
                map.insert(last, value.clone());
            }
        }
        Value::Array(list) => {
            if last == "-" {
                list.push(value.clone());
            } else {
                let index: usize = last.parse().map_err(|_| invalid("list index is not a number"))?;
                let slot = list.get_mut(index).ok_or_else(|| invalid("list index out of range"))?;
                *slot = value.clone();
            }
        }
        _ => return Err(invalid("parent is neither an object nor a list")),
    }

    Ok(updated)
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn display_path(path: &str) -> String {
    if path.is_empty() { String::from("/") } else { path.to_string() }
}

fn scalar_text(value: &Value) -> String {
    value.as_str().map_or_else(|| value.to_string(), str::to_string)
}
