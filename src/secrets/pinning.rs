//! Pinning secret references in manifests.
//!
//! Rendered Secrets carry `${secret:KEY}` references. Injection pins each to
//! the current version (`secret://KEY#vN`) and records the pins in an
//! annotation; materialization resolves pins to base64 values right before
//! an apply; masking turns observed values back into pins for comparison.

use base64::{Engine, prelude::BASE64_STANDARD};
use secrecy::ExposeSecret;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use super::types::{PinnedRef, REDACTED, SecretRecord, parse_reference};
use crate::error::SecretError;
use crate::manifest::{ManifestSet, SECRET_REFS_ANNOTATION};

fn is_secret(document: &Value) -> bool {
    document.get("kind").and_then(Value::as_str) == Some("Secret")
}

/// Collects every key referenced by the manifest's Secrets.
#[must_use]
pub fn referenced_keys(manifest: &ManifestSet) -> BTreeSet<String> {
    manifest
        .iter()
        .filter(|(_, doc)| is_secret(doc))
        .filter_map(|(_, doc)| doc.get("data").and_then(Value::as_object))
        .flat_map(|data| data.values())
        .filter_map(Value::as_str)
        .filter_map(parse_reference)
        .map(str::to_string)
        .collect()
}

/// Replaces references with pins against `record`.
///
/// # Errors
///
/// Returns [`SecretError::KeyNotFound`] for a reference to an unknown key.
pub fn inject(record: &SecretRecord, manifest: &ManifestSet) -> Result<ManifestSet, SecretError> {
    manifest.try_map(|_, document| {
        if !is_secret(document) {
            return Ok(document.clone());
        }

        let mut document = document.clone();
        let mut pins: BTreeMap<String, String> = BTreeMap::new();

        if let Some(data) = document.get_mut("data").and_then(Value::as_object_mut) {
            for (data_key, value) in data.iter_mut() {
                let Some(key) = value.as_str().and_then(parse_reference) else {
                    continue;
                };
                let entry = record.entries.get(key).ok_or_else(|| SecretError::KeyNotFound {
                    environment: record.environment,
                    key: key.to_string(),
                })?;
                let pin = PinnedRef {
                    key: key.to_string(),
                    version: entry.current.version,
                }
                .to_string();
                pins.insert(data_key.clone(), pin.clone());
                *value = Value::String(pin);
            }
        }

        if !pins.is_empty() {
            let encoded = serde_json::to_string(&pins).map_err(|e| SecretError::backend(e.to_string()))?;
            set_annotation(&mut document, SECRET_REFS_ANNOTATION, encoded);
        }
        Ok(document)
    })
}

/// Resolves pins in a Secret to base64-encoded values.
///
/// Only the cluster provider should ever see the result.
///
/// # Errors
///
/// Returns an error if a value is not a pin or the pinned version is gone.
pub fn materialize(record: &SecretRecord, document: &Value) -> Result<Value, SecretError> {
    if !is_secret(document) {
        return Ok(document.clone());
    }

    let mut document = document.clone();
    if let Some(data) = document.get_mut("data").and_then(Value::as_object_mut) {
        for value in data.values_mut() {
            let reference = value.as_str().unwrap_or_default();
            let pin = PinnedRef::parse(reference)?;
            let entry = record.entries.get(&pin.key).ok_or_else(|| SecretError::KeyNotFound {
                environment: record.environment,
                key: pin.key.clone(),
            })?;
            let version = entry.version(pin.version).ok_or_else(|| SecretError::VersionNotFound {
                environment: record.environment,
                key: pin.key.clone(),
                version: pin.version,
            })?;
            *value = Value::String(BASE64_STANDARD.encode(version.value.expose_secret()));
        }
    }
    Ok(document)
}

/// Replaces observed Secret values with the pins recorded in the annotation,
/// or with the redaction marker when no pin exists.
#[must_use]
pub fn mask(document: &Value) -> Value {
    if !is_secret(document) {
        return document.clone();
    }

    let pins: BTreeMap<String, String> = document
        .pointer("/metadata/annotations")
        .and_then(|a| a.get(SECRET_REFS_ANNOTATION))
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();

    let mut document = document.clone();
    if let Some(obj) = document.as_object_mut() {
        obj.remove("stringData");
    }
    if let Some(data) = document.get_mut("data").and_then(Value::as_object_mut) {
        for (data_key, value) in data.iter_mut() {
            if value.as_str().is_some_and(|s| PinnedRef::parse(s).is_ok()) {
                continue;
            }
            *value = Value::String(pins.get(data_key).cloned().unwrap_or_else(|| REDACTED.to_string()));
        }
    }
    document
}

/// Returns true if the document holds a redacted value that cannot be restored.
#[must_use]
pub fn is_redacted(document: &Value) -> bool {
    is_secret(document)
        && document
            .get("data")
            .and_then(Value::as_object)
            .is_some_and(|data| data.values().any(|v| v.as_str() == Some(REDACTED)))
}

fn set_annotation(document: &mut Value, key: &str, value: String) {
    let Some(obj) = document.as_object_mut() else {
        return;
    };
    let metadata = obj
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(metadata) = metadata.as_object_mut() else {
        return;
    };
    let annotations = metadata
        .entry("annotations")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(annotations) = annotations.as_object_mut() {
        annotations.insert(key.to_string(), Value::String(value));
    }
}
