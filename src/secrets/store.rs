//! The secret store: versioned, sealed key/value material per environment.

use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::backend::SecretBackend;
use super::encryption::SealingKey;
use super::pinning;
use super::types::{
    INIT_PLACEHOLDER, RevealAcknowledgement, SecretEntry, SecretIssue, SecretRecord,
    SecretValidation, ValidationPolicy, is_placeholder, is_valid_key,
};
use crate::config::Environment;
use crate::error::SecretError;
use crate::manifest::ManifestSet;

/// Versioned secret material for all environments.
///
/// Mutations are read-modify-write under a per-environment mutex; the
/// backend write is the commit point, so a failed write leaves the previous
/// version in place.
pub struct SecretStore {
    backend: Arc<dyn SecretBackend>,
    key: SealingKey,
    locks: HashMap<Environment, Mutex<()>>,
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("backend", &self.backend.backend_type())
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl SecretStore {
    /// Creates a store over a backend.
    #[must_use]
    pub fn new(backend: Arc<dyn SecretBackend>, key: SealingKey) -> Self {
        let locks = Environment::ALL.into_iter().map(|env| (env, Mutex::new(()))).collect();
        Self { backend, key, locks }
    }

    /// Returns the backend type name.
    #[must_use]
    pub fn backend_type(&self) -> &'static str {
        self.backend.backend_type()
    }

    async fn load(&self, environment: Environment) -> Result<SecretRecord, SecretError> {
        match self.backend.load(environment).await? {
            Some(sealed) => self.key.unseal(environment, &sealed),
            None => Ok(SecretRecord::new(environment)),
        }
    }

    async fn persist(&self, record: &SecretRecord) -> Result<(), SecretError> {
        let sealed = self.key.seal(record)?;
        self.backend.store(record.environment, &sealed).await
    }

    fn lock(&self, environment: Environment) -> &Mutex<()> {
        // Every environment is inserted in `new`.
        &self.locks[&environment]
    }

    /// Returns the environment's record, empty if nothing is stored yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the record cannot be unsealed.
    pub async fn get(&self, environment: Environment) -> Result<SecretRecord, SecretError> {
        let _guard = self.lock(environment).lock().await;
        self.load(environment).await
    }

    /// Creates missing keys with the placeholder value.
    ///
    /// Returns the keys that were created.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed key or if the record cannot be saved.
    pub async fn init(
        &self,
        environment: Environment,
        keys: &BTreeSet<String>,
    ) -> Result<Vec<String>, SecretError> {
        if let Some(bad) = keys.iter().find(|k| !is_valid_key(k)) {
            return Err(SecretError::MalformedKey { key: bad.clone() });
        }

        let _guard = self.lock(environment).lock().await;
        let mut record = self.load(environment).await?;
        let now = Utc::now();

        let created: Vec<String> = keys
            .iter()
            .filter(|k| !record.entries.contains_key(*k))
            .cloned()
            .collect();
        for key in &created {
            record
                .entries
                .insert(key.clone(), SecretEntry::new(SecretString::from(INIT_PLACEHOLDER), now));
        }

        if created.is_empty() {
            debug!("All {} secret keys already exist in {environment}", keys.len());
        } else {
            self.persist(&record).await?;
            info!("Initialized {} secret key(s) in {environment}", created.len());
        }
        Ok(created)
    }

    /// Sets a value, creating the key if needed. Returns the new version.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed key or if the record cannot be saved.
    pub async fn put(
        &self,
        environment: Environment,
        key: &str,
        value: SecretString,
    ) -> Result<u64, SecretError> {
        self.write(environment, key, value, false).await
    }

    /// Replaces the value of an existing key. Returns the new version.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::KeyNotFound`] if the key does not exist.
    pub async fn rotate(
        &self,
        environment: Environment,
        key: &str,
        value: SecretString,
    ) -> Result<u64, SecretError> {
        self.write(environment, key, value, true).await
    }

    async fn write(
        &self,
        environment: Environment,
        key: &str,
        value: SecretString,
        must_exist: bool,
    ) -> Result<u64, SecretError> {
        if !is_valid_key(key) {
            return Err(SecretError::MalformedKey { key: key.to_string() });
        }

        let _guard = self.lock(environment).lock().await;
        let mut record = self.load(environment).await?;
        let now = Utc::now();

        let version = match record.entries.get_mut(key) {
            Some(entry) => entry.bump(value, now),
            None if must_exist => {
                return Err(SecretError::KeyNotFound {
                    environment,
                    key: key.to_string(),
                });
            }
            None => {
                record.entries.insert(key.to_string(), SecretEntry::new(value, now));
                1
            }
        };

        self.persist(&record).await?;
        info!(
            "{} secret {key} in {environment}: now v{version}",
            if must_exist { "Rotated" } else { "Stored" }
        );
        Ok(version)
    }

    /// Checks every value for placeholders and empties, and every key for
    /// well-formedness.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be loaded.
    pub async fn validate(&self, environment: Environment) -> Result<SecretValidation, SecretError> {
        self.validate_references(environment, &BTreeSet::new()).await
    }

    /// Like [`Self::validate`], additionally reporting referenced keys that
    /// are not set.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be loaded.
    pub async fn validate_references(
        &self,
        environment: Environment,
        referenced: &BTreeSet<String>,
    ) -> Result<SecretValidation, SecretError> {
        let record = self.get(environment).await?;
        let mut issues = Vec::new();

        for (key, entry) in &record.entries {
            let value = entry.current.value.expose_secret();
            if !is_valid_key(key) {
                issues.push(SecretIssue::MalformedKey { key: key.clone() });
            } else if value.trim().is_empty() {
                issues.push(SecretIssue::EmptyValue { key: key.clone() });
            } else if is_placeholder(value) {
                issues.push(SecretIssue::PlaceholderFound { key: key.clone() });
            }
        }

        for key in referenced.iter().filter(|k| !record.entries.contains_key(*k)) {
            issues.push(SecretIssue::MissingKey { key: key.clone() });
        }

        Ok(SecretValidation {
            environment,
            policy: ValidationPolicy::for_environment(environment),
            issues,
        })
    }

    /// Applies the environment's policy to a validation result: fatal
    /// policies fail, others log a warning per issue.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::ValidationFailed`] under a fatal policy.
    pub fn enforce(validation: &SecretValidation) -> Result<(), SecretError> {
        if validation.is_ok() {
            return Ok(());
        }

        match validation.policy {
            ValidationPolicy::Fatal => Err(SecretError::ValidationFailed {
                environment: validation.environment,
                issues: validation.issues.len(),
                summary: validation
                    .issues
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
            ValidationPolicy::Warn => {
                for issue in &validation.issues {
                    warn!("Secret issue in {}: {issue}", validation.environment);
                }
                Ok(())
            }
        }
    }

    /// Reveals one value. Requires an acknowledgement and writes an audit
    /// entry with the key and version only.
    ///
    /// # Errors
    ///
    /// Returns an error if the acknowledgement has no reason or the key does
    /// not exist.
    pub async fn reveal(
        &self,
        environment: Environment,
        key: &str,
        ack: &RevealAcknowledgement,
    ) -> Result<SecretString, SecretError> {
        if ack.reason.trim().is_empty() || ack.requested_by.trim().is_empty() {
            return Err(SecretError::AcknowledgementRequired { key: key.to_string() });
        }

        let record = self.get(environment).await?;
        let entry = record.entries.get(key).ok_or_else(|| SecretError::KeyNotFound {
            environment,
            key: key.to_string(),
        })?;

        info!(
            target: "rollwarden::audit",
            environment = %environment,
            key = key,
            version = entry.current.version,
            requested_by = %ack.requested_by,
            reason = %ack.reason,
            "secret revealed"
        );
        Ok(SecretString::from(entry.current.value.expose_secret().to_string()))
    }

    /// Pins the manifest's secret references to the current versions.
    ///
    /// # Errors
    ///
    /// Returns an error if a referenced key does not exist.
    pub async fn inject(&self, manifest: &ManifestSet) -> Result<ManifestSet, SecretError> {
        let record = self.get(manifest.environment()).await?;
        pinning::inject(&record, manifest)
    }

    /// Resolves the pins of one document against the stored versions.
    ///
    /// # Errors
    ///
    /// Returns an error if a pinned version is no longer retained.
    pub async fn materialize(&self, environment: Environment, document: &Value) -> Result<Value, SecretError> {
        let record = self.get(environment).await?;
        pinning::materialize(&record, document)
    }
}
