//! Secret-at-rest backends.
//!
//! Backends only ever see [`EncryptedValue`]s; sealing happens in the store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use super::encryption::EncryptedValue;
use crate::config::Environment;
use crate::error::SecretError;
use crate::state::write_atomic;

/// Storage for sealed secret records, one per environment.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Loads the sealed record, or `None` if the environment has none yet.
    async fn load(&self, environment: Environment) -> Result<Option<EncryptedValue>, SecretError>;

    /// Replaces the sealed record atomically.
    async fn store(&self, environment: Environment, sealed: &EncryptedValue) -> Result<(), SecretError>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

/// Sealed records as JSON files, one per environment.
#[derive(Debug)]
pub struct LocalSecretBackend {
    dir: PathBuf,
}

impl LocalSecretBackend {
    /// Creates a backend rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, environment: Environment) -> PathBuf {
        self.dir.join(format!("{environment}.sealed.json"))
    }
}

#[async_trait]
impl SecretBackend for LocalSecretBackend {
    async fn load(&self, environment: Environment) -> Result<Option<EncryptedValue>, SecretError> {
        let path = self.path(environment);
        if !path.exists() {
            debug!("No sealed secrets at {}", path.display());
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| SecretError::backend(format!("Failed to read {}: {e}", path.display())))?;
        let sealed = serde_json::from_str(&content)
            .map_err(|e| SecretError::backend(format!("Failed to parse {}: {e}", path.display())))?;
        Ok(Some(sealed))
    }

    async fn store(&self, environment: Environment, sealed: &EncryptedValue) -> Result<(), SecretError> {
        let path = self.path(environment);
        let content = serde_json::to_vec_pretty(sealed)
            .map_err(|e| SecretError::backend(format!("Failed to serialize sealed record: {e}")))?;

        write_atomic(&path, &content)
            .await
            .map_err(|e| SecretError::backend(format!("Failed to write {}: {e}", path.display())))?;

        debug!("Stored sealed secrets for {environment} at {}", path.display());
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

/// In-memory backend for tests and simulation.
#[derive(Debug, Default)]
pub struct MemorySecretBackend {
    records: Mutex<HashMap<Environment, EncryptedValue>>,
}

impl MemorySecretBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretBackend for MemorySecretBackend {
    async fn load(&self, environment: Environment) -> Result<Option<EncryptedValue>, SecretError> {
        Ok(self.records.lock().await.get(&environment).cloned())
    }

    async fn store(&self, environment: Environment, sealed: &EncryptedValue) -> Result<(), SecretError> {
        self.records.lock().await.insert(environment, sealed.clone());
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
