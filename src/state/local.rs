//! Local file-based history backend.
//!
//! Layout under the base directory:
//!
//! ```text
//! history/<env>.json   append-only rollout log
//! locks/<env>.lock     environment lock
//! ```

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::Environment;
use crate::error::{Result, RollwardenError, StateError};

use super::lock::LockInfo;
use super::store::HistoryStore;
use super::types::HistoryLog;

/// Default history directory name.
pub const STATE_DIR: &str = ".rollwarden";

/// Writes `content` to `path` through a synced temporary file and a rename,
/// creating the parent directory if needed.
///
/// # Errors
///
/// Returns the underlying IO error; the previous file is left untouched.
pub async fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).await?;
    }

    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&temp_path, path).await
}

/// Local file-based history store.
#[derive(Debug)]
pub struct LocalHistoryStore {
    /// Base directory for history files.
    base_dir: PathBuf,
}

impl LocalHistoryStore {
    /// Creates a store under `.rollwarden` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| RollwardenError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn history_path(&self, environment: Environment) -> PathBuf {
        self.base_dir.join("history").join(format!("{environment}.json"))
    }

    fn lock_path(&self, environment: Environment) -> PathBuf {
        self.base_dir.join("locks").join(format!("{environment}.lock"))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        if !path.exists() {
            debug!("{} does not exist", path.display());
            return Ok(None);
        }

        let content = fs::read_to_string(path).await.map_err(|e| StateError::Corrupted {
            message: format!("Failed to read {}: {e}", path.display()),
        })?;

        let value = serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse {}: {e}", path.display()),
        })?;

        Ok(Some(value))
    }

    async fn write_json<T: serde::Serialize + Sync>(path: &Path, value: &T) -> Result<()> {
        let content = serde_json::to_vec_pretty(value)
            .map_err(|e| StateError::serialization(format!("Failed to serialize {}: {e}", path.display())))?;

        write_atomic(path, &content)
            .await
            .map_err(|e| StateError::local(format!("Failed to write {}: {e}", path.display())))?;
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for LocalHistoryStore {
    async fn load_log(&self, environment: Environment) -> Result<Option<HistoryLog>> {
        Self::read_json(&self.history_path(environment)).await
    }

    async fn save_log(&self, log: &HistoryLog) -> Result<()> {
        let path = self.history_path(log.environment);
        Self::write_json(&path, log).await?;
        debug!("History saved to {}", path.display());
        Ok(())
    }

    async fn read_lock(&self, environment: Environment) -> Result<Option<LockInfo>> {
        Self::read_json(&self.lock_path(environment)).await
    }

    async fn write_lock(&self, lock: &LockInfo) -> Result<()> {
        Self::write_json(&self.lock_path(lock.environment), lock)
            .await
            .map_err(|e| {
                StateError::LockFailed {
                    message: e.to_string(),
                }
                .into()
            })
    }

    async fn delete_lock(&self, environment: Environment) -> Result<()> {
        let path = self.lock_path(environment);
        if path.exists() {
            fs::remove_file(&path).await.map_err(|e| StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })?;
        }
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
