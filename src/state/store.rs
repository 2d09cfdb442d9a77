//! History store trait definition.
//!
//! Backends implement raw access to one history log and one lock per
//! environment; the history operations are built on top of those.

use async_trait::async_trait;
use tracing::{debug, info};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::types::{HistoryLog, ResultState, RolloutRecord};
use crate::config::Environment;
use crate::error::{Result, StateError};

/// Trait for rollout history backends.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Loads the history log of an environment.
    ///
    /// Returns `None` if nothing was recorded yet.
    async fn load_log(&self, environment: Environment) -> Result<Option<HistoryLog>>;

    /// Replaces the history log of an environment atomically.
    async fn save_log(&self, log: &HistoryLog) -> Result<()>;

    /// Reads the lock of an environment.
    async fn read_lock(&self, environment: Environment) -> Result<Option<LockInfo>>;

    /// Writes the lock of an environment.
    async fn write_lock(&self, lock: &LockInfo) -> Result<()>;

    /// Removes the lock of an environment.
    async fn delete_lock(&self, environment: Environment) -> Result<()>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;

    /// Appends a record and returns its id.
    async fn append(&self, record: &RolloutRecord) -> Result<String> {
        let mut log = self.log_or_new(record.environment).await?;
        log.append(record.clone())?;
        self.save_log(&log).await?;
        info!(
            "Appended {} record {} ({})",
            record.environment, record.id, record.result_state
        );
        Ok(record.id.clone())
    }

    /// Sets the terminal state of an in-progress record, exactly once.
    async fn finalize(
        &self,
        environment: Environment,
        record_id: &str,
        state: ResultState,
        error: Option<String>,
    ) -> Result<RolloutRecord> {
        let mut log = self.log_or_new(environment).await?;
        let record = log.finalize(record_id, state, error)?;
        self.save_log(&log).await?;
        info!("Finalized {environment} record {record_id} as {state}");
        Ok(record)
    }

    /// The most recently appended record.
    async fn head(&self, environment: Environment) -> Result<Option<RolloutRecord>> {
        Ok(self.log_or_new(environment).await?.head().cloned())
    }

    /// Up to `limit` records, most recent first.
    async fn history(&self, environment: Environment, limit: usize) -> Result<Vec<RolloutRecord>> {
        Ok(self.log_or_new(environment).await?.recent(limit))
    }

    /// A record by id.
    async fn get(&self, environment: Environment, record_id: &str) -> Result<Option<RolloutRecord>> {
        Ok(self.log_or_new(environment).await?.get(record_id).cloned())
    }

    /// The latest `Succeeded` record appended before `before`; `None` when
    /// `before` names no record.
    async fn last_succeeded(
        &self,
        environment: Environment,
        before: Option<&str>,
    ) -> Result<Option<RolloutRecord>> {
        Ok(self
            .log_or_new(environment)
            .await?
            .last_succeeded(before)
            .cloned())
    }

    /// Acquires the environment lock.
    ///
    /// An empty `holder` is replaced by a generated process identifier.
    async fn acquire_lock(&self, environment: Environment, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock(environment).await? {
            if !existing.is_expired() {
                return Err(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            debug!("Expired {environment} lock found, taking over");
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock = LockInfo::new(environment, &holder_id);
        self.write_lock(&lock).await?;
        info!(
            "Acquired {environment} lock: {} (expires in {}s)",
            lock.lock_id, LOCK_EXPIRY_SECS
        );
        Ok(lock)
    }

    /// Extends a held lock.
    ///
    /// Fails with [`StateError::LockedByOther`] if the lock was taken over.
    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        if let Some(current) = self.read_lock(lock.environment).await?
            && current.lock_id != lock.lock_id
        {
            return Err(StateError::LockedByOther {
                holder: current.holder,
                since: current.acquired_at.to_rfc3339(),
            }
            .into());
        }
        let mut refreshed = lock.clone();
        refreshed.refresh();
        self.write_lock(&refreshed).await?;
        debug!("Refreshed {} lock {}", lock.environment, lock.lock_id);
        Ok(refreshed)
    }

    /// Releases a lock if it is still the one held.
    async fn release_lock(&self, environment: Environment, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock(environment).await? {
            if existing.lock_id == lock_id {
                self.delete_lock(environment).await?;
                info!("Released {environment} lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    /// Gets current lock information if locked.
    async fn get_lock_info(&self, environment: Environment) -> Result<Option<LockInfo>> {
        self.read_lock(environment).await
    }

    /// Checks if the environment holds a live lock.
    async fn is_locked(&self, environment: Environment) -> Result<bool> {
        Ok(self
            .read_lock(environment)
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Loads the log, or an empty one, checking its format.
    async fn log_or_new(&self, environment: Environment) -> Result<HistoryLog> {
        match self.load_log(environment).await? {
            Some(log) => {
                log.check(environment)?;
                Ok(log)
            }
            None => Ok(HistoryLog::new(environment)),
        }
    }
}

#[async_trait]
impl HistoryStore for Box<dyn HistoryStore> {
    async fn load_log(&self, environment: Environment) -> Result<Option<HistoryLog>> {
        (**self).load_log(environment).await
    }

    async fn save_log(&self, log: &HistoryLog) -> Result<()> {
        (**self).save_log(log).await
    }

    async fn read_lock(&self, environment: Environment) -> Result<Option<LockInfo>> {
        (**self).read_lock(environment).await
    }

    async fn write_lock(&self, lock: &LockInfo) -> Result<()> {
        (**self).write_lock(lock).await
    }

    async fn delete_lock(&self, environment: Environment) -> Result<()> {
        (**self).delete_lock(environment).await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
