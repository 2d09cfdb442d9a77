//! In-memory history backend for simulations and tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::Environment;
use crate::error::{Result, StateError};

use super::lock::LockInfo;
use super::store::HistoryStore;
use super::types::HistoryLog;

/// History kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    logs: Mutex<HashMap<Environment, HistoryLog>>,
    locks: Mutex<HashMap<Environment, LockInfo>>,
}

impl MemoryHistoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StateError {
    StateError::local("in-memory history lock poisoned")
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn load_log(&self, environment: Environment) -> Result<Option<HistoryLog>> {
        Ok(self.logs.lock().map_err(|_| poisoned())?.get(&environment).cloned())
    }

    async fn save_log(&self, log: &HistoryLog) -> Result<()> {
        self.logs
            .lock()
            .map_err(|_| poisoned())?
            .insert(log.environment, log.clone());
        Ok(())
    }

    async fn read_lock(&self, environment: Environment) -> Result<Option<LockInfo>> {
        Ok(self.locks.lock().map_err(|_| poisoned())?.get(&environment).cloned())
    }

    async fn write_lock(&self, lock: &LockInfo) -> Result<()> {
        self.locks
            .lock()
            .map_err(|_| poisoned())?
            .insert(lock.environment, lock.clone());
        Ok(())
    }

    async fn delete_lock(&self, environment: Environment) -> Result<()> {
        self.locks.lock().map_err(|_| poisoned())?.remove(&environment);
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
