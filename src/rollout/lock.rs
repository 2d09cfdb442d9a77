//! In-process registry of environments with a running rollout.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::config::Environment;

/// Set of environments currently owned by a rollout in this process.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentLocks {
    held: Arc<Mutex<HashSet<Environment>>>,
}

impl EnvironmentLocks {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims an environment; `None` if it is already claimed.
    #[must_use]
    pub fn try_acquire(&self, environment: Environment) -> Option<EnvironmentGuard> {
        let mut held = self.held.lock().ok()?;
        if !held.insert(environment) {
            return None;
        }
        Some(EnvironmentGuard {
            environment,
            held: Arc::clone(&self.held),
        })
    }

    /// Returns true if the environment is claimed.
    #[must_use]
    pub fn is_held(&self, environment: Environment) -> bool {
        self.held.lock().is_ok_and(|held| held.contains(&environment))
    }
}

/// Releases the environment when dropped.
#[derive(Debug)]
pub struct EnvironmentGuard {
    environment: Environment,
    held: Arc<Mutex<HashSet<Environment>>>,
}

impl EnvironmentGuard {
    /// The claimed environment.
    #[must_use]
    pub const fn environment(&self) -> Environment {
        self.environment
    }
}

impl Drop for EnvironmentGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.environment);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_per_environment() {
        let locks = EnvironmentLocks::new();
        let dev = locks.try_acquire(Environment::Dev).unwrap();
        assert!(locks.try_acquire(Environment::Dev).is_none());
        assert!(locks.try_acquire(Environment::Prod).is_some());
        assert!(locks.is_held(Environment::Dev));

        drop(dev);
        assert!(!locks.is_held(Environment::Dev));
        assert!(locks.try_acquire(Environment::Dev).is_some());
    }
}
