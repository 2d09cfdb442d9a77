//! Rollout states and outcomes.

use serde::Serialize;
use std::fmt;

use crate::config::Environment;
use crate::error::{Result, RolloutError};
use crate::state::ResultState;

/// Position of a rollout in its state machine.
///
/// `Planned → Applying → Monitoring → {Succeeded, RollingBack}`, and
/// `RollingBack → {Settled, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutState {
    /// Record appended, nothing applied yet.
    Planned,
    /// Applying actions in plan order.
    Applying,
    /// Waiting for workloads to become healthy.
    Monitoring,
    /// All workloads healthy.
    Succeeded,
    /// Restoring the previous state.
    RollingBack,
    /// Rollback applied and healthy.
    Settled,
    /// Rollback failed; operator intervention required.
    Failed,
}

impl RolloutState {
    /// Returns true for states that end the rollout.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Settled | Self::Failed)
    }

    /// The history result recorded for a terminal state.
    #[must_use]
    pub const fn result_state(self) -> Option<ResultState> {
        match self {
            Self::Succeeded => Some(ResultState::Succeeded),
            Self::Settled => Some(ResultState::RolledBack),
            Self::Failed => Some(ResultState::Failed),
            Self::Planned | Self::Applying | Self::Monitoring | Self::RollingBack => None,
        }
    }
}

impl fmt::Display for RolloutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planned => "planned",
            Self::Applying => "applying",
            Self::Monitoring => "monitoring",
            Self::Succeeded => "succeeded",
            Self::RollingBack => "rolling_back",
            Self::Settled => "settled",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Final report of a rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RolloutOutcome {
    /// Environment.
    pub environment: Environment,
    /// History record of the attempt.
    pub record_id: String,
    /// Terminal state.
    pub state: RolloutState,
    /// Actions applied before monitoring or rollback.
    pub applied: usize,
    /// Why the rollout did not succeed.
    pub error: Option<String>,
}

impl RolloutOutcome {
    /// Turns a `Failed` outcome into [`RolloutError::RollbackFailed`].
    ///
    /// # Errors
    ///
    /// Returns an error when the rollback itself failed.
    pub fn into_result(self) -> Result<Self> {
        if self.state == RolloutState::Failed {
            return Err(RolloutError::RollbackFailed {
                environment: self.environment,
                record_id: self.record_id,
                message: self.error.unwrap_or_else(|| String::from("unknown failure")),
            }
            .into());
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_map_to_results() {
        assert_eq!(RolloutState::Succeeded.result_state(), Some(ResultState::Succeeded));
        assert_eq!(RolloutState::Settled.result_state(), Some(ResultState::RolledBack));
        assert_eq!(RolloutState::Failed.result_state(), Some(ResultState::Failed));
        assert!(!RolloutState::Monitoring.is_terminal());
        assert!(RolloutState::Monitoring.result_state().is_none());
    }

    #[test]
    fn test_failed_outcome_is_error() {
        let outcome = RolloutOutcome {
            environment: Environment::Prod,
            record_id: String::from("rec-1"),
            state: RolloutState::Failed,
            applied: 2,
            error: Some(String::from("boom")),
        };
        let err = outcome.into_result().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("rec-1"));
        assert!(message.contains("boom"));
    }
}
