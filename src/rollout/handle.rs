//! Handle to a running rollout.

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::state::{RolloutOutcome, RolloutState};
use crate::config::Environment;
use crate::error::{Result, RolloutError};

/// Observes, cancels and awaits a rollout started by
/// [`super::RolloutController::start`].
///
/// Dropping the handle does not stop the rollout.
#[derive(Debug)]
pub struct RolloutHandle {
    environment: Environment,
    record_id: String,
    state: watch::Receiver<RolloutState>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<RolloutOutcome>,
}

impl RolloutHandle {
    pub(crate) const fn new(
        environment: Environment,
        record_id: String,
        state: watch::Receiver<RolloutState>,
        cancel: watch::Sender<bool>,
        task: JoinHandle<RolloutOutcome>,
    ) -> Self {
        Self {
            environment,
            record_id,
            state,
            cancel,
            task,
        }
    }

    /// Environment being rolled out.
    #[must_use]
    pub const fn environment(&self) -> Environment {
        self.environment
    }

    /// History record of this rollout.
    #[must_use]
    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> RolloutState {
        *self.state.borrow()
    }

    /// A receiver notified on every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RolloutState> {
        self.state.clone()
    }

    /// Requests cancellation.
    ///
    /// While applying or monitoring this moves the rollout to `RollingBack`;
    /// a rollback in progress is not interrupted.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Waits for the rollout to reach a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`RolloutError::RollbackFailed`] when the rollout ended in
    /// `Failed`, or [`RolloutError::TaskAborted`] if the task panicked.
    pub async fn wait(self) -> Result<RolloutOutcome> {
        let outcome = self.task.await.map_err(|e| RolloutError::TaskAborted {
            environment: self.environment,
            message: e.to_string(),
        })?;
        outcome.into_result()
    }
}
