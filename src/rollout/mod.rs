//! Rollout controller.
//!
//! Applies a plan, gates completion on workload health, and rolls back
//! automatically when a workload fails to become or stay healthy.

mod controller;
mod handle;
mod health;
mod lock;
mod retry;
mod state;

pub use controller::RolloutController;
pub use handle::RolloutHandle;
pub use health::{HealthMonitor, HealthVerdict, WorkloadTarget, cancelled, is_cancelled, min_ready};
pub use lock::{EnvironmentGuard, EnvironmentLocks};
pub use retry::RetryPolicy;
pub use state::{RolloutOutcome, RolloutState};
