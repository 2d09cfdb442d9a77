//! Health gating for rolled-out workloads.
//!
//! A workload is healthy once its ready count has met the declared minimum
//! with no failure events for a number of consecutive polls. A workload that
//! met its minimum and then dropped below it has regressed.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::HealthSignal;
use crate::config::{Environment, RolloutSettings};
use crate::error::RolloutError;
use crate::manifest::{MIN_READY_ANNOTATION, ResourceId};
use crate::planner::Action;

/// Minimum ready replicas declared by a workload document.
///
/// The `rollwarden.io/min-ready` annotation wins, then `spec.replicas`,
/// then 1.
#[must_use]
pub fn min_ready(document: &Value) -> u32 {
    let annotated = document
        .pointer("/metadata/annotations")
        .and_then(|a| a.get(MIN_READY_ANNOTATION))
        .and_then(Value::as_str)
        .and_then(|s| s.trim().parse::<u32>().ok());
    annotated
        .or_else(|| {
            document
                .pointer("/spec/replicas")
                .and_then(Value::as_u64)
                .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
        })
        .unwrap_or(1)
}

/// A workload to watch and the ready count it must reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadTarget {
    /// Workload identity.
    pub id: ResourceId,
    /// Required ready replicas.
    pub min_ready: u32,
}

impl WorkloadTarget {
    /// Builds targets for the workloads an action list creates or updates.
    #[must_use]
    pub fn from_actions<'a>(actions: impl IntoIterator<Item = &'a Action>) -> Vec<Self> {
        actions
            .into_iter()
            .filter(|a| a.id.is_workload())
            .filter_map(|a| {
                a.after.as_ref().map(|doc| Self {
                    id: a.id.clone(),
                    min_ready: min_ready(doc),
                })
            })
            .collect()
    }
}

/// Result of a monitoring phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Every workload stayed healthy for the stability window.
    Healthy,
    /// The deadline passed with a workload still unhealthy.
    TimedOut {
        /// First workload that was not healthy.
        workload: ResourceId,
        /// The timeout that elapsed.
        timeout: Duration,
    },
    /// A workload dropped below its minimum after meeting it.
    Regressed {
        /// The workload.
        workload: ResourceId,
        /// Ready count observed.
        ready: u32,
        /// Required ready count.
        min_ready: u32,
    },
    /// Monitoring was cancelled.
    Cancelled,
}

impl HealthVerdict {
    /// Returns true for [`HealthVerdict::Healthy`].
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Human-readable reason for an unhealthy verdict.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Healthy => None,
            Self::TimedOut { workload, timeout } => Some(
                RolloutError::HealthTimeout {
                    workload: workload.to_string(),
                    timeout_secs: timeout.as_secs(),
                }
                .to_string(),
            ),
            Self::Regressed {
                workload,
                ready,
                min_ready,
            } => Some(format!(
                "Workload {workload} regressed to {ready}/{min_ready} ready replicas"
            )),
            Self::Cancelled => Some(String::from("Rollout cancelled by operator")),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    consecutive: u32,
    met: bool,
    healthy: bool,
}

/// Polls workload health until every target is stable, one regresses, the
/// deadline passes, or monitoring is cancelled.
#[derive(Clone)]
pub struct HealthMonitor {
    signal: Arc<dyn HealthSignal>,
    environment: Environment,
    poll_interval: Duration,
    stability_polls: u32,
    window: Duration,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("environment", &self.environment)
            .field("poll_interval", &self.poll_interval)
            .field("stability_polls", &self.stability_polls)
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Creates a monitor for one environment.
    #[must_use]
    pub fn new(signal: Arc<dyn HealthSignal>, environment: Environment, settings: &RolloutSettings) -> Self {
        Self {
            signal,
            environment,
            poll_interval: settings.poll_interval,
            stability_polls: settings.stability_polls.max(1),
            window: settings.stability_window(),
        }
    }

    /// Watches `targets` for at most `timeout`.
    ///
    /// Polls immediately, then once per interval. Errors from the health
    /// signal count as an unhealthy poll. Every target is polled on every
    /// round and all start together, so the single deadline gives each
    /// workload the full `timeout` to become healthy.
    pub async fn watch(
        &self,
        targets: &[WorkloadTarget],
        timeout: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> HealthVerdict {
        if targets.is_empty() {
            debug!("No workloads to monitor in {}", self.environment);
            return HealthVerdict::Healthy;
        }

        info!(
            "Monitoring {} workload(s) in {} (timeout {}s)",
            targets.len(),
            self.environment,
            timeout.as_secs()
        );
        let deadline = Instant::now() + timeout;
        let mut progress = vec![Progress::default(); targets.len()];

        loop {
            if is_cancelled(cancel) {
                return HealthVerdict::Cancelled;
            }

            for (target, state) in targets.iter().zip(progress.iter_mut()) {
                if let Some(verdict) = self.poll(target, state).await {
                    return verdict;
                }
            }

            if progress.iter().all(|p| p.healthy) {
                info!("All workloads healthy in {}", self.environment);
                return HealthVerdict::Healthy;
            }

            if Instant::now() >= deadline {
                let workload = targets
                    .iter()
                    .zip(&progress)
                    .find(|(_, p)| !p.healthy)
                    .map(|(t, _)| t.id.clone())
                    .unwrap_or_else(|| targets[0].id.clone());
                warn!("Health timeout in {}: {workload}", self.environment);
                return HealthVerdict::TimedOut { workload, timeout };
            }

            tokio::select! {
                () = tokio::time::sleep(self.poll_interval) => {}
                () = cancelled(cancel) => return HealthVerdict::Cancelled,
            }
        }
    }

    async fn poll(&self, target: &WorkloadTarget, state: &mut Progress) -> Option<HealthVerdict> {
        let ready = self.signal.ready_count(self.environment, &target.id).await;
        let events = self
            .signal
            .recent_failure_events(self.environment, &target.id, self.window)
            .await;

        let (ready, events) = match (ready, events) {
            (Ok(ready), Ok(events)) => (ready, events),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Health signal for {} unavailable: {e}", target.id);
                state.consecutive = 0;
                return None;
            }
        };

        if ready < target.min_ready {
            if state.met {
                warn!(
                    "{} regressed: {ready}/{} ready",
                    target.id, target.min_ready
                );
                return Some(HealthVerdict::Regressed {
                    workload: target.id.clone(),
                    ready,
                    min_ready: target.min_ready,
                });
            }
            state.consecutive = 0;
        } else {
            state.met = true;
            if events == 0 {
                state.consecutive += 1;
            } else {
                debug!("{} has {events} failure event(s) in window", target.id);
                state.consecutive = 0;
            }
        }

        if !state.healthy && state.consecutive >= self.stability_polls {
            info!("{} healthy ({ready}/{} ready)", target.id, target.min_ready);
            state.healthy = true;
        }
        debug!(
            "{}: {ready}/{} ready, {}/{} stable polls",
            target.id, target.min_ready, state.consecutive, self.stability_polls
        );
        None
    }
}

/// Returns true once cancellation was requested.
#[must_use]
pub fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// Resolves when cancellation is requested; never resolves if the sender
/// is gone without cancelling.
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use serde_json::json;

    fn settings() -> RolloutSettings {
        RolloutSettings {
            poll_interval: Duration::from_secs(10),
            stability_polls: 3,
            workload_timeout: Duration::from_secs(300),
            rollback_timeout: Duration::from_secs(300),
            retry_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_factor: 2,
        }
    }

    fn web() -> WorkloadTarget {
        WorkloadTarget {
            id: ResourceId::new("Deployment", "app-dev", "web"),
            min_ready: 2,
        }
    }

    fn monitor(cluster: &Arc<InMemoryCluster>) -> HealthMonitor {
        let signal: Arc<dyn HealthSignal> = cluster.clone();
        HealthMonitor::new(signal, Environment::Dev, &settings())
    }

    #[test]
    fn test_min_ready() {
        assert_eq!(min_ready(&json!({"spec": {"replicas": 3}})), 3);
        assert_eq!(
            min_ready(&json!({
                "metadata": {"annotations": {MIN_READY_ANNOTATION: "1"}},
                "spec": {"replicas": 3}
            })),
            1
        );
        assert_eq!(min_ready(&json!({"spec": {}})), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_after_stability_polls() {
        let cluster = Arc::new(InMemoryCluster::without_auto_ready());
        cluster.set_ready(Environment::Dev, &web().id, [0, 2]);
        let (_tx, mut rx) = watch::channel(false);

        let start = Instant::now();
        let verdict = monitor(&cluster)
            .watch(&[web()], Duration::from_secs(300), &mut rx)
            .await;

        assert_eq!(verdict, HealthVerdict::Healthy);
        // one unready poll, then three stable ones
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_events_block_health() {
        let cluster = Arc::new(InMemoryCluster::without_auto_ready());
        cluster.set_ready(Environment::Dev, &web().id, [2]);
        cluster.set_failure_events(Environment::Dev, &web().id, 1);
        let (_tx, mut rx) = watch::channel(false);

        let verdict = monitor(&cluster)
            .watch(&[web()], Duration::from_secs(60), &mut rx)
            .await;

        assert!(matches!(verdict, HealthVerdict::TimedOut { .. }));
        assert!(verdict.reason().unwrap().contains("not healthy within 60s"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_regression() {
        let cluster = Arc::new(InMemoryCluster::without_auto_ready());
        cluster.set_ready(Environment::Dev, &web().id, [2, 2, 1]);
        let (_tx, mut rx) = watch::channel(false);

        let verdict = monitor(&cluster)
            .watch(&[web()], Duration::from_secs(300), &mut rx)
            .await;

        assert_eq!(
            verdict,
            HealthVerdict::Regressed {
                workload: web().id,
                ready: 1,
                min_ready: 2
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_monitoring() {
        let cluster = Arc::new(InMemoryCluster::without_auto_ready());
        let (tx, mut rx) = watch::channel(false);
        let monitor = monitor(&cluster);

        let task = tokio::spawn(async move {
            monitor.watch(&[web()], Duration::from_secs(300), &mut rx).await
        });
        tokio::time::sleep(Duration::from_secs(15)).await;
        tx.send_replace(true);

        assert_eq!(task.await.unwrap(), HealthVerdict::Cancelled);
    }

    #[tokio::test]
    async fn test_no_workloads_is_healthy() {
        let cluster = Arc::new(InMemoryCluster::new());
        let (_tx, mut rx) = watch::channel(false);
        let verdict = monitor(&cluster).watch(&[], Duration::from_secs(1), &mut rx).await;
        assert!(verdict.is_healthy());
    }
}
