//! The rollout state machine.
//!
//! A rollout owns its environment from the moment its record is appended
//! until the record is finalized: an in-process claim keeps two tasks of
//! this process apart, the history store lock keeps two processes apart.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handle::RolloutHandle;
use super::health::{HealthMonitor, WorkloadTarget, is_cancelled};
use super::lock::{EnvironmentGuard, EnvironmentLocks};
use super::retry::RetryPolicy;
use super::state::{RolloutOutcome, RolloutState};
use crate::cluster::{ClusterProvider, ClusterSnapshot, HealthSignal};
use crate::config::{Environment, RolloutSettings};
use crate::error::{PlanError, Result, RolloutError, RollwardenError, StateError};
use crate::manifest::{ManifestSet, ResourceId, is_managed_by};
use crate::planner::{self, Action, ActionType, Plan, inverse_of, normalize};
use crate::secrets::{SecretStore, is_redacted};
use crate::state::{
    HistoryStore, LOCK_EXPIRY_SECS, LockInfo, RecordKind, ResultState, RolloutRecord, generate_holder_id,
};

/// What a rollback restores.
#[derive(Debug, Clone)]
enum RestoreTarget {
    /// The manifest of an earlier successful record, re-planned against a
    /// fresh snapshot.
    Manifest {
        record_id: String,
        manifest: ManifestSet,
    },
    /// The inverse of the actions applied so far.
    Inverse,
}

/// Drives plans through `Planned → Applying → Monitoring → …`.
#[derive(Clone)]
pub struct RolloutController {
    cluster: Arc<dyn ClusterProvider>,
    health: Arc<dyn HealthSignal>,
    history: Arc<dyn HistoryStore>,
    secrets: Arc<SecretStore>,
    locks: EnvironmentLocks,
    settings: RolloutSettings,
    holder: String,
}

impl std::fmt::Debug for RolloutController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RolloutController")
            .field("cluster", &self.cluster.provider_name())
            .field("history", &self.history.backend_type())
            .field("settings", &self.settings)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl RolloutController {
    /// Creates a controller.
    #[must_use]
    pub fn new(
        cluster: Arc<dyn ClusterProvider>,
        health: Arc<dyn HealthSignal>,
        history: Arc<dyn HistoryStore>,
        secrets: Arc<SecretStore>,
        settings: RolloutSettings,
    ) -> Self {
        Self {
            cluster,
            health,
            history,
            secrets,
            locks: EnvironmentLocks::new(),
            settings,
            holder: generate_holder_id(),
        }
    }

    /// Sets the holder recorded in store locks.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Shares an in-process lock registry with other controllers.
    #[must_use]
    pub fn with_locks(mut self, locks: EnvironmentLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Timing and retry settings.
    #[must_use]
    pub const fn settings(&self) -> &RolloutSettings {
        &self.settings
    }

    /// The in-process lock registry.
    #[must_use]
    pub const fn locks(&self) -> &EnvironmentLocks {
        &self.locks
    }

    /// Starts rolling out `plan`, whose target is `manifest`.
    ///
    /// The state machine runs on the runtime whether or not the returned
    /// handle is awaited.
    ///
    /// # Errors
    ///
    /// - [`RolloutError::RolloutInProgress`] if the environment is locked
    /// - [`RolloutError::Unreconciled`] if the head record is still in progress
    /// - [`PlanError::SnapshotStale`] if history moved since the plan's snapshot
    /// - [`PlanError::EnvironmentMismatch`] if plan and manifest disagree
    pub async fn start(&self, plan: Plan, manifest: ManifestSet) -> Result<RolloutHandle> {
        if plan.environment != manifest.environment() {
            return Err(PlanError::EnvironmentMismatch {
                target: manifest.environment(),
                observed: plan.environment,
            }
            .into());
        }
        self.launch(plan, manifest, RecordKind::Deploy).await
    }

    /// Starts a rollout and waits for it to finish.
    ///
    /// # Errors
    ///
    /// See [`Self::start`] and [`RolloutHandle::wait`].
    pub async fn apply(&self, plan: Plan, manifest: ManifestSet) -> Result<RolloutOutcome> {
        self.start(plan, manifest).await?.wait().await
    }

    /// Rolls back the head record of an environment.
    ///
    /// Targets the last successful record before the head, or the inverse of
    /// the head's actions when there is none. The rollback gets its own
    /// record and runs through the same state machine.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::NoRollbackTarget`] if there is nothing to roll
    /// back to, and the errors of [`Self::start`].
    pub async fn rollback(&self, environment: Environment) -> Result<RolloutHandle> {
        let head = self
            .history
            .head(environment)
            .await?
            .ok_or_else(|| PlanError::NoRollbackTarget {
                environment,
                reason: String::from("no rollouts recorded"),
            })?;
        if head.result_state == ResultState::InProgress {
            return Err(RolloutError::Unreconciled {
                environment,
                record_id: head.id,
            }
            .into());
        }

        let snapshot = self.cluster.fetch_snapshot(environment).await?;
        let (plan, manifest) = match self.history.last_succeeded(environment, Some(&head.id)).await? {
            Some(previous) => {
                info!(
                    "Rolling {environment} back to record {} ({})",
                    previous.short_id(),
                    previous.manifest.short_digest()
                );
                let plan = planner::plan(&previous.manifest, &snapshot, Some(&head))?;
                (plan, previous.manifest)
            }
            None if head.result_state == ResultState::Succeeded => {
                info!("Rolling {environment} back by inverting record {}", head.short_id());
                let actions = inverse_of(&head.actions);
                let manifest = project(&snapshot, &actions)?;
                let plan = Plan::new(environment, manifest.digest(), snapshot.captured_at, actions);
                (plan, manifest)
            }
            None => {
                return Err(PlanError::NoRollbackTarget {
                    environment,
                    reason: format!(
                        "record {} is {} and no earlier rollout succeeded",
                        head.short_id(),
                        head.result_state
                    ),
                }
                .into());
            }
        };

        self.launch(plan, manifest, RecordKind::Rollback { of: head.id }).await
    }

    /// Reconciles an interrupted rollout.
    ///
    /// Returns `None` when the head record is not in progress. Otherwise the
    /// cluster is compared with the record's manifest: if it already matches,
    /// monitoring resumes with a fresh timeout; if not, a rollback is forced.
    /// The orphaned record is finalized with the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`RolloutError::RolloutInProgress`] if the interrupted
    /// rollout is in fact still running somewhere, or cluster and history
    /// errors.
    pub async fn recover(&self, environment: Environment) -> Result<Option<RolloutOutcome>> {
        let Some(head) = self.history.head(environment).await? else {
            return Ok(None);
        };
        if head.result_state.is_terminal() {
            debug!("Head record of {environment} is {}; nothing to recover", head.result_state);
            return Ok(None);
        }

        let (guard, lock) = self.claim(environment).await?;
        let prepared = async {
            let restore = self.restore_target(environment, Some(&head.id)).await?;
            let snapshot = self.cluster.fetch_snapshot(environment).await?;
            let drift = planner::plan(&head.manifest, &snapshot, None)?;
            Ok::<_, RollwardenError>((restore, drift.is_empty()))
        }
        .await;
        let (restore, converged) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.release(&lock).await;
                return Err(e);
            }
        };

        info!(
            "Recovering {environment} record {}: cluster {}",
            head.short_id(),
            if converged { "matches the record" } else { "diverges from the record" }
        );
        let (state, _) = watch::channel(RolloutState::Planned);
        let (_cancel, cancel_rx) = watch::channel(false);
        let run = Run {
            controller: self.clone(),
            environment,
            record_id: head.id,
            actions: head.actions,
            restore,
            lock,
            state,
            cancel: cancel_rx,
            _guard: guard,
        };
        Ok(Some(run.resume(converged).await))
    }

    async fn launch(&self, plan: Plan, manifest: ManifestSet, kind: RecordKind) -> Result<RolloutHandle> {
        let environment = plan.environment;
        let (guard, lock) = self.claim(environment).await?;

        let (record, restore) = match self.begin(&plan, manifest, kind).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.release(&lock).await;
                return Err(e);
            }
        };

        let (state, state_rx) = watch::channel(RolloutState::Planned);
        let (cancel, cancel_rx) = watch::channel(false);
        let run = Run {
            controller: self.clone(),
            environment,
            record_id: record.id.clone(),
            actions: plan.actions,
            restore,
            lock,
            state,
            cancel: cancel_rx,
            _guard: guard,
        };
        let task = tokio::spawn(run.execute());
        Ok(RolloutHandle::new(environment, record.id, state_rx, cancel, task))
    }

    /// Checks history and appends the in-progress record.
    async fn begin(
        &self,
        plan: &Plan,
        manifest: ManifestSet,
        kind: RecordKind,
    ) -> Result<(RolloutRecord, RestoreTarget)> {
        let environment = plan.environment;
        let head = self.history.head(environment).await?;

        if let Some(head) = &head {
            if head.result_state == ResultState::InProgress {
                return Err(RolloutError::Unreconciled {
                    environment,
                    record_id: head.id.clone(),
                }
                .into());
            }
            let recorded_at = head.last_activity();
            if plan.snapshot_captured_at < recorded_at {
                return Err(PlanError::SnapshotStale {
                    environment,
                    captured_at: plan.snapshot_captured_at.to_rfc3339(),
                    record_id: head.id.clone(),
                    recorded_at: recorded_at.to_rfc3339(),
                }
                .into());
            }
        }

        let restore = match kind {
            RecordKind::Deploy => self.restore_target(environment, None).await?,
            RecordKind::Rollback { .. } => RestoreTarget::Inverse,
        };

        let record = RolloutRecord::begin(
            environment,
            plan.id.clone(),
            kind,
            head.map(|h| h.id),
            manifest,
            plan.redacted().actions,
        );
        self.history.append(&record).await?;
        Ok((record, restore))
    }

    async fn restore_target(&self, environment: Environment, before: Option<&str>) -> Result<RestoreTarget> {
        Ok(match self.history.last_succeeded(environment, before).await? {
            Some(previous) => RestoreTarget::Manifest {
                record_id: previous.id,
                manifest: previous.manifest,
            },
            None => RestoreTarget::Inverse,
        })
    }

    /// Takes the in-process claim, then the store lock.
    async fn claim(&self, environment: Environment) -> Result<(EnvironmentGuard, LockInfo)> {
        let guard = self
            .locks
            .try_acquire(environment)
            .ok_or_else(|| RolloutError::RolloutInProgress {
                environment,
                holder: self.holder.clone(),
            })?;

        match self.history.acquire_lock(environment, &self.holder).await {
            Ok(lock) => Ok((guard, lock)),
            Err(RollwardenError::State(StateError::LockedByOther { holder, .. })) => {
                Err(RolloutError::RolloutInProgress { environment, holder }.into())
            }
            Err(e) => Err(e),
        }
    }

    async fn release(&self, lock: &LockInfo) {
        if let Err(e) = self.history.release_lock(lock.environment, &lock.lock_id).await {
            warn!("Failed to release {} lock {}: {e}", lock.environment, lock.lock_id);
        }
    }
}

/// Projects the managed state of a snapshot through `actions`.
fn project(snapshot: &ClusterSnapshot, actions: &[Action]) -> Result<ManifestSet> {
    let environment = snapshot.environment;
    let mut documents: BTreeMap<ResourceId, Value> = snapshot
        .resources
        .iter()
        .filter(|(_, doc)| is_managed_by(doc, environment))
        .map(|(id, doc)| (id.clone(), normalize(doc)))
        .collect();

    for action in actions {
        match (&action.action_type, &action.after) {
            (ActionType::Delete, _) => {
                documents.remove(&action.id);
            }
            (_, Some(after)) => {
                documents.insert(action.id.clone(), after.clone());
            }
            (_, None) => {}
        }
    }

    ManifestSet::from_documents(environment, documents.into_values()).map_err(RollwardenError::internal)
}

/// One rollout in flight.
struct Run {
    controller: RolloutController,
    environment: Environment,
    record_id: String,
    actions: Vec<Action>,
    restore: RestoreTarget,
    lock: LockInfo,
    state: watch::Sender<RolloutState>,
    cancel: watch::Receiver<bool>,
    _guard: EnvironmentGuard,
}

impl Run {
    async fn execute(mut self) -> RolloutOutcome {
        let heartbeat = self.spawn_heartbeat();
        let outcome = self.drive().await;
        heartbeat.abort();
        self.finish(outcome).await
    }

    async fn resume(mut self, converged: bool) -> RolloutOutcome {
        let heartbeat = self.spawn_heartbeat();
        let actions = std::mem::take(&mut self.actions);
        let outcome = if converged {
            self.monitor(&actions, &actions).await
        } else {
            self.roll_back(&actions, String::from("Interrupted rollout left the cluster diverged"))
                .await
        };
        heartbeat.abort();
        self.finish(outcome).await
    }

    async fn drive(&mut self) -> RolloutOutcome {
        let actions = std::mem::take(&mut self.actions);
        info!(
            "Applying {} action(s) to {} (record {})",
            actions.len(),
            self.environment,
            self.record_id
        );
        self.transition(RolloutState::Applying);

        let mut applied = Vec::with_capacity(actions.len());
        match self.apply_actions(&actions, &mut applied, true).await {
            Ok(()) => self.monitor(&actions, &applied).await,
            Err(reason) => self.roll_back(&applied, reason).await,
        }
    }

    async fn monitor(&mut self, actions: &[Action], applied: &[Action]) -> RolloutOutcome {
        self.transition(RolloutState::Monitoring);
        let targets = WorkloadTarget::from_actions(actions);
        let timeout = self.controller.settings.workload_timeout;
        let monitor = self.health_monitor();

        let verdict = monitor.watch(&targets, timeout, &mut self.cancel).await;
        match verdict.reason() {
            None => self.outcome(RolloutState::Succeeded, applied.len(), None),
            Some(reason) => self.roll_back(applied, reason).await,
        }
    }

    async fn roll_back(&mut self, applied: &[Action], reason: String) -> RolloutOutcome {
        warn!("Rolling back {} record {}: {reason}", self.environment, self.record_id);
        self.transition(RolloutState::RollingBack);

        let actions = match self.rollback_actions(applied).await {
            Ok(actions) => actions,
            Err(e) => {
                return self.outcome(
                    RolloutState::Failed,
                    applied.len(),
                    Some(format!("{reason}; rollback could not be planned: {e}")),
                );
            }
        };

        let mut restored = Vec::with_capacity(actions.len());
        if let Err(e) = self.apply_actions(&actions, &mut restored, false).await {
            return self.outcome(
                RolloutState::Failed,
                applied.len(),
                Some(format!("{reason}; rollback failed: {e}")),
            );
        }

        // A rollback is not cancellable.
        let (_keep, mut never) = watch::channel(false);
        let targets = WorkloadTarget::from_actions(&actions);
        let timeout = self.controller.settings.rollback_timeout;
        match self.health_monitor().watch(&targets, timeout, &mut never).await.reason() {
            None => self.outcome(RolloutState::Settled, applied.len(), Some(reason)),
            Some(unhealthy) => self.outcome(
                RolloutState::Failed,
                applied.len(),
                Some(format!("{reason}; rollback did not stabilize: {unhealthy}")),
            ),
        }
    }

    async fn rollback_actions(&self, applied: &[Action]) -> Result<Vec<Action>> {
        match &self.restore {
            RestoreTarget::Manifest { record_id, manifest } => {
                info!("Restoring {} to record {record_id}", self.environment);
                let snapshot = self.controller.cluster.fetch_snapshot(self.environment).await?;
                Ok(planner::plan(manifest, &snapshot, None)?.actions)
            }
            RestoreTarget::Inverse => {
                info!("Reverting {} applied action(s) in {}", applied.len(), self.environment);
                Ok(inverse_of(applied))
            }
        }
    }

    /// Applies actions in order, pushing each success onto `applied`.
    async fn apply_actions(
        &self,
        actions: &[Action],
        applied: &mut Vec<Action>,
        cancellable: bool,
    ) -> std::result::Result<(), String> {
        let policy = RetryPolicy::from_settings(&self.controller.settings);

        for action in actions {
            if cancellable && is_cancelled(&self.cancel) {
                return Err(String::from("Rollout cancelled by operator"));
            }
            if action.after.as_ref().is_some_and(is_redacted) {
                warn!("Skipping {action}: the previous Secret value was never recorded");
                continue;
            }

            let prepared = self.materialize(action).await?;
            let description = action.to_string();
            let run = &*self;
            let prepared = &prepared;
            policy
                .run(&description, move || run.write(prepared))
                .await
                .map_err(|e| e.to_string())?;
            debug!("Applied {action}");
            applied.push(action.clone());
        }
        Ok(())
    }

    async fn materialize(&self, action: &Action) -> std::result::Result<Action, String> {
        match &action.after {
            Some(document) if action.id.kind == "Secret" => {
                let after = self
                    .controller
                    .secrets
                    .materialize(self.environment, document)
                    .await
                    .map_err(|e| format!("Failed to materialize {}: {e}", action.id))?;
                Ok(Action {
                    after: Some(after),
                    ..action.clone()
                })
            }
            _ => Ok(action.clone()),
        }
    }

    async fn write(&self, action: &Action) -> std::result::Result<(), crate::error::ClusterError> {
        let cluster = &self.controller.cluster;
        match action.action_type {
            ActionType::Delete => cluster.delete_action(self.environment, action).await,
            ActionType::Create | ActionType::Update => cluster.apply_action(self.environment, action).await,
        }
    }

    fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(
            Arc::clone(&self.controller.health),
            self.environment,
            &self.controller.settings,
        )
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let history = Arc::clone(&self.controller.history);
        let mut lock = self.lock.clone();
        let every = Duration::from_secs(LOCK_EXPIRY_SECS.unsigned_abs() / 3);

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                match history.refresh_lock(&lock).await {
                    Ok(refreshed) => lock = refreshed,
                    Err(e) => warn!("Failed to refresh {} lock: {e}", lock.environment),
                }
            }
        })
    }

    fn transition(&self, state: RolloutState) {
        debug!("{} record {} -> {state}", self.environment, self.record_id);
        self.state.send_replace(state);
    }

    fn outcome(&self, state: RolloutState, applied: usize, error: Option<String>) -> RolloutOutcome {
        RolloutOutcome {
            environment: self.environment,
            record_id: self.record_id.clone(),
            state,
            applied,
            error,
        }
    }

    async fn finish(self, outcome: RolloutOutcome) -> RolloutOutcome {
        if let Some(result) = outcome.state.result_state()
            && let Err(e) = self
                .controller
                .history
                .finalize(self.environment, &self.record_id, result, outcome.error.clone())
                .await
        {
            error!(
                "Failed to finalize {} record {}: {e}",
                self.environment, self.record_id
            );
        }
        self.controller.release(&self.lock).await;
        self.transition(outcome.state);

        match outcome.state {
            RolloutState::Succeeded => info!("Rollout {} succeeded in {}", self.record_id, self.environment),
            RolloutState::Settled => warn!(
                "Rollout {} rolled back in {}: {}",
                self.record_id,
                self.environment,
                outcome.error.as_deref().unwrap_or_default()
            ),
            _ => error!(
                "Rollout {} failed in {}: {}",
                self.record_id,
                self.environment,
                outcome.error.as_deref().unwrap_or_default()
            ),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{InMemoryCluster, InjectedFailure};
    use crate::manifest::SECRET_REFS_ANNOTATION;
    use crate::secrets::{MemorySecretBackend, SealingKey, generate_key};
    use crate::state::MemoryHistoryStore;
    use base64::{Engine, prelude::BASE64_STANDARD};
    use secrecy::SecretString;
    use serde_json::json;

    const ENV: Environment = Environment::Dev;

    struct Fixture {
        cluster: Arc<InMemoryCluster>,
        history: Arc<MemoryHistoryStore>,
        secrets: Arc<SecretStore>,
        controller: RolloutController,
    }

    fn fixture() -> Fixture {
        let cluster = Arc::new(InMemoryCluster::new());
        let history = Arc::new(MemoryHistoryStore::new());
        let key = SealingKey::from_base64("test", &generate_key().unwrap()).unwrap();
        let secrets = Arc::new(SecretStore::new(Arc::new(MemorySecretBackend::new()), key));
        let settings = RolloutSettings {
            poll_interval: Duration::from_secs(10),
            stability_polls: 3,
            workload_timeout: Duration::from_secs(120),
            rollback_timeout: Duration::from_secs(60),
            retry_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_factor: 2,
        };
        let controller = RolloutController::new(
            cluster.clone(),
            cluster.clone(),
            history.clone(),
            secrets.clone(),
            settings,
        )
        .with_holder("test");
        Fixture {
            cluster,
            history,
            secrets,
            controller,
        }
    }

    fn labels() -> Value {
        json!({"app.kubernetes.io/managed-by": "rollwarden", "rollwarden.io/environment": "dev"})
    }

    fn config_map(data: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "app", "namespace": "app-dev", "labels": labels()},
            "data": {"MODE": data}
        })
    }

    fn deployment(image: &str) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "app-dev", "labels": labels()},
            "spec": {"replicas": 2, "template": {"spec": {"containers": [{"name": "web", "image": image}]}}}
        })
    }

    fn web() -> ResourceId {
        ResourceId::new("Deployment", "app-dev", "web")
    }

    fn manifest(docs: Vec<Value>) -> ManifestSet {
        ManifestSet::from_documents(ENV, docs).unwrap()
    }

    impl Fixture {
        async fn plan(&self, target: &ManifestSet) -> Plan {
            let snapshot = self.cluster.fetch_snapshot(ENV).await.unwrap();
            let head = self.history.head(ENV).await.unwrap();
            planner::plan(target, &snapshot, head.as_ref()).unwrap()
        }

        async fn deploy(&self, target: &ManifestSet) -> Result<RolloutOutcome> {
            let plan = self.plan(target).await;
            self.controller.apply(plan, target.clone()).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dev_rollout_succeeds() {
        let f = fixture();
        let target = manifest(vec![config_map("a"), deployment("web:1")]);

        let outcome = f.deploy(&target).await.unwrap();
        assert_eq!(outcome.state, RolloutState::Succeeded);
        assert_eq!(outcome.applied, 2);

        let head = f.history.head(ENV).await.unwrap().unwrap();
        assert_eq!(head.id, outcome.record_id);
        assert_eq!(head.result_state, ResultState::Succeeded);
        assert_eq!(head.manifest_digest, target.digest());
        assert!(!f.history.is_locked(ENV).await.unwrap());
        assert!(!f.controller.locks().is_held(ENV));

        // converged: nothing left to do
        assert!(f.plan(&target).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_regression_rolls_back_to_last_success() {
        let f = fixture();
        let v1 = manifest(vec![config_map("a"), deployment("web:1")]);
        let first = f.deploy(&v1).await.unwrap();

        let v2 = manifest(vec![config_map("b"), deployment("web:2")]);
        f.cluster.set_ready(ENV, &web(), [2, 1, 2]);
        let outcome = f.deploy(&v2).await.unwrap();

        assert_eq!(outcome.state, RolloutState::Settled);
        assert!(outcome.error.as_deref().unwrap().contains("regressed"));

        let head = f.history.head(ENV).await.unwrap().unwrap();
        assert_eq!(head.result_state, ResultState::RolledBack);
        assert_eq!(head.previous_record_id.as_deref(), Some(first.record_id.as_str()));
        assert!(f.plan(&v1).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_failure_rolls_back() {
        let f = fixture();
        let v1 = manifest(vec![config_map("a"), deployment("web:1")]);
        f.deploy(&v1).await.unwrap();

        let v2 = manifest(vec![config_map("b"), deployment("web:2")]);
        f.cluster.fail_writes(ENV, &web(), InjectedFailure::Permanent);
        let outcome = f.deploy(&v2).await.unwrap();

        assert_eq!(outcome.state, RolloutState::Settled);
        assert_eq!(outcome.applied, 1);
        f.cluster.clear_failure(ENV, &web());
        assert!(f.plan(&v1).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let f = fixture();
        f.cluster
            .fail_writes(ENV, &web(), InjectedFailure::Transient { remaining: 2 });

        let outcome = f.deploy(&manifest(vec![deployment("web:1")])).await.unwrap();
        assert_eq!(outcome.state, RolloutState::Succeeded);
        let attempts = f.cluster.operations().iter().filter(|op| op.id == web()).count();
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unstable_rollback_fails() {
        let f = fixture();
        f.deploy(&manifest(vec![deployment("web:1")])).await.unwrap();

        f.cluster.set_ready(ENV, &web(), [2, 1, 0]);
        let err = f.deploy(&manifest(vec![deployment("web:2")])).await.unwrap_err();
        assert!(matches!(
            err,
            RollwardenError::Rollout(RolloutError::RollbackFailed { .. })
        ));

        let head = f.history.head(ENV).await.unwrap().unwrap();
        assert_eq!(head.result_state, ResultState::Failed);
        assert!(head.error.unwrap().contains("did not stabilize"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_monitoring_reverts_first_rollout() {
        let f = fixture();
        f.cluster.set_ready(ENV, &web(), [0]);
        let target = manifest(vec![deployment("web:1")]);
        let handle = f.controller.start(f.plan(&target).await, target).await.unwrap();

        let mut states = handle.subscribe();
        states.wait_for(|s| *s == RolloutState::Monitoring).await.unwrap();
        handle.cancel();

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.state, RolloutState::Settled);
        assert_eq!(outcome.error.as_deref(), Some("Rollout cancelled by operator"));
        assert!(f.cluster.get(ENV, &web()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_ready_rolls_back_after_timeout() {
        let cluster = Arc::new(InMemoryCluster::without_auto_ready());
        let history = Arc::new(MemoryHistoryStore::new());
        let key = SealingKey::from_base64("test", &generate_key().unwrap()).unwrap();
        let secrets = Arc::new(SecretStore::new(Arc::new(MemorySecretBackend::new()), key));
        let settings = RolloutSettings::default();
        assert_eq!(settings.poll_interval, Duration::from_secs(10));
        assert_eq!(settings.stability_polls, 3);
        assert_eq!(settings.workload_timeout, Duration::from_secs(300));
        let controller = RolloutController::new(
            cluster.clone(),
            cluster.clone(),
            history.clone(),
            secrets,
            settings,
        );

        let target = manifest(vec![deployment("web:1")]);
        let snapshot = cluster.fetch_snapshot(ENV).await.unwrap();
        let plan = planner::plan(&target, &snapshot, None).unwrap();

        let started = tokio::time::Instant::now();
        let outcome = controller.apply(plan, target).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(300));
        assert_eq!(outcome.state, RolloutState::Settled);
        assert!(outcome.error.as_deref().unwrap().contains("not healthy within 300s"));
        assert!(cluster.resource_ids(ENV).is_empty());

        let head = history.head(ENV).await.unwrap().unwrap();
        assert_eq!(head.result_state, ResultState::RolledBack);
        assert_eq!(head.id, outcome.record_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_rollout_is_rejected() {
        let f = fixture();
        f.cluster.set_ready(ENV, &web(), [0]);
        let target = manifest(vec![deployment("web:1")]);
        let handle = f.controller.start(f.plan(&target).await, target.clone()).await.unwrap();

        let plan = f.plan(&target).await;
        let err = f.controller.start(plan, target).await.unwrap_err();
        assert!(matches!(
            err,
            RollwardenError::Rollout(RolloutError::RolloutInProgress { .. })
        ));

        // other environments are unaffected
        let stage = ManifestSet::empty(Environment::Stage);
        let snapshot = f.cluster.fetch_snapshot(Environment::Stage).await.unwrap();
        let plan = planner::plan(&stage, &snapshot, None).unwrap();
        let outcome = f.controller.apply(plan, stage).await.unwrap();
        assert_eq!(outcome.state, RolloutState::Succeeded);

        handle.cancel();
        handle.wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_lock_held_elsewhere() {
        let f = fixture();
        f.history.acquire_lock(ENV, "other-host").await.unwrap();

        let target = manifest(vec![config_map("a")]);
        let err = f.deploy(&target).await.unwrap_err();
        match err {
            RollwardenError::Rollout(RolloutError::RolloutInProgress { holder, .. }) => {
                assert_eq!(holder, "other-host");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!f.controller.locks().is_held(ENV));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreconciled_head_blocks_apply() {
        let f = fixture();
        let target = manifest(vec![config_map("a")]);
        let orphan = RolloutRecord::begin(ENV, "plan", RecordKind::Deploy, None, target.clone(), Vec::new());
        f.history.append(&orphan).await.unwrap();

        let err = f.deploy(&target).await.unwrap_err();
        assert!(matches!(
            err,
            RollwardenError::Rollout(RolloutError::Unreconciled { .. })
        ));
        assert!(!f.history.is_locked(ENV).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_plan_is_rejected() {
        let f = fixture();
        let target = manifest(vec![config_map("a")]);
        let stale = f.plan(&target).await;
        std::thread::sleep(std::time::Duration::from_millis(5));
        f.deploy(&manifest(vec![config_map("b")])).await.unwrap();

        let err = f.controller.apply(stale, target).await.unwrap_err();
        assert!(matches!(err, RollwardenError::Plan(PlanError::SnapshotStale { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_secrets_are_materialized_for_the_cluster_only() {
        let f = fixture();
        f.secrets
            .put(ENV, "DB_PASSWORD", SecretString::from("hunter2"))
            .await
            .unwrap();
        let rendered = manifest(vec![json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "db", "namespace": "app-dev", "labels": labels()},
            "data": {"password": "${secret:DB_PASSWORD}"}
        })]);
        let target = f.secrets.inject(&rendered).await.unwrap();

        f.deploy(&target).await.unwrap();

        let live = f.cluster.get(ENV, &ResourceId::new("Secret", "app-dev", "db")).unwrap();
        assert_eq!(live["data"]["password"], BASE64_STANDARD.encode("hunter2"));
        assert!(live.pointer("/metadata/annotations").unwrap().get(SECRET_REFS_ANNOTATION).is_some());

        let head = f.history.head(ENV).await.unwrap().unwrap();
        let stored = serde_json::to_string(&head).unwrap();
        assert!(!stored.contains("hunter2"));
        assert!(stored.contains("secret://DB_PASSWORD#v1"));
        assert!(f.plan(&target).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_rollback_restores_previous_success() {
        let f = fixture();
        let v1 = manifest(vec![config_map("a"), deployment("web:1")]);
        f.deploy(&v1).await.unwrap();
        let v2 = manifest(vec![config_map("b"), deployment("web:2")]);
        let second = f.deploy(&v2).await.unwrap();

        let outcome = f.controller.rollback(ENV).await.unwrap().wait().await.unwrap();
        assert_eq!(outcome.state, RolloutState::Succeeded);

        let head = f.history.head(ENV).await.unwrap().unwrap();
        assert_eq!(head.kind, RecordKind::Rollback { of: second.record_id });
        assert_eq!(head.manifest_digest, v1.digest());
        assert!(f.plan(&v1).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_rollback_of_first_rollout_inverts_it() {
        let f = fixture();
        let v1 = manifest(vec![config_map("a"), deployment("web:1")]);
        f.deploy(&v1).await.unwrap();

        let outcome = f.controller.rollback(ENV).await.unwrap().wait().await.unwrap();
        assert_eq!(outcome.state, RolloutState::Succeeded);
        assert!(f.cluster.resource_ids(ENV).is_empty());

        let head = f.history.head(ENV).await.unwrap().unwrap();
        assert!(head.manifest.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_without_history() {
        let f = fixture();
        let err = f.controller.rollback(ENV).await.unwrap_err();
        assert!(matches!(err, RollwardenError::Plan(PlanError::NoRollbackTarget { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_resumes_when_cluster_matches() {
        let f = fixture();
        let target = manifest(vec![config_map("a"), deployment("web:1")]);
        let plan = f.plan(&target).await;
        for action in &plan.actions {
            f.cluster.apply_action(ENV, action).await.unwrap();
        }
        let orphan = RolloutRecord::begin(ENV, plan.id.clone(), RecordKind::Deploy, None, target, plan.actions);
        f.history.append(&orphan).await.unwrap();

        let outcome = f.controller.recover(ENV).await.unwrap().unwrap();
        assert_eq!(outcome.state, RolloutState::Succeeded);
        assert_eq!(outcome.record_id, orphan.id);
        let head = f.history.head(ENV).await.unwrap().unwrap();
        assert_eq!(head.result_state, ResultState::Succeeded);

        assert!(f.controller.recover(ENV).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_rolls_back_diverged_cluster() {
        let f = fixture();
        let target = manifest(vec![config_map("a"), deployment("web:1")]);
        let plan = f.plan(&target).await;
        // crash after the first action
        f.cluster.apply_action(ENV, &plan.actions[0]).await.unwrap();
        let orphan = RolloutRecord::begin(ENV, plan.id.clone(), RecordKind::Deploy, None, target, plan.actions);
        f.history.append(&orphan).await.unwrap();

        let outcome = f.controller.recover(ENV).await.unwrap().unwrap();
        assert_eq!(outcome.state, RolloutState::Settled);
        assert!(f.cluster.resource_ids(ENV).is_empty());
        let head = f.history.head(ENV).await.unwrap().unwrap();
        assert_eq!(head.result_state, ResultState::RolledBack);
    }
}
