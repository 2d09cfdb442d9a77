//! Orchestration of rollouts from configuration to history.
//!
//! The [`Orchestrator`] owns the wiring between the configuration, the
//! manifest renderer, the secret store, the cluster boundary, the planner,
//! the rollout controller and the history store. Every CLI command goes
//! through it.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterProvider, HealthSignal, InMemoryCluster};
use crate::config::{
    ConfigParser, ConfigValidator, Environment, Environments, RolloutSettings, RollwardenConfig,
    StateBackend, ValidationResult, find_config_file,
};
use crate::error::{ConfigError, Result, SecretError};
use crate::kubectl::KubectlCluster;
use crate::manifest::{ManifestRenderer, ManifestSet, is_managed_by};
use crate::planner::{self, DiffEngine, DiffResult, Plan};
use crate::rollout::{EnvironmentLocks, RolloutController, RolloutHandle, RolloutOutcome};
use crate::secrets::{
    LocalSecretBackend, MemorySecretBackend, RevealAcknowledgement, SealingKey, SecretStore,
    SecretSummary, SecretValidation, ValidationPolicy, generate_key, referenced_keys,
};
use crate::state::{
    HistoryStore, LocalHistoryStore, LockInfo, MemoryHistoryStore, RecordKind, ResultState, RolloutRecord,
    S3HistoryStore, STATE_DIR, write_atomic,
};

/// A configuration file, loaded and validated.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Path of the configuration file.
    pub path: PathBuf,
    /// Directory relative paths resolve against.
    pub root: PathBuf,
    /// The parsed configuration.
    pub config: RollwardenConfig,
    /// Non-fatal findings.
    pub warnings: Vec<String>,
}

/// Finds, parses and validates the configuration.
///
/// `.env` next to the configuration file is loaded first so that
/// `ROLLWARDEN_*` overrides and the sealing key can live there.
///
/// # Errors
///
/// Returns an error if no configuration is found or it fails validation.
pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig> {
    let path = path.map_or_else(|| find_config_file("."), |p| Ok(p.to_path_buf()))?;
    let root = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    debug!("Loading configuration from: {}", path.display());

    let parser = ConfigParser::new().with_base_path(root.clone());
    parser.load_dotenv()?;
    let config = parser.load_with_env(&path)?;
    let ValidationResult { warnings, .. } = ConfigValidator::new().validate(&config)?;

    Ok(LoadedConfig {
        path,
        root,
        config,
        warnings,
    })
}

/// Default location of a project's sealing key file.
#[must_use]
pub fn default_key_file(project: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("rollwarden").join(format!("{project}.key")))
}

/// Writes a base64 sealing key to `path`, readable by the owner only.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub async fn write_key_file(path: &Path, key: &SecretString) -> Result<()> {
    use secrecy::ExposeSecret;

    write_atomic(path, key.expose_secret().as_bytes()).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    info!("Wrote sealing key to {}", path.display());
    Ok(())
}

fn resolve(root: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() { path.to_path_buf() } else { root.join(path) }
}

/// Options that change what the orchestrator talks to.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrchestratorOptions {
    /// Use an in-memory cluster and history instead of the real ones.
    pub simulate: bool,
}

/// A plan together with the manifest it was computed for.
#[derive(Debug, Clone)]
pub struct PlannedRollout {
    /// Target manifest with pinned secret references.
    pub manifest: ManifestSet,
    /// Ordered actions.
    pub plan: Plan,
    /// Secret validation of the referenced keys.
    pub validation: SecretValidation,
}

/// Display form of a history record.
#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary {
    /// Record id.
    pub id: String,
    /// Deploy or rollback.
    pub kind: RecordKind,
    /// Result state.
    pub result_state: ResultState,
    /// When applying started.
    pub applied_at: DateTime<Utc>,
    /// When the record was finalized.
    pub completed_at: Option<DateTime<Utc>>,
    /// Digest of the target manifest.
    pub manifest_digest: String,
    /// Number of planned actions.
    pub actions: usize,
    /// Failure description.
    pub error: Option<String>,
}

impl From<&RolloutRecord> for RecordSummary {
    fn from(record: &RolloutRecord) -> Self {
        Self {
            id: record.id.clone(),
            kind: record.kind.clone(),
            result_state: record.result_state,
            applied_at: record.applied_at,
            completed_at: record.completed_at,
            manifest_digest: record.manifest_digest.clone(),
            actions: record.actions.len(),
            error: record.error.clone(),
        }
    }
}

/// What `status` reports for one environment.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentStatus {
    /// Environment.
    pub environment: Environment,
    /// Target namespace.
    pub namespace: String,
    /// Kube context, if pinned.
    pub context: Option<String>,
    /// Observed resources managed by this tool.
    pub managed_resources: usize,
    /// Latest history record.
    pub head: Option<RecordSummary>,
    /// Active store lock.
    pub lock: Option<LockInfo>,
    /// Differences between the last successful manifest and the cluster.
    pub drift: Option<DiffResult>,
}

impl EnvironmentStatus {
    /// Returns true if the cluster matches the last successful rollout.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.drift.as_ref().is_none_or(|d| !d.has_changes())
    }
}

/// Binds configuration, cluster, secrets and history for the CLI.
pub struct Orchestrator {
    config: RollwardenConfig,
    environments: Environments,
    renderer: ManifestRenderer,
    cluster: Arc<dyn ClusterProvider>,
    health: Arc<dyn HealthSignal>,
    history: Arc<dyn HistoryStore>,
    secrets: Arc<SecretStore>,
    /// Why the sealed store is unavailable, if it is.
    key_error: Option<String>,
    locks: EnvironmentLocks,
    settings: RolloutSettings,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("project", &self.config.project.name)
            .field("cluster", &self.cluster.provider_name())
            .field("history", &self.history.backend_type())
            .field("secrets", &self.secrets.backend_type())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Builds the orchestrator from a loaded configuration.
    ///
    /// When no sealing key can be resolved, commands that do not read
    /// sealed secrets keep working; the others fail with the key error.
    ///
    /// # Errors
    ///
    /// Returns an error if the history backend cannot be initialized.
    pub async fn open(loaded: LoadedConfig, options: OrchestratorOptions) -> Result<Self> {
        let LoadedConfig { root, config, .. } = loaded;
        let environments = Environments::from_config(&config.environments);

        let (cluster, health, history): (Arc<dyn ClusterProvider>, Arc<dyn HealthSignal>, Arc<dyn HistoryStore>) =
            if options.simulate {
                info!("Simulating against an in-memory cluster and history");
                let cluster = Arc::new(InMemoryCluster::new());
                (cluster.clone(), cluster, Arc::new(MemoryHistoryStore::new()))
            } else {
                let cluster = Arc::new(KubectlCluster::new(&config.cluster, environments.clone()));
                (cluster.clone(), cluster, Self::history_store(&config, &root).await?)
            };

        let key_file = config
            .secrets
            .key_file
            .as_deref()
            .map(|p| resolve(&root, p))
            .or_else(|| default_key_file(&config.project.name).filter(|p| p.is_file()));

        let (secrets, key_error) =
            match SealingKey::resolve(&config.secrets.key_id, &config.secrets.key_env, key_file.as_deref()) {
                Ok(key) => {
                    let backend = LocalSecretBackend::new(resolve(&root, &config.secrets.path));
                    (SecretStore::new(Arc::new(backend), key), None)
                }
                Err(e) => {
                    if options.simulate {
                        warn!("{e}; simulating with an empty in-memory secret store");
                    } else {
                        debug!("Sealed secrets unavailable: {e}");
                    }
                    let key = SealingKey::from_base64("ephemeral", &generate_key()?)?;
                    let store = SecretStore::new(Arc::new(MemorySecretBackend::new()), key);
                    (store, (!options.simulate).then(|| e.to_string()))
                }
            };

        let renderer = ManifestRenderer::new(environments.clone(), config.manifests.clone(), root);
        let settings = RolloutSettings::from_config(&config.rollout);

        Ok(Self {
            config,
            environments,
            renderer,
            cluster,
            health,
            history,
            secrets: Arc::new(secrets),
            key_error,
            locks: EnvironmentLocks::new(),
            settings,
        })
    }

    /// Builds an orchestrator over explicit collaborators.
    #[must_use]
    pub fn from_parts(
        config: RollwardenConfig,
        root: impl Into<PathBuf>,
        cluster: Arc<dyn ClusterProvider>,
        health: Arc<dyn HealthSignal>,
        history: Arc<dyn HistoryStore>,
        secrets: Arc<SecretStore>,
    ) -> Self {
        let environments = Environments::from_config(&config.environments);
        let renderer = ManifestRenderer::new(environments.clone(), config.manifests.clone(), root);
        let settings = RolloutSettings::from_config(&config.rollout);
        Self {
            config,
            environments,
            renderer,
            cluster,
            health,
            history,
            secrets,
            key_error: None,
            locks: EnvironmentLocks::new(),
            settings,
        }
    }

    /// Overrides the rollout timing and retry settings.
    #[must_use]
    pub fn with_settings(mut self, settings: RolloutSettings) -> Self {
        self.settings = settings;
        self
    }

    async fn history_store(config: &RollwardenConfig, root: &Path) -> Result<Arc<dyn HistoryStore>> {
        match config.state.backend {
            StateBackend::Local => {
                let dir = config
                    .state
                    .path
                    .as_deref()
                    .map_or_else(|| root.join(STATE_DIR), |p| resolve(root, p));
                debug!("Using local history in {}", dir.display());
                Ok(Arc::new(LocalHistoryStore::with_base_dir(dir)))
            }
            StateBackend::S3 => {
                let bucket = config
                    .state
                    .bucket
                    .as_deref()
                    .ok_or_else(|| ConfigError::validation("S3 bucket not configured", "state.bucket"))?;
                let store =
                    S3HistoryStore::new(bucket, config.state.prefix.as_deref(), config.state.region.as_deref())
                        .await?;
                Ok(Arc::new(store))
            }
        }
    }

    /// The loaded configuration.
    #[must_use]
    pub const fn config(&self) -> &RollwardenConfig {
        &self.config
    }

    /// The environment set.
    #[must_use]
    pub const fn environments(&self) -> &Environments {
        &self.environments
    }

    /// Whether `apply` and `rollback` must be confirmed for an environment.
    #[must_use]
    pub const fn requires_confirmation(&self, environment: Environment) -> bool {
        self.environments.get(environment).requires_confirmation
    }

    fn sealed_secrets(&self) -> Result<&SecretStore> {
        match &self.key_error {
            Some(message) => Err(SecretError::InvalidKey {
                message: message.clone(),
            }
            .into()),
            None => Ok(&self.secrets),
        }
    }

    fn controller(&self) -> RolloutController {
        RolloutController::new(
            self.cluster.clone(),
            self.health.clone(),
            self.history.clone(),
            self.secrets.clone(),
            self.settings.clone(),
        )
        .with_locks(self.locks.clone())
    }

    /// Renders the environment's manifest.
    ///
    /// # Errors
    ///
    /// Returns a render error if the overlay cannot be resolved or applied.
    pub fn render(&self, environment: Environment) -> Result<ManifestSet> {
        let manifest = self.renderer.render(environment)?;
        info!(
            "Rendered {} resource(s) for {environment} (digest {})",
            manifest.len(),
            manifest.short_digest()
        );
        Ok(manifest)
    }

    /// Renders, pins secrets and plans against a fresh snapshot.
    ///
    /// Secret validation is fatal for production and a warning elsewhere.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering, secret validation, observation or
    /// planning fails.
    pub async fn plan(&self, environment: Environment) -> Result<PlannedRollout> {
        let rendered = self.render(environment)?;
        let referenced = referenced_keys(&rendered);

        let (manifest, validation) = if referenced.is_empty() {
            let validation = SecretValidation {
                environment,
                policy: ValidationPolicy::for_environment(environment),
                issues: Vec::new(),
            };
            (rendered, validation)
        } else {
            let secrets = self.sealed_secrets()?;
            let validation = secrets.validate_references(environment, &referenced).await?;
            SecretStore::enforce(&validation)?;
            (secrets.inject(&rendered).await?, validation)
        };

        let snapshot = self.cluster.fetch_snapshot(environment).await?;
        let head = self.history.head(environment).await?;
        let plan = planner::plan(&manifest, &snapshot, head.as_ref())?;

        let counts = plan.counts();
        info!(
            "Planned {environment}: {} to create, {} to update, {} to delete",
            counts.creates, counts.updates, counts.deletes
        );
        Ok(PlannedRollout {
            manifest,
            plan,
            validation,
        })
    }

    /// Starts rolling out a plan.
    ///
    /// # Errors
    ///
    /// See [`RolloutController::start`].
    pub async fn apply(&self, planned: PlannedRollout) -> Result<RolloutHandle> {
        self.controller().start(planned.plan, planned.manifest).await
    }

    /// Starts rolling the environment back to its previous good state.
    ///
    /// # Errors
    ///
    /// See [`RolloutController::rollback`].
    pub async fn rollback(&self, environment: Environment) -> Result<RolloutHandle> {
        self.controller().rollback(environment).await
    }

    /// Settles an interrupted rollout.
    ///
    /// # Errors
    ///
    /// See [`RolloutController::recover`].
    pub async fn recover(&self, environment: Environment) -> Result<Option<RolloutOutcome>> {
        self.controller().recover(environment).await
    }

    /// Reports head record, lock and drift for an environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster or the history store fails.
    pub async fn status(&self, environment: Environment) -> Result<EnvironmentStatus> {
        let spec = self.environments.get(environment);
        let snapshot = self.cluster.fetch_snapshot(environment).await?;
        let managed_resources = snapshot
            .resources
            .values()
            .filter(|document| is_managed_by(document, environment))
            .count();

        let head = self.history.head(environment).await?;
        let lock = self
            .history
            .get_lock_info(environment)
            .await?
            .filter(|lock| !lock.is_expired());
        let drift = self
            .history
            .last_succeeded(environment, None)
            .await?
            .map(|record| DiffEngine::new().compute_diff(&record.manifest, &snapshot));

        Ok(EnvironmentStatus {
            environment,
            namespace: spec.namespace.clone(),
            context: spec.context.clone(),
            managed_resources,
            head: head.as_ref().map(RecordSummary::from),
            lock,
            drift,
        })
    }

    /// Most recent records, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the history store fails.
    pub async fn history(&self, environment: Environment, limit: usize) -> Result<Vec<RecordSummary>> {
        let records = self.history.history(environment, limit).await?;
        Ok(records.iter().map(RecordSummary::from).collect())
    }

    /// Creates every key the environment's manifest references, with a
    /// placeholder value.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering fails or the store is unavailable.
    pub async fn secret_init(&self, environment: Environment) -> Result<Vec<String>> {
        let keys = referenced_keys(&self.render(environment)?);
        Ok(self.sealed_secrets()?.init(environment, &keys).await?)
    }

    /// Validates stored values and the keys the manifest references.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering fails or the store is unavailable.
    pub async fn secret_validate(&self, environment: Environment) -> Result<SecretValidation> {
        let keys = referenced_keys(&self.render(environment)?);
        Ok(self
            .sealed_secrets()?
            .validate_references(environment, &keys)
            .await?)
    }

    /// Lists keys with their versions, without values.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn secret_list(&self, environment: Environment) -> Result<Vec<SecretSummary>> {
        Ok(self.sealed_secrets()?.get(environment).await?.summary())
    }

    /// Stores a value, creating the key if needed.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed key or an unavailable store.
    pub async fn secret_put(&self, environment: Environment, key: &str, value: SecretString) -> Result<u64> {
        Ok(self.sealed_secrets()?.put(environment, key, value).await?)
    }

    /// Replaces the value of an existing key.
    ///
    /// # Errors
    ///
    /// Returns an error if the key does not exist or the store is unavailable.
    pub async fn secret_rotate(&self, environment: Environment, key: &str, value: SecretString) -> Result<u64> {
        Ok(self.sealed_secrets()?.rotate(environment, key, value).await?)
    }

    /// Reveals one value under an acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns an error without a reason, for a missing key, or if the store
    /// is unavailable.
    pub async fn secret_reveal(
        &self,
        environment: Environment,
        key: &str,
        ack: &RevealAcknowledgement,
    ) -> Result<SecretString> {
        Ok(self.sealed_secrets()?.reveal(environment, key, ack).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClusterError, RollwardenError};
    use crate::rollout::RolloutState;
    use std::time::Duration;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
project:
  name: shop
environments:
  dev:
    namespace: shop-dev
  stage:
    namespace: shop-stage
  prod:
    namespace: shop-prod
    requires_confirmation: true
manifests:
  base: base
  overlays:
    dev: [overlays/dev]
    stage: [overlays/stage]
    prod: [overlays/prod]
"#;

    const BASE: &str = r"
apiVersion: v1
kind: ConfigMap
metadata:
  name: shop
data:
  MODE: base
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 2
  template:
    spec:
      containers:
        - name: web
          image: shop:1.0
";

    struct Fixture {
        temp: TempDir,
        cluster: Arc<InMemoryCluster>,
        orchestrator: Orchestrator,
    }

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(name), content).unwrap();
    }

    fn fixture(prod_overlay: &str) -> Fixture {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(&root.join("base"), "app.yaml", BASE);
        write(&root.join("overlays/dev"), "overlay.yaml", "patches: []\n");
        write(&root.join("overlays/stage"), "overlay.yaml", "patches: []\n");
        write(&root.join("overlays/prod"), "overlay.yaml", prod_overlay);

        let config = ConfigParser::new().parse_yaml(CONFIG, None).unwrap();
        let cluster = Arc::new(InMemoryCluster::new());
        let key = SealingKey::from_base64("test", &generate_key().unwrap()).unwrap();
        let secrets = Arc::new(SecretStore::new(Arc::new(MemorySecretBackend::new()), key));
        let orchestrator = Orchestrator::from_parts(
            config,
            root,
            cluster.clone(),
            cluster.clone(),
            Arc::new(MemoryHistoryStore::new()),
            secrets,
        )
        .with_settings(RolloutSettings {
            poll_interval: Duration::from_secs(5),
            stability_polls: 2,
            workload_timeout: Duration::from_secs(60),
            rollback_timeout: Duration::from_secs(60),
            retry_attempts: 2,
            retry_base_delay: Duration::from_millis(100),
            retry_factor: 2,
        });

        Fixture {
            temp,
            cluster,
            orchestrator,
        }
    }

    const PROD_WITH_SECRET: &str = r"
resources: [secret.yaml]
";

    const SECRET: &str = r"
apiVersion: v1
kind: Secret
metadata:
  name: shop-db
data:
  DB_PASSWORD: ${secret:DB_PASSWORD}
";

    #[test]
    fn test_confirmation_follows_environment() {
        let fx = fixture("patches: []\n");
        assert!(fx.orchestrator.requires_confirmation(Environment::Prod));
        assert!(!fx.orchestrator.requires_confirmation(Environment::Dev));
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_apply_then_converged() {
        let fx = fixture("patches: []\n");

        let planned = fx.orchestrator.plan(Environment::Dev).await.unwrap();
        assert_eq!(planned.plan.counts().creates, 2);

        let outcome = fx.orchestrator.apply(planned).await.unwrap().wait().await.unwrap();
        assert_eq!(outcome.state, RolloutState::Succeeded);
        assert_eq!(fx.cluster.resource_ids(Environment::Dev).len(), 2);

        let again = fx.orchestrator.plan(Environment::Dev).await.unwrap();
        assert!(again.plan.is_empty());

        let status = fx.orchestrator.status(Environment::Dev).await.unwrap();
        assert_eq!(status.managed_resources, 2);
        assert!(status.is_converged());
        assert!(status.lock.is_none());
        assert_eq!(status.head.unwrap().result_state, ResultState::Succeeded);

        let history = fx.orchestrator.history(Environment::Dev, 10).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_prod_placeholder_blocks_plan() {
        let fx = fixture(PROD_WITH_SECRET);
        write(&fx.temp.path().join("overlays/prod"), "secret.yaml", SECRET);

        let created = fx.orchestrator.secret_init(Environment::Prod).await.unwrap();
        assert_eq!(created, vec![String::from("DB_PASSWORD")]);

        let err = fx.orchestrator.plan(Environment::Prod).await.unwrap_err();
        assert!(matches!(err, RollwardenError::Secret(SecretError::ValidationFailed { .. })));

        fx.orchestrator
            .secret_put(Environment::Prod, "DB_PASSWORD", SecretString::from("s3cr3t-value"))
            .await
            .unwrap();
        let planned = fx.orchestrator.plan(Environment::Prod).await.unwrap();
        assert!(planned.validation.is_ok());
        assert_eq!(planned.plan.counts().creates, 3);
    }

    #[tokio::test]
    async fn test_unreachable_cluster_is_retryable() {
        let fx = fixture("patches: []\n");
        fx.cluster.set_unavailable(true);

        let err = fx.orchestrator.plan(Environment::Dev).await.unwrap_err();
        assert!(matches!(err, RollwardenError::Cluster(ClusterError::Network { .. })));
        assert!(err.is_retryable());
        assert!(fx.orchestrator.status(Environment::Dev).await.is_err());

        fx.cluster.set_unavailable(false);
        assert!(fx.orchestrator.plan(Environment::Dev).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_key_only_blocks_secret_commands() {
        let mut fx = fixture("patches: []\n");
        fx.orchestrator.key_error = Some(String::from("set $ROLLWARDEN_SECRET_KEY"));

        assert!(fx.orchestrator.plan(Environment::Dev).await.is_ok());
        let err = fx.orchestrator.secret_list(Environment::Dev).await.unwrap_err();
        assert!(err.to_string().contains("ROLLWARDEN_SECRET_KEY"));
    }
}
