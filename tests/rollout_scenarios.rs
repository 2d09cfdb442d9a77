//! End-to-end rollout scenarios against the in-memory cluster.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rollwarden::cluster::InMemoryCluster;
use rollwarden::config::{ConfigParser, Environment, RolloutSettings};
use rollwarden::error::{RolloutError, RollwardenError, SecretError};
use rollwarden::manifest::ResourceId;
use rollwarden::planner::ActionType;
use rollwarden::rollout::RolloutState;
use rollwarden::secrets::{MemorySecretBackend, SealingKey, SecretStore, generate_key};
use rollwarden::state::{HistoryStore, MemoryHistoryStore, RecordKind, ResultState};
use base64::{Engine, prelude::BASE64_STANDARD};
use rollwarden::Orchestrator;
use secrecy::SecretString;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

const CONFIG: &str = r"
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
";

const EMPTY_OVERLAY: &str = "patches: []\n";

fn app(image: &str, mode: &str) -> String {
    format!(
        r"
apiVersion: v1
kind: ConfigMap
metadata:
  name: shop
data:
  MODE: {mode}
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
          image: {image}
"
    )
}

const SECRET: &str = r"
apiVersion: v1
kind: Secret
metadata:
  name: shop-db
data:
  DB_PASSWORD: ${secret:DB_PASSWORD}
";

struct Scenario {
    temp: TempDir,
    cluster: Arc<InMemoryCluster>,
    history: Arc<MemoryHistoryStore>,
    orchestrator: Orchestrator,
}

impl Scenario {
    fn new() -> Self {
        Self::with_cluster(InMemoryCluster::new())
    }

    fn with_cluster(cluster: InMemoryCluster) -> Self {
        let temp = TempDir::new().unwrap();
        write(&temp.path().join("base"), "app.yaml", &app("shop:1.0", "base"));
        for env in ["dev", "stage", "prod"] {
            write(&temp.path().join("overlays").join(env), "overlay.yaml", EMPTY_OVERLAY);
        }

        let config = ConfigParser::new().parse_yaml(CONFIG, None).unwrap();
        let cluster = Arc::new(cluster);
        let history = Arc::new(MemoryHistoryStore::new());
        let key = SealingKey::from_base64("test", &generate_key().unwrap()).unwrap();
        let secrets = Arc::new(SecretStore::new(Arc::new(MemorySecretBackend::new()), key));
        let orchestrator = Orchestrator::from_parts(
            config,
            temp.path(),
            cluster.clone(),
            cluster.clone(),
            history.clone(),
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

        Self {
            temp,
            cluster,
            history,
            orchestrator,
        }
    }

    fn write_base(&self, name: &str, content: &str) {
        write(&self.temp.path().join("base"), name, content);
    }

    fn remove_base(&self, name: &str) {
        std::fs::remove_file(self.temp.path().join("base").join(name)).unwrap();
    }

    async fn deploy(&self, environment: Environment) -> rollwarden::rollout::RolloutOutcome {
        let planned = self.orchestrator.plan(environment).await.unwrap();
        self.orchestrator.apply(planned).await.unwrap().wait().await.unwrap()
    }
}

fn write(dir: &Path, name: &str, content: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join(name), content).unwrap();
}

fn web() -> ResourceId {
    ResourceId::new("Deployment", "shop-dev", "web")
}

#[test]
fn test_render_is_deterministic() {
    let s = Scenario::new();
    let first = s.orchestrator.render(Environment::Dev).unwrap();
    let second = s.orchestrator.render(Environment::Dev).unwrap();

    assert_eq!(first.canonical_json(), second.canonical_json());
    assert_eq!(first.digest(), second.digest());
    assert_ne!(first.digest(), s.orchestrator.render(Environment::Stage).unwrap().digest());
}

#[tokio::test(start_paused = true)]
async fn test_dev_rollout_succeeds_and_converges() {
    let s = Scenario::new();

    let outcome = s.deploy(Environment::Dev).await;
    assert_eq!(outcome.state, RolloutState::Succeeded);
    assert_eq!(outcome.applied, 2);

    let again = s.orchestrator.plan(Environment::Dev).await.unwrap();
    assert!(again.plan.is_empty());

    let status = s.orchestrator.status(Environment::Dev).await.unwrap();
    assert!(status.is_converged());
    assert_eq!(status.head.unwrap().id, outcome.record_id);

    // other environments untouched
    assert!(s.cluster.resource_ids(Environment::Stage).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_namespace_created_first_and_deleted_last() {
    let s = Scenario::new();
    s.write_base(
        "namespace.yaml",
        "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: shop-dev\n",
    );

    let planned = s.orchestrator.plan(Environment::Dev).await.unwrap();
    let kinds: Vec<&str> = planned.plan.actions.iter().map(|a| a.id.kind.as_str()).collect();
    assert_eq!(kinds, vec!["Namespace", "ConfigMap", "Deployment"]);
    assert_eq!(
        s.orchestrator.apply(planned).await.unwrap().wait().await.unwrap().state,
        RolloutState::Succeeded
    );

    s.remove_base("namespace.yaml");
    s.write_base(
        "app.yaml",
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: keep\ndata:\n  MODE: base\n",
    );

    let planned = s.orchestrator.plan(Environment::Dev).await.unwrap();
    let steps: Vec<(ActionType, &str)> = planned
        .plan
        .actions
        .iter()
        .map(|a| (a.action_type, a.id.kind.as_str()))
        .collect();
    assert_eq!(
        steps,
        vec![
            (ActionType::Create, "ConfigMap"),
            (ActionType::Delete, "Deployment"),
            (ActionType::Delete, "ConfigMap"),
            (ActionType::Delete, "Namespace"),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_regression_settles_on_previous_release() {
    let s = Scenario::new();
    let first = s.deploy(Environment::Dev).await;

    s.write_base("app.yaml", &app("shop:1.1", "base"));
    s.cluster.set_ready(Environment::Dev, &web(), [2, 1, 2]);
    let outcome = s.deploy(Environment::Dev).await;

    assert_eq!(outcome.state, RolloutState::Settled);
    assert!(outcome.error.is_some());

    let head = s.history.head(Environment::Dev).await.unwrap().unwrap();
    assert_eq!(head.result_state, ResultState::RolledBack);
    assert_eq!(head.previous_record_id.as_deref(), Some(first.record_id.as_str()));

    let image = s.cluster.get(Environment::Dev, &web()).unwrap()["spec"]["template"]["spec"]["containers"][0]
        ["image"]
        .clone();
    assert_eq!(image, "shop:1.0");

    s.write_base("app.yaml", &app("shop:1.0", "base"));
    assert!(s.orchestrator.plan(Environment::Dev).await.unwrap().plan.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_explicit_rollback_round_trip() {
    let s = Scenario::new();
    s.deploy(Environment::Dev).await;

    s.write_base("app.yaml", &app("shop:2.0", "next"));
    let second = s.deploy(Environment::Dev).await;
    assert_eq!(second.state, RolloutState::Succeeded);

    let outcome = s.orchestrator.rollback(Environment::Dev).await.unwrap().wait().await.unwrap();
    assert_eq!(outcome.state, RolloutState::Succeeded);

    let head = s.history.head(Environment::Dev).await.unwrap().unwrap();
    assert_eq!(head.kind, RecordKind::Rollback { of: second.record_id });

    s.write_base("app.yaml", &app("shop:1.0", "base"));
    assert!(s.orchestrator.plan(Environment::Dev).await.unwrap().plan.is_empty());

    let history = s.orchestrator.history(Environment::Dev, 10).await.unwrap();
    assert_eq!(history.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_second_apply_is_rejected_while_first_runs() {
    let s = Scenario::with_cluster(InMemoryCluster::without_auto_ready());

    let planned = s.orchestrator.plan(Environment::Dev).await.unwrap();
    let handle = s.orchestrator.apply(planned).await.unwrap();
    let mut states = handle.subscribe();
    states.wait_for(|state| *state == RolloutState::Monitoring).await.unwrap();

    let planned = s.orchestrator.plan(Environment::Dev).await.unwrap();
    let err = assert_err!(s.orchestrator.apply(planned).await);
    assert!(matches!(
        err,
        RollwardenError::Rollout(RolloutError::RolloutInProgress { environment: Environment::Dev, .. })
    ));

    let status = s.orchestrator.status(Environment::Dev).await.unwrap();
    assert!(status.lock.is_some());

    handle.cancel();
    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.state, RolloutState::Settled);
    assert!(s.cluster.resource_ids(Environment::Dev).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_placeholders_block_prod_only() {
    let s = Scenario::new();
    s.write_base("secret.yaml", SECRET);

    for env in [Environment::Dev, Environment::Prod] {
        let created = s.orchestrator.secret_init(env).await.unwrap();
        assert_eq!(created, vec![String::from("DB_PASSWORD")]);
    }

    let dev = s.orchestrator.plan(Environment::Dev).await.unwrap();
    assert!(!dev.validation.is_ok());

    let err = assert_err!(s.orchestrator.plan(Environment::Prod).await);
    assert!(matches!(
        err,
        RollwardenError::Secret(SecretError::ValidationFailed { environment: Environment::Prod, .. })
    ));

    s.orchestrator
        .secret_put(Environment::Prod, "DB_PASSWORD", SecretString::from("correct-horse-battery"))
        .await
        .unwrap();
    let planned = assert_ok!(s.orchestrator.plan(Environment::Prod).await);
    assert!(planned.validation.is_ok());
    assert_eq!(planned.plan.counts().creates, 3);
}

#[tokio::test(start_paused = true)]
async fn test_secret_values_stay_out_of_history() {
    let s = Scenario::new();
    s.write_base("secret.yaml", SECRET);
    s.orchestrator
        .secret_put(Environment::Dev, "DB_PASSWORD", SecretString::from("correct-horse-battery"))
        .await
        .unwrap();

    let outcome = s.deploy(Environment::Dev).await;
    assert_eq!(outcome.state, RolloutState::Succeeded);

    let applied = s
        .cluster
        .get(Environment::Dev, &ResourceId::new("Secret", "shop-dev", "shop-db"))
        .unwrap();
    let encoded = BASE64_STANDARD.encode("correct-horse-battery");
    assert_eq!(applied["data"]["DB_PASSWORD"], encoded.as_str());

    let head = s.history.head(Environment::Dev).await.unwrap().unwrap();
    let recorded = format!(
        "{}{}",
        head.manifest.canonical_json(),
        serde_json::to_string(&head.actions).unwrap()
    );
    assert!(!recorded.contains("correct-horse-battery"));
    assert!(!recorded.contains(&encoded));
}
