//! App set orchestration tests

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use envctl::deploy::backend::Backend;
use envctl::deploy::deployment::Status;
use envctl::errors::{EnvError, Stage};

use common::{app_set, options, FakeBackend, TestEnv};

fn status(env: &TestEnv, name: &str) -> Status {
    env.spec.get(name).map(|info| info.status()).unwrap_or_default()
}

#[tokio::test]
async fn test_deploys_dependencies_first() {
    let env = TestEnv::new("chain").await;
    let backend = Arc::new(FakeBackend::new().with_deploy_delay(Duration::from_millis(20)));

    // Declared out of order on purpose
    let c = env.app("c", "img:c", &["b"]).build();
    let b = env.app("b", "img:b", &["a"]).build();
    let a = env.app("a", "img:a", &[]).build();
    let set = app_set(&[c, b, a]);

    let report = assert_ok!(
        set.deploy(
            &env.spec,
            &env.spec_file(),
            backend.clone() as Arc<dyn Backend>,
            &options(4),
            &CancellationToken::new(),
        )
        .await
    );

    assert_eq!(report.deployed, vec!["a", "b", "c"]);
    assert!(report.already_running.is_empty());

    let a = backend.event("a").unwrap();
    let b = backend.event("b").unwrap();
    let c = backend.event("c").unwrap();
    assert!(b.start >= a.end);
    assert!(c.start >= b.end);

    for name in ["a", "b", "c"] {
        assert_eq!(status(&env, name), Status::Running);
    }
    let info = env.spec.get("c").unwrap().get();
    assert_eq!(info.container.as_deref(), Some("test-c"));
    assert_eq!(info.depends_on, vec!["b"]);
    assert_eq!(info.host_address("rpc").as_deref(), Some("127.0.0.1:38080"));

    env.cleanup().await;
}

#[tokio::test]
async fn test_second_run_deploys_nothing() {
    let mut env = TestEnv::new("rerun").await;
    let backend = Arc::new(FakeBackend::new());

    let db = env.app("db", "postgres:16", &[]).build();
    let api = env.app("api", "api:1", &["db"]).build();
    let set = app_set(&[db.clone(), api]);
    assert_ok!(
        set.deploy(
            &env.spec,
            &env.spec_file(),
            backend.clone() as Arc<dyn Backend>,
            &options(2),
            &CancellationToken::new(),
        )
        .await
    );
    assert_eq!(backend.deploy_count(), 2);
    assert_eq!(db.prepare_count(), 1);

    // Next invocation starts from the persisted state
    env.reload().await;
    let db = env.app("db", "postgres:16", &[]).build();
    let api = env.app("api", "api:1", &["db"]).build();
    let set = app_set(&[db.clone(), api]);
    let report = assert_ok!(
        set.deploy(
            &env.spec,
            &env.spec_file(),
            backend.clone() as Arc<dyn Backend>,
            &options(2),
            &CancellationToken::new(),
        )
        .await
    );

    assert!(report.deployed.is_empty());
    assert_eq!(report.already_running, vec!["db", "api"]);
    assert_eq!(backend.deploy_count(), 2);
    assert_eq!(backend.pull_count(), 2);
    assert_eq!(db.prepare_count(), 0);

    env.cleanup().await;
}

#[tokio::test]
async fn test_shared_image_is_pulled_once() {
    let env = TestEnv::new("pull").await;
    let backend = Arc::new(FakeBackend::new().with_pull_delay(Duration::from_millis(50)));

    let apps: Vec<_> = (0..10)
        .map(|i| env.app(&format!("node-{}", i), "gaia:v15", &[]).build())
        .collect();
    let report = assert_ok!(
        app_set(&apps)
            .deploy(
                &env.spec,
                &env.spec_file(),
                backend.clone() as Arc<dyn Backend>,
                &options(4),
                &CancellationToken::new(),
            )
            .await
    );

    assert_eq!(report.deployed.len(), 10);
    assert_eq!(backend.pull_count(), 1);
    assert!(backend.peak_concurrency() <= 4);

    env.cleanup().await;
}

#[tokio::test]
async fn test_present_image_is_not_pulled() {
    let env = TestEnv::new("present").await;
    let backend = Arc::new(FakeBackend::new().with_image("postgres:16"));

    let db = env.app("db", "postgres:16", &[]).build();
    assert_ok!(
        app_set(&[db])
            .deploy(
                &env.spec,
                &env.spec_file(),
                backend.clone() as Arc<dyn Backend>,
                &options(1),
                &CancellationToken::new(),
            )
            .await
    );
    assert_eq!(backend.pull_count(), 0);

    env.cleanup().await;
}

#[tokio::test]
async fn test_deploy_phase_is_bounded_by_slots() {
    let env = TestEnv::new("slots").await;
    let backend = Arc::new(FakeBackend::new().with_deploy_delay(Duration::from_millis(30)));

    let apps: Vec<_> = (0..8)
        .map(|i| env.app(&format!("svc-{}", i), &format!("img:{}", i), &[]).build())
        .collect();
    let report = assert_ok!(
        app_set(&apps)
            .deploy(
                &env.spec,
                &env.spec_file(),
                backend.clone() as Arc<dyn Backend>,
                &options(2),
                &CancellationToken::new(),
            )
            .await
    );

    assert_eq!(report.deployed.len(), 8);
    assert!(backend.peak_concurrency() <= 2);
    assert!(backend.peak_concurrency() >= 1);

    env.cleanup().await;
}

#[tokio::test]
async fn test_chain_completes_with_a_single_slot() {
    let env = TestEnv::new("single").await;
    let backend = Arc::new(FakeBackend::new().with_deploy_delay(Duration::from_millis(5)));

    let a = env.app("a", "img", &[]).build();
    let b = env.app("b", "img", &["a"]).build();
    let c = env.app("c", "img", &["b"]).build();
    let report = assert_ok!(
        tokio::time::timeout(
            Duration::from_secs(5),
            app_set(&[a, b, c]).deploy(
                &env.spec,
                &env.spec_file(),
                backend.clone() as Arc<dyn Backend>,
                &options(1),
                &CancellationToken::new(),
            ),
        )
        .await
        .expect("deployment hung")
    );

    assert_eq!(report.deployed, vec!["a", "b", "c"]);
    assert_eq!(backend.peak_concurrency(), 1);

    env.cleanup().await;
}

#[tokio::test]
async fn test_slow_dependency_times_out_dependents() {
    let env = TestEnv::new("timeout").await;
    let backend = Arc::new(FakeBackend::new().with_deploy_delay(Duration::from_millis(400)));

    let a = env.app("a", "img", &[]).build();
    let b = env
        .app("b", "img", &["a"])
        .timeout(Duration::from_millis(50))
        .build();
    let c = env.app("c", "img", &["b"]).build();
    let err = assert_err!(
        app_set(&[a, b, c])
            .deploy(
                &env.spec,
                &env.spec_file(),
                backend.clone() as Arc<dyn Backend>,
                &options(4),
                &CancellationToken::new(),
            )
            .await
    );

    assert_eq!(err.stage(), Some(Stage::Dependencies));
    assert!(matches!(
        err.root(),
        EnvError::PrerequisiteTimeout { .. } | EnvError::DependencyFailed(_)
    ));

    // The unrelated branch finished, the dependents never reached the backend
    assert_eq!(status(&env, "a"), Status::Running);
    assert_eq!(status(&env, "b"), Status::NotDeployed);
    assert_eq!(status(&env, "c"), Status::NotDeployed);
    assert_eq!(backend.deploy_count(), 1);

    env.cleanup().await;
}

#[tokio::test]
async fn test_timeout_names_the_pending_dependency() {
    let env = TestEnv::new("timeout-name").await;
    let backend = Arc::new(FakeBackend::new().with_deploy_delay(Duration::from_millis(300)));

    let a = env.app("a", "img", &[]).build();
    let b = env
        .app("b", "img", &["a"])
        .timeout(Duration::from_millis(30))
        .build();
    let err = assert_err!(
        app_set(&[a, b])
            .deploy(
                &env.spec,
                &env.spec_file(),
                backend.clone() as Arc<dyn Backend>,
                &options(2),
                &CancellationToken::new(),
            )
            .await
    );

    match err.root() {
        EnvError::PrerequisiteTimeout { dependency, timeout } => {
            assert_eq!(dependency, "a");
            assert_eq!(*timeout, Duration::from_millis(30));
        }
        other => panic!("unexpected error: {other}"),
    }

    env.cleanup().await;
}

#[tokio::test]
async fn test_running_but_unhealthy_dependency_times_out() {
    let env = TestEnv::new("unhealthy").await;
    let backend = Arc::new(FakeBackend::new().with_deploy_delay(Duration::from_millis(20)));

    // db comes up, but nothing listens on its published rpc port
    let db = env.app("db", "postgres:16", &[]).build();
    let api = env
        .app("api", "api:1", &["db"])
        .probing("rpc")
        .timeout(Duration::from_millis(400))
        .build();
    let cache = env.app("cache", "redis:7", &[]).build();

    let started = Instant::now();
    let err = assert_err!(
        app_set(&[db, api, cache])
            .deploy(
                &env.spec,
                &env.spec_file(),
                backend.clone() as Arc<dyn Backend>,
                &options(1),
                &CancellationToken::new(),
            )
            .await
    );

    assert_eq!(err.stage(), Some(Stage::Dependencies));
    match err.root() {
        EnvError::PrerequisiteTimeout { dependency, .. } => assert_eq!(dependency, "db"),
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(status(&env, "db"), Status::Running);
    assert_eq!(status(&env, "api"), Status::NotDeployed);
    assert!(backend.event("api").is_none());

    // api never held the only slot while it waited
    let cache = backend.event("cache").unwrap();
    assert!(cache.end.duration_since(started) < Duration::from_millis(400));

    env.cleanup().await;
}

#[tokio::test]
async fn test_backend_failure_is_reported_with_its_stage() {
    let mut env = TestEnv::new("backend-fail").await;
    let backend = Arc::new(FakeBackend::new());
    backend.fail_app("relayer");

    let chain = env.app("chain", "gaia", &[]).build();
    let relayer = env.app("relayer", "hermes", &["chain"]).build();
    let explorer = env.app("explorer", "explorer", &[]).build();
    let err = assert_err!(
        app_set(&[chain, relayer, explorer])
            .deploy(
                &env.spec,
                &env.spec_file(),
                backend.clone() as Arc<dyn Backend>,
                &options(4),
                &CancellationToken::new(),
            )
            .await
    );

    assert_eq!(err.stage(), Some(Stage::Deploy));
    assert!(matches!(err.root(), EnvError::BackendError(_)));
    assert!(err.to_string().starts_with("relayer failed at backend stage"));

    // State is flushed even though the run failed
    env.reload().await;
    assert_eq!(status(&env, "chain"), Status::Running);
    assert_eq!(status(&env, "explorer"), Status::Running);
    assert_eq!(status(&env, "relayer"), Status::NotDeployed);

    env.cleanup().await;
}

#[tokio::test]
async fn test_failed_app_fails_its_dependents_fast() {
    let env = TestEnv::new("dep-fail").await;
    let backend = Arc::new(FakeBackend::new());
    backend.fail_app("db");

    let db = env.app("db", "postgres", &[]).build();
    let api = env
        .app("api", "api", &["db"])
        .timeout(Duration::from_secs(30))
        .build();
    let started = Instant::now();
    assert_err!(
        app_set(&[db, api])
            .deploy(
                &env.spec,
                &env.spec_file(),
                backend.clone() as Arc<dyn Backend>,
                &options(2),
                &CancellationToken::new(),
            )
            .await
    );

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(backend.event("api").is_none());
    assert_eq!(status(&env, "api"), Status::NotDeployed);

    env.cleanup().await;
}

#[tokio::test]
async fn test_failed_pull_fails_every_user_once() {
    let env = TestEnv::new("pull-fail").await;
    let backend = Arc::new(FakeBackend::new().with_failing_pulls());

    let apps: Vec<_> = (0..3)
        .map(|i| env.app(&format!("node-{}", i), "gaia:missing", &[]).build())
        .collect();
    let err = assert_err!(
        app_set(&apps)
            .deploy(
                &env.spec,
                &env.spec_file(),
                backend.clone() as Arc<dyn Backend>,
                &options(3),
                &CancellationToken::new(),
            )
            .await
    );

    assert_eq!(err.stage(), Some(Stage::Image));
    assert_eq!(backend.pull_count(), 1);
    assert_eq!(backend.deploy_count(), 0);

    env.cleanup().await;
}

#[tokio::test]
async fn test_configure_failure_leaves_app_stopped() {
    let mut env = TestEnv::new("configure").await;
    let backend = Arc::new(FakeBackend::new());

    let node = env.app("node", "gaia", &[]).failing_configure().build();
    let err = assert_err!(
        app_set(&[node.clone()])
            .deploy(
                &env.spec,
                &env.spec_file(),
                backend.clone() as Arc<dyn Backend>,
                &options(1),
                &CancellationToken::new(),
            )
            .await
    );
    assert!(matches!(err.root(), EnvError::HookError(_)));
    assert_eq!(node.prepare_count(), 1);

    let info = env.spec.get("node").unwrap().get();
    assert_eq!(info.status, Status::Stopped);
    assert_eq!(info.container.as_deref(), Some("test-node"));

    // A stopped app is redeployed without preparing it again
    env.reload().await;
    let node = env.app("node", "gaia", &[]).build();
    let report = assert_ok!(
        app_set(&[node.clone()])
            .deploy(
                &env.spec,
                &env.spec_file(),
                backend.clone() as Arc<dyn Backend>,
                &options(1),
                &CancellationToken::new(),
            )
            .await
    );
    assert_eq!(report.deployed, vec!["node"]);
    assert_eq!(node.prepare_count(), 0);
    assert_eq!(status(&env, "node"), Status::Running);

    env.cleanup().await;
}

#[tokio::test]
async fn test_running_dependency_outside_the_set() {
    let env = TestEnv::new("outside").await;
    let backend = Arc::new(FakeBackend::new());
    env.spec
        .describe_app("test", "db")
        .unwrap()
        .set_status(Status::Running);

    let api = env.app("api", "api", &["db"]).build();
    let report = assert_ok!(
        app_set(&[api])
            .deploy(
                &env.spec,
                &env.spec_file(),
                backend.clone() as Arc<dyn Backend>,
                &options(1),
                &CancellationToken::new(),
            )
            .await
    );
    assert_eq!(report.deployed, vec!["api"]);

    env.cleanup().await;
}

#[tokio::test]
async fn test_invalid_graphs_are_rejected_before_any_work() {
    let env = TestEnv::new("graph").await;
    let backend = Arc::new(FakeBackend::new());
    let cancel = CancellationToken::new();

    // Cycle
    let a = env.app("a", "img", &["b"]).build();
    let b = env.app("b", "img", &["a"]).build();
    let err = assert_err!(
        app_set(&[a, b])
            .deploy(
                &env.spec,
                &env.spec_file(),
                backend.clone() as Arc<dyn Backend>,
                &options(2),
                &cancel,
            )
            .await
    );
    assert!(matches!(err, EnvError::ConsistencyError(_)));

    // Duplicate name
    let x1 = env.app("x", "img", &[]).build();
    let x2 = env.app("x", "img", &[]).build();
    let err = assert_err!(
        app_set(&[x1, x2])
            .deploy(
                &env.spec,
                &env.spec_file(),
                backend.clone() as Arc<dyn Backend>,
                &options(2),
                &cancel,
            )
            .await
    );
    assert!(matches!(err, EnvError::ConsistencyError(_)));

    // Dependency neither in the set nor running
    let api = env.app("api", "img", &["ghost"]).build();
    let err = assert_err!(
        app_set(&[api])
            .deploy(
                &env.spec,
                &env.spec_file(),
                backend.clone() as Arc<dyn Backend>,
                &options(2),
                &cancel,
            )
            .await
    );
    assert!(matches!(err, EnvError::ConsistencyError(_)));

    assert_eq!(backend.pull_count(), 0);
    assert_eq!(backend.deploy_count(), 0);

    env.cleanup().await;
}

#[tokio::test]
async fn test_cancellation_unblocks_the_run() {
    let mut env = TestEnv::new("cancel").await;
    let backend = Arc::new(FakeBackend::new().with_deploy_delay(Duration::from_secs(30)));
    let cancel = CancellationToken::new();

    let a = env.app("a", "img", &[]).build();
    let b = env.app("b", "img", &["a"]).build();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = assert_err!(
        tokio::time::timeout(
            Duration::from_secs(5),
            app_set(&[a, b]).deploy(
                &env.spec,
                &env.spec_file(),
                backend.clone() as Arc<dyn Backend>,
                &options(2),
                &cancel,
            ),
        )
        .await
        .expect("deployment ignored cancellation")
    );
    assert!(matches!(
        err.root(),
        EnvError::Cancelled | EnvError::DependencyFailed(_)
    ));

    env.reload().await;
    assert_eq!(status(&env, "a"), Status::NotDeployed);

    env.cleanup().await;
}
