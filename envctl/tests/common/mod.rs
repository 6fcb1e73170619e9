//! Shared fixtures: an in-memory backend and a configurable test app
#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;

use envctl::apps::app::{App, AppSet};
use envctl::apps::container::ServiceHandle;
use envctl::deploy::backend::Backend;
use envctl::deploy::deployment::{Deployment, DeploymentInfo, Prerequisites, Status};
use envctl::deploy::orchestrator::DeployOptions;
use envctl::errors::EnvError;
use envctl::filesys::dir::Dir;
use envctl::filesys::file::File;
use envctl::health::{HasInfo, HealthCheckable};
use envctl::storage::layout::StateLayout;
use envctl::storage::spec::{AppInfo, Spec};

/// One backend deploy call
#[derive(Debug, Clone)]
pub struct DeployEvent {
    pub name: String,
    pub start: Instant,
    pub end: Instant,
}

/// Backend that keeps everything in memory and records what it was asked
#[derive(Default)]
pub struct FakeBackend {
    present: Mutex<HashSet<String>>,
    failing_apps: Mutex<HashSet<String>>,
    pub fail_pulls: bool,
    pub pull_delay: Duration,
    pub deploy_delay: Duration,

    pub pulls: AtomicUsize,
    active: AtomicUsize,
    pub peak: AtomicUsize,
    events: Mutex<Vec<DeployEvent>>,
    pub stopped: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pull_delay(mut self, delay: Duration) -> Self {
        self.pull_delay = delay;
        self
    }

    pub fn with_deploy_delay(mut self, delay: Duration) -> Self {
        self.deploy_delay = delay;
        self
    }

    pub fn with_failing_pulls(mut self) -> Self {
        self.fail_pulls = true;
        self
    }

    pub fn with_image(self, image: &str) -> Self {
        self.present.lock().unwrap().insert(image.to_string());
        self
    }

    pub fn fail_app(&self, name: &str) {
        self.failing_apps.lock().unwrap().insert(name.to_string());
    }

    pub fn events(&self) -> Vec<DeployEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn event(&self, name: &str) -> Option<DeployEvent> {
        self.events().into_iter().find(|e| e.name == name)
    }

    pub fn deploy_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn image_exists(&self, image: &str) -> Result<bool, EnvError> {
        Ok(self.present.lock().unwrap().contains(image))
    }

    async fn pull_image(&self, image: &str) -> Result<(), EnvError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.pull_delay).await;
        if self.fail_pulls {
            return Err(EnvError::BackendError(format!("manifest for {} not found", image)));
        }
        self.present.lock().unwrap().insert(image.to_string());
        Ok(())
    }

    async fn deploy_container(
        &self,
        name: &str,
        deployment: &Deployment,
    ) -> Result<DeploymentInfo, EnvError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        let start = Instant::now();

        tokio::time::sleep(self.deploy_delay).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(DeployEvent {
            name: name.to_string(),
            start,
            end: Instant::now(),
        });

        if self.failing_apps.lock().unwrap().contains(name) {
            return Err(EnvError::BackendError(format!("{} exited with code 1", name)));
        }

        let ports = deployment
            .ports
            .iter()
            .map(|(port_name, port)| (port_name.clone(), port + 30000))
            .collect::<BTreeMap<_, _>>();
        Ok(DeploymentInfo {
            container: Some(format!("test-{}", name)),
            host_from_host: Some("127.0.0.1".to_string()),
            host_from_container: Some(name.to_string()),
            status: Status::Running,
            depends_on: Vec::new(),
            ports,
        })
    }

    async fn stop(&self, containers: &[String]) -> Result<(), EnvError> {
        self.stopped.lock().unwrap().extend(containers.iter().cloned());
        Ok(())
    }

    async fn remove(&self, containers: &[String]) -> Result<(), EnvError> {
        self.removed.lock().unwrap().extend(containers.iter().cloned());
        Ok(())
    }
}

/// App with an in-memory deployment description
pub struct TestApp {
    name: String,
    image: String,
    info: Arc<AppInfo>,
    dependencies: Vec<Arc<dyn HealthCheckable>>,
    timeout: Duration,
    fail_configure: bool,
    pub prepared: Arc<AtomicUsize>,
}

impl TestApp {
    pub fn prepare_count(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }
}

impl HasInfo for TestApp {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> DeploymentInfo {
        self.info.get()
    }
}

impl App for TestApp {
    fn app_type(&self) -> &str {
        "test"
    }

    fn deployment(&self) -> Result<Deployment, EnvError> {
        let prerequisites = self
            .dependencies
            .iter()
            .cloned()
            .fold(Prerequisites::new(self.timeout), |p, dep| p.with_dependency(dep));

        let prepared = self.prepared.clone();
        let mut deployment = Deployment::new(self.image.clone())
            .with_port("rpc", 8080)
            .with_prerequisites(prerequisites)
            .with_prepare(Arc::new(move || {
                prepared.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), EnvError>(()) }.boxed()
            }));

        if self.fail_configure {
            let name = self.name.clone();
            deployment = deployment.with_configure(Arc::new(move |_info: DeploymentInfo| {
                let name = name.clone();
                async move {
                    Err::<(), EnvError>(EnvError::HookError(format!(
                        "{} rejected its config",
                        name
                    )))
                }
                .boxed()
            }));
        }

        Ok(deployment)
    }
}

/// A temp state directory with a fresh spec
pub struct TestEnv {
    pub root: Dir,
    pub layout: StateLayout,
    pub spec: Spec,
}

impl TestEnv {
    pub async fn new(env: &str) -> Self {
        let root = Dir::create_temp_dir("envctl-it").await.unwrap();
        let layout = StateLayout::new(root.path(), env);
        let spec = Spec::load(&layout.spec_file(), env, &[]).await.unwrap();
        Self { root, layout, spec }
    }

    pub fn spec_file(&self) -> File {
        self.layout.spec_file()
    }

    /// Reload the state from disk, as the next invocation would
    pub async fn reload(&mut self) {
        self.spec = Spec::load(&self.spec_file(), self.spec.env(), &[])
            .await
            .unwrap();
    }

    pub fn app(&self, name: &str, image: &str, deps: &[&str]) -> TestAppBuilder<'_> {
        TestAppBuilder {
            env: self,
            name: name.to_string(),
            image: image.to_string(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            timeout: Duration::from_secs(5),
            fail_configure: false,
            health_port: None,
        }
    }

    pub async fn cleanup(self) {
        self.root.delete().await.unwrap();
    }
}

pub struct TestAppBuilder<'a> {
    env: &'a TestEnv,
    name: String,
    image: String,
    deps: Vec<String>,
    timeout: Duration,
    fail_configure: bool,
    health_port: Option<String>,
}

impl TestAppBuilder<'_> {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Dependencies must also accept TCP connections on this named port
    pub fn probing(mut self, port: &str) -> Self {
        self.health_port = Some(port.to_string());
        self
    }

    pub fn failing_configure(mut self) -> Self {
        self.fail_configure = true;
        self
    }

    pub fn build(self) -> Arc<TestApp> {
        let spec = &self.env.spec;
        let info = spec.describe_app("test", &self.name).unwrap();
        let dependencies = self
            .deps
            .iter()
            .map(|dep| {
                let info = spec.describe_app("test", dep).unwrap();
                Arc::new(ServiceHandle::new(dep.clone(), info, self.health_port.clone()))
                    as Arc<dyn HealthCheckable>
            })
            .collect();

        Arc::new(TestApp {
            name: self.name,
            image: self.image,
            info,
            dependencies,
            timeout: self.timeout,
            fail_configure: self.fail_configure,
            prepared: Arc::new(AtomicUsize::new(0)),
        })
    }
}

pub fn app_set(apps: &[Arc<TestApp>]) -> AppSet {
    AppSet::new(apps.iter().map(|a| a.clone() as Arc<dyn App>).collect())
}

pub fn options(deploy_slots: usize) -> DeployOptions {
    DeployOptions {
        deploy_slots,
        pull_concurrency: 3,
        health_poll_interval: Duration::from_millis(5),
    }
}
