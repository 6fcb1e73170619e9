//! Generic container application built from a manifest entry

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::apps::app::App;
use crate::apps::manifest::AppEntry;
use crate::deploy::deployment::{Deployment, DeploymentInfo, Prerequisites, VolumeMount};
use crate::errors::EnvError;
use crate::filesys::dir::Dir;
use crate::health::{check_running, HasInfo, HealthCheckable};
use crate::storage::spec::AppInfo;

/// Per-probe TCP connect timeout
const PROBE_TIMEOUT_MS: u64 = 500;

/// What dependents hold on to: the recorded state of an application plus,
/// optionally, a named port that must accept TCP connections
pub struct ServiceHandle {
    name: String,
    info: Arc<AppInfo>,
    health_port: Option<String>,
}

impl ServiceHandle {
    pub fn new(name: impl Into<String>, info: Arc<AppInfo>, health_port: Option<String>) -> Self {
        Self {
            name: name.into(),
            info,
            health_port,
        }
    }

    async fn probe(&self, port_name: &str, cancel: &CancellationToken) -> Result<(), EnvError> {
        let info = self.info.get();
        let addr = info.host_address(port_name).ok_or_else(|| {
            EnvError::retryable(EnvError::NotReady(format!(
                "{} has no published {} port",
                self.name, port_name
            )))
        })?;

        let timeout = Duration::from_millis(PROBE_TIMEOUT_MS);
        let connect = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EnvError::Cancelled),
            connect = tokio::time::timeout(timeout, TcpStream::connect(&addr)) => connect,
        };
        match connect {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(EnvError::retryable(EnvError::NotReady(format!(
                "{} at {}: {}",
                self.name, addr, e
            )))),
            Err(_) => Err(EnvError::retryable(EnvError::NotReady(format!(
                "{} at {}: connect timed out",
                self.name, addr
            )))),
        }
    }
}

impl HasInfo for ServiceHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> DeploymentInfo {
        self.info.get()
    }
}

#[async_trait]
impl HealthCheckable for ServiceHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self, cancel: &CancellationToken) -> Result<(), EnvError> {
        check_running(self)?;
        match &self.health_port {
            Some(port) => self.probe(port, cancel).await,
            None => Ok(()),
        }
    }
}

/// A unit declared in the manifest and run from a stock image
pub struct ContainerApp {
    entry: AppEntry,
    info: Arc<AppInfo>,
    app_dir: Dir,
    dependencies: Vec<Arc<dyn HealthCheckable>>,
    timeout: Duration,
}

impl ContainerApp {
    pub fn new(
        entry: AppEntry,
        info: Arc<AppInfo>,
        app_dir: Dir,
        dependencies: Vec<Arc<dyn HealthCheckable>>,
        timeout: Duration,
    ) -> Self {
        Self {
            entry,
            info,
            app_dir,
            dependencies,
            timeout,
        }
    }

    /// Relative host paths live under the app's state directory
    fn resolve_volumes(&self) -> Vec<VolumeMount> {
        self.entry
            .volumes
            .iter()
            .map(|volume| {
                let host = if volume.host.is_absolute() {
                    volume.host.clone()
                } else {
                    self.app_dir.path().join(&volume.host)
                };
                VolumeMount {
                    host,
                    ..volume.clone()
                }
            })
            .collect()
    }
}

impl HasInfo for ContainerApp {
    fn name(&self) -> &str {
        &self.entry.name
    }

    fn info(&self) -> DeploymentInfo {
        self.info.get()
    }
}

impl App for ContainerApp {
    fn app_type(&self) -> &str {
        &self.entry.app_type
    }

    fn deployment(&self) -> Result<Deployment, EnvError> {
        let prerequisites = self
            .dependencies
            .iter()
            .cloned()
            .fold(Prerequisites::new(self.timeout), |p, dep| p.with_dependency(dep));

        let mut deployment = Deployment::new(self.entry.image.clone())
            .with_args(self.entry.args.clone())
            .with_env(self.entry.env.clone())
            .with_volumes(self.resolve_volumes())
            .with_prerequisites(prerequisites)
            .run_as_host_user(self.entry.run_as_host_user);
        for (port_name, container_port) in &self.entry.ports {
            deployment = deployment.with_port(port_name.clone(), *container_port);
        }

        let dir = self.app_dir.clone();
        deployment = deployment.with_prepare(Arc::new(move || {
            let dir = dir.clone();
            async move { dir.create().await }.boxed()
        }));

        let name = self.entry.name.clone();
        deployment = deployment.with_configure(Arc::new(move |info: DeploymentInfo| {
            let name = name.clone();
            async move {
                for port_name in info.ports.keys() {
                    if let Some(addr) = info.host_address(port_name) {
                        info!(app = %name, port = %port_name, "{} reachable at {}", name, addr);
                    }
                }
                Ok::<(), EnvError>(())
            }
            .boxed()
        }));

        Ok(deployment)
    }
}
