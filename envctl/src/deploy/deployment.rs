//! Deployment descriptors and runtime deployment facts

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::errors::EnvError;
use crate::health::HealthCheckable;

/// Lifecycle status of a deployed unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Never deployed in this environment
    #[default]
    #[serde(rename = "")]
    NotDeployed,

    #[serde(rename = "running")]
    Running,

    #[serde(rename = "stopped")]
    Stopped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::NotDeployed => "not-deployed",
            Status::Running => "running",
            Status::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Runtime facts about a deployed unit. This is what crosses the
/// persistence boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentInfo {
    /// Backend handle, e.g. the container name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,

    /// Host reachable from the machine running envctl
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_from_host: Option<String>,

    /// Host reachable from other units inside the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_from_container: Option<String>,

    #[serde(default)]
    pub status: Status,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Port name to published host port
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ports: BTreeMap<String, u16>,
}

impl DeploymentInfo {
    /// Host-side `host:port` address of a named published port
    pub fn host_address(&self, port_name: &str) -> Option<String> {
        let host = self.host_from_host.as_deref()?;
        let port = self.ports.get(port_name)?;
        Some(format!("{}:{}", host, port))
    }
}

/// A bind mount handed to the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub host: PathBuf,
    pub container: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Produces a value lazily, at the moment the backend starts the unit
pub type Generator<T> = Arc<dyn Fn() -> T + Send + Sync>;

/// Filesystem setup run once, before the first deploy of a unit
pub type PrepareHook = Arc<dyn Fn() -> BoxFuture<'static, Result<(), EnvError>> + Send + Sync>;

/// Invoked once the backend reports where the unit is running
pub type ConfigureHook =
    Arc<dyn Fn(DeploymentInfo) -> BoxFuture<'static, Result<(), EnvError>> + Send + Sync>;

/// Dependencies that must be ready and healthy before a unit is deployed
#[derive(Clone)]
pub struct Prerequisites {
    pub timeout: Duration,
    pub dependencies: Vec<Arc<dyn HealthCheckable>>,
}

impl Prerequisites {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependency(mut self, dependency: Arc<dyn HealthCheckable>) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.dependencies
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }
}

impl Default for Prerequisites {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl fmt::Debug for Prerequisites {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prerequisites")
            .field("timeout", &self.timeout)
            .field("dependencies", &self.names())
            .finish()
    }
}

/// How to run one unit. Built once per orchestration run and not mutated
/// afterwards.
#[derive(Clone)]
pub struct Deployment {
    pub image: String,
    pub args: Generator<Vec<String>>,
    pub env: Generator<BTreeMap<String, String>>,
    pub volumes: Generator<Vec<VolumeMount>>,

    /// Port name to container port
    pub ports: BTreeMap<String, u16>,

    pub prerequisites: Prerequisites,
    pub prepare: Option<PrepareHook>,
    pub configure: Option<ConfigureHook>,

    /// Run with the invoking user's uid/gid instead of the image default
    pub run_as_host_user: bool,
}

impl Deployment {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            args: Arc::new(|| Vec::new()),
            env: Arc::new(|| BTreeMap::new()),
            volumes: Arc::new(|| Vec::new()),
            ports: BTreeMap::new(),
            prerequisites: Prerequisites::default(),
            prepare: None,
            configure: None,
            run_as_host_user: false,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = Arc::new(move || args.clone());
        self
    }

    pub fn with_args_fn(mut self, f: impl Fn() -> Vec<String> + Send + Sync + 'static) -> Self {
        self.args = Arc::new(f);
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Arc::new(move || env.clone());
        self
    }

    pub fn with_volumes(mut self, volumes: Vec<VolumeMount>) -> Self {
        self.volumes = Arc::new(move || volumes.clone());
        self
    }

    pub fn with_port(mut self, name: impl Into<String>, container_port: u16) -> Self {
        self.ports.insert(name.into(), container_port);
        self
    }

    pub fn with_prerequisites(mut self, prerequisites: Prerequisites) -> Self {
        self.prerequisites = prerequisites;
        self
    }

    pub fn with_prepare(mut self, hook: PrepareHook) -> Self {
        self.prepare = Some(hook);
        self
    }

    pub fn with_configure(mut self, hook: ConfigureHook) -> Self {
        self.configure = Some(hook);
        self
    }

    pub fn run_as_host_user(mut self, yes: bool) -> Self {
        self.run_as_host_user = yes;
        self
    }
}

impl fmt::Debug for Deployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deployment")
            .field("image", &self.image)
            .field("ports", &self.ports)
            .field("prerequisites", &self.prerequisites)
            .field("has_prepare", &self.prepare.is_some())
            .field("has_configure", &self.configure.is_some())
            .field("run_as_host_user", &self.run_as_host_user)
            .finish()
    }
}
