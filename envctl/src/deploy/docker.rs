//! Docker deployment backend, driving the docker CLI

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::deploy::backend::Backend;
use crate::deploy::deployment::{Deployment, DeploymentInfo, Status};
use crate::errors::EnvError;

/// Address published ports are bound to on the host
const PUBLISH_HOST: &str = "127.0.0.1";

/// Label carrying the environment name on every container envctl starts
const ENV_LABEL: &str = "envctl.env";

/// Runs every unit of an environment as a container on a per-environment
/// bridge network
#[derive(Debug, Clone)]
pub struct DockerBackend {
    docker_bin: String,
    env: String,
}

impl DockerBackend {
    pub fn new(docker_bin: impl Into<String>, env: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            env: env.into(),
        }
    }

    pub fn network(&self) -> String {
        format!("envctl-{}", self.env)
    }

    pub fn container_name(&self, app: &str) -> String {
        format!("{}-{}", self.env, app)
    }

    fn env_label(&self) -> String {
        format!("{}={}", ENV_LABEL, self.env)
    }

    /// Every container carrying this environment's label, including ones
    /// whose deploy was interrupted before it was recorded
    async fn labeled_containers(&self) -> Result<Vec<String>, EnvError> {
        let filter = format!("label={}", self.env_label());
        let output = self
            .run(&["ps", "-a", "--filter", &filter, "--format", "{{.Names}}"])
            .await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn remove_container(&self, container: &str) -> Result<(), EnvError> {
        match self.run(&["rm", "-f", container]).await {
            Ok(_) => debug!("Removed container {}", container),
            Err(e) if is_missing(&e) => debug!("Container {} already gone", container),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Create the environment's network unless it exists
    pub async fn ensure_network(&self) -> Result<(), EnvError> {
        let network = self.network();
        if self.succeeds(&["network", "inspect", &network]).await? {
            debug!("Network {} already exists", network);
            return Ok(());
        }

        info!("Creating network {}", network);
        self.run(&["network", "create", &network]).await?;
        Ok(())
    }

    /// Run docker and return its stdout, failing on a non-zero exit
    async fn run(&self, args: &[&str]) -> Result<String, EnvError> {
        debug!("{} {}", self.docker_bin, args.join(" "));

        let output = Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                EnvError::BackendError(format!("Failed to run {}: {}", self.docker_bin, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EnvError::BackendError(format!(
                "docker {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run docker and only report whether it exited successfully
    async fn succeeds(&self, args: &[&str]) -> Result<bool, EnvError> {
        let status = Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| {
                EnvError::BackendError(format!("Failed to run {}: {}", self.docker_bin, e))
            })?;
        Ok(status.success())
    }
}

#[async_trait]
impl Backend for DockerBackend {
    async fn image_exists(&self, image: &str) -> Result<bool, EnvError> {
        self.succeeds(&["image", "inspect", image]).await
    }

    async fn pull_image(&self, image: &str) -> Result<(), EnvError> {
        self.run(&["pull", image]).await?;
        Ok(())
    }

    async fn deploy_container(
        &self,
        name: &str,
        deployment: &Deployment,
    ) -> Result<DeploymentInfo, EnvError> {
        let container = self.container_name(name);

        // Leftover from a stopped or failed run
        if let Err(e) = self.remove_container(&container).await {
            warn!("Failed to clear leftover container {}: {}", container, e);
        }

        let user = if deployment.run_as_host_user {
            Some(host_identity().await?)
        } else {
            None
        };

        let args = run_args(
            &container,
            name,
            &self.network(),
            &self.env_label(),
            deployment,
            user,
        );
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args).await?;

        let mut ports = BTreeMap::new();
        for (port_name, container_port) in &deployment.ports {
            let output = self
                .run(&["port", &container, &format!("{}/tcp", container_port)])
                .await?;
            let host_port = parse_port_binding(&output).ok_or_else(|| {
                EnvError::BackendError(format!(
                    "No host binding for port {} of {}: {:?}",
                    container_port,
                    container,
                    output.trim()
                ))
            })?;
            ports.insert(port_name.clone(), host_port);
        }

        Ok(DeploymentInfo {
            container: Some(container),
            host_from_host: Some(PUBLISH_HOST.to_string()),
            host_from_container: Some(name.to_string()),
            status: Status::Running,
            depends_on: Vec::new(),
            ports,
        })
    }

    async fn stop(&self, containers: &[String]) -> Result<(), EnvError> {
        for container in containers {
            match self.run(&["stop", container]).await {
                Ok(_) => debug!("Stopped container {}", container),
                Err(e) if is_missing(&e) => debug!("Container {} already gone", container),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn remove(&self, containers: &[String]) -> Result<(), EnvError> {
        for container in containers {
            self.remove_container(container).await?;
        }

        for container in self.labeled_containers().await? {
            if containers.contains(&container) {
                continue;
            }
            info!("Removing unrecorded container {}", container);
            self.remove_container(&container).await?;
        }

        let network = self.network();
        if self.succeeds(&["network", "inspect", &network]).await? {
            if let Err(e) = self.run(&["network", "rm", &network]).await {
                warn!("Failed to remove network {}: {}", network, e);
            }
        }
        Ok(())
    }
}

/// Arguments of `docker run` for one unit
fn run_args(
    container: &str,
    app: &str,
    network: &str,
    label: &str,
    deployment: &Deployment,
    user: Option<String>,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "-d".into(),
        "--name".into(),
        container.into(),
        "--network".into(),
        network.into(),
        "--network-alias".into(),
        app.into(),
        "--hostname".into(),
        app.into(),
        "--label".into(),
        label.into(),
    ];

    if let Some(user) = user {
        args.push("--user".into());
        args.push(user);
    }

    for container_port in deployment.ports.values() {
        args.push("-p".into());
        args.push(format!("{}::{}", PUBLISH_HOST, container_port));
    }

    for (key, value) in (deployment.env)() {
        args.push("-e".into());
        args.push(format!("{}={}", key, value));
    }

    for volume in (deployment.volumes)() {
        args.push("-v".into());
        let mut spec = format!("{}:{}", volume.host.display(), volume.container);
        if volume.read_only {
            spec.push_str(":ro");
        }
        args.push(spec);
    }

    args.push(deployment.image.clone());
    args.extend((deployment.args)());
    args
}

/// docker's report for a container that does not exist
fn is_missing(err: &EnvError) -> bool {
    matches!(err, EnvError::BackendError(msg) if msg.contains("No such container"))
}

/// First host port of `docker port` output such as `127.0.0.1:49153`
fn parse_port_binding(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit_once(':'))
        .find_map(|(_, port)| port.parse().ok())
}

/// `uid:gid` of the invoking user
async fn host_identity() -> Result<String, EnvError> {
    let uid = id_flag("-u").await?;
    let gid = id_flag("-g").await?;
    Ok(format!("{}:{}", uid, gid))
}

async fn id_flag(flag: &str) -> Result<String, EnvError> {
    let output = Command::new("id")
        .arg(flag)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| EnvError::BackendError(format!("Failed to run id {}: {}", flag, e)))?;
    if !output.status.success() {
        return Err(EnvError::BackendError(format!("id {} failed", flag)));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
