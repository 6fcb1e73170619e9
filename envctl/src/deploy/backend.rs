//! Deployment backend contract

use async_trait::async_trait;

use crate::deploy::deployment::{Deployment, DeploymentInfo};
use crate::errors::EnvError;

/// Starts, stops and removes units. Owns all process and container
/// mechanics; the orchestrator treats it as opaque.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Whether `image` is already present locally
    async fn image_exists(&self, image: &str) -> Result<bool, EnvError>;

    /// Fetch `image` from its registry
    async fn pull_image(&self, image: &str) -> Result<(), EnvError>;

    /// Start the unit `name` and report where it runs
    async fn deploy_container(
        &self,
        name: &str,
        deployment: &Deployment,
    ) -> Result<DeploymentInfo, EnvError>;

    /// Stop the given containers, keeping them around
    async fn stop(&self, containers: &[String]) -> Result<(), EnvError>;

    /// Delete the given containers and whatever else the backend created
    /// for the environment
    async fn remove(&self, containers: &[String]) -> Result<(), EnvError>;
}
