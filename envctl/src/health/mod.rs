//! Health checks gating dependency readiness

pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use crate::deploy::deployment::{DeploymentInfo, Status};
use crate::errors::EnvError;

/// Interval between two probes of the same dependency
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Something dependents can wait on until it is healthy
#[async_trait]
pub trait HealthCheckable: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok` when healthy, a retryable error while coming up, any other
    /// error when it will never become healthy. Probes that block should
    /// give up with [`EnvError::Cancelled`] once `cancel` fires.
    async fn health_check(&self, cancel: &CancellationToken) -> Result<(), EnvError>;
}

/// Entity with a last known deployment state
pub trait HasInfo: Send + Sync {
    fn name(&self) -> &str;
    fn info(&self) -> DeploymentInfo;
}

/// Health check that passes once the entity's recorded status is `running`.
/// Used for dependencies without a protocol level probe.
pub struct IsRunning<T: ?Sized>(pub Arc<T>);

impl<T: HasInfo + ?Sized> IsRunning<T> {
    pub fn new(entity: Arc<T>) -> Self {
        Self(entity)
    }

    pub fn check(&self) -> Result<(), EnvError> {
        check_running(self.0.as_ref())
    }
}

/// Retryable `NotReady` unless the entity is recorded as running
pub fn check_running<T: HasInfo + ?Sized>(entity: &T) -> Result<(), EnvError> {
    let status = entity.info().status;
    if status == Status::Running {
        Ok(())
    } else {
        Err(EnvError::retryable(EnvError::NotReady(format!(
            "{} is {}",
            entity.name(),
            status
        ))))
    }
}

#[async_trait]
impl<T: HasInfo + ?Sized> HealthCheckable for IsRunning<T> {
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn health_check(&self, _cancel: &CancellationToken) -> Result<(), EnvError> {
        self.check()
    }
}

/// Wait for each dependency in turn, polling once per second, until all are
/// healthy. `timeout` bounds the whole sequence; the dependency being polled
/// when it runs out is reported.
pub async fn wait_until_healthy(
    cancel: &CancellationToken,
    timeout: Duration,
    dependencies: &[Arc<dyn HealthCheckable>],
) -> Result<(), EnvError> {
    let deadline = Instant::now() + timeout;
    wait_healthy_until(cancel, deadline, timeout, POLL_INTERVAL, dependencies).await
}

/// Same as [`wait_until_healthy`] against an absolute deadline. `timeout` is
/// only used to report the configured window.
pub async fn wait_healthy_until(
    cancel: &CancellationToken,
    deadline: Instant,
    timeout: Duration,
    interval: Duration,
    dependencies: &[Arc<dyn HealthCheckable>],
) -> Result<(), EnvError> {
    for dependency in dependencies {
        let name = dependency.name().to_string();
        let span = info_span!("health", dependency = %name);

        let wait = retry::retry(cancel, interval, || dependency.health_check(cancel)).instrument(span);
        match tokio::time::timeout_at(deadline, wait).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(EnvError::PrerequisiteTimeout {
                    dependency: name,
                    timeout,
                })
            }
        }
        debug!(dependency = %name, "dependency healthy");
    }

    Ok(())
}
