//! App set orchestrator
//!
//! Turns an unordered set of applications into a dependency respecting,
//! concurrency bounded rollout. One task is spawned per application that is
//! not already running. Each task walks its own dependency list:
//!
//! 1. wait for its image gate,
//! 2. wait for the readiness signal of every dependency, then for their
//!    health checks, both within the prerequisite timeout,
//! 3. take a deployment slot,
//! 4. prepare, start through the backend, configure and record the result,
//! 5. give the slot back and publish its own readiness.
//!
//! A task that fails drops its readiness sender without publishing, which
//! fails its dependents right away. Unrelated branches keep going.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::apps::app::{App, AppSet};
use crate::deploy::backend::Backend;
use crate::deploy::deployment::{Deployment, DeploymentInfo, Status};
use crate::deploy::images::ImageCoordinator;
use crate::deploy::slots::SlotPool;
use crate::errors::{EnvError, Stage};
use crate::filesys::file::File;
use crate::health;
use crate::storage::settings::{cpu_count, Settings};
use crate::storage::spec::{AppInfo, Spec};
use crate::utils::generate_uuid;

/// Knobs of one orchestration run
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Units allowed in the deploy phase at once
    pub deploy_slots: usize,

    /// Image pulls allowed at once
    pub pull_concurrency: usize,

    /// Interval between dependency health probes
    pub health_poll_interval: Duration,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            deploy_slots: cpu_count(),
            pull_concurrency: 3,
            health_poll_interval: health::POLL_INTERVAL,
        }
    }
}

impl From<&Settings> for DeployOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            deploy_slots: settings.deploy_slots(),
            pull_concurrency: settings.pull_concurrency,
            health_poll_interval: health::POLL_INTERVAL,
        }
    }
}

/// Outcome of a successful run
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployReport {
    pub run_id: String,

    /// Deployed by this run, in completion order
    pub deployed: Vec<String>,

    /// Found running and left alone
    pub already_running: Vec<String>,
}

struct Planned {
    app: Arc<dyn App>,
    info: Arc<AppInfo>,
    deployment: Deployment,
    dependencies: Vec<String>,
}

struct AppTask {
    name: String,
    info: Arc<AppInfo>,
    deployment: Deployment,
    dependencies: Vec<(String, watch::Receiver<bool>)>,
    ready: watch::Sender<bool>,
    images: Arc<ImageCoordinator>,
    slots: SlotPool,
    backend: Arc<dyn Backend>,
    health_poll_interval: Duration,
    cancel: CancellationToken,
}

impl AppSet {
    /// Bring every application of the set up, dependencies first.
    ///
    /// Applications already recorded as running count as ready and are not
    /// redeployed. `spec` is flushed to `spec_file` once all tasks settled,
    /// whether or not the run succeeded; the first failure is returned.
    pub async fn deploy(
        &self,
        spec: &Spec,
        spec_file: &File,
        backend: Arc<dyn Backend>,
        options: &DeployOptions,
        cancel: &CancellationToken,
    ) -> Result<DeployReport, EnvError> {
        let run_id = generate_uuid();
        let span = info_span!("deploy", run_id = %run_id, env = %spec.env());

        self.deploy_run(run_id, spec, spec_file, backend, options, cancel)
            .instrument(span)
            .await
    }

    async fn deploy_run(
        &self,
        run_id: String,
        spec: &Spec,
        spec_file: &File,
        backend: Arc<dyn Backend>,
        options: &DeployOptions,
        cancel: &CancellationToken,
    ) -> Result<DeployReport, EnvError> {
        let plan = self.plan(spec)?;

        let mut report = DeployReport {
            run_id,
            ..Default::default()
        };

        let mut senders: HashMap<String, watch::Sender<bool>> = HashMap::new();
        let mut receivers: HashMap<String, watch::Receiver<bool>> = HashMap::new();
        for planned in &plan {
            let name = planned.app.name().to_string();
            let running = planned.info.status() == Status::Running;
            let (tx, rx) = watch::channel(running);
            receivers.insert(name.clone(), rx);
            if running {
                debug!("{} is already running", name);
                report.already_running.push(name);
            } else {
                senders.insert(name, tx);
            }
        }

        let images: BTreeSet<String> = plan
            .iter()
            .filter(|p| senders.contains_key(p.app.name()))
            .map(|p| p.deployment.image.clone())
            .collect();
        let images = Arc::new(ImageCoordinator::new(images, options.pull_concurrency));
        let slots = SlotPool::new(options.deploy_slots);

        info!(
            apps = plan.len(),
            pending = senders.len(),
            images = images.len(),
            slots = slots.size(),
            "Starting deployment"
        );

        let mut tasks = JoinSet::new();
        for planned in plan {
            let name = planned.app.name().to_string();
            let Some(ready) = senders.remove(&name) else {
                continue;
            };

            // Dependencies outside the set were checked to be running
            let dependencies = planned
                .dependencies
                .iter()
                .map(|dep| {
                    let rx = receivers
                        .get(dep)
                        .cloned()
                        .unwrap_or_else(|| watch::channel(true).1);
                    (dep.clone(), rx)
                })
                .collect();

            let task = AppTask {
                name: name.clone(),
                info: planned.info,
                deployment: planned.deployment,
                dependencies,
                ready,
                images: images.clone(),
                slots: slots.clone(),
                backend: backend.clone(),
                health_poll_interval: options.health_poll_interval,
                cancel: cancel.clone(),
            };

            tasks.spawn(run_app(task).instrument(info_span!("app", name = %name)));
        }
        drop(receivers);

        let mut first_error: Option<EnvError> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(EnvError::Internal(e.to_string())));
            match result {
                Ok(name) => report.deployed.push(name),
                Err(e) => {
                    error!("{}", e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        let saved = spec.save(spec_file).await;
        match (first_error, saved) {
            (Some(e), Err(save_err)) => {
                error!("Failed to persist environment state: {}", save_err);
                Err(e)
            }
            (Some(e), Ok(())) => Err(e),
            (None, Err(save_err)) => Err(save_err),
            (None, Ok(())) => {
                info!(
                    deployed = report.deployed.len(),
                    already_running = report.already_running.len(),
                    "Deployment complete"
                );
                Ok(report)
            }
        }
    }

    /// Materialize every deployment once and validate the graph before any
    /// work starts
    fn plan(&self, spec: &Spec) -> Result<Vec<Planned>, EnvError> {
        let mut seen = HashSet::new();
        let mut plan = Vec::with_capacity(self.len());

        for app in self.apps() {
            let name = app.name();
            if !seen.insert(name.to_string()) {
                return Err(EnvError::ConsistencyError(format!(
                    "app {} is declared more than once",
                    name
                )));
            }

            let info = spec.describe_app(app.app_type(), name)?;
            let deployment = app.deployment()?;
            let dependencies = deployment.prerequisites.names();

            plan.push(Planned {
                app: app.clone(),
                info,
                deployment,
                dependencies,
            });
        }

        for planned in &plan {
            for dep in &planned.dependencies {
                if seen.contains(dep) {
                    continue;
                }
                let running = spec
                    .get(dep)
                    .map(|info| info.status() == Status::Running)
                    .unwrap_or(false);
                if !running {
                    return Err(EnvError::ConsistencyError(format!(
                        "app {} depends on {}, which is neither part of the set nor running",
                        planned.app.name(),
                        dep
                    )));
                }
            }
        }

        let edges: BTreeMap<String, Vec<String>> = plan
            .iter()
            .map(|p| {
                let deps = p
                    .dependencies
                    .iter()
                    .filter(|d| seen.contains(*d))
                    .cloned()
                    .collect();
                (p.app.name().to_string(), deps)
            })
            .collect();
        check_acyclic(&edges)?;

        Ok(plan)
    }
}

async fn run_app(task: AppTask) -> Result<String, EnvError> {
    let name = task.name.clone();
    let deployment = &task.deployment;

    debug!(image = %deployment.image, "waiting on image");
    task.images
        .ensure(&deployment.image, task.backend.as_ref(), &task.cancel)
        .await
        .map_err(|e| e.at(&name, Stage::Image))?;

    let prerequisites = &deployment.prerequisites;
    let deadline = Instant::now() + prerequisites.timeout;
    if !task.dependencies.is_empty() {
        debug!(dependencies = ?prerequisites.names(), "waiting on dependencies");
    }
    wait_for_ready(&task.dependencies, deadline, prerequisites.timeout, &task.cancel)
        .await
        .map_err(|e| e.at(&name, Stage::Dependencies))?;
    health::wait_healthy_until(
        &task.cancel,
        deadline,
        prerequisites.timeout,
        task.health_poll_interval,
        &prerequisites.dependencies,
    )
    .await
    .map_err(|e| e.at(&name, Stage::Dependencies))?;

    debug!(free = task.slots.available(), "waiting for a deployment slot");
    let slot = task
        .slots
        .acquire(&task.cancel)
        .await
        .map_err(|e| e.at(&name, Stage::Slot))?;

    info!("Deploying {}", name);
    let result = deploy_unit(&task).await;
    drop(slot);
    let info = result.map_err(|e| e.at(&name, Stage::Deploy))?;

    info!(container = ?info.container, "Deployed {}", name);
    task.ready.send_replace(true);
    Ok(name)
}

async fn wait_for_ready(
    dependencies: &[(String, watch::Receiver<bool>)],
    deadline: Instant,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), EnvError> {
    if dependencies.is_empty() {
        return Ok(());
    }

    let waits = dependencies.iter().map(|(name, rx)| {
        let mut rx = rx.clone();
        let name = name.clone();
        async move {
            rx.wait_for(|ready| *ready)
                .await
                .map(|_| ())
                .map_err(|_| EnvError::DependencyFailed(name))
        }
    });

    tokio::select! {
        _ = cancel.cancelled() => Err(EnvError::Cancelled),
        result = tokio::time::timeout_at(deadline, futures::future::try_join_all(waits)) => {
            match result {
                Ok(ready) => ready.map(|_| ()),
                Err(_) => {
                    let dependency = dependencies
                        .iter()
                        .find(|(_, rx)| !*rx.borrow())
                        .map(|(name, _)| name.clone())
                        .unwrap_or_default();
                    Err(EnvError::PrerequisiteTimeout { dependency, timeout })
                }
            }
        }
    }
}

async fn deploy_unit(task: &AppTask) -> Result<DeploymentInfo, EnvError> {
    let deployment = &task.deployment;

    if task.info.status() == Status::NotDeployed {
        if let Some(prepare) = &deployment.prepare {
            debug!("running prepare hook");
            prepare().await?;
        }
    }

    let mut info = tokio::select! {
        _ = task.cancel.cancelled() => return Err(EnvError::Cancelled),
        info = task.backend.deploy_container(&task.name, deployment) => info?,
    };
    info.status = Status::Running;
    info.depends_on = deployment.prerequisites.names();

    if let Some(configure) = &deployment.configure {
        debug!("running configure hook");
        if let Err(e) = configure(info.clone()).await {
            // Keep the handle so remove can clean the container up; the next
            // run redeploys it
            task.info.set(DeploymentInfo {
                status: Status::Stopped,
                ..info
            });
            return Err(e);
        }
    }

    task.info.set(info.clone());
    Ok(info)
}

/// Reject dependency cycles. `edges` maps every app to the apps of the same
/// set it depends on.
fn check_acyclic(edges: &BTreeMap<String, Vec<String>>) -> Result<(), EnvError> {
    let mut remaining: BTreeMap<&str, usize> = edges
        .iter()
        .map(|(name, deps)| (name.as_str(), deps.len()))
        .collect();

    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (name, deps) in edges {
        for dep in deps {
            dependents.entry(dep.as_str()).or_default().push(name.as_str());
        }
    }

    let mut queue: VecDeque<&str> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut visited = 0;
    while let Some(name) = queue.pop_front() {
        visited += 1;
        for dependent in dependents.get(name).into_iter().flatten() {
            if let Some(count) = remaining.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    queue.push_back(*dependent);
                }
            }
        }
    }

    if visited == edges.len() {
        return Ok(());
    }

    let cycle: Vec<&str> = remaining
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(name, _)| *name)
        .collect();
    Err(EnvError::ConsistencyError(format!(
        "dependency cycle between {}",
        cycle.join(", ")
    )))
}
