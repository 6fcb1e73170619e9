//! Stop, remove and inspect an environment

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

use crate::deploy::backend::Backend;
use crate::deploy::deployment::Status;
use crate::errors::EnvError;
use crate::storage::layout::StateLayout;
use crate::storage::spec::Spec;

/// Stop every running application, mark it stopped and persist the state.
/// Returns the names of the stopped applications.
pub async fn stop(
    spec: &Spec,
    layout: &StateLayout,
    backend: &dyn Backend,
) -> Result<Vec<String>, EnvError> {
    let mut names = Vec::new();
    let mut containers = Vec::new();
    for (name, app) in spec.apps() {
        let info = app.get();
        if info.status != Status::Running {
            continue;
        }
        if let Some(container) = info.container {
            containers.push(container);
        }
        names.push(name);
    }

    if names.is_empty() {
        info!("Nothing to stop in environment {}", spec.env());
        return Ok(names);
    }

    info!("Stopping {} apps in environment {}", names.len(), spec.env());
    backend.stop(&containers).await?;

    for name in &names {
        if let Some(app) = spec.get(name) {
            app.set_status(Status::Stopped);
        }
    }
    spec.save(&layout.spec_file()).await?;

    Ok(names)
}

/// Remove every container the environment ever recorded, then delete the
/// environment's state. Returns the removed container handles.
pub async fn remove(
    spec: &Spec,
    layout: &StateLayout,
    backend: &dyn Backend,
) -> Result<Vec<String>, EnvError> {
    let containers: Vec<String> = spec
        .apps()
        .into_iter()
        .filter_map(|(_, app)| app.get().container)
        .collect();

    info!(
        "Removing {} containers of environment {}",
        containers.len(),
        spec.env()
    );
    backend.remove(&containers).await?;

    layout.spec_file().delete().await?;
    layout.env_dir().delete().await?;

    Ok(containers)
}

/// One row of the environment summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub app_type: String,
    pub status: Status,
    pub container: Option<String>,
    pub endpoints: BTreeMap<String, String>,
    pub depends_on: Vec<String>,
}

/// Summarize the recorded state of every application
pub fn inspect(spec: &Spec) -> Vec<AppSummary> {
    spec.apps()
        .into_iter()
        .map(|(name, app)| {
            let info = app.get();
            let endpoints = info
                .ports
                .keys()
                .filter_map(|port| info.host_address(port).map(|addr| (port.clone(), addr)))
                .collect();
            AppSummary {
                name,
                app_type: app.app_type().to_string(),
                status: info.status,
                container: info.container.clone(),
                endpoints,
                depends_on: info.depends_on.clone(),
            }
        })
        .collect()
}
