//! Declarative app set manifest

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::apps::app::AppSet;
use crate::apps::container::{ContainerApp, ServiceHandle};
use crate::deploy::deployment::VolumeMount;
use crate::errors::EnvError;
use crate::filesys::file::File;
use crate::health::HealthCheckable;
use crate::storage::layout::StateLayout;
use crate::storage::spec::Spec;

/// One application as declared in the manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppEntry {
    pub name: String,

    #[serde(rename = "type")]
    pub app_type: String,

    pub image: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Port name to container port
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,

    /// Relative host paths are resolved against the app's state directory
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,

    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Prerequisite timeout; falls back to the settings default
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Profiles this app belongs to; empty means every profile
    #[serde(default)]
    pub profiles: Vec<String>,

    #[serde(default)]
    pub run_as_host_user: bool,

    /// Named port dependents probe over TCP before deploying
    #[serde(default)]
    pub health_port: Option<String>,
}

impl AppEntry {
    pub fn is_selected(&self, profiles: &[String]) -> bool {
        self.profiles.is_empty() || self.profiles.iter().any(|p| profiles.contains(p))
    }

    fn validate(&self) -> Result<(), EnvError> {
        if self.name.is_empty() {
            return Err(EnvError::ConfigError("app name must not be empty".to_string()));
        }
        if self.name.contains('/') {
            return Err(EnvError::ConfigError(format!(
                "app name {:?} must not contain '/'",
                self.name
            )));
        }
        if self.app_type.is_empty() {
            return Err(EnvError::ConfigError(format!(
                "app {} has no type",
                self.name
            )));
        }
        if self.image.is_empty() {
            return Err(EnvError::ConfigError(format!(
                "app {} has no image",
                self.name
            )));
        }
        if let Some(port) = &self.health_port {
            if !self.ports.contains_key(port) {
                return Err(EnvError::ConfigError(format!(
                    "app {} probes port {}, which it does not publish",
                    self.name, port
                )));
            }
        }
        Ok(())
    }
}

/// The full catalog of applications an environment may run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub apps: Vec<AppEntry>,
}

impl Manifest {
    pub async fn load(file: &File) -> Result<Self, EnvError> {
        if !file.exists().await {
            return Err(EnvError::ConfigError(format!(
                "manifest {} not found",
                file.path().display()
            )));
        }
        let manifest: Manifest = file.read_json().await?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), EnvError> {
        for entry in &self.apps {
            entry.validate()?;
        }
        Ok(())
    }

    /// Entries selected by the given profile set, in declaration order
    pub fn selected(&self, profiles: &[String]) -> Vec<&AppEntry> {
        self.apps
            .iter()
            .filter(|entry| entry.is_selected(profiles))
            .collect()
    }

    /// Build the app set for the environment described by `spec`.
    ///
    /// Every selected app is described in `spec`. Dependencies resolve to
    /// apps of the set first, then to apps already recorded in `spec`.
    pub fn app_set(
        &self,
        spec: &Spec,
        layout: &StateLayout,
        default_timeout: Duration,
    ) -> Result<AppSet, EnvError> {
        let selected = self.selected(spec.profiles());
        debug!(
            "Selected {} of {} apps for profiles {:?}",
            selected.len(),
            self.apps.len(),
            spec.profiles()
        );

        let mut handles: HashMap<&str, Arc<ServiceHandle>> = HashMap::new();
        let mut infos = Vec::with_capacity(selected.len());
        for entry in selected.iter().copied() {
            let info = spec.describe_app(&entry.app_type, &entry.name)?;
            handles.entry(entry.name.as_str()).or_insert_with(|| {
                Arc::new(ServiceHandle::new(
                    entry.name.clone(),
                    info.clone(),
                    entry.health_port.clone(),
                ))
            });
            infos.push(info);
        }

        let mut set = AppSet::default();
        for (entry, info) in selected.into_iter().zip(infos) {
            let mut dependencies: Vec<Arc<dyn HealthCheckable>> = Vec::new();
            for dep in &entry.depends_on {
                if let Some(handle) = handles.get(dep.as_str()) {
                    dependencies.push(handle.clone());
                } else if let Some(recorded) = spec.get(dep) {
                    let health_port = self
                        .apps
                        .iter()
                        .find(|other| other.name == *dep)
                        .and_then(|other| other.health_port.clone());
                    dependencies.push(Arc::new(ServiceHandle::new(
                        dep.clone(),
                        recorded,
                        health_port,
                    )));
                } else {
                    return Err(EnvError::ConsistencyError(format!(
                        "app {} depends on unknown app {}",
                        entry.name, dep
                    )));
                }
            }

            let timeout = entry
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(default_timeout);

            set.push(Arc::new(ContainerApp::new(
                entry.clone(),
                info,
                layout.app_dir(&entry.name),
                dependencies,
                timeout,
            )));
        }

        Ok(set)
    }
}
