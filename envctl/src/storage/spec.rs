//! Persisted environment state

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::deploy::deployment::{DeploymentInfo, Status};
use crate::errors::EnvError;
use crate::filesys::file::File;

/// Last known deployment info of one application.
///
/// Read by any task (dependency checks, health checks), written only by the
/// application's own deployment task.
#[derive(Debug)]
pub struct AppInfo {
    app_type: String,
    info: RwLock<DeploymentInfo>,
}

impl AppInfo {
    fn new(app_type: String, info: DeploymentInfo) -> Self {
        Self {
            app_type,
            info: RwLock::new(info),
        }
    }

    pub fn app_type(&self) -> &str {
        &self.app_type
    }

    /// Snapshot of the current deployment info
    pub fn get(&self) -> DeploymentInfo {
        self.info.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn status(&self) -> Status {
        self.info.read().unwrap_or_else(|e| e.into_inner()).status
    }

    pub fn set(&self, info: DeploymentInfo) {
        *self.info.write().unwrap_or_else(|e| e.into_inner()) = info;
    }

    pub fn set_status(&self, status: Status) {
        self.info.write().unwrap_or_else(|e| e.into_inner()).status = status;
    }

    /// Record under the lock, for persistence
    fn record(&self) -> AppRecord {
        let info = self.info.read().unwrap_or_else(|e| e.into_inner());
        AppRecord {
            app_type: self.app_type.clone(),
            info: info.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AppRecord {
    #[serde(rename = "type")]
    app_type: String,
    #[serde(default)]
    info: DeploymentInfo,
}

#[derive(Debug, Serialize, Deserialize)]
struct SpecDocument {
    #[serde(default)]
    profiles: Vec<String>,
    env: String,
    #[serde(default)]
    apps: BTreeMap<String, AppRecord>,
}

/// Durable root of an environment: its name, the selected profile set and
/// the deployment info of every application ever described in it.
#[derive(Debug)]
pub struct Spec {
    env: String,
    profiles: Vec<String>,
    apps: RwLock<BTreeMap<String, Arc<AppInfo>>>,
}

impl Spec {
    pub fn new(env: impl Into<String>, profiles: Vec<String>) -> Self {
        Self {
            env: env.into(),
            profiles,
            apps: RwLock::new(BTreeMap::new()),
        }
    }

    /// Load the state file if it exists, else start empty. A loaded state
    /// must match the caller's environment and profile set.
    pub async fn load(file: &File, env: &str, profiles: &[String]) -> Result<Self, EnvError> {
        if !file.exists().await {
            debug!("No state file at {}, starting fresh", file.path().display());
            return Ok(Self::new(env, profiles.to_vec()));
        }

        let document: SpecDocument = file.read_json().await?;
        let spec = Self::from_document(document);
        spec.verify(env, profiles)?;

        info!(
            "Loaded state for environment {} with {} apps",
            spec.env,
            spec.len()
        );
        Ok(spec)
    }

    /// Flush the state to disk
    pub async fn save(&self, file: &File) -> Result<(), EnvError> {
        file.write_json(&self.to_document()).await?;
        debug!("Saved state to {}", file.path().display());
        Ok(())
    }

    /// Check the recorded environment and profile set against the current
    /// configuration. Profile order does not matter.
    pub fn verify(&self, env: &str, profiles: &[String]) -> Result<(), EnvError> {
        if self.env != env {
            return Err(EnvError::ConsistencyError(format!(
                "state belongs to environment {:?}, configured environment is {:?}",
                self.env, env
            )));
        }

        let recorded: BTreeSet<&str> = self.profiles.iter().map(String::as_str).collect();
        let requested: BTreeSet<&str> = profiles.iter().map(String::as_str).collect();
        if recorded != requested {
            return Err(EnvError::ConsistencyError(format!(
                "environment {} was created with profiles {:?}, configured profiles are {:?}",
                self.env, self.profiles, profiles
            )));
        }

        Ok(())
    }

    pub fn env(&self) -> &str {
        &self.env
    }

    pub fn profiles(&self) -> &[String] {
        &self.profiles
    }

    /// The single constructor of `AppInfo`. Returns the existing entry for
    /// `name`, or creates an empty one. A name always denotes the same
    /// application type.
    pub fn describe_app(&self, app_type: &str, name: &str) -> Result<Arc<AppInfo>, EnvError> {
        let mut apps = self.apps.write().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = apps.get(name) {
            if existing.app_type != app_type {
                return Err(EnvError::ConsistencyError(format!(
                    "app {} is recorded as type {}, cannot describe it as {}",
                    name, existing.app_type, app_type
                )));
            }
            return Ok(existing.clone());
        }

        let info = Arc::new(AppInfo::new(app_type.to_string(), DeploymentInfo::default()));
        apps.insert(name.to_string(), info.clone());
        Ok(info)
    }

    pub fn get(&self, name: &str) -> Option<Arc<AppInfo>> {
        let apps = self.apps.read().unwrap_or_else(|e| e.into_inner());
        apps.get(name).cloned()
    }

    /// All entries ordered by name
    pub fn apps(&self) -> Vec<(String, Arc<AppInfo>)> {
        let apps = self.apps.read().unwrap_or_else(|e| e.into_inner());
        apps.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.apps.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn from_document(document: SpecDocument) -> Self {
        let apps = document
            .apps
            .into_iter()
            .map(|(name, record)| (name, Arc::new(AppInfo::new(record.app_type, record.info))))
            .collect();

        Self {
            env: document.env,
            profiles: document.profiles,
            apps: RwLock::new(apps),
        }
    }

    fn to_document(&self) -> SpecDocument {
        let apps = self.apps.read().unwrap_or_else(|e| e.into_inner());
        SpecDocument {
            profiles: self.profiles.clone(),
            env: self.env.clone(),
            apps: apps
                .iter()
                .map(|(name, info)| (name.clone(), info.record()))
                .collect(),
        }
    }
}
