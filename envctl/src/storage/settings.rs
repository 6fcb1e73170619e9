//! Settings file management

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::errors::EnvError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::storage::layout::default_base_dir;

/// envctl settings, read from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Environment name
    #[serde(default = "default_env")]
    pub env: String,

    /// Selected profile set
    #[serde(default)]
    pub profiles: Vec<String>,

    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default)]
    pub json_logs: bool,

    /// Root of all environment state
    #[serde(default = "default_base_dir")]
    pub state_dir: PathBuf,

    /// Docker CLI executable
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,

    /// Units allowed in the deploy phase at once. Defaults to the CPU count.
    #[serde(default)]
    pub deploy_slots: Option<usize>,

    /// Image pulls allowed at once
    #[serde(default = "default_pull_concurrency")]
    pub pull_concurrency: usize,

    /// Prerequisite timeout for apps that do not declare one
    #[serde(default = "default_prerequisite_timeout_secs")]
    pub default_prerequisite_timeout_secs: u64,
}

fn default_env() -> String {
    "dev".to_string()
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_pull_concurrency() -> usize {
    3
}

fn default_prerequisite_timeout_secs() -> u64 {
    120
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            env: default_env(),
            profiles: Vec::new(),
            log_level: LogLevel::Info,
            json_logs: false,
            state_dir: default_base_dir(),
            docker_bin: default_docker_bin(),
            deploy_slots: None,
            pull_concurrency: default_pull_concurrency(),
            default_prerequisite_timeout_secs: default_prerequisite_timeout_secs(),
        }
    }
}

impl Settings {
    /// Read settings from `file`; a missing file yields the defaults
    pub async fn load(file: &File) -> Result<Self, EnvError> {
        if !file.exists().await {
            return Ok(Self::default());
        }
        let settings: Settings = file.read_json().await?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), EnvError> {
        if self.env.is_empty() {
            return Err(EnvError::ConfigError("env must not be empty".to_string()));
        }
        if self.pull_concurrency == 0 {
            return Err(EnvError::ConfigError(
                "pullConcurrency must be at least 1".to_string(),
            ));
        }
        if self.deploy_slots == Some(0) {
            return Err(EnvError::ConfigError(
                "deploySlots must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective deploy slot count
    pub fn deploy_slots(&self) -> usize {
        self.deploy_slots.unwrap_or_else(cpu_count)
    }
}

/// Logical CPUs on this host, at least 1
pub fn cpu_count() -> usize {
    let mut sys = System::new();
    sys.refresh_cpu_all();
    sys.cpus().len().max(1)
}
