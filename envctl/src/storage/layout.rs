//! State directory layout

use std::path::PathBuf;

use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Where an environment keeps its state
#[derive(Debug, Clone)]
pub struct StateLayout {
    /// Root shared by all environments
    pub base_dir: PathBuf,

    pub env: String,
}

impl StateLayout {
    pub fn new(base_dir: impl Into<PathBuf>, env: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            env: env.into(),
        }
    }

    /// Directory holding everything belonging to this environment
    pub fn env_dir(&self) -> Dir {
        Dir::new(self.base_dir.join(&self.env))
    }

    /// The persisted `Spec` document
    pub fn spec_file(&self) -> File {
        self.env_dir().file("spec.json")
    }

    /// Per-application home, mounted into the application's container
    pub fn app_dir(&self, app: &str) -> Dir {
        self.env_dir().subdir("apps").subdir(app)
    }
}

/// Default state root: `$HOME/.envctl`, or `./.envctl` without a home
pub fn default_base_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".envctl")
}
