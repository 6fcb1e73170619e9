//! Error types for envctl

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Phase of an application's rollout in which a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Waiting for the application's image to be present locally
    Image,

    /// Waiting for declared dependencies to become ready and healthy
    Dependencies,

    /// Waiting for a free deployment slot
    Slot,

    /// Prepare hook, backend invocation or configure hook
    Deploy,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Image => "image",
            Stage::Dependencies => "dependency",
            Stage::Slot => "slot",
            Stage::Deploy => "backend",
        };
        f.write_str(s)
    }
}

/// Main error type for envctl
#[derive(Error, Debug)]
pub enum EnvError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Persisted state disagrees with the current configuration, or the
    /// declared app set is malformed
    #[error("Consistency error: {0}")]
    ConsistencyError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Transient condition; retry loops keep polling while they see this
    #[error("{0}")]
    Retryable(Box<EnvError>),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Prerequisite {dependency} did not become healthy within {timeout:?}")]
    PrerequisiteTimeout {
        dependency: String,
        timeout: Duration,
    },

    #[error("Dependency {0} failed to deploy")]
    DependencyFailed(String),

    #[error("Image error ({image}): {message}")]
    ImageError { image: String, message: String },

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Hook error: {0}")]
    HookError(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{app} failed at {stage} stage: {source}")]
    AppFailed {
        app: String,
        stage: Stage,
        #[source]
        source: Box<EnvError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EnvError {
    /// Wrap an error so retry loops treat it as transient
    pub fn retryable(err: impl Into<EnvError>) -> Self {
        EnvError::Retryable(Box::new(err.into()))
    }

    /// Check whether the error asks to be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, EnvError::Retryable(_))
    }

    /// Tag an error with the application and stage it happened in
    pub fn at(self, app: &str, stage: Stage) -> Self {
        EnvError::AppFailed {
            app: app.to_string(),
            stage,
            source: Box::new(self),
        }
    }

    /// Stage of a failed application, if tagged
    pub fn stage(&self) -> Option<Stage> {
        match self {
            EnvError::AppFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Innermost error, skipping stage tags and retry markers
    pub fn root(&self) -> &EnvError {
        match self {
            EnvError::AppFailed { source, .. } => source.root(),
            EnvError::Retryable(inner) => inner.root(),
            other => other,
        }
    }
}

impl From<anyhow::Error> for EnvError {
    fn from(err: anyhow::Error) -> Self {
        EnvError::Internal(err.to_string())
    }
}
