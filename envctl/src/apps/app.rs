//! Application descriptor contract

use std::sync::Arc;

use crate::deploy::deployment::Deployment;
use crate::errors::EnvError;
use crate::health::HasInfo;

/// One deployable unit of an environment: a chain node, a database, a
/// relayer, a dashboard...
///
/// `name()` is unique within the environment and `info()` reads the
/// application's `AppInfo` obtained from `Spec::describe_app`.
pub trait App: HasInfo {
    /// Unit type tag, fixed for a given name over the environment's lifetime
    fn app_type(&self) -> &str;

    /// Describe how to run the unit. Called once per orchestration run.
    fn deployment(&self) -> Result<Deployment, EnvError>;
}

/// Ordered collection of applications to orchestrate together
#[derive(Clone, Default)]
pub struct AppSet {
    apps: Vec<Arc<dyn App>>,
}

impl AppSet {
    pub fn new(apps: Vec<Arc<dyn App>>) -> Self {
        Self { apps }
    }

    pub fn push(&mut self, app: Arc<dyn App>) {
        self.apps.push(app);
    }

    pub fn apps(&self) -> &[Arc<dyn App>] {
        &self.apps
    }

    pub fn names(&self) -> Vec<String> {
        self.apps.iter().map(|a| a.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

impl std::fmt::Debug for AppSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppSet").field("apps", &self.names()).finish()
    }
}
