//! Per-image singleflight gate
//!
//! Every distinct image gets one gate. The first task to take the gate checks
//! whether the image is present and pulls it if not; every other task using
//! the same image waits on the gate and then observes the recorded outcome
//! without redoing the work. Pulls across all images share a small
//! concurrency limit.

use std::collections::HashMap;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::deploy::backend::Backend;
use crate::errors::EnvError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum GateState {
    Pending,
    Ready,
    Failed(String),
}

#[derive(Debug)]
struct ImageGate {
    state: Mutex<GateState>,
}

/// Image gates for one orchestration run
#[derive(Debug)]
pub struct ImageCoordinator {
    gates: HashMap<String, ImageGate>,
    pulls: Semaphore,
}

impl ImageCoordinator {
    pub fn new<I, S>(images: I, pull_concurrency: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let gates = images
            .into_iter()
            .map(|image| {
                (
                    image.into(),
                    ImageGate {
                        state: Mutex::new(GateState::Pending),
                    },
                )
            })
            .collect();

        Self {
            gates,
            pulls: Semaphore::new(pull_concurrency.max(1)),
        }
    }

    /// Number of distinct images
    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    /// Make sure `image` is present locally. Runs the presence check and pull
    /// at most once per run; concurrent callers block until it finished.
    pub async fn ensure(
        &self,
        image: &str,
        backend: &dyn Backend,
        cancel: &CancellationToken,
    ) -> Result<(), EnvError> {
        let gate = self
            .gates
            .get(image)
            .ok_or_else(|| EnvError::Internal(format!("no gate registered for image {}", image)))?;

        let mut state = tokio::select! {
            _ = cancel.cancelled() => return Err(EnvError::Cancelled),
            state = gate.state.lock() => state,
        };

        match &*state {
            GateState::Ready => return Ok(()),
            GateState::Failed(message) => {
                return Err(EnvError::ImageError {
                    image: image.to_string(),
                    message: message.clone(),
                })
            }
            GateState::Pending => {}
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(EnvError::Cancelled),
            outcome = self.fetch(image, backend) => outcome,
        };

        match outcome {
            Ok(()) => {
                *state = GateState::Ready;
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                *state = GateState::Failed(message.clone());
                Err(EnvError::ImageError {
                    image: image.to_string(),
                    message,
                })
            }
        }
    }

    async fn fetch(&self, image: &str, backend: &dyn Backend) -> Result<(), EnvError> {
        if backend.image_exists(image).await? {
            debug!("Image {} already present", image);
            return Ok(());
        }

        let _permit = self
            .pulls
            .acquire()
            .await
            .map_err(|e| EnvError::Internal(e.to_string()))?;

        info!("Pulling image {}", image);
        backend.pull_image(image).await?;
        info!("Pulled image {}", image);
        Ok(())
    }
}
