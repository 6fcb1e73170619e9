//! Deployment slot pool

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::errors::EnvError;

/// Bounds how many units are inside the deploy phase at once. Units waiting
/// on images or dependencies do not hold a slot.
#[derive(Debug, Clone)]
pub struct SlotPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

/// Permission to be in the deploy phase; returned to the pool on drop
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

impl SlotPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a free slot or cancellation
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Slot, EnvError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(EnvError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => {
                let permit = permit.map_err(|e| EnvError::Internal(e.to_string()))?;
                Ok(Slot { _permit: permit })
            }
        }
    }
}
