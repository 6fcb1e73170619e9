//! Poll-until-success executor

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::errors::EnvError;

/// Invoke `check` every `interval` until it succeeds.
///
/// Errors wrapped with [`EnvError::retryable`] schedule another attempt, any
/// other error is returned immediately. Cancelling `cancel` aborts the loop
/// with [`EnvError::Cancelled`]. Callers bound the total wait with
/// `tokio::time::timeout`.
pub async fn retry<T, F, Fut>(
    cancel: &CancellationToken,
    interval: Duration,
    mut check: F,
) -> Result<T, EnvError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EnvError>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(EnvError::Cancelled);
        }

        attempt += 1;
        match check().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                trace!(attempt, "check not passing yet: {}", e);
            }
            Err(e) => return Err(e),
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(EnvError::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
