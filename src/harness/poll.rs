use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::harness::Instance;

/// Waits for a set of instances to converge on a predicate.
#[derive(Clone, Copy, Debug)]
pub struct StatePoller {
    interval: Duration,
}

impl StatePoller {
    /// Create a new instance.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Poll the given instances until all satisfy the predicate, the timeout elapses, or the
    /// context is cancelled.
    ///
    /// Elapsing the timeout is not an error; callers observe the final instance states when
    /// building their results. Only cancellation fails.
    pub async fn poll_until<F>(&self, ctx: &CancellationToken, instances: &[Arc<dyn Instance>], predicate: F, timeout: Duration) -> Result<()>
    where
        F: Fn(&dyn Instance) -> bool,
    {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Err(AppError::Cancelled.into()),
                _ = &mut deadline => {
                    tracing::debug!(?timeout, "timed out waiting for instances to converge");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if instances.iter().all(|instance| predicate(instance.as_ref())) {
                        return Ok(());
                    }
                }
            }
        }
    }
}
