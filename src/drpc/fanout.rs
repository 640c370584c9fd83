use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::drpc::DrpcMethod;
use crate::error::AppError;
use crate::harness::Instance;
use crate::models::MemberResult;

const METRIC_DISPATCH_FAILURES: &str = "hadron_mgmt_dispatch_failures_total";
/// Time allowed past the request deadline for instance tasks to report.
const DISPATCH_GRACE: Duration = Duration::from_millis(100);

/// Issues a dRPC method to a set of local instances concurrently.
#[derive(Clone, Debug)]
pub struct FanoutDispatcher {
    timeout: Duration,
}

impl FanoutDispatcher {
    /// Create a new instance.
    pub fn new(timeout: Duration) -> Self {
        metrics::register_counter!(METRIC_DISPATCH_FAILURES, metrics::Unit::Count, "fan-out dispatches which failed to produce a complete result set");
        Self { timeout }
    }

    /// Call the given method on all of the given instances, gathering exactly one result each.
    ///
    /// Results are in completion order. The whole dispatch fails if any instance produces no
    /// result, or if the context is cancelled before all results arrive.
    #[tracing::instrument(level = "debug", skip(self, ctx, instances), fields(instances = instances.len()))]
    pub async fn dispatch(&self, ctx: &CancellationToken, instances: &[Arc<dyn Instance>], method: DrpcMethod) -> Result<Vec<MemberResult>> {
        let deadline = Instant::now() + self.timeout;
        let (tx, mut rx) = mpsc::channel(instances.len().max(1));
        for instance in instances {
            let (instance, tx) = (instance.clone(), tx.clone());
            // In-flight calls are bounded by the deadline, and are left to finish if the caller
            // stops waiting.
            tokio::spawn(async move {
                let res = instance.try_drpc(method, deadline).await;
                let _res = tx.send((instance.index(), res)).await;
            });
        }
        drop(tx);

        let mut outstanding = instances.len();
        let mut results = Vec::with_capacity(outstanding);
        let barrier = tokio::time::sleep_until(deadline + DISPATCH_GRACE);
        tokio::pin!(barrier);
        while outstanding > 0 {
            tokio::select! {
                _ = ctx.cancelled() => return Err(AppError::Cancelled.into()),
                _ = &mut barrier => {
                    return Err(dispatch_failure(format!("{} of {} {} results outstanding past deadline", outstanding, instances.len(), method)));
                }
                msg = rx.recv() => match msg {
                    Some((_, Some(result))) => {
                        outstanding -= 1;
                        results.push(result);
                    }
                    Some((index, None)) => return Err(dispatch_failure(format!("no {} result produced by instance {}", method, index))),
                    None => return Err(dispatch_failure(format!("result channel closed with {} {} results outstanding", outstanding, method))),
                },
            }
        }
        Ok(results)
    }
}

fn dispatch_failure(msg: String) -> anyhow::Error {
    metrics::increment_counter!(METRIC_DISPATCH_FAILURES);
    tracing::error!("{}", msg);
    AppError::DispatchFailure(msg).into()
}
