//! Local instance harness.
//!
//! The harness owns the handles of the worker instances running on this host. Handles are
//! shared by all concurrent orchestration operations for the lifetime of the service.

mod gate;
mod instance;
mod poll;
mod process;

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::Signal;
use tokio::time::Instant;

use crate::drpc::{self, DrpcMethod};
use crate::error::AppError;
use crate::models::proto::{Response, Superblock};
use crate::models::{MemberResult, MemberState, Rank};

pub use gate::PhaseGate;
pub use instance::IoInstance;
pub use poll::StatePoller;
pub use process::ProcessRunner;

/// A handle to a local worker instance.
#[tonic::async_trait]
pub trait Instance: Send + Sync + 'static {
    /// The local slot index of this instance.
    fn index(&self) -> u32;

    /// The rank of this instance, failing with `RankUnavailable` if none is assigned.
    fn rank(&self) -> Result<Rank>;

    /// A snapshot of the current lifecycle state of this instance.
    fn local_state(&self) -> MemberState;

    /// Check if the process of this instance is running.
    fn is_started(&self) -> bool;

    /// Check if this instance is ready for dRPC communication.
    fn is_ready(&self) -> bool {
        self.local_state() == MemberState::Ready
    }

    /// Check if this instance is waiting for its storage to be formatted.
    fn is_awaiting_format(&self) -> bool {
        self.local_state() == MemberState::AwaitFormat
    }

    /// Check if this instance hosts a management service replica.
    fn is_ms_replica(&self) -> bool;

    /// The identity record of this instance, if established.
    fn superblock(&self) -> Option<Arc<Superblock>>;

    /// Erase the identity record of this instance.
    async fn remove_superblock(&self) -> Result<()>;

    /// Deliver the given signal to the process of this instance.
    fn stop(&self, signal: Signal) -> Result<()>;

    /// Release this instance into its next lifecycle phase.
    ///
    /// Fails if the instance is not waiting to proceed.
    fn proceed(&self) -> Result<()>;

    /// Call the given dRPC method on this instance.
    async fn call_drpc(&self, method: DrpcMethod, body: Vec<u8>) -> Result<Response>;

    /// Call the given fan-out method on this instance, producing a result for its rank.
    ///
    /// Returns `None` when no rank is available to key a result with.
    async fn try_drpc(&self, method: DrpcMethod, deadline: Instant) -> Option<MemberResult> {
        let rank = match self.rank() {
            Ok(rank) => rank,
            Err(err) => {
                tracing::debug!(index = self.index(), error = ?err, "no rank to return dRPC result for");
                return None;
            }
        };

        // Instances which are not ready for dRPC comms report their local state.
        let state = self.local_state();
        if state != MemberState::Ready {
            return Some(MemberResult::new(rank, None, state));
        }

        let target_state = match method {
            DrpcMethod::PrepShutdown => MemberState::Stopping,
            DrpcMethod::PingRank => MemberState::Ready,
            _ => {
                let err = anyhow!("unsupported dRPC method ({}) for fan-out", method);
                return Some(MemberResult::new(rank, Some(err), MemberState::Errored));
            }
        };
        match tokio::time::timeout_at(deadline, self.call_drpc(method, vec![])).await {
            Ok(res) => Some(drpc::member_result(rank, method, res, target_state)),
            Err(_elapsed) => Some(MemberResult::new(rank, Some(anyhow!("{} dRPC timed out", method)), MemberState::Unresponsive)),
        }
    }
}

/// The collection of local instances managed by this host.
#[derive(Clone)]
pub struct Harness {
    instances: Arc<Vec<Arc<dyn Instance>>>,
}

impl Harness {
    /// Create a new instance.
    pub fn new(instances: Vec<Arc<dyn Instance>>) -> Self {
        Self { instances: Arc::new(instances) }
    }

    /// All local instances, ordered by index.
    pub fn instances(&self) -> &[Arc<dyn Instance>] {
        self.instances.as_slice()
    }

    /// Resolve the given ranks to the local instances which carry them.
    ///
    /// Ranks which are not hosted locally are omitted. Resolution fails as a whole if the rank of
    /// any inspected instance can not be determined.
    pub fn local_instances(&self, ranks: &[u32]) -> Result<Vec<Arc<dyn Instance>>> {
        let requested: BTreeSet<Rank> = ranks.iter().copied().map(Rank).collect();
        let mut found = Vec::with_capacity(self.instances.len());
        for rank in requested {
            for instance in self.instances.iter() {
                let instance_rank = instance.rank().context("error resolving local instances")?;
                if instance_rank != rank {
                    continue; // Requested rank not local.
                }
                found.push(instance.clone());
            }
        }
        Ok(found)
    }

    /// The local instance hosting the management service replica which acts as leader.
    pub fn ms_leader_instance(&self) -> Result<Arc<dyn Instance>> {
        if self.instances.is_empty() {
            return Err(AppError::NoInstances.into());
        }
        self.instances
            .iter()
            .find(|instance| instance.is_ms_replica())
            .cloned()
            .ok_or_else(|| AppError::NotLeader("no local instance hosts a management replica".into()).into())
    }
}
