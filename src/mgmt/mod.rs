//! Rank orchestration.
//!
//! The management service resolves requested ranks to local instances, drives those instances
//! through their lifecycle, and answers with per-rank results. Operations run concurrently and
//! share the harness, the membership table and the leader client.


use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::Signal;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::drpc::{DrpcMethod, DrpcStatus, FanoutDispatcher};
use crate::error::AppError;
use crate::grpc;
use crate::harness::{Harness, Instance, StatePoller};
use crate::membership::Membership;
use crate::models::{LeaderInfo, Member, MemberResult, MemberState, Rank};
use crate::msclient::LeaderClient;
use crate::utils;

/// The rank orchestration service of this host.
pub struct MgmtSvc {
    config: Arc<Config>,
    harness: Harness,
    membership: Membership,
    leader: Arc<dyn LeaderClient>,
    dispatcher: FanoutDispatcher,
    poller: StatePoller,
}

impl MgmtSvc {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, harness: Harness, membership: Membership, leader: Arc<dyn LeaderClient>) -> Self {
        let dispatcher = FanoutDispatcher::new(config.rank_request_timeout());
        let poller = StatePoller::new(config.poll_interval());
        Self {
            config,
            harness,
            membership,
            leader,
            dispatcher,
            poller,
        }
    }

    /// The system membership table.
    #[cfg(test)]
    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    /// Forward a join request to the local management replica, recording the new membership
    /// state of the joining rank on success.
    ///
    /// The recorded address of the member combines the IP of the connected peer with the port
    /// from the address in the request.
    #[tracing::instrument(level = "debug", skip(self, ctx, req), fields(uuid = %req.uuid, rank = req.rank))]
    pub async fn join(&self, ctx: &CancellationToken, peer: Option<SocketAddr>, req: grpc::JoinReq) -> Result<grpc::JoinResp> {
        let reply_addr = peer_listen_addr(peer, &req.addr).context("error combining peer addr with listener port")?;

        let mi = self.harness.ms_leader_instance()?;
        let body = utils::encode_model(&req)?;
        let dresp = tokio::select! {
            res = mi.call_drpc(DrpcMethod::Join, body) => res?,
            _ = ctx.cancelled() => return Err(AppError::Cancelled.into()),
        };
        if !DrpcStatus::is_success(dresp.status) {
            return Err(anyhow!("join dRPC returned status {}", dresp.status));
        }
        let resp: grpc::JoinResp = utils::decode_model(&dresp.body).context("error decoding join response")?;
        if resp.status != 0 {
            return Ok(resp);
        }

        let rank = Rank(resp.rank);
        let state = match grpc::JoinState::from_i32(resp.state) {
            Some(grpc::JoinState::In) => MemberState::Joined,
            _ => MemberState::Evicted,
        };
        if let Some(existing) = self.membership.get(rank) {
            if existing.uuid != req.uuid {
                tracing::warn!(%rank, uuid = %req.uuid, existing = %existing.uuid, "rank joined with a uuid differing from its member record");
            }
        }
        let (created, old_state) = self.membership.add_or_update(Member::new(rank, req.uuid.clone(), reply_addr, state));
        if created {
            tracing::debug!(%rank, addr = %reply_addr, %state, "new system member");
        } else if let Some(old_state) = old_state {
            tracing::debug!(%rank, addr = %reply_addr, from = %old_state, to = %state, "updated system member");
            if old_state == state {
                tracing::error!(%rank, "unexpected same state in rank {} update ({}->{})", rank, old_state, state);
            }
        }
        Ok(resp)
    }

    /// Prepare the requested local ranks for a controlled shutdown.
    #[tracing::instrument(level = "debug", skip(self, ctx, req), fields(ranks = ?req.ranks))]
    pub async fn prep_shutdown_ranks(&self, ctx: &CancellationToken, req: &grpc::RanksReq) -> Result<Vec<MemberResult>> {
        validate_ranks_request(req)?;
        self.drpc_on_local_ranks(ctx, req, DrpcMethod::PrepShutdown)
            .await
            .context("error sending request over dRPC to local ranks")
    }

    /// Stop the requested local ranks, waiting for their processes to exit.
    ///
    /// Ranks which are not stopped once the request timeout elapses are reported as errored.
    #[tracing::instrument(level = "debug", skip(self, ctx, req), fields(ranks = ?req.ranks, force = req.force))]
    pub async fn stop_ranks(&self, ctx: &CancellationToken, req: &grpc::RanksReq) -> Result<Vec<MemberResult>> {
        validate_ranks_request(req)?;
        let signal = if req.force { Signal::SIGKILL } else { Signal::SIGINT };

        let instances = self.harness.local_instances(&req.ranks)?;
        for instance in instances.iter().filter(|instance| instance.is_started()) {
            instance
                .stop(signal)
                .with_context(|| format!("sending {:?} to instance {}", signal, instance.index()))?;
        }

        self.poller
            .poll_until(ctx, &instances, |instance| !instance.is_started(), self.config.rank_request_timeout())
            .await?;
        Ok(member_state_results(&instances, MemberState::Stopped))
    }

    /// Start the requested local ranks, waiting for them to become ready.
    #[tracing::instrument(level = "debug", skip(self, ctx, req), fields(ranks = ?req.ranks))]
    pub async fn start_ranks(&self, ctx: &CancellationToken, req: &grpc::RanksReq) -> Result<Vec<MemberResult>> {
        validate_ranks_request(req)?;

        let instances = self.harness.local_instances(&req.ranks)?;
        for instance in instances.iter().filter(|instance| !instance.is_started()) {
            if let Err(err) = instance.proceed() {
                tracing::warn!(index = instance.index(), error = ?err, "error releasing instance to start");
            }
        }

        self.poller
            .poll_until(ctx, &instances, |instance| instance.is_ready(), self.config.rank_start_timeout())
            .await?;
        Ok(member_state_results(&instances, MemberState::Ready))
    }

    /// Erase the identity records of the requested local ranks and wait for them to await format.
    ///
    /// All requested instances must be stopped. Results are keyed by the rank each instance held
    /// before its identity record was erased.
    #[tracing::instrument(level = "debug", skip(self, ctx, req), fields(ranks = ?req.ranks))]
    pub async fn reset_format_ranks(&self, ctx: &CancellationToken, req: &grpc::RanksReq) -> Result<Vec<MemberResult>> {
        validate_ranks_request(req)?;

        let instances = self.harness.local_instances(&req.ranks)?;
        let mut saved_ranks = HashMap::with_capacity(instances.len());
        for instance in instances.iter() {
            if instance.is_started() {
                return Err(AppError::InstancesNotStopped {
                    action: "reset format",
                    index: instance.index(),
                }
                .into());
            }
            saved_ranks.insert(instance.index(), instance.rank()?);
        }

        for instance in instances.iter() {
            instance
                .remove_superblock()
                .await
                .with_context(|| format!("error removing superblock of instance {}", instance.index()))?;
            // Release the instance into its await-format phase.
            if let Err(err) = instance.proceed() {
                tracing::warn!(index = instance.index(), error = ?err, "error releasing instance to await format");
            }
        }

        self.poller
            .poll_until(ctx, &instances, |instance| instance.is_awaiting_format(), self.config.rank_start_timeout())
            .await?;

        let mut results = Vec::with_capacity(instances.len());
        for instance in instances.iter() {
            let rank = match saved_ranks.get(&instance.index()) {
                Some(rank) => *rank,
                None => continue,
            };
            let state = instance.local_state();
            let err = (state != MemberState::AwaitFormat).then(|| anyhow!("want {}, got {}", MemberState::AwaitFormat, state));
            results.push(MemberResult::new(rank, err, state));
        }
        Ok(results)
    }

    /// Check the liveness of the requested local ranks.
    #[tracing::instrument(level = "debug", skip(self, ctx, req), fields(ranks = ?req.ranks))]
    pub async fn ping_ranks(&self, ctx: &CancellationToken, req: &grpc::RanksReq) -> Result<Vec<MemberResult>> {
        validate_ranks_request(req)?;
        self.drpc_on_local_ranks(ctx, req, DrpcMethod::PingRank)
            .await
            .context("error sending request over dRPC to local ranks")
    }

    /// Report the current leader and replicas of the management service.
    ///
    /// The requested system is checked against the identity record of the first local instance
    /// which has one, before the leader client is consulted.
    #[tracing::instrument(level = "debug", skip(self, req), fields(sys = %req.sys))]
    pub fn leader_query(&self, req: &grpc::LeaderQueryReq) -> Result<LeaderInfo> {
        let instances = self.harness.instances();
        if instances.is_empty() {
            return Err(AppError::NoInstances.into());
        }
        let superblock = instances.iter().find_map(|instance| instance.superblock()).ok_or(AppError::NoSuperblock)?;
        if req.sys != superblock.system {
            return Err(AppError::WrongSystem {
                local: superblock.system.clone(),
                requested: req.sys.clone(),
            }
            .into());
        }

        let current_leader = self.leader.leader_address().context("failed to determine current leader address")?;
        Ok(LeaderInfo {
            current_leader,
            replicas: self.leader.replicas(),
        })
    }

    async fn drpc_on_local_ranks(&self, ctx: &CancellationToken, req: &grpc::RanksReq, method: DrpcMethod) -> Result<Vec<MemberResult>> {
        let instances = self.harness.local_instances(&req.ranks)?;
        self.dispatcher.dispatch(ctx, &instances, method).await
    }
}

/// Ensure the given request names at least one rank.
fn validate_ranks_request(req: &grpc::RanksReq) -> Result<()> {
    if req.ranks.is_empty() {
        return Err(AppError::InvalidRequest("no ranks specified in request".into()).into());
    }
    Ok(())
}

/// Combine the IP of the connected peer with the port of the given listener address.
fn peer_listen_addr(peer: Option<SocketAddr>, listen_addr: &str) -> Result<SocketAddr> {
    let peer = peer.ok_or_else(|| AppError::AddressResolution("peer details not found in request".into()))?;
    let port = listener_port(listen_addr).ok_or_else(|| AppError::AddressResolution(format!("invalid listener address {:?}", listen_addr)))?;
    Ok(SocketAddr::new(peer.ip(), port))
}

/// Parse the port of a `host:port` address, where an IPv6 host must be bracketed.
fn listener_port(addr: &str) -> Option<u16> {
    let (host, port) = match addr.strip_prefix('[') {
        Some(rest) => {
            let (host, rest) = rest.split_once(']')?;
            (host, rest.strip_prefix(':')?)
        }
        None => {
            let (host, port) = addr.rsplit_once(':')?;
            if host.contains(':') {
                return None;
            }
            (host, port)
        }
    };
    if host.contains(|c: char| c == '[' || c == ']') || port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    port.parse().ok()
}

/// Build results reporting the local state of each instance, errored when it differs from the
/// desired state. Instances without a rank are skipped.
fn member_state_results(instances: &[Arc<dyn Instance>], desired: MemberState) -> Vec<MemberResult> {
    let mut results = Vec::with_capacity(instances.len());
    for instance in instances {
        let rank = match instance.rank() {
            Ok(rank) => rank,
            Err(err) => {
                tracing::debug!(index = instance.index(), error = ?err, "skipping result of instance without rank");
                continue;
            }
        };
        let state = instance.local_state();
        let err = (state != desired).then(|| anyhow!("want {}, got {}", desired, state));
        results.push(MemberResult::new(rank, err, state));
    }
    results
}
