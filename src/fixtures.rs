use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use nix::sys::signal::Signal;

use crate::drpc::{DrpcClient, DrpcMethod, DrpcStatus};
use crate::error::AppError;
use crate::grpc;
use crate::harness::{Instance, PhaseGate};
use crate::models::proto::{DaosResp, Response, Superblock};
use crate::models::{MemberState, Rank};
use crate::msclient::LeaderClient;
use crate::utils;

pub const TEST_SYSTEM: &str = "daos_server";

/// Wait until the given condition holds, returning false if it does not within the timeout.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Build a dRPC response carrying the given worker status.
pub fn daos_response(status: i32) -> Result<Response> {
    Ok(Response {
        sequence: 0,
        status: DrpcStatus::Success as i32,
        body: utils::encode_model(&DaosResp { status })?,
    })
}

/// A dRPC client answering pings, which fails until marked ready.
#[derive(Default)]
pub struct MockDrpcClient {
    pub ready: AtomicBool,
    pub calls: AtomicUsize,
}

#[tonic::async_trait]
impl DrpcClient for MockDrpcClient {
    async fn call(&self, method: DrpcMethod, _body: Vec<u8>) -> Result<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.ready.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        match method {
            DrpcMethod::PingRank | DrpcMethod::PrepShutdown => daos_response(0),
            DrpcMethod::Join => Err(anyhow!("join not served by worker")),
        }
    }
}

/// A leader client which answers joins with a fixed response.
pub struct MockLeaderClient {
    pub leader: Option<String>,
    pub replicas: Vec<String>,
    pub join_resp: grpc::JoinResp,
    pub leader_calls: AtomicUsize,
    pub joins: Mutex<Vec<grpc::JoinReq>>,
}

impl MockLeaderClient {
    pub fn new(leader: Option<&str>, replicas: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            leader: leader.map(String::from),
            replicas: replicas.iter().map(|addr| addr.to_string()).collect(),
            join_resp: grpc::JoinResp { status: 0, rank: 7, state: grpc::JoinState::In as i32 },
            leader_calls: AtomicUsize::new(0),
            joins: Mutex::new(vec![]),
        })
    }
}

#[tonic::async_trait]
impl LeaderClient for MockLeaderClient {
    fn leader_address(&self) -> Result<String> {
        self.leader_calls.fetch_add(1, Ordering::SeqCst);
        self.leader.clone().ok_or_else(|| anyhow!("no leader known"))
    }

    fn replicas(&self) -> Vec<String> {
        self.replicas.clone()
    }

    async fn join(&self, req: grpc::JoinReq) -> Result<grpc::JoinResp> {
        self.joins.lock().unwrap_or_else(|err| err.into_inner()).push(req);
        Ok(self.join_resp.clone())
    }
}

/// The behavior of dRPC calls on a mock instance.
#[derive(Clone)]
pub enum DrpcBehavior {
    /// Respond with the given worker status.
    Status(i32),
    /// Fail the call at the transport level.
    Fail(String),
    /// Respond to joins with the given response.
    Join(grpc::JoinResp),
}

/// An in-memory instance whose lifecycle transitions follow signals after a short delay.
pub struct MockInstance {
    index: u32,
    ms_replica: bool,
    state: Arc<Mutex<MemberState>>,
    started: Arc<AtomicBool>,
    superblock: Arc<Mutex<Option<Arc<Superblock>>>>,
    gate: Arc<PhaseGate>,
    transition_delay: Duration,
    drpc: DrpcBehavior,
    drpc_delay: Duration,
    stop_fails: bool,
    signals: Mutex<Vec<Signal>>,
    drpc_calls: Mutex<Vec<DrpcMethod>>,
    pub erased: AtomicBool,
}

impl MockInstance {
    /// A stopped instance carrying the given rank.
    pub fn new(index: u32, rank: Option<u32>) -> Self {
        let superblock = Superblock {
            uuid: format!("00000000-0000-0000-0000-00000000000{}", index),
            system: TEST_SYSTEM.into(),
            rank,
        };
        Self {
            index,
            ms_replica: false,
            state: Arc::new(Mutex::new(MemberState::Stopped)),
            started: Arc::new(AtomicBool::new(false)),
            superblock: Arc::new(Mutex::new(Some(Arc::new(superblock)))),
            gate: Arc::new(PhaseGate::default()),
            transition_delay: Duration::from_millis(20),
            drpc: DrpcBehavior::Status(0),
            drpc_delay: Duration::ZERO,
            stop_fails: false,
            signals: Mutex::new(vec![]),
            drpc_calls: Mutex::new(vec![]),
            erased: AtomicBool::new(false),
        }
    }

    /// A running instance which is ready for dRPC communication.
    pub fn ready(index: u32, rank: u32) -> Self {
        Self::new(index, Some(rank)).with_state(MemberState::Ready, true)
    }

    pub fn with_state(self, state: MemberState, started: bool) -> Self {
        *lock(&self.state) = state;
        self.started.store(started, Ordering::SeqCst);
        self
    }

    pub fn with_system(self, system: &str) -> Self {
        if let Some(superblock) = lock(&self.superblock).as_mut() {
            Arc::make_mut(superblock).system = system.into();
        }
        self
    }

    pub fn without_superblock(self) -> Self {
        *lock(&self.superblock) = None;
        self
    }

    pub fn ms_replica(mut self) -> Self {
        self.ms_replica = true;
        self
    }

    pub fn with_drpc(mut self, behavior: DrpcBehavior) -> Self {
        self.drpc = behavior;
        self
    }

    pub fn with_drpc_delay(mut self, delay: Duration) -> Self {
        self.drpc_delay = delay;
        self
    }

    pub fn with_transition_delay(mut self, delay: Duration) -> Self {
        self.transition_delay = delay;
        self
    }

    pub fn with_stop_failure(mut self) -> Self {
        self.stop_fails = true;
        self
    }

    /// Start the mock lifecycle, which waits on the phase gate of the instance.
    ///
    /// Must be called from within a runtime.
    pub fn build(self) -> Arc<Self> {
        let this = Arc::new(self);
        let mut proceed = this.gate.arm();
        let (state, started, superblock, gate, delay) = (
            this.state.clone(),
            this.started.clone(),
            this.superblock.clone(),
            this.gate.clone(),
            this.transition_delay,
        );
        tokio::spawn(async move {
            while proceed.await.is_ok() {
                tokio::time::sleep(delay).await;
                // The next phase is armed before the transition becomes observable.
                proceed = gate.arm();
                if lock(&superblock).is_none() {
                    *lock(&state) = MemberState::AwaitFormat;
                    continue;
                }
                started.store(true, Ordering::SeqCst);
                *lock(&state) = MemberState::Ready;
            }
        });
        this
    }

    pub fn signals(&self) -> Vec<Signal> {
        lock(&self.signals).clone()
    }

    pub fn drpc_calls(&self) -> Vec<DrpcMethod> {
        lock(&self.drpc_calls).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

#[tonic::async_trait]
impl Instance for MockInstance {
    fn index(&self) -> u32 {
        self.index
    }

    fn rank(&self) -> Result<Rank> {
        lock(&self.superblock).as_ref().and_then(|superblock| superblock.rank).map(Rank).ok_or_else(|| {
            AppError::RankUnavailable {
                index: self.index,
                reason: "no rank assigned".into(),
            }
            .into()
        })
    }

    fn local_state(&self) -> MemberState {
        *lock(&self.state)
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn is_ms_replica(&self) -> bool {
        self.ms_replica
    }

    fn superblock(&self) -> Option<Arc<Superblock>> {
        lock(&self.superblock).clone()
    }

    async fn remove_superblock(&self) -> Result<()> {
        *lock(&self.superblock) = None;
        self.erased.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self, signal: Signal) -> Result<()> {
        lock(&self.signals).push(signal);
        if self.stop_fails {
            return Err(anyhow!("no such process"));
        }
        let (state, started, delay) = (self.state.clone(), self.started.clone(), self.transition_delay);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            *lock(&state) = MemberState::Stopped;
            started.store(false, Ordering::SeqCst);
        });
        Ok(())
    }

    fn proceed(&self) -> Result<()> {
        self.gate.proceed()
    }

    async fn call_drpc(&self, method: DrpcMethod, _body: Vec<u8>) -> Result<Response> {
        lock(&self.drpc_calls).push(method);
        tokio::time::sleep(self.drpc_delay).await;
        match &self.drpc {
            DrpcBehavior::Status(status) => daos_response(*status),
            DrpcBehavior::Fail(msg) => Err(anyhow!("{}", msg)),
            DrpcBehavior::Join(resp) => Ok(Response {
                sequence: 0,
                status: DrpcStatus::Success as i32,
                body: utils::encode_model(resp)?,
            }),
        }
    }
}
