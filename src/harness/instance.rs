use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwapOption;
use nix::sys::signal::Signal;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::database::Database;
use crate::drpc::{DrpcClient, DrpcMethod, DrpcStatus};
use crate::error::{AppError, ShutdownError};
use crate::grpc;
use crate::harness::{Instance, PhaseGate, ProcessRunner};
use crate::models::proto::{Response, Superblock};
use crate::models::{MemberState, Rank, NIL_RANK};
use crate::msclient::LeaderClient;

/// The delay between attempts to join the system.
const JOIN_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// A worker instance running on this host.
///
/// The lifecycle of the instance is driven by a single task, see `spawn`. All other
/// interactions observe the lifecycle through shared state, or release it into its next phase.
pub struct IoInstance {
    index: u32,
    config: Arc<Config>,
    db: Database,
    drpc: Arc<dyn DrpcClient>,
    leader: Arc<dyn LeaderClient>,
    runner: ProcessRunner,
    gate: PhaseGate,
    state: watch::Sender<MemberState>,
    /// A cache of the persisted identity record.
    superblock: ArcSwapOption<Superblock>,
}

impl IoInstance {
    /// Create a new instance, loading its identity record from disk.
    pub async fn new(index: u32, config: Arc<Config>, db: Database, drpc: Arc<dyn DrpcClient>, leader: Arc<dyn LeaderClient>) -> Result<Arc<Self>> {
        let superblock = db
            .get_superblock(index)
            .await
            .with_context(|| format!("error loading superblock of instance {}", index))?;
        let (state, _) = watch::channel(MemberState::Stopped);
        let runner = ProcessRunner::new(&config.instance_binary);
        Ok(Arc::new(Self {
            index,
            config,
            db,
            drpc,
            leader,
            runner,
            gate: PhaseGate::default(),
            state,
            superblock: ArcSwapOption::from(superblock.map(Arc::new)),
        }))
    }

    /// Spawn the lifecycle task of this instance.
    pub fn spawn(self: Arc<Self>, shutdown_tx: broadcast::Sender<()>) -> JoinHandle<Result<()>> {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let res = self.clone().run(shutdown).await;
            if let Err(err) = &res {
                tracing::error!(index = self.index, error = ?err, "instance lifecycle task failed");
                if err.downcast_ref::<ShutdownError>().is_some() {
                    let _res = shutdown_tx.send(());
                }
            }
            res
        })
    }

    #[tracing::instrument(level = "debug", skip(self, shutdown), fields(index = self.index))]
    async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut skip_gate = self.config.auto_start;
        loop {
            // Each phase is armed before the state it waits in becomes observable, and the runner
            // is cleared only once the instance reads as stopped.
            let proceed = (!std::mem::take(&mut skip_gate)).then(|| self.gate.arm());
            self.set_state(MemberState::Stopped);
            self.runner.exited();
            if let Some(proceed) = proceed {
                tokio::select! {
                    _ = proceed => (),
                    _ = shutdown.recv() => break,
                }
            }

            if self.superblock.load().is_none() {
                let proceed = (!self.config.auto_format).then(|| self.gate.arm());
                self.set_state(MemberState::AwaitFormat);
                if let Some(proceed) = proceed {
                    tokio::select! {
                        _ = proceed => (),
                        _ = shutdown.recv() => break,
                    }
                }
                self.create_superblock().await?;
            }

            if self.run_process(&mut shutdown).await {
                break;
            }
        }
        self.set_state(MemberState::Stopped);
        self.runner.exited();
        tracing::debug!(index = self.index, "instance lifecycle task shutting down");
        Ok(())
    }

    /// Run the instance process until it exits, returning `true` if service shutdown was
    /// requested meanwhile. The runner is left for the caller to clear.
    async fn run_process(&self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        let socket = self.config.drpc_socket_path(self.index);
        let envs = [("HADRON_INSTANCE_IDX", self.index.to_string()), ("HADRON_DRPC_SOCKET", socket.to_string_lossy().to_string())];
        let mut child = match self.runner.start(&self.config.instance_args, envs) {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(index = self.index, error = ?err, "error starting instance process");
                return false;
            }
        };
        self.set_state(MemberState::Starting);

        let startup = async {
            self.await_ready().await;
            self.set_state(MemberState::Ready);
            self.join_system().await;
        };
        tokio::pin!(startup);
        let (mut started, mut shutdown_requested) = (false, false);
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = &mut startup, if !started => started = true,
                _ = shutdown.recv(), if !shutdown_requested => {
                    shutdown_requested = true;
                    if let Err(err) = self.runner.signal(Signal::SIGINT) {
                        tracing::warn!(index = self.index, error = ?err, "error interrupting instance process for shutdown");
                    }
                }
            }
        };

        match status {
            Ok(status) => tracing::info!(index = self.index, %status, "instance process exited"),
            Err(err) => tracing::error!(index = self.index, error = ?err, "error awaiting instance process"),
        }
        shutdown_requested
    }

    /// Wait until the instance process answers over dRPC.
    async fn await_ready(&self) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        loop {
            ticker.tick().await;
            match self.drpc.call(DrpcMethod::PingRank, vec![]).await {
                Ok(resp) if DrpcStatus::is_success(resp.status) => return,
                Ok(resp) => tracing::trace!(index = self.index, status = resp.status, "instance not yet ready"),
                Err(err) => tracing::trace!(index = self.index, error = ?err, "instance not yet responsive"),
            }
        }
    }

    /// Join the system, retrying until the leader accepts the request.
    async fn join_system(&self) {
        loop {
            match self.try_join().await {
                Ok(()) => return,
                Err(err) => {
                    tracing::warn!(index = self.index, error = ?err, "error joining system, will retry");
                    tokio::time::sleep(JOIN_RETRY_INTERVAL).await;
                }
            }
        }
    }

    async fn try_join(&self) -> Result<()> {
        let superblock = self.superblock.load_full().context("no superblock to join system with")?;
        let req = grpc::JoinReq {
            sys: superblock.system.clone(),
            uuid: superblock.uuid.clone(),
            rank: superblock.rank.unwrap_or(NIL_RANK),
            uri: self.config.fabric_uri.clone(),
            nctxs: 0,
            addr: self.config.advertise_addr(),
        };
        let resp = self.leader.join(req).await?;
        anyhow::ensure!(resp.status == 0, "join rejected with status {}", resp.status);

        if superblock.rank != Some(resp.rank) {
            let mut updated = superblock.as_ref().clone();
            updated.rank = Some(resp.rank);
            self.db.put_superblock(self.index, &updated).await?;
            self.superblock.store(Some(Arc::new(updated)));
        }
        match grpc::JoinState::from_i32(resp.state) {
            Some(grpc::JoinState::In) => tracing::info!(index = self.index, rank = resp.rank, "instance joined system"),
            _ => tracing::warn!(index = self.index, rank = resp.rank, "instance has been evicted from system"),
        }
        Ok(())
    }

    /// Write a fresh identity record for this instance.
    async fn create_superblock(&self) -> Result<(), ShutdownError> {
        let superblock = Superblock {
            uuid: uuid::Uuid::new_v4().to_string(),
            system: self.config.system_name.clone(),
            rank: None,
        };
        self.db.put_superblock(self.index, &superblock).await?;
        tracing::info!(index = self.index, uuid = %superblock.uuid, "instance superblock created");
        self.superblock.store(Some(Arc::new(superblock)));
        Ok(())
    }

    fn set_state(&self, state: MemberState) {
        let old = self.state.send_replace(state);
        if old != state {
            tracing::debug!(index = self.index, from = %old, to = %state, "instance state changed");
        }
    }
}

#[tonic::async_trait]
impl Instance for IoInstance {
    fn index(&self) -> u32 {
        self.index
    }

    fn rank(&self) -> Result<Rank> {
        let superblock = self.superblock.load_full().ok_or_else(|| AppError::RankUnavailable {
            index: self.index,
            reason: "no superblock".into(),
        })?;
        superblock.rank.map(Rank).ok_or_else(|| {
            AppError::RankUnavailable {
                index: self.index,
                reason: "rank not yet assigned".into(),
            }
            .into()
        })
    }

    fn local_state(&self) -> MemberState {
        *self.state.borrow()
    }

    fn is_started(&self) -> bool {
        self.runner.is_running()
    }

    fn is_ms_replica(&self) -> bool {
        self.config.ms_replica && self.index == 0
    }

    fn superblock(&self) -> Option<Arc<Superblock>> {
        self.superblock.load_full()
    }

    async fn remove_superblock(&self) -> Result<()> {
        self.db.remove_superblock(self.index).await?;
        self.superblock.store(None);
        tracing::info!(index = self.index, "instance superblock removed");
        Ok(())
    }

    fn stop(&self, signal: Signal) -> Result<()> {
        self.runner.signal(signal)
    }

    fn proceed(&self) -> Result<()> {
        self.gate.proceed()
    }

    async fn call_drpc(&self, method: DrpcMethod, body: Vec<u8>) -> Result<Response> {
        self.drpc.call(method, body).await
    }
}
