use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::database::Database;
use crate::drpc::UnixDrpcClient;
use crate::harness::{Harness, Instance, IoInstance};
use crate::membership::Membership;
use crate::mgmt::MgmtSvc;
use crate::msclient::{LeaderClient, MsClient};
use crate::server::{spawn_prom_server, AppServer};

/// The application object for when the management service is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The application's database system.
    _db: Database,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handles of the local instance lifecycle tasks.
    instance_handles: Vec<JoinHandle<Result<()>>>,
    /// The join handle of the client gRPC server.
    client_server: JoinHandle<()>,
    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(10);

        // Initialize this node's storage.
        let db = Database::new(config.clone()).await.context("error opening database")?;
        let leader: Arc<dyn LeaderClient> = Arc::new(MsClient::new(config.access_points.clone()));

        // Spawn the lifecycle tasks of the local instances.
        let mut instances: Vec<Arc<dyn Instance>> = Vec::with_capacity(config.instance_count as usize);
        let mut instance_handles = Vec::with_capacity(config.instance_count as usize);
        for index in 0..config.instance_count {
            let drpc = Arc::new(UnixDrpcClient::new(config.drpc_socket_path(index)));
            let instance = IoInstance::new(index, config.clone(), db.clone(), drpc, leader.clone())
                .await
                .with_context(|| format!("error setting up instance {}", index))?;
            instance_handles.push(instance.clone().spawn(shutdown_tx.clone()));
            instances.push(instance);
        }

        let svc = Arc::new(MgmtSvc::new(config.clone(), Harness::new(instances), Membership::new(), leader));
        let client_server = AppServer::new(config.clone(), svc, shutdown_tx.clone()).spawn();
        let metrics_server = spawn_prom_server(&config, shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            _db: db,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            instance_handles,
            client_server,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("management service is shutting down");
        for (index, handle) in self.instance_handles.into_iter().enumerate() {
            if let Err(err) = handle.await.context("error joining instance lifecycle handle").and_then(|res| res) {
                tracing::error!(index, error = ?err, "error shutting down instance lifecycle");
            }
        }
        if let Err(err) = self.client_server.await {
            tracing::error!(error = ?err, "error joining client gRPC server task");
        }
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }

        tracing::debug!("management service shutdown complete");
        Ok(())
    }
}
