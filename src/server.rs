mod prom;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tonic::transport::Server;
use tonic::{Request, Response};

use crate::config::Config;
use crate::error::{AppError, AppErrorExt, RpcResult};
use crate::grpc;
use crate::mgmt::MgmtSvc;

pub use prom::spawn_prom_server;

const METRIC_REQUESTS: &str = "hadron_mgmt_requests_total";

/// Application server.
pub struct AppServer {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The rank orchestration service.
    svc: Arc<MgmtSvc>,
    /// A channel used for triggering graceful shutdown.
    shutdown: broadcast::Sender<()>,
}

impl AppServer {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, svc: Arc<MgmtSvc>, shutdown: broadcast::Sender<()>) -> Self {
        metrics::register_counter!(METRIC_REQUESTS, metrics::Unit::Count, "management requests received by method");
        Self { config, svc, shutdown }
    }

    /// Spawn this controller which also creates the client gRPC server.
    pub fn spawn(self) -> JoinHandle<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.client_port));
        let (shutdown, mut shutdown_rx) = (self.shutdown.clone(), self.shutdown.subscribe());
        let service = grpc::MgmtServer::new(self);
        let fut = Server::builder().add_service(service).serve_with_shutdown(addr, async move {
            let _res = shutdown_rx.recv().await;
        });
        tracing::info!("management gRPC server is listening at {}", addr);
        tokio::spawn(async move {
            if let Err(err) = fut.await {
                tracing::error!(error = ?err, "error from client gRPC server");
            }
            let _res = shutdown.send(());
        })
    }
}

/// Build the context of a single request, cancelled once the returned guard is dropped.
///
/// Tonic drops the handler future when the client goes away, which cancels the context.
fn request_context(method: &'static str) -> (CancellationToken, DropGuard) {
    metrics::increment_counter!(METRIC_REQUESTS, "method" => method);
    let ctx = CancellationToken::new();
    let guard = ctx.clone().drop_guard();
    (ctx, guard)
}

#[tonic::async_trait]
impl grpc::Mgmt for AppServer {
    async fn join(&self, request: Request<grpc::JoinReq>) -> RpcResult<Response<grpc::JoinResp>> {
        let (ctx, _guard) = request_context("join");
        let peer = request.remote_addr();
        let resp = self.svc.join(&ctx, peer, request.into_inner()).await.map_err(AppError::grpc)?;
        Ok(Response::new(resp))
    }

    async fn prep_shutdown_ranks(&self, request: Request<grpc::RanksReq>) -> RpcResult<Response<grpc::RanksResp>> {
        let (ctx, _guard) = request_context("prep_shutdown_ranks");
        let results = self.svc.prep_shutdown_ranks(&ctx, request.get_ref()).await.map_err(AppError::grpc)?;
        Ok(Response::new(grpc::RanksResp::from_results(results)))
    }

    async fn stop_ranks(&self, request: Request<grpc::RanksReq>) -> RpcResult<Response<grpc::RanksResp>> {
        let (ctx, _guard) = request_context("stop_ranks");
        let results = self.svc.stop_ranks(&ctx, request.get_ref()).await.map_err(AppError::grpc)?;
        Ok(Response::new(grpc::RanksResp::from_results(results)))
    }

    async fn start_ranks(&self, request: Request<grpc::RanksReq>) -> RpcResult<Response<grpc::RanksResp>> {
        let (ctx, _guard) = request_context("start_ranks");
        let results = self.svc.start_ranks(&ctx, request.get_ref()).await.map_err(AppError::grpc)?;
        Ok(Response::new(grpc::RanksResp::from_results(results)))
    }

    async fn reset_format_ranks(&self, request: Request<grpc::RanksReq>) -> RpcResult<Response<grpc::RanksResp>> {
        let (ctx, _guard) = request_context("reset_format_ranks");
        let results = self.svc.reset_format_ranks(&ctx, request.get_ref()).await.map_err(AppError::grpc)?;
        Ok(Response::new(grpc::RanksResp::from_results(results)))
    }

    async fn ping_ranks(&self, request: Request<grpc::RanksReq>) -> RpcResult<Response<grpc::RanksResp>> {
        let (ctx, _guard) = request_context("ping_ranks");
        let results = self.svc.ping_ranks(&ctx, request.get_ref()).await.map_err(AppError::grpc)?;
        Ok(Response::new(grpc::RanksResp::from_results(results)))
    }

    async fn leader_query(&self, request: Request<grpc::LeaderQueryReq>) -> RpcResult<Response<grpc::LeaderQueryResp>> {
        let (_ctx, _guard) = request_context("leader_query");
        let info = self.svc.leader_query(request.get_ref()).map_err(AppError::grpc)?;
        Ok(Response::new(info.into()))
    }
}
