//! Client of the management service leader.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwapOption;

use crate::grpc;

/// A client of the management service replicas.
#[tonic::async_trait]
pub trait LeaderClient: Send + Sync + 'static {
    /// The address of the current management service leader.
    fn leader_address(&self) -> Result<String>;

    /// The addresses of all management service replicas.
    fn replicas(&self) -> Vec<String>;

    /// Submit a join request to the management service leader.
    async fn join(&self, req: grpc::JoinReq) -> Result<grpc::JoinResp>;
}

/// A leader client backed by the configured access points.
///
/// The first access point is assumed to be the leader until a request is answered by another.
pub struct MsClient {
    access_points: Vec<String>,
    leader: ArcSwapOption<String>,
}

impl MsClient {
    /// Create a new instance.
    pub fn new(access_points: Vec<String>) -> Self {
        let leader = ArcSwapOption::from(access_points.first().cloned().map(Arc::new));
        Self { access_points, leader }
    }

    async fn join_via(addr: &str, req: grpc::JoinReq) -> Result<grpc::JoinResp> {
        let mut client = grpc::MgmtClient::connect(format!("http://{}", addr))
            .await
            .with_context(|| format!("error connecting to access point {}", addr))?;
        let resp = client
            .join(req)
            .await
            .with_context(|| format!("error from join request to access point {}", addr))?;
        Ok(resp.into_inner())
    }
}

#[tonic::async_trait]
impl LeaderClient for MsClient {
    fn leader_address(&self) -> Result<String> {
        self.leader
            .load_full()
            .map(|addr| addr.as_ref().clone())
            .ok_or_else(|| anyhow!("no management service access points configured"))
    }

    fn replicas(&self) -> Vec<String> {
        self.access_points.clone()
    }

    #[tracing::instrument(level = "debug", skip(self, req), fields(uuid = %req.uuid))]
    async fn join(&self, req: grpc::JoinReq) -> Result<grpc::JoinResp> {
        let current = self.leader_address()?;
        let candidates = std::iter::once(current.clone()).chain(self.access_points.iter().filter(|addr| **addr != current).cloned());
        let mut last_err = None;
        for addr in candidates {
            match Self::join_via(&addr, req.clone()).await {
                Ok(resp) => {
                    if addr != current {
                        tracing::info!(leader = %addr, "management service leader changed");
                        self.leader.store(Some(Arc::new(addr)));
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    tracing::debug!(error = ?err, access_point = %addr, "join attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("no management service access points configured")))
    }
}
