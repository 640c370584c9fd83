//! Local dRPC channel to worker instances.
//!
//! Each instance listens on a unix socket. Calls and responses are length-delimited protobuf
//! messages: a 4-byte big-endian length followed by the encoded message.

mod fanout;

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{anyhow, bail, ensure, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use crate::models::proto::{Call, DaosResp, Response};
use crate::models::{MemberResult, MemberState, Rank};
use crate::utils;

pub use fanout::FanoutDispatcher;

/// The dRPC module of management methods.
pub const MODULE_MGMT: i32 = 2;
/// The maximum size of a dRPC message.
const MAX_MSG_SIZE: usize = 1 << 24;

/// A dRPC method exposed by worker instances.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DrpcMethod {
    /// Prepare the instance for a controlled shutdown.
    PrepShutdown,
    /// Check that the instance is responsive.
    PingRank,
    /// Forward a join request to the management replica hosted by the instance.
    Join,
}

impl DrpcMethod {
    /// The module of this method.
    pub fn module(&self) -> i32 {
        MODULE_MGMT
    }

    /// The method code within its module.
    pub fn code(&self) -> i32 {
        match self {
            Self::PrepShutdown => 1,
            Self::PingRank => 2,
            Self::Join => 3,
        }
    }
}

impl fmt::Display for DrpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PrepShutdown => "PrepShutdown",
            Self::PingRank => "PingRank",
            Self::Join => "Join",
        };
        f.write_str(name)
    }
}

/// The transport-level status of a dRPC response.
#[allow(dead_code)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrpcStatus {
    Success = 0,
    Submitted = 1,
    Failure = 2,
    UnknownModule = 3,
    UnknownMethod = 4,
    FailedUnmarshalCall = 5,
    FailedUnmarshalPayload = 6,
    FailedMarshal = 7,
}

impl DrpcStatus {
    /// Check if the given raw status is success.
    pub fn is_success(status: i32) -> bool {
        status == Self::Success as i32
    }
}

/// A client of the dRPC channel of a single instance.
#[tonic::async_trait]
pub trait DrpcClient: Send + Sync + 'static {
    /// Call the given method with the given encoded request body.
    async fn call(&self, method: DrpcMethod, body: Vec<u8>) -> Result<Response>;
}

/// A dRPC client over the unix socket of an instance.
///
/// Calls are serialized over a single connection, which is established lazily and
/// re-established after any failed call.
pub struct UnixDrpcClient {
    socket_path: PathBuf,
    sequence: AtomicI64,
    conn: Mutex<Option<UnixStream>>,
}

impl UnixDrpcClient {
    /// Create a new instance.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            sequence: AtomicI64::new(0),
            conn: Mutex::new(None),
        }
    }

    async fn roundtrip(stream: &mut UnixStream, call: &Call) -> Result<Response> {
        let data = utils::encode_model(call)?;
        let len = u32::try_from(data.len()).context("dRPC call too large")?;
        stream.write_all(&len.to_be_bytes()).await.context("error writing dRPC call")?;
        stream.write_all(&data).await.context("error writing dRPC call")?;

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.context("error reading dRPC response")?;
        let len = u32::from_be_bytes(len_buf) as usize;
        ensure!(len <= MAX_MSG_SIZE, "dRPC response of {} bytes exceeds max size {}", len, MAX_MSG_SIZE);
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.context("error reading dRPC response")?;
        utils::decode_model(&buf)
    }
}

#[tonic::async_trait]
impl DrpcClient for UnixDrpcClient {
    #[tracing::instrument(level = "trace", skip(self, body), fields(socket = ?self.socket_path))]
    async fn call(&self, method: DrpcMethod, body: Vec<u8>) -> Result<Response> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let call = Call {
            module: method.module(),
            method: method.code(),
            sequence,
            body,
        };

        let mut conn = self.conn.lock().await;
        let mut stream = match conn.take() {
            Some(stream) => stream,
            None => UnixStream::connect(&self.socket_path)
                .await
                .with_context(|| format!("error connecting to dRPC socket {}", self.socket_path.display()))?,
        };
        let resp = Self::roundtrip(&mut stream, &call).await?;
        *conn = Some(stream);

        if resp.sequence != sequence {
            bail!("dRPC response sequence {} does not match call sequence {}", resp.sequence, sequence);
        }
        Ok(resp)
    }
}

/// Build the result of a fan-out call for the given rank from its dRPC outcome.
pub fn member_result(rank: Rank, method: DrpcMethod, res: Result<Response>, target_state: MemberState) -> MemberResult {
    let resp = match res {
        Ok(resp) => resp,
        Err(err) => return MemberResult::new(rank, Some(err.context(format!("{} dRPC failed", method))), MemberState::Errored),
    };
    if !DrpcStatus::is_success(resp.status) {
        let err = anyhow!("{} dRPC returned status {}", method, resp.status);
        return MemberResult::new(rank, Some(err), MemberState::Errored);
    }
    match utils::decode_model::<DaosResp>(&resp.body) {
        Ok(daos_resp) if daos_resp.status != 0 => {
            let err = anyhow!("{} dRPC returned error status {}", method, daos_resp.status);
            MemberResult::new(rank, Some(err), MemberState::Errored)
        }
        Ok(_) => MemberResult::new(rank, None, target_state),
        Err(err) => MemberResult::new(rank, Some(err.context(format!("error decoding {} response", method))), MemberState::Errored),
    }
}
