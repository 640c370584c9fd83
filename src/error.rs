//! Hadron error abstractions.

use thiserror::Error;
use tonic::Status;

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given request was malformed or empty.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The rank of a local instance could not be determined.
    #[error("rank unavailable for instance {index}: {reason}")]
    RankUnavailable { index: u32, reason: String },
    /// The reply address of a joining instance could not be resolved.
    #[error("error resolving address: {0}")]
    AddressResolution(String),
    /// A fan-out over local instances failed to produce a complete set of results.
    #[error("error dispatching request to local instances: {0}")]
    DispatchFailure(String),
    /// An action requiring stopped instances found a running instance.
    #[error("{action} requires instances to be stopped, instance {index} is still running")]
    InstancesNotStopped { action: &'static str, index: u32 },
    /// No local instances are configured.
    #[error("no local instances configured")]
    NoInstances,
    /// No local instance has an identity record.
    #[error("no local instance superblock found")]
    NoSuperblock,
    /// The request targets a different system than the local one.
    #[error("request for wrong system (local: {local:?}, requested: {requested:?})")]
    WrongSystem { local: String, requested: String },
    /// This host is not acting as the management service leader.
    #[error("this host is not the management service leader: {0}")]
    NotLeader(String),
    /// The operation was cancelled by its caller.
    #[error("operation cancelled")]
    Cancelled,
    /// The server has hit an internal error, but will remain online.
    #[error("internal server error")]
    Ise(anyhow::Error),
}

/// An extension trait for the `AppError`.
pub trait AppErrorExt {
    /// Get the gRPC status code and message for this error.
    fn into_status(self) -> Status;

    /// Translate the given error as an app error and map into a gRPC status object.
    fn grpc(err: anyhow::Error) -> Status;
}

impl AppErrorExt for AppError {
    fn into_status(self) -> Status {
        match self {
            AppError::InvalidRequest(_) | AppError::WrongSystem { .. } | AppError::AddressResolution(_) => Status::invalid_argument(self.to_string()),
            AppError::InstancesNotStopped { .. } => Status::failed_precondition(self.to_string()),
            AppError::RankUnavailable { .. } | AppError::NoInstances | AppError::NoSuperblock | AppError::NotLeader(_) | AppError::DispatchFailure(_) => {
                Status::unavailable(self.to_string())
            }
            AppError::Cancelled => Status::cancelled(self.to_string()),
            AppError::Ise(_) => Status::internal(self.to_string()),
        }
    }

    fn grpc(err: anyhow::Error) -> Status {
        err.downcast::<tonic::Status>()
            .or_else(|err| err.downcast::<Self>().map(Self::into_status))
            .unwrap_or_else(|err| {
                tracing::error!(error = ?err, "internal error handling request");
                Self::Ise(err).into_status()
            })
    }
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;

/// A result type used with the gRPC system.
pub type RpcResult<T> = ::std::result::Result<T, tonic::Status>;
