use std::fmt::Display;
use std::future::Future;

use log::error;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, WsError>;

/// Stable classification codes exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    NotFound,
    InvalidArgument,
    FailedPrecondition,
    Unavailable,
    Remote,
    Internal,
    Cancelled,
}

/// Structured failure reported by a node daemon.
///
/// `code` is the daemon's own classification of the failure; the manager
/// never rewrites it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("daemon error ({code:?}): {message}")]
pub struct DaemonError {
    pub code: Code,
    pub message: String,
}

impl DaemonError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum WsError {
    #[error("{0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The daemon executed the request and reported a failure.
    #[error(transparent)]
    Remote(DaemonError),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl WsError {
    pub fn code(&self) -> Code {
        match self {
            Self::NotFound(_) => Code::NotFound,
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::FailedPrecondition(_) => Code::FailedPrecondition,
            Self::Unavailable(_) => Code::Unavailable,
            Self::Remote(_) => Code::Remote,
            Self::Internal(_) => Code::Internal,
            Self::Cancelled => Code::Cancelled,
        }
    }

    /// Log `cause` under the operation name and return an `Internal` error
    /// that only carries `what`.
    pub fn internal<E: Display>(op: &str, what: &str, cause: E) -> Self {
        error!("[{op}] {what}: {cause}");
        Self::Internal(what.to_string())
    }
}

/// Race `fut` against `cancel`. Dropping the losing future aborts any
/// in-flight RPC or poll it owned.
pub async fn or_cancelled<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(WsError::Cancelled),
        res = fut => res,
    }
}
