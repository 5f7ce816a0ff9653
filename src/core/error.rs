use thiserror::Error;

use super::types::RecordInvariantError;

/// Failure talking to the remote Certificate Manager API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Structured error body returned by the API.
    #[error("{code} | {description}")]
    Api { code: i64, description: String },
    /// Non-success status without a structured error body.
    #[error("remote API returned {status}: {body}")]
    Status { status: u16, body: String },
    /// Connection, TLS or timeout failure.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Transport failures abort a whole sync cycle; everything else is
    /// scoped to the request that produced it.
    pub fn is_transport(&self) -> bool {
        matches!(self, RemoteError::Transport(_))
    }

    /// Message surfaced to the host: the remote description verbatim when
    /// the API supplied one.
    pub fn user_message(&self) -> String {
        match self {
            RemoteError::Api { description, .. } => description.clone(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RemoteError::Decode(err.to_string())
        } else {
            RemoteError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{}", .0.join("|"))]
    Invalid(Vec<String>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue put cancelled")]
    Cancelled,
    #[error("queue closed by reader")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync producer failed: {0}")]
    ProducerFault(String),
    #[error("local record lookup failed: {0}")]
    Store(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Record(#[from] RecordInvariantError),
}

/// Failure of a single-certificate operation addressed by host request id.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("invalid request id: {0}")]
    InvalidRequestId(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Record(#[from] RecordInvariantError),
    #[error("Failed to download certificate data from Certificate Manager.")]
    DownloadFailed,
}
