//! Main Crate Error

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::common::Kuid;

#[derive(thiserror::Error, Debug, Clone)]
/// Mojito crate error enum.
///
/// Errors are `Clone` because a single failed operation is observed by every
/// reader of the same [crate::DhtFuture].
pub enum Error {
    /// A request or an operation did not complete in time.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// No response from a specific remote node.
    #[error("{address} ({node_id:?}) did not respond after {elapsed:?}")]
    RequestTimeout {
        node_id: Option<Kuid>,
        address: SocketAddr,
        elapsed: Duration,
    },

    /// The operation was cancelled before it completed.
    #[error("Cancelled")]
    Cancelled,

    #[error(transparent)]
    /// Transparent [std::io::Error]
    Io(Arc<std::io::Error>),

    /// Sending a request to a remote node failed on our side.
    #[error("Request to {address} failed: {reason}")]
    Backend { address: SocketAddr, reason: String },

    /// Another live node is using our node id.
    #[error("Node id {0:?} collides with a live remote node")]
    Collision(Kuid),

    /// Arguments didn't pass validation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Invalid SHA1 urn string or mismatched urn.
    #[error("Invalid urn: {0}")]
    InvalidUrn(String),

    /// An alternate location string could not be parsed.
    #[error("Invalid alternate location: {0}")]
    InvalidLocation(String),

    /// Indicates that the id is not 20 bytes.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// Invalid hex encoding for an id.
    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),

    /// The actor thread or executor backing a handle was shut down.
    #[error("Shut down")]
    Shutdown,
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(Arc::new(error))
    }
}

impl Error {
    /// Returns `true` for both a global timeout and a per-request timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::RequestTimeout { .. })
    }
}
