use thiserror::Error;
use tokio::task::JoinError;

use crate::BlockHash;

/// Errors related to fetching, decoding and caching blocks.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("block {0} not found")]
    NotFound(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("block hash mismatch: expected {expected}, got {actual}")]
    Integrity {
        expected: BlockHash,
        actual: BlockHash,
    },

    #[error("failed to decode block: {0}")]
    Decode(String),

    #[error("download cancelled")]
    Cancelled,

    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Join(#[from] JoinError),
}

impl Error {
    pub(crate) fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

impl From<snap::Error> for Error {
    fn from(value: snap::Error) -> Self {
        Error::Decode(value.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Connection(value.to_string())
    }
}
