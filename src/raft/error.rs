use thiserror::Error;

use crate::network::NetworkError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Node is not running")]
    NotRunning,

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
