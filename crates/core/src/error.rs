//! Error types, split by how the sync loop reacts to them

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::path::PathError;

/// Transport-level failure. Always fatal: the pipe to the agent can no
/// longer be trusted and the sync loop stops.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc i/o: {0}")]
    Io(#[from] io::Error),

    /// Malformed or unexpected frame
    #[error("rpc protocol: {0}")]
    Protocol(String),

    /// Failure reported by the remote agent
    #[error("remote: {0}")]
    Remote(String),
}

/// Failure while streaming file content. RPC failures bubble up as fatal;
/// local read failures requeue the batch for the next pass.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("content read: {0}")]
    Io(io::Error),
}

/// Top-level synchronizer failure
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Mapping(#[from] PathError),

    #[error("local root {root}: {source}")]
    Root {
        root: PathBuf,
        source: io::Error,
    },

    #[error("failed to start sync thread: {0}")]
    Spawn(io::Error),

    #[error("sync thread panicked")]
    Worker,
}
