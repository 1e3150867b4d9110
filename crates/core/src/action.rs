//! Mutation vocabulary applied to the VFS and sent to the remote agent

use bytes::Bytes;

use crate::hash::BlockHash;
use crate::path::SubPath;

/// One remote mutation.
///
/// The mapping destination is carried at the wire layer; actions themselves
/// are keyed by the subpath below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Delete the entry and, for folders, its whole subtree. No-op if absent.
    Remove { sub: SubPath },
    /// Create a directory, or update its permissions if it already is one
    PutDir { sub: SubPath, perms: u32 },
    /// Create an empty regular file (truncating an existing one)
    PutFile { sub: SubPath, perms: u32 },
    /// Create a symlink with the given target
    PutLink { sub: SubPath, target: String },
    /// Update permissions of an existing entry
    SetPerms { sub: SubPath, perms: u32 },
    /// Write one block at offset `index * BLOCK_SIZE`; the final block may be short
    WriteChunk {
        sub: SubPath,
        index: u64,
        hash: BlockHash,
        data: Bytes,
    },
    /// Truncate or extend the file to `size`
    SetSize { sub: SubPath, size: u64 },
}

impl Action {
    #[must_use]
    pub fn sub(&self) -> &SubPath {
        match self {
            Self::Remove { sub }
            | Self::PutDir { sub, .. }
            | Self::PutFile { sub, .. }
            | Self::PutLink { sub, .. }
            | Self::SetPerms { sub, .. }
            | Self::WriteChunk { sub, .. }
            | Self::SetSize { sub, .. } => sub,
        }
    }

    /// Short operation name for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Remove { .. } => "remove",
            Self::PutDir { .. } => "put-dir",
            Self::PutFile { .. } => "put-file",
            Self::PutLink { .. } => "put-link",
            Self::SetPerms { .. } => "set-perms",
            Self::WriteChunk { .. } => "write-chunk",
            Self::SetSize { .. } => "set-size",
        }
    }
}
