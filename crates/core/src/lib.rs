//! mirsync-core: Continuous tree mirroring engine
//!
//! Watches for local changes, computes block-level signatures, diffs them
//! against an in-memory shadow of the remote tree, and streams minimal
//! mutations to a remote agent over a framed duplex pipe.

pub mod action;
pub mod config;
pub mod debounce;
pub mod error;
pub mod exec;
pub mod hash;
pub mod path;
pub mod plan;
pub mod protocol;
pub mod scan;
pub mod sig;
pub mod skip;
pub mod stream;
pub mod sync;
pub mod vfs;

pub use action::Action;
pub use config::MirrorConfig;
pub use error::{RpcError, StreamError, SyncError};
pub use exec::Executor;
pub use hash::{BlockHash, BLOCK_SIZE};
pub use path::{Mapping, SubPath};
pub use protocol::{Remote, RpcClient};
pub use sig::Signature;
pub use skip::SkipPolicy;
pub use sync::{SyncOptions, Syncer};
pub use vfs::Vfs;
