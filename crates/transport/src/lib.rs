//! mirsync-transport: ways to reach a mirsync agent.
//!
//! The engine only needs a duplex byte pipe; this crate provides two:
//! a spawned agent subprocess speaking over stdin/stdout, and an
//! in-process agent thread over an in-memory pipe for tests and
//! local-to-local mirroring.

pub mod inprocess;
pub mod process;

pub use inprocess::InProcessAgent;
pub use process::AgentProcess;
