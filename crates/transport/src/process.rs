//! Agent subprocess over stdio pipes.
//!
//! Spawns a long-running agent command with piped stdin/stdout and drains
//! its stderr line-by-line into the logger from a dedicated thread.

use std::io::{self, BufRead, BufReader, BufWriter};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use mirsync_core::protocol::RpcClient;

/// A spawned agent process and its pipe client
pub struct AgentProcess {
    child: Child,
    stderr_thread: Option<JoinHandle<()>>,
}

impl AgentProcess {
    /// Spawn `argv` with piped stdio and connect a framed client to it.
    ///
    /// The command must speak the agent protocol on stdin/stdout. Anything
    /// it writes to stderr is forwarded to the log.
    pub fn spawn(argv: &[String]) -> io::Result<(Self, RpcClient<BufReader<ChildStdout>, BufWriter<ChildStdin>>)> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty agent command"))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        info!(command = %argv.join(" "), pid = child.id(), "agent started");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("agent stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("agent stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("agent stderr unavailable"))?;

        let stderr_thread = thread::Builder::new()
            .name("mirsync-agent-stderr".to_string())
            .spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(line) => debug!(target: "agent", "{line}"),
                        Err(_) => break,
                    }
                }
            })?;

        let client = RpcClient::new(BufReader::new(stdout), BufWriter::new(stdin));
        Ok((
            Self {
                child,
                stderr_thread: Some(stderr_thread),
            },
            client,
        ))
    }

    /// Reap the agent after the client has sent `Shutdown`.
    pub fn wait(mut self) -> io::Result<()> {
        let status = self.child.wait()?;
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("agent exited with {status}")))
        }
    }
}

impl Drop for AgentProcess {
    fn drop(&mut self) {
        // already reaped after a clean wait(); otherwise take it down
        if let Ok(None) = self.child.try_wait() {
            warn!(pid = self.child.id(), "killing agent process");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}
