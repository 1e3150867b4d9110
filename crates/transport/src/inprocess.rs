//! In-process agent over an in-memory duplex pipe.
//!
//! Runs the executor on a local directory in its own thread, connected to
//! the client by paired channel-backed byte streams. Used by tests and for
//! local-to-local mirroring without a subprocess.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};

use mirsync_core::protocol::RpcClient;
use mirsync_core::Executor;

/// One end of an in-memory duplex byte pipe
pub struct PipeStream {
    rx: Receiver<Vec<u8>>,
    tx: Sender<Vec<u8>>,
    pending: Vec<u8>,
}

impl PipeStream {
    /// Create paired streams for bidirectional communication
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = unbounded();
        let (b_tx, b_rx) = unbounded();
        (
            Self {
                rx: a_rx,
                tx: b_tx,
                pending: Vec::new(),
            },
            Self {
                rx: b_rx,
                tx: a_tx,
                pending: Vec::new(),
            },
        )
    }
}

impl Read for PipeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(data) => self.pending = data,
                Err(_) => return Ok(0), // peer gone = EOF
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

impl Write for PipeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// An agent thread serving a local directory over an in-memory pipe
pub struct InProcessAgent {
    handle: Option<JoinHandle<io::Result<()>>>,
}

impl InProcessAgent {
    /// Start the agent and return the client end of the pipe.
    pub fn launch(
        root: impl Into<PathBuf>,
        block_size: usize,
    ) -> (Self, RpcClient<PipeStream, PipeStream>) {
        let (client_side, agent_side) = PipeStream::pair();
        let executor = Executor::with_block_size(root, block_size);
        let handle = thread::spawn(move || {
            let (reader, writer) = split(agent_side);
            mirsync_core::exec::serve(&executor, reader, writer)
        });
        let (reader, writer) = split(client_side);
        (
            Self {
                handle: Some(handle),
            },
            RpcClient::new(reader, writer),
        )
    }

    /// Wait for the agent thread to finish (after the client shuts down or
    /// drops its pipe end).
    pub fn join(mut self) -> io::Result<()> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| io::Error::other("agent thread panicked"))?,
            None => Ok(()),
        }
    }
}

/// Split one duplex stream into independently-owned read and write halves
fn split(stream: PipeStream) -> (PipeStream, PipeStream) {
    let PipeStream { rx, tx, pending } = stream;
    let (dead_tx, _) = unbounded();
    let (_, dead_rx) = unbounded();
    (
        PipeStream {
            rx,
            tx: dead_tx,
            pending,
        },
        PipeStream {
            rx: dead_rx,
            tx,
            pending: Vec::new(),
        },
    )
}
