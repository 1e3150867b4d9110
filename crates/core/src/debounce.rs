//! Event queue and debouncer.
//!
//! The watcher pushes one batch of paths per notification; the sync thread
//! collects them through [`debounced_recv`], which keeps absorbing batches
//! until the queue has stayed quiet for one debounce window. Editor
//! save-storms thus collapse into a single sync pass.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

/// One watcher notification: possibly duplicated, non-canonical paths
pub type EventBatch = Vec<PathBuf>;

/// Unbounded multi-producer queue of event batches
#[must_use]
pub fn event_queue() -> (Sender<EventBatch>, Receiver<EventBatch>) {
    unbounded()
}

/// Block for the next batch, then absorb follow-up batches until the queue
/// stays empty across a full `debounce` window.
///
/// Returns `None` once every sender is gone and the queue is drained; that
/// is the shutdown signal.
#[must_use]
pub fn debounced_recv(rx: &Receiver<EventBatch>, debounce: Duration) -> Option<EventBatch> {
    let mut acc = rx.recv().ok()?;
    drain_into(rx, &mut acc);
    loop {
        thread::sleep(debounce);
        if !drain_into(rx, &mut acc) {
            return Some(acc);
        }
    }
}

/// Non-blocking drain; `true` if anything was taken
fn drain_into(rx: &Receiver<EventBatch>, acc: &mut EventBatch) -> bool {
    let mut any = false;
    while let Ok(batch) = rx.try_recv() {
        acc.extend(batch);
        any = true;
    }
    any
}
