//! Sync orchestrator.
//!
//! One dedicated thread owns the event queue consumer, the per-mapping VFS
//! shadows, and the RPC writer, so every VFS mutation and wire write is
//! serialized without locking. The watcher (any producer) pushes path
//! batches; the loop debounces them, scans, plans, and executes.

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::debounce::{debounced_recv, event_queue, EventBatch};
use crate::error::{RpcError, StreamError, SyncError};
use crate::hash::BLOCK_SIZE;
use crate::path::{self, Mapping, SubPath};
use crate::plan::{self, Diff};
use crate::protocol::Remote;
use crate::scan::Scanner;
use crate::skip::{SkipFilter, SkipPolicy};
use crate::stream;
use crate::vfs::{Node, Vfs};

/// Ack barrier cadence for metadata actions
pub const DRAIN_EVERY_ACTIONS: usize = 1000;

/// Tuning knobs for a [`Syncer`]
pub struct SyncOptions {
    /// Quiet window the debouncer waits for before starting a pass
    pub debounce: Duration,
    /// Paths excluded from synchronization
    pub skip: SkipPolicy,
    /// Content block size; tests use small blocks
    pub block_size: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            skip: SkipPolicy::default(),
            block_size: BLOCK_SIZE,
        }
    }
}

/// Fired whenever the event queue is empty at the end of a pass
pub type CompletionHook = Box<dyn Fn() + Send>;

/// Handle to a running synchronizer
pub struct Syncer {
    events: Sender<EventBatch>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<(), SyncError>>>,
}

impl Syncer {
    /// Start the sync thread: full remote scans, then the debounce loop.
    pub fn spawn<T: Remote + 'static>(
        remote: T,
        mappings: Vec<Mapping>,
        opts: SyncOptions,
        on_complete: CompletionHook,
    ) -> Result<Self, SyncError> {
        // canonicalize before the disjointness check, so lexically distinct
        // spellings (or symlinks) of the same directory cannot slip through
        let mappings = mappings
            .into_iter()
            .map(|mut m| {
                m.local_root = fs::canonicalize(&m.local_root).map_err(|source| {
                    SyncError::Root {
                        root: m.local_root.clone(),
                        source,
                    }
                })?;
                Ok(m)
            })
            .collect::<Result<Vec<_>, SyncError>>()?;
        path::validate_mappings(&mappings)?;

        let (tx, rx) = event_queue();
        let running = Arc::new(AtomicBool::new(true));

        let states = mappings
            .into_iter()
            .map(|mapping| MappingState {
                skip: opts.skip.compile(&mapping.local_root),
                vfs: Vfs::with_block_size(opts.block_size),
                mapping,
            })
            .collect();
        let worker = SyncWorker {
            remote,
            mappings: states,
            rx,
            tx: tx.clone(),
            running: Arc::clone(&running),
            on_complete,
            debounce: opts.debounce,
            scanner: Scanner::with_block_size(opts.block_size),
        };

        let handle = thread::Builder::new()
            .name("mirsync-sync".to_string())
            .spawn(move || worker.run())
            .map_err(SyncError::Spawn)?;

        Ok(Self {
            events: tx,
            running,
            handle: Some(handle),
        })
    }

    /// Producer handle for the watcher
    #[must_use]
    pub fn events(&self) -> Sender<EventBatch> {
        self.events.clone()
    }

    /// Stop the loop, join the thread, and surface any fatal error.
    pub fn close(mut self) -> Result<(), SyncError> {
        self.signal_stop();
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| SyncError::Worker)?,
            None => Ok(()),
        }
    }

    fn signal_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        // wake the debouncer; an empty batch syncs nothing
        let _ = self.events.send(Vec::new());
    }
}

impl Drop for Syncer {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.signal_stop();
        }
    }
}

struct MappingState {
    mapping: Mapping,
    vfs: Vfs,
    skip: SkipFilter,
}

struct SyncWorker<T: Remote> {
    remote: T,
    mappings: Vec<MappingState>,
    rx: Receiver<EventBatch>,
    tx: Sender<EventBatch>,
    running: Arc<AtomicBool>,
    on_complete: CompletionHook,
    debounce: Duration,
    scanner: Scanner,
}

impl<T: Remote> SyncWorker<T> {
    fn run(mut self) -> Result<(), SyncError> {
        let result = self.run_loop();
        if result.is_err() {
            (self.on_complete)();
        }
        // every exit path asks the agent to leave on its own
        let _ = self.remote.shutdown();
        result
    }

    fn run_loop(&mut self) -> Result<(), SyncError> {
        self.initial_scan()?;
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Ok(());
            }
            let Some(batch) = debounced_recv(&self.rx, self.debounce) else {
                return Ok(());
            };
            if !self.running.load(Ordering::SeqCst) {
                return Ok(());
            }
            if let Err(fatal) = self.sync_pass(&batch) {
                warn!(error = %fatal, "transport failed; stopping sync loop");
                return Err(SyncError::Rpc(fatal));
            }
            if self.rx.is_empty() {
                (self.on_complete)();
            }
        }
    }

    /// Seed each VFS from the remote and enqueue every local directory so
    /// the first pass diffs the whole tree.
    fn initial_scan(&mut self) -> Result<(), SyncError> {
        for state in &mut self.mappings {
            let listing = self.remote.full_scan(&state.mapping.remote_dest)?;
            info!(
                root = %state.mapping.local_root.display(),
                remote_entries = listing.len(),
                "initial remote scan"
            );
            for (sub, sig) in &listing {
                state.vfs.insert_listing(sub, sig);
            }

            let mut dirs = Vec::new();
            collect_local_dirs(
                &state.mapping.local_root,
                &state.mapping.local_root,
                &state.skip,
                &mut dirs,
            );
            let _ = self.tx.send(dirs);
        }
        Ok(())
    }

    /// One SYNCING pass over every mapping. Returns the fatal transport
    /// error, if any; recoverable failures requeue the batch and move on to
    /// the next mapping.
    fn sync_pass(&mut self, batch: &[PathBuf]) -> Result<(), RpcError> {
        for i in 0..self.mappings.len() {
            let subs = {
                let state = &self.mappings[i];
                candidate_subs(&state.mapping, &state.vfs, &state.skip, batch)
            };
            if subs.is_empty() {
                continue;
            }
            debug!(
                root = %self.mappings[i].mapping.local_root.display(),
                candidates = subs.len(),
                "sync pass"
            );

            let pairs = self
                .scanner
                .compute_signatures(&self.mappings[i].mapping.local_root, &subs);
            let diffs = plan::diff(pairs, &self.mappings[i].vfs);
            if diffs.is_empty() {
                continue;
            }

            let state = &mut self.mappings[i];
            match execute_mapping(&mut self.remote, state, &diffs) {
                Ok(()) => {}
                Err(StreamError::Rpc(e)) => {
                    let _ = self.tx.send(batch.to_vec());
                    return Err(e);
                }
                Err(StreamError::Io(e)) => {
                    warn!(
                        root = %state.mapping.local_root.display(),
                        error = %e,
                        "sync pass failed; requeueing batch"
                    );
                    let _ = self.tx.send(batch.to_vec());
                }
            }
        }
        Ok(())
    }
}

/// Send the metadata actions, then stream content, with ack barriers after
/// every 1000 actions and at each phase end. Each action reaches the wire
/// strictly before the shadow tree records it.
fn execute_mapping<T: Remote>(
    remote: &mut T,
    state: &mut MappingState,
    diffs: &[Diff],
) -> Result<(), StreamError> {
    let dest = &state.mapping.remote_dest;

    let mut actions = 0usize;
    for diff in diffs {
        for action in plan::metadata_actions(diff) {
            remote.send(dest, &action)?;
            state.vfs.apply(&action);
            actions += 1;
            if actions % DRAIN_EVERY_ACTIONS == 0 {
                remote.drain()?;
            }
        }
    }
    remote.drain()?;

    stream::stream_files(
        &state.mapping.local_root,
        dest,
        diffs,
        &mut state.vfs,
        remote,
    )?;
    remote.drain()?;
    Ok(())
}

/// Turn an event batch into the candidate set for one mapping.
///
/// Paths are canonicalized (lexically when they no longer exist), filtered
/// to the mapping root minus skipped paths, and every candidate that is a
/// directory locally or a folder in the shadow contributes its children
/// from both sides. That expansion makes a single event on a moved or
/// deleted subtree reach every affected entry, and makes the initial
/// all-directories enqueue cover every path. Ancestors of each event path
/// are candidates too (without expansion), so a lone event deep inside a
/// fresh subtree still creates the missing parent folders first.
fn candidate_subs(
    mapping: &Mapping,
    vfs: &Vfs,
    skip: &SkipFilter,
    batch: &[PathBuf],
) -> Vec<SubPath> {
    let root = &mapping.local_root;
    let mut seen = BTreeSet::new();
    let mut expanded = BTreeSet::new();
    let mut queue = VecDeque::new();

    for raw in batch {
        let abs = normalize_event_path(raw);
        let Ok(rel) = abs.strip_prefix(root) else {
            continue;
        };
        if skip.matches(&abs, root) {
            continue;
        }
        let Ok(sub) = SubPath::from_rel(rel) else {
            continue;
        };
        let mut ancestor = sub.parent();
        while let Some(anc) = ancestor {
            if anc.is_root() {
                break;
            }
            ancestor = anc.parent();
            seen.insert(anc);
        }
        seen.insert(sub.clone());
        if expanded.insert(sub.clone()) {
            queue.push_back(sub);
        }
    }

    while let Some(sub) = queue.pop_front() {
        let abs = sub.resolve_under(root);

        let local_is_dir = fs::symlink_metadata(&abs)
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if local_is_dir {
            if let Ok(entries) = fs::read_dir(&abs) {
                for entry in entries.flatten() {
                    let Ok(name) = entry.file_name().into_string() else {
                        continue;
                    };
                    enqueue_child(&sub, name, root, skip, &mut seen, &mut expanded, &mut queue);
                }
            }
        }

        if let Some(Node::Folder { children, .. }) = vfs.resolve(&sub) {
            for name in children.keys() {
                enqueue_child(
                    &sub,
                    name.clone(),
                    root,
                    skip,
                    &mut seen,
                    &mut expanded,
                    &mut queue,
                );
            }
        }
    }

    seen.into_iter().collect()
}

fn enqueue_child(
    parent: &SubPath,
    name: String,
    root: &Path,
    skip: &SkipFilter,
    seen: &mut BTreeSet<SubPath>,
    expanded: &mut BTreeSet<SubPath>,
    queue: &mut VecDeque<SubPath>,
) {
    let child = parent.child(name);
    if skip.matches(&child.resolve_under(root), root) {
        return;
    }
    seen.insert(child.clone());
    if expanded.insert(child.clone()) {
        queue.push_back(child);
    }
}

/// Canonicalize if the path still exists; otherwise clean it lexically so
/// deleted paths still match their mapping root.
fn normalize_event_path(path: &Path) -> PathBuf {
    if let Ok(real) = fs::canonicalize(path) {
        return real;
    }
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// Depth-first listing of every directory under `root`, including `root`
fn collect_local_dirs(abs: &Path, root: &Path, skip: &SkipFilter, out: &mut Vec<PathBuf>) {
    out.push(abs.to_path_buf());
    let Ok(entries) = fs::read_dir(abs) else {
        return;
    };
    for entry in entries.flatten() {
        let child = entry.path();
        let is_dir = fs::symlink_metadata(&child)
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if is_dir && !skip.matches(&child, root) {
            collect_local_dirs(&child, root, skip, out);
        }
    }
}
