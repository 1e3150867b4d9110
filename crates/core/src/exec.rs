//! Agent-side executor: applies requests to a destination root on disk.
//!
//! This is the remote half of the protocol. It lives in the core so the
//! agent binary and the in-process test endpoint share one implementation.

use std::collections::VecDeque;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::action::Action;
use crate::hash::BLOCK_SIZE;
use crate::path::SubPath;
use crate::protocol::{FrameReader, FrameWriter, Request};
use crate::sig::{self, EntryKind, Signature};

/// Applies mutation requests below a fixed root directory
pub struct Executor {
    root: PathBuf,
    block_size: usize,
}

impl Executor {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_block_size(root, BLOCK_SIZE)
    }

    /// Custom block size, used by tests with small blocks
    #[must_use]
    pub fn with_block_size(root: impl Into<PathBuf>, block_size: usize) -> Self {
        Self {
            root: root.into(),
            block_size,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dest_root(&self, dest: &str) -> PathBuf {
        if dest.is_empty() {
            self.root.clone()
        } else {
            self.root.join(dest)
        }
    }

    fn abs(&self, dest: &str, sub: &SubPath) -> PathBuf {
        sub.resolve_under(&self.dest_root(dest))
    }

    /// Apply one action to disk
    pub fn apply(&self, dest: &str, action: &Action) -> io::Result<()> {
        let abs = self.abs(dest, action.sub());
        match action {
            Action::Remove { .. } => match fs::symlink_metadata(&abs) {
                Ok(meta) if meta.is_dir() => fs::remove_dir_all(&abs),
                Ok(_) => fs::remove_file(&abs),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            },
            Action::PutDir { perms, .. } => {
                if !abs.is_dir() {
                    fs::create_dir_all(&abs)?;
                }
                set_mode(&abs, *perms)
            }
            Action::PutFile { perms, .. } => {
                fs::File::create(&abs)?;
                set_mode(&abs, *perms)
            }
            Action::PutLink { target, .. } => {
                if fs::symlink_metadata(&abs).is_ok() {
                    fs::remove_file(&abs)?;
                }
                make_symlink(target, &abs)
            }
            Action::SetPerms { perms, .. } => set_mode(&abs, *perms),
            Action::WriteChunk { index, data, .. } => {
                let file = fs::OpenOptions::new().write(true).create(true).open(&abs)?;
                write_all_at(&file, data, index * self.block_size as u64)
            }
            Action::SetSize { size, .. } => {
                let file = fs::OpenOptions::new().write(true).create(true).open(&abs)?;
                file.set_len(*size)
            }
        }
    }

    /// Shallow-first `(subpath, signature)` listing of the tree at `dest`.
    ///
    /// The destination root is created if missing and is itself not listed.
    /// Unsupported entry kinds and unreadable entries are omitted.
    pub fn full_scan(&self, dest: &str) -> io::Result<Vec<(SubPath, Signature)>> {
        let dest_root = self.dest_root(dest);
        fs::create_dir_all(&dest_root)?;

        let mut entries = Vec::new();
        let mut buf = vec![0u8; self.block_size];
        let mut queue = VecDeque::from([SubPath::root()]);
        while let Some(dir) = queue.pop_front() {
            let mut names: Vec<String> = match fs::read_dir(dir.resolve_under(&dest_root)) {
                Ok(rd) => rd
                    .filter_map(Result::ok)
                    .filter_map(|e| e.file_name().into_string().ok())
                    .collect(),
                Err(_) => continue,
            };
            names.sort();
            for name in names {
                let sub = dir.child(name);
                let abs = sub.resolve_under(&dest_root);
                let Ok(meta) = fs::symlink_metadata(&abs) else {
                    continue;
                };
                let kind = EntryKind::of(&meta);
                let Some(signature) = sig::compute(&abs, kind, self.block_size, &mut buf) else {
                    continue;
                };
                if kind == EntryKind::Dir {
                    queue.push_back(sub.clone());
                }
                entries.push((sub, signature));
            }
        }
        Ok(entries)
    }
}

fn set_mode(abs: &Path, perms: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        fs::set_permissions(abs, fs::Permissions::from_mode(perms))
    }
    #[cfg(not(unix))]
    {
        let _ = (abs, perms);
        Ok(())
    }
}

fn make_symlink(target: &str, abs: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, abs)
    }
    #[cfg(not(unix))]
    {
        let _ = (target, abs);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "symlinks require a unix host",
        ))
    }
}

fn write_all_at(file: &fs::File, data: &[u8], offset: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt as _;
        file.write_all_at(data, offset)
    }
    #[cfg(not(unix))]
    {
        use std::io::{Seek as _, SeekFrom, Write as _};
        let mut f = file;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(data)
    }
}

/// Serve the request loop until `Shutdown` or EOF.
///
/// Mutations are applied without per-action replies; the first failure is
/// held back and reported at the next `Drain`, which otherwise answers with
/// an empty `Ok` once everything prior has been applied.
pub fn serve<R: Read, W: Write>(executor: &Executor, reader: R, writer: W) -> io::Result<()> {
    let mut reader = FrameReader::new(reader);
    let mut writer = FrameWriter::new(writer);
    let mut deferred_error: Option<String> = None;

    while let Some(request) = reader.read_request()? {
        match request {
            Request::FullScan { dest } => match executor.full_scan(&dest) {
                Ok(entries) => {
                    debug!(dest, entries = entries.len(), "full scan served");
                    writer.send_scan_resp(&entries)?;
                }
                Err(e) => writer.send_error(&e.to_string())?,
            },
            Request::Apply { dest, action } => {
                if let Err(e) = executor.apply(&dest, &action) {
                    let message = format!("{} {}: {e}", action.kind(), action.sub());
                    debug!(error = %message, "action failed; deferring to next drain");
                    deferred_error.get_or_insert(message);
                }
            }
            Request::Drain => match deferred_error.take() {
                Some(message) => writer.send_error(&message)?,
                None => writer.send_ok()?,
            },
            Request::Shutdown => {
                writer.send_ok()?;
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::BlockHash;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn sub(s: &str) -> SubPath {
        SubPath::parse(s).unwrap()
    }

    #[test]
    fn test_put_dir_and_file() {
        let dir = TempDir::new().unwrap();
        let exec = Executor::with_block_size(dir.path(), 4);

        exec.apply(
            "",
            &Action::PutDir {
                sub: sub("d"),
                perms: 0o750,
            },
        )
        .unwrap();
        exec.apply(
            "",
            &Action::PutFile {
                sub: sub("d/f"),
                perms: 0o644,
            },
        )
        .unwrap();

        assert!(dir.path().join("d").is_dir());
        assert_eq!(fs::read(dir.path().join("d/f")).unwrap(), b"");
    }

    #[test]
    fn test_write_chunk_and_set_size() {
        let dir = TempDir::new().unwrap();
        let exec = Executor::with_block_size(dir.path(), 4);

        exec.apply(
            "",
            &Action::PutFile {
                sub: sub("f"),
                perms: 0o644,
            },
        )
        .unwrap();
        exec.apply(
            "",
            &Action::WriteChunk {
                sub: sub("f"),
                index: 0,
                hash: BlockHash::of(b"aaaa"),
                data: Bytes::from_static(b"aaaa"),
            },
        )
        .unwrap();
        exec.apply(
            "",
            &Action::WriteChunk {
                sub: sub("f"),
                index: 1,
                hash: BlockHash::of(b"bb"),
                data: Bytes::from_static(b"bb"),
            },
        )
        .unwrap();
        exec.apply(
            "",
            &Action::SetSize {
                sub: sub("f"),
                size: 6,
            },
        )
        .unwrap();

        assert_eq!(fs::read(dir.path().join("f")).unwrap(), b"aaaabb");
    }

    #[test]
    fn test_set_size_truncates() {
        let dir = TempDir::new().unwrap();
        let exec = Executor::with_block_size(dir.path(), 4);
        fs::write(dir.path().join("f"), b"abcdefgh").unwrap();

        exec.apply(
            "",
            &Action::SetSize {
                sub: sub("f"),
                size: 3,
            },
        )
        .unwrap();
        assert_eq!(fs::read(dir.path().join("f")).unwrap(), b"abc");
    }

    #[test]
    fn test_remove_is_recursive_and_tolerant() {
        let dir = TempDir::new().unwrap();
        let exec = Executor::with_block_size(dir.path(), 4);
        fs::create_dir_all(dir.path().join("d/sub")).unwrap();
        fs::write(dir.path().join("d/sub/f"), b"x").unwrap();

        exec.apply("", &Action::Remove { sub: sub("d") }).unwrap();
        assert!(!dir.path().join("d").exists());

        // absent path is a no-op
        exec.apply("", &Action::Remove { sub: sub("d") }).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_put_link() {
        let dir = TempDir::new().unwrap();
        let exec = Executor::with_block_size(dir.path(), 4);

        exec.apply(
            "",
            &Action::PutLink {
                sub: sub("l"),
                target: "somewhere".to_string(),
            },
        )
        .unwrap();
        assert_eq!(
            fs::read_link(dir.path().join("l")).unwrap(),
            PathBuf::from("somewhere")
        );
    }

    #[test]
    fn test_full_scan_shallow_first() {
        let dir = TempDir::new().unwrap();
        let exec = Executor::with_block_size(dir.path(), 4);
        fs::create_dir_all(dir.path().join("b/inner")).unwrap();
        fs::write(dir.path().join("a.txt"), b"hi").unwrap();
        fs::write(dir.path().join("b/inner/deep.txt"), b"deep").unwrap();

        let entries = exec.full_scan("").unwrap();
        let paths: Vec<String> = entries.iter().map(|(s, _)| s.to_string()).collect();
        assert_eq!(paths, vec!["a.txt", "b", "b/inner", "b/inner/deep.txt"]);
    }

    #[test]
    fn test_full_scan_creates_dest_root() {
        let dir = TempDir::new().unwrap();
        let exec = Executor::with_block_size(dir.path(), 4);
        let entries = exec.full_scan("nested/dest").unwrap();
        assert!(entries.is_empty());
        assert!(dir.path().join("nested/dest").is_dir());
    }

    #[test]
    fn test_serve_drain_reports_first_failure() {
        let dir = TempDir::new().unwrap();
        let exec = Executor::with_block_size(dir.path(), 4);

        let mut requests = Vec::new();
        {
            let mut w = FrameWriter::new(&mut requests);
            // parent directory is missing, so this fails on the agent
            w.send_action(
                "",
                &Action::PutFile {
                    sub: sub("no/such/f"),
                    perms: 0o644,
                },
            )
            .unwrap();
            w.send_drain().unwrap();
            w.send_drain().unwrap();
            w.send_shutdown().unwrap();
        }

        let mut replies = Vec::new();
        serve(&exec, std::io::Cursor::new(requests), &mut replies).unwrap();

        let mut r = FrameReader::new(std::io::Cursor::new(replies));
        assert!(matches!(r.read_reply().unwrap(), crate::protocol::Reply::Err(_)));
        // the failure was consumed by the first drain
        assert!(matches!(r.read_reply().unwrap(), crate::protocol::Reply::Ok));
        assert!(matches!(r.read_reply().unwrap(), crate::protocol::Reply::Ok));
    }
}
