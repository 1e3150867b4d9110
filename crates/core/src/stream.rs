//! File-content streamer: block-level delta transfer.
//!
//! For each changed file, only blocks whose hash differs from what the
//! remote already holds are read and sent. An append rewrites the final
//! partial block and extends the size; a mid-file edit rewrites exactly the
//! touched blocks.

use std::fs::File;
use std::io;
use std::path::Path;

use bytes::Bytes;
use tracing::trace;

use crate::action::Action;
use crate::error::StreamError;
use crate::hash::BlockHash;
use crate::plan::Diff;
use crate::protocol::Remote;
use crate::sig::Signature;
use crate::vfs::{Node, Vfs};

/// Ack barrier cadence while streaming
pub const DRAIN_EVERY_FILES: usize = 1000;

/// Stream changed blocks for every file diff in `diffs`.
///
/// Must run after the metadata actions for the same diffs have been sent
/// and applied: elision compares against the VFS state they left behind.
/// Every chunk is written to the wire strictly before the VFS learns about
/// it.
pub fn stream_files<T: Remote>(
    root: &Path,
    dest: &str,
    diffs: &[Diff],
    vfs: &mut Vfs,
    remote: &mut T,
) -> Result<(), StreamError> {
    let mut streamed = 0usize;
    for diff in diffs {
        let Some(Signature::File {
            block_hashes, size, ..
        }) = &diff.local
        else {
            continue;
        };
        stream_one(root, dest, diff, block_hashes, *size, vfs, remote)?;
        streamed += 1;
        if streamed % DRAIN_EVERY_FILES == 0 {
            remote.drain()?;
        }
    }
    Ok(())
}

fn stream_one<T: Remote>(
    root: &Path,
    dest: &str,
    diff: &Diff,
    block_hashes: &[BlockHash],
    size: u64,
    vfs: &mut Vfs,
    remote: &mut T,
) -> Result<(), StreamError> {
    let block_size = vfs.block_size();
    let (remote_hashes, remote_size) = match vfs.resolve(&diff.sub) {
        Some(Node::File {
            block_hashes, size, ..
        }) => (block_hashes.clone(), *size),
        _ => (Vec::new(), 0),
    };

    let abs = diff.sub.resolve_under(root);
    let file = File::open(&abs).map_err(StreamError::Io)?;
    let mut buf = vec![0u8; block_size];

    for (index, hash) in block_hashes.iter().enumerate() {
        if remote_hashes.get(index) == Some(hash) {
            continue;
        }
        let filled = read_block_at(&file, index as u64 * block_size as u64, &mut buf)
            .map_err(StreamError::Io)?;
        trace!(sub = %diff.sub, index, bytes = filled, "streaming block");
        let action = Action::WriteChunk {
            sub: diff.sub.clone(),
            index: index as u64,
            hash: *hash,
            data: Bytes::copy_from_slice(&buf[..filled]),
        };
        remote.send(dest, &action)?;
        vfs.apply(&action);
    }

    if size != remote_size {
        let action = Action::SetSize {
            sub: diff.sub.clone(),
            size,
        };
        remote.send(dest, &action)?;
        vfs.apply(&action);
    }
    Ok(())
}

/// Positioned read of up to one block; short only at end of file
fn read_block_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt as _;
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
    #[cfg(not(unix))]
    {
        use std::io::{Read as _, Seek as _, SeekFrom};
        let mut f = file;
        f.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = f.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use crate::path::SubPath;
    use std::fs;
    use tempfile::TempDir;

    fn sub(s: &str) -> SubPath {
        SubPath::parse(s).unwrap()
    }

    /// Records sent actions; optionally fails after N sends
    struct RecordingSink {
        sent: Vec<Action>,
        drains: usize,
        fail_after: Option<usize>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                sent: Vec::new(),
                drains: 0,
                fail_after: None,
            }
        }
    }

    impl Remote for RecordingSink {
        fn full_scan(
            &mut self,
            _dest: &str,
        ) -> Result<Vec<(SubPath, Signature)>, RpcError> {
            Ok(Vec::new())
        }

        fn send(&mut self, _dest: &str, action: &Action) -> Result<(), RpcError> {
            if self.fail_after == Some(self.sent.len()) {
                return Err(RpcError::Protocol("injected failure".into()));
            }
            self.sent.push(action.clone());
            Ok(())
        }

        fn drain(&mut self) -> Result<(), RpcError> {
            self.drains += 1;
            Ok(())
        }

        fn shutdown(&mut self) -> Result<(), RpcError> {
            Ok(())
        }
    }

    fn file_sig(perms: u32, data: &[u8], block_size: usize) -> Signature {
        let block_hashes = data
            .chunks(block_size)
            .map(BlockHash::of)
            .collect();
        Signature::File {
            perms,
            block_hashes,
            size: data.len() as u64,
        }
    }

    fn diff_for(path: &str, local: Signature, vfs: &Vfs) -> Diff {
        Diff {
            sub: sub(path),
            remote: vfs.signature_of(&sub(path)),
            local: Some(local),
        }
    }

    fn vfs_with_file(path: &str, data: &[u8], block_size: usize) -> Vfs {
        let mut vfs = Vfs::with_block_size(block_size);
        vfs.insert_listing(&sub(path), &file_sig(0o644, data, block_size));
        vfs
    }

    #[test]
    fn test_new_file_streams_all_blocks() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("f"), b"aaaabb").unwrap();

        let mut vfs = Vfs::with_block_size(4);
        vfs.apply(&Action::PutFile {
            sub: sub("f"),
            perms: 0o644,
        });
        let diff = diff_for("f", file_sig(0o644, b"aaaabb", 4), &vfs);

        let mut sink = RecordingSink::new();
        stream_files(dir.path(), "", &[diff], &mut vfs, &mut sink).unwrap();

        assert_eq!(sink.sent.len(), 3);
        assert!(matches!(
            &sink.sent[0],
            Action::WriteChunk { index: 0, data, .. } if data.as_ref() == b"aaaa"
        ));
        assert!(matches!(
            &sink.sent[1],
            Action::WriteChunk { index: 1, data, .. } if data.as_ref() == b"bb"
        ));
        assert!(matches!(&sink.sent[2], Action::SetSize { size: 6, .. }));

        // the shadow now matches the local signature
        assert_eq!(
            vfs.signature_of(&sub("f")),
            Some(file_sig(0o644, b"aaaabb", 4))
        );
    }

    #[test]
    fn test_unchanged_blocks_elided() {
        // 3 blocks; only the middle one changes
        let old = b"aaaabbbbcc";
        let new = b"aaaaBBBBcc";
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("f"), new).unwrap();

        let mut vfs = vfs_with_file("f", old, 4);
        let diff = diff_for("f", file_sig(0o644, new, 4), &vfs);

        let mut sink = RecordingSink::new();
        stream_files(dir.path(), "", &[diff], &mut vfs, &mut sink).unwrap();

        // exactly one chunk, no size change
        assert_eq!(sink.sent.len(), 1);
        assert!(matches!(
            &sink.sent[0],
            Action::WriteChunk { index: 1, data, .. } if data.as_ref() == b"BBBB"
        ));
    }

    #[test]
    fn test_append_rewrites_final_block_and_size() {
        let old = b"aaaab";
        let new = b"aaaabb";
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("f"), new).unwrap();

        let mut vfs = vfs_with_file("f", old, 4);
        let diff = diff_for("f", file_sig(0o644, new, 4), &vfs);

        let mut sink = RecordingSink::new();
        stream_files(dir.path(), "", &[diff], &mut vfs, &mut sink).unwrap();

        assert_eq!(sink.sent.len(), 2);
        assert!(matches!(
            &sink.sent[0],
            Action::WriteChunk { index: 1, data, .. } if data.as_ref() == b"bb"
        ));
        assert!(matches!(&sink.sent[1], Action::SetSize { size: 6, .. }));
    }

    #[test]
    fn test_truncation_emits_only_set_size() {
        let old = b"aaaabbbb";
        let new = b"aaaa";
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("f"), new).unwrap();

        let mut vfs = vfs_with_file("f", old, 4);
        let diff = diff_for("f", file_sig(0o644, new, 4), &vfs);

        let mut sink = RecordingSink::new();
        stream_files(dir.path(), "", &[diff], &mut vfs, &mut sink).unwrap();

        assert_eq!(sink.sent.len(), 1);
        assert!(matches!(&sink.sent[0], Action::SetSize { size: 4, .. }));
        assert_eq!(
            vfs.signature_of(&sub("f")),
            Some(file_sig(0o644, new, 4))
        );
    }

    #[test]
    fn test_failed_send_leaves_vfs_untouched() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("f"), b"aaaa").unwrap();

        let mut vfs = Vfs::with_block_size(4);
        vfs.apply(&Action::PutFile {
            sub: sub("f"),
            perms: 0o644,
        });
        let before = vfs.signature_of(&sub("f"));
        let diff = diff_for("f", file_sig(0o644, b"aaaa", 4), &vfs);

        let mut sink = RecordingSink::new();
        sink.fail_after = Some(0);
        let err = stream_files(dir.path(), "", &[diff], &mut vfs, &mut sink).unwrap_err();
        assert!(matches!(err, StreamError::Rpc(_)));

        // send failed, so the mutation was never applied to the shadow
        assert_eq!(vfs.signature_of(&sub("f")), before);
    }

    #[test]
    fn test_missing_local_file_is_recoverable() {
        let dir = TempDir::new().unwrap();
        let mut vfs = Vfs::with_block_size(4);
        vfs.apply(&Action::PutFile {
            sub: sub("f"),
            perms: 0o644,
        });
        let diff = diff_for("f", file_sig(0o644, b"aaaa", 4), &vfs);

        let mut sink = RecordingSink::new();
        let err = stream_files(dir.path(), "", &[diff], &mut vfs, &mut sink).unwrap_err();
        assert!(matches!(err, StreamError::Io(_)));
    }

    #[test]
    fn test_non_file_diffs_ignored() {
        let dir = TempDir::new().unwrap();
        let mut vfs = Vfs::with_block_size(4);
        let diffs = vec![
            Diff {
                sub: sub("d"),
                local: Some(Signature::Dir { perms: 0o755 }),
                remote: None,
            },
            Diff {
                sub: sub("gone"),
                local: None,
                remote: Some(Signature::Dir { perms: 0o755 }),
            },
        ];

        let mut sink = RecordingSink::new();
        stream_files(dir.path(), "", &diffs, &mut vfs, &mut sink).unwrap();
        assert!(sink.sent.is_empty());
    }
}
