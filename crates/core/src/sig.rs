//! Signatures: the sync-relevant state of one filesystem entry

use std::fs;
use std::io::Read;
use std::path::Path;

use crate::hash::BlockHash;

/// Compact fingerprint of a filesystem entry.
///
/// Unsupported kinds (devices, sockets, fifos) have no signature and are
/// represented as absence wherever signatures flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    File {
        perms: u32,
        /// `block_hashes[i]` digests bytes `[i*B, min((i+1)*B, size))`
        block_hashes: Vec<BlockHash>,
        size: u64,
    },
    Dir {
        perms: u32,
    },
    Symlink {
        /// Link target, stored verbatim without normalization
        target: String,
    },
}

impl Signature {
    #[must_use]
    pub fn perms(&self) -> Option<u32> {
        match self {
            Self::File { perms, .. } | Self::Dir { perms } => Some(*perms),
            Self::Symlink { .. } => None,
        }
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        matches!(self, Self::File { .. })
    }
}

/// Entry kind as reported by a single non-following stat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Other,
}

impl EntryKind {
    #[must_use]
    pub fn of(meta: &fs::Metadata) -> Self {
        let ft = meta.file_type();
        if ft.is_symlink() {
            Self::Symlink
        } else if ft.is_dir() {
            Self::Dir
        } else if ft.is_file() {
            Self::File
        } else {
            Self::Other
        }
    }
}

/// POSIX permission bits of a metadata record
#[must_use]
pub fn mode_of(meta: &fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        meta.permissions().mode() & 0o7777
    }
    #[cfg(not(unix))]
    {
        if meta.is_dir() { 0o755 } else { 0o644 }
    }
}

/// Compute the signature of the entry at `abs`.
///
/// Any I/O error yields `None`; the caller treats the path as absent and a
/// later event re-establishes consistency. A file whose size changes while
/// being read hashes exactly the bytes that were read. `buf` must hold at
/// least `block_size` bytes and is reusable after return.
#[must_use]
pub fn compute(
    abs: &Path,
    kind: EntryKind,
    block_size: usize,
    buf: &mut [u8],
) -> Option<Signature> {
    match kind {
        EntryKind::Other => None,
        EntryKind::Symlink => {
            let target = fs::read_link(abs).ok()?;
            let target = target.into_os_string().into_string().ok()?;
            Some(Signature::Symlink { target })
        }
        EntryKind::Dir => {
            let meta = fs::metadata(abs).ok()?;
            Some(Signature::Dir {
                perms: mode_of(&meta),
            })
        }
        EntryKind::File => {
            let mut file = fs::File::open(abs).ok()?;
            let perms = mode_of(&file.metadata().ok()?);
            let mut block_hashes = Vec::new();
            let mut size: u64 = 0;
            loop {
                let mut filled = 0;
                while filled < block_size {
                    let n = file.read(&mut buf[filled..block_size]).ok()?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                if filled == 0 {
                    break;
                }
                block_hashes.push(BlockHash::of(&buf[..filled]));
                size += filled as u64;
                if filled < block_size {
                    break;
                }
            }
            Some(Signature::File {
                perms,
                block_hashes,
                size,
            })
        }
    }
}
