//! In-memory shadow of the remote tree.
//!
//! The VFS mirrors what the remote is believed to contain given the actions
//! already written to the wire. It is rebuilt from a full scan on every
//! start and mutated only through [`Vfs::apply`], strictly after the
//! corresponding action has been sent.

use std::collections::BTreeMap;

use crate::action::Action;
use crate::hash::{BlockHash, BLOCK_SIZE};
use crate::path::SubPath;
use crate::sig::Signature;

/// One node of the shadow tree. The root is always a `Folder`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Folder {
        perms: u32,
        children: BTreeMap<String, Node>,
    },
    File {
        perms: u32,
        size: u64,
        block_hashes: Vec<BlockHash>,
    },
    Symlink {
        target: String,
    },
}

impl Node {
    fn folder(perms: u32) -> Self {
        Self::Folder {
            perms,
            children: BTreeMap::new(),
        }
    }

    /// The signature this node would report in a remote scan
    #[must_use]
    pub fn signature(&self) -> Signature {
        match self {
            Self::Folder { perms, .. } => Signature::Dir { perms: *perms },
            Self::File {
                perms,
                size,
                block_hashes,
            } => Signature::File {
                perms: *perms,
                block_hashes: block_hashes.clone(),
                size: *size,
            },
            Self::Symlink { target } => Signature::Symlink {
                target: target.clone(),
            },
        }
    }

    /// Child map, for folders
    #[must_use]
    pub fn children(&self) -> Option<&BTreeMap<String, Node>> {
        match self {
            Self::Folder { children, .. } => Some(children),
            _ => None,
        }
    }
}

/// Shadow tree for one mapping
#[derive(Debug, Clone)]
pub struct Vfs {
    root: Node,
    block_size: usize,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    #[must_use]
    pub fn new() -> Self {
        Self::with_block_size(BLOCK_SIZE)
    }

    /// Custom block size, used by tests with small blocks
    #[must_use]
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            root: Node::folder(0o755),
            block_size,
        }
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Walk from the root; `None` if any intermediate segment is missing or
    /// not a folder.
    #[must_use]
    pub fn resolve(&self, sub: &SubPath) -> Option<&Node> {
        let mut node = &self.root;
        for seg in sub.segments() {
            node = node.children()?.get(seg)?;
        }
        Some(node)
    }

    fn resolve_mut(&mut self, sub: &SubPath) -> Option<&mut Node> {
        let mut node = &mut self.root;
        for seg in sub.segments() {
            let Node::Folder { children, .. } = node else {
                return None;
            };
            node = children.get_mut(seg)?;
        }
        Some(node)
    }

    /// Child map of the parent folder of `sub`; `None` at the root or when
    /// the parent chain does not resolve to folders.
    fn parent_children_mut(&mut self, sub: &SubPath) -> Option<&mut BTreeMap<String, Node>> {
        let parent = sub.parent()?;
        match self.resolve_mut(&parent)? {
            Node::Folder { children, .. } => Some(children),
            _ => None,
        }
    }

    /// Signature of the entry at `sub`, if present
    #[must_use]
    pub fn signature_of(&self, sub: &SubPath) -> Option<Signature> {
        self.resolve(sub).map(Node::signature)
    }

    /// Apply one already-sent action to the shadow tree.
    ///
    /// The planner emits actions shallow-first with `Remove` preceding any
    /// replacement, so parents exist and kind conflicts never reach here.
    pub fn apply(&mut self, action: &Action) {
        match action {
            Action::Remove { sub } => {
                if let (Some(name), Some(children)) =
                    (sub.last().map(str::to_owned), self.parent_children_mut(sub))
                {
                    children.remove(&name);
                }
            }
            Action::PutDir { sub, perms } => {
                if sub.is_root() {
                    if let Node::Folder { perms: p, .. } = &mut self.root {
                        *p = *perms;
                    }
                    return;
                }
                let name = sub.last().map(str::to_owned);
                if let (Some(name), Some(children)) = (name, self.parent_children_mut(sub)) {
                    match children.get_mut(&name) {
                        Some(Node::Folder { perms: p, .. }) => *p = *perms,
                        _ => {
                            children.insert(name, Node::folder(*perms));
                        }
                    }
                }
            }
            Action::PutFile { sub, perms } => {
                let name = sub.last().map(str::to_owned);
                if let (Some(name), Some(children)) = (name, self.parent_children_mut(sub)) {
                    children.insert(
                        name,
                        Node::File {
                            perms: *perms,
                            size: 0,
                            block_hashes: Vec::new(),
                        },
                    );
                }
            }
            Action::PutLink { sub, target } => {
                let name = sub.last().map(str::to_owned);
                if let (Some(name), Some(children)) = (name, self.parent_children_mut(sub)) {
                    children.insert(
                        name,
                        Node::Symlink {
                            target: target.clone(),
                        },
                    );
                }
            }
            Action::SetPerms { sub, perms } => match self.resolve_mut(sub) {
                Some(Node::Folder { perms: p, .. }) | Some(Node::File { perms: p, .. }) => {
                    *p = *perms;
                }
                _ => {}
            },
            Action::WriteChunk {
                sub, index, hash, ..
            } => {
                if let Some(Node::File { block_hashes, .. }) = self.resolve_mut(sub) {
                    let index = *index as usize;
                    if index < block_hashes.len() {
                        block_hashes[index] = *hash;
                    } else {
                        // blocks are written left-to-right, so this extends by one
                        debug_assert_eq!(index, block_hashes.len());
                        block_hashes.push(*hash);
                    }
                }
            }
            Action::SetSize { sub, size } => {
                let block_size = self.block_size as u64;
                if let Some(Node::File {
                    size: s,
                    block_hashes,
                    ..
                }) = self.resolve_mut(sub)
                {
                    *s = *size;
                    let want = (size.div_ceil(block_size)) as usize;
                    if block_hashes.len() > want {
                        block_hashes.truncate(want);
                    }
                }
            }
        }
    }

    /// Insert one entry from a remote full-scan listing.
    ///
    /// Listings arrive shallow-first; intermediate folders missing from the
    /// listing (never the case for a well-formed agent) are created with
    /// default permissions.
    pub fn insert_listing(&mut self, sub: &SubPath, sig: &Signature) {
        if sub.is_root() {
            if let (Signature::Dir { perms }, Node::Folder { perms: p, .. }) = (sig, &mut self.root)
            {
                *p = *perms;
            }
            return;
        }

        let mut node = &mut self.root;
        let segments = sub.segments();
        for seg in &segments[..segments.len() - 1] {
            let Node::Folder { children, .. } = node else {
                return;
            };
            node = children
                .entry(seg.clone())
                .or_insert_with(|| Node::folder(0o755));
        }
        let Node::Folder { children, .. } = node else {
            return;
        };
        let name = segments[segments.len() - 1].clone();
        let new = match sig {
            Signature::Dir { perms } => match children.get_mut(&name) {
                // keep children already inserted out of order
                Some(Node::Folder { perms: p, .. }) => {
                    *p = *perms;
                    return;
                }
                _ => Node::folder(*perms),
            },
            Signature::File {
                perms,
                block_hashes,
                size,
            } => Node::File {
                perms: *perms,
                size: *size,
                block_hashes: block_hashes.clone(),
            },
            Signature::Symlink { target } => Node::Symlink {
                target: target.clone(),
            },
        };
        children.insert(name, new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sub(s: &str) -> SubPath {
        SubPath::parse(s).unwrap()
    }

    fn put_file(vfs: &mut Vfs, path: &str, perms: u32) {
        vfs.apply(&Action::PutFile {
            sub: sub(path),
            perms,
        });
    }

    #[test]
    fn test_resolve_missing() {
        let vfs = Vfs::new();
        assert!(vfs.resolve(&sub("a")).is_none());
        assert!(vfs.resolve(&SubPath::root()).is_some());
    }

    #[test]
    fn test_put_dir_and_file() {
        let mut vfs = Vfs::new();
        vfs.apply(&Action::PutDir {
            sub: sub("d"),
            perms: 0o750,
        });
        put_file(&mut vfs, "d/f", 0o644);

        assert_eq!(
            vfs.signature_of(&sub("d")),
            Some(Signature::Dir { perms: 0o750 })
        );
        assert_eq!(
            vfs.signature_of(&sub("d/f")),
            Some(Signature::File {
                perms: 0o644,
                block_hashes: vec![],
                size: 0
            })
        );
    }

    #[test]
    fn test_put_dir_updates_perms_keeps_children() {
        let mut vfs = Vfs::new();
        vfs.apply(&Action::PutDir {
            sub: sub("d"),
            perms: 0o755,
        });
        put_file(&mut vfs, "d/f", 0o644);
        vfs.apply(&Action::PutDir {
            sub: sub("d"),
            perms: 0o700,
        });

        assert_eq!(
            vfs.signature_of(&sub("d")),
            Some(Signature::Dir { perms: 0o700 })
        );
        assert!(vfs.resolve(&sub("d/f")).is_some());
    }

    #[test]
    fn test_remove_subtree() {
        let mut vfs = Vfs::new();
        vfs.apply(&Action::PutDir {
            sub: sub("d"),
            perms: 0o755,
        });
        put_file(&mut vfs, "d/f", 0o644);

        vfs.apply(&Action::Remove { sub: sub("d") });
        assert!(vfs.resolve(&sub("d")).is_none());
        assert!(vfs.resolve(&sub("d/f")).is_none());

        // removing again is a no-op
        vfs.apply(&Action::Remove { sub: sub("d") });
    }

    #[test]
    fn test_write_chunk_extends_left_to_right() {
        let mut vfs = Vfs::with_block_size(4);
        put_file(&mut vfs, "f", 0o644);

        let h0 = BlockHash::of(b"aaaa");
        let h1 = BlockHash::of(b"bb");
        vfs.apply(&Action::WriteChunk {
            sub: sub("f"),
            index: 0,
            hash: h0,
            data: Bytes::from_static(b"aaaa"),
        });
        vfs.apply(&Action::WriteChunk {
            sub: sub("f"),
            index: 1,
            hash: h1,
            data: Bytes::from_static(b"bb"),
        });

        let Some(Node::File { block_hashes, .. }) = vfs.resolve(&sub("f")) else {
            panic!("expected file node");
        };
        assert_eq!(block_hashes, &vec![h0, h1]);

        // overwrite in place
        let h0b = BlockHash::of(b"cccc");
        vfs.apply(&Action::WriteChunk {
            sub: sub("f"),
            index: 0,
            hash: h0b,
            data: Bytes::from_static(b"cccc"),
        });
        let Some(Node::File { block_hashes, .. }) = vfs.resolve(&sub("f")) else {
            panic!("expected file node");
        };
        assert_eq!(block_hashes[0], h0b);
    }

    #[test]
    fn test_set_size_truncates_hashes() {
        let mut vfs = Vfs::with_block_size(4);
        put_file(&mut vfs, "f", 0o644);
        for (i, block) in [b"aaaa", b"bbbb", b"cccc"].iter().enumerate() {
            vfs.apply(&Action::WriteChunk {
                sub: sub("f"),
                index: i as u64,
                hash: BlockHash::of(*block),
                data: Bytes::copy_from_slice(*block),
            });
        }

        // 5 bytes = 2 blocks at block size 4
        vfs.apply(&Action::SetSize {
            sub: sub("f"),
            size: 5,
        });
        let Some(Node::File {
            size, block_hashes, ..
        }) = vfs.resolve(&sub("f"))
        else {
            panic!("expected file node");
        };
        assert_eq!(*size, 5);
        assert_eq!(block_hashes.len(), 2);
    }

    #[test]
    fn test_put_file_resets_value() {
        let mut vfs = Vfs::with_block_size(4);
        put_file(&mut vfs, "f", 0o644);
        vfs.apply(&Action::WriteChunk {
            sub: sub("f"),
            index: 0,
            hash: BlockHash::of(b"aaaa"),
            data: Bytes::from_static(b"aaaa"),
        });
        vfs.apply(&Action::SetSize {
            sub: sub("f"),
            size: 4,
        });

        put_file(&mut vfs, "f", 0o600);
        assert_eq!(
            vfs.signature_of(&sub("f")),
            Some(Signature::File {
                perms: 0o600,
                block_hashes: vec![],
                size: 0
            })
        );
    }

    #[test]
    fn test_set_perms_on_root() {
        let mut vfs = Vfs::new();
        vfs.apply(&Action::SetPerms {
            sub: SubPath::root(),
            perms: 0o700,
        });
        assert_eq!(
            vfs.signature_of(&SubPath::root()),
            Some(Signature::Dir { perms: 0o700 })
        );
    }

    #[test]
    fn test_insert_listing_builds_tree() {
        let mut vfs = Vfs::new();
        vfs.insert_listing(&sub("a"), &Signature::Dir { perms: 0o750 });
        vfs.insert_listing(
            &sub("a/f"),
            &Signature::File {
                perms: 0o644,
                block_hashes: vec![BlockHash::of(b"x")],
                size: 1,
            },
        );
        vfs.insert_listing(
            &sub("a/l"),
            &Signature::Symlink {
                target: "f".to_string(),
            },
        );

        assert_eq!(
            vfs.signature_of(&sub("a")),
            Some(Signature::Dir { perms: 0o750 })
        );
        assert!(matches!(
            vfs.resolve(&sub("a/f")),
            Some(Node::File { size: 1, .. })
        ));
        assert!(matches!(vfs.resolve(&sub("a/l")), Some(Node::Symlink { .. })));
    }
}
