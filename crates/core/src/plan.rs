//! Change planner: diffs local signatures against the VFS shadow and turns
//! each difference into a minimal metadata action sequence.

use crate::action::Action;
use crate::path::SubPath;
use crate::sig::Signature;
use crate::vfs::Vfs;

/// One planned difference between local state and the remote shadow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff {
    pub sub: SubPath,
    pub local: Option<Signature>,
    pub remote: Option<Signature>,
}

/// Diff scanned signatures against the shadow tree.
///
/// Unchanged entries are dropped. The result is ordered by
/// `(depth, local-present, path)`: shallow entries first so folders exist
/// before their children, deletions before creations at equal depth so a
/// case rename removes `foo` before creating `Foo`, and a string tie-break
/// for determinism.
#[must_use]
pub fn diff(pairs: Vec<(SubPath, Option<Signature>)>, vfs: &Vfs) -> Vec<Diff> {
    let mut diffs: Vec<Diff> = pairs
        .into_iter()
        .filter_map(|(sub, local)| {
            let remote = vfs.signature_of(&sub);
            if local == remote {
                None
            } else {
                Some(Diff { sub, local, remote })
            }
        })
        .collect();
    diffs.sort_by_cached_key(|d| (d.sub.depth(), d.local.is_some(), d.sub.to_string()));
    diffs
}

/// Metadata actions for one diff entry.
///
/// Content blocks are never emitted here; the streamer writes them against
/// the VFS state left behind by these actions. A type change is always a
/// `Remove` followed by the matching `Put*`, in that order, even when that
/// pair is not atomic on the wire: a failure between the two is healed by
/// the next pass re-diffing the same path.
#[must_use]
pub fn metadata_actions(diff: &Diff) -> Vec<Action> {
    let sub = diff.sub.clone();
    match (&diff.local, &diff.remote) {
        (None, None) => Vec::new(),
        (None, Some(_)) => vec![Action::Remove { sub }],

        (Some(Signature::Dir { perms }), None) => vec![Action::PutDir { sub, perms: *perms }],
        (Some(Signature::Dir { perms }), Some(Signature::Dir { .. })) => {
            vec![Action::SetPerms { sub, perms: *perms }]
        }
        (Some(Signature::Dir { perms }), Some(_)) => vec![
            Action::Remove { sub: sub.clone() },
            Action::PutDir { sub, perms: *perms },
        ],

        (Some(Signature::Symlink { target }), None) => vec![Action::PutLink {
            sub,
            target: target.clone(),
        }],
        (Some(Signature::Symlink { target }), Some(_)) => vec![
            Action::Remove { sub: sub.clone() },
            Action::PutLink {
                sub,
                target: target.clone(),
            },
        ],

        (Some(Signature::File { perms, .. }), None) => {
            vec![Action::PutFile { sub, perms: *perms }]
        }
        (
            Some(Signature::File { perms, .. }),
            Some(Signature::File {
                perms: remote_perms,
                ..
            }),
        ) => {
            if perms == remote_perms {
                Vec::new()
            } else {
                vec![Action::SetPerms { sub, perms: *perms }]
            }
        }
        (Some(Signature::File { perms, .. }), Some(_)) => vec![
            Action::Remove { sub: sub.clone() },
            Action::PutFile { sub, perms: *perms },
        ],
    }
}
