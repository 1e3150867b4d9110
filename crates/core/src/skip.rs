//! Skip predicates: which local paths are never synchronized

use std::fs;
use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use serde::Deserialize;

/// Skip policy named in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkipPolicy {
    /// Never skip
    None,
    /// Skip anything whose first segment below the root is `.git`
    #[default]
    DotGit,
    /// Consult the root's gitignore files (and skip `.git` itself)
    Gitignore,
}

impl SkipPolicy {
    /// Compile the policy against one mapping root
    #[must_use]
    pub fn compile(self, root: &Path) -> SkipFilter {
        match self {
            Self::None => SkipFilter::None,
            Self::DotGit => SkipFilter::DotGit,
            Self::Gitignore => {
                let mut builder = GitignoreBuilder::new(root);
                let _ = builder.add(root.join(".gitignore"));
                let _ = builder.add(root.join(".git/info/exclude"));
                let matcher = builder.build().unwrap_or_else(|_| Gitignore::empty());
                SkipFilter::Gitignore { matcher }
            }
        }
    }
}

/// A compiled skip predicate for one mapping root
pub enum SkipFilter {
    None,
    DotGit,
    Gitignore { matcher: Gitignore },
}

impl SkipFilter {
    /// `true` when `abs` (under `root`) must not be synchronized
    #[must_use]
    pub fn matches(&self, abs: &Path, root: &Path) -> bool {
        let Ok(rel) = abs.strip_prefix(root) else {
            return false;
        };
        match self {
            Self::None => false,
            Self::DotGit => first_segment_is_git(rel),
            Self::Gitignore { matcher } => {
                if first_segment_is_git(rel) {
                    return true;
                }
                let is_dir = fs::symlink_metadata(abs).map(|m| m.is_dir()).unwrap_or(false);
                matcher.matched_path_or_any_parents(rel, is_dir).is_ignore()
            }
        }
    }
}

fn first_segment_is_git(rel: &Path) -> bool {
    rel.components()
        .next()
        .is_some_and(|c| c.as_os_str() == ".git")
}
