//! Relative paths below a mapping root

use std::fmt;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Errors produced while building [`SubPath`]s and validating mappings
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    /// Segment is empty, `.`, `..`, or not valid UTF-8
    #[error("invalid path segment {0:?}")]
    BadSegment(String),

    /// Path escapes or is not relative to the mapping root
    #[error("path is not relative: {0}")]
    NotRelative(PathBuf),

    /// One mapping root is a prefix of another
    #[error("mapping roots overlap: {0} and {1}")]
    OverlappingRoots(PathBuf, PathBuf),
}

/// A relative path from a mapping root, stored as an ordered segment list.
///
/// Segments are case-sensitive and never `.`, `..`, or empty. The empty
/// segment list denotes the mapping root itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubPath {
    segments: Vec<String>,
}

impl SubPath {
    /// The mapping root itself
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Build from a path relative to a mapping root.
    ///
    /// `.` components are dropped; `..`, absolute prefixes, and non-UTF-8
    /// segments are rejected.
    pub fn from_rel(path: &Path) -> Result<Self, PathError> {
        let mut segments = Vec::new();
        for comp in path.components() {
            match comp {
                Component::Normal(os) => {
                    let seg = os
                        .to_str()
                        .ok_or_else(|| PathError::BadSegment(os.to_string_lossy().into_owned()))?;
                    segments.push(seg.to_string());
                }
                Component::CurDir => {}
                _ => return Err(PathError::NotRelative(path.to_path_buf())),
            }
        }
        Ok(Self { segments })
    }

    /// Parse a `/`-joined wire representation (the inverse of `Display`)
    pub fn parse(s: &str) -> Result<Self, PathError> {
        if s.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for seg in s.split('/') {
            if seg.is_empty() || seg == "." || seg == ".." {
                return Err(PathError::BadSegment(seg.to_string()));
            }
            segments.push(seg.to_string());
        }
        Ok(Self { segments })
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments
    #[must_use]
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Final segment, if any
    #[must_use]
    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Parent path; `None` for the root
    #[must_use]
    pub fn parent(&self) -> Option<SubPath> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Extend with one more segment
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> SubPath {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// Absolute filesystem path of this entry under `root`
    #[must_use]
    pub fn resolve_under(&self, root: &Path) -> PathBuf {
        let mut abs = root.to_path_buf();
        for seg in &self.segments {
            abs.push(seg);
        }
        abs
    }
}

impl fmt::Display for SubPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

/// One mirrored tree: a local root and its destination below the agent root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// Absolute local directory to watch and scan
    pub local_root: PathBuf,
    /// Relative destination path on the remote (empty = agent root)
    pub remote_dest: String,
}

impl Mapping {
    #[must_use]
    pub fn new(local_root: impl Into<PathBuf>, remote_dest: impl Into<String>) -> Self {
        Self {
            local_root: local_root.into(),
            remote_dest: remote_dest.into(),
        }
    }
}

/// Reject mapping sets where one local root contains another.
pub fn validate_mappings(mappings: &[Mapping]) -> Result<(), PathError> {
    for (i, a) in mappings.iter().enumerate() {
        for b in &mappings[i + 1..] {
            if a.local_root.starts_with(&b.local_root) || b.local_root.starts_with(&a.local_root) {
                return Err(PathError::OverlappingRoots(
                    a.local_root.clone(),
                    b.local_root.clone(),
                ));
            }
        }
    }
    Ok(())
}
