//! Core identifiers, timestamps, file types, and the engine error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents a unique identifier for a node (file or directory) in the engine
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    /// The root node ID (always 1)
    pub const ROOT: NodeId = NodeId(1);

    /// Creates a new NodeId from a raw u64 value
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }

    /// Returns the raw u64 value of this node ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Represents a unique identifier for a directory entry.
///
/// Entry IDs are stable for the lifetime of the entry and serve as the
/// file key reported for symbolic links, which have no node of their own.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(u64);

impl EntryId {
    /// Creates a new EntryId from a raw u64 value
    pub fn new(id: u64) -> Self {
        EntryId(id)
    }

    /// Returns the raw u64 value of this entry ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Represents a point in time with second granularity, rounded down
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since Unix epoch
    pub secs: u64,
}

impl Timestamp {
    /// Returns the current timestamp, truncated to whole seconds
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time before epoch");
        Self {
            secs: now.as_secs(),
        }
    }

    /// Creates a timestamp from raw seconds since epoch
    pub fn from_secs(secs: u64) -> Self {
        Self { secs }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.secs.cmp(&other.secs)
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// File type enumeration for nodes and directory entries.
///
/// A node is fixed as `RegularFile` or `Directory` at creation. `Symlink`
/// appears only when reporting directory entries, which may be raw symbolic
/// link targets rather than hard links to a node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file (S_IFREG)
    RegularFile,
    /// Directory (S_IFDIR)
    Directory,
    /// Symbolic link (S_IFLNK)
    Symlink,
}

impl FileType {
    /// Returns the POSIX S_IFMT bits for this file type
    pub fn mode_bits(&self) -> u32 {
        match self {
            FileType::RegularFile => 0o100000,
            FileType::Directory => 0o040000,
            FileType::Symlink => 0o120000,
        }
    }
}

/// Error types for filesystem operations
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// No node exists at a required path step.
    #[error("no such file or directory: '{0}'")]
    NotFound(String),

    /// An entry with the given name already exists in the target directory.
    #[error("'{0}' already exists")]
    AlreadyExists(String),

    /// A directory was required but the path step is not a directory.
    #[error("'{0}' is not a directory")]
    NotADirectory(String),

    /// A regular file was required but the path resolves to a directory.
    #[error("'{0}' is a directory")]
    IsADirectory(String),

    /// Attempted to remove or replace a non-empty directory.
    #[error("directory '{0}' is not empty")]
    DirectoryNotEmpty(String),

    /// Permission bit check failure, or a Windows read-only flag blocked the operation.
    #[error("access denied: '{0}'")]
    AccessDenied(String),

    /// The symlink resolution restart bound was exceeded (cycle or over-long chain).
    #[error("too many levels of symbolic links: '{0}'")]
    TooManyLinks(String),

    /// The space budget cannot cover the requested allocation.
    #[error("no space left: {requested} bytes requested, {free} free")]
    NoSpace {
        /// Bytes the operation tried to reserve
        requested: u64,
        /// Bytes still unreserved in the budget
        free: u64,
    },

    /// The open-handle budget is exhausted.
    #[error("too many open handles: limit {limit} reached")]
    TooManyOpenHandles {
        /// Configured handle budget
        limit: u64,
    },

    /// A rendered path would exceed the configured maximum length.
    #[error("path too long: {length} bytes exceeds {limit} byte limit")]
    PathTooLong {
        /// Rendered path length
        length: usize,
        /// Configured maximum
        limit: usize,
    },

    /// Malformed component, self-referential rename target, or similar caller error.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An advisory byte-range lock overlaps an active lock on the same content.
    #[error("lock range [{start}, {end}) overlaps an active lock")]
    LockOverlap {
        /// Requested range start (inclusive)
        start: u64,
        /// Requested range end (exclusive)
        end: u64,
    },

    /// The watch service was closed while an event was awaited.
    #[error("watch service closed")]
    WatchServiceClosed,
}
