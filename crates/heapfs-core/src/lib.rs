#![warn(missing_docs)]

//! HeapFS: an in-memory filesystem engine with POSIX and Windows semantics,
//! hard links, symbolic links, advisory range locks, change notification,
//! and disk-space emulation.

pub mod access;
pub mod attr;
pub mod channel;
pub mod config;
pub mod content;
pub mod fs;
pub mod limiter;
pub mod node;
pub mod resolve;
pub mod types;
pub mod watch;

pub use attr::Metadata;
pub use channel::{FileChannel, OpenFlags};
pub use config::{FsConfig, Semantics};
pub use fs::{DirEntryInfo, EntryMetadata, MemFs};
pub use types::{FileType, FsError, NodeId, Timestamp};
pub use watch::{EventKind, WatchEvent, WatchKey, WatchService};
