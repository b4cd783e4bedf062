//! Open-file channels: positional reads and writes over a shared content
//! store, plus advisory range locking.
//!
//! A channel holds a clone of its node's content `Arc` and a lock-ownership
//! token. Dropping the channel releases the open-handle reservation, drops
//! the content reference, and orphans its advisory locks for lazy pruning.
//!
//! I/O runs under the per-file content lock only. Metadata updates (times,
//! archive flag, watch events) happen after the content guard is released,
//! keeping the metadata-before-content lock order intact.

use std::fmt;
use std::ops::BitOr;
use std::sync::{Arc, Mutex};

use crate::content::{FileContent, LockToken};
use crate::fs::FsState;
use crate::types::{FsError, NodeId};

/// Open-mode flag set for a file channel.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// Open for reading.
    pub const READ: OpenFlags = OpenFlags(1 << 0);
    /// Open for writing.
    pub const WRITE: OpenFlags = OpenFlags(1 << 1);
    /// Writes go to the end of the file regardless of position.
    pub const APPEND: OpenFlags = OpenFlags(1 << 2);
    /// Truncate existing content to zero on open.
    pub const TRUNCATE: OpenFlags = OpenFlags(1 << 3);
    /// Create the file if it does not exist.
    pub const CREATE: OpenFlags = OpenFlags(1 << 4);
    /// Create the file, failing if it already exists.
    pub const CREATE_NEW: OpenFlags = OpenFlags(1 << 5);
    /// Every write leaves the content in a synced state.
    pub const SYNC: OpenFlags = OpenFlags(1 << 6);

    /// True if every flag in `other` is set in `self`.
    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if the channel may read.
    pub fn readable(self) -> bool {
        self.contains(OpenFlags::READ)
    }

    /// True if the channel may write.
    pub fn writable(self) -> bool {
        self.contains(OpenFlags::WRITE) || self.contains(OpenFlags::APPEND)
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (OpenFlags::READ, "read"),
            (OpenFlags::WRITE, "write"),
            (OpenFlags::APPEND, "append"),
            (OpenFlags::TRUNCATE, "truncate"),
            (OpenFlags::CREATE, "create"),
            (OpenFlags::CREATE_NEW, "create-new"),
            (OpenFlags::SYNC, "sync"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// An open handle on a regular file.
///
/// Closing is dropping; [`FileChannel::close`] exists for explicit call
/// sites. The node stays alive, and its space reserved, while any channel
/// on it remains open, even after the last hard link is removed.
pub struct FileChannel {
    id: u64,
    node: NodeId,
    parent: NodeId,
    name: String,
    flags: OpenFlags,
    content: Arc<Mutex<FileContent>>,
    lock_token: LockToken,
    state: Arc<FsState>,
}

impl FileChannel {
    pub(crate) fn new(
        id: u64,
        node: NodeId,
        parent: NodeId,
        name: String,
        flags: OpenFlags,
        content: Arc<Mutex<FileContent>>,
        state: Arc<FsState>,
    ) -> Self {
        Self {
            id,
            node,
            parent,
            name,
            flags,
            content,
            lock_token: Arc::new(()),
            state,
        }
    }

    /// Handle id, unique within the filesystem.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The node this channel is open on.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The flags this channel was opened with.
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Current content size in bytes.
    pub fn size(&self) -> u64 {
        self.content.lock().expect("lock poisoned").size()
    }

    /// Reads from `position` into `dst`, returning the bytes read. A result
    /// of 0 with a non-empty `dst` means end of file.
    pub fn read_at(&self, position: u64, dst: &mut [u8]) -> Result<usize, FsError> {
        if !self.flags.readable() {
            return Err(FsError::AccessDenied(
                "channel is not open for reading".to_string(),
            ));
        }
        let n = self.content.lock().expect("lock poisoned").read(position, dst);
        self.state.record_content_read(self.node);
        Ok(n)
    }

    /// Writes `src` at `position` (or at end of file in append mode),
    /// returning the bytes written. Growth past the space budget fails
    /// without modifying the content.
    pub fn write_at(&self, position: u64, src: &[u8]) -> Result<usize, FsError> {
        self.write_inner(Some(position), src).map(|(_, n)| n)
    }

    /// Writes `src` at the current end of file, returning the position the
    /// bytes landed at.
    pub fn append(&self, src: &[u8]) -> Result<u64, FsError> {
        self.write_inner(None, src).map(|(pos, _)| pos)
    }

    fn write_inner(&self, position: Option<u64>, src: &[u8]) -> Result<(u64, usize), FsError> {
        if !self.flags.writable() {
            return Err(FsError::AccessDenied(
                "channel is not open for writing".to_string(),
            ));
        }
        let (pos, n) = {
            let mut content = self.content.lock().expect("lock poisoned");
            let pos = if self.flags.contains(OpenFlags::APPEND) {
                content.size()
            } else {
                position.unwrap_or(0)
            };
            let n = content.write(pos, src)?;
            if self.flags.contains(OpenFlags::SYNC) {
                content.sync();
            }
            (pos, n)
        };
        self.state
            .record_content_write(self.node, self.parent, &self.name);
        Ok((pos, n))
    }

    /// Shrinks the file to `size`, returning freed bytes to the limiter.
    pub fn truncate(&self, size: u64) -> Result<(), FsError> {
        if !self.flags.writable() {
            return Err(FsError::AccessDenied(
                "channel is not open for writing".to_string(),
            ));
        }
        {
            let mut content = self.content.lock().expect("lock poisoned");
            content.truncate(size)?;
            if self.flags.contains(OpenFlags::SYNC) {
                content.sync();
            }
        }
        self.state
            .record_content_write(self.node, self.parent, &self.name);
        Ok(())
    }

    /// Reads the whole content into a new buffer.
    pub fn read_all(&self) -> Result<Vec<u8>, FsError> {
        if !self.flags.readable() {
            return Err(FsError::AccessDenied(
                "channel is not open for reading".to_string(),
            ));
        }
        let bytes = self.content.lock().expect("lock poisoned").to_bytes();
        self.state.record_content_read(self.node);
        Ok(bytes)
    }

    /// Clears the content's dirty flag, modeling fsync.
    pub fn sync(&self) {
        self.content.lock().expect("lock poisoned").sync();
    }

    /// Acquires an advisory lock on `[start, start + len)`.
    ///
    /// Any overlap with an existing lock on the file is rejected, whichever
    /// channel holds it and whether or not either lock is shared. A shared
    /// lock needs read mode, an exclusive lock write mode.
    pub fn try_lock(&self, start: u64, len: u64, shared: bool) -> Result<(), FsError> {
        if shared && !self.flags.readable() {
            return Err(FsError::AccessDenied(
                "shared locks need a readable channel".to_string(),
            ));
        }
        if !shared && !self.flags.writable() {
            return Err(FsError::AccessDenied(
                "exclusive locks need a writable channel".to_string(),
            ));
        }
        self.content
            .lock()
            .expect("lock poisoned")
            .try_lock(&self.lock_token, start, len, shared)
    }

    /// Releases this channel's advisory lock on exactly `[start, start + len)`.
    /// Returns true if such a lock was held.
    pub fn release_lock(&self, start: u64, len: u64) -> bool {
        self.content
            .lock()
            .expect("lock poisoned")
            .release_lock(&self.lock_token, start, len)
    }

    /// Closes the channel. Equivalent to dropping it.
    pub fn close(self) {}
}

impl Drop for FileChannel {
    fn drop(&mut self) {
        self.state.channel_closed(self.id, self.node);
    }
}

impl fmt::Debug for FileChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileChannel")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("flags", &format_args!("{}", self.flags))
            .finish()
    }
}
