//! Per-file byte content: growable buffer, size, dirty flag, advisory locks.
//!
//! A `FileContent` is shared behind `Arc<Mutex<_>>` between the node graph and
//! every open channel on the file. Space reserved from the limiter is returned
//! when the last owner drops the content, which happens exactly when the hard
//! link count and open handle count have both reached zero.
//!
//! Lock ordering: content locks are leaf locks. Code holding a content lock
//! must never take the filesystem metadata lock.

use std::sync::{Arc, Weak};

use crate::limiter::ResourceLimiter;
use crate::types::FsError;

/// Upper bound on file size and buffer capacity.
pub const ADDRESSABLE_LIMIT: u64 = isize::MAX as u64;

const MIN_CAPACITY: usize = 32;

/// Token identifying the channel that owns a set of advisory locks.
///
/// Locks hold a weak reference to their channel's token; once the channel is
/// gone the locks are pruned on the next lock attempt.
pub type LockToken = Arc<()>;

/// An advisory byte-range lock held on a file's content.
#[derive(Clone, Debug)]
pub struct RangeLock {
    /// Range start, inclusive.
    pub start: u64,
    /// Range end, exclusive. `u64::MAX` locks to end of file.
    pub end: u64,
    /// Shared (read) lock rather than exclusive.
    pub shared: bool,
    owner: Weak<()>,
}

impl RangeLock {
    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }
}

/// The growable byte buffer and lock list backing one file node.
#[derive(Debug)]
pub struct FileContent {
    size: u64,
    buf: Vec<u8>,
    dirty: bool,
    locks: Vec<RangeLock>,
    limiter: Arc<ResourceLimiter>,
}

impl FileContent {
    /// Creates an empty content store charging against the given limiter.
    pub fn new(limiter: Arc<ResourceLimiter>) -> Self {
        Self {
            size: 0,
            buf: Vec::new(),
            dirty: false,
            locks: Vec::new(),
            limiter,
        }
    }

    /// Creates a content store holding a copy of `bytes`, reserving space
    /// for them up front.
    pub fn with_bytes(limiter: Arc<ResourceLimiter>, bytes: &[u8]) -> Result<Self, FsError> {
        limiter.try_acquire_space(bytes.len() as u64)?;
        Ok(Self {
            size: bytes.len() as u64,
            buf: bytes.to_vec(),
            dirty: false,
            locks: Vec::new(),
            limiter,
        })
    }

    /// Authoritative byte length, independent of buffer capacity.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns true if the content has unsynced modifications.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clears the dirty flag, modeling a durability sync.
    pub fn sync(&mut self) {
        self.dirty = false;
    }

    /// Copies bytes starting at `position` into `dst`.
    ///
    /// Returns the number of bytes read; 0 signals end of data when
    /// `position` is at or past the current size. Never reads past `size`
    /// even when the buffer capacity is larger.
    pub fn read(&self, position: u64, dst: &mut [u8]) -> usize {
        if position >= self.size {
            return 0;
        }
        let start = position as usize;
        let available = (self.size as usize) - start;
        let n = dst.len().min(available);
        dst[..n].copy_from_slice(&self.buf[start..start + n]);
        n
    }

    /// Writes `src` at `position`, growing the file as needed.
    ///
    /// Writing past the current size is a valid sparse-by-growth extension:
    /// the gap is zero-filled. Growth reserves space through the limiter
    /// before any byte is modified, so a failed write leaves the content
    /// untouched.
    pub fn write(&mut self, position: u64, src: &[u8]) -> Result<usize, FsError> {
        let end = position
            .checked_add(src.len() as u64)
            .filter(|&e| e <= ADDRESSABLE_LIMIT)
            .ok_or(FsError::NoSpace {
                requested: src.len() as u64,
                free: ADDRESSABLE_LIMIT.saturating_sub(position),
            })?;

        if end > self.size {
            self.limiter.try_acquire_space(end - self.size)?;
            self.ensure_capacity(end as usize);
            // Zero-fill any gap between old size and the write position.
            self.buf.resize(end as usize, 0);
            self.size = end;
        }

        let start = position as usize;
        self.buf[start..start + src.len()].copy_from_slice(src);
        self.dirty = true;
        Ok(src.len())
    }

    /// Shrinks the file to `new_size`, returning the freed bytes to the
    /// limiter. Growing via truncate is an error.
    pub fn truncate(&mut self, new_size: u64) -> Result<(), FsError> {
        if new_size > self.size {
            return Err(FsError::InvalidArgument(format!(
                "truncate cannot grow a file: {} > {}",
                new_size, self.size
            )));
        }
        self.limiter.release_space(self.size - new_size);
        self.size = new_size;
        self.buf.truncate(new_size as usize);
        // Reclaim grossly oversized buffers.
        if self.buf.capacity() / 4 > (new_size as usize).max(MIN_CAPACITY) {
            self.buf.shrink_to((new_size as usize).saturating_mul(2));
        }
        self.dirty = true;
        Ok(())
    }

    /// Attempts to take an advisory lock on `[start, start + len)`.
    ///
    /// Overlap with any active lock on this content is rejected regardless of
    /// which channel holds it. Locks whose owning channel has gone away are
    /// pruned here, lazily, before the overlap check.
    pub fn try_lock(
        &mut self,
        owner: &LockToken,
        start: u64,
        len: u64,
        shared: bool,
    ) -> Result<(), FsError> {
        let end = start.checked_add(len).unwrap_or(u64::MAX);
        if len == 0 {
            return Err(FsError::InvalidArgument("zero-length lock range".into()));
        }

        self.locks.retain(|lock| lock.owner.strong_count() > 0);

        if self.locks.iter().any(|lock| lock.overlaps(start, end)) {
            return Err(FsError::LockOverlap { start, end });
        }

        self.locks.push(RangeLock {
            start,
            end,
            shared,
            owner: Arc::downgrade(owner),
        });
        Ok(())
    }

    /// Releases the lock on exactly `[start, start + len)` held by `owner`.
    /// Returns true if such a lock existed.
    pub fn release_lock(&mut self, owner: &LockToken, start: u64, len: u64) -> bool {
        let end = start.checked_add(len).unwrap_or(u64::MAX);
        let before = self.locks.len();
        self.locks.retain(|lock| {
            !(lock.start == start && lock.end == end && lock.owner.ptr_eq(&Arc::downgrade(owner)))
        });
        self.locks.len() != before
    }

    /// Number of currently recorded locks, including not-yet-pruned stale ones.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Returns a copy of the full content, for copy operations and tests.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.buf[..self.size as usize].to_vec()
    }

    fn ensure_capacity(&mut self, needed: usize) {
        if self.buf.capacity() >= needed {
            return;
        }
        let mut cap = self.buf.capacity().max(MIN_CAPACITY);
        while cap < needed {
            cap = cap.saturating_mul(2).min(ADDRESSABLE_LIMIT as usize);
        }
        self.buf.reserve_exact(cap - self.buf.len());
    }
}

impl Drop for FileContent {
    fn drop(&mut self) {
        // The last owner (node graph entry or open channel) is gone; give the
        // reservation back.
        self.limiter.release_space(self.size);
        self.size = 0;
    }
}
