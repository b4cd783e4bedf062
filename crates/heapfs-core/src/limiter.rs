//! Disk-space and open-handle accounting.
//!
//! The limiter is pure bookkeeping over two atomic counters and is deliberately
//! independent of the filesystem metadata lock: content stores release space
//! while holding only their own per-file lock.
//!
//! Acquire operations fail with a capacity error when the budget would be
//! exceeded. Release operations never fail; driving a counter negative is an
//! internal invariant violation and aborts the process.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::FsError;

/// Tracks remaining disk space and remaining open-handle count.
#[derive(Debug)]
pub struct ResourceLimiter {
    space_budget: u64,
    handle_budget: u64,
    space_used: AtomicU64,
    handles_open: AtomicU64,
}

impl ResourceLimiter {
    /// Creates a limiter with the given byte and handle budgets.
    /// `u64::MAX` means unbounded.
    pub fn new(space_budget: u64, handle_budget: u64) -> Self {
        Self {
            space_budget,
            handle_budget,
            space_used: AtomicU64::new(0),
            handles_open: AtomicU64::new(0),
        }
    }

    /// Reserves `bytes` from the space budget.
    pub fn try_acquire_space(&self, bytes: u64) -> Result<(), FsError> {
        let mut used = self.space_used.load(Ordering::Acquire);
        loop {
            let free = self.space_budget - used;
            if bytes > free {
                return Err(FsError::NoSpace {
                    requested: bytes,
                    free,
                });
            }
            match self.space_used.compare_exchange_weak(
                used,
                used + bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => used = actual,
            }
        }
    }

    /// Returns `bytes` to the space budget.
    ///
    /// Panics if more space would be released than is currently reserved;
    /// that is a bookkeeping defect, not a recoverable condition.
    pub fn release_space(&self, bytes: u64) {
        self.space_used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_sub(bytes)
            })
            .unwrap_or_else(|used| {
                panic!(
                    "resource limiter: released {} bytes with only {} reserved",
                    bytes, used
                )
            });
    }

    /// Reserves one open handle.
    pub fn try_acquire_handle(&self) -> Result<(), FsError> {
        let mut open = self.handles_open.load(Ordering::Acquire);
        loop {
            if open >= self.handle_budget {
                return Err(FsError::TooManyOpenHandles {
                    limit: self.handle_budget,
                });
            }
            match self.handles_open.compare_exchange_weak(
                open,
                open + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => open = actual,
            }
        }
    }

    /// Returns one open handle to the budget.
    ///
    /// Panics if no handle is currently reserved.
    pub fn release_handle(&self) {
        self.handles_open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                open.checked_sub(1)
            })
            .unwrap_or_else(|_| panic!("resource limiter: released a handle with none open"));
    }

    /// Returns the bytes still unreserved in the space budget.
    pub fn free_space(&self) -> u64 {
        self.space_budget - self.space_used.load(Ordering::Acquire)
    }

    /// Returns the bytes currently reserved.
    pub fn space_used(&self) -> u64 {
        self.space_used.load(Ordering::Acquire)
    }

    /// Returns the number of currently open handles.
    pub fn open_handles(&self) -> u64 {
        self.handles_open.load(Ordering::Acquire)
    }
}
