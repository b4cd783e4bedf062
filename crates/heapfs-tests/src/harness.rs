//! Test harness: filesystem construction presets and tree seeding.

use anyhow::{Context, Result};
use heapfs_core::{FsConfig, MemFs};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a fmt subscriber honoring `RUST_LOG`, once per process.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A filesystem under test plus seeding helpers.
pub struct TestFs {
    pub fs: MemFs,
}

impl TestFs {
    /// Unbounded POSIX filesystem.
    pub fn posix() -> Self {
        init_tracing();
        Self {
            fs: MemFs::new(FsConfig::posix()),
        }
    }

    /// Unbounded Windows filesystem (`C:\` root, case-insensitive).
    pub fn windows() -> Self {
        init_tracing();
        Self {
            fs: MemFs::new(FsConfig::windows()),
        }
    }

    /// POSIX filesystem with explicit space and handle budgets.
    pub fn bounded(space: u64, handles: u64) -> Self {
        init_tracing();
        Self {
            fs: MemFs::new(
                FsConfig::posix()
                    .total_space(space)
                    .max_open_handles(handles),
            ),
        }
    }

    /// Creates the given directories (with ancestors) and files in order.
    pub fn seed(&self, dirs: &[&str], files: &[(&str, &[u8])]) -> Result<()> {
        for dir in dirs {
            self.fs
                .create_dir_all(dir)
                .with_context(|| format!("seeding directory {}", dir))?;
        }
        for (path, bytes) in files {
            self.fs
                .write(path, bytes)
                .with_context(|| format!("seeding file {}", path))?;
        }
        Ok(())
    }
}

/// Deterministic pseudo-random payload for content tests.
pub fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}
