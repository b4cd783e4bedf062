//! Filesystem construction options.
//!
//! An engine's semantics are fixed at construction: separator and root name,
//! case sensitivity, POSIX-vs-Windows behavior, and the resource budgets the
//! limiter enforces. Defaults are unbounded budgets with POSIX semantics.

use serde::{Deserialize, Serialize};

/// Default bound on symlink resolution restarts before reporting a cycle.
pub const DEFAULT_MAX_SYMLINK_RESTARTS: u32 = 40;

/// Platform semantics the engine emulates.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Semantics {
    /// POSIX behavior: case-sensitive names, permission bits honored.
    Posix,
    /// Windows behavior: case-insensitive names, read-only flag blocks
    /// deletion and write-opens.
    Windows,
}

/// Filesystem construction options.
///
/// Built with chained setters:
///
/// ```
/// use heapfs_core::config::FsConfig;
///
/// let config = FsConfig::posix()
///     .total_space(1_000_000)
///     .max_open_handles(64);
/// assert_eq!(config.total_space, 1_000_000);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FsConfig {
    /// Name of the filesystem root, e.g. `/` or `C:\`.
    pub root: String,
    /// Path separator character.
    pub separator: char,
    /// Whether name lookup ignores ASCII case.
    pub case_insensitive: bool,
    /// Platform semantics flag.
    pub semantics: Semantics,
    /// Maximum concurrently open handles. Default: unbounded.
    pub max_open_handles: u64,
    /// Total disk-space budget in bytes. Default: unbounded.
    pub total_space: u64,
    /// Maximum rendered path length in bytes. Default: unbounded.
    pub max_path_length: usize,
    /// Maximum symlink resolution restarts before failing with a cycle error.
    pub max_symlink_restarts: u32,
    /// Permission bits applied to new files when the caller passes none.
    pub default_file_mode: u32,
    /// Permission bits applied to new directories when the caller passes none.
    pub default_dir_mode: u32,
    /// Synthetic owner user ID for all nodes.
    pub uid: u32,
    /// Synthetic owner group ID for all nodes.
    pub gid: u32,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self::posix()
    }
}

impl FsConfig {
    /// Creates a POSIX-flavored configuration: `/` root, case-sensitive.
    pub fn posix() -> Self {
        Self {
            root: "/".to_string(),
            separator: '/',
            case_insensitive: false,
            semantics: Semantics::Posix,
            max_open_handles: u64::MAX,
            total_space: u64::MAX,
            max_path_length: usize::MAX,
            max_symlink_restarts: DEFAULT_MAX_SYMLINK_RESTARTS,
            default_file_mode: 0o644,
            default_dir_mode: 0o755,
            uid: 1000,
            gid: 1000,
        }
    }

    /// Creates a Mac-flavored configuration: POSIX behavior with
    /// case-insensitive name lookup.
    pub fn mac() -> Self {
        Self {
            case_insensitive: true,
            ..Self::posix()
        }
    }

    /// Creates a Windows-flavored configuration: `C:\` root, case-insensitive,
    /// read-only flag enforced on delete and write-open.
    pub fn windows() -> Self {
        Self {
            root: "C:\\".to_string(),
            separator: '\\',
            case_insensitive: true,
            semantics: Semantics::Windows,
            ..Self::posix()
        }
    }

    /// Sets the root name.
    pub fn root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    /// Sets the path separator character.
    pub fn separator(mut self, sep: char) -> Self {
        self.separator = sep;
        self
    }

    /// Sets case-insensitive name lookup.
    pub fn case_insensitive(mut self, yes: bool) -> Self {
        self.case_insensitive = yes;
        self
    }

    /// Sets the open-handle budget.
    pub fn max_open_handles(mut self, n: u64) -> Self {
        self.max_open_handles = n;
        self
    }

    /// Sets the total disk-space budget in bytes.
    pub fn total_space(mut self, bytes: u64) -> Self {
        self.total_space = bytes;
        self
    }

    /// Sets the maximum rendered path length in bytes.
    pub fn max_path_length(mut self, len: usize) -> Self {
        self.max_path_length = len;
        self
    }

    /// Sets the symlink resolution restart bound.
    pub fn max_symlink_restarts(mut self, n: u32) -> Self {
        self.max_symlink_restarts = n;
        self
    }

    /// Sets the synthetic owner identity for all nodes.
    pub fn owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posix_defaults() {
        let config = FsConfig::posix();
        assert_eq!(config.root, "/");
        assert_eq!(config.separator, '/');
        assert!(!config.case_insensitive);
        assert_eq!(config.semantics, Semantics::Posix);
        assert_eq!(config.max_open_handles, u64::MAX);
        assert_eq!(config.total_space, u64::MAX);
        assert_eq!(config.max_path_length, usize::MAX);
        assert_eq!(config.max_symlink_restarts, DEFAULT_MAX_SYMLINK_RESTARTS);
    }

    #[test]
    fn test_mac_defaults() {
        let config = FsConfig::mac();
        assert_eq!(config.root, "/");
        assert!(config.case_insensitive);
        assert_eq!(config.semantics, Semantics::Posix);
    }

    #[test]
    fn test_windows_defaults() {
        let config = FsConfig::windows();
        assert_eq!(config.root, "C:\\");
        assert_eq!(config.separator, '\\');
        assert!(config.case_insensitive);
        assert_eq!(config.semantics, Semantics::Windows);
    }

    #[test]
    fn test_builder_chain() {
        let config = FsConfig::posix()
            .total_space(4096)
            .max_open_handles(8)
            .max_path_length(255)
            .max_symlink_restarts(5)
            .owner(0, 0);
        assert_eq!(config.total_space, 4096);
        assert_eq!(config.max_open_handles, 8);
        assert_eq!(config.max_path_length, 255);
        assert_eq!(config.max_symlink_restarts, 5);
        assert_eq!(config.uid, 0);
        assert_eq!(config.gid, 0);
    }
}
