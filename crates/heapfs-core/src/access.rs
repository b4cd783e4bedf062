//! Permission and attribute checks applied before operations.
//!
//! Under POSIX semantics the classic owner/group/other mode-bit triads gate
//! reads, writes and directory traversal for the engine's synthetic identity.
//! Under Windows semantics mode bits are ignored and the read-only DOS flag
//! blocks deletion and write-opens instead.

use crate::config::Semantics;
use crate::node::{DosAttributes, NodeAttr};
use crate::types::FsError;

/// The access being requested on a node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    /// Read the content or list the directory.
    Read,
    /// Modify the content or the directory's entries.
    Write,
    /// Execute the file or traverse the directory.
    Execute,
}

impl Access {
    /// Bit within a 3-bit permission triad.
    fn bit(self) -> u32 {
        match self {
            Access::Read => 0o4,
            Access::Write => 0o2,
            Access::Execute => 0o1,
        }
    }
}

/// Checks mode bits for the requesting identity under POSIX semantics.
/// Windows semantics skip mode bits entirely.
pub fn check_access(
    semantics: Semantics,
    attr: &NodeAttr,
    uid: u32,
    gid: u32,
    want: Access,
    path: &str,
) -> Result<(), FsError> {
    if semantics == Semantics::Windows {
        return Ok(());
    }
    let triad = if uid == attr.uid {
        (attr.mode >> 6) & 0o7
    } else if gid == attr.gid {
        (attr.mode >> 3) & 0o7
    } else {
        attr.mode & 0o7
    };
    if triad & want.bit() == 0 {
        return Err(FsError::AccessDenied(format!(
            "{:?} access to {} denied by mode {:o}",
            want, path, attr.mode
        )));
    }
    Ok(())
}

/// Under Windows semantics a read-only node cannot be opened for writing.
pub fn check_write_open(
    semantics: Semantics,
    dos: &DosAttributes,
    path: &str,
) -> Result<(), FsError> {
    if semantics == Semantics::Windows && dos.readonly {
        return Err(FsError::AccessDenied(format!(
            "{} is read-only and cannot be opened for writing",
            path
        )));
    }
    Ok(())
}

/// Under Windows semantics a read-only node cannot be deleted or renamed away.
pub fn check_delete(
    semantics: Semantics,
    dos: &DosAttributes,
    path: &str,
) -> Result<(), FsError> {
    if semantics == Semantics::Windows && dos.readonly {
        return Err(FsError::AccessDenied(format!(
            "{} is read-only and cannot be deleted",
            path
        )));
    }
    Ok(())
}
