//! Metadata snapshots and attribute views.
//!
//! [`Metadata`] is a point-in-time copy of a node's attributes taken under the
//! metadata lock; it never aliases live engine state. The view enums expose the
//! same data keyed the way stat-style callers ask for it, one closed enum per
//! view family.

use serde::{Deserialize, Serialize};

use crate::node::{DosAttributes, Node};
use crate::types::{FileType, NodeId, Timestamp};

/// Basic attribute family: size, type, and the three timestamps.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BasicAttr {
    /// Byte size of the content (0 for directories).
    Size,
    /// The file type.
    FileType,
    /// Creation time.
    Created,
    /// Last modification time.
    Modified,
    /// Last access time.
    Accessed,
}

/// POSIX attribute family.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PosixAttr {
    /// Permission bits.
    Mode,
    /// Hard link count.
    Nlink,
    /// Owner user id.
    Uid,
    /// Owner group id.
    Gid,
}

/// Owner attribute family.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnerAttr {
    /// Owner user id.
    Uid,
    /// Owner group id.
    Gid,
}

/// DOS attribute family.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DosAttr {
    /// Archive flag.
    Archive,
    /// Hidden flag.
    Hidden,
    /// Read-only flag.
    ReadOnly,
    /// System flag.
    System,
}

/// A single attribute value, tagged by representation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrValue {
    /// Unsigned 32-bit value (mode, nlink, uid, gid).
    U32(u32),
    /// Unsigned 64-bit value (size).
    U64(u64),
    /// Boolean flag value.
    Bool(bool),
    /// Timestamp value.
    Time(Timestamp),
    /// File type value.
    Type(FileType),
}

/// A point-in-time copy of one node's metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Node id.
    pub id: NodeId,
    /// File type.
    pub file_type: FileType,
    /// Content size in bytes; 0 for directories.
    pub size: u64,
    /// Hard link count.
    pub nlink: u32,
    /// Permission bits.
    pub mode: u32,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Creation time.
    pub created: Timestamp,
    /// Last modification time.
    pub modified: Timestamp,
    /// Last access time.
    pub accessed: Timestamp,
    /// DOS attribute flags.
    pub dos: DosAttributes,
}

impl Metadata {
    /// Snapshots a node. The caller supplies the content size because reading
    /// it requires the content lock, which the metadata lock must not wait on.
    pub(crate) fn snapshot(node: &Node, size: u64) -> Self {
        Self {
            id: node.attr.id,
            file_type: node.attr.file_type,
            size,
            nlink: node.attr.nlink,
            mode: node.attr.mode,
            uid: node.attr.uid,
            gid: node.attr.gid,
            created: node.attr.created,
            modified: node.attr.modified,
            accessed: node.attr.accessed,
            dos: node.dos,
        }
    }

    /// Returns true for a regular file.
    pub fn is_file(&self) -> bool {
        self.file_type == FileType::RegularFile
    }

    /// Returns true for a directory.
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// Content size in bytes.
    pub fn len(&self) -> u64 {
        self.size
    }

    /// Returns true if the content is empty.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Reads one basic-view attribute.
    pub fn basic(&self, attr: BasicAttr) -> AttrValue {
        match attr {
            BasicAttr::Size => AttrValue::U64(self.size),
            BasicAttr::FileType => AttrValue::Type(self.file_type),
            BasicAttr::Created => AttrValue::Time(self.created),
            BasicAttr::Modified => AttrValue::Time(self.modified),
            BasicAttr::Accessed => AttrValue::Time(self.accessed),
        }
    }

    /// Reads one POSIX-view attribute.
    pub fn posix(&self, attr: PosixAttr) -> AttrValue {
        match attr {
            PosixAttr::Mode => AttrValue::U32(self.mode),
            PosixAttr::Nlink => AttrValue::U32(self.nlink),
            PosixAttr::Uid => AttrValue::U32(self.uid),
            PosixAttr::Gid => AttrValue::U32(self.gid),
        }
    }

    /// Reads one owner-view attribute.
    pub fn owner(&self, attr: OwnerAttr) -> AttrValue {
        match attr {
            OwnerAttr::Uid => AttrValue::U32(self.uid),
            OwnerAttr::Gid => AttrValue::U32(self.gid),
        }
    }

    /// Reads one DOS-view attribute.
    pub fn dos(&self, attr: DosAttr) -> AttrValue {
        match attr {
            DosAttr::Archive => AttrValue::Bool(self.dos.archive),
            DosAttr::Hidden => AttrValue::Bool(self.dos.hidden),
            DosAttr::ReadOnly => AttrValue::Bool(self.dos.readonly),
            DosAttr::System => AttrValue::Bool(self.dos.system),
        }
    }
}
