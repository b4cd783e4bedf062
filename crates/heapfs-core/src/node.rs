//! The node graph: files, directories, and the named edges between them.
//!
//! Nodes live in an arena keyed by [`NodeId`]; parent/child relations are
//! id-to-id edges, so hard links (multiple parents) cannot create ownership
//! cycles. A node exists as long as it is the root or at least one referencing
//! parent still exists; its content reservation is returned once both its
//! hard-link count and open-handle count are zero.
//!
//! All access is guarded by the filesystem-wide metadata lock held by the
//! engine; nothing here blocks.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::config::FsConfig;
use crate::content::FileContent;
use crate::limiter::ResourceLimiter;
use crate::types::{EntryId, FileType, FsError, NodeId, Timestamp};

/// Windows-style attribute flags tracked per node.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DosAttributes {
    /// Archive flag, set on every content modification.
    pub archive: bool,
    /// Hidden flag.
    pub hidden: bool,
    /// Read-only flag; blocks delete and write-open under Windows semantics.
    pub readonly: bool,
    /// System flag.
    pub system: bool,
}

/// Node attributes combining POSIX stat fields with DOS flags.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttr {
    /// Node number
    pub id: NodeId,
    /// File type, fixed at creation
    pub file_type: FileType,
    /// Permission bits (lower 12 bits)
    pub mode: u32,
    /// Hard link count: the number of directory entries referencing this node
    pub nlink: u32,
    /// Owner user ID
    pub uid: u32,
    /// Owner group ID
    pub gid: u32,
    /// Creation time
    pub created: Timestamp,
    /// Last modification time
    pub modified: Timestamp,
    /// Last access time
    pub accessed: Timestamp,
}

impl NodeAttr {
    fn new(id: NodeId, file_type: FileType, mode: u32, uid: u32, gid: u32) -> Self {
        let now = Timestamp::now();
        Self {
            id,
            file_type,
            mode,
            nlink: 0,
            uid,
            gid,
            created: now,
            modified: now,
            accessed: now,
        }
    }
}

/// What a directory entry points at: a node, or a raw symlink target path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Hard link to a node.
    Node(NodeId),
    /// Symbolic link holding an unparsed target path string.
    Symlink(String),
}

/// A named edge inside a directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Stable unique id, used as the file key for symlink entries.
    pub id: EntryId,
    /// Entry creation time.
    pub created: Timestamp,
    /// Hard link or symlink payload.
    pub kind: EntryKind,
}

/// A file or directory in the graph.
#[derive(Debug)]
pub struct Node {
    /// Stat-style attributes.
    pub attr: NodeAttr,
    /// DOS attribute flags.
    pub dos: DosAttributes,
    /// Directory entries, keyed by normalized name. Empty for files.
    entries: BTreeMap<String, DirEntry>,
    /// Content store, present exactly for files.
    content: Option<Arc<Mutex<FileContent>>>,
    /// Directories that reference this node; duplicates are allowed when the
    /// same directory links a node more than once. Used only for existence
    /// tests and path rendering, never for freeing.
    parents: Vec<NodeId>,
    /// Open channels on this node.
    open_handles: u32,
    /// Unsynced directory mutation flag (file dirtiness lives in the content).
    dirty: bool,
    /// Set when nlink reaches zero; re-linking a retired node is fatal.
    retired: bool,
}

impl Node {
    /// Returns true if this node is a directory.
    pub fn is_directory(&self) -> bool {
        self.attr.file_type == FileType::Directory
    }

    /// Returns true if this node is a regular file.
    pub fn is_file(&self) -> bool {
        self.attr.file_type == FileType::RegularFile
    }

    /// Number of entries, for directories.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of channels currently open on this node.
    pub fn open_handles(&self) -> u32 {
        self.open_handles
    }

    /// Returns the shared content store of a file node.
    pub fn content(&self) -> Option<Arc<Mutex<FileContent>>> {
        self.content.clone()
    }

    /// Unsynced directory mutation flag.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// The arena of nodes plus the bookkeeping to mutate it consistently.
pub struct NodeTable {
    nodes: HashMap<NodeId, Node>,
    next_node: u64,
    next_entry: u64,
    case_insensitive: bool,
    max_path_length: usize,
    root_name: String,
    separator: char,
    default_uid: u32,
    default_gid: u32,
    limiter: Arc<ResourceLimiter>,
}

impl NodeTable {
    /// Creates a table holding only the root directory.
    pub fn new(config: &FsConfig, limiter: Arc<ResourceLimiter>) -> Self {
        let mut table = Self {
            nodes: HashMap::new(),
            next_node: NodeId::ROOT.as_u64() + 1,
            next_entry: 1,
            case_insensitive: config.case_insensitive,
            max_path_length: config.max_path_length,
            root_name: config.root.clone(),
            separator: config.separator,
            default_uid: config.uid,
            default_gid: config.gid,
            limiter,
        };
        let mut attr = NodeAttr::new(
            NodeId::ROOT,
            FileType::Directory,
            config.default_dir_mode,
            config.uid,
            config.gid,
        );
        attr.nlink = 1;
        table.nodes.insert(
            NodeId::ROOT,
            Node {
                attr,
                dos: DosAttributes::default(),
                entries: BTreeMap::new(),
                content: None,
                parents: Vec::new(),
                open_handles: 0,
                dirty: false,
                retired: false,
            },
        );
        table
    }

    /// Normalizes a name for lookup under the configured case rule.
    pub fn normalize(&self, name: &str) -> String {
        if self.case_insensitive {
            name.to_lowercase()
        } else {
            name.to_string()
        }
    }

    /// Returns the node for an id, if it is still in the arena.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Mutable access to a node.
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    /// Looks up an entry by name. Fails if `dir` is missing or not a directory;
    /// an absent name is `Ok(None)`.
    pub fn lookup(&self, dir: NodeId, name: &str) -> Result<Option<&DirEntry>, FsError> {
        let node = self.require_dir(dir)?;
        Ok(node.entries.get(&self.normalize(name)))
    }

    /// Lists a directory's entries in name order.
    pub fn list(&self, dir: NodeId) -> Result<Vec<(String, DirEntry)>, FsError> {
        let node = self.require_dir(dir)?;
        Ok(node
            .entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect())
    }

    /// Creates a file node and installs an entry for it.
    pub fn add_file(&mut self, dir: NodeId, name: &str, mode: u32) -> Result<NodeId, FsError> {
        let name = self.prepare_add(dir, name)?;
        let id = self.alloc_node_id();
        let attr = NodeAttr::new(
            id,
            FileType::RegularFile,
            mode,
            self.default_uid,
            self.default_gid,
        );
        let content = FileContent::new(Arc::clone(&self.limiter));
        self.nodes.insert(
            id,
            Node {
                attr,
                dos: DosAttributes {
                    archive: true,
                    ..DosAttributes::default()
                },
                entries: BTreeMap::new(),
                content: Some(Arc::new(Mutex::new(content))),
                parents: Vec::new(),
                open_handles: 0,
                dirty: false,
                retired: false,
            },
        );
        self.install_entry(dir, name, EntryKind::Node(id));
        Ok(id)
    }

    /// Creates a directory node and installs an entry for it.
    pub fn add_directory(&mut self, dir: NodeId, name: &str, mode: u32) -> Result<NodeId, FsError> {
        let name = self.prepare_add(dir, name)?;
        let id = self.alloc_node_id();
        let attr = NodeAttr::new(
            id,
            FileType::Directory,
            mode,
            self.default_uid,
            self.default_gid,
        );
        self.nodes.insert(
            id,
            Node {
                attr,
                dos: DosAttributes::default(),
                entries: BTreeMap::new(),
                content: None,
                parents: Vec::new(),
                open_handles: 0,
                dirty: false,
                retired: false,
            },
        );
        self.install_entry(dir, name, EntryKind::Node(id));
        Ok(id)
    }

    /// Installs a symbolic-link entry holding a raw target path.
    pub fn add_symlink(
        &mut self,
        dir: NodeId,
        name: &str,
        target: &str,
    ) -> Result<EntryId, FsError> {
        let name = self.prepare_add(dir, name)?;
        Ok(self.install_entry(dir, name, EntryKind::Symlink(target.to_string())))
    }

    /// Installs an additional hard link to an existing file node.
    pub fn add_hard_link(&mut self, dir: NodeId, name: &str, node: NodeId) -> Result<(), FsError> {
        let target = self
            .nodes
            .get(&node)
            .ok_or_else(|| FsError::NotFound(node.to_string()))?;
        if target.is_directory() {
            return Err(FsError::InvalidArgument(
                "hard links to directories are not permitted".to_string(),
            ));
        }
        let name = self.prepare_add(dir, name)?;
        self.install_entry(dir, name, EntryKind::Node(node));
        Ok(())
    }

    /// Removes a named entry, decrementing the target's link count exactly
    /// once. Removing a non-empty directory fails.
    pub fn remove(&mut self, dir: NodeId, name: &str) -> Result<DirEntry, FsError> {
        let normalized = {
            let node = self.require_dir(dir)?;
            let normalized = self.normalize(name);
            let entry = node
                .entries
                .get(&normalized)
                .ok_or_else(|| FsError::NotFound(name.to_string()))?;
            if let EntryKind::Node(child) = entry.kind {
                let child_node = &self.nodes[&child];
                if child_node.is_directory() && child_node.entry_count() > 0 {
                    return Err(FsError::DirectoryNotEmpty(self.path_string(child)));
                }
            }
            normalized
        };

        let parent = self.nodes.get_mut(&dir).expect("checked above");
        let entry = parent.entries.remove(&normalized).expect("checked above");
        Self::mark_dir_mutated(parent);

        if let EntryKind::Node(child) = entry.kind {
            self.detach_parent(child, dir);
            self.unlink_node(child);
        }
        Ok(entry)
    }

    /// Moves an entry to a new directory and name in one step, preserving the
    /// target node's link count. The destination name must be vacant; moving
    /// an entry onto itself is a no-op.
    pub fn move_entry(
        &mut self,
        src_dir: NodeId,
        src_name: &str,
        dst_dir: NodeId,
        dst_name: &str,
    ) -> Result<(), FsError> {
        let src_norm = self.normalize(src_name);
        {
            let node = self.require_dir(src_dir)?;
            if !node.entries.contains_key(&src_norm) {
                return Err(FsError::NotFound(src_name.to_string()));
            }
        }
        if src_dir == dst_dir && src_norm == self.normalize(dst_name) {
            return Ok(());
        }
        let dst_norm = self.prepare_add(dst_dir, dst_name)?;

        let src = self.nodes.get_mut(&src_dir).expect("checked above");
        let entry = src.entries.remove(&src_norm).expect("checked above");
        Self::mark_dir_mutated(src);

        if let EntryKind::Node(child) = &entry.kind {
            let child = *child;
            self.detach_parent(child, src_dir);
            self.nodes
                .get_mut(&child)
                .expect("moved entry target exists")
                .parents
                .push(dst_dir);
        }
        let dst = self
            .nodes
            .get_mut(&dst_dir)
            .expect("validated by prepare_add");
        dst.entries.insert(dst_norm, entry);
        Self::mark_dir_mutated(dst);
        Ok(())
    }

    /// True if `ancestor` is `node` itself or lies on any parent chain from
    /// `node` to the root. Used to reject moving a directory into its own
    /// subtree.
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            if current == ancestor {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(n) = self.nodes.get(&current) {
                stack.extend(n.parents.iter().copied());
            }
        }
        false
    }

    /// Whether the node is reachable from the root through parent references.
    pub fn is_attached(&self, id: NodeId) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if current == NodeId::ROOT {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.parents.iter().copied());
            }
        }
        false
    }

    /// Renders a path from the root to the node, following first parents.
    pub fn path_string(&self, id: NodeId) -> String {
        let mut names = Vec::new();
        let mut current = id;
        while current != NodeId::ROOT {
            let Some(node) = self.nodes.get(&current) else {
                break;
            };
            let Some(&parent) = node.parents.first() else {
                break;
            };
            if let Some(parent_node) = self.nodes.get(&parent) {
                if let Some((name, _)) = parent_node
                    .entries
                    .iter()
                    .find(|(_, e)| e.kind == EntryKind::Node(current))
                {
                    names.push(name.clone());
                }
            }
            current = parent;
        }
        let mut path = self.root_name.clone();
        for name in names.iter().rev() {
            if !path.ends_with(self.separator) {
                path.push(self.separator);
            }
            path.push_str(name);
        }
        path
    }

    /// Records an open channel on the node.
    pub fn register_open(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.open_handles += 1;
        }
    }

    /// Records a closed channel; drops the node if fully unlinked.
    pub fn release_open(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            assert!(node.open_handles > 0, "open handle count underflow");
            node.open_handles -= 1;
        }
        self.maybe_drop(id);
    }

    /// Clears the directory dirty flag, modeling a directory fsync.
    pub fn sync_dir(&mut self, id: NodeId) -> Result<(), FsError> {
        let path = self.path_string(id);
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        if !node.is_directory() {
            return Err(FsError::NotADirectory(path));
        }
        node.dirty = false;
        Ok(())
    }

    /// Returns true if no directory has unsynced mutations.
    pub fn all_dirs_synced(&self) -> bool {
        self.nodes
            .values()
            .filter(|n| n.is_directory())
            .all(|n| !n.dirty)
    }

    /// Iterates over every node in the arena.
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Node)> {
        self.nodes.iter()
    }

    fn alloc_node_id(&mut self) -> NodeId {
        let id = NodeId::new(self.next_node);
        self.next_node += 1;
        id
    }

    fn alloc_entry_id(&mut self) -> EntryId {
        let id = EntryId::new(self.next_entry);
        self.next_entry += 1;
        id
    }

    /// Validates name and capacity for an add into `dir`; returns the
    /// normalized name. The entry must not already exist.
    fn prepare_add(&self, dir: NodeId, name: &str) -> Result<String, FsError> {
        if name.is_empty() || name == "." || name == ".." {
            return Err(FsError::InvalidArgument(format!(
                "'{}' is not a valid entry name",
                name
            )));
        }
        if name.contains(self.separator) {
            return Err(FsError::InvalidArgument(format!(
                "entry name '{}' contains the separator",
                name
            )));
        }
        let node = self.require_dir(dir)?;
        let normalized = self.normalize(name);
        if node.entries.contains_key(&normalized) {
            return Err(FsError::AlreadyExists(name.to_string()));
        }
        let dir_path = self.path_string(dir);
        let rendered_len = if dir_path.ends_with(self.separator) {
            dir_path.len() + name.len()
        } else {
            dir_path.len() + 1 + name.len()
        };
        if rendered_len > self.max_path_length {
            return Err(FsError::PathTooLong {
                length: rendered_len,
                limit: self.max_path_length,
            });
        }
        Ok(normalized)
    }

    /// Installs a prepared entry, updating link counts and parent lists.
    fn install_entry(&mut self, dir: NodeId, normalized: String, kind: EntryKind) -> EntryId {
        let entry_id = self.alloc_entry_id();
        if let EntryKind::Node(child) = kind {
            self.link_node(child);
            self.nodes
                .get_mut(&child)
                .expect("link target exists")
                .parents
                .push(dir);
        }
        let parent = self.nodes.get_mut(&dir).expect("validated by prepare_add");
        parent.entries.insert(
            normalized,
            DirEntry {
                id: entry_id,
                created: Timestamp::now(),
                kind,
            },
        );
        Self::mark_dir_mutated(parent);
        entry_id
    }

    fn mark_dir_mutated(node: &mut Node) {
        node.dirty = true;
        node.attr.modified = Timestamp::now();
    }

    /// Increments a node's link count. Re-linking a node whose count already
    /// reached zero is a logic error ("resurrection") and aborts.
    fn link_node(&mut self, id: NodeId) {
        let node = self.nodes.get_mut(&id).expect("link target exists");
        assert!(
            !node.retired,
            "node {} resurrected: link count manipulated after reaching zero",
            id
        );
        node.attr.nlink += 1;
    }

    fn unlink_node(&mut self, id: NodeId) {
        let node = self.nodes.get_mut(&id).expect("unlink target exists");
        assert!(node.attr.nlink > 0, "node {} link count underflow", id);
        node.attr.nlink -= 1;
        if node.attr.nlink == 0 {
            node.retired = true;
        }
        self.maybe_drop(id);
    }

    fn detach_parent(&mut self, child: NodeId, dir: NodeId) {
        if let Some(node) = self.nodes.get_mut(&child) {
            if let Some(pos) = node.parents.iter().position(|&p| p == dir) {
                node.parents.swap_remove(pos);
            }
        }
    }

    /// Drops a fully unlinked node once no channel holds it open. Dropping
    /// releases the arena's content reference; the space reservation itself
    /// returns to the limiter when the last channel drops its clone.
    fn maybe_drop(&mut self, id: NodeId) {
        let drop_now = self
            .nodes
            .get(&id)
            .is_some_and(|n| n.retired && n.open_handles == 0);
        if drop_now {
            self.nodes.remove(&id);
        }
    }

    fn require_dir(&self, dir: NodeId) -> Result<&Node, FsError> {
        let node = self
            .nodes
            .get(&dir)
            .ok_or_else(|| FsError::NotFound(dir.to_string()))?;
        if !node.is_directory() {
            return Err(FsError::NotADirectory(self.path_string(dir)));
        }
        Ok(node)
    }
}
