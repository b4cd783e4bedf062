//! The filesystem engine: one facade tying together the node graph, path
//! resolution, open channels, the limiter, and change notification.
//!
//! All metadata (the node table and the watch registry) lives behind a single
//! filesystem-wide mutex. Operations take it, do their work, and release it;
//! none of them block while holding it. Per-file content locks nest inside
//! the metadata lock, never the other way around.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::access::{self, Access};
use crate::attr::Metadata;
use crate::channel::{FileChannel, OpenFlags};
use crate::config::FsConfig;
use crate::limiter::ResourceLimiter;
use crate::node::{DosAttributes, EntryKind, NodeTable};
use crate::resolve::{resolve, Outcome, ParsedPath, Resolution};
use crate::types::{FileType, FsError, NodeId, Timestamp};
use crate::watch::{EventKind, WatchKey, WatchRegistry, WatchService};

/// Metadata guarded by the filesystem-wide lock.
pub(crate) struct Meta {
    pub(crate) table: NodeTable,
    pub(crate) registry: WatchRegistry,
}

/// Bookkeeping record for one open channel.
#[derive(Clone, Debug)]
pub struct HandleInfo {
    /// The node the channel is open on.
    pub node: NodeId,
    /// Flags the channel was opened with.
    pub flags: OpenFlags,
    /// Rendered path at open time.
    pub path: String,
}

/// Shared engine state behind every [`MemFs`] clone and open channel.
pub(crate) struct FsState {
    pub(crate) config: FsConfig,
    pub(crate) limiter: Arc<ResourceLimiter>,
    pub(crate) meta: Mutex<Meta>,
    pub(crate) handles: DashMap<u64, HandleInfo>,
    pub(crate) next_handle: AtomicU64,
    pub(crate) service: WatchService,
}

impl FsState {
    pub(crate) fn lock_meta(&self) -> MutexGuard<'_, Meta> {
        self.meta.lock().expect("lock poisoned")
    }

    /// Called by a channel after a content write, with no content lock held.
    /// A write reports two occurrences on the parent directory, one for the
    /// data change and one for the attribute change; they coalesce into a
    /// single event with a count of 2.
    pub(crate) fn record_content_write(&self, node: NodeId, parent: NodeId, name: &str) {
        let mut meta = self.lock_meta();
        if let Some(n) = meta.table.node_mut(node) {
            n.attr.modified = Timestamp::now();
            n.dos.archive = true;
        }
        meta.registry.hear_change(parent, EventKind::Modify, name);
        meta.registry.hear_change(parent, EventKind::Modify, name);
    }

    /// Called by a channel after a content read, with no content lock held.
    pub(crate) fn record_content_read(&self, node: NodeId) {
        let mut meta = self.lock_meta();
        if let Some(n) = meta.table.node_mut(node) {
            n.attr.accessed = Timestamp::now();
        }
    }

    /// Called when a channel drops. The node is released from the open set
    /// and, if fully unlinked, leaves the arena here; its space returns to
    /// the limiter when the channel's content reference drops right after.
    pub(crate) fn channel_closed(&self, handle_id: u64, node: NodeId) {
        self.handles.remove(&handle_id);
        self.lock_meta().table.release_open(node);
        self.limiter.release_handle();
        debug!(handle_id, node = node.as_u64(), "channel closed");
    }
}

/// One listing row returned by [`MemFs::read_dir`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntryInfo {
    /// Entry name, normalized per the configured case rule.
    pub name: String,
    /// Type of the entry's target; symlink entries report their own type.
    pub file_type: FileType,
    /// Target node for hard-link entries; absent for symlinks.
    pub node: Option<NodeId>,
}

/// Metadata for a directory entry that may be a symlink.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryMetadata {
    /// The entry is a hard link; full node metadata.
    Node(Metadata),
    /// The entry is a symlink; only the raw target and creation time exist.
    Symlink {
        /// Raw, unresolved target path.
        target: String,
        /// Entry creation time.
        created: Timestamp,
    },
}

/// An in-memory filesystem. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct MemFs {
    state: Arc<FsState>,
}

impl MemFs {
    /// Creates a filesystem from configuration, containing only the root
    /// directory.
    pub fn new(config: FsConfig) -> Self {
        let limiter = Arc::new(ResourceLimiter::new(
            config.total_space,
            config.max_open_handles,
        ));
        let table = NodeTable::new(&config, Arc::clone(&limiter));
        debug!(root = %config.root, "filesystem created");
        Self {
            state: Arc::new(FsState {
                config,
                limiter,
                meta: Mutex::new(Meta {
                    table,
                    registry: WatchRegistry::new(),
                }),
                handles: DashMap::new(),
                next_handle: AtomicU64::new(1),
                service: WatchService::new(),
            }),
        }
    }

    /// The configuration this filesystem was built with.
    pub fn config(&self) -> &FsConfig {
        &self.state.config
    }

    fn parse(&self, path: &str) -> ParsedPath {
        ParsedPath::parse(path, &self.state.config)
    }

    fn resolve_in(
        &self,
        meta: &Meta,
        path: &str,
        follow_trailing: bool,
    ) -> Result<Resolution, FsError> {
        resolve(
            &meta.table,
            &self.state.config,
            &self.parse(path),
            follow_trailing,
        )
    }

    /// Resolves a path to its node id, following trailing symlinks.
    pub fn lookup(&self, path: &str) -> Result<NodeId, FsError> {
        let meta = self.state.lock_meta();
        self.resolve_in(&meta, path, true)?.require_node(path)
    }

    /// Returns true if the path resolves to an existing node.
    pub fn exists(&self, path: &str) -> bool {
        self.lookup(path).is_ok()
    }

    /// Creates an empty regular file. The final component must not already
    /// name an entry, symlink included.
    pub fn create_file(&self, path: &str) -> Result<NodeId, FsError> {
        debug!(path, "create_file");
        let mut meta = self.state.lock_meta();
        let res = self.resolve_in(&meta, path, false)?;
        match res.outcome {
            Outcome::MissingFinal { parent, name } => {
                let id = meta
                    .table
                    .add_file(parent, &name, self.state.config.default_file_mode)?;
                meta.registry.hear_change(parent, EventKind::Create, &name);
                Ok(id)
            }
            Outcome::Found(_) | Outcome::TrailingSymlink { .. } => {
                Err(FsError::AlreadyExists(path.to_string()))
            }
            Outcome::NoParent { .. } => Err(FsError::NotFound(path.to_string())),
        }
    }

    /// Creates a directory. The parent must already exist; the final
    /// component must not already name an entry, symlink included.
    pub fn create_directory(&self, path: &str) -> Result<NodeId, FsError> {
        debug!(path, "create_directory");
        let mut meta = self.state.lock_meta();
        let res = self.resolve_in(&meta, path, false)?;
        match res.outcome {
            Outcome::MissingFinal { parent, name } => {
                let id = meta
                    .table
                    .add_directory(parent, &name, self.state.config.default_dir_mode)?;
                meta.registry.hear_change(parent, EventKind::Create, &name);
                Ok(id)
            }
            Outcome::Found(_) | Outcome::TrailingSymlink { .. } => {
                Err(FsError::AlreadyExists(path.to_string()))
            }
            Outcome::NoParent { .. } => Err(FsError::NotFound(path.to_string())),
        }
    }

    /// Creates a directory and any missing ancestors. Existing directories
    /// along the way are accepted silently.
    pub fn create_dir_all(&self, path: &str) -> Result<NodeId, FsError> {
        debug!(path, "create_dir_all");
        let parsed = self.parse(path);
        let mut meta = self.state.lock_meta();
        let mut current = NodeId::ROOT;
        let mut prefix: Vec<String> = Vec::new();
        for component in &parsed.components {
            prefix.push(component.clone());
            let step = ParsedPath::from_components(parsed.absolute, prefix.clone());
            let res = resolve(&meta.table, &self.state.config, &step, true)?;
            current = match res.outcome {
                Outcome::Found(id) => {
                    let node = meta.table.node(id).expect("resolved node exists");
                    if !node.is_directory() {
                        return Err(FsError::NotADirectory(path.to_string()));
                    }
                    id
                }
                Outcome::MissingFinal { parent, name } => {
                    let id = meta
                        .table
                        .add_directory(parent, &name, self.state.config.default_dir_mode)?;
                    meta.registry.hear_change(parent, EventKind::Create, &name);
                    id
                }
                _ => return Err(FsError::NotFound(path.to_string())),
            };
        }
        Ok(current)
    }

    /// Creates a symbolic link holding the raw `target` path. The target is
    /// not required to exist.
    pub fn create_symlink(&self, path: &str, target: &str) -> Result<(), FsError> {
        debug!(path, target, "create_symlink");
        let mut meta = self.state.lock_meta();
        let res = self.resolve_in(&meta, path, false)?;
        match res.outcome {
            Outcome::MissingFinal { parent, name } => {
                meta.table.add_symlink(parent, &name, target)?;
                meta.registry.hear_change(parent, EventKind::Create, &name);
                Ok(())
            }
            Outcome::Found(_) | Outcome::TrailingSymlink { .. } => {
                Err(FsError::AlreadyExists(path.to_string()))
            }
            Outcome::NoParent { .. } => Err(FsError::NotFound(path.to_string())),
        }
    }

    /// Creates an additional hard link at `path` to the file at `existing`.
    pub fn create_hard_link(&self, path: &str, existing: &str) -> Result<(), FsError> {
        debug!(path, existing, "create_hard_link");
        let mut meta = self.state.lock_meta();
        let target = self.resolve_in(&meta, existing, true)?.require_node(existing)?;
        let res = self.resolve_in(&meta, path, false)?;
        match res.outcome {
            Outcome::MissingFinal { parent, name } => {
                meta.table.add_hard_link(parent, &name, target)?;
                meta.registry.hear_change(parent, EventKind::Create, &name);
                Ok(())
            }
            Outcome::Found(_) | Outcome::TrailingSymlink { .. } => {
                Err(FsError::AlreadyExists(path.to_string()))
            }
            Outcome::NoParent { .. } => Err(FsError::NotFound(path.to_string())),
        }
    }

    /// Removes the entry at `path`. A symlink is removed itself, never its
    /// target. Removing a non-empty directory fails; removing the root fails.
    pub fn remove(&self, path: &str) -> Result<(), FsError> {
        debug!(path, "remove");
        let mut meta = self.state.lock_meta();
        let res = self.resolve_in(&meta, path, false)?;
        let (parent, name, removed_dir) = match res.outcome {
            Outcome::Found(node) => {
                let step = res.steps.last().ok_or_else(|| {
                    FsError::InvalidArgument("the root directory cannot be removed".to_string())
                })?;
                let n = meta.table.node(node).expect("resolved node exists");
                access::check_delete(self.state.config.semantics, &n.dos, path)?;
                let dir = n.is_directory().then_some(node);
                (step.dir, step.name.clone(), dir)
            }
            Outcome::TrailingSymlink { parent, name, .. } => (parent, name, None),
            _ => return Err(FsError::NotFound(path.to_string())),
        };
        meta.table.remove(parent, &name)?;
        if let Some(dir) = removed_dir {
            meta.registry.invalidate_dir(dir);
        }
        meta.registry.hear_change(parent, EventKind::Delete, &name);
        Ok(())
    }

    /// Moves the entry at `from` to `to` in one atomic metadata step. An
    /// existing destination is replaced, except a non-empty directory.
    /// Moving a directory into its own subtree fails.
    pub fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        debug!(from, to, "rename");
        let mut meta = self.state.lock_meta();

        let src = self.resolve_in(&meta, from, false)?;
        let (src_parent, src_name, src_node) = match src.outcome {
            Outcome::Found(node) => {
                let step = src.steps.last().ok_or_else(|| {
                    FsError::InvalidArgument("the root directory cannot be renamed".to_string())
                })?;
                let n = meta.table.node(node).expect("resolved node exists");
                access::check_delete(self.state.config.semantics, &n.dos, from)?;
                (step.dir, step.name.clone(), Some(node))
            }
            Outcome::TrailingSymlink { parent, name, .. } => (parent, name, None),
            _ => return Err(FsError::NotFound(from.to_string())),
        };

        let dst = self.resolve_in(&meta, to, false)?;
        let (dst_parent, dst_name, replaced) = match dst.outcome {
            Outcome::MissingFinal { parent, name } => (parent, name, false),
            Outcome::TrailingSymlink { parent, name, .. } => (parent, name, true),
            Outcome::Found(_) => {
                let step = dst.steps.last().ok_or_else(|| {
                    FsError::InvalidArgument("the root directory cannot be replaced".to_string())
                })?;
                (step.dir, step.name.clone(), true)
            }
            Outcome::NoParent { .. } => return Err(FsError::NotFound(to.to_string())),
        };

        // Renaming onto the same entry is a no-op.
        if src_parent == dst_parent
            && meta.table.normalize(&src_name) == meta.table.normalize(&dst_name)
        {
            return Ok(());
        }

        if let Some(node) = src_node {
            let is_dir = meta
                .table
                .node(node)
                .is_some_and(|n| n.is_directory());
            if is_dir && meta.table.is_ancestor(node, dst_parent) {
                return Err(FsError::InvalidArgument(format!(
                    "cannot move {} into its own subtree {}",
                    from, to
                )));
            }
        }

        if replaced {
            meta.table.remove(dst_parent, &dst_name)?;
            meta.registry
                .hear_change(dst_parent, EventKind::Delete, &dst_name);
        }
        meta.table
            .move_entry(src_parent, &src_name, dst_parent, &dst_name)?;
        meta.registry
            .hear_change(src_parent, EventKind::Delete, &src_name);
        meta.registry
            .hear_change(dst_parent, EventKind::Create, &dst_name);
        Ok(())
    }

    /// Copies the file at `from` to a new file at `to`, including its
    /// permission bits. Returns the number of bytes copied.
    pub fn copy(&self, from: &str, to: &str) -> Result<u64, FsError> {
        debug!(from, to, "copy");
        let mut meta = self.state.lock_meta();

        let src_node = self.resolve_in(&meta, from, true)?.require_node(from)?;
        let src = meta.table.node(src_node).expect("resolved node exists");
        if src.is_directory() {
            return Err(FsError::IsADirectory(from.to_string()));
        }
        let mode = src.attr.mode;
        let bytes = src
            .content()
            .expect("file node has content")
            .lock()
            .expect("lock poisoned")
            .to_bytes();

        let res = self.resolve_in(&meta, to, true)?;
        let (parent, name) = match res.outcome {
            Outcome::MissingFinal { parent, name } => (parent, name),
            Outcome::Found(_) => return Err(FsError::AlreadyExists(to.to_string())),
            _ => return Err(FsError::NotFound(to.to_string())),
        };

        let new_node = meta.table.add_file(parent, &name, mode)?;
        let content = meta
            .table
            .node(new_node)
            .and_then(|n| n.content())
            .expect("file node has content");
        if let Err(err) = content.lock().expect("lock poisoned").write(0, &bytes) {
            meta.table.remove(parent, &name)?;
            return Err(err);
        }
        meta.registry.hear_change(parent, EventKind::Create, &name);
        Ok(bytes.len() as u64)
    }

    /// Opens a channel on the file at `path`. `CREATE` and `CREATE_NEW`
    /// create a missing file; `TRUNCATE` empties an existing one when the
    /// channel is writable. A trailing symlink is followed first, so
    /// `CREATE` through a dangling link creates the link's target.
    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<FileChannel, FsError> {
        debug!(path, %flags, "open");
        if !flags.readable() && !flags.writable() {
            return Err(FsError::InvalidArgument(
                "a channel must be opened for reading or writing".to_string(),
            ));
        }
        let state = &self.state;
        state.limiter.try_acquire_handle()?;

        let mut meta = state.lock_meta();
        let opened = (|| {
            let res = self.resolve_in(&meta, path, true)?;
            match res.outcome {
                Outcome::Found(node) => {
                    if flags.contains(OpenFlags::CREATE_NEW) {
                        return Err(FsError::AlreadyExists(path.to_string()));
                    }
                    let n = meta.table.node(node).expect("resolved node exists");
                    if n.is_directory() {
                        return Err(FsError::IsADirectory(path.to_string()));
                    }
                    if flags.readable() {
                        access::check_access(
                            state.config.semantics,
                            &n.attr,
                            state.config.uid,
                            state.config.gid,
                            Access::Read,
                            path,
                        )?;
                    }
                    if flags.writable() {
                        access::check_write_open(state.config.semantics, &n.dos, path)?;
                        access::check_access(
                            state.config.semantics,
                            &n.attr,
                            state.config.uid,
                            state.config.gid,
                            Access::Write,
                            path,
                        )?;
                    }
                    let step = res
                        .steps
                        .last()
                        .ok_or_else(|| FsError::IsADirectory(path.to_string()))?;
                    Ok((node, step.dir, step.name.clone(), false))
                }
                Outcome::MissingFinal { parent, name } => {
                    if !flags.contains(OpenFlags::CREATE) && !flags.contains(OpenFlags::CREATE_NEW)
                    {
                        return Err(FsError::NotFound(path.to_string()));
                    }
                    let node =
                        meta.table
                            .add_file(parent, &name, state.config.default_file_mode)?;
                    Ok((node, parent, name, true))
                }
                _ => Err(FsError::NotFound(path.to_string())),
            }
        })();
        let (node, parent, name, created) = match opened {
            Ok(v) => v,
            Err(err) => {
                state.limiter.release_handle();
                return Err(err);
            }
        };

        meta.table.register_open(node);
        let content = meta
            .table
            .node(node)
            .and_then(|n| n.content())
            .expect("file node has content");

        let mut truncated = false;
        if flags.contains(OpenFlags::TRUNCATE) && flags.writable() && !created {
            let mut guard = content.lock().expect("lock poisoned");
            if guard.size() > 0 {
                guard.truncate(0).expect("truncating to zero cannot fail");
                if flags.contains(OpenFlags::SYNC) {
                    guard.sync();
                }
                truncated = true;
            }
        }
        if created {
            meta.registry.hear_change(parent, EventKind::Create, &name);
        }
        if truncated {
            // Reported the same way as a channel truncate: mtime and archive
            // update plus one data and one attribute occurrence.
            if let Some(n) = meta.table.node_mut(node) {
                n.attr.modified = Timestamp::now();
                n.dos.archive = true;
            }
            meta.registry.hear_change(parent, EventKind::Modify, &name);
            meta.registry.hear_change(parent, EventKind::Modify, &name);
        }

        let id = state.next_handle.fetch_add(1, Ordering::Relaxed);
        state.handles.insert(
            id,
            HandleInfo {
                node,
                flags,
                path: meta.table.path_string(node),
            },
        );
        Ok(FileChannel::new(
            id,
            node,
            parent,
            name,
            flags,
            content,
            Arc::clone(&self.state),
        ))
    }

    /// Reads the whole file at `path` into a buffer.
    pub fn read(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let channel = self.open(path, OpenFlags::READ)?;
        channel.read_all()
    }

    /// Writes `bytes` as the complete content of the file at `path`,
    /// creating it if missing.
    pub fn write(&self, path: &str, bytes: &[u8]) -> Result<(), FsError> {
        let channel = self.open(
            path,
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
        )?;
        channel.write_at(0, bytes)?;
        Ok(())
    }

    /// Lists the directory at `path` in name order.
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntryInfo>, FsError> {
        let meta = self.state.lock_meta();
        let dir = self.resolve_in(&meta, path, true)?.require_node(path)?;
        let entries = meta.table.list(dir)?;
        Ok(entries
            .into_iter()
            .map(|(name, entry)| match entry.kind {
                EntryKind::Node(id) => DirEntryInfo {
                    name,
                    file_type: meta
                        .table
                        .node(id)
                        .map(|n| n.attr.file_type)
                        .unwrap_or(FileType::RegularFile),
                    node: Some(id),
                },
                EntryKind::Symlink(_) => DirEntryInfo {
                    name,
                    file_type: FileType::Symlink,
                    node: None,
                },
            })
            .collect())
    }

    /// Returns the raw target of the symlink at `path`.
    pub fn read_link(&self, path: &str) -> Result<String, FsError> {
        let meta = self.state.lock_meta();
        let res = self.resolve_in(&meta, path, false)?;
        match res.outcome {
            Outcome::TrailingSymlink { target, .. } => Ok(target),
            Outcome::Found(_) => Err(FsError::InvalidArgument(format!(
                "{} is not a symbolic link",
                path
            ))),
            _ => Err(FsError::NotFound(path.to_string())),
        }
    }

    /// Snapshots metadata for the node at `path`, following trailing symlinks.
    pub fn metadata(&self, path: &str) -> Result<Metadata, FsError> {
        let meta = self.state.lock_meta();
        let node = self.resolve_in(&meta, path, true)?.require_node(path)?;
        let n = meta.table.node(node).expect("resolved node exists");
        let size = n
            .content()
            .map(|c| c.lock().expect("lock poisoned").size())
            .unwrap_or(0);
        Ok(Metadata::snapshot(n, size))
    }

    /// Snapshots metadata without following a trailing symlink.
    pub fn symlink_metadata(&self, path: &str) -> Result<EntryMetadata, FsError> {
        let meta = self.state.lock_meta();
        let res = self.resolve_in(&meta, path, false)?;
        match res.outcome {
            Outcome::Found(node) => {
                let n = meta.table.node(node).expect("resolved node exists");
                let size = n
                    .content()
                    .map(|c| c.lock().expect("lock poisoned").size())
                    .unwrap_or(0);
                Ok(EntryMetadata::Node(Metadata::snapshot(n, size)))
            }
            Outcome::TrailingSymlink {
                parent,
                name,
                target,
            } => {
                let entry = meta
                    .table
                    .lookup(parent, &name)?
                    .ok_or_else(|| FsError::NotFound(path.to_string()))?;
                Ok(EntryMetadata::Symlink {
                    target,
                    created: entry.created,
                })
            }
            _ => Err(FsError::NotFound(path.to_string())),
        }
    }

    /// Sets the permission bits of the node at `path`.
    pub fn set_mode(&self, path: &str, mode: u32) -> Result<(), FsError> {
        self.with_node_mut(path, |n| n.attr.mode = mode & 0o7777)
    }

    /// Sets the owner identity of the node at `path`.
    pub fn set_owner(&self, path: &str, uid: u32, gid: u32) -> Result<(), FsError> {
        self.with_node_mut(path, |n| {
            n.attr.uid = uid;
            n.attr.gid = gid;
        })
    }

    /// Sets the modification and access times of the node at `path`. `None`
    /// leaves a field unchanged.
    pub fn set_times(
        &self,
        path: &str,
        modified: Option<Timestamp>,
        accessed: Option<Timestamp>,
    ) -> Result<(), FsError> {
        self.with_node_mut(path, |n| {
            if let Some(t) = modified {
                n.attr.modified = t;
            }
            if let Some(t) = accessed {
                n.attr.accessed = t;
            }
        })
    }

    /// Replaces the DOS attribute flags of the node at `path`.
    pub fn set_dos_flags(&self, path: &str, dos: DosAttributes) -> Result<(), FsError> {
        self.with_node_mut(path, |n| n.dos = dos)
    }

    fn with_node_mut(
        &self,
        path: &str,
        apply: impl FnOnce(&mut crate::node::Node),
    ) -> Result<(), FsError> {
        let mut meta = self.state.lock_meta();
        let node = self.resolve_in(&meta, path, true)?.require_node(path)?;
        apply(meta.table.node_mut(node).expect("resolved node exists"));
        Ok(())
    }

    /// Registers a watch key on the directory at `path` for the given event
    /// kinds. Deliveries arrive through [`MemFs::watch_service`].
    pub fn watch(&self, path: &str, kinds: Vec<EventKind>) -> Result<Arc<WatchKey>, FsError> {
        debug!(path, "watch");
        let mut meta = self.state.lock_meta();
        let dir = self.resolve_in(&meta, path, true)?.require_node(path)?;
        let node = meta.table.node(dir).expect("resolved node exists");
        if !node.is_directory() {
            return Err(FsError::NotADirectory(path.to_string()));
        }
        Ok(meta.registry.register(&self.state.service, dir, kinds))
    }

    /// Cancels and deregisters a watch key.
    pub fn cancel_watch(&self, key: &Arc<WatchKey>) {
        self.state.lock_meta().registry.deregister(key);
    }

    /// The delivery queue for this filesystem's watch keys.
    pub fn watch_service(&self) -> WatchService {
        self.state.service.clone()
    }

    /// Bytes still available under the space budget.
    pub fn free_space(&self) -> u64 {
        self.state.limiter.free_space()
    }

    /// Bytes currently reserved by file contents.
    pub fn space_used(&self) -> u64 {
        self.state.limiter.space_used()
    }

    /// Number of currently open channels.
    pub fn open_handles(&self) -> u64 {
        self.state.limiter.open_handles()
    }

    /// True if no channel is currently open.
    pub fn all_handles_closed(&self) -> bool {
        self.state.handles.is_empty()
    }

    /// Bookkeeping records for all open channels.
    pub fn handle_info(&self) -> Vec<(u64, HandleInfo)> {
        self.state
            .handles
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// True if no directory and no file content has unsynced modifications.
    pub fn all_synced(&self) -> bool {
        let meta = self.state.lock_meta();
        if !meta.table.all_dirs_synced() {
            return false;
        }
        let contents_clean = meta.table.iter().all(|(_, node)| {
            node.content()
                .map(|c| !c.lock().expect("lock poisoned").is_dirty())
                .unwrap_or(true)
        });
        contents_clean
    }

    /// Marks every directory and file content synced.
    pub fn sync_all(&self) {
        let mut meta = self.state.lock_meta();
        let dirs: Vec<NodeId> = meta
            .table
            .iter()
            .filter(|(_, n)| n.is_directory())
            .map(|(id, _)| *id)
            .collect();
        for dir in dirs {
            let _ = meta.table.sync_dir(dir);
        }
        let contents: Vec<_> = meta
            .table
            .iter()
            .filter_map(|(_, n)| n.content())
            .collect();
        for content in contents {
            content.lock().expect("lock poisoned").sync();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::WatchEvent;

    fn make_fs() -> MemFs {
        MemFs::new(FsConfig::posix())
    }

    const ALL_KINDS: [EventKind; 3] = [EventKind::Create, EventKind::Delete, EventKind::Modify];

    #[test]
    fn test_write_then_read_roundtrip() {
        let fs = make_fs();
        fs.write("/hello.txt", b"hello world").unwrap();
        assert_eq!(fs.read("/hello.txt").unwrap(), b"hello world");
    }

    #[test]
    fn test_open_missing_without_create_fails() {
        let fs = make_fs();
        assert!(matches!(
            fs.open("/nope", OpenFlags::READ),
            Err(FsError::NotFound(_))
        ));
        assert!(fs.all_handles_closed());
    }

    #[test]
    fn test_create_new_conflicts() {
        let fs = make_fs();
        fs.create_file("/f").unwrap();
        assert!(matches!(
            fs.open("/f", OpenFlags::WRITE | OpenFlags::CREATE_NEW),
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_open_directory_fails() {
        let fs = make_fs();
        fs.create_directory("/d").unwrap();
        assert!(matches!(
            fs.open("/d", OpenFlags::READ),
            Err(FsError::IsADirectory(_))
        ));
        assert!(matches!(
            fs.open("/", OpenFlags::READ),
            Err(FsError::IsADirectory(_))
        ));
    }

    #[test]
    fn test_truncate_on_open() {
        let fs = make_fs();
        fs.write("/f", b"some old data").unwrap();
        let channel = fs
            .open("/f", OpenFlags::WRITE | OpenFlags::TRUNCATE)
            .unwrap();
        assert_eq!(channel.size(), 0);
    }

    #[test]
    fn test_truncate_on_open_reports_like_a_write() {
        let fs = make_fs();
        fs.write("/f", b"some old data").unwrap();
        fs.sync_all();
        let key = fs.watch("/", vec![EventKind::Modify]).unwrap();

        let channel = fs
            .open("/f", OpenFlags::WRITE | OpenFlags::TRUNCATE)
            .unwrap();
        assert_eq!(channel.size(), 0);

        let events = key.poll_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Modify);
        assert_eq!(events[0].count, 2);
        assert!(!fs.all_synced());
    }

    #[test]
    fn test_truncate_on_sync_open_stays_clean() {
        let fs = make_fs();
        fs.write("/f", b"payload").unwrap();
        fs.sync_all();

        let channel = fs
            .open("/f", OpenFlags::WRITE | OpenFlags::TRUNCATE | OpenFlags::SYNC)
            .unwrap();
        assert_eq!(channel.size(), 0);
        assert!(fs.all_synced());
    }

    #[test]
    fn test_append_mode() {
        let fs = make_fs();
        fs.write("/log", b"one\n").unwrap();
        let channel = fs.open("/log", OpenFlags::APPEND).unwrap();
        let pos = channel.append(b"two\n").unwrap();
        assert_eq!(pos, 4);
        drop(channel);
        assert_eq!(fs.read("/log").unwrap(), b"one\ntwo\n");
    }

    #[test]
    fn test_read_only_channel_rejects_write() {
        let fs = make_fs();
        fs.create_file("/f").unwrap();
        let channel = fs.open("/f", OpenFlags::READ).unwrap();
        assert!(matches!(
            channel.write_at(0, b"x"),
            Err(FsError::AccessDenied(_))
        ));
    }

    #[test]
    fn test_remove_file_frees_space() {
        let fs = MemFs::new(FsConfig::posix().total_space(1000));
        fs.write("/f", &[1u8; 600]).unwrap();
        assert_eq!(fs.free_space(), 400);
        fs.remove("/f").unwrap();
        assert_eq!(fs.free_space(), 1000);
    }

    #[test]
    fn test_unlinked_file_readable_until_close() {
        let fs = MemFs::new(FsConfig::posix().total_space(1000));
        fs.write("/f", b"still here").unwrap();
        let channel = fs.open("/f", OpenFlags::READ).unwrap();

        fs.remove("/f").unwrap();
        assert!(!fs.exists("/f"));
        // Space stays reserved while the channel pins the content.
        assert_eq!(fs.free_space(), 990);
        assert_eq!(channel.read_all().unwrap(), b"still here");

        drop(channel);
        assert_eq!(fs.free_space(), 1000);
    }

    #[test]
    fn test_remove_root_fails() {
        let fs = make_fs();
        assert!(matches!(
            fs.remove("/"),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_remove_symlink_leaves_target() {
        let fs = make_fs();
        fs.write("/target", b"data").unwrap();
        fs.create_symlink("/link", "/target").unwrap();

        fs.remove("/link").unwrap();
        assert!(fs.exists("/target"));
        assert!(!fs.exists("/link"));
    }

    #[test]
    fn test_create_at_dangling_symlink_fails() {
        let fs = make_fs();
        fs.create_symlink("/link", "/elsewhere").unwrap();

        assert!(matches!(
            fs.create_file("/link"),
            Err(FsError::AlreadyExists(_))
        ));
        assert!(matches!(
            fs.create_directory("/link"),
            Err(FsError::AlreadyExists(_))
        ));
        assert!(!fs.exists("/elsewhere"));
        assert_eq!(fs.read_link("/link").unwrap(), "/elsewhere");
    }

    #[test]
    fn test_open_through_symlink() {
        let fs = make_fs();
        fs.write("/target", b"via link").unwrap();
        fs.create_symlink("/link", "/target").unwrap();
        assert_eq!(fs.read("/link").unwrap(), b"via link");
    }

    #[test]
    fn test_read_link() {
        let fs = make_fs();
        fs.create_symlink("/link", "/somewhere").unwrap();
        assert_eq!(fs.read_link("/link").unwrap(), "/somewhere");

        fs.create_file("/f").unwrap();
        assert!(matches!(
            fs.read_link("/f"),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_hard_link_shares_content() {
        let fs = make_fs();
        fs.write("/a", b"shared").unwrap();
        fs.create_hard_link("/b", "/a").unwrap();

        assert_eq!(fs.read("/b").unwrap(), b"shared");
        assert_eq!(fs.metadata("/a").unwrap().nlink, 2);

        fs.remove("/a").unwrap();
        assert_eq!(fs.read("/b").unwrap(), b"shared");
    }

    #[test]
    fn test_rename_basic() {
        let fs = make_fs();
        fs.write("/old", b"content").unwrap();
        fs.create_directory("/dir").unwrap();

        fs.rename("/old", "/dir/new").unwrap();
        assert!(!fs.exists("/old"));
        assert_eq!(fs.read("/dir/new").unwrap(), b"content");
    }

    #[test]
    fn test_rename_replaces_existing_file() {
        let fs = make_fs();
        fs.write("/a", b"winner").unwrap();
        fs.write("/b", b"loser").unwrap();

        fs.rename("/a", "/b").unwrap();
        assert!(!fs.exists("/a"));
        assert_eq!(fs.read("/b").unwrap(), b"winner");
    }

    #[test]
    fn test_rename_into_own_subtree_fails() {
        let fs = make_fs();
        fs.create_dir_all("/a/b/c").unwrap();
        assert!(matches!(
            fs.rename("/a", "/a/b/c/a"),
            Err(FsError::InvalidArgument(_))
        ));
        assert!(fs.exists("/a/b/c"));
    }

    #[test]
    fn test_rename_onto_nonempty_directory_fails() {
        let fs = make_fs();
        fs.create_directory("/src").unwrap();
        fs.create_dir_all("/dst/inner").unwrap();
        assert!(matches!(
            fs.rename("/src", "/dst"),
            Err(FsError::DirectoryNotEmpty(_))
        ));
    }

    #[test]
    fn test_copy() {
        let fs = make_fs();
        fs.write("/src", b"copy me").unwrap();
        fs.set_mode("/src", 0o600).unwrap();

        let n = fs.copy("/src", "/dst").unwrap();
        assert_eq!(n, 7);
        assert_eq!(fs.read("/dst").unwrap(), b"copy me");
        assert_eq!(fs.metadata("/dst").unwrap().mode, 0o600);
        // Independent contents after the copy.
        fs.write("/dst", b"changed").unwrap();
        assert_eq!(fs.read("/src").unwrap(), b"copy me");
    }

    #[test]
    fn test_create_dir_all() {
        let fs = make_fs();
        fs.create_dir_all("/a/b/c").unwrap();
        assert!(fs.metadata("/a/b/c").unwrap().is_dir());

        // Existing prefixes are fine; a file in the way is not.
        fs.create_dir_all("/a/b/c/d").unwrap();
        fs.create_file("/a/f").unwrap();
        assert!(matches!(
            fs.create_dir_all("/a/f/x"),
            Err(FsError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_read_dir() {
        let fs = make_fs();
        fs.create_file("/b").unwrap();
        fs.create_directory("/a").unwrap();
        fs.create_symlink("/c", "/a").unwrap();

        let listing = fs.read_dir("/").unwrap();
        let names: Vec<&str> = listing.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(listing[0].file_type, FileType::Directory);
        assert_eq!(listing[1].file_type, FileType::RegularFile);
        assert_eq!(listing[2].file_type, FileType::Symlink);
        assert!(listing[2].node.is_none());
    }

    #[test]
    fn test_metadata_size_and_type() {
        let fs = make_fs();
        fs.write("/f", b"12345").unwrap();
        let meta = fs.metadata("/f").unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.len(), 5);
        assert_eq!(meta.nlink, 1);
    }

    #[test]
    fn test_symlink_metadata() {
        let fs = make_fs();
        fs.create_symlink("/link", "/target").unwrap();
        match fs.symlink_metadata("/link").unwrap() {
            EntryMetadata::Symlink { target, .. } => assert_eq!(target, "/target"),
            other => panic!("expected Symlink, got {:?}", other),
        }

        fs.create_file("/f").unwrap();
        assert!(matches!(
            fs.symlink_metadata("/f").unwrap(),
            EntryMetadata::Node(_)
        ));
    }

    #[test]
    fn test_attribute_setters() {
        let fs = make_fs();
        fs.create_file("/f").unwrap();

        fs.set_mode("/f", 0o600).unwrap();
        fs.set_owner("/f", 0, 0).unwrap();
        fs.set_times("/f", Some(Timestamp::from_secs(7)), None)
            .unwrap();
        fs.set_dos_flags(
            "/f",
            DosAttributes {
                hidden: true,
                ..DosAttributes::default()
            },
        )
        .unwrap();

        let meta = fs.metadata("/f").unwrap();
        assert_eq!(meta.mode, 0o600);
        assert_eq!(meta.uid, 0);
        assert_eq!(meta.modified, Timestamp::from_secs(7));
        assert!(meta.dos.hidden);
    }

    #[test]
    fn test_posix_mode_denies_open() {
        let fs = make_fs();
        fs.create_file("/f").unwrap();
        fs.set_mode("/f", 0o000).unwrap();
        assert!(matches!(
            fs.open("/f", OpenFlags::READ),
            Err(FsError::AccessDenied(_))
        ));
        assert!(fs.all_handles_closed());
    }

    #[test]
    fn test_windows_readonly_blocks_delete_and_write() {
        let fs = MemFs::new(FsConfig::windows());
        fs.create_file("C:\\f.txt").unwrap();
        fs.set_dos_flags(
            "C:\\f.txt",
            DosAttributes {
                readonly: true,
                ..DosAttributes::default()
            },
        )
        .unwrap();

        assert!(matches!(
            fs.remove("C:\\f.txt"),
            Err(FsError::AccessDenied(_))
        ));
        assert!(matches!(
            fs.open("C:\\f.txt", OpenFlags::WRITE),
            Err(FsError::AccessDenied(_))
        ));
        // Reading is unaffected.
        assert!(fs.open("C:\\f.txt", OpenFlags::READ).is_ok());
    }

    #[test]
    fn test_windows_case_insensitive_paths() {
        let fs = MemFs::new(FsConfig::windows());
        fs.create_dir_all("C:\\Users\\Dirk").unwrap();
        fs.write("C:\\Users\\Dirk\\Notes.TXT", b"hi").unwrap();
        assert_eq!(fs.read("C:\\users\\dirk\\notes.txt").unwrap(), b"hi");
    }

    #[test]
    fn test_handle_budget_enforced() {
        let fs = MemFs::new(FsConfig::posix().max_open_handles(2));
        fs.create_file("/f").unwrap();

        let a = fs.open("/f", OpenFlags::READ).unwrap();
        let _b = fs.open("/f", OpenFlags::READ).unwrap();
        assert!(matches!(
            fs.open("/f", OpenFlags::READ),
            Err(FsError::TooManyOpenHandles { limit: 2 })
        ));

        drop(a);
        assert!(fs.open("/f", OpenFlags::READ).is_ok());
    }

    #[test]
    fn test_handle_info_tracks_open_channels() {
        let fs = make_fs();
        fs.create_file("/f").unwrap();
        let channel = fs.open("/f", OpenFlags::READ).unwrap();

        let info = fs.handle_info();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].1.path, "/f");
        assert_eq!(fs.open_handles(), 1);

        drop(channel);
        assert!(fs.all_handles_closed());
        assert_eq!(fs.open_handles(), 0);
    }

    #[test]
    fn test_watch_create_and_delete_events() {
        let fs = make_fs();
        let service = fs.watch_service();
        let _key = fs.watch("/", ALL_KINDS.to_vec()).unwrap();

        fs.create_file("/a").unwrap();
        fs.remove("/a").unwrap();

        let key = service.poll().unwrap().unwrap();
        let events = key.poll_events();
        assert_eq!(
            events,
            vec![
                WatchEvent {
                    kind: EventKind::Create,
                    name: "a".to_string(),
                    count: 1
                },
                WatchEvent {
                    kind: EventKind::Delete,
                    name: "a".to_string(),
                    count: 1
                },
            ]
        );
    }

    #[test]
    fn test_watch_write_reports_coalesced_modify() {
        let fs = make_fs();
        let service = fs.watch_service();
        fs.create_file("/f").unwrap();
        let _key = fs.watch("/", vec![EventKind::Modify]).unwrap();

        let channel = fs.open("/f", OpenFlags::WRITE).unwrap();
        channel.write_at(0, b"data").unwrap();

        let key = service.poll().unwrap().unwrap();
        let events = key.poll_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Modify);
        assert_eq!(events[0].name, "f");
        assert_eq!(events[0].count, 2);
    }

    #[test]
    fn test_watch_removed_directory_invalidates_key() {
        let fs = make_fs();
        fs.create_directory("/d").unwrap();
        let key = fs.watch("/d", ALL_KINDS.to_vec()).unwrap();

        fs.remove("/d").unwrap();
        assert!(!key.is_valid());
    }

    #[test]
    fn test_watch_non_directory_fails() {
        let fs = make_fs();
        fs.create_file("/f").unwrap();
        assert!(matches!(
            fs.watch("/f", ALL_KINDS.to_vec()),
            Err(FsError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_sync_state_tracking() {
        let fs = make_fs();
        assert!(fs.all_synced());

        fs.write("/f", b"dirty").unwrap();
        assert!(!fs.all_synced());

        fs.sync_all();
        assert!(fs.all_synced());
    }

    #[test]
    fn test_space_exhaustion_reports_no_space() {
        let fs = MemFs::new(FsConfig::posix().total_space(10));
        assert!(matches!(
            fs.write("/f", &[0u8; 11]),
            Err(FsError::NoSpace { .. })
        ));
        // The failed write leaves an empty file behind but reserves nothing.
        assert_eq!(fs.free_space(), 10);
    }

    #[test]
    fn test_copy_over_budget_rolls_back() {
        let fs = MemFs::new(FsConfig::posix().total_space(15));
        fs.write("/src", &[1u8; 10]).unwrap();
        assert!(matches!(
            fs.copy("/src", "/dst"),
            Err(FsError::NoSpace { .. })
        ));
        assert!(!fs.exists("/dst"));
        assert_eq!(fs.space_used(), 10);
    }

    #[test]
    fn test_range_locks_across_channels() {
        let fs = make_fs();
        fs.write("/f", &[0u8; 100]).unwrap();

        let a = fs.open("/f", OpenFlags::READ | OpenFlags::WRITE).unwrap();
        let b = fs.open("/f", OpenFlags::READ | OpenFlags::WRITE).unwrap();

        a.try_lock(0, 50, false).unwrap();
        assert!(matches!(
            b.try_lock(25, 50, false),
            Err(FsError::LockOverlap { .. })
        ));
        b.try_lock(50, 50, false).unwrap();

        // Closing a channel orphans its locks; the range becomes free.
        drop(a);
        b.try_lock(0, 50, false).unwrap();
    }
}
