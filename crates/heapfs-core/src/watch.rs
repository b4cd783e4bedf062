//! Change notification: watch keys, their service queue, and the registry
//! that routes directory events to interested keys.
//!
//! A key accumulates events and coalesces repeats (same kind and name) by
//! bumping a counter. Between deliveries a key transitions to signalled at
//! most once, entering its service's FIFO queue. The service's blocking
//! `take` is the only intentionally blocking call in the engine and is woken
//! by `close`.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::types::{FsError, NodeId};

/// Kind of filesystem change reported to watchers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// An entry was created in the watched directory.
    Create,
    /// An entry was removed from the watched directory.
    Delete,
    /// An entry in the watched directory was modified.
    Modify,
}

/// A single (possibly coalesced) change event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    /// What happened.
    pub kind: EventKind,
    /// Entry name within the watched directory.
    pub name: String,
    /// How many identical occurrences this event represents.
    pub count: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum KeyState {
    Ready,
    Signalled,
}

#[derive(Debug)]
struct KeyInner {
    pending: Vec<WatchEvent>,
    state: KeyState,
    valid: bool,
}

/// A registered interest in changes under one directory.
///
/// Obtained from [`crate::fs::MemFs::watch`]; delivered through the owning
/// [`WatchService`] when signalled.
#[derive(Debug)]
pub struct WatchKey {
    id: u64,
    dir: NodeId,
    kinds: Vec<EventKind>,
    inner: Mutex<KeyInner>,
    service: Weak<ServiceShared>,
}

impl WatchKey {
    /// Unique id of this key.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The directory this key watches.
    pub fn watchable(&self) -> NodeId {
        self.dir
    }

    /// False once cancelled or once the owning service closed.
    pub fn is_valid(&self) -> bool {
        self.inner.lock().expect("lock poisoned").valid
    }

    /// Drains and returns the pending events.
    pub fn poll_events(&self) -> Vec<WatchEvent> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        std::mem::take(&mut inner.pending)
    }

    /// Rearms the key after processing a delivery. If events arrived since
    /// the last drain the key is immediately re-queued. Returns false if the
    /// key is no longer valid.
    pub fn reset(self: &Arc<Self>) -> bool {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if !inner.valid {
            return false;
        }
        if inner.pending.is_empty() {
            inner.state = KeyState::Ready;
        } else {
            inner.state = KeyState::Signalled;
            drop(inner);
            if let Some(service) = self.service.upgrade() {
                service.enqueue(Arc::clone(self));
            }
        }
        true
    }

    /// Invalidates the key. The registry prunes cancelled keys lazily.
    pub fn cancel(&self) {
        self.inner.lock().expect("lock poisoned").valid = false;
    }

    /// Records one occurrence of `kind` on `name`, coalescing into an
    /// already-pending identical event. Signals the key if it was ready.
    fn accept(self: &Arc<Self>, kind: EventKind, name: &str) {
        if !self.kinds.contains(&kind) {
            return;
        }
        let mut inner = self.inner.lock().expect("lock poisoned");
        if !inner.valid {
            return;
        }
        match inner
            .pending
            .iter_mut()
            .find(|e| e.kind == kind && e.name == name)
        {
            Some(event) => event.count += 1,
            None => inner.pending.push(WatchEvent {
                kind,
                name: name.to_string(),
                count: 1,
            }),
        }
        if inner.state == KeyState::Ready {
            inner.state = KeyState::Signalled;
            drop(inner);
            if let Some(service) = self.service.upgrade() {
                service.enqueue(Arc::clone(self));
            }
        }
    }
}

#[derive(Debug)]
struct ServiceQueue {
    ready: VecDeque<Arc<WatchKey>>,
    closed: bool,
}

#[derive(Debug)]
struct ServiceShared {
    queue: Mutex<ServiceQueue>,
    cond: Condvar,
    keys: Mutex<Vec<Weak<WatchKey>>>,
}

impl ServiceShared {
    fn enqueue(&self, key: Arc<WatchKey>) {
        let mut queue = self.queue.lock().expect("lock poisoned");
        if queue.closed {
            return;
        }
        queue.ready.push_back(key);
        self.cond.notify_one();
    }
}

/// The delivery queue signalled watch keys are taken from.
#[derive(Debug, Clone)]
pub struct WatchService {
    shared: Arc<ServiceShared>,
}

impl Default for WatchService {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchService {
    /// Creates an open, empty service.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ServiceShared {
                queue: Mutex::new(ServiceQueue {
                    ready: VecDeque::new(),
                    closed: false,
                }),
                cond: Condvar::new(),
                keys: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates a key owned by this service. The caller registers it with the
    /// watch registry.
    pub(crate) fn new_key(&self, id: u64, dir: NodeId, kinds: Vec<EventKind>) -> Arc<WatchKey> {
        let key = Arc::new(WatchKey {
            id,
            dir,
            kinds,
            inner: Mutex::new(KeyInner {
                pending: Vec::new(),
                state: KeyState::Ready,
                valid: true,
            }),
            service: Arc::downgrade(&self.shared),
        });
        self.shared
            .keys
            .lock()
            .expect("lock poisoned")
            .push(Arc::downgrade(&key));
        key
    }

    /// Removes and returns the next signalled key without blocking.
    pub fn poll(&self) -> Result<Option<Arc<WatchKey>>, FsError> {
        let mut queue = self.shared.queue.lock().expect("lock poisoned");
        if let Some(key) = queue.ready.pop_front() {
            return Ok(Some(key));
        }
        if queue.closed {
            return Err(FsError::WatchServiceClosed);
        }
        Ok(None)
    }

    /// Waits up to `timeout` for a signalled key.
    pub fn poll_timeout(&self, timeout: Duration) -> Result<Option<Arc<WatchKey>>, FsError> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.shared.queue.lock().expect("lock poisoned");
        loop {
            if let Some(key) = queue.ready.pop_front() {
                return Ok(Some(key));
            }
            if queue.closed {
                return Err(FsError::WatchServiceClosed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _timed_out) = self
                .shared
                .cond
                .wait_timeout(queue, deadline - now)
                .expect("lock poisoned");
            queue = guard;
        }
    }

    /// Blocks until a key is signalled. Fails with a closed error when the
    /// service is closed, including while waiting.
    pub fn take(&self) -> Result<Arc<WatchKey>, FsError> {
        let mut queue = self.shared.queue.lock().expect("lock poisoned");
        loop {
            if let Some(key) = queue.ready.pop_front() {
                return Ok(key);
            }
            if queue.closed {
                return Err(FsError::WatchServiceClosed);
            }
            queue = self.shared.cond.wait(queue).expect("lock poisoned");
        }
    }

    /// Closes the service: invalidates its keys, drops queued deliveries and
    /// wakes all blocked waiters.
    pub fn close(&self) {
        {
            let mut queue = self.shared.queue.lock().expect("lock poisoned");
            if queue.closed {
                return;
            }
            queue.closed = true;
            queue.ready.clear();
        }
        for weak in self.shared.keys.lock().expect("lock poisoned").drain(..) {
            if let Some(key) = weak.upgrade() {
                key.cancel();
            }
        }
        self.shared.cond.notify_all();
    }

    /// True once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.queue.lock().expect("lock poisoned").closed
    }
}

/// Routes directory change events to the keys registered on each directory.
///
/// Lives behind the filesystem metadata lock; `hear_change` is called by the
/// engine while mutating the node graph.
#[derive(Default)]
pub struct WatchRegistry {
    watchers: HashMap<NodeId, Vec<Arc<WatchKey>>>,
    next_key_id: AtomicU64,
}

impl WatchRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            watchers: HashMap::new(),
            next_key_id: AtomicU64::new(1),
        }
    }

    /// Creates and registers a key for `dir` on `service`.
    pub fn register(
        &mut self,
        service: &WatchService,
        dir: NodeId,
        kinds: Vec<EventKind>,
    ) -> Arc<WatchKey> {
        let id = self.next_key_id.fetch_add(1, Ordering::Relaxed);
        let key = service.new_key(id, dir, kinds);
        self.watchers.entry(dir).or_default().push(Arc::clone(&key));
        key
    }

    /// Removes a key from the registry and invalidates it.
    pub fn deregister(&mut self, key: &Arc<WatchKey>) {
        key.cancel();
        if let Some(keys) = self.watchers.get_mut(&key.watchable()) {
            keys.retain(|k| k.id != key.id);
            if keys.is_empty() {
                self.watchers.remove(&key.watchable());
            }
        }
    }

    /// Invalidates every key watching `dir`; called when the directory is
    /// removed from the graph.
    pub fn invalidate_dir(&mut self, dir: NodeId) {
        if let Some(keys) = self.watchers.remove(&dir) {
            for key in keys {
                key.cancel();
            }
        }
    }

    /// Delivers one event occurrence to every valid key watching `dir`.
    /// Cancelled keys are pruned here.
    pub fn hear_change(&mut self, dir: NodeId, kind: EventKind, name: &str) {
        let Some(keys) = self.watchers.get_mut(&dir) else {
            return;
        };
        keys.retain(|key| key.is_valid());
        for key in keys.iter() {
            key.accept(kind, name);
        }
        if keys.is_empty() {
            self.watchers.remove(&dir);
        }
    }

    /// Number of directories with at least one registered key.
    pub fn watched_dirs(&self) -> usize {
        self.watchers.len()
    }
}
