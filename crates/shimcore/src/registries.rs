//! Statement and connection registries (spec.md §4.6).
//!
//! The global statement registry is the only structure in this crate that needs real
//! cross-thread locking — `parking_lot::Mutex` rather than `std::sync::Mutex` to match the
//! rest of the stack's choice of fine-grained, fair locks over the standard library's. The
//! thread-local recent-statement cache and the connection registry's per-path index need no
//! locking at all: the former is thread-local by definition, the latter is written once per
//! connection open/close and read far more often, so it lives behind the same mutex as the
//! primary map rather than a second one.

use crate::config::{MAX_CONCURRENT_STATEMENTS, MAX_CONNECTIONS, RECENT_STATEMENT_CACHE_SIZE};
use crate::error::{ShimError, ShimResult};
use crate::types::{Connection, HostHandle, Statement};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Global statement registry: host statement pointer -> internal statement (spec.md §4.6).
pub struct StatementRegistry {
    inner: Mutex<HashMap<HostHandle, Arc<Mutex<Statement>>>>,
    capacity: usize,
}

impl StatementRegistry {
    pub fn new() -> Self {
        StatementRegistry::with_capacity(MAX_CONCURRENT_STATEMENTS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        StatementRegistry {
            inner: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn insert(&self, handle: HostHandle, statement: Statement) -> ShimResult<Arc<Mutex<Statement>>> {
        let mut map = self.inner.lock();
        if map.len() >= self.capacity {
            return Err(ShimError::RegistryFull { capacity: self.capacity });
        }
        let entry = Arc::new(Mutex::new(statement));
        map.insert(handle, entry.clone());
        Ok(entry)
    }

    pub fn get(&self, handle: HostHandle) -> Option<Arc<Mutex<Statement>>> {
        self.inner.lock().get(&handle).cloned()
    }

    /// Drop this registry's reference; the statement itself is freed only once every
    /// `Arc` clone (this one and any held by the recent-statement cache) has gone (spec.md
    /// §4.2 "Finalize").
    pub fn remove(&self, handle: HostHandle) -> Option<Arc<Mutex<Statement>>> {
        self.inner.lock().remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StatementRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-local recent-statement cache: small fixed-size array, insertion into the next free
/// slot, second-chance lookup for handles the engine prepared before it started tracking them
/// (spec.md §4.6, §4.2 opening paragraph).
pub struct RecentStatementCache {
    slots: Vec<Option<(HostHandle, Arc<Mutex<Statement>>)>>,
    next: usize,
}

impl RecentStatementCache {
    pub fn new() -> Self {
        RecentStatementCache {
            slots: (0..RECENT_STATEMENT_CACHE_SIZE).map(|_| None).collect(),
            next: 0,
        }
    }

    pub fn insert(&mut self, handle: HostHandle, statement: Arc<Mutex<Statement>>) {
        self.slots[self.next] = Some((handle, statement));
        self.next = (self.next + 1) % self.slots.len();
    }

    pub fn get(&self, handle: HostHandle) -> Option<Arc<Mutex<Statement>>> {
        self.slots
            .iter()
            .flatten()
            .find(|(h, _)| *h == handle)
            .map(|(_, s)| s.clone())
    }

    pub fn remove(&mut self, handle: HostHandle) {
        for slot in &mut self.slots {
            if matches!(slot, Some((h, _)) if *h == handle) {
                *slot = None;
            }
        }
    }
}

impl Default for RecentStatementCache {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    pub static RECENT_STATEMENTS: std::cell::RefCell<RecentStatementCache> =
        std::cell::RefCell::new(RecentStatementCache::new());
}

/// Connection registry: host database pointer -> connection record, plus a by-path index for
/// context-free lookups (spec.md §4.6 "Connection registry").
pub struct ConnectionRegistry {
    inner: Mutex<ConnectionRegistryInner>,
    capacity: usize,
}

struct ConnectionRegistryInner {
    by_handle: HashMap<HostHandle, Arc<Mutex<Connection>>>,
    by_path: HashMap<String, Vec<HostHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry::with_capacity(MAX_CONNECTIONS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        ConnectionRegistry {
            inner: Mutex::new(ConnectionRegistryInner {
                by_handle: HashMap::new(),
                by_path: HashMap::new(),
            }),
            capacity,
        }
    }

    pub fn insert(&self, handle: HostHandle, conn: Connection) -> ShimResult<Arc<Mutex<Connection>>> {
        let mut inner = self.inner.lock();
        if inner.by_handle.len() >= self.capacity {
            return Err(ShimError::RegistryFull { capacity: self.capacity });
        }
        let path = conn.path.clone();
        let entry = Arc::new(Mutex::new(conn));
        inner.by_handle.insert(handle, entry.clone());
        inner.by_path.entry(path).or_default().push(handle);
        Ok(entry)
    }

    pub fn get(&self, handle: HostHandle) -> Option<Arc<Mutex<Connection>>> {
        self.inner.lock().by_handle.get(&handle).cloned()
    }

    /// Find any currently-open connection for `path`, most-recently-opened first — the
    /// "find the currently-appropriate connection for this thread and path" helper spec.md
    /// §4.6 calls for when the incoming API call is context-free (e.g. a last-insert-rowid
    /// query that arrives before a database handle is available).
    pub fn find_by_path(&self, path: &str) -> Option<Arc<Mutex<Connection>>> {
        let inner = self.inner.lock();
        let handles = inner.by_path.get(path)?;
        handles.last().and_then(|h| inner.by_handle.get(h).cloned())
    }

    pub fn remove(&self, handle: HostHandle) -> Option<Arc<Mutex<Connection>>> {
        let mut inner = self.inner.lock();
        let removed = inner.by_handle.remove(&handle)?;
        let path = removed.lock().path.clone();
        if let Some(handles) = inner.by_path.get_mut(&path) {
            handles.retain(|h| *h != handle);
            if handles.is_empty() {
                inner.by_path.remove(&path);
            }
        }
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_handle.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EmbeddedHandle;

    fn statement(sql: &str) -> Statement {
        Statement::new(HostHandle(1), EmbeddedHandle(1), sql.to_string())
    }

    #[test]
    fn statement_registry_insert_get_remove() {
        let reg = StatementRegistry::new();
        let handle = HostHandle(42);
        reg.insert(handle, statement("SELECT 1")).unwrap();
        assert!(reg.get(handle).is_some());
        reg.remove(handle);
        assert!(reg.get(handle).is_none());
    }

    #[test]
    fn statement_registry_respects_capacity() {
        let reg = StatementRegistry::with_capacity(1);
        reg.insert(HostHandle(1), statement("SELECT 1")).unwrap();
        let err = reg.insert(HostHandle(2), statement("SELECT 2")).unwrap_err();
        assert!(matches!(err, ShimError::RegistryFull { capacity: 1 }));
    }

    #[test]
    fn recent_statement_cache_wraps_around() {
        let mut cache = RecentStatementCache::new();
        let cap = RECENT_STATEMENT_CACHE_SIZE;
        for i in 0..cap + 1 {
            cache.insert(HostHandle(i), Arc::new(Mutex::new(statement("SELECT 1"))));
        }
        // The very first inserted handle (0) should have been evicted by the wraparound.
        assert!(cache.get(HostHandle(0)).is_none());
        assert!(cache.get(HostHandle(cap)).is_some());
    }

    #[test]
    fn connection_registry_finds_by_path() {
        let reg = ConnectionRegistry::new();
        let handle = HostHandle(7);
        reg.insert(handle, Connection::new(handle, "/redirect/app.db".to_string(), EmbeddedHandle(7)))
            .unwrap();
        assert!(reg.find_by_path("/redirect/app.db").is_some());
        reg.remove(handle);
        assert!(reg.find_by_path("/redirect/app.db").is_none());
    }
}
