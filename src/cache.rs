//! Key to build-result store with file-based invalidation and per-key build deduplication.
//!
//! Reads take a shared lock and never contend with each other. Writers (put, invalidation) take
//! the exclusive lock briefly. A separate ticket table guarantees at most one build in flight per
//! key: the first caller to [`CompilationCache::claim`] a missing key owns the build, later
//! callers block until the owner's [`BuildTicket`] is dropped.

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
};

use crate::{build::toolchain::ModuleHandle, event::EvictionReason, paths::LogicalPath};

/// A built unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub path: LogicalPath,
    pub module: ModuleHandle,
    /// Fully qualified generated type, empty for raw code units.
    pub type_name: String,
    pub custom_string: Option<String>,
    /// Writes to any of these files evict the entry.
    pub invalidation_files: Vec<LogicalPath>,
    /// Units this one was built against.
    pub dependencies: Vec<LogicalPath>,
    /// Hex SHA-256 of the unit's source at build time.
    pub content_hash: String,
    /// Restored from a persisted record rather than compiled in this process.
    pub precompiled: bool,
}

pub type CacheListener = Box<dyn Fn(&str, EvictionReason) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub entries: usize,
    pub evictions: usize,
}

struct Ticket {
    done: Mutex<bool>,
    cv: Condvar,
    owner: ThreadId,
}

type TicketTable = Arc<Mutex<HashMap<String, Arc<Ticket>>>>;

/// Exclusive right to build one key. Dropping it wakes every waiter.
pub struct BuildTicket {
    key: String,
    ticket: Arc<Ticket>,
    table: TicketTable,
}

impl BuildTicket {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for BuildTicket {
    fn drop(&mut self) {
        {
            let mut table = self.table.lock();
            if table
                .get(&self.key)
                .map(|t| Arc::ptr_eq(t, &self.ticket))
                .unwrap_or(false)
            {
                table.remove(&self.key);
            }
        }
        *self.ticket.done.lock() = true;
        self.ticket.cv.notify_all();
    }
}

/// Outcome of [`CompilationCache::claim`].
pub enum Claim {
    /// The caller must build the key.
    Owner(BuildTicket),
    /// Another thread built (or failed to build) the key while the caller waited. Check the cache
    /// again.
    Waited,
    /// The calling thread already holds this key's ticket further up its stack.
    Reentrant,
}

#[derive(Default)]
pub struct CompilationCache {
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
    /// invalidation file -> keys
    file_index: RwLock<HashMap<LogicalPath, HashSet<String>>>,
    tickets: TicketTable,
    listeners: RwLock<Vec<CacheListener>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
    evictions: AtomicUsize,
}

impl CompilationCache {
    pub fn new() -> Self {
        CompilationCache::default()
    }

    /// Cache key for a logical path: the normalized, case-preserved path.
    pub fn key_for(path: &LogicalPath) -> String {
        path.as_str().to_string()
    }

    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let found = self.entries.read().get(key).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Lookup without touching the hit/miss counters.
    pub fn peek(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.entries.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Store `entry` under `key`, evictable through any of `invalidation_files`.
    pub fn put(
        &self,
        key: &str,
        mut entry: CacheEntry,
        invalidation_files: Vec<LogicalPath>,
    ) -> Arc<CacheEntry> {
        entry.key = key.to_string();
        entry.invalidation_files = invalidation_files;
        let entry = Arc::new(entry);
        let previous = self
            .entries
            .write()
            .insert(key.to_string(), entry.clone());
        let mut index = self.file_index.write();
        if let Some(previous) = previous {
            tracing::info!("[Cache] Overwriting existing entry: {}", key);
            for file in previous.invalidation_files.iter() {
                if let Some(keys) = index.get_mut(file) {
                    keys.remove(key);
                }
            }
        }
        for file in entry.invalidation_files.iter() {
            index.entry(file.clone()).or_default().insert(key.to_string());
        }
        tracing::debug!(
            "[Cache] stored {} ({} invalidation files)",
            key,
            entry.invalidation_files.len()
        );
        entry
    }

    /// Remove `key`. Returns whether an entry was present.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.evict(key);
        if removed {
            self.notify(key, EvictionReason::Removed);
        }
        removed
    }

    /// Evict every entry whose invalidation set contains `path`. Returns the evicted keys.
    pub fn file_changed(&self, path: &LogicalPath) -> Vec<String> {
        let keys: Vec<String> = match self.file_index.read().get(path) {
            Some(keys) => {
                let mut keys: Vec<String> = keys.iter().cloned().collect();
                keys.sort();
                keys
            }
            None => Vec::new(),
        };
        let evicted: Vec<String> = keys.into_iter().filter(|key| self.evict(key)).collect();
        for key in evicted.iter() {
            self.notify(key, EvictionReason::FileChanged);
        }
        if !evicted.is_empty() {
            tracing::info!("[Cache] {} changed, evicted {:?}", path, evicted);
        }
        evicted
    }

    fn evict(&self, key: &str) -> bool {
        let Some(entry) = self.entries.write().remove(key) else {
            return false;
        };
        let mut index = self.file_index.write();
        for file in entry.invalidation_files.iter() {
            if let Some(keys) = index.get_mut(file) {
                keys.remove(key);
                if keys.is_empty() {
                    index.remove(file);
                }
            }
        }
        self.evictions.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn notify(&self, key: &str, reason: EvictionReason) {
        for listener in self.listeners.read().iter() {
            listener(key, reason);
        }
    }

    pub fn add_listener(&self, listener: CacheListener) {
        self.listeners.write().push(listener);
    }

    /// Acquire the build ticket for `key`, blocking while another thread holds it.
    pub fn claim(&self, key: &str) -> Claim {
        let existing = {
            let mut table = self.tickets.lock();
            match table.get(key) {
                Some(ticket) => ticket.clone(),
                None => {
                    let ticket = Arc::new(Ticket {
                        done: Mutex::new(false),
                        cv: Condvar::new(),
                        owner: thread::current().id(),
                    });
                    table.insert(key.to_string(), ticket.clone());
                    return Claim::Owner(BuildTicket {
                        key: key.to_string(),
                        ticket,
                        table: self.tickets.clone(),
                    });
                }
            }
        };
        if existing.owner == thread::current().id() {
            return Claim::Reentrant;
        }
        tracing::debug!("[Cache] waiting for in-flight build of {}", key);
        let mut done = existing.done.lock();
        while !*done {
            existing.cv.wait(&mut done);
        }
        Claim::Waited
    }

    /// Snapshot of all entries, sorted by key.
    pub fn entries(&self) -> Vec<Arc<CacheEntry>> {
        let mut entries: Vec<Arc<CacheEntry>> = self.entries.read().values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        let keys: Vec<String> = self.entries.read().keys().cloned().collect();
        for key in keys {
            self.invalidate(&key);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::atomic::AtomicBool, time::Duration};

    fn entry(path: &str) -> CacheEntry {
        CacheEntry {
            key: String::new(),
            path: LogicalPath::new(path),
            module: ModuleHandle::new("m1", None),
            type_name: "Quire.Generated.a_page".to_string(),
            custom_string: None,
            invalidation_files: Vec::new(),
            dependencies: Vec::new(),
            content_hash: String::new(),
            precompiled: false,
        }
    }

    #[test]
    fn test_file_invalidation_notifies_listeners() {
        let cache = CompilationCache::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        cache.add_listener(Box::new(move |key, reason| {
            sink.lock().push((key.to_string(), reason))
        }));

        let stored = cache.put(
            "/a.page",
            entry("/a.page"),
            vec![LogicalPath::new("/a.page"), LogicalPath::new("/inc/h.inc")],
        );
        cache.put("/b.page", entry("/b.page"), vec![LogicalPath::new("/b.page")]);
        assert!(Arc::ptr_eq(&stored, &cache.get("/a.page").unwrap()));

        assert!(cache.file_changed(&LogicalPath::new("/other")).is_empty());
        assert_eq!(
            cache.file_changed(&LogicalPath::new("/inc/h.inc")),
            vec!["/a.page".to_string()]
        );
        assert!(cache.get("/a.page").is_none());
        assert!(cache.get("/b.page").is_some());
        assert!(cache.invalidate("/b.page"));
        assert!(!cache.invalidate("/b.page"));
        assert_eq!(
            *seen.lock(),
            vec![
                ("/a.page".to_string(), EvictionReason::FileChanged),
                ("/b.page".to_string(), EvictionReason::Removed)
            ]
        );
        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.evictions, 2);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let cache = Arc::new(CompilationCache::new());
        let ticket = match cache.claim("/a.page") {
            Claim::Owner(ticket) => ticket,
            _ => panic!("first claim must own the key"),
        };
        assert!(matches!(cache.claim("/a.page"), Claim::Reentrant));

        let finished = Arc::new(AtomicBool::new(false));
        let waiter = {
            let cache = cache.clone();
            let finished = finished.clone();
            thread::spawn(move || {
                let _claim = cache.claim("/a.page");
                finished.load(Ordering::SeqCst)
            })
        };
        thread::sleep(Duration::from_millis(50));
        cache.put("/a.page", entry("/a.page"), Vec::new());
        finished.store(true, Ordering::SeqCst);
        drop(ticket);
        assert!(waiter.join().unwrap());
        assert!(matches!(cache.claim("/a.page"), Claim::Owner(_)));
    }
}
