//! Shared caches.
//!
//! Two cost-aware queues back the process-wide table-index and manifest
//! caches: new entries enter a small probationary queue, entries that prove
//! themselves move to the main queue, and keys evicted before reuse are
//! remembered in a ghost list so an early re-insert skips probation.
//! Eviction only drops the cache's own reference; readers hold strong
//! references to whatever they are using, so an evicted index stays valid
//! until its last holder drops it.
//!
//! A [`CacheContext`] bundles the index cache, manifest cache, pooled file
//! descriptors, and per-store manifest update locks. Stores may share an
//! explicitly injected context; otherwise they share the process-wide
//! default, initialized once.

use std::collections::{HashMap, HashSet, LinkedList};
use std::fmt::Debug;
use std::fs::File;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use lru::LruCache;

use crate::hash::Addr;
use crate::store::manifest::ManifestContents;
use crate::store::table::TableIndex;

/// Maximum frequency limit for an entry in the cache.
const MAX_FREQUENCY_LIMIT: u8 = 3;

/// Bound on remembered evicted keys.
const GHOST_LIMIT: usize = 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Queue {
    Small,
    Main,
}

struct Entry<V> {
    value: V,
    cost: usize,
    queue: Queue,
    freq: AtomicU8,
}

/// A cost-bounded cache. Each entry carries its own cost (bytes, for the
/// uses in this crate); the cache holds entries until the summed cost
/// exceeds the budget and then evicts cold ones.
pub struct Cache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
    V: Clone,
{
    max_cost: usize,
    max_main_cost: usize,
    /// new entries are queued here until they earn a second access
    small: LinkedList<K>,
    /// proven entries
    main: LinkedList<K>,
    /// keys recently evicted from small, remembered without their values
    ghost: LinkedList<K>,
    ghost_set: HashSet<K>,
    entries: HashMap<K, Entry<V>>,
    small_cost: usize,
    main_cost: usize,
    stats: Stats,
}

impl<K, V> Cache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
    V: Clone,
{
    pub fn new(max_cost: usize) -> Self {
        let max_small_cost = max_cost / 10;
        let max_main_cost = max_cost - max_small_cost;

        Cache {
            max_cost,
            max_main_cost,
            small: LinkedList::new(),
            main: LinkedList::new(),
            ghost: LinkedList::new(),
            ghost_set: HashSet::new(),
            entries: HashMap::new(),
            small_cost: 0,
            main_cost: 0,
            stats: Stats::new(),
        }
    }

    /// Returns a reference to the value of the given key if it exists.
    pub fn get(&self, key: &K) -> Option<&V> {
        if let Some(entry) = self.entries.get(key) {
            let freq = (entry.freq.load(Ordering::SeqCst) + 1).min(MAX_FREQUENCY_LIMIT);
            entry.freq.store(freq, Ordering::SeqCst);
            self.stats.hit();
            Some(&entry.value)
        } else {
            self.stats.miss();
            None
        }
    }

    /// Inserts an entry with the given cost, evicting as needed. A key seen
    /// in the ghost list re-enters the main queue directly.
    pub fn insert(&mut self, key: K, value: V, cost: usize) {
        if cost > self.max_cost {
            return;
        }

        if let Some(old) = self.entries.remove(&key) {
            // Stale queue position is skipped by the eviction loops.
            match old.queue {
                Queue::Small => self.small_cost -= old.cost,
                Queue::Main => self.main_cost -= old.cost,
            }
        }

        self.evict(cost);

        let queue = if self.ghost_set.remove(&key) {
            Queue::Main
        } else {
            Queue::Small
        };
        match queue {
            Queue::Small => {
                self.small.push_back(key.clone());
                self.small_cost += cost;
            }
            Queue::Main => {
                self.main.push_back(key.clone());
                self.main_cost += cost;
            }
        }
        self.entries.insert(key, Entry { value, cost, queue, freq: AtomicU8::new(0) });
    }

    /// Summed cost of resident entries.
    pub fn cost(&self) -> usize {
        self.small_cost + self.main_cost
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> (usize, usize) {
        self.stats.get()
    }

    fn evict(&mut self, incoming: usize) {
        while self.small_cost + self.main_cost + incoming > self.max_cost
            && !self.entries.is_empty()
        {
            if self.main_cost >= self.max_main_cost || self.small.is_empty() {
                self.evict_main();
            } else {
                self.evict_small();
            }
        }
    }

    fn evict_main(&mut self) {
        while let Some(key) = self.main.pop_front() {
            let Some(entry) = self.entries.get(&key) else {
                continue; // stale position
            };
            if entry.queue != Queue::Main {
                continue;
            }
            let freq = entry.freq.load(Ordering::SeqCst);
            if freq > 0 {
                entry.freq.store(freq - 1, Ordering::SeqCst);
                self.main.push_back(key);
            } else {
                let removed = self.entries.remove(&key).unwrap();
                self.main_cost -= removed.cost;
                self.remember(key);
                return;
            }
        }
    }

    fn evict_small(&mut self) {
        while let Some(key) = self.small.pop_front() {
            let Some(entry) = self.entries.get_mut(&key) else {
                continue; // stale position
            };
            if entry.queue != Queue::Small {
                continue;
            }
            if entry.freq.load(Ordering::SeqCst) > 1 {
                // Promote to main
                entry.queue = Queue::Main;
                let cost = entry.cost;
                self.small_cost -= cost;
                self.main_cost += cost;
                self.main.push_back(key);
            } else {
                let removed = self.entries.remove(&key).unwrap();
                self.small_cost -= removed.cost;
                self.remember(key);
                return;
            }
        }
    }

    fn remember(&mut self, key: K) {
        if self.ghost_set.insert(key.clone()) {
            self.ghost.push_back(key);
        }
        while self.ghost.len() > GHOST_LIMIT {
            if let Some(old) = self.ghost.pop_front() {
                self.ghost_set.remove(&old);
            }
        }
    }
}

struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Stats {
    fn new() -> Self {
        Stats { hits: AtomicUsize::new(0), misses: AtomicUsize::new(0) }
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::SeqCst);
    }

    fn get(&self) -> (usize, usize) {
        (self.hits.load(Ordering::SeqCst), self.misses.load(Ordering::SeqCst))
    }
}

/// The shared resources of one or more stores: index cache, manifest cache,
/// pooled table file descriptors, and the per-store manifest update locks.
/// Safe to share across stores and threads.
pub struct CacheContext {
    index: Mutex<Cache<Addr, Arc<TableIndex>>>,
    manifests: Mutex<Cache<String, ManifestContents>>,
    fds: Mutex<LruCache<PathBuf, Arc<File>>>,
    update_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

static GLOBAL: OnceLock<Arc<CacheContext>> = OnceLock::new();

impl CacheContext {
    pub fn new(
        index_cache_bytes: usize,
        manifest_cache_bytes: usize,
        fd_cache_entries: usize,
    ) -> Arc<Self> {
        let fd_capacity =
            NonZeroUsize::new(fd_cache_entries).unwrap_or(NonZeroUsize::MIN);
        Arc::new(Self {
            index: Mutex::new(Cache::new(index_cache_bytes)),
            manifests: Mutex::new(Cache::new(manifest_cache_bytes)),
            fds: Mutex::new(LruCache::new(fd_capacity)),
            update_locks: Mutex::new(HashMap::new()),
        })
    }

    /// The process-wide default context: 8 MiB index cache, 8 MiB manifest
    /// cache, 256 pooled descriptors.
    pub fn global() -> Arc<Self> {
        GLOBAL
            .get_or_init(|| Self::new(8 * 1024 * 1024, 8 * 1024 * 1024, 256))
            .clone()
    }

    pub(crate) fn index(&self, addr: &Addr) -> Option<Arc<TableIndex>> {
        self.index.lock().unwrap().get(addr).cloned()
    }

    pub(crate) fn put_index(&self, addr: Addr, index: Arc<TableIndex>) {
        let cost = index.mem_size();
        self.index.lock().unwrap().insert(addr, index, cost);
    }

    pub(crate) fn manifest(&self, name: &str) -> Option<ManifestContents> {
        self.manifests.lock().unwrap().get(&name.to_string()).cloned()
    }

    pub(crate) fn put_manifest(&self, name: &str, contents: ManifestContents) {
        let cost = contents.approx_size();
        self.manifests.lock().unwrap().insert(name.to_string(), contents, cost);
    }

    pub(crate) fn fd(&self, path: &Path) -> Option<Arc<File>> {
        self.fds.lock().unwrap().get(&path.to_path_buf()).cloned()
    }

    pub(crate) fn put_fd(&self, path: PathBuf, file: Arc<File>) {
        self.fds.lock().unwrap().put(path, file);
    }

    /// The manifest update lock for a store identity. Commits hold this for
    /// the whole update; re-entrant acquisition would deadlock and is a
    /// caller bug.
    pub(crate) fn update_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.update_locks
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

impl Debug for CacheContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let index = self.index.lock().unwrap();
        let manifests = self.manifests.lock().unwrap();
        f.debug_struct("CacheContext")
            .field("index_entries", &index.len())
            .field("index_cost", &index.cost())
            .field("manifest_entries", &manifests.len())
            .finish()
    }
}
