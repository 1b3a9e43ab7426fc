//! Concurrent namespaced LRU cache.
//!
//! Two-layer structure shared by the open-table cache and the block cache:
//!
//! 1. A lock-striped hash table mapping `(namespace, key)` to refcounted
//!    entries. Striping adapts: a bucket overflowing its slot, or the table
//!    outgrowing its global threshold, doubles the bucket count; heavy
//!    deletion halves it. A resize freezes the old buckets, and lookups
//!    that race with it retry under the new table.
//! 2. A doubly linked recency list guarded by a single mutex. Insertion
//!    links at the MRU end and capacity overflow evicts from the LRU tail
//!    until the charged size fits again.
//!
//! Entries are pinned by [`CacheHandle`]s. An evicted entry stays alive (and
//! findable) while handles remain; the finalizer runs exactly once, after
//! the last reference is gone. Negative refcounts indicate an engine bug and
//! abort the process.

use std::any::Any;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::Result;

/// Values are shared, type-erased objects (table readers, decoded blocks).
pub type CacheValue = Arc<dyn Any + Send + Sync>;

/// Runs when an entry leaves the cache for good. Receives the key and the
/// value being dropped.
pub type Finalizer = Box<dyn FnOnce(&[u8], CacheValue) + Send>;

/// Initial bucket count.
const INIT_SLOTS: usize = 1 << 4;
/// Nodes per bucket beyond which the bucket counts as overflowing.
const BUCKET_OVERFLOW: usize = 1 << 5;
/// Total overflow beyond which the table grows regardless of node count.
const TABLE_OVERFLOW: u32 = 1 << 7;

struct EntryState {
    value: Option<CacheValue>,
    charge: i64,
    finalizer: Option<Finalizer>,
}

pub struct CacheEntry {
    ns: u32,
    key: Vec<u8>,
    hash: u32,
    /// Outstanding handles plus one for the recency list while linked.
    refs: AtomicI32,
    /// Loaders run under this lock; concurrent getters of a loading entry
    /// block here until the value exists.
    state: Mutex<EntryState>,
    /// Slot in the recency list, None while evicted.
    lru_slot: Mutex<Option<usize>>,
}

struct Bucket {
    frozen: bool,
    nodes: Vec<Arc<CacheEntry>>,
}

struct Table {
    buckets: Vec<Mutex<Bucket>>,
    mask: u32,
    overflow: AtomicU32,
    grow_threshold: usize,
    shrink_threshold: usize,
}

impl Table {
    fn with_slots(slots: usize) -> Self {
        let mut buckets = Vec::with_capacity(slots);
        for _ in 0..slots {
            buckets.push(Mutex::new(Bucket {
                frozen: false,
                nodes: Vec::new(),
            }));
        }
        Self {
            buckets,
            mask: slots as u32 - 1,
            overflow: AtomicU32::new(0),
            grow_threshold: slots * BUCKET_OVERFLOW,
            shrink_threshold: if slots > INIT_SLOTS {
                slots * BUCKET_OVERFLOW / 2
            } else {
                0
            },
        }
    }
}

/// Doubly linked recency list over a slab; index 0 is the sentinel.
struct LruList {
    prev: Vec<usize>,
    next: Vec<usize>,
    entries: Vec<Option<Arc<CacheEntry>>>,
    free: Vec<usize>,
    size: i64,
}

impl LruList {
    fn new() -> Self {
        Self {
            prev: vec![0],
            next: vec![0],
            entries: vec![None],
            free: Vec::new(),
            size: 0,
        }
    }

    fn link_front(&mut self, entry: Arc<CacheEntry>) -> usize {
        let slot = match self.free.pop() {
            Some(slot) => {
                self.entries[slot] = Some(entry);
                slot
            }
            None => {
                self.prev.push(0);
                self.next.push(0);
                self.entries.push(Some(entry));
                self.entries.len() - 1
            }
        };
        let head = self.next[0];
        self.next[0] = slot;
        self.prev[slot] = 0;
        self.next[slot] = head;
        self.prev[head] = slot;
        slot
    }

    fn unlink(&mut self, slot: usize) -> Arc<CacheEntry> {
        let (prev, next) = (self.prev[slot], self.next[slot]);
        self.next[prev] = next;
        self.prev[next] = prev;
        self.free.push(slot);
        self.entries[slot].take().expect("unlinking an empty slot")
    }

    fn tail(&self) -> Option<usize> {
        let slot = self.prev[0];
        if slot == 0 {
            None
        } else {
            Some(slot)
        }
    }
}

/// Cheap to clone; clones share the same underlying cache.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    table: RwLock<Arc<Table>>,
    nodes: AtomicUsize,
    list: Mutex<LruList>,
    capacity: i64,
}

/// Pins a cache entry and its value. Dropping the handle releases the pin;
/// the last release of an entry that has left the cache finalizes it.
pub struct CacheHandle {
    cache: Cache,
    entry: Arc<CacheEntry>,
}

impl CacheHandle {
    /// The cached value. Cloning the inner Arc is how readers share it.
    pub fn value(&self) -> CacheValue {
        self.entry
            .state
            .lock()
            .expect("cache entry lock poisoned")
            .value
            .clone()
            .expect("handle to an unloaded entry")
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        self.cache.unref(&self.entry);
    }
}

impl Cache {
    pub fn new(capacity: i64) -> Cache {
        Cache {
            inner: Arc::new(CacheInner {
                table: RwLock::new(Arc::new(Table::with_slots(INIT_SLOTS))),
                nodes: AtomicUsize::new(0),
                list: Mutex::new(LruList::new()),
                capacity,
            }),
        }
    }

    /// Total charged size currently linked in the recency list.
    pub fn size(&self) -> i64 {
        self.inner.list.lock().expect("lru lock poisoned").size
    }

    pub fn capacity(&self) -> i64 {
        self.inner.capacity
    }

    /// Looks up `(ns, key)`, loading and inserting it on a miss when a
    /// loader is supplied. Returns None on a miss without a loader.
    pub fn get(
        &self,
        ns: u32,
        key: &[u8],
        loader: Option<Box<dyn FnOnce() -> Result<(CacheValue, i64, Option<Finalizer>)> + '_>>,
    ) -> Result<Option<CacheHandle>> {
        let hash = ns_hash(ns, key);
        loop {
            let (entry, created) = match self.lookup_or_insert(ns, key, hash, loader.is_some()) {
                Some(pair) => pair,
                None => return Ok(None),
            };

            if !created {
                // The loader for this entry may still be running; the state
                // lock rendezvouses with it.
                let loaded = {
                    let state = entry.state.lock().expect("cache entry lock poisoned");
                    state.value.is_some()
                };
                if !loaded {
                    // Load failed on the other side and the entry is gone
                    // from the table; retry from scratch.
                    self.unref(&entry);
                    continue;
                }
                self.promote(&entry);
                return Ok(Some(CacheHandle {
                    cache: self.clone(),
                    entry,
                }));
            }

            // Freshly inserted placeholder: run the loader under the entry
            // lock so concurrent getters wait instead of double-loading.
            let loader = loader.expect("placeholder inserted without a loader");
            let mut state = entry.state.lock().expect("cache entry lock poisoned");
            match loader() {
                Ok((value, charge, finalizer)) => {
                    state.value = Some(value);
                    state.charge = charge;
                    state.finalizer = finalizer;
                    drop(state);
                    self.promote(&entry);
                    return Ok(Some(CacheHandle {
                        cache: self.clone(),
                        entry,
                    }));
                }
                Err(err) => {
                    drop(state);
                    self.remove_from_table(&entry);
                    self.unref(&entry);
                    return Err(err);
                }
            }
        }
    }

    /// Removes `(ns, key)` from the table and recency list. Outstanding
    /// handles keep the value alive; the finalizer runs after the last one.
    pub fn delete(&self, ns: u32, key: &[u8]) -> bool {
        let hash = ns_hash(ns, key);
        let entry = loop {
            let table = self.inner.table.read().expect("cache table lock poisoned").clone();
            let slot = (hash & table.mask) as usize;
            let mut bucket = table.buckets[slot].lock().expect("cache bucket poisoned");
            if bucket.frozen {
                continue;
            }
            let pos = bucket
                .nodes
                .iter()
                .position(|n| n.hash == hash && n.ns == ns && n.key == key);
            match pos {
                Some(pos) => {
                    let entry = bucket.nodes.swap_remove(pos);
                    drop(bucket);
                    self.inner.nodes.fetch_sub(1, Ordering::AcqRel);
                    break entry;
                }
                None => return false,
            }
        };
        self.evict_from_list(std::slice::from_ref(&entry));
        self.maybe_shrink();
        true
    }

    /// Removes every entry bearing the namespace.
    pub fn evict_namespace(&self, ns: u32) {
        self.evict_where(|entry| entry.ns == ns);
    }

    /// Removes every entry.
    pub fn evict_all(&self) {
        self.evict_where(|_| true);
    }

    fn evict_where(&self, pred: impl Fn(&CacheEntry) -> bool) {
        let table = self.inner.table.read().expect("cache table lock poisoned").clone();
        let mut removed = Vec::new();
        for bucket in &table.buckets {
            let mut bucket = bucket.lock().expect("cache bucket poisoned");
            if bucket.frozen {
                continue;
            }
            let mut i = 0;
            while i < bucket.nodes.len() {
                if pred(&bucket.nodes[i]) {
                    removed.push(bucket.nodes.swap_remove(i));
                } else {
                    i += 1;
                }
            }
        }
        self.inner.nodes.fetch_sub(removed.len(), Ordering::AcqRel);
        self.evict_from_list(&removed);
    }

    /// Unlinks entries from the recency list and drops the list's
    /// references outside any bucket lock.
    fn evict_from_list(&self, entries: &[Arc<CacheEntry>]) {
        let mut unlinked = Vec::new();
        {
            let mut list = self.inner.list.lock().expect("lru lock poisoned");
            for entry in entries {
                let mut slot = entry.lru_slot.lock().expect("lru slot poisoned");
                if let Some(idx) = slot.take() {
                    let entry = list.unlink(idx);
                    let charge = entry.state.lock().expect("cache entry lock poisoned").charge;
                    list.size -= charge;
                    unlinked.push(entry);
                }
            }
        }
        for entry in unlinked {
            self.unref(&entry);
        }
    }

    fn lookup_or_insert(
        &self,
        ns: u32,
        key: &[u8],
        hash: u32,
        create: bool,
    ) -> Option<(Arc<CacheEntry>, bool)> {
        loop {
            let table = self.inner.table.read().expect("cache table lock poisoned").clone();
            let slot = (hash & table.mask) as usize;
            let mut bucket = table.buckets[slot].lock().expect("cache bucket poisoned");
            if bucket.frozen {
                // Raced a resize: the nodes moved to a new table.
                continue;
            }

            if let Some(entry) = bucket
                .nodes
                .iter()
                .find(|n| n.hash == hash && n.ns == ns && n.key == key)
            {
                entry.refs.fetch_add(1, Ordering::AcqRel);
                return Some((Arc::clone(entry), false));
            }

            if !create {
                return None;
            }

            let entry = Arc::new(CacheEntry {
                ns,
                key: key.to_vec(),
                hash,
                refs: AtomicI32::new(1),
                state: Mutex::new(EntryState {
                    value: None,
                    charge: 0,
                    finalizer: None,
                }),
                lru_slot: Mutex::new(None),
            });
            bucket.nodes.push(Arc::clone(&entry));
            let bucket_len = bucket.nodes.len();
            drop(bucket);

            let total = self.inner.nodes.fetch_add(1, Ordering::AcqRel) + 1;
            let mut grow = total > table.grow_threshold;
            if bucket_len > BUCKET_OVERFLOW {
                grow = grow || table.overflow.fetch_add(1, Ordering::AcqRel) + 1 > TABLE_OVERFLOW;
            }
            if grow {
                self.resize(&table, table.buckets.len() * 2);
            }
            return Some((entry, true));
        }
    }

    fn maybe_shrink(&self) {
        let table = self.inner.table.read().expect("cache table lock poisoned").clone();
        let nodes = self.inner.nodes.load(Ordering::Acquire);
        if table.shrink_threshold > 0 && nodes < table.shrink_threshold {
            self.resize(&table, table.buckets.len() / 2);
        }
    }

    /// Rebuilds the stripe table at the new size, freezing old buckets so
    /// concurrent lookups holding the stale table retry.
    fn resize(&self, observed: &Arc<Table>, slots: usize) {
        let mut guard = self.inner.table.write().expect("cache table lock poisoned");
        if !Arc::ptr_eq(&*guard, observed) {
            // Someone else already resized past the table we judged.
            return;
        }
        let new = Table::with_slots(slots);
        for bucket in &observed.buckets {
            let mut bucket = bucket.lock().expect("cache bucket poisoned");
            bucket.frozen = true;
            for node in bucket.nodes.drain(..) {
                let slot = (node.hash & new.mask) as usize;
                new.buckets[slot]
                    .lock()
                    .expect("cache bucket poisoned")
                    .nodes
                    .push(node);
            }
        }
        *guard = Arc::new(new);
    }

    /// Moves an entry to the MRU position, relinking it if it had been
    /// evicted while pinned. Newly linked entries charge their size and may
    /// push older entries out.
    fn promote(&self, entry: &Arc<CacheEntry>) {
        let mut evicted = Vec::new();
        {
            let mut list = self.inner.list.lock().expect("lru lock poisoned");
            let mut slot = entry.lru_slot.lock().expect("lru slot poisoned");
            match *slot {
                Some(idx) => {
                    let entry = list.unlink(idx);
                    *slot = Some(list.link_front(entry));
                }
                None => {
                    entry.refs.fetch_add(1, Ordering::AcqRel);
                    let charge = entry.state.lock().expect("cache entry lock poisoned").charge;
                    *slot = Some(list.link_front(Arc::clone(entry)));
                    list.size += charge;
                }
            }
            drop(slot);

            while list.size > self.inner.capacity {
                let tail = match list.tail() {
                    Some(tail) => tail,
                    None => break,
                };
                let victim = list.unlink(tail);
                let charge = victim.state.lock().expect("cache entry lock poisoned").charge;
                list.size -= charge;
                *victim.lru_slot.lock().expect("lru slot poisoned") = None;
                evicted.push(victim);
            }
        }
        for victim in evicted {
            self.remove_from_table(&victim);
            self.unref(&victim);
        }
    }

    /// Removes an entry from its bucket if still present. Idempotent.
    fn remove_from_table(&self, entry: &Arc<CacheEntry>) {
        loop {
            let table = self.inner.table.read().expect("cache table lock poisoned").clone();
            let slot = (entry.hash & table.mask) as usize;
            let mut bucket = table.buckets[slot].lock().expect("cache bucket poisoned");
            if bucket.frozen {
                continue;
            }
            if let Some(pos) = bucket.nodes.iter().position(|n| Arc::ptr_eq(n, entry)) {
                bucket.nodes.swap_remove(pos);
                drop(bucket);
                self.inner.nodes.fetch_sub(1, Ordering::AcqRel);
            }
            return;
        }
    }

    fn unref(&self, entry: &Arc<CacheEntry>) {
        let prev = entry.refs.fetch_sub(1, Ordering::AcqRel);
        if prev < 1 {
            // A reference count below zero is unrecoverable state damage.
            panic!("cache entry refcount went negative");
        }
        if prev == 1 {
            self.remove_from_table(entry);
            let (finalizer, value) = {
                let mut state = entry.state.lock().expect("cache entry lock poisoned");
                (state.finalizer.take(), state.value.take())
            };
            if let (Some(finalizer), Some(value)) = (finalizer, value) {
                finalizer(&entry.key, value);
            }
        }
    }
}

/// FNV-1a over the namespace and key.
fn ns_hash(ns: u32, key: &[u8]) -> u32 {
    let mut h: u32 = 0x811c9dc5;
    for &b in &ns.to_le_bytes() {
        h ^= u32::from(b);
        h = h.wrapping_mul(0x01000193);
    }
    for &b in key {
        h ^= u32::from(b);
        h = h.wrapping_mul(0x01000193);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn value_of(n: u64) -> CacheValue {
        Arc::new(n)
    }

    fn get_simple(cache: &Cache, ns: u32, key: &[u8], n: u64, charge: i64) -> CacheHandle {
        cache
            .get(
                ns,
                key,
                Some(Box::new(move || Ok((value_of(n), charge, None)))),
            )
            .expect("get failed")
            .expect("loader-backed get returned None")
    }

    #[test]
    fn test_hit_returns_cached_value() {
        let cache = Cache::new(1000);
        let loads = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let loads = Arc::clone(&loads);
            let handle = cache
                .get(
                    1,
                    b"key",
                    Some(Box::new(move || {
                        loads.fetch_add(1, Ordering::SeqCst);
                        Ok((value_of(42), 10, None))
                    })),
                )
                .expect("get failed")
                .expect("missing handle");
            let v = handle.value();
            assert_eq!(*v.downcast_ref::<u64>().expect("wrong type"), 42);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1, "loader ran more than once");
    }

    #[test]
    fn test_miss_without_loader() {
        let cache = Cache::new(100);
        assert!(cache.get(1, b"absent", None).expect("get failed").is_none());
    }

    #[test]
    fn test_namespaces_are_distinct() {
        let cache = Cache::new(1000);
        let a = get_simple(&cache, 1, b"k", 1, 1);
        let b = get_simple(&cache, 2, b"k", 2, 1);
        assert_eq!(*a.value().downcast_ref::<u64>().unwrap(), 1);
        assert_eq!(*b.value().downcast_ref::<u64>().unwrap(), 2);
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = Cache::new(4);
        // Insert 8 unit-charge entries; only the last 4 survive.
        for i in 0..8u64 {
            let key = [i as u8];
            drop(get_simple(&cache, 1, &key, i, 1));
        }
        assert!(cache.size() <= 4);
        for i in 0..4u64 {
            let key = [i as u8];
            assert!(
                cache.get(1, &key, None).expect("get failed").is_none(),
                "entry {i} should have been evicted first"
            );
        }
        for i in 4..8u64 {
            let key = [i as u8];
            assert!(
                cache.get(1, &key, None).expect("get failed").is_some(),
                "entry {i} should have survived"
            );
        }
    }

    #[test]
    fn test_touch_protects_from_eviction() {
        let cache = Cache::new(3);
        drop(get_simple(&cache, 1, b"a", 0, 1));
        drop(get_simple(&cache, 1, b"b", 1, 1));
        drop(get_simple(&cache, 1, b"c", 2, 1));
        // Touch "a" so "b" becomes the LRU victim.
        assert!(cache.get(1, b"a", None).expect("get failed").is_some());
        drop(get_simple(&cache, 1, b"d", 3, 1));
        assert!(cache.get(1, b"b", None).expect("get failed").is_none());
        assert!(cache.get(1, b"a", None).expect("get failed").is_some());
    }

    #[test]
    fn test_finalizer_runs_once_after_last_handle() {
        let cache = Cache::new(10);
        let finalized = Arc::new(AtomicUsize::new(0));
        let handle = {
            let finalized = Arc::clone(&finalized);
            cache
                .get(
                    1,
                    b"k",
                    Some(Box::new(move || {
                        let finalized = Arc::clone(&finalized);
                        Ok((
                            value_of(7),
                            1,
                            Some(Box::new(move |_, _| {
                                finalized.fetch_add(1, Ordering::SeqCst);
                            })),
                        ))
                    })),
                )
                .expect("get failed")
                .expect("missing handle")
        };

        cache.delete(1, b"k");
        // Still pinned: the finalizer must wait for the handle.
        assert_eq!(finalized.load(Ordering::SeqCst), 0);
        drop(handle);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_evict_namespace() {
        let cache = Cache::new(100);
        drop(get_simple(&cache, 1, b"a", 1, 1));
        drop(get_simple(&cache, 2, b"b", 2, 1));
        cache.evict_namespace(1);
        assert!(cache.get(1, b"a", None).expect("get failed").is_none());
        assert!(cache.get(2, b"b", None).expect("get failed").is_some());
    }

    #[test]
    fn test_evict_all() {
        let cache = Cache::new(100);
        drop(get_simple(&cache, 1, b"a", 1, 1));
        drop(get_simple(&cache, 2, b"b", 2, 1));
        cache.evict_all();
        assert_eq!(cache.size(), 0);
        assert!(cache.get(1, b"a", None).expect("get failed").is_none());
        assert!(cache.get(2, b"b", None).expect("get failed").is_none());
    }

    #[test]
    fn test_loader_error_is_not_cached() {
        let cache = Cache::new(100);
        let err = cache.get(
            1,
            b"k",
            Some(Box::new(|| {
                Err(crate::error::Error::Io("disk on fire".to_string()))
            })),
        );
        assert!(err.is_err());
        // A later get with a working loader succeeds.
        let handle = get_simple(&cache, 1, b"k", 9, 1);
        assert_eq!(*handle.value().downcast_ref::<u64>().unwrap(), 9);
    }

    #[test]
    fn test_resize_under_load() {
        // Push well past the grow threshold and verify nothing is lost.
        let cache = Cache::new(1 << 20);
        let mut handles = Vec::new();
        for i in 0..2000u64 {
            let key = i.to_le_bytes();
            handles.push(get_simple(&cache, 1, &key, i, 1));
        }
        for i in 0..2000u64 {
            let key = i.to_le_bytes();
            let handle = cache
                .get(1, &key, None)
                .expect("get failed")
                .expect("entry lost during resize");
            assert_eq!(*handle.value().downcast_ref::<u64>().unwrap(), i);
        }
    }

    #[test]
    fn test_concurrent_gets() {
        use std::thread;

        let cache = Cache::new(1 << 16);
        let mut threads = Vec::new();
        for t in 0..8 {
            let cache = cache.clone();
            threads.push(thread::spawn(move || {
                for i in 0..500u64 {
                    let key = (i % 64).to_le_bytes();
                    let handle = cache
                        .get(
                            t % 4,
                            &key,
                            Some(Box::new(move || Ok((value_of(i % 64), 8, None)))),
                        )
                        .expect("get failed")
                        .expect("missing handle");
                    let v = handle.value();
                    assert_eq!(*v.downcast_ref::<u64>().expect("wrong type"), i % 64);
                }
            }));
        }
        for t in threads {
            t.join().expect("thread panicked");
        }
    }
}
