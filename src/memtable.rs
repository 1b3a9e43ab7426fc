//! In-memory write buffer.
//!
//! The memtable is an ordered map from internal key to value with a byte
//! capacity fixed at construction (the writer buffer). Only the current
//! write leader mutates the active memtable; any number of readers may walk
//! it concurrently, which the skiplist supports without locking. The frozen
//! memtable produced by rotation is read-only until its flush commits.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::comparer::InternalComparer;
use crate::error::{Error, Result};
use crate::iter::DbIterator;

/// Skiplist key ordered by the internal comparer (user key ascending,
/// sequence descending).
struct MemKey {
    ikey: Vec<u8>,
    icmp: InternalComparer,
}

impl PartialEq for MemKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MemKey {}

impl PartialOrd for MemKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.icmp.compare(&self.ikey, &other.ikey)
    }
}

pub struct Memtable {
    map: SkipMap<MemKey, Vec<u8>>,
    icmp: InternalComparer,
    /// Sum of ikey + value bytes across entries; each entry's internal key
    /// already carries the 8-byte tag the sizing contract charges.
    size: AtomicUsize,
    capacity: usize,
}

impl Memtable {
    pub fn new(icmp: InternalComparer, capacity: usize) -> Self {
        Self {
            map: SkipMap::new(),
            icmp,
            size: AtomicUsize::new(0),
            capacity,
        }
    }

    /// A memtable without a capacity bound, for read-only journal replay.
    pub fn unbounded(icmp: InternalComparer) -> Self {
        Self::new(icmp, usize::MAX)
    }

    fn wrap(&self, ikey: Vec<u8>) -> MemKey {
        MemKey {
            ikey,
            icmp: self.icmp.clone(),
        }
    }

    /// Inserts an entry, or returns CapacityExceeded if it would overflow
    /// the write buffer so the caller can rotate.
    pub fn insert(&self, ikey: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let charge = ikey.len() + value.len();
        if self.size.load(AtomicOrdering::Acquire) + charge > self.capacity {
            return Err(Error::CapacityExceeded);
        }
        self.insert_unbounded(ikey, value);
        Ok(())
    }

    /// Inserts without the capacity check, used by recovery replay.
    pub fn insert_unbounded(&self, ikey: Vec<u8>, value: Vec<u8>) {
        let charge = ikey.len() + value.len();
        self.map.insert(self.wrap(ikey), value);
        self.size.fetch_add(charge, AtomicOrdering::AcqRel);
    }

    /// First entry with internal key >= the target.
    pub fn first_ge(&self, ikey: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let query = self.wrap(ikey.to_vec());
        self.map
            .lower_bound(std::ops::Bound::Included(&query))
            .map(|e| (e.key().ikey.clone(), e.value().clone()))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Approximate bytes occupied: sum of klen + vlen + 8 per entry.
    pub fn approximate_size(&self) -> usize {
        self.size.load(AtomicOrdering::Acquire)
    }

    /// Remaining capacity.
    pub fn free(&self) -> usize {
        self.capacity
            .saturating_sub(self.size.load(AtomicOrdering::Acquire))
    }

    pub fn iter(self: Arc<Self>) -> MemtableIterator {
        MemtableIterator {
            mem: self,
            current: None,
        }
    }
}

/// Forward iterator over a pinned memtable.
///
/// Positions by re-seeking the skiplist on every step, which keeps the
/// iterator independent of concurrent inserts into the active memtable.
pub struct MemtableIterator {
    mem: Arc<Memtable>,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl DbIterator for MemtableIterator {
    fn first(&mut self) -> Result<bool> {
        self.current = self
            .mem
            .map
            .front()
            .map(|e| (e.key().ikey.clone(), e.value().clone()));
        Ok(self.current.is_some())
    }

    fn next(&mut self) -> Result<bool> {
        let key = match &self.current {
            None => return self.first(),
            Some((key, _)) => self.mem.wrap(key.clone()),
        };
        self.current = self
            .mem
            .map
            .lower_bound(std::ops::Bound::Excluded(&key))
            .map(|e| (e.key().ikey.clone(), e.value().clone()));
        Ok(self.current.is_some())
    }

    fn seek(&mut self, ikey: &[u8]) -> Result<bool> {
        self.current = self.mem.first_ge(ikey);
        Ok(self.current.is_some())
    }

    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map(|(k, _)| k.as_slice()).unwrap_or(&[])
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().map(|(_, v)| v.as_slice()).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparer::BytewiseComparer;
    use crate::keys::{make_ikey, parse_ikey, KeyKind};

    fn icmp() -> InternalComparer {
        InternalComparer::new(Arc::new(BytewiseComparer))
    }

    #[test]
    fn test_insert_and_lookup() {
        let mem = Memtable::new(icmp(), 1 << 20);
        mem.insert(make_ikey(b"b", 2, KeyKind::Value), b"vb".to_vec())
            .expect("insert failed");
        mem.insert(make_ikey(b"a", 1, KeyKind::Value), b"va".to_vec())
            .expect("insert failed");

        let seek = make_ikey(b"a", u64::MAX >> 8, KeyKind::Value);
        let (ikey, value) = mem.first_ge(&seek).expect("missing entry");
        let (ukey, seq, _) = parse_ikey(&ikey).expect("parse failed");
        assert_eq!(ukey, b"a");
        assert_eq!(seq, 1);
        assert_eq!(value, b"va");
    }

    #[test]
    fn test_newer_sequence_sorts_first() {
        let mem = Memtable::new(icmp(), 1 << 20);
        mem.insert(make_ikey(b"k", 1, KeyKind::Value), b"old".to_vec())
            .expect("insert failed");
        mem.insert(make_ikey(b"k", 9, KeyKind::Value), b"new".to_vec())
            .expect("insert failed");

        // Seeking at a read sequence of 100 lands on the newest entry.
        let seek = make_ikey(b"k", 100, KeyKind::Value);
        let (ikey, value) = mem.first_ge(&seek).expect("missing entry");
        let (_, seq, _) = parse_ikey(&ikey).expect("parse failed");
        assert_eq!(seq, 9);
        assert_eq!(value, b"new");
    }

    #[test]
    fn test_size_accounting() {
        let mem = Memtable::new(icmp(), 1 << 20);
        let mut expected = 0;
        for i in 0..100u32 {
            let key = format!("key{i:03}");
            let value = format!("value{i}");
            mem.insert(
                make_ikey(key.as_bytes(), u64::from(i) + 1, KeyKind::Value),
                value.clone().into_bytes(),
            )
            .expect("insert failed");
            expected += key.len() + value.len() + 8;
        }
        assert_eq!(mem.approximate_size(), expected);
    }

    #[test]
    fn test_capacity_signal() {
        let mem = Memtable::new(icmp(), 64);
        let mut seq = 1;
        loop {
            let ikey = make_ikey(b"key", seq, KeyKind::Value);
            match mem.insert(ikey, vec![0u8; 16]) {
                Ok(()) => seq += 1,
                Err(Error::CapacityExceeded) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
            assert!(seq < 100, "capacity bound never tripped");
        }
        assert!(mem.approximate_size() <= 64);
    }

    #[test]
    fn test_iteration_order() {
        let mem = Arc::new(Memtable::new(icmp(), 1 << 20));
        mem.insert(make_ikey(b"c", 3, KeyKind::Value), vec![])
            .expect("insert failed");
        mem.insert(make_ikey(b"a", 1, KeyKind::Value), vec![])
            .expect("insert failed");
        mem.insert(make_ikey(b"a", 5, KeyKind::Deletion), vec![])
            .expect("insert failed");
        mem.insert(make_ikey(b"b", 2, KeyKind::Value), vec![])
            .expect("insert failed");

        let mut iter = mem.iter();
        let mut seen = Vec::new();
        let mut more = iter.first().expect("first failed");
        while more {
            let (ukey, seq, _) = parse_ikey(iter.key()).expect("parse failed");
            seen.push((ukey.to_vec(), seq));
            more = iter.next().expect("next failed");
        }
        // User key ascending, sequence descending within a user key.
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 5),
                (b"a".to_vec(), 1),
                (b"b".to_vec(), 2),
                (b"c".to_vec(), 3),
            ]
        );
    }

    #[test]
    fn test_concurrent_reads_during_insert() {
        use std::thread;

        let mem = Arc::new(Memtable::new(icmp(), 1 << 22));
        let writer = {
            let mem = Arc::clone(&mem);
            thread::spawn(move || {
                for i in 0..1000u64 {
                    let key = format!("key{i:04}");
                    mem.insert(make_ikey(key.as_bytes(), i + 1, KeyKind::Value), vec![1])
                        .expect("insert failed");
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..4 {
            let mem = Arc::clone(&mem);
            readers.push(thread::spawn(move || {
                let mut iter = mem.iter();
                let mut count = 0;
                let mut more = iter.first().unwrap_or(false);
                while more {
                    count += 1;
                    more = iter.next().unwrap_or(false);
                }
                count
            }));
        }

        writer.join().expect("writer panicked");
        for reader in readers {
            let count = reader.join().expect("reader panicked");
            assert!(count <= 1000);
        }
        assert_eq!(mem.len(), 1000);
    }
}
