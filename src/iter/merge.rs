//! K-way merge over ordered child iterators.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::DbIterator;
use crate::comparer::InternalComparer;
use crate::error::Result;

/// Heap entry: the child's current key plus its position in the child list.
/// Ordered ascending by key, then by child index, so that when two children
/// carry equal keys the one listed first wins — callers list newer sources
/// first.
struct HeapEntry {
    key: Vec<u8>,
    index: usize,
    icmp: InternalComparer,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert to pop the smallest key first.
        self.icmp
            .compare(&self.key, &other.key)
            .then_with(|| self.index.cmp(&other.index))
            .reverse()
    }
}

/// Merges N child iterators into one ascending stream of internal keys.
pub struct MergingIterator {
    children: Vec<Box<dyn DbIterator>>,
    heap: BinaryHeap<HeapEntry>,
    icmp: InternalComparer,
    /// Child currently exposed through key()/value(), if positioned.
    current: Option<usize>,
}

impl MergingIterator {
    pub fn new(children: Vec<Box<dyn DbIterator>>, icmp: InternalComparer) -> Self {
        Self {
            children,
            heap: BinaryHeap::new(),
            icmp,
            current: None,
        }
    }

    fn push_child(&mut self, index: usize) {
        let key = self.children[index].key().to_vec();
        self.heap.push(HeapEntry {
            key,
            index,
            icmp: self.icmp.clone(),
        });
    }

    fn pop(&mut self) -> bool {
        match self.heap.pop() {
            Some(entry) => {
                self.current = Some(entry.index);
                true
            }
            None => {
                self.current = None;
                false
            }
        }
    }
}

impl DbIterator for MergingIterator {
    fn first(&mut self) -> Result<bool> {
        self.heap.clear();
        self.current = None;
        for i in 0..self.children.len() {
            if self.children[i].first()? {
                self.push_child(i);
            }
        }
        Ok(self.pop())
    }

    fn next(&mut self) -> Result<bool> {
        let index = match self.current {
            Some(index) => index,
            None => return self.first(),
        };
        if self.children[index].next()? {
            self.push_child(index);
        }
        Ok(self.pop())
    }

    fn seek(&mut self, key: &[u8]) -> Result<bool> {
        self.heap.clear();
        self.current = None;
        for i in 0..self.children.len() {
            if self.children[i].seek(key)? {
                self.push_child(i);
            }
        }
        Ok(self.pop())
    }

    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        match self.current {
            Some(index) => self.children[index].key(),
            None => &[],
        }
    }

    fn value(&self) -> &[u8] {
        match self.current {
            Some(index) => self.children[index].value(),
            None => &[],
        }
    }
}
