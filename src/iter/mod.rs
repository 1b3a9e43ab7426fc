//! Iteration over ordered entry sources.
//!
//! Everything that yields internal-key entries in order (memtables, table
//! files, level file sets, merged views of all of them) implements
//! [`DbIterator`]. Positioning follows the explicit-move style: `first`,
//! `seek` and `next` return whether the iterator landed on an entry, and
//! `key`/`value` are only meaningful while it is positioned.

pub mod merge;

pub use merge::MergingIterator;

use crate::error::{Error, Result};

pub trait DbIterator {
    /// Positions at the first entry.
    fn first(&mut self) -> Result<bool>;

    /// Advances to the next entry. Calling `next` on an unpositioned
    /// iterator positions it at the first entry.
    fn next(&mut self) -> Result<bool>;

    /// Positions at the first entry with key >= the target.
    fn seek(&mut self, key: &[u8]) -> Result<bool>;

    /// True while positioned on an entry.
    fn valid(&self) -> bool;

    /// Current key. Only meaningful while `valid()`.
    fn key(&self) -> &[u8];

    /// Current value. Only meaningful while `valid()`.
    fn value(&self) -> &[u8];
}

/// An iterator over nothing, optionally carrying the error that emptied it.
/// Stands in for a child that failed to open so the failure surfaces at
/// iteration time instead of silently narrowing the merge.
pub struct EmptyIterator {
    err: Option<Error>,
}

impl EmptyIterator {
    pub fn new() -> Self {
        Self { err: None }
    }

    pub fn with_error(err: Error) -> Self {
        Self { err: Some(err) }
    }

    fn take(&mut self) -> Result<bool> {
        match self.err.take() {
            Some(err) => Err(err),
            None => Ok(false),
        }
    }
}

impl Default for EmptyIterator {
    fn default() -> Self {
        Self::new()
    }
}

impl DbIterator for EmptyIterator {
    fn first(&mut self) -> Result<bool> {
        self.take()
    }

    fn next(&mut self) -> Result<bool> {
        self.take()
    }

    fn seek(&mut self, _key: &[u8]) -> Result<bool> {
        self.take()
    }

    fn valid(&self) -> bool {
        false
    }

    fn key(&self) -> &[u8] {
        &[]
    }

    fn value(&self) -> &[u8] {
        &[]
    }
}
