//! Point-in-time read views.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::DbInner;
use crate::error::Result;

/// A pinned sequence number. Reads through the snapshot see exactly the
/// state as of its creation; while any snapshot is live, compactions keep
/// the entry versions it can still observe.
pub struct Snapshot {
    inner: Arc<DbInner>,
    id: u64,
    seq: u64,
}

impl Snapshot {
    pub(crate) fn acquire(inner: Arc<DbInner>) -> Snapshot {
        let id = inner.next_snapshot_id.fetch_add(1, Ordering::SeqCst);
        let seq = inner.seq.load(Ordering::SeqCst);
        inner
            .snapshots
            .lock()
            .expect("snapshot lock poisoned")
            .push((id, seq));
        Snapshot { inner, id, seq }
    }

    /// The pinned sequence.
    pub fn sequence(&self) -> u64 {
        self.seq
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get_at(key, self.seq)
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        let mut snapshots = self
            .inner
            .snapshots
            .lock()
            .expect("snapshot lock poisoned");
        if let Some(pos) = snapshots.iter().position(|(id, _)| *id == self.id) {
            snapshots.swap_remove(pos);
        }
    }
}
