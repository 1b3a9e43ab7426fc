//! The database engine.
//!
//! Write path: client op -> batch -> write merger (leader/follower under a
//! write token) -> journal append -> memtable insert -> sequence advance.
//! When the active memtable fills, it is rotated to the frozen slot and a
//! minor-compaction worker flushes it to level 0. A second worker runs
//! level compactions. Read path: active memtable, frozen memtable, then
//! the current version's levels, with bloom filters and the block cache in
//! front of the table files.

pub mod compaction;
pub mod recovery;
pub mod snapshot;
pub mod write;

pub use snapshot::Snapshot;

use std::fs::File;
use std::io::BufWriter;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::batch::Batch;
use crate::comparer::InternalComparer;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::iter::{DbIterator, MergingIterator};
use crate::journal;
use crate::keys::{make_ikey, parse_ikey, KeyKind};
use crate::memtable::Memtable;
use crate::session::Session;
use crate::storage::{FileDesc, FileKind, Storage};
use crate::table_cache::TableCache;
use crate::version::{RefTracker, Version};

/// A command for a compaction worker. The ack channel, when present, makes
/// the request wait-for-completion instead of fire-and-forget.
pub(crate) enum CompCmd {
    Auto(Option<Sender<Result<()>>>),
}

pub(crate) struct JournalFile {
    pub(crate) fd: FileDesc,
    pub(crate) file: File,
    pub(crate) writer: journal::Writer<BufWriter<File>>,
}

/// The memtable pair and the journal feeding the active one. Mutated only
/// by the write leader and the rotation path, both under the mutex.
pub(crate) struct MemState {
    pub(crate) active: Arc<Memtable>,
    pub(crate) journal: Option<JournalFile>,
    pub(crate) frozen: Option<Arc<Memtable>>,
    pub(crate) frozen_journal_fd: Option<FileDesc>,
    /// Last sequence assigned when the frozen memtable was sealed.
    pub(crate) frozen_seq: u64,
}

pub(crate) struct MergeReq {
    pub(crate) kind: KeyKind,
    pub(crate) key: Vec<u8>,
    pub(crate) value: Vec<u8>,
}

/// The channels implementing write-merge leadership; see `write.rs`.
pub(crate) struct WriteChannels {
    pub(crate) merge_tx: Sender<MergeReq>,
    pub(crate) merge_rx: Receiver<MergeReq>,
    pub(crate) merged_tx: Sender<bool>,
    pub(crate) merged_rx: Receiver<bool>,
    pub(crate) ack_tx: Sender<Result<()>>,
    pub(crate) ack_rx: Receiver<Result<()>>,
    pub(crate) token_tx: Sender<()>,
    pub(crate) token_rx: Receiver<()>,
}

impl WriteChannels {
    fn new() -> Self {
        let (merge_tx, merge_rx) = bounded(0);
        let (merged_tx, merged_rx) = bounded(0);
        let (ack_tx, ack_rx) = bounded(0);
        let (token_tx, token_rx) = bounded(1);
        Self {
            merge_tx,
            merge_rx,
            merged_tx,
            merged_rx,
            ack_tx,
            ack_rx,
            token_tx,
            token_rx,
        }
    }
}

pub(crate) struct DbInner {
    pub(crate) opts: Options,
    pub(crate) storage: Arc<Storage>,
    pub(crate) session: Session,
    pub(crate) table_cache: TableCache,
    pub(crate) icmp: InternalComparer,
    /// Last assigned sequence number.
    pub(crate) seq: AtomicU64,
    pub(crate) mem: Mutex<MemState>,
    /// Live snapshots as (id, pinned sequence).
    pub(crate) snapshots: Mutex<Vec<(u64, u64)>>,
    pub(crate) next_snapshot_id: AtomicU64,
    pub(crate) write: WriteChannels,
    pub(crate) mcomp_tx: Sender<CompCmd>,
    pub(crate) tcomp_tx: Sender<CompCmd>,
    pub(crate) pause_tx: Sender<Receiver<()>>,
    /// Disconnects when the close sender drops; everything blocking
    /// selects on it.
    pub(crate) close_rx: Receiver<()>,
    pub(crate) closed: AtomicBool,
}

impl DbInner {
    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Point lookup at the given read sequence.
    pub(crate) fn get_at(&self, key: &[u8], seq: u64) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let ikey = make_ikey(key, seq, KeyKind::Value);

        let (active, frozen) = {
            let mem = self.mem.lock()?;
            (Arc::clone(&mem.active), mem.frozen.clone())
        };
        for mem in std::iter::once(active).chain(frozen) {
            if let Some((rkey, value)) = mem.first_ge(&ikey) {
                let (ruk, _, kind) = parse_ikey(&rkey)?;
                if self.icmp.ucompare(ruk, key) == std::cmp::Ordering::Equal {
                    return Ok(match kind {
                        KeyKind::Value => Some(value),
                        KeyKind::Deletion => None,
                    });
                }
            }
        }

        let version = self.session.current_version();
        version.get(&ikey, &self.table_cache)
    }

    /// The compaction drop horizon: the oldest pinned snapshot sequence,
    /// or the current sequence when nothing is pinned.
    pub(crate) fn min_seq(&self) -> u64 {
        let snapshots = self.snapshots.lock().expect("snapshot lock poisoned");
        snapshots
            .iter()
            .map(|(_, seq)| *seq)
            .min()
            .unwrap_or_else(|| self.seq.load(Ordering::SeqCst))
    }
}

/// An embedded, ordered, durable key-value store.
pub struct DB {
    inner: Arc<DbInner>,
    close_tx: Mutex<Option<Sender<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    ref_tracker: Mutex<Option<RefTracker>>,
}

impl DB {
    /// Opens (creating if needed) the store at `opts.dir`, recovering the
    /// manifest and replaying any journals left by an unclean shutdown.
    pub fn open(opts: Options) -> Result<DB> {
        let storage = Arc::new(Storage::open(&opts.dir, opts.read_only)?);
        let icmp = InternalComparer::new(opts.comparer.clone());
        let table_cache = TableCache::new(Arc::clone(&storage), icmp.clone(), &opts);

        let ref_tracker = {
            let storage = Arc::clone(&storage);
            let table_cache = table_cache.clone();
            RefTracker::start(Box::new(move |num| {
                table_cache.evict(num);
                match storage.remove(FileDesc::new(FileKind::Table, num)) {
                    Ok(()) => tracing::debug!(table = num, "removed obsolete table"),
                    Err(err) => {
                        tracing::warn!(table = num, error = %err, "failed to remove obsolete table")
                    }
                }
            }))
        };

        let session = Session::new(
            Arc::clone(&storage),
            opts.clone(),
            icmp.clone(),
            table_cache.clone(),
            ref_tracker.sender(),
        );

        match session.recover() {
            Ok(()) => {}
            Err(Error::NotFound) => {
                if opts.read_only {
                    return Err(Error::InvalidArgument(format!(
                        "no database at {}",
                        opts.dir.display()
                    )));
                }
                session.create()?;
            }
            Err(err) => return Err(err),
        }

        let (mem_state, seq) = if opts.read_only {
            recovery::replay_read_only(&storage, &session, &opts, &icmp)?
        } else {
            recovery::replay_journals(&storage, &session, &opts, &icmp)?
        };

        let (mcomp_tx, mcomp_rx) = unbounded();
        let (tcomp_tx, tcomp_rx) = unbounded();
        let (pause_tx, pause_rx) = bounded(0);
        let (close_tx, close_rx) = bounded::<()>(0);

        let inner = Arc::new(DbInner {
            opts: opts.clone(),
            storage,
            session,
            table_cache,
            icmp,
            seq: AtomicU64::new(seq),
            mem: Mutex::new(mem_state),
            snapshots: Mutex::new(Vec::new()),
            next_snapshot_id: AtomicU64::new(1),
            write: WriteChannels::new(),
            mcomp_tx,
            tcomp_tx,
            pause_tx,
            close_rx: close_rx.clone(),
            closed: AtomicBool::new(false),
        });

        let mut workers = Vec::new();
        if !opts.read_only {
            let minor = {
                let inner = Arc::clone(&inner);
                let close_rx = close_rx.clone();
                std::thread::Builder::new()
                    .name("emberdb-minor".to_string())
                    .spawn(move || compaction::minor_worker(inner, mcomp_rx, close_rx))
                    .map_err(|e| Error::Io(e.to_string()))?
            };
            let table = {
                let inner = Arc::clone(&inner);
                std::thread::Builder::new()
                    .name("emberdb-compact".to_string())
                    .spawn(move || compaction::table_worker(inner, tcomp_rx, pause_rx, close_rx))
                    .map_err(|e| Error::Io(e.to_string()))?
            };
            workers.push(minor);
            workers.push(table);
        }

        tracing::info!(dir = %opts.dir.display(), sequence = seq, "database open");
        Ok(DB {
            inner,
            close_tx: Mutex::new(Some(close_tx)),
            workers: Mutex::new(workers),
            ref_tracker: Mutex::new(Some(ref_tracker)),
        })
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.apply(KeyKind::Value, key, value)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.apply(KeyKind::Deletion, key, &[])
    }

    /// Applies a batch atomically: all entries become visible at once and
    /// consume a contiguous sequence range.
    pub fn write(&self, batch: Batch) -> Result<()> {
        self.inner.write_batch(batch)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let seq = self.inner.seq.load(Ordering::SeqCst);
        self.inner.get_at(key, seq)
    }

    /// Pins the current sequence; reads through the snapshot ignore later
    /// writes.
    pub fn snapshot(&self) -> Result<Snapshot> {
        self.inner.check_open()?;
        Ok(Snapshot::acquire(Arc::clone(&self.inner)))
    }

    /// An ordered iterator over user keys at the current sequence.
    pub fn iter(&self) -> Result<DbIter> {
        self.inner.check_open()?;
        let seq = self.inner.seq.load(Ordering::SeqCst);
        DbIter::new(&self.inner, seq)
    }

    /// Flushes the journal, stops the workers and releases every pinned
    /// version. Idempotent; also runs on drop.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        {
            let mut mem = self.inner.mem.lock()?;
            if let Some(journal) = mem.journal.as_mut() {
                let _ = journal.writer.flush();
                let _ = journal.file.sync_all();
            }
        }

        // Dropping the close sender disconnects close_rx; blocked writers
        // and workers observe it and bail out with Closed.
        self.close_tx.lock()?.take();
        for handle in self.workers.lock()?.drain(..) {
            let _ = handle.join();
        }

        {
            let mut mem = self.inner.mem.lock()?;
            mem.frozen = None;
        }
        self.inner.session.release_current();
        if let Some(tracker) = self.ref_tracker.lock()?.take() {
            tracker.stop();
        }
        tracing::info!("database closed");
        Ok(())
    }
}

impl Drop for DB {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// User-facing ordered iterator.
///
/// Collapses the internal multi-version stream down to live user keys at
/// its read sequence: the newest visible entry of each key wins, deletion
/// tombstones hide older versions. Errors are sticky: once iteration
/// fails, every later call reports the same error. Dropping the iterator
/// releases its pinned version and table handles.
pub struct DbIter {
    iter: MergingIterator,
    _version: Arc<Version>,
    icmp: InternalComparer,
    read_seq: u64,
    current: Option<(Vec<u8>, Vec<u8>)>,
    err: Option<Error>,
}

impl DbIter {
    fn new(inner: &Arc<DbInner>, read_seq: u64) -> Result<DbIter> {
        let (active, frozen) = {
            let mem = inner.mem.lock()?;
            (Arc::clone(&mem.active), mem.frozen.clone())
        };
        let version = inner.session.current_version();

        let mut children: Vec<Box<dyn DbIterator>> = Vec::new();
        children.push(Box::new(active.iter()));
        if let Some(frozen) = frozen {
            children.push(Box::new(frozen.iter()));
        }
        children.extend(version.iterators(&inner.table_cache));

        Ok(DbIter {
            iter: MergingIterator::new(children, inner.icmp.clone()),
            _version: version,
            icmp: inner.icmp.clone(),
            read_seq,
            current: None,
            err: None,
        })
    }

    fn check(&self) -> Result<()> {
        match &self.err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        self.current = None;
        self.err = Some(err.clone());
        err
    }

    /// Advances the internal iterator to the next visible user key,
    /// skipping stale versions, entries newer than the read sequence, and
    /// everything shadowed by a tombstone.
    fn settle(&mut self, mut skip_ukey: Option<Vec<u8>>) -> Result<bool> {
        while self.iter.valid() {
            let (ukey, seq, kind) = match parse_ikey(self.iter.key()) {
                Ok(parts) => parts,
                Err(err) => return Err(self.fail(err)),
            };
            let skipped = skip_ukey
                .as_deref()
                .is_some_and(|s| self.icmp.ucompare(s, ukey) == std::cmp::Ordering::Equal);
            if seq <= self.read_seq && !skipped {
                match kind {
                    KeyKind::Deletion => skip_ukey = Some(ukey.to_vec()),
                    KeyKind::Value => {
                        self.current = Some((ukey.to_vec(), self.iter.value().to_vec()));
                        return Ok(true);
                    }
                }
            }
            if let Err(err) = self.iter.next() {
                return Err(self.fail(err));
            }
        }
        self.current = None;
        Ok(false)
    }

    pub fn first(&mut self) -> Result<bool> {
        self.check()?;
        if let Err(err) = self.iter.first() {
            return Err(self.fail(err));
        }
        self.settle(None)
    }

    /// Positions at the first user key >= the target.
    pub fn seek(&mut self, ukey: &[u8]) -> Result<bool> {
        self.check()?;
        let target = make_ikey(ukey, self.read_seq, KeyKind::Value);
        if let Err(err) = self.iter.seek(&target) {
            return Err(self.fail(err));
        }
        self.settle(None)
    }

    pub fn next(&mut self) -> Result<bool> {
        self.check()?;
        let skip = match &self.current {
            None => return self.first(),
            Some((ukey, _)) => ukey.clone(),
        };
        if let Err(err) = self.iter.next() {
            return Err(self.fail(err));
        }
        self.settle(Some(skip))
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// Current user key.
    pub fn key(&self) -> &[u8] {
        self.current.as_ref().map(|(k, _)| k.as_slice()).unwrap_or(&[])
    }

    pub fn value(&self) -> &[u8] {
        self.current.as_ref().map(|(_, v)| v.as_slice()).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn small_opts(dir: &TempDir) -> Options {
        Options::new(dir.path())
            .write_buffer(4096)
            .target_file_size(4096)
    }

    #[test]
    fn test_put_get_delete_across_reopen() {
        let dir = TempDir::new().expect("tempdir failed");
        {
            let db = DB::open(Options::new(dir.path())).expect("open failed");
            db.put(b"a", b"1").expect("put failed");
            db.put(b"b", b"2").expect("put failed");

            assert_eq!(db.get(b"a").expect("get failed"), Some(b"1".to_vec()));
            assert_eq!(db.get(b"b").expect("get failed"), Some(b"2".to_vec()));
            assert_eq!(db.get(b"c").expect("get failed"), None);

            db.delete(b"a").expect("delete failed");
            assert_eq!(db.get(b"a").expect("get failed"), None);
            db.close().expect("close failed");
        }
        {
            let db = DB::open(Options::new(dir.path())).expect("reopen failed");
            assert_eq!(db.get(b"a").expect("get failed"), None);
            assert_eq!(db.get(b"b").expect("get failed"), Some(b"2".to_vec()));
            assert_eq!(db.get(b"c").expect("get failed"), None);
        }
    }

    #[test]
    fn test_atomic_batch() {
        let dir = TempDir::new().expect("tempdir failed");
        let db = DB::open(Options::new(dir.path())).expect("open failed");

        let seq_before = db.inner.seq.load(Ordering::SeqCst);
        let mut batch = Batch::new();
        batch.put(b"x", b"1");
        batch.delete(b"y");
        batch.put(b"z", b"3");
        db.write(batch).expect("write failed");

        assert_eq!(db.get(b"x").expect("get failed"), Some(b"1".to_vec()));
        assert_eq!(db.get(b"y").expect("get failed"), None);
        assert_eq!(db.get(b"z").expect("get failed"), Some(b"3".to_vec()));
        assert_eq!(db.inner.seq.load(Ordering::SeqCst), seq_before + 3);
    }

    fn copy_dir(src: &std::path::Path, dst: &std::path::Path) {
        std::fs::create_dir_all(dst).expect("create dst failed");
        for entry in std::fs::read_dir(src).expect("read_dir failed") {
            let entry = entry.expect("entry failed");
            let to = dst.join(entry.file_name());
            std::fs::copy(entry.path(), &to).expect("copy failed");
        }
    }

    #[test]
    fn test_journal_replay_after_crash() {
        let dir = TempDir::new().expect("tempdir failed");
        let crash = TempDir::new().expect("tempdir failed");
        let image = crash.path().join("image");

        {
            let db = DB::open(small_opts(&dir)).expect("open failed");
            for i in 0..1000u32 {
                let key = format!("{i:08}");
                let value = vec![b'v'; 32];
                db.put(key.as_bytes(), &value).expect("put failed");
            }
            // Let background work settle so the copy sees consistent
            // files, then snapshot the directory while the journal is
            // live: the moral equivalent of dying without close.
            db.inner
                .comp_trigger_wait(&db.inner.mcomp_tx)
                .expect("minor quiesce failed");
            db.inner
                .comp_trigger_wait(&db.inner.tcomp_tx)
                .expect("table quiesce failed");
            copy_dir(dir.path(), &image);
            db.close().expect("close failed");
        }

        let mut crash_opts = small_opts(&dir);
        crash_opts.dir = image.clone();
        let db = DB::open(crash_opts).expect("crash reopen failed");
        for i in 0..1000u32 {
            let key = format!("{i:08}");
            assert_eq!(
                db.get(key.as_bytes()).expect("get failed"),
                Some(vec![b'v'; 32]),
                "key {key} lost in replay"
            );
        }

        let mut tables = 0;
        let mut journals = Vec::new();
        for entry in std::fs::read_dir(&image).expect("read_dir failed") {
            let name = entry.expect("entry failed").file_name();
            let name = name.to_string_lossy().to_string();
            if name.ends_with(".ldb") {
                tables += 1;
            }
            if name.ends_with(".log") {
                journals.push(name);
            }
        }
        assert!(tables > 0, "replay produced no level-0 tables");
        // Consumed journals are gone; only the freshly created one remains.
        assert_eq!(journals.len(), 1, "stale journals remain: {journals:?}");
    }

    #[test]
    fn test_throttle_and_compaction() {
        let dir = TempDir::new().expect("tempdir failed");
        let db = DB::open(small_opts(&dir)).expect("open failed");

        for i in 0..500u32 {
            let key = format!("{i:032}");
            let value = format!("value-{i:058}");
            db.put(key.as_bytes(), value.as_bytes()).expect("put failed");
        }

        // Quiesce: flush the tail of the memtable and let both workers
        // finish.
        db.inner.rotate_mem().expect("rotate failed");
        db.inner
            .comp_trigger_wait(&db.inner.mcomp_tx)
            .expect("minor compaction failed");
        db.inner
            .comp_trigger_wait(&db.inner.tcomp_tx)
            .expect("table compaction failed");

        for i in 0..500u32 {
            let key = format!("{i:032}");
            let value = format!("value-{i:058}");
            assert_eq!(
                db.get(key.as_bytes()).expect("get failed"),
                Some(value.into_bytes()),
                "key {i} lost through compaction"
            );
        }

        let version = db.inner.session.current_version();
        assert!(
            version.level_len(0) <= 4,
            "level 0 still backed up: {} files",
            version.level_len(0)
        );
        assert!(
            version.levels.len() > 1 && version.level_len(1) > 0,
            "no table compaction ran"
        );
        // Levels >= 1 are disjoint and sorted.
        for files in version.levels.iter().skip(1) {
            for pair in files.windows(2) {
                assert!(
                    db.inner.icmp.ucompare(
                        crate::keys::ukey(&pair[0].max_ikey),
                        crate::keys::ukey(&pair[1].min_ikey)
                    ) == std::cmp::Ordering::Less,
                    "overlapping files in level >= 1"
                );
            }
        }
    }

    #[test]
    fn test_iterator_order_and_seek() {
        let dir = TempDir::new().expect("tempdir failed");
        let db = DB::open(Options::new(dir.path())).expect("open failed");

        for i in 0..100u32 {
            let key = format!("k{i:03}");
            db.put(key.as_bytes(), key.as_bytes()).expect("put failed");
        }

        let mut iter = db.iter().expect("iter failed");
        let mut seen = Vec::new();
        let mut more = iter.first().expect("first failed");
        while more {
            assert_eq!(iter.key(), iter.value(), "value should mirror key");
            seen.push(iter.key().to_vec());
            more = iter.next().expect("next failed");
        }
        let expected: Vec<Vec<u8>> = (0..100u32)
            .map(|i| format!("k{i:03}").into_bytes())
            .collect();
        assert_eq!(seen, expected);

        assert!(iter.seek(b"k050").expect("seek failed"));
        assert_eq!(iter.key(), b"k050");
        assert!(iter.next().expect("next failed"));
        assert_eq!(iter.key(), b"k051");
    }

    #[test]
    fn test_iterator_sees_through_levels() {
        let dir = TempDir::new().expect("tempdir failed");
        let db = DB::open(small_opts(&dir)).expect("open failed");

        // Enough writes to spill into tables, plus fresh overwrites that
        // stay in the memtable.
        for i in 0..300u32 {
            let key = format!("k{i:04}");
            db.put(key.as_bytes(), b"old").expect("put failed");
        }
        for i in (0..300u32).step_by(3) {
            let key = format!("k{i:04}");
            db.put(key.as_bytes(), b"new").expect("put failed");
        }
        db.delete(b"k0001").expect("delete failed");

        let mut iter = db.iter().expect("iter failed");
        let mut count = 0;
        let mut more = iter.first().expect("first failed");
        while more {
            let key = String::from_utf8_lossy(iter.key()).to_string();
            assert_ne!(key, "k0001", "deleted key visible");
            let idx: u32 = key[1..].parse().expect("key shape");
            let expected: &[u8] = if idx % 3 == 0 { b"new" } else { b"old" };
            assert_eq!(iter.value(), expected, "wrong version for {key}");
            count += 1;
            more = iter.next().expect("next failed");
        }
        assert_eq!(count, 299);
    }

    #[test]
    fn test_block_cache_stays_within_capacity() {
        let dir = TempDir::new().expect("tempdir failed");
        let opts = Options::new(dir.path())
            .write_buffer(4096)
            .target_file_size(1 << 20)
            .block_size(512)
            .block_cache_capacity(4 * 512);
        let db = DB::open(opts).expect("open failed");

        // Spill a table with many blocks, then scan it twice.
        for i in 0..400u32 {
            let key = format!("k{i:05}");
            db.put(key.as_bytes(), &vec![b'x'; 64]).expect("put failed");
        }
        db.inner.rotate_mem().expect("rotate failed");
        db.inner
            .comp_trigger_wait(&db.inner.mcomp_tx)
            .expect("flush failed");

        for _ in 0..2 {
            let mut iter = db.iter().expect("iter failed");
            let mut more = iter.first().expect("first failed");
            while more {
                more = iter.next().expect("next failed");
            }
            let cache = db.inner.table_cache.block_cache();
            assert!(
                cache.size() <= cache.capacity(),
                "block cache over capacity: {} > {}",
                cache.size(),
                cache.capacity()
            );
        }
    }

    #[test]
    fn test_trivial_move_does_not_rewrite() {
        let dir = TempDir::new().expect("tempdir failed");
        let db = DB::open(small_opts(&dir)).expect("open failed");

        // Four disjoint key ranges, each flushed as its own level-0 table.
        // Disjoint level-0 files with an empty level 1 satisfy the trivial
        // conditions, so reaching the level-0 trigger produces a move.
        for range in ["a", "b", "c", "d"] {
            for i in 0..40u32 {
                let key = format!("{range}{i:03}");
                db.put(key.as_bytes(), &vec![b'x'; 48]).expect("put failed");
            }
            db.inner.rotate_mem().expect("rotate failed");
            db.inner
                .comp_trigger_wait(&db.inner.mcomp_tx)
                .expect("flush failed");
        }

        let tables_before: std::collections::BTreeSet<u64> = db
            .inner
            .storage
            .list(crate::storage::FileKind::Table)
            .expect("list failed")
            .into_iter()
            .map(|fd| fd.num)
            .collect();

        db.inner
            .comp_trigger_wait(&db.inner.tcomp_tx)
            .expect("compaction failed");

        let version = db.inner.session.current_version();
        assert!(version.level_len(1) >= 1, "no file moved to level 1");

        let tables_after: std::collections::BTreeSet<u64> = db
            .inner
            .storage
            .list(crate::storage::FileKind::Table)
            .expect("list failed")
            .into_iter()
            .map(|fd| fd.num)
            .collect();
        // A move reuses the file: nothing was written or deleted.
        assert_eq!(tables_before, tables_after);

        for range in ["a", "b", "c", "d"] {
            for i in 0..40u32 {
                let key = format!("{range}{i:03}");
                assert_eq!(
                    db.get(key.as_bytes()).expect("get failed"),
                    Some(vec![b'x'; 48]),
                    "key {key} lost by the move"
                );
            }
        }
    }

    #[test]
    fn test_snapshot_isolation() {
        let dir = TempDir::new().expect("tempdir failed");
        let db = DB::open(Options::new(dir.path())).expect("open failed");

        db.put(b"k", b"v1").expect("put failed");
        let snapshot = db.snapshot().expect("snapshot failed");
        db.put(b"k", b"v2").expect("put failed");
        db.delete(b"gone-later").expect("delete failed");

        assert_eq!(db.get(b"k").expect("get failed"), Some(b"v2".to_vec()));
        assert_eq!(
            snapshot.get(b"k").expect("snapshot get failed"),
            Some(b"v1".to_vec())
        );
    }

    #[test]
    fn test_concurrent_writers_merge() {
        use std::thread;

        let dir = TempDir::new().expect("tempdir failed");
        let db = Arc::new(DB::open(Options::new(dir.path())).expect("open failed"));

        let mut threads = Vec::new();
        for t in 0..8u32 {
            let db = Arc::clone(&db);
            threads.push(thread::spawn(move || {
                for i in 0..100u32 {
                    let key = format!("t{t}-{i:04}");
                    db.put(key.as_bytes(), key.as_bytes()).expect("put failed");
                }
            }));
        }
        for thread in threads {
            thread.join().expect("writer panicked");
        }

        for t in 0..8u32 {
            for i in 0..100u32 {
                let key = format!("t{t}-{i:04}");
                assert_eq!(
                    db.get(key.as_bytes()).expect("get failed"),
                    Some(key.clone().into_bytes()),
                    "lost write {key}"
                );
            }
        }
        // 800 writes consumed exactly 800 sequence numbers.
        assert_eq!(db.inner.seq.load(Ordering::SeqCst), 800);
    }

    #[test]
    fn test_closed_operations_fail() {
        let dir = TempDir::new().expect("tempdir failed");
        let db = DB::open(Options::new(dir.path())).expect("open failed");
        db.put(b"k", b"v").expect("put failed");
        db.close().expect("close failed");

        assert!(matches!(db.get(b"k"), Err(Error::Closed)));
        assert!(matches!(db.put(b"k", b"v2"), Err(Error::Closed)));
        // Close twice is fine.
        db.close().expect("second close failed");
    }

    #[test]
    fn test_read_only_open() {
        let dir = TempDir::new().expect("tempdir failed");
        {
            let db = DB::open(Options::new(dir.path())).expect("open failed");
            db.put(b"k", b"v").expect("put failed");
            db.close().expect("close failed");
        }

        let db = DB::open(Options::new(dir.path()).read_only(true)).expect("ro open failed");
        assert_eq!(db.get(b"k").expect("get failed"), Some(b"v".to_vec()));
        assert!(matches!(
            db.put(b"x", b"y"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_overwrite_returns_latest() {
        let dir = TempDir::new().expect("tempdir failed");
        let db = DB::open(small_opts(&dir)).expect("open failed");
        for round in 0..5u32 {
            for i in 0..50u32 {
                let key = format!("k{i:03}");
                let value = format!("round-{round}");
                db.put(key.as_bytes(), value.as_bytes()).expect("put failed");
            }
        }
        for i in 0..50u32 {
            let key = format!("k{i:03}");
            assert_eq!(
                db.get(key.as_bytes()).expect("get failed"),
                Some(b"round-4".to_vec())
            );
        }
    }
}
