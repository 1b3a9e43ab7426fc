//! Session: the durable state machine behind the version history.
//!
//! The session owns the manifest — a journal whose chunks are encoded
//! [`SessionRecord`]s — and the `CURRENT` pointer naming the active
//! manifest. Every structural change (flush, compaction, journal rotation)
//! becomes a record; committing a record folds it into the current version,
//! appends it to the manifest, fsyncs, and publishes the new version. When
//! the manifest grows past its rewrite threshold the session writes a
//! fresh one holding a single snapshot record and swings `CURRENT` over.
//!
//! Commits are serialized by the session's state mutex; readers take the
//! current version out from under it and keep only the `Arc`.

pub mod record;

pub use record::SessionRecord;

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam_channel::Sender;

use crate::comparer::InternalComparer;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::iter::DbIterator;
use crate::journal;
use crate::keys;
use crate::memtable::Memtable;
use crate::storage::{FileDesc, FileKind, Storage};
use crate::table_cache::{TableCache, TableFileBuilder};
use crate::version::{RefEvent, Version, VersionStaging};

/// Appended-record volume that triggers a manifest rewrite.
const MANIFEST_REWRITE_BYTES: u64 = 1 << 20;

struct ManifestWriter {
    fd: FileDesc,
    file: File,
    writer: journal::Writer<BufWriter<File>>,
    bytes: u64,
}

struct SessionState {
    current: Option<Arc<Version>>,
    next_version_id: u64,
    journal_num: u64,
    sequence_num: u64,
    compact_ptrs: Vec<Option<Vec<u8>>>,
    manifest: Option<ManifestWriter>,
    /// Manifest recovered from disk, removed once a fresh one exists.
    prev_manifest: Option<FileDesc>,
}

pub struct Session {
    storage: Arc<Storage>,
    opts: Options,
    icmp: InternalComparer,
    table_cache: TableCache,
    ref_tx: Sender<RefEvent>,
    next_file_num: AtomicU64,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(
        storage: Arc<Storage>,
        opts: Options,
        icmp: InternalComparer,
        table_cache: TableCache,
        ref_tx: Sender<RefEvent>,
    ) -> Self {
        let session = Self {
            storage,
            opts,
            icmp,
            table_cache,
            ref_tx,
            next_file_num: AtomicU64::new(1),
            state: Mutex::new(SessionState {
                current: None,
                next_version_id: 0,
                journal_num: 0,
                sequence_num: 0,
                compact_ptrs: Vec::new(),
                manifest: None,
                prev_manifest: None,
            }),
        };
        // Seed an empty current version so reads and staging always have a
        // base.
        let mut state = session.state.lock().expect("session lock poisoned");
        let empty = Version::empty();
        session.install(&mut state, empty, None);
        drop(state);
        session
    }

    pub fn icmp(&self) -> &InternalComparer {
        &self.icmp
    }

    pub fn table_cache(&self) -> &TableCache {
        &self.table_cache
    }

    pub fn alloc_file_num(&self) -> u64 {
        self.next_file_num.fetch_add(1, Ordering::SeqCst)
    }

    /// Raises the allocator above an externally observed file number.
    pub fn mark_file_num(&self, num: u64) {
        self.next_file_num.fetch_max(num + 1, Ordering::SeqCst);
    }

    pub fn current_version(&self) -> Arc<Version> {
        self.state
            .lock()
            .expect("session lock poisoned")
            .current
            .clone()
            .expect("session has no current version")
    }

    pub fn journal_num(&self) -> u64 {
        self.state.lock().expect("session lock poisoned").journal_num
    }

    pub fn sequence_num(&self) -> u64 {
        self.state.lock().expect("session lock poisoned").sequence_num
    }

    pub fn compact_ptr(&self, level: usize) -> Option<Vec<u8>> {
        let state = self.state.lock().expect("session lock poisoned");
        state.compact_ptrs.get(level).cloned().flatten()
    }

    /// Number of files in a level of the current version.
    pub fn table_len(&self, level: usize) -> usize {
        self.current_version().level_len(level)
    }

    /// Publishes `version` as current: assigns its id, wires its release
    /// channel, announces it to the ref tracker, and reports the delta the
    /// superseded version saw.
    fn install(&self, state: &mut SessionState, mut version: Version, rec: Option<&SessionRecord>) {
        version.id = state.next_version_id;
        state.next_version_id += 1;
        version.ref_tx = Some(self.ref_tx.clone());

        let version = Arc::new(version);
        let _ = self.ref_tx.send(RefEvent::Ref {
            vid: version.id,
            files: version.file_nums(),
            created: Instant::now(),
        });
        if let (Some(old), Some(rec)) = (&state.current, rec) {
            // A trivial move adds and deletes the same file number (level
            // change only); its liveness is unchanged, so the pair cancels
            // out of the delta.
            let added_set: std::collections::HashSet<u64> =
                rec.added_tables.iter().map(|t| t.num).collect();
            let deleted_set: std::collections::HashSet<u64> =
                rec.deleted_tables.iter().map(|t| t.num).collect();
            let _ = self.ref_tx.send(RefEvent::Delta {
                vid: old.id,
                added: added_set.difference(&deleted_set).copied().collect(),
                deleted: deleted_set.difference(&added_set).copied().collect(),
            });
        }
        state.current = Some(version);
    }

    /// Drops the current version reference. Close path only.
    pub fn release_current(&self) {
        self.state.lock().expect("session lock poisoned").current = None;
    }

    /// Remembers the scalar fields of a committed record.
    fn absorb(state: &mut SessionState, rec: &SessionRecord) {
        if let Some(num) = rec.journal_num {
            state.journal_num = num;
        }
        if let Some(seq) = rec.sequence_num {
            state.sequence_num = seq;
        }
        for ptr in &rec.compact_ptrs {
            let level = ptr.level as usize;
            if state.compact_ptrs.len() <= level {
                state.compact_ptrs.resize(level + 1, None);
            }
            state.compact_ptrs[level] = Some(ptr.ikey.clone());
        }
    }

    /// Creates the manifest for a brand-new store: a snapshot record and a
    /// CURRENT pointer.
    pub fn create(&self) -> Result<()> {
        let mut state = self.state.lock().expect("session lock poisoned");
        let mut rec = SessionRecord::new();
        self.new_manifest(&mut state, &mut rec)
    }

    /// Rebuilds the session from the manifest named by CURRENT.
    pub fn recover(&self) -> Result<()> {
        let manifest_fd = self.storage.current()?;
        let file = self.storage.open_file(manifest_fd)?;
        let mut reader = journal::Reader::new(BufReader::new(file));

        let mut state = self.state.lock().expect("session lock poisoned");
        let base = Version::empty();
        let mut staging = VersionStaging::new(&base, self.icmp.clone());

        let mut comparer: Option<Vec<u8>> = None;
        let mut journal_num: Option<u64> = None;
        let mut next_file_num: Option<u64> = None;
        let mut sequence_num: Option<u64> = None;
        let mut compact_ptrs: Vec<record::CompactPtr> = Vec::new();

        while let Some(chunk) = reader.next_chunk()? {
            let rec = SessionRecord::decode(&chunk)?;
            staging.apply(&rec);
            if rec.comparer.is_some() {
                comparer = rec.comparer.clone();
            }
            if rec.journal_num.is_some() {
                journal_num = rec.journal_num;
            }
            if rec.next_file_num.is_some() {
                next_file_num = rec.next_file_num;
            }
            if rec.sequence_num.is_some() {
                sequence_num = rec.sequence_num;
            }
            compact_ptrs.extend(rec.compact_ptrs.iter().cloned());
        }

        let comparer = comparer.ok_or_else(|| {
            Error::Corruption("manifest lacks a comparer record".to_string())
        })?;
        let journal_num = journal_num.ok_or_else(|| {
            Error::Corruption("manifest lacks a journal number".to_string())
        })?;
        let next_file_num = next_file_num.ok_or_else(|| {
            Error::Corruption("manifest lacks a next file number".to_string())
        })?;
        let sequence_num = sequence_num.ok_or_else(|| {
            Error::Corruption("manifest lacks a sequence number".to_string())
        })?;

        if comparer != self.opts.comparer.name().as_bytes() {
            return Err(Error::InvalidArgument(format!(
                "comparer mismatch: store uses {:?}, options use {:?}",
                String::from_utf8_lossy(&comparer),
                self.opts.comparer.name()
            )));
        }

        let version = staging.finish();
        self.install(&mut state, version, None);
        state.journal_num = journal_num;
        state.sequence_num = sequence_num;
        for ptr in compact_ptrs {
            let level = ptr.level as usize;
            if state.compact_ptrs.len() <= level {
                state.compact_ptrs.resize(level + 1, None);
            }
            state.compact_ptrs[level] = Some(ptr.ikey);
        }
        self.mark_file_num(next_file_num.max(manifest_fd.num));

        // The recovered manifest stays read-only; the first commit after
        // recovery starts a fresh one (and removes this one) so the journal
        // block geometry never has to be resumed mid-file.
        state.manifest = None;
        state.prev_manifest = Some(manifest_fd);

        tracing::info!(
            manifest = manifest_fd.num,
            journal = journal_num,
            sequence = sequence_num,
            "session recovered"
        );
        Ok(())
    }

    /// Applies a record: folds it into a new version, makes it durable in
    /// the manifest, then publishes the version.
    pub fn commit(&self, rec: &mut SessionRecord) -> Result<()> {
        let mut state = self.state.lock().expect("session lock poisoned");

        let base = state.current.clone().expect("session has no current version");
        let mut staging = VersionStaging::new(&base, self.icmp.clone());
        staging.apply(rec);
        let version = staging.finish();

        rec.set_next_file_num(self.next_file_num.load(Ordering::SeqCst));

        let rewrite = match &state.manifest {
            None => true,
            Some(manifest) => manifest.bytes >= MANIFEST_REWRITE_BYTES,
        };
        if rewrite {
            // Write a snapshot of the post-commit state into a fresh
            // manifest; the version being installed carries the file set.
            let mut snapshot = rec.clone();
            for (level, files) in version.levels.iter().enumerate() {
                for f in files {
                    let already = snapshot
                        .added_tables
                        .iter()
                        .any(|t| t.num == f.num && t.level == level as u32);
                    if !already {
                        snapshot.add_table(
                            level as u32,
                            f.num,
                            f.size,
                            f.min_ikey.clone(),
                            f.max_ikey.clone(),
                        );
                    }
                }
            }
            // Deletions are meaningless in a snapshot; persisted compaction
            // cursors are not.
            snapshot.deleted_tables.clear();
            for (level, ptr) in state.compact_ptrs.iter().enumerate() {
                let seen = snapshot.compact_ptrs.iter().any(|p| p.level as usize == level);
                if let (Some(ikey), false) = (ptr, seen) {
                    snapshot.set_compact_ptr(level as u32, ikey.clone());
                }
            }
            self.new_manifest_with(&mut state, &mut snapshot)?;
        } else {
            let manifest = state.manifest.as_mut().expect("manifest writer missing");
            let payload = rec.encode();
            manifest.writer.write_chunk(&payload)?;
            manifest.writer.flush()?;
            manifest.file.sync_all()?;
            manifest.bytes += payload.len() as u64;
        }

        Self::absorb(&mut state, rec);
        self.install(&mut state, version, Some(rec));
        Ok(())
    }

    /// Starts a brand-new manifest seeded with `rec` (create path).
    fn new_manifest(&self, state: &mut SessionState, rec: &mut SessionRecord) -> Result<()> {
        self.new_manifest_with(state, rec)?;
        Self::absorb(state, rec);
        Ok(())
    }

    /// Writes `rec`, filled out to a full snapshot, as the first record of
    /// a new manifest, points CURRENT at it and removes the old manifest.
    fn new_manifest_with(&self, state: &mut SessionState, rec: &mut SessionRecord) -> Result<()> {
        if rec.comparer.is_none() {
            rec.set_comparer(self.opts.comparer.name());
        }
        if rec.journal_num.is_none() {
            rec.set_journal_num(state.journal_num);
        }
        if rec.sequence_num.is_none() {
            rec.set_sequence_num(state.sequence_num);
        }

        let fd = FileDesc::new(FileKind::Manifest, self.alloc_file_num());
        rec.set_next_file_num(self.next_file_num.load(Ordering::SeqCst));

        let file = self.storage.create(fd)?;
        let mut writer = journal::Writer::new(BufWriter::new(file.try_clone()?));
        let payload = rec.encode();
        writer.write_chunk(&payload)?;
        writer.flush()?;
        file.sync_all()?;

        self.storage.set_current(fd.num)?;

        let old = state.manifest.replace(ManifestWriter {
            fd,
            writer,
            file,
            bytes: payload.len() as u64,
        });
        if let Some(old) = old {
            let _ = self.storage.remove(old.fd);
        }
        if let Some(prev) = state.prev_manifest.take() {
            let _ = self.storage.remove(prev);
        }
        tracing::info!(manifest = fd.num, "manifest rewritten");
        Ok(())
    }

    /// Drains a memtable into level-0 table files, recording each in `rec`.
    /// Output files roll over at the target size, always at a user-key
    /// boundary so one key's versions stay together.
    pub fn flush_memtable(&self, rec: &mut SessionRecord, mem: &Arc<Memtable>) -> Result<()> {
        let mut iter = Arc::clone(mem).iter();
        let mut builder: Option<TableFileBuilder> = None;
        let mut last_ukey: Option<Vec<u8>> = None;

        let mut more = iter.first()?;
        let result: Result<()> = (|| {
            while more {
                let ikey = iter.key().to_vec();
                let ukey = keys::ukey(&ikey).to_vec();

                let boundary = last_ukey.as_deref() != Some(ukey.as_slice());
                if boundary {
                    let roll = builder
                        .as_ref()
                        .is_some_and(|b| b.bytes_estimate() >= self.opts.target_file_size);
                    if roll {
                        let meta = builder.take().expect("builder present").finish()?;
                        tracing::debug!(table = meta.num, size = meta.size, "flushed L0 table");
                        rec.add_table(0, meta.num, meta.size, meta.min_ikey.clone(), meta.max_ikey.clone());
                    }
                    last_ukey = Some(ukey);
                }

                if builder.is_none() {
                    builder = Some(TableFileBuilder::new(
                        Arc::clone(&self.storage),
                        self.alloc_file_num(),
                        &self.opts,
                    )?);
                }
                builder
                    .as_mut()
                    .expect("builder present")
                    .append(&ikey, iter.value())?;
                more = iter.next()?;
            }
            if let Some(b) = builder.take() {
                if !b.is_empty() {
                    let meta = b.finish()?;
                    tracing::debug!(table = meta.num, size = meta.size, "flushed L0 table");
                    rec.add_table(0, meta.num, meta.size, meta.min_ikey.clone(), meta.max_ikey.clone());
                } else {
                    b.abandon();
                }
            }
            Ok(())
        })();

        if let Err(err) = result {
            if let Some(b) = builder.take() {
                b.abandon();
            }
            // Finished outputs recorded so far are removed by the caller,
            // which owns the record.
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparer::BytewiseComparer;
    use crate::keys::{make_ikey, KeyKind};
    use crate::tmpfs::TempDir;
    use crate::version::RefTracker;

    fn open_session(dir: &TempDir) -> (Session, RefTracker) {
        let opts = Options::new(dir.path());
        let storage = Arc::new(Storage::open(dir.path(), false).expect("storage open failed"));
        let icmp = InternalComparer::new(Arc::new(BytewiseComparer));
        let table_cache = TableCache::new(Arc::clone(&storage), icmp.clone(), &opts);
        let tracker = RefTracker::start(Box::new(|_| {}));
        let session = Session::new(storage, opts, icmp, table_cache, tracker.sender());
        (session, tracker)
    }

    fn added(level: u32, num: u64) -> (u32, u64, u64, Vec<u8>, Vec<u8>) {
        (
            level,
            num,
            1000,
            make_ikey(b"a", 1, KeyKind::Value),
            make_ikey(b"z", 1, KeyKind::Value),
        )
    }

    #[test]
    fn test_create_then_recover() {
        let dir = TempDir::new().expect("tempdir failed");
        {
            let (session, tracker) = open_session(&dir);
            session.create().expect("create failed");

            let mut rec = SessionRecord::new();
            let (level, num, size, min, max) = added(0, session.alloc_file_num());
            rec.add_table(level, num, size, min, max);
            rec.set_journal_num(9);
            rec.set_sequence_num(55);
            session.commit(&mut rec).expect("commit failed");

            session.release_current();
            tracker.stop();
        }

        let (session, tracker) = open_session(&dir);
        session.recover().expect("recover failed");
        assert_eq!(session.journal_num(), 9);
        assert_eq!(session.sequence_num(), 55);
        assert_eq!(session.table_len(0), 1);
        session.release_current();
        tracker.stop();
    }

    #[test]
    fn test_recover_fresh_dir_is_not_found() {
        let dir = TempDir::new().expect("tempdir failed");
        let (session, tracker) = open_session(&dir);
        assert!(matches!(session.recover(), Err(Error::NotFound)));
        session.release_current();
        tracker.stop();
    }

    #[test]
    fn test_comparer_mismatch_rejected() {
        use crate::comparer::Comparer;

        struct ReversedComparer;
        impl Comparer for ReversedComparer {
            fn name(&self) -> &str {
                "test.ReversedComparer"
            }
            fn compare(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
                b.cmp(a)
            }
            fn separator(&self, a: &[u8], _b: &[u8]) -> Vec<u8> {
                a.to_vec()
            }
            fn successor(&self, a: &[u8]) -> Vec<u8> {
                a.to_vec()
            }
        }

        let dir = TempDir::new().expect("tempdir failed");
        {
            let (session, tracker) = open_session(&dir);
            session.create().expect("create failed");
            session.release_current();
            tracker.stop();
        }

        let opts = Options::new(dir.path()).comparer(Arc::new(ReversedComparer));
        let storage = Arc::new(Storage::open(dir.path(), false).expect("storage open failed"));
        let icmp = InternalComparer::new(opts.comparer.clone());
        let table_cache = TableCache::new(Arc::clone(&storage), icmp.clone(), &opts);
        let tracker = RefTracker::start(Box::new(|_| {}));
        let session = Session::new(storage, opts, icmp, table_cache, tracker.sender());
        assert!(matches!(
            session.recover(),
            Err(Error::InvalidArgument(_))
        ));
        session.release_current();
        tracker.stop();
    }

    #[test]
    fn test_commit_folds_into_versions() {
        let dir = TempDir::new().expect("tempdir failed");
        let (session, tracker) = open_session(&dir);
        session.create().expect("create failed");

        let mut rec = SessionRecord::new();
        let (level, num, size, min, max) = added(0, session.alloc_file_num());
        rec.add_table(level, num, size, min, max);
        session.commit(&mut rec).expect("commit failed");
        assert_eq!(session.table_len(0), 1);

        // Move the file to level 1.
        let mut rec = SessionRecord::new();
        rec.delete_table(0, num);
        rec.add_table(
            1,
            num,
            1000,
            make_ikey(b"a", 1, KeyKind::Value),
            make_ikey(b"z", 1, KeyKind::Value),
        );
        session.commit(&mut rec).expect("commit failed");
        assert_eq!(session.table_len(0), 0);
        assert_eq!(session.table_len(1), 1);

        session.release_current();
        tracker.stop();
    }

    #[test]
    fn test_compact_ptr_round_trips() {
        let dir = TempDir::new().expect("tempdir failed");
        {
            let (session, tracker) = open_session(&dir);
            session.create().expect("create failed");
            let mut rec = SessionRecord::new();
            rec.set_compact_ptr(2, make_ikey(b"cursor", 1, KeyKind::Value));
            session.commit(&mut rec).expect("commit failed");
            assert!(session.compact_ptr(2).is_some());
            session.release_current();
            tracker.stop();
        }
        let (session, tracker) = open_session(&dir);
        session.recover().expect("recover failed");
        assert_eq!(
            session.compact_ptr(2),
            Some(make_ikey(b"cursor", 1, KeyKind::Value))
        );
        session.release_current();
        tracker.stop();
    }
}
