//! Journal replay on open.
//!
//! Every journal numbered at or above the manifest's journal number may
//! hold batches that never reached a table file. Replay walks them in
//! order, rebuilding a memtable and flushing it to level 0 whenever it
//! fills; after each fully consumed journal the progress is committed and
//! the journal removed, so a crash during recovery never replays twice.

use std::io::{BufReader, BufWriter};
use std::sync::Arc;

use super::{JournalFile, MemState};
use crate::batch;
use crate::comparer::InternalComparer;
use crate::config::Options;
use crate::error::Result;
use crate::journal;
use crate::memtable::Memtable;
use crate::session::{Session, SessionRecord};
use crate::storage::{FileDesc, FileKind, Storage};

/// Replays journals, then stands up a fresh journal and memtable and
/// commits the new journal number. Returns the memtable state and the last
/// assigned sequence.
pub(crate) fn replay_journals(
    storage: &Arc<Storage>,
    session: &Session,
    opts: &Options,
    icmp: &InternalComparer,
) -> Result<(MemState, u64)> {
    let journal_num = session.journal_num();
    let mut fds: Vec<FileDesc> = storage
        .list(FileKind::Journal)?
        .into_iter()
        .filter(|fd| fd.num >= journal_num)
        .collect();
    fds.sort_by_key(|fd| fd.num);

    let mut seq = session.sequence_num();
    let mut mem = Arc::new(Memtable::unbounded(icmp.clone()));
    let mut rec = SessionRecord::new();
    let mut prev: Option<FileDesc> = None;

    if let Some(last) = fds.last() {
        session.mark_file_num(last.num);
    }

    for fd in fds {
        // The previous journal is fully replayed: persist what it held and
        // drop it before touching the next one.
        if let Some(old) = prev.take() {
            if !mem.is_empty() {
                session.flush_memtable(&mut rec, &mem)?;
                mem = Arc::new(Memtable::unbounded(icmp.clone()));
            }
            rec.set_journal_num(fd.num);
            rec.set_sequence_num(seq);
            session.commit(&mut rec)?;
            rec = SessionRecord::new();
            let _ = storage.remove(old);
        }

        tracing::info!(journal = fd.num, "replaying journal");
        let file = storage.open_file(fd)?;
        let mut reader = journal::Reader::new(BufReader::new(file));
        while let Some(chunk) = reader.next_chunk()? {
            let (batch_seq, count) = batch::decode_into(&chunk, &mem)?;
            if count > 0 {
                seq = batch_seq + u64::from(count) - 1;
            }
            if mem.approximate_size() >= opts.write_buffer {
                session.flush_memtable(&mut rec, &mem)?;
                mem = Arc::new(Memtable::unbounded(icmp.clone()));
            }
        }
        prev = Some(fd);
    }

    if !mem.is_empty() {
        session.flush_memtable(&mut rec, &mem)?;
    }

    // Fresh journal and memtable for the write path.
    let fd = FileDesc::new(FileKind::Journal, session.alloc_file_num());
    let file = storage.create(fd)?;
    let writer = journal::Writer::new(BufWriter::new(file.try_clone()?));

    rec.set_journal_num(fd.num);
    rec.set_sequence_num(seq);
    session.commit(&mut rec)?;

    if let Some(old) = prev.take() {
        let _ = storage.remove(old);
    }

    let state = MemState {
        active: Arc::new(Memtable::new(icmp.clone(), opts.write_buffer)),
        journal: Some(JournalFile { fd, file, writer }),
        frozen: None,
        frozen_journal_fd: None,
        frozen_seq: seq,
    };
    Ok((state, seq))
}

/// Read-only replay: journals are folded into one resident memtable and
/// nothing on disk changes.
pub(crate) fn replay_read_only(
    storage: &Arc<Storage>,
    session: &Session,
    _opts: &Options,
    icmp: &InternalComparer,
) -> Result<(MemState, u64)> {
    let journal_num = session.journal_num();
    let mut fds: Vec<FileDesc> = storage
        .list(FileKind::Journal)?
        .into_iter()
        .filter(|fd| fd.num >= journal_num)
        .collect();
    fds.sort_by_key(|fd| fd.num);

    let mut seq = session.sequence_num();
    let mem = Arc::new(Memtable::unbounded(icmp.clone()));
    for fd in fds {
        let file = storage.open_file(fd)?;
        let mut reader = journal::Reader::new(BufReader::new(file));
        while let Some(chunk) = reader.next_chunk()? {
            let (batch_seq, count) = batch::decode_into(&chunk, &mem)?;
            if count > 0 {
                seq = batch_seq + u64::from(count) - 1;
            }
        }
    }

    let state = MemState {
        active: mem,
        journal: None,
        frozen: None,
        frozen_journal_fd: None,
        frozen_seq: seq,
    };
    Ok((state, seq))
}
