//! The write pipeline.
//!
//! One logical write slot exists, guarded by a token channel of capacity
//! one. A writer races two sends: handing its record to the current leader
//! on the merge channel, or taking the token and becoming the leader
//! itself. The leader absorbs waiting followers into its batch — up to
//! 128 KiB, or 1 MiB once its own batch is already large — assigns a
//! contiguous sequence range, appends the merged batch to the journal,
//! inserts into the memtable, and acknowledges every follower with the
//! shared outcome. A follower that would overflow the budget is told to
//! lead the next round instead; the token passes to it implicitly.
//!
//! Ordering: followers are appended in channel-arrival order, so their
//! sequences are contiguous and arrival-ordered within the merged batch.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Sender};

use super::{CompCmd, DbInner, JournalFile, MergeReq};
use crate::batch::Batch;
use crate::error::{Error, Result};
use crate::keys::KeyKind;
use crate::memtable::Memtable;
use crate::storage::{FileDesc, FileKind};

/// Follower-merge budget while the leader's own batch is small.
const MERGE_BUDGET_SMALL: usize = 128 << 10;

/// Budget once the leader's batch exceeds the small budget.
const MERGE_BUDGET_LARGE: usize = 1 << 20;

impl DbInner {
    /// Single put/delete entry point: merge into the current leader's
    /// batch or become the leader.
    pub(crate) fn apply(&self, kind: KeyKind, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        let req = MergeReq {
            kind,
            key: key.to_vec(),
            value: value.to_vec(),
        };
        select! {
            send(self.write.merge_tx, req) -> res => {
                if res.is_err() {
                    return Err(Error::Closed);
                }
                match self.write.merged_rx.recv() {
                    // Absorbed: wait for the leader's verdict.
                    Ok(true) => match self.write.ack_rx.recv() {
                        Ok(result) => result,
                        Err(_) => Err(Error::Closed),
                    },
                    // Overflowed the leader's budget: lead the next round.
                    Ok(false) => {
                        let mut batch = Batch::new();
                        append(&mut batch, kind, key, value);
                        self.write_locked(batch)
                    }
                    Err(_) => Err(Error::Closed),
                }
            }
            send(self.write.token_tx, ()) -> res => {
                if res.is_err() {
                    return Err(Error::Closed);
                }
                let mut batch = Batch::new();
                append(&mut batch, kind, key, value);
                self.write_locked(batch)
            }
            recv(self.close_rx) -> _ => Err(Error::Closed),
        }
    }

    /// Batch entry point. Batches take the token directly.
    pub(crate) fn write_batch(&self, batch: Batch) -> Result<()> {
        self.check_writable()?;
        if batch.is_empty() {
            return Ok(());
        }
        select! {
            send(self.write.token_tx, ()) -> res => {
                if res.is_err() {
                    return Err(Error::Closed);
                }
                self.write_locked(batch)
            }
            recv(self.close_rx) -> _ => Err(Error::Closed),
        }
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.opts.read_only {
            return Err(Error::InvalidArgument(
                "write against a read-only store".to_string(),
            ));
        }
        Ok(())
    }

    /// Runs as the write leader. Entered holding the token — either by
    /// taking it or by inheriting it from a leader whose budget overflowed.
    fn write_locked(&self, mut batch: Batch) -> Result<()> {
        let mut merge_limit = if batch.byte_size() > MERGE_BUDGET_SMALL {
            MERGE_BUDGET_LARGE as i64 - batch.byte_size() as i64
        } else {
            MERGE_BUDGET_SMALL as i64 - batch.byte_size() as i64
        };
        let mut merged = 0usize;
        let mut overflow = false;

        while merge_limit > 0 {
            match self.write.merge_rx.try_recv() {
                Ok(req) => {
                    let entry_len = (req.key.len() + req.value.len() + 8) as i64;
                    merge_limit -= entry_len;
                    if merge_limit < 0 {
                        // The sender keeps its own copy and takes over as
                        // the next leader.
                        overflow = true;
                        break;
                    }
                    append(&mut batch, req.kind, &req.key, &req.value);
                    let _ = self.write.merged_tx.send(true);
                    merged += 1;
                }
                Err(_) => break,
            }
        }

        let result = self.with_batch(&mut batch);

        for _ in 0..merged {
            let _ = self.write.ack_tx.send(result.clone());
        }
        if overflow {
            let _ = self.write.merged_tx.send(false);
        } else {
            let _ = self.write.token_rx.try_recv();
        }
        result
    }

    /// Journals and applies one (possibly merged) batch.
    fn with_batch(&self, batch: &mut Batch) -> Result<()> {
        let n = batch.byte_size();
        let mdb_free = self.make_room_for_write(n)?;

        let seq = self.seq.load(Ordering::SeqCst) + 1;
        {
            let mut mem = self.mem.lock()?;
            let journal = mem
                .journal
                .as_mut()
                .ok_or_else(|| Error::Invariant("write path without a journal".to_string()))?;
            journal.writer.write_chunk(&batch.encode(seq))?;
            journal.writer.flush()?;

            // The journal holds the batch; a memtable failure past this
            // point would desynchronize the two.
            batch
                .insert_into(&mem.active, seq)
                .map_err(|err| Error::Invariant(format!("memtable insert after journal append: {err}")))?;
        }
        self.seq.fetch_add(batch.len() as u64, Ordering::SeqCst);

        if n >= mdb_free {
            self.rotate_mem()?;
        }
        Ok(())
    }

    /// Ensures the active memtable can hold `n` more bytes, applying the
    /// level-0 write throttle on the way.
    pub(crate) fn make_room_for_write(&self, n: usize) -> Result<usize> {
        let mut delayed = false;
        loop {
            self.check_open()?;
            let l0 = self.session.table_len(0);

            if l0 >= self.opts.slowdown_trigger && !delayed {
                // One 1ms pause per write while level 0 is backed up.
                delayed = true;
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }

            let (free, empty) = {
                let mem = self.mem.lock()?;
                (mem.active.free(), mem.active.is_empty())
            };
            if free >= n {
                return Ok(free);
            }
            if l0 >= self.opts.pause_trigger {
                self.comp_trigger_wait(&self.tcomp_tx)?;
                continue;
            }
            if empty {
                // A batch larger than the whole buffer: admit it into the
                // empty memtable; the caller rotates right after.
                return Ok(n);
            }
            self.rotate_mem()?;
        }
    }

    /// Seals the active memtable into the frozen slot with a fresh journal
    /// and memtable in front, and wakes the minor-compaction worker.
    pub(crate) fn rotate_mem(&self) -> Result<()> {
        // The frozen slot must be empty; wait out any in-flight flush.
        self.comp_trigger_wait(&self.mcomp_tx)?;
        {
            let mut mem = self.mem.lock()?;
            if mem.frozen.is_some() {
                return Err(Error::Invariant(
                    "frozen memtable survived its flush".to_string(),
                ));
            }

            let fd = FileDesc::new(FileKind::Journal, self.session.alloc_file_num());
            let file = self.storage.create(fd)?;
            let writer = crate::journal::Writer::new(std::io::BufWriter::new(file.try_clone()?));

            if let Some(old) = mem.journal.as_mut() {
                old.writer.flush()?;
                old.file.sync_all()?;
            }
            let old_fd = mem.journal.as_ref().map(|j| j.fd);

            let fresh = Arc::new(Memtable::new(self.icmp.clone(), self.opts.write_buffer));
            mem.frozen = Some(std::mem::replace(&mut mem.active, fresh));
            mem.frozen_journal_fd = old_fd;
            mem.frozen_seq = self.seq.load(Ordering::SeqCst);
            mem.journal = Some(JournalFile { fd, file, writer });

            tracing::debug!(journal = fd.num, "memtable rotated");
        }
        self.comp_trigger(&self.mcomp_tx)
    }

    /// Asks a worker to run and waits for the result.
    pub(crate) fn comp_trigger_wait(&self, tx: &Sender<CompCmd>) -> Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        select! {
            send(tx, CompCmd::Auto(Some(ack_tx))) -> res => {
                if res.is_err() {
                    return Err(Error::Closed);
                }
            }
            recv(self.close_rx) -> _ => return Err(Error::Closed),
        }
        select! {
            recv(ack_rx) -> res => match res {
                Ok(result) => result,
                Err(_) => Err(Error::Closed),
            },
            recv(self.close_rx) -> _ => Err(Error::Closed),
        }
    }

    /// Fire-and-forget worker wakeup.
    pub(crate) fn comp_trigger(&self, tx: &Sender<CompCmd>) -> Result<()> {
        select! {
            send(tx, CompCmd::Auto(None)) -> res => {
                res.map_err(|_| Error::Closed)
            }
            recv(self.close_rx) -> _ => Err(Error::Closed),
        }
    }
}

fn append(batch: &mut Batch, kind: KeyKind, key: &[u8], value: &[u8]) {
    match kind {
        KeyKind::Value => batch.put(key, value),
        KeyKind::Deletion => batch.delete(key),
    }
}
