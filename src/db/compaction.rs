//! Background compaction.
//!
//! Two workers, each on its own command channel:
//!
//! - The minor worker drains the frozen memtable into level-0 tables and
//!   commits the session record that makes them durable. While it runs,
//!   the table worker is paused by a rendezvous: the minor worker sends a
//!   resume channel over the pause channel, the table worker holds it, and
//!   resumes once the minor worker drops its end.
//! - The table worker picks and runs level compactions whenever the
//!   current version's score says one is due.
//!
//! Workers post acknowledgements through their commands so callers can
//! choose fire-and-forget or wait-for-completion.

use std::sync::Arc;

use crossbeam_channel::{select, Receiver};

use super::{CompCmd, DbInner};
use crate::error::{Error, Result};
use crate::iter::{DbIterator, MergingIterator};
use crate::keys::{self, parse_ikey, KeyKind};
use crate::memtable::Memtable;
use crate::session::SessionRecord;
use crate::storage::{FileDesc, FileKind};
use crate::table_cache::TableFileBuilder;
use crate::version::{
    files_range, overlapping_files, total_file_size, LevelFiles, TableFileMeta, Version,
};

/// One selected level compaction: the input files of the source level and
/// the level below, plus the bookkeeping that drives tombstone elision and
/// output splitting.
pub(crate) struct Compaction {
    version: Arc<Version>,
    source_level: usize,
    inputs: [LevelFiles; 2],
    imin: Vec<u8>,
    imax: Vec<u8>,
    grandparents: LevelFiles,
    gp_index: usize,
    seen_key: bool,
    gp_overlapped_bytes: u64,
    /// Per-level cursors for the is-base-level walk.
    level_ptrs: Vec<usize>,
}

impl Compaction {
    /// Selects the next compaction, or None when no level scores one.
    pub(crate) fn pick(inner: &DbInner) -> Option<Compaction> {
        let version = inner.session.current_version();
        if version.compaction_score < 1.0 {
            return None;
        }
        let level = version.compaction_level;
        let icmp = &inner.icmp;

        let seed = {
            let files = version.levels.get(level)?;
            if files.is_empty() {
                return None;
            }
            let mut seed = None;
            if level >= 1 {
                // Resume behind the last compaction's cursor; wrap when
                // nothing is past it.
                if let Some(ptr) = inner.session.compact_ptr(level) {
                    seed = files
                        .iter()
                        .find(|f| icmp.compare(&f.max_ikey, &ptr) == std::cmp::Ordering::Greater)
                        .cloned();
                }
            }
            seed.unwrap_or_else(|| files[0].clone())
        };

        let level_count = version.levels.len();
        let mut compaction = Compaction {
            version,
            source_level: level,
            inputs: [vec![seed], Vec::new()],
            imin: Vec::new(),
            imax: Vec::new(),
            grandparents: Vec::new(),
            gp_index: 0,
            seen_key: false,
            gp_overlapped_bytes: 0,
            level_ptrs: vec![0; level_count],
        };
        compaction.expand(inner);
        Some(compaction)
    }

    /// Grows the input sets: close level-0 seeds over their mutual
    /// overlaps, pull in the overlapped files of the level below, then try
    /// to widen the source set as long as the lower set stays fixed and
    /// the byte budget holds. Grandparent files are recorded for the
    /// output-splitting heuristic.
    fn expand(&mut self, inner: &DbInner) {
        let icmp = &inner.icmp;
        let source = self.source_level;
        let empty: LevelFiles = Vec::new();
        let vt0 = self.version.levels.get(source).unwrap_or(&empty).clone();
        let vt1 = self.version.levels.get(source + 1).unwrap_or(&empty).clone();

        let mut t0 = self.inputs[0].clone();
        let (mut imin, mut imax) = files_range(icmp, &t0);

        if source == 0 {
            t0 = overlapping_files(icmp, &vt0, keys::ukey(&imin), keys::ukey(&imax), true);
            let range = files_range(icmp, &t0);
            imin = range.0;
            imax = range.1;
        }

        let t1 = overlapping_files(icmp, &vt1, keys::ukey(&imin), keys::ukey(&imax), false);

        let all: LevelFiles = t0.iter().chain(t1.iter()).cloned().collect();
        let (mut amin, mut amax) = files_range(icmp, &all);

        if !t1.is_empty() {
            let exp0 = overlapping_files(icmp, &vt0, keys::ukey(&amin), keys::ukey(&amax), source == 0);
            let within_budget =
                total_file_size(&exp0) + total_file_size(&t1) <= inner.opts.compaction_limit();
            if exp0.len() > t0.len() && within_budget {
                let (xmin, xmax) = files_range(icmp, &exp0);
                let exp1 = overlapping_files(icmp, &vt1, keys::ukey(&xmin), keys::ukey(&xmax), false);
                // Only accept when the lower set is unchanged.
                if exp1.len() == t1.len() {
                    imin = xmin;
                    imax = xmax;
                    t0 = exp0;
                    let all: LevelFiles = t0.iter().chain(t1.iter()).cloned().collect();
                    let range = files_range(icmp, &all);
                    amin = range.0;
                    amax = range.1;
                }
            }
        }

        if let Some(gp_files) = self.version.levels.get(source + 2) {
            self.grandparents =
                overlapping_files(icmp, gp_files, keys::ukey(&amin), keys::ukey(&amax), false);
        }

        self.imin = imin;
        self.imax = imax;
        self.inputs = [t0, t1];
    }

    /// A single source file, nothing below it, and little grandparent
    /// overlap: the file can move down a level without a rewrite.
    fn trivial(&self, trivial_gp_limit: usize) -> bool {
        self.inputs[0].len() == 1
            && self.inputs[1].is_empty()
            && self.grandparents.len() <= trivial_gp_limit
    }

    /// Accumulates grandparent overlap up to `ukey`; true when the current
    /// output should be cut before this key.
    fn should_stop_before(&mut self, icmp: &crate::comparer::InternalComparer, ukey: &[u8], max_overlap: u64) -> bool {
        while self.gp_index < self.grandparents.len() {
            let gp = &self.grandparents[self.gp_index];
            if icmp.ucompare(ukey, keys::ukey(&gp.max_ikey)) != std::cmp::Ordering::Greater {
                break;
            }
            if self.seen_key {
                self.gp_overlapped_bytes += gp.size;
            }
            self.gp_index += 1;
        }
        self.seen_key = true;
        if self.gp_overlapped_bytes > max_overlap {
            self.gp_overlapped_bytes = 0;
            true
        } else {
            false
        }
    }

    /// Resets the per-output overlap accounting after a file is cut.
    fn restore(&mut self) {
        self.seen_key = false;
        self.gp_overlapped_bytes = 0;
    }

    /// Whether `ukey` is provably absent from every level below the
    /// output level. Cursors only move forward: the compaction iterates
    /// keys in order, so files passed once never need revisiting.
    fn is_base_level_for_key(&mut self, icmp: &crate::comparer::InternalComparer, ukey: &[u8]) -> bool {
        for level in self.source_level + 2..self.version.levels.len() {
            let files = &self.version.levels[level];
            let ptr = &mut self.level_ptrs[level];
            while *ptr < files.len() {
                let f = &files[*ptr];
                if icmp.ucompare(ukey, keys::ukey(&f.max_ikey)) != std::cmp::Ordering::Greater {
                    if icmp.ucompare(ukey, keys::ukey(&f.min_ikey)) != std::cmp::Ordering::Less {
                        return false;
                    }
                    break;
                }
                *ptr += 1;
            }
        }
        true
    }

    /// Merged iterator over every input file. Level-0 inputs iterate per
    /// file (they overlap); the lower level as one sorted run.
    fn input_iterator(&self, inner: &DbInner) -> MergingIterator {
        let mut children: Vec<Box<dyn DbIterator>> = Vec::new();
        if self.source_level == 0 {
            for meta in &self.inputs[0] {
                children.push(inner.table_cache.table_iterator(meta));
            }
        } else if !self.inputs[0].is_empty() {
            children.push(inner.table_cache.level_iterator(self.inputs[0].clone()));
        }
        if !self.inputs[1].is_empty() {
            children.push(inner.table_cache.level_iterator(self.inputs[1].clone()));
        }
        MergingIterator::new(children, inner.icmp.clone())
    }
}

impl DbInner {
    /// Flushes the frozen memtable to level 0 and commits it. The table
    /// worker is paused for the duration.
    pub(crate) fn mem_compaction(&self) -> Result<()> {
        let frozen = { self.mem.lock()?.frozen.clone() };
        let frozen = match frozen {
            Some(frozen) => frozen,
            None => return Ok(()),
        };

        if frozen.is_empty() {
            return self.drop_frozen();
        }

        // Rendezvous with the table worker: it holds the resume receiver
        // until we drop the sender.
        let (resume_tx, resume_rx) = crossbeam_channel::bounded::<()>(0);
        select! {
            send(self.pause_tx, resume_rx) -> res => {
                if res.is_err() {
                    return Err(Error::Closed);
                }
            }
            recv(self.close_rx) -> _ => return Err(Error::Closed),
        }

        let result = self.mem_compaction_paused(&frozen);
        drop(resume_tx);

        if result.is_ok() {
            // Level 0 may now be over its trigger.
            let _ = self.comp_trigger(&self.tcomp_tx);
        }
        result
    }

    fn mem_compaction_paused(&self, frozen: &Arc<Memtable>) -> Result<()> {
        let mut rec = SessionRecord::new();

        if let Err(err) = self.session.flush_memtable(&mut rec, frozen) {
            self.remove_record_outputs(&rec);
            return Err(err);
        }

        let (journal_num, frozen_seq) = {
            let mem = self.mem.lock()?;
            let journal_num = mem
                .journal
                .as_ref()
                .map(|j| j.fd.num)
                .ok_or_else(|| Error::Invariant("flush without an active journal".to_string()))?;
            (journal_num, mem.frozen_seq)
        };
        rec.set_journal_num(journal_num);
        rec.set_sequence_num(frozen_seq);

        tracing::info!(
            tables = rec.added_tables.len(),
            sequence = frozen_seq,
            "minor compaction"
        );

        if let Err(err) = self.session.commit(&mut rec) {
            self.remove_record_outputs(&rec);
            return Err(err);
        }
        self.drop_frozen()
    }

    /// Clears the frozen slot and removes its journal; the flush that
    /// covered it is durable.
    fn drop_frozen(&self) -> Result<()> {
        let old_journal = {
            let mut mem = self.mem.lock()?;
            mem.frozen = None;
            mem.frozen_journal_fd.take()
        };
        if let Some(fd) = old_journal {
            let _ = self.storage.remove(fd);
        }
        Ok(())
    }

    fn remove_record_outputs(&self, rec: &SessionRecord) {
        for table in &rec.added_tables {
            let _ = self
                .storage
                .remove(FileDesc::new(FileKind::Table, table.num));
            self.table_cache.evict(table.num);
        }
    }

    /// Runs level compactions until the version stops scoring one.
    pub(crate) fn table_auto_compaction(&self, pause_rx: &Receiver<Receiver<()>>) -> Result<()> {
        loop {
            self.honor_pause(pause_rx);
            self.check_open()?;
            let compaction = match Compaction::pick(self) {
                Some(compaction) => compaction,
                None => return Ok(()),
            };
            self.table_compaction(compaction, pause_rx)?;
        }
    }

    /// Blocks while a minor compaction holds the pause channel.
    fn honor_pause(&self, pause_rx: &Receiver<Receiver<()>>) {
        if let Ok(resume) = pause_rx.try_recv() {
            // Resumes when the minor worker drops its end.
            let _ = resume.recv();
        }
    }

    fn table_compaction(
        &self,
        mut c: Compaction,
        pause_rx: &Receiver<Receiver<()>>,
    ) -> Result<()> {
        let source = c.source_level;

        if c.trivial(self.opts.trivial_gp_limit) {
            let f = Arc::clone(&c.inputs[0][0]);
            let mut rec = SessionRecord::new();
            rec.delete_table(source as u32, f.num);
            rec.add_table(
                source as u32 + 1,
                f.num,
                f.size,
                f.min_ikey.clone(),
                f.max_ikey.clone(),
            );
            rec.set_compact_ptr(source as u32, c.imax.clone());
            tracing::info!(table = f.num, from = source, "trivial move");
            return self.session.commit(&mut rec);
        }

        let mut rec = SessionRecord::new();
        for (i, files) in c.inputs.iter().enumerate() {
            for f in files {
                rec.delete_table((source + i) as u32, f.num);
            }
        }

        let min_seq = self.min_seq();
        let icmp = self.icmp.clone();
        let mut iter = c.input_iterator(self);
        let mut builder: Option<TableFileBuilder> = None;
        let mut outputs: Vec<Arc<TableFileMeta>> = Vec::new();

        let result: Result<()> = (|| {
            let mut last_ukey: Option<Vec<u8>> = None;
            let mut last_seq = u64::MAX;

            let mut more = iter.first()?;
            while more {
                let ikey = iter.key().to_vec();
                let mut drop_entry = false;

                match parse_ikey(&ikey) {
                    Err(_) => {
                        // Keep undecodable keys; hiding them would lose
                        // data the comparer still orders correctly.
                        last_ukey = None;
                        last_seq = u64::MAX;
                    }
                    Ok((ukey, seq, kind)) => {
                        if last_ukey.as_deref() != Some(ukey) {
                            // User-key boundary: decide whether the
                            // current output file ends here.
                            let stop =
                                c.should_stop_before(&icmp, ukey, self.opts.max_gp_overlap());
                            let oversize = builder
                                .as_ref()
                                .is_some_and(|b| b.bytes_estimate() >= self.opts.target_file_size);
                            if builder.is_some() && (stop || oversize) {
                                let meta = builder.take().expect("builder present").finish()?;
                                outputs.push(meta);
                                c.restore();
                                self.honor_pause(pause_rx);
                            }
                            last_ukey = Some(ukey.to_vec());
                            last_seq = u64::MAX;
                        }

                        if last_seq <= min_seq {
                            // Shadowed by a newer entry that everyone can
                            // already see.
                            drop_entry = true;
                        } else if kind == KeyKind::Deletion
                            && seq <= min_seq
                            && c.is_base_level_for_key(&icmp, ukey)
                        {
                            // Tombstone with nothing left to delete.
                            drop_entry = true;
                        }
                        last_seq = seq;
                    }
                }

                if !drop_entry {
                    if builder.is_none() {
                        builder = Some(TableFileBuilder::new(
                            Arc::clone(&self.storage),
                            self.session.alloc_file_num(),
                            &self.opts,
                        )?);
                    }
                    builder
                        .as_mut()
                        .expect("builder present")
                        .append(&ikey, iter.value())?;
                }
                more = iter.next()?;
            }

            if let Some(b) = builder.take() {
                if !b.is_empty() {
                    outputs.push(b.finish()?);
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
            for meta in &outputs {
                let _ = self
                    .storage
                    .remove(FileDesc::new(FileKind::Table, meta.num));
                self.table_cache.evict(meta.num);
            }
            tracing::error!(level = source, error = %err, "compaction aborted");
            return Err(err);
        }

        for meta in &outputs {
            rec.add_table(
                source as u32 + 1,
                meta.num,
                meta.size,
                meta.min_ikey.clone(),
                meta.max_ikey.clone(),
            );
        }
        rec.set_compact_ptr(source as u32, c.imax.clone());

        tracing::info!(
            level = source,
            inputs = c.inputs[0].len() + c.inputs[1].len(),
            outputs = outputs.len(),
            "table compaction"
        );

        if let Err(err) = self.session.commit(&mut rec) {
            for meta in &outputs {
                let _ = self
                    .storage
                    .remove(FileDesc::new(FileKind::Table, meta.num));
                self.table_cache.evict(meta.num);
            }
            return Err(err);
        }
        Ok(())
    }
}

/// Minor-compaction worker loop.
pub(crate) fn minor_worker(inner: Arc<DbInner>, rx: Receiver<CompCmd>, close_rx: Receiver<()>) {
    loop {
        select! {
            recv(rx) -> cmd => match cmd {
                Ok(CompCmd::Auto(ack)) => {
                    let result = inner.mem_compaction();
                    if let Err(err) = &result {
                        if *err != Error::Closed {
                            tracing::error!(error = %err, "minor compaction failed");
                        }
                    }
                    if let Some(ack) = ack {
                        let _ = ack.send(result);
                    }
                }
                Err(_) => break,
            },
            recv(close_rx) -> _ => break,
        }
    }
    tracing::debug!("minor compaction worker stopped");
}

/// Table-compaction worker loop. Accepts pause requests while idle and
/// between output files while running.
pub(crate) fn table_worker(
    inner: Arc<DbInner>,
    rx: Receiver<CompCmd>,
    pause_rx: Receiver<Receiver<()>>,
    close_rx: Receiver<()>,
) {
    loop {
        select! {
            recv(rx) -> cmd => match cmd {
                Ok(CompCmd::Auto(ack)) => {
                    let result = inner.table_auto_compaction(&pause_rx);
                    if let Err(err) = &result {
                        if *err != Error::Closed {
                            tracing::error!(error = %err, "table compaction failed");
                        }
                    }
                    if let Some(ack) = ack {
                        let _ = ack.send(result);
                    }
                }
                Err(_) => break,
            },
            recv(pause_rx) -> resume => {
                if let Ok(resume) = resume {
                    let _ = resume.recv();
                }
            },
            recv(close_rx) -> _ => break,
        }
    }
    tracing::debug!("table compaction worker stopped");
}
