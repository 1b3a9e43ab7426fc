//! Versions: immutable snapshots of the level structure.
//!
//! A version is a vector of levels, each an ordered list of table file
//! metadata. Level 0 files may overlap in user-key range and are kept in
//! file-number-descending order because newer writes land in
//! higher-numbered files; levels 1 and up are disjoint and sorted by
//! smallest key. Versions never change once published: every committed
//! session record produces a fresh one, and readers pin whichever version
//! was current when they started.
//!
//! Memory liveness is the `Arc`; file liveness is the ref-tracker's
//! business: publishing a version announces its file set, replacing it
//! announces the delta, and dropping the last reference announces the
//! release. Table files are unlinked only when the tracker's per-file
//! count reaches zero.

pub mod ref_tracker;
pub mod staging;

pub use ref_tracker::{RefEvent, RefTracker};
pub use staging::VersionStaging;

use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::comparer::InternalComparer;
use crate::error::Result;
use crate::keys::{self, parse_ikey, KeyKind};
use crate::table_cache::TableCache;

/// Level-0 file count that triggers a compaction.
pub(crate) const L0_COMPACTION_TRIGGER: usize = 4;

/// Total bytes allowed in level n (n >= 1) before it scores a compaction:
/// 10^n x 10 MiB.
pub(crate) fn max_level_bytes(level: usize) -> u64 {
    let mut bytes: u64 = 10 * (1 << 20);
    for _ in 1..level {
        bytes = bytes.saturating_mul(10);
    }
    bytes
}

/// Metadata for one table file as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFileMeta {
    pub num: u64,
    pub size: u64,
    pub min_ikey: Vec<u8>,
    pub max_ikey: Vec<u8>,
}

impl TableFileMeta {
    /// Whole file sorts after the user-key range end.
    pub fn after(&self, icmp: &InternalComparer, umax: &[u8]) -> bool {
        icmp.ucompare(keys::ukey(&self.min_ikey), umax) == std::cmp::Ordering::Greater
    }

    /// Whole file sorts before the user-key range start.
    pub fn before(&self, icmp: &InternalComparer, umin: &[u8]) -> bool {
        icmp.ucompare(keys::ukey(&self.max_ikey), umin) == std::cmp::Ordering::Less
    }

    pub fn overlaps(&self, icmp: &InternalComparer, umin: &[u8], umax: &[u8]) -> bool {
        !self.after(icmp, umax) && !self.before(icmp, umin)
    }
}

pub type LevelFiles = Vec<Arc<TableFileMeta>>;

/// Smallest and largest internal keys across a file set. Meaningless for an
/// empty set; callers check.
pub fn files_range(icmp: &InternalComparer, files: &[Arc<TableFileMeta>]) -> (Vec<u8>, Vec<u8>) {
    let mut min = files[0].min_ikey.clone();
    let mut max = files[0].max_ikey.clone();
    for f in &files[1..] {
        if icmp.compare(&f.min_ikey, &min) == std::cmp::Ordering::Less {
            min = f.min_ikey.clone();
        }
        if icmp.compare(&f.max_ikey, &max) == std::cmp::Ordering::Greater {
            max = f.max_ikey.clone();
        }
    }
    (min, max)
}

/// Files overlapping the user-key range. With `expand` (level 0), a hit
/// widens the range to the file's own bounds and the scan restarts, so the
/// result is closed over level-0's mutual overlaps.
pub fn overlapping_files(
    icmp: &InternalComparer,
    files: &[Arc<TableFileMeta>],
    umin: &[u8],
    umax: &[u8],
    expand: bool,
) -> LevelFiles {
    let mut umin = umin.to_vec();
    let mut umax = umax.to_vec();
    loop {
        let hits: LevelFiles = files
            .iter()
            .filter(|f| f.overlaps(icmp, &umin, &umax))
            .cloned()
            .collect();
        if !expand {
            return hits;
        }
        let mut widened = false;
        for f in &hits {
            let fmin = keys::ukey(&f.min_ikey);
            let fmax = keys::ukey(&f.max_ikey);
            if icmp.ucompare(fmin, &umin) == std::cmp::Ordering::Less {
                umin = fmin.to_vec();
                widened = true;
            }
            if icmp.ucompare(fmax, &umax) == std::cmp::Ordering::Greater {
                umax = fmax.to_vec();
                widened = true;
            }
        }
        if !widened {
            return hits;
        }
    }
}

pub fn total_file_size(files: &[Arc<TableFileMeta>]) -> u64 {
    files.iter().map(|f| f.size).sum()
}

/// An immutable snapshot of the level structure.
pub struct Version {
    /// Assigned at publication; strictly increasing.
    pub(crate) id: u64,
    pub levels: Vec<LevelFiles>,
    /// Precomputed compaction pressure: the level with the highest score
    /// and the score itself. A score >= 1.0 invites a compaction.
    pub(crate) compaction_level: usize,
    pub(crate) compaction_score: f64,
    /// Wired at publication; a dropped published version reports its
    /// release to the ref tracker.
    pub(crate) ref_tx: Option<Sender<RefEvent>>,
}

impl Version {
    /// An empty version, the base for a fresh store.
    pub fn empty() -> Self {
        Self {
            id: 0,
            levels: Vec::new(),
            compaction_level: 0,
            compaction_score: 0.0,
            ref_tx: None,
        }
    }

    pub fn level_len(&self, level: usize) -> usize {
        self.levels.get(level).map_or(0, |files| files.len())
    }

    /// Every file number referenced by this version.
    pub fn file_nums(&self) -> Vec<u64> {
        self.levels
            .iter()
            .flat_map(|files| files.iter().map(|f| f.num))
            .collect()
    }

    /// Recomputes the compaction score: level 0 by file count against its
    /// trigger, deeper levels by byte volume against their budget.
    pub(crate) fn compute_compaction_score(&mut self) {
        let mut best_level = 0;
        let mut best_score = 0.0f64;
        for (level, files) in self.levels.iter().enumerate() {
            let score = if level == 0 {
                files.len() as f64 / L0_COMPACTION_TRIGGER as f64
            } else {
                total_file_size(files) as f64 / max_level_bytes(level) as f64
            };
            if score > best_score {
                best_score = score;
                best_level = level;
            }
        }
        self.compaction_level = best_level;
        self.compaction_score = best_score;
    }

    /// Point lookup through the level structure.
    ///
    /// Level 0 files may all contain the user key, so every overlapping
    /// file is consulted and the entry with the highest sequence wins.
    /// Deeper levels are disjoint: at most one candidate file per level,
    /// and the first level that knows the user key settles the answer.
    pub fn get(&self, ikey: &[u8], cache: &TableCache) -> Result<Option<Vec<u8>>> {
        let icmp = cache.icmp();
        let ukey = keys::ukey(ikey);

        if let Some(l0) = self.levels.first() {
            let mut best: Option<(u64, KeyKind, Vec<u8>)> = None;
            for meta in l0 {
                if !meta.overlaps(icmp, ukey, ukey) {
                    continue;
                }
                if let Some((rkey, rvalue)) = cache.find(meta, ikey)? {
                    let (ruk, rseq, rkind) = parse_ikey(&rkey)?;
                    if icmp.ucompare(ruk, ukey) == std::cmp::Ordering::Equal
                        && best.as_ref().map_or(true, |(seq, _, _)| rseq >= *seq)
                    {
                        best = Some((rseq, rkind, rvalue));
                    }
                }
            }
            if let Some((_, kind, value)) = best {
                return Ok(match kind {
                    KeyKind::Value => Some(value),
                    KeyKind::Deletion => None,
                });
            }
        }

        for files in self.levels.iter().skip(1) {
            let idx = files.partition_point(|f| {
                icmp.compare(&f.max_ikey, ikey) == std::cmp::Ordering::Less
            });
            let meta = match files.get(idx) {
                Some(meta) => meta,
                None => continue,
            };
            if icmp.ucompare(ukey, keys::ukey(&meta.min_ikey)) == std::cmp::Ordering::Less {
                continue;
            }
            if let Some((rkey, rvalue)) = cache.find(meta, ikey)? {
                let (ruk, _, rkind) = parse_ikey(&rkey)?;
                if icmp.ucompare(ruk, ukey) == std::cmp::Ordering::Equal {
                    return Ok(match rkind {
                        KeyKind::Value => Some(rvalue),
                        KeyKind::Deletion => None,
                    });
                }
            }
        }
        Ok(None)
    }

    /// Child iterators over every file in the version, newest sources
    /// first: level-0 files individually (they overlap), deeper levels as
    /// one concatenated iterator each.
    pub fn iterators(&self, cache: &TableCache) -> Vec<Box<dyn crate::iter::DbIterator>> {
        let mut children: Vec<Box<dyn crate::iter::DbIterator>> = Vec::new();
        if let Some(l0) = self.levels.first() {
            for meta in l0 {
                children.push(cache.table_iterator(meta));
            }
        }
        for files in self.levels.iter().skip(1) {
            if !files.is_empty() {
                children.push(cache.level_iterator(files.clone()));
            }
        }
        children
    }

    /// Sanity checks on a freshly built version, debug builds only.
    #[cfg(debug_assertions)]
    pub(crate) fn validate(&self, icmp: &InternalComparer) {
        for (level, files) in self.levels.iter().enumerate().skip(1) {
            for pair in files.windows(2) {
                debug_assert!(
                    icmp.ucompare(keys::ukey(&pair[0].max_ikey), keys::ukey(&pair[1].min_ikey))
                        == std::cmp::Ordering::Less,
                    "overlapping files {} and {} in level {level}",
                    pair[0].num,
                    pair[1].num,
                );
            }
        }
    }
}

impl Drop for Version {
    fn drop(&mut self) {
        if let Some(tx) = &self.ref_tx {
            let _ = tx.send(RefEvent::Release {
                vid: self.id,
                files: self.file_nums(),
            });
        }
    }
}
