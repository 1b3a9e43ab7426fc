//! Folding session records into a new version.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::{LevelFiles, TableFileMeta, Version};
use crate::comparer::InternalComparer;
use crate::session::record::SessionRecord;

/// Per-level scratch: files added and deleted since the base version.
#[derive(Default)]
struct LevelScratch {
    added: HashMap<u64, Arc<TableFileMeta>>,
    deleted: HashSet<u64>,
}

/// Accumulates one or more session records against a base version and
/// produces the successor version with freshly built, sorted level vectors
/// (no aliasing into the base).
pub struct VersionStaging<'a> {
    base: &'a Version,
    icmp: InternalComparer,
    scratch: Vec<LevelScratch>,
}

impl<'a> VersionStaging<'a> {
    pub fn new(base: &'a Version, icmp: InternalComparer) -> Self {
        Self {
            base,
            icmp,
            scratch: Vec::new(),
        }
    }

    fn scratch_mut(&mut self, level: usize) -> &mut LevelScratch {
        if level >= self.scratch.len() {
            self.scratch.resize_with(level + 1, LevelScratch::default);
        }
        &mut self.scratch[level]
    }

    /// Folds one record in. Within the staging, an add and a delete of the
    /// same file number cancel out.
    pub fn apply(&mut self, rec: &SessionRecord) {
        for add in &rec.added_tables {
            let meta = Arc::new(TableFileMeta {
                num: add.num,
                size: add.size,
                min_ikey: add.min_ikey.clone(),
                max_ikey: add.max_ikey.clone(),
            });
            self.scratch_mut(add.level as usize).added.insert(add.num, meta);
        }
        for del in &rec.deleted_tables {
            self.scratch_mut(del.level as usize).deleted.insert(del.num);
        }

        for scratch in &mut self.scratch {
            if scratch.added.is_empty() || scratch.deleted.is_empty() {
                continue;
            }
            let cancelled: Vec<u64> = scratch
                .added
                .keys()
                .filter(|num| scratch.deleted.contains(num))
                .copied()
                .collect();
            for num in cancelled {
                scratch.added.remove(&num);
                scratch.deleted.remove(&num);
            }
        }
    }

    /// Builds the successor version: per level, base files minus deletions
    /// plus additions, L0 sorted by file number descending (search order is
    /// newest first), deeper levels by smallest key. Trailing empty levels
    /// are trimmed.
    pub fn finish(self) -> Version {
        let level_count = self.base.levels.len().max(self.scratch.len());
        let mut levels: Vec<LevelFiles> = Vec::with_capacity(level_count);

        for level in 0..level_count {
            let base: &[Arc<TableFileMeta>] = self
                .base
                .levels
                .get(level)
                .map(|files| files.as_slice())
                .unwrap_or(&[]);
            let empty = LevelScratch::default();
            let scratch = self.scratch.get(level).unwrap_or(&empty);

            let mut files: LevelFiles = base
                .iter()
                .filter(|f| !scratch.deleted.contains(&f.num) && !scratch.added.contains_key(&f.num))
                .cloned()
                .collect();
            files.extend(scratch.added.values().cloned());

            if level == 0 {
                files.sort_by(|a, b| b.num.cmp(&a.num));
            } else {
                let icmp = self.icmp.clone();
                files.sort_by(|a, b| icmp.compare(&a.min_ikey, &b.min_ikey));
            }
            levels.push(files);
        }

        while levels.last().is_some_and(|files| files.is_empty()) {
            levels.pop();
        }

        let mut version = Version::empty();
        version.levels = levels;
        version.compute_compaction_score();
        #[cfg(debug_assertions)]
        version.validate(&self.icmp);
        version
    }
}
