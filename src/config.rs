use std::path::PathBuf;
use std::sync::Arc;

use crate::comparer::{BytewiseComparer, Comparer};

const MIB: usize = 1 << 20;

/// Configuration for an EmberDB store.
#[derive(Clone)]
pub struct Options {
    /// Directory holding the database files.
    pub dir: PathBuf,

    /// Open without the create/write paths (default: false).
    pub read_only: bool,

    /// Memtable capacity before rotation (default: 4 MiB).
    pub write_buffer: usize,

    /// User-key total order. Its name is written into the manifest and must
    /// match on reopen (default: bytewise).
    pub comparer: Arc<dyn Comparer>,

    /// Target data-block size before rollover (default: 4 KiB).
    pub block_size: usize,

    /// Entries between restart points in a data block (default: 16).
    pub restart_interval: usize,

    /// Bloom filter strength; 0 disables the filter (default: 10).
    pub bits_per_key: u8,

    /// Table file rollover size (default: 2 MiB).
    pub target_file_size: u64,

    /// Level-0 file count at which writes are delayed by 1ms (default: 8).
    pub slowdown_trigger: usize,

    /// Level-0 file count at which writes block on compaction (default: 12).
    pub pause_trigger: usize,

    /// Upper bound, in table files, for compaction input expansion
    /// (default: 25; the byte cap is this times target_file_size).
    pub compaction_limit_files: u64,

    /// Grandparent-overlap cap, in files, for trivial moves (default: 10).
    pub trivial_gp_limit: usize,

    /// Open table handles kept in the file cache (default: 500).
    pub file_cache_capacity: usize,

    /// Decoded block bytes kept in the block cache (default: 8 MiB).
    pub block_cache_capacity: usize,
}

impl Options {
    /// Create options for the given directory with defaults.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            read_only: false,
            write_buffer: 4 * MIB,
            comparer: Arc::new(BytewiseComparer),
            block_size: 4096,
            restart_interval: 16,
            bits_per_key: 10,
            target_file_size: 2 * MIB as u64,
            slowdown_trigger: 8,
            pause_trigger: 12,
            compaction_limit_files: 25,
            trivial_gp_limit: 10,
            file_cache_capacity: 500,
            block_cache_capacity: 8 * MIB,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn write_buffer(mut self, bytes: usize) -> Self {
        self.write_buffer = bytes;
        self
    }

    pub fn comparer(mut self, comparer: Arc<dyn Comparer>) -> Self {
        self.comparer = comparer;
        self
    }

    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn restart_interval(mut self, entries: usize) -> Self {
        self.restart_interval = entries;
        self
    }

    pub fn bits_per_key(mut self, bits: u8) -> Self {
        self.bits_per_key = bits;
        self
    }

    pub fn target_file_size(mut self, bytes: u64) -> Self {
        self.target_file_size = bytes;
        self
    }

    pub fn block_cache_capacity(mut self, bytes: usize) -> Self {
        self.block_cache_capacity = bytes;
        self
    }

    /// Byte cap for compaction input-set expansion.
    pub fn compaction_limit(&self) -> u64 {
        self.compaction_limit_files * self.target_file_size
    }

    /// Byte cap for grandparent overlap before an output file is rolled.
    pub fn max_gp_overlap(&self) -> u64 {
        10 * self.target_file_size
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("dir", &self.dir)
            .field("read_only", &self.read_only)
            .field("write_buffer", &self.write_buffer)
            .field("comparer", &self.comparer.name())
            .field("block_size", &self.block_size)
            .field("target_file_size", &self.target_file_size)
            .finish()
    }
}
