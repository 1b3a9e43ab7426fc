//! Per-table filter blocks.
//!
//! Keys are bucketed by the data-block offset they were written under:
//! bucket `i` covers offsets `[i << base_lg, (i+1) << base_lg)` and owns one
//! bloom filter. The block body is the concatenated filters followed by the
//! trailer:
//!
//! ```text
//! filter_data || offset:u32 LE * nfilters || offsets_offset:u32 LE || base_lg:u8
//! ```
//!
//! A lookup maps its data-block offset to a bucket and probes the filter
//! between the two bracketing offsets; for the final bucket the bracket is
//! the offsets_offset value itself.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::filter::BloomFilter;

/// Default bucket granularity: 1 << 11 = 2 KiB of data offsets per filter.
pub const BASE_LG: u8 = 11;

pub struct FilterBlockWriter {
    policy: BloomFilter,
    base_lg: u8,
    keys: Vec<Vec<u8>>,
    data: Vec<u8>,
    offsets: Vec<u32>,
}

impl FilterBlockWriter {
    pub fn new(policy: BloomFilter) -> Self {
        Self {
            policy,
            base_lg: BASE_LG,
            keys: Vec::new(),
            data: Vec::new(),
            offsets: Vec::new(),
        }
    }

    /// Registers the user key of an entry in the current data block.
    pub fn add_key(&mut self, key: &[u8]) {
        self.keys.push(key.to_vec());
    }

    /// Rolls the filter forward to cover a data block starting at `offset`.
    /// Called after each data block is written.
    pub fn start_block(&mut self, offset: u64) {
        let bucket = offset >> self.base_lg;
        while (self.offsets.len() as u64) < bucket {
            self.generate();
        }
    }

    fn generate(&mut self) {
        self.offsets.push(self.data.len() as u32);
        if !self.keys.is_empty() {
            self.policy.append_filter(&self.keys, &mut self.data);
            self.keys.clear();
        }
    }

    /// Emits the block body.
    pub fn finish(mut self) -> Vec<u8> {
        if !self.keys.is_empty() {
            self.generate();
        }
        let offsets_offset = self.data.len() as u32;
        let mut scratch = [0u8; 4];
        for &offset in &self.offsets {
            LittleEndian::write_u32(&mut scratch, offset);
            self.data.extend_from_slice(&scratch);
        }
        LittleEndian::write_u32(&mut scratch, offsets_offset);
        self.data.extend_from_slice(&scratch);
        self.data.push(self.base_lg);
        self.data
    }
}

pub struct FilterBlockReader {
    policy: BloomFilter,
    data: Vec<u8>,
    base_lg: u8,
    offsets_offset: usize,
    nfilters: usize,
}

impl FilterBlockReader {
    pub fn new(policy: BloomFilter, data: Vec<u8>) -> Result<Self> {
        if data.len() < 5 {
            return Err(Error::Corruption("filter block too short".to_string()));
        }
        let base_lg = data[data.len() - 1];
        let offsets_offset = LittleEndian::read_u32(&data[data.len() - 5..]) as usize;
        if offsets_offset > data.len() - 5 {
            return Err(Error::Corruption(
                "filter offsets overrun filter block".to_string(),
            ));
        }
        let nfilters = (data.len() - 5 - offsets_offset) / 4;
        Ok(Self {
            policy,
            data,
            base_lg,
            offsets_offset,
            nfilters,
        })
    }

    /// Whether the filter bucket for `block_offset` may contain `key`.
    /// Out-of-range buckets and malformed brackets count as matches so a
    /// filter problem costs a block read, not a lost key.
    pub fn may_contain(&self, block_offset: u64, key: &[u8]) -> bool {
        let bucket = (block_offset >> self.base_lg) as usize;
        if bucket >= self.nfilters {
            return true;
        }
        let at = self.offsets_offset + bucket * 4;
        let start = LittleEndian::read_u32(&self.data[at..]) as usize;
        let limit = LittleEndian::read_u32(&self.data[at + 4..]) as usize;
        if start > limit || limit > self.offsets_offset {
            return true;
        }
        if start == limit {
            // Empty bucket: nothing was written under these offsets.
            return false;
        }
        self.policy.may_contain(&self.data[start..limit], key)
    }
}
