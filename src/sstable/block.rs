//! Prefix-compressed entry blocks.
//!
//! Entries are grouped into restart intervals. The first entry of an
//! interval stores its key whole (`shared = 0`), later entries share a
//! prefix with their predecessor:
//!
//! ```text
//! entry = varuint(shared) || varuint(unshared) || varuint(vlen)
//!         || unshared_key_bytes || value_bytes
//! ```
//!
//! The block ends with the restart offsets (u32 LE each) and the restart
//! count (u32 LE), which is what makes seek a binary search over restart
//! points followed by a short linear scan.

use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::comparer::InternalComparer;
use crate::encoding;
use crate::error::{Error, Result};
use crate::iter::DbIterator;

/// How block keys are compared. Data and index blocks hold internal keys
/// (index separators carry a reattached tag) and are seeked in internal
/// order; the meta-index block holds plain byte strings (filter names) and
/// is seeked bytewise.
#[derive(Clone)]
pub enum BlockOrder {
    Bytewise,
    Internal(InternalComparer),
}

impl BlockOrder {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            BlockOrder::Bytewise => a.cmp(b),
            BlockOrder::Internal(icmp) => icmp.compare(a, b),
        }
    }
}

/// Accumulates entries in key order and serializes them as one block.
pub struct BlockBuilder {
    buf: Vec<u8>,
    restarts: Vec<u32>,
    prev_key: Vec<u8>,
    entries: usize,
    restart_interval: usize,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        Self {
            buf: Vec::new(),
            restarts: Vec::new(),
            prev_key: Vec::new(),
            entries: 0,
            restart_interval: restart_interval.max(1),
        }
    }

    /// Appends an entry. Keys must arrive in strictly increasing order.
    pub fn append(&mut self, key: &[u8], value: &[u8]) {
        let shared = if self.entries % self.restart_interval == 0 {
            self.restarts.push(self.buf.len() as u32);
            0
        } else {
            shared_prefix_len(&self.prev_key, key)
        };

        encoding::put_uvarint(&mut self.buf, shared as u64);
        encoding::put_uvarint(&mut self.buf, (key.len() - shared) as u64);
        encoding::put_uvarint(&mut self.buf, value.len() as u64);
        self.buf.extend_from_slice(&key[shared..]);
        self.buf.extend_from_slice(value);

        self.prev_key.clear();
        self.prev_key.extend_from_slice(key);
        self.entries += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Size of the block if finished now.
    pub fn size_estimate(&self) -> usize {
        self.buf.len() + self.restarts.len() * 4 + 4
    }

    /// The last appended key, used for separator construction.
    pub fn prev_key(&self) -> &[u8] {
        &self.prev_key
    }

    /// Appends the restart array and count, returning the block payload and
    /// resetting the builder for the next block.
    pub fn finish(&mut self) -> Vec<u8> {
        if self.entries == 0 {
            self.restarts.push(0);
        }
        let mut payload = std::mem::take(&mut self.buf);
        let mut scratch = [0u8; 4];
        for &restart in &self.restarts {
            LittleEndian::write_u32(&mut scratch, restart);
            payload.extend_from_slice(&scratch);
        }
        LittleEndian::write_u32(&mut scratch, self.restarts.len() as u32);
        payload.extend_from_slice(&scratch);

        self.restarts.clear();
        self.prev_key.clear();
        self.entries = 0;
        payload
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    let n = a.len().min(b.len());
    let mut i = 0;
    while i < n && a[i] == b[i] {
        i += 1;
    }
    i
}

/// A decoded block payload (trailer already stripped and verified).
pub struct Block {
    data: Vec<u8>,
    restarts_offset: usize,
    restarts_len: usize,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::Corruption("block too short".to_string()));
        }
        let restarts_len = LittleEndian::read_u32(&data[data.len() - 4..]) as usize;
        let tail = restarts_len
            .checked_mul(4)
            .and_then(|n| n.checked_add(4))
            .ok_or_else(|| Error::Corruption("restart count overflow".to_string()))?;
        if tail > data.len() {
            return Err(Error::Corruption(format!(
                "restart array overruns block: {restarts_len} restarts in {} bytes",
                data.len()
            )));
        }
        Ok(Self {
            restarts_offset: data.len() - tail,
            restarts_len,
            data,
        })
    }

    /// Bytes charged to the block cache.
    pub fn charge(&self) -> i64 {
        self.data.len() as i64
    }

    fn restart_offset(&self, i: usize) -> usize {
        LittleEndian::read_u32(&self.data[self.restarts_offset + i * 4..]) as usize
    }

    /// Key stored at a restart point; restart entries are uncompressed.
    fn restart_key(&self, i: usize) -> Result<&[u8]> {
        let offset = self.restart_offset(i);
        let data = &self.data[..self.restarts_offset];
        let (_, n0) = encoding::uvarint(&data[offset..])?;
        let (unshared, n1) = encoding::uvarint(&data[offset + n0..])?;
        let (_, n2) = encoding::uvarint(&data[offset + n0 + n1..])?;
        let start = offset + n0 + n1 + n2;
        let end = start + unshared as usize;
        if end > data.len() {
            return Err(Error::Corruption("restart key overruns block".to_string()));
        }
        Ok(&data[start..end])
    }

}

/// Iterator over one block's entries.
pub struct BlockIter {
    block: Arc<Block>,
    order: BlockOrder,
    /// Offset of the next entry to parse.
    offset: usize,
    key: Vec<u8>,
    value: (usize, usize),
    valid: bool,
}

impl BlockIter {
    pub fn new(block: Arc<Block>, order: BlockOrder) -> BlockIter {
        BlockIter {
            block,
            order,
            offset: 0,
            key: Vec::new(),
            value: (0, 0),
            valid: false,
        }
    }

    /// Parses the entry at `self.offset`, extending the current key by the
    /// shared-prefix rule. Returns false at the end of the entry region.
    fn parse_next(&mut self) -> Result<bool> {
        let end = self.block.restarts_offset;
        if self.offset >= end {
            self.valid = false;
            return Ok(false);
        }
        let data = &self.block.data[..end];
        let (shared, n0) = encoding::uvarint(&data[self.offset..])?;
        let (unshared, n1) = encoding::uvarint(&data[self.offset + n0..])?;
        let (vlen, n2) = encoding::uvarint(&data[self.offset + n0 + n1..])?;
        let key_start = self.offset + n0 + n1 + n2;
        let value_start = key_start + unshared as usize;
        let entry_end = value_start + vlen as usize;
        if shared as usize > self.key.len() || entry_end > end {
            return Err(Error::Corruption("block entry overruns block".to_string()));
        }
        self.key.truncate(shared as usize);
        self.key.extend_from_slice(&data[key_start..value_start]);
        self.value = (value_start, entry_end);
        self.offset = entry_end;
        self.valid = true;
        Ok(true)
    }

    fn reset_to(&mut self, offset: usize) {
        self.offset = offset;
        self.key.clear();
        self.valid = false;
    }
}

impl DbIterator for BlockIter {
    fn first(&mut self) -> Result<bool> {
        self.reset_to(0);
        self.parse_next()
    }

    fn next(&mut self) -> Result<bool> {
        if !self.valid {
            return self.first();
        }
        self.parse_next()
    }

    fn seek(&mut self, target: &[u8]) -> Result<bool> {
        // Binary search for the last restart point whose key is <= target,
        // then scan forward.
        let mut left = 0usize;
        let mut right = self.block.restarts_len;
        while left < right {
            let mid = (left + right) / 2;
            let key = self.block.restart_key(mid)?;
            if self.order.compare(key, target) == Ordering::Greater {
                right = mid;
            } else {
                left = mid + 1;
            }
        }
        let restart = left.saturating_sub(1);

        self.reset_to(if self.block.restarts_len == 0 {
            0
        } else {
            self.block.restart_offset(restart)
        });
        while self.parse_next()? {
            if self.order.compare(&self.key, target) != Ordering::Less {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn valid(&self) -> bool {
        self.valid
    }

    fn key(&self) -> &[u8] {
        if self.valid {
            &self.key
        } else {
            &[]
        }
    }

    fn value(&self) -> &[u8] {
        if self.valid {
            &self.block.data[self.value.0..self.value.1]
        } else {
            &[]
        }
    }
}
