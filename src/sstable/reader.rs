//! Table file reading.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use super::block::{Block, BlockIter, BlockOrder};
use super::filter_block::FilterBlockReader;
use super::{trailer_crc, BlockHandle, Footer, BLOCK_TRAILER_LEN, COMPRESSION_NONE, FOOTER_LEN};
use crate::cache::{Cache, CacheValue};
use crate::comparer::InternalComparer;
use crate::error::{Error, Result};
use crate::filter::BloomFilter;
use crate::iter::DbIterator;

/// An open table file: parsed footer, resident index and filter blocks,
/// data blocks served through the block cache.
pub struct TableReader {
    file: File,
    file_num: u64,
    icmp: InternalComparer,
    index_block: Arc<Block>,
    filter: Option<FilterBlockReader>,
    block_cache: Cache,
}

impl TableReader {
    pub fn open(
        file: File,
        size: u64,
        file_num: u64,
        icmp: InternalComparer,
        bits_per_key: u8,
        block_cache: Cache,
    ) -> Result<Self> {
        if size < FOOTER_LEN as u64 {
            return Err(Error::Corruption(format!(
                "table file shorter than its footer: {size} bytes"
            )));
        }
        let mut footer_buf = [0u8; FOOTER_LEN];
        file.read_exact_at(&mut footer_buf, size - FOOTER_LEN as u64)?;
        let footer = Footer::decode(&footer_buf)?;

        let index_payload = read_raw_block(&file, footer.index)?;
        let index_block = Arc::new(Block::new(index_payload)?);

        // Locate the filter through the meta-index block.
        let mut filter = None;
        if bits_per_key > 0 {
            let policy = BloomFilter::new(bits_per_key);
            let meta_payload = read_raw_block(&file, footer.metaindex)?;
            let meta_block = Arc::new(Block::new(meta_payload)?);
            let mut meta_iter = BlockIter::new(meta_block, BlockOrder::Bytewise);
            let target = super::filter_meta_key(policy.name());
            let mut more = meta_iter.first()?;
            while more {
                if meta_iter.key() == target.as_slice() {
                    let (handle, _) = BlockHandle::decode(meta_iter.value())?;
                    let payload = read_raw_block(&file, handle)?;
                    filter = Some(FilterBlockReader::new(policy, payload)?);
                    break;
                }
                more = meta_iter.next()?;
            }
        }

        Ok(Self {
            file,
            file_num,
            icmp,
            index_block,
            filter,
            block_cache,
        })
    }

    /// Reads a data block through the block cache. Blocks are keyed by
    /// their offset under this table's namespace.
    fn read_block_cached(&self, handle: BlockHandle) -> Result<Arc<Block>> {
        let mut key = [0u8; 8];
        LittleEndian::write_u64(&mut key, handle.offset);
        let cache_handle = self
            .block_cache
            .get(
                block_namespace(self.file_num),
                &key,
                Some(Box::new(|| {
                    let payload = read_raw_block(&self.file, handle)?;
                    let block = Arc::new(Block::new(payload)?);
                    let charge = block.charge();
                    let value: CacheValue = block;
                    Ok((value, charge, None))
                })),
            )?
            .expect("loader-backed cache get returned no handle");

        let value = cache_handle.value();
        value
            .downcast::<Block>()
            .map_err(|_| Error::Invariant("block cache held a foreign value".to_string()))
    }

    /// First entry with internal key >= the target.
    ///
    /// The index locates a candidate block; a negative bloom probe answers
    /// without touching data. When the candidate block holds no key >= the
    /// target (the separator is only an upper bound), the answer is the
    /// first entry of the following block.
    pub fn find(&self, ikey: &[u8], filtered: bool) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut index_iter = BlockIter::new(
            Arc::clone(&self.index_block),
            BlockOrder::Internal(self.icmp.clone()),
        );
        if !index_iter.seek(ikey)? {
            return Ok(None);
        }
        let (handle, _) = BlockHandle::decode(index_iter.value())?;

        if filtered {
            if let Some(filter) = &self.filter {
                if ikey.len() >= crate::keys::TAG_LEN
                    && !filter.may_contain(handle.offset, crate::keys::ukey(ikey))
                {
                    return Ok(None);
                }
            }
        }

        let block = self.read_block_cached(handle)?;
        let mut data_iter = BlockIter::new(block, BlockOrder::Internal(self.icmp.clone()));
        if data_iter.seek(ikey)? {
            return Ok(Some((data_iter.key().to_vec(), data_iter.value().to_vec())));
        }

        // Candidate exhausted: the match, if any, opens the next block.
        if !index_iter.next()? {
            return Ok(None);
        }
        let (next_handle, _) = BlockHandle::decode(index_iter.value())?;
        let next_block = self.read_block_cached(next_handle)?;
        let mut next_iter = BlockIter::new(next_block, BlockOrder::Internal(self.icmp.clone()));
        if next_iter.first()? {
            return Ok(Some((next_iter.key().to_vec(), next_iter.value().to_vec())));
        }
        Ok(None)
    }

    /// Exact internal-key lookup.
    pub fn get(&self, ikey: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.find(ikey, true)? {
            Some((rkey, value)) if self.icmp.compare(&rkey, ikey) == std::cmp::Ordering::Equal => {
                Ok(Some(value))
            }
            _ => Ok(None),
        }
    }

    /// Two-level iterator over every entry in the table.
    pub fn iter(self: Arc<Self>) -> TableIterator {
        let index_iter = BlockIter::new(
            Arc::clone(&self.index_block),
            BlockOrder::Internal(self.icmp.clone()),
        );
        TableIterator {
            reader: self,
            index_iter,
            data_iter: None,
        }
    }
}

/// Namespace for a table's data blocks in the shared block cache.
fn block_namespace(file_num: u64) -> u32 {
    file_num as u32
}

/// Reads and verifies one raw block: payload, compression byte, checksum.
fn read_raw_block(file: &File, handle: BlockHandle) -> Result<Vec<u8>> {
    let total = handle.length as usize + BLOCK_TRAILER_LEN;
    let mut buf = vec![0u8; total];
    file.read_exact_at(&mut buf, handle.offset)?;

    let payload_len = handle.length as usize;
    let kind = buf[payload_len];
    let stored = LittleEndian::read_u32(&buf[payload_len + 1..]);
    let computed = trailer_crc(&buf[..payload_len], kind);
    if stored != computed {
        return Err(Error::Corruption(format!(
            "block checksum mismatch at offset {}",
            handle.offset
        )));
    }
    if kind != COMPRESSION_NONE {
        return Err(Error::Corruption(format!(
            "unknown block compression kind: {kind}"
        )));
    }
    buf.truncate(payload_len);
    Ok(buf)
}

/// Walks (index entry x data block entry) pairs in order.
pub struct TableIterator {
    reader: Arc<TableReader>,
    index_iter: BlockIter,
    data_iter: Option<BlockIter>,
}

impl TableIterator {
    fn load_data_block(&mut self) -> Result<()> {
        let (handle, _) = BlockHandle::decode(self.index_iter.value())?;
        let block = self.reader.read_block_cached(handle)?;
        self.data_iter = Some(BlockIter::new(block, BlockOrder::Internal(self.reader.icmp.clone())));
        Ok(())
    }

    /// Advances through index entries until a data block yields an entry.
    fn skip_empty_blocks(&mut self) -> Result<bool> {
        loop {
            if let Some(data_iter) = &mut self.data_iter {
                if data_iter.valid() {
                    return Ok(true);
                }
            }
            if !self.index_iter.next()? {
                self.data_iter = None;
                return Ok(false);
            }
            self.load_data_block()?;
            if self
                .data_iter
                .as_mut()
                .expect("data iterator just loaded")
                .first()?
            {
                return Ok(true);
            }
        }
    }
}

impl DbIterator for TableIterator {
    fn first(&mut self) -> Result<bool> {
        if !self.index_iter.first()? {
            self.data_iter = None;
            return Ok(false);
        }
        self.load_data_block()?;
        self.data_iter
            .as_mut()
            .expect("data iterator just loaded")
            .first()?;
        self.skip_empty_blocks()
    }

    fn next(&mut self) -> Result<bool> {
        match &mut self.data_iter {
            None => self.first(),
            Some(data_iter) => {
                data_iter.next()?;
                self.skip_empty_blocks()
            }
        }
    }

    fn seek(&mut self, ikey: &[u8]) -> Result<bool> {
        if !self.index_iter.seek(ikey)? {
            self.data_iter = None;
            return Ok(false);
        }
        self.load_data_block()?;
        self.data_iter
            .as_mut()
            .expect("data iterator just loaded")
            .seek(ikey)?;
        self.skip_empty_blocks()
    }

    fn valid(&self) -> bool {
        self.data_iter.as_ref().is_some_and(|iter| iter.valid())
    }

    fn key(&self) -> &[u8] {
        self.data_iter.as_ref().map(|iter| iter.key()).unwrap_or(&[])
    }

    fn value(&self) -> &[u8] {
        self.data_iter
            .as_ref()
            .map(|iter| iter.value())
            .unwrap_or(&[])
    }
}
