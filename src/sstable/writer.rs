//! Table file construction.

use std::io::Write;

use byteorder::{ByteOrder, LittleEndian};

use super::block::BlockBuilder;
use super::filter_block::FilterBlockWriter;
use super::{filter_meta_key, trailer_crc, BlockHandle, Footer, COMPRESSION_NONE};
use crate::comparer::InternalComparer;
use crate::error::Result;
use crate::filter::BloomFilter;
use crate::keys;

/// Streams entries in ascending internal-key order into a table file.
///
/// Data blocks roll over at the configured block size. When a block is
/// finished, its index entry stays pending until the next key arrives (so
/// the separator can sit between the two blocks) or until `finish`, which
/// closes it with a successor of the last key.
pub struct TableWriter<W: Write> {
    writer: W,
    icmp: InternalComparer,
    offset: u64,
    block_size: usize,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    filter_block: Option<FilterBlockWriter>,
    filter_name: &'static str,
    /// Handle of the last finished data block, awaiting its index entry.
    pending_handle: Option<BlockHandle>,
    /// Last key of the last finished data block.
    pending_last_key: Vec<u8>,
    last_key: Vec<u8>,
    num_entries: u64,
}

impl<W: Write> TableWriter<W> {
    pub fn new(
        writer: W,
        icmp: InternalComparer,
        block_size: usize,
        restart_interval: usize,
        bits_per_key: u8,
    ) -> Self {
        let (filter_block, filter_name) = if bits_per_key > 0 {
            let policy = BloomFilter::new(bits_per_key);
            (Some(FilterBlockWriter::new(policy)), policy.name())
        } else {
            (None, "")
        };
        Self {
            writer,
            icmp,
            offset: 0,
            block_size,
            data_block: BlockBuilder::new(restart_interval),
            // Index entries are few; restart every entry keeps seeks cheap.
            index_block: BlockBuilder::new(1),
            filter_block,
            filter_name,
            pending_handle: None,
            pending_last_key: Vec::new(),
            last_key: Vec::new(),
            num_entries: 0,
        }
    }

    /// Appends an entry. Internal keys must arrive strictly increasing.
    pub fn append(&mut self, ikey: &[u8], value: &[u8]) -> Result<()> {
        self.flush_pending_index(Some(ikey));

        self.data_block.append(ikey, value);
        if let Some(filter) = &mut self.filter_block {
            filter.add_key(keys::ukey(ikey));
        }
        self.last_key.clear();
        self.last_key.extend_from_slice(ikey);
        self.num_entries += 1;

        if self.data_block.size_estimate() >= self.block_size {
            self.finish_data_block()?;
        }
        Ok(())
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes written so far, counting the block being built.
    pub fn bytes_estimate(&self) -> u64 {
        self.offset + self.data_block.size_estimate() as u64
    }

    /// Writes the filter, meta-index, index blocks and the footer. Returns
    /// the final file size.
    pub fn finish(mut self) -> Result<u64> {
        if !self.data_block.is_empty() {
            self.finish_data_block()?;
        }
        self.flush_pending_index(None);

        // Filter block.
        let filter_handle = match self.filter_block.take() {
            Some(filter) => Some(self.write_raw_block(&filter.finish())?),
            None => None,
        };

        // Meta-index block: one entry per meta block.
        let mut meta_block = BlockBuilder::new(1);
        if let Some(handle) = filter_handle {
            meta_block.append(&filter_meta_key(self.filter_name), &handle.encode());
        }
        let metaindex = self.write_raw_block(&meta_block.finish())?;

        // Index block.
        let index_payload = self.index_block.finish();
        let index = self.write_raw_block(&index_payload)?;

        let footer = Footer { metaindex, index }.encode();
        self.writer.write_all(&footer)?;
        self.offset += footer.len() as u64;
        self.writer.flush()?;
        Ok(self.offset)
    }

    /// Emits the pending index entry, keyed by a separator toward
    /// `next_key` or, at end of file, a successor of the block's last key.
    fn flush_pending_index(&mut self, next_key: Option<&[u8]>) {
        let handle = match self.pending_handle.take() {
            Some(handle) => handle,
            None => return,
        };
        // Index keys are internal keys: the user-key portion is shortened
        // and a maximal tag reattached, so the index block is searched in
        // the same internal order the data was written in.
        let index_key = match next_key {
            Some(next) => self.icmp.separator(&self.pending_last_key, next),
            None => self.icmp.successor(&self.pending_last_key),
        };
        self.index_block.append(&index_key, &handle.encode());
    }

    fn finish_data_block(&mut self) -> Result<()> {
        self.pending_last_key.clear();
        self.pending_last_key.extend_from_slice(self.data_block.prev_key());
        let payload = self.data_block.finish();
        let handle = self.write_raw_block(&payload)?;
        self.pending_handle = Some(handle);
        if let Some(filter) = &mut self.filter_block {
            filter.start_block(self.offset);
        }
        Ok(())
    }

    /// Writes payload plus the compression byte and checksum trailer.
    fn write_raw_block(&mut self, payload: &[u8]) -> Result<BlockHandle> {
        let handle = BlockHandle {
            offset: self.offset,
            length: payload.len() as u64,
        };
        self.writer.write_all(payload)?;
        let mut trailer = [0u8; 5];
        trailer[0] = COMPRESSION_NONE;
        LittleEndian::write_u32(&mut trailer[1..], trailer_crc(payload, COMPRESSION_NONE));
        self.writer.write_all(&trailer)?;
        self.offset += payload.len() as u64 + trailer.len() as u64;
        Ok(handle)
    }
}
