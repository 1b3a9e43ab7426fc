use std::io::Write;

use byteorder::{ByteOrder, LittleEndian};

use super::{record_crc, BLOCK_SIZE, HEADER_SIZE, KIND_FIRST, KIND_FULL, KIND_LAST, KIND_MIDDLE};
use crate::error::Result;

/// Frames chunks into checksummed records across fixed-size blocks.
pub struct Writer<W: Write> {
    writer: W,
    /// Write position within the current block.
    block_offset: usize,
}

impl<W: Write> Writer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            block_offset: 0,
        }
    }

    /// Appends one logical chunk, splitting it into as many records as the
    /// block geometry requires. An empty chunk still produces a Full record.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let mut offset = 0;
        let mut first = true;
        loop {
            let left = BLOCK_SIZE - self.block_offset;
            if left < HEADER_SIZE {
                // Not enough room for a header: zero-fill the tail.
                if left > 0 {
                    const ZEROES: [u8; HEADER_SIZE] = [0; HEADER_SIZE];
                    self.writer.write_all(&ZEROES[..left])?;
                }
                self.block_offset = 0;
            }

            let available = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let remaining = chunk.len() - offset;
            let frag_len = remaining.min(available);
            let end = frag_len == remaining;

            let kind = match (first, end) {
                (true, true) => KIND_FULL,
                (true, false) => KIND_FIRST,
                (false, true) => KIND_LAST,
                (false, false) => KIND_MIDDLE,
            };

            let payload = &chunk[offset..offset + frag_len];
            let mut header = [0u8; HEADER_SIZE];
            LittleEndian::write_u32(&mut header[..4], record_crc(payload, kind));
            LittleEndian::write_u16(&mut header[4..6], frag_len as u16);
            header[6] = kind;

            self.writer.write_all(&header)?;
            self.writer.write_all(payload)?;
            self.block_offset += HEADER_SIZE + frag_len;
            offset += frag_len;
            first = false;

            if end {
                return Ok(());
            }
        }
    }

    /// Flushes buffered records to the underlying writer.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
