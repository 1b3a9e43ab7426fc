use std::io::Read;

use byteorder::{ByteOrder, LittleEndian};

use super::{record_crc, BLOCK_SIZE, HEADER_SIZE, KIND_FIRST, KIND_FULL, KIND_LAST, KIND_MIDDLE};
use crate::error::Result;

/// Outcome of scanning for the next record in the stream.
enum Record {
    /// A well-formed record of the given kind; its payload sits at
    /// `buf[i..j]`.
    Frag(u8),
    /// A corrupt or out-of-place record was dropped. Scanning continues.
    Skipped,
    /// End of the underlying stream.
    Eof,
}

/// Recovers logical chunks from a journal stream.
///
/// Corrupt records (bad checksum, zeroed header, frame overrunning the
/// block) cause the remainder of their block to be skipped; chunks living
/// in other blocks are unaffected. A chunk whose continuation records are
/// missing or mismatched is dropped without consuming the record that
/// follows it.
pub struct Reader<R: Read> {
    reader: R,
    buf: Box<[u8; BLOCK_SIZE]>,
    /// Payload bounds of the record most recently returned by read_record.
    i: usize,
    j: usize,
    /// Bytes of the current block actually read.
    n: usize,
    loaded: bool,
}

impl<R: Read> Reader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Box::new([0; BLOCK_SIZE]),
            i: 0,
            j: 0,
            n: 0,
            loaded: false,
        }
    }

    /// Returns the next complete logical chunk, or None at end of stream.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        'scan: loop {
            let kind = match self.read_record()? {
                Record::Eof => return Ok(None),
                Record::Skipped => continue 'scan,
                Record::Frag(kind) => kind,
            };

            // A chunk must open with Full or First; anything else is a
            // leftover continuation from a dropped chunk.
            let mut chunk = match kind {
                KIND_FULL => return Ok(Some(self.buf[self.i..self.j].to_vec())),
                KIND_FIRST => self.buf[self.i..self.j].to_vec(),
                _ => continue 'scan,
            };

            loop {
                match self.read_record()? {
                    // Truncated chunk at end of stream: drop it.
                    Record::Eof => return Ok(None),
                    // Mid-chunk corruption: drop the partial chunk and
                    // rescan for the next chunk start.
                    Record::Skipped => continue 'scan,
                    Record::Frag(KIND_MIDDLE) => {
                        chunk.extend_from_slice(&self.buf[self.i..self.j]);
                    }
                    Record::Frag(KIND_LAST) => {
                        chunk.extend_from_slice(&self.buf[self.i..self.j]);
                        return Ok(Some(chunk));
                    }
                    // A fresh chunk start where a continuation was expected:
                    // the in-progress chunk is abandoned, the new one begins
                    // with this fragment.
                    Record::Frag(KIND_FULL) => {
                        return Ok(Some(self.buf[self.i..self.j].to_vec()));
                    }
                    Record::Frag(_) => {
                        chunk = self.buf[self.i..self.j].to_vec();
                    }
                }
            }
        }
    }

    fn read_record(&mut self) -> Result<Record> {
        loop {
            if self.j + HEADER_SIZE <= self.n {
                let header = &self.buf[self.j..self.j + HEADER_SIZE];
                let checksum = LittleEndian::read_u32(&header[..4]);
                let length = LittleEndian::read_u16(&header[4..6]) as usize;
                let kind = header[6];

                // A zeroed header is block-tail padding.
                if checksum == 0 && length == 0 && kind == 0 {
                    self.i = self.n;
                    self.j = self.n;
                    return Ok(Record::Skipped);
                }

                // Frame overruns what was read of this block.
                if self.j + HEADER_SIZE + length > self.n {
                    self.i = self.n;
                    self.j = self.n;
                    return Ok(Record::Skipped);
                }

                let payload = &self.buf[self.j + HEADER_SIZE..self.j + HEADER_SIZE + length];
                if record_crc(payload, kind) != checksum {
                    self.i = self.n;
                    self.j = self.n;
                    return Ok(Record::Skipped);
                }

                self.i = self.j + HEADER_SIZE;
                self.j = self.i + length;

                if !(KIND_FULL..=KIND_LAST).contains(&kind) {
                    // Unknown kind: drop this record only.
                    self.i = self.j;
                    return Ok(Record::Skipped);
                }

                return Ok(Record::Frag(kind));
            }

            // A short block can only be the final one; once consumed, the
            // stream is done.
            if self.loaded && self.n < BLOCK_SIZE {
                return Ok(Record::Eof);
            }

            let n = self.fill_block()?;
            if n == 0 {
                return Ok(Record::Eof);
            }
            self.i = 0;
            self.j = 0;
            self.n = n;
            self.loaded = true;
        }
    }

    fn fill_block(&mut self) -> Result<usize> {
        let mut n = 0;
        while n < BLOCK_SIZE {
            match self.reader.read(&mut self.buf[n..]) {
                Ok(0) => break,
                Ok(m) => n += m,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(n)
    }
}
