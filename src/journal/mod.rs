//! Journal chunk framing.
//!
//! Journals (the write-ahead log and the manifest) share one physical
//! format: a stream of fixed 32 KiB blocks, each holding a sequence of
//! records. A logical chunk is split across as many records as it needs;
//! records never span blocks.
//!
//! ```text
//! journal = block * n
//!
//! /---------------/---------------/---------------/---------------/
//! |     block     |     block     |     block     |      ...      |
//! /---------------/---------------/---------------/---------------/
//!
//! block = record * m
//!
//! /  crc32c u32 LE  /  length u16 LE  /  kind u8  /
//! /--------------------------------------------/------------------/
//! |               record header                |     payload      |
//! /--------------------------------------------/------------------/
//! ```
//!
//! The checksum covers the payload followed by the kind byte. A chunk is
//! one Full record or a First, Middle*, Last sequence. If a block's tail
//! cannot hold a record header, it is zero-filled and the next record
//! starts a fresh block.

pub mod reader;
pub mod writer;

pub use reader::Reader;
pub use writer::Writer;

use crc::{Crc, CRC_32_ISCSI};

/// crc32c, shared by the journal, manifest and table block trailers.
pub const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Physical block size.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Bytes of record header: checksum, length, kind.
pub const HEADER_SIZE: usize = 7;

/// Record kinds. The wire values are the contract; a chunk that fits one
/// record is Full, otherwise First..Middle*..Last.
pub const KIND_FULL: u8 = 1;
pub const KIND_FIRST: u8 = 2;
pub const KIND_MIDDLE: u8 = 3;
pub const KIND_LAST: u8 = 4;

/// Checksum over a record's payload and kind byte.
pub(crate) fn record_crc(payload: &[u8], kind: u8) -> u32 {
    let mut digest = CRC32C.digest();
    digest.update(payload);
    digest.update(&[kind]);
    digest.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{ByteOrder, LittleEndian};
    use std::io::Cursor;

    fn roundtrip(chunks: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let mut buf = Vec::new();
        {
            let mut writer = Writer::new(&mut buf);
            for chunk in chunks {
                writer.write_chunk(chunk).expect("write failed");
            }
            writer.flush().expect("flush failed");
        }
        let mut reader = Reader::new(Cursor::new(buf));
        let mut out = Vec::new();
        while let Some(chunk) = reader.next_chunk().expect("read failed") {
            out.push(chunk);
        }
        out
    }

    #[test]
    fn test_small_chunks_roundtrip() {
        let chunks = vec![b"alpha".to_vec(), b"beta".to_vec(), Vec::new(), b"gamma".to_vec()];
        assert_eq!(roundtrip(&chunks), chunks);
    }

    #[test]
    fn test_chunk_spanning_blocks() {
        // Forces First/Middle/Last records across several blocks.
        let big = vec![0xabu8; BLOCK_SIZE * 3 + 1234];
        let chunks = vec![b"before".to_vec(), big, b"after".to_vec()];
        assert_eq!(roundtrip(&chunks), chunks);
    }

    #[test]
    fn test_block_tail_zero_fill() {
        // A chunk sized so the next record header cannot fit in the block
        // remainder; the writer must zero-fill and start a new block.
        let first = vec![1u8; BLOCK_SIZE - HEADER_SIZE - 3];
        let chunks = vec![first, b"next".to_vec()];
        assert_eq!(roundtrip(&chunks), chunks);
    }

    #[test]
    fn test_wire_kind_values() {
        // The numbering is the contract: Full=1 on the wire.
        let mut buf = Vec::new();
        {
            let mut writer = Writer::new(&mut buf);
            writer.write_chunk(b"x").expect("write failed");
            writer.flush().expect("flush failed");
        }
        assert_eq!(buf[6], KIND_FULL);
        assert_eq!(LittleEndian::read_u16(&buf[4..6]), 1);
        assert_eq!(LittleEndian::read_u32(&buf[..4]), record_crc(b"x", KIND_FULL));
    }

    #[test]
    fn test_corrupt_record_skips_rest_of_block() {
        let chunks = vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()];
        let mut buf = Vec::new();
        {
            let mut writer = Writer::new(&mut buf);
            for chunk in &chunks {
                writer.write_chunk(chunk).expect("write failed");
            }
            writer.flush().expect("flush failed");
        }
        // Flip a payload byte in the second record. Its CRC fails and the
        // remainder of the block (including "three") is dropped.
        let second_payload = HEADER_SIZE + 3 + HEADER_SIZE;
        buf[second_payload] ^= 0xff;

        let mut reader = Reader::new(Cursor::new(buf));
        let mut out = Vec::new();
        while let Some(chunk) = reader.next_chunk().expect("read failed") {
            out.push(chunk);
        }
        assert_eq!(out, vec![b"one".to_vec()]);
    }

    #[test]
    fn test_corruption_is_contained_to_one_block() {
        // Chunks in later blocks survive corruption in an earlier block.
        let filler = vec![7u8; BLOCK_SIZE / 2];
        let chunks = vec![
            filler.clone(),
            filler.clone(), // spills into block 2
            b"tail".to_vec(),
        ];
        let mut buf = Vec::new();
        {
            let mut writer = Writer::new(&mut buf);
            for chunk in &chunks {
                writer.write_chunk(chunk).expect("write failed");
            }
            writer.flush().expect("flush failed");
        }
        // Corrupt the first chunk's payload in block 0. That drops the rest
        // of block 0, taking the spanning chunk's First record with it.
        buf[HEADER_SIZE + 1] ^= 0xff;

        let mut reader = Reader::new(Cursor::new(buf));
        let mut out = Vec::new();
        while let Some(chunk) = reader.next_chunk().expect("read failed") {
            out.push(chunk);
        }
        // The first chunk and the spanning chunk are casualties; the chunk
        // written wholly inside block 2 survives.
        assert_eq!(out, vec![b"tail".to_vec()]);
    }

    #[test]
    fn test_empty_stream() {
        let mut reader = Reader::new(Cursor::new(Vec::new()));
        assert_eq!(reader.next_chunk().expect("read failed"), None);
    }
}
