//! Immutable sorted table files.
//!
//! ## File layout
//!
//! ```text
//! +-------------------+
//! | Data Block 1      |
//! +-------------------+
//! | ...               |
//! +-------------------+
//! | Data Block N      |
//! +-------------------+
//! | Filter Block      |
//! +-------------------+
//! | Meta-Index Block  |
//! +-------------------+
//! | Index Block       |
//! +-------------------+
//! | Footer (48 bytes) |
//! +-------------------+
//! ```
//!
//! Every raw block carries a five-byte trailer: a compression kind byte
//! followed by a crc32c over the payload and that byte. Only kind 0 (no
//! compression) is defined; anything else is corruption. The footer packs
//! the meta-index and index block handles as varint pairs, zero-padded to
//! 40 bytes, and ends with the 8-byte magic.

pub mod block;
pub mod filter_block;
pub mod reader;
pub mod writer;

pub use reader::TableReader;
pub use writer::TableWriter;

use crc::{Crc, CRC_32_ISCSI};

use crate::encoding;
use crate::error::{Error, Result};

pub const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Footer length, including the magic.
pub const FOOTER_LEN: usize = 48;

/// Trailing magic identifying a table file.
pub const MAGIC: [u8; 8] = [0x57, 0xfb, 0x80, 0x8b, 0x24, 0x75, 0x47, 0xdb];

/// Compression kind byte plus checksum.
pub const BLOCK_TRAILER_LEN: usize = 5;

/// The only defined compression kind.
pub const COMPRESSION_NONE: u8 = 0;

/// Checksum over a raw block's payload and compression byte.
pub(crate) fn trailer_crc(payload: &[u8], kind: u8) -> u32 {
    let mut digest = CRC32C.digest();
    digest.update(payload);
    digest.update(&[kind]);
    digest.finalize()
}

/// Location of a block within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub length: u64,
}

impl BlockHandle {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 * encoding::MAX_VARINT_LEN);
        encoding::put_uvarint(&mut buf, self.offset);
        encoding::put_uvarint(&mut buf, self.length);
        buf
    }

    /// Decodes a handle from the front of `buf`, returning it with the
    /// number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (offset, n) = encoding::uvarint(buf)?;
        let (length, m) = encoding::uvarint(&buf[n..])?;
        Ok((Self { offset, length }, n + m))
    }
}

/// The fixed-size footer at the end of every table file.
#[derive(Debug, Clone, Copy)]
pub struct Footer {
    pub metaindex: BlockHandle,
    pub index: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_LEN);
        buf.extend_from_slice(&self.metaindex.encode());
        buf.extend_from_slice(&self.index.encode());
        buf.resize(FOOTER_LEN - MAGIC.len(), 0);
        buf.extend_from_slice(&MAGIC);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != FOOTER_LEN {
            return Err(Error::Corruption(format!(
                "footer length {} != {FOOTER_LEN}",
                buf.len()
            )));
        }
        if buf[FOOTER_LEN - MAGIC.len()..] != MAGIC {
            return Err(Error::Corruption("bad table magic".to_string()));
        }
        let (metaindex, n) = BlockHandle::decode(buf)?;
        let (index, _) = BlockHandle::decode(&buf[n..])?;
        Ok(Self { metaindex, index })
    }
}

/// Meta-index key for the filter block of the named policy.
pub(crate) fn filter_meta_key(name: &str) -> Vec<u8> {
    format!("filter.{name}").into_bytes()
}
