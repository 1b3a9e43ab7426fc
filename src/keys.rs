//! Internal key encoding.
//!
//! Every entry the engine stores is keyed by an internal key: the user key
//! followed by an 8-byte little-endian tag packing the sequence number and
//! the key kind as `seq << 8 | kind`. The encoding is persisted in table
//! files and journals and must stay stable.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Length of the packed (sequence, kind) tag at the end of an internal key.
pub const TAG_LEN: usize = 8;

/// Sequence numbers are 56-bit.
pub const MAX_SEQ: u64 = (1 << 56) - 1;

/// The kind of a mutation. Wire values are part of the on-disk contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyKind {
    Value = 1,
    Deletion = 2,
}

impl KeyKind {
    pub fn from_u8(b: u8) -> Result<Self> {
        match b {
            1 => Ok(KeyKind::Value),
            2 => Ok(KeyKind::Deletion),
            _ => Err(Error::Corruption(format!("invalid key kind: {b}"))),
        }
    }
}

/// Builds an internal key from its parts.
///
/// Panics if `seq` exceeds the 56-bit range; sequences are allocated by the
/// write path and can only get there through an engine bug.
pub fn make_ikey(ukey: &[u8], seq: u64, kind: KeyKind) -> Vec<u8> {
    assert!(seq <= MAX_SEQ, "sequence number out of range");
    let mut ikey = Vec::with_capacity(ukey.len() + TAG_LEN);
    ikey.extend_from_slice(ukey);
    let mut tag = [0u8; TAG_LEN];
    LittleEndian::write_u64(&mut tag, seq << 8 | kind as u64);
    ikey.extend_from_slice(&tag);
    ikey
}

/// Splits an internal key into its user key and raw tag. The caller must
/// have validated the length.
pub fn split_ikey(ikey: &[u8]) -> (&[u8], u64) {
    let split = ikey.len() - TAG_LEN;
    (&ikey[..split], LittleEndian::read_u64(&ikey[split..]))
}

/// Decodes an internal key into (user key, sequence, kind).
pub fn parse_ikey(ikey: &[u8]) -> Result<(&[u8], u64, KeyKind)> {
    if ikey.len() < TAG_LEN {
        return Err(Error::Corruption(format!(
            "internal key too short: {} bytes",
            ikey.len()
        )));
    }
    let (ukey, tag) = split_ikey(ikey);
    let kind = KeyKind::from_u8((tag & 0xff) as u8)?;
    Ok((ukey, tag >> 8, kind))
}

/// The user-key portion of an internal key. Panics on keys shorter than the
/// tag; use [`parse_ikey`] on untrusted input.
pub fn ukey(ikey: &[u8]) -> &[u8] {
    &ikey[..ikey.len() - TAG_LEN]
}
