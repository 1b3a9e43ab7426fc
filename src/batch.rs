//! Atomic write batches.
//!
//! A batch is the unit the journal records and the write path applies. On
//! the wire it is framed as:
//!
//! ```text
//! seq:u64 LE || count:u32 LE || entries*
//! entry = kind:u8 || varuint(klen) || key || [varuint(vlen) || value]
//! ```
//!
//! The value field is present only for Value entries. The i-th entry's
//! effective sequence is `seq + i`.

use byteorder::{ByteOrder, LittleEndian};

use crate::encoding;
use crate::error::{Error, Result};
use crate::keys::{make_ikey, KeyKind};
use crate::memtable::Memtable;

/// Length of the seq + count frame preceding the entry data.
pub const BATCH_HEADER_LEN: usize = 12;

/// Per-entry overhead charged against the memtable, on top of key and value
/// bytes. Covers the internal-key tag.
const ENTRY_OVERHEAD: usize = 8;

/// Position of one entry inside the batch data buffer.
#[derive(Debug, Clone)]
struct EntryIndex {
    kind: KeyKind,
    key_pos: usize,
    key_len: usize,
    value_pos: usize,
    value_len: usize,
}

/// An ordered set of put/delete entries applied atomically.
#[derive(Default)]
pub struct Batch {
    data: Vec<u8>,
    index: Vec<EntryIndex>,
    /// Total of key + value + tag bytes, the size this batch will occupy in
    /// the memtable. Used for throttle and merge budgeting.
    internal_len: usize,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.append_entry(KeyKind::Value, key, Some(value));
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.append_entry(KeyKind::Deletion, key, None);
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Memtable bytes this batch will occupy: sum of klen + vlen + 8.
    pub fn byte_size(&self) -> usize {
        self.internal_len
    }

    pub(crate) fn append_entry(&mut self, kind: KeyKind, key: &[u8], value: Option<&[u8]>) {
        self.data.push(kind as u8);
        encoding::put_uvarint(&mut self.data, key.len() as u64);
        let key_pos = self.data.len();
        self.data.extend_from_slice(key);

        let (value_pos, value_len) = match (kind, value) {
            (KeyKind::Value, Some(v)) => {
                encoding::put_uvarint(&mut self.data, v.len() as u64);
                let pos = self.data.len();
                self.data.extend_from_slice(v);
                (pos, v.len())
            }
            _ => (0, 0),
        };

        self.index.push(EntryIndex {
            kind,
            key_pos,
            key_len: key.len(),
            value_pos,
            value_len,
        });
        self.internal_len += key.len() + value_len + ENTRY_OVERHEAD;
    }

    /// Visits each entry as (index, kind, key, value).
    pub fn iter_entries<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(usize, KeyKind, &[u8], Option<&[u8]>) -> Result<()>,
    {
        for (i, e) in self.index.iter().enumerate() {
            let key = &self.data[e.key_pos..e.key_pos + e.key_len];
            let value = match e.kind {
                KeyKind::Value => Some(&self.data[e.value_pos..e.value_pos + e.value_len]),
                KeyKind::Deletion => None,
            };
            f(i, e.kind, key, value)?;
        }
        Ok(())
    }

    /// Serializes the batch with its journal frame.
    pub fn encode(&self, seq: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(BATCH_HEADER_LEN + self.data.len());
        let mut header = [0u8; BATCH_HEADER_LEN];
        LittleEndian::write_u64(&mut header[..8], seq);
        LittleEndian::write_u32(&mut header[8..], self.index.len() as u32);
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.data);
        out
    }

    /// Inserts every entry into `mem` under its assigned internal key.
    /// Capacity was settled by the write throttle before the batch was
    /// journaled, so the inserts are unconditional.
    pub fn insert_into(&self, mem: &Memtable, seq: u64) -> Result<()> {
        self.iter_entries(|i, kind, key, value| {
            let ikey = make_ikey(key, seq + i as u64, kind);
            mem.insert_unbounded(ikey, value.unwrap_or(&[]).to_vec());
            Ok(())
        })
    }
}

/// Decodes a journaled chunk into (seq, count) and feeds each entry to the
/// visitor as (index, kind, key, value).
pub fn decode<F>(chunk: &[u8], mut f: F) -> Result<(u64, u32)>
where
    F: FnMut(usize, KeyKind, &[u8], Option<&[u8]>) -> Result<()>,
{
    if chunk.len() < BATCH_HEADER_LEN {
        return Err(Error::Corruption(format!(
            "batch header truncated: {} bytes",
            chunk.len()
        )));
    }
    let seq = LittleEndian::read_u64(&chunk[..8]);
    let count = LittleEndian::read_u32(&chunk[8..BATCH_HEADER_LEN]);

    let data = &chunk[BATCH_HEADER_LEN..];
    let end = data.len();
    let mut pos = 0;
    let mut idx = 0usize;

    while pos < end {
        let kind = KeyKind::from_u8(data[pos])?;
        pos += 1;

        let (klen, n) = encoding::uvarint(&data[pos..])
            .map_err(|_| Error::Corruption("batch key length truncated".to_string()))?;
        pos += n;
        let klen = klen as usize;
        if pos + klen > end {
            return Err(Error::Corruption("batch key truncated".to_string()));
        }
        let key = &data[pos..pos + klen];
        pos += klen;

        match kind {
            KeyKind::Deletion => f(idx, kind, key, None)?,
            KeyKind::Value => {
                let (vlen, m) = encoding::uvarint(&data[pos..])
                    .map_err(|_| Error::Corruption("batch value length truncated".to_string()))?;
                pos += m;
                let vlen = vlen as usize;
                if pos + vlen > end {
                    return Err(Error::Corruption("batch value truncated".to_string()));
                }
                f(idx, kind, key, Some(&data[pos..pos + vlen]))?;
                pos += vlen;
            }
        }
        idx += 1;
    }

    if idx as u32 != count {
        return Err(Error::Corruption(format!(
            "batch entry count mismatch: header {count}, decoded {idx}"
        )));
    }
    Ok((seq, count))
}

/// Replays a journaled batch chunk into a memtable, assigning each entry its
/// internal key. Returns (seq, count) from the frame.
pub fn decode_into(chunk: &[u8], mem: &Memtable) -> Result<(u64, u32)> {
    if chunk.len() < BATCH_HEADER_LEN {
        return Err(Error::Corruption("batch header truncated".to_string()));
    }
    let seq = LittleEndian::read_u64(&chunk[..8]);
    decode(chunk, |idx, kind, key, value| {
        let ikey = make_ikey(key, seq + idx as u64, kind);
        mem.insert_unbounded(ikey, value.unwrap_or(&[]).to_vec());
        Ok(())
    })
}
