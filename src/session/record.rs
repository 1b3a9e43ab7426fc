//! Version edits.
//!
//! A SessionRecord is one journaled chunk of the manifest: a sparse set of
//! tagged fields describing how the session state changes. The first record
//! of a manifest is a snapshot (comparer, journal number, next file number,
//! sequence number, and the full file set); later records are deltas.
//! Scalar fields compose last-write-wins, file adds and deletes by union.
//!
//! ```text
//! record = (tag:varuint || payload)*
//! ```
//!
//! | Tag | Field          | Payload                                              |
//! |-----|----------------|------------------------------------------------------|
//! | 1   | Comparer       | varuint(len) bytes                                   |
//! | 2   | JournalNum     | varuint                                              |
//! | 3   | NextFileNum    | varuint                                              |
//! | 4   | SequenceNum    | varuint                                              |
//! | 5   | CompactPtr     | varuint(level), varuint(len) ikey                    |
//! | 6   | DelTable       | varuint(level), varuint(num)                         |
//! | 7   | AddTable       | varuint(level), varuint(num), varuint(size),         |
//! |     |                | varuint(len) min_ikey, varuint(len) max_ikey         |
//! | 9   | PrevJournalNum | varuint (obsolete; accepted, ignored)                |

use crate::encoding;
use crate::error::{Error, Result};

const TAG_COMPARER: u64 = 1;
const TAG_JOURNAL_NUM: u64 = 2;
const TAG_NEXT_FILE_NUM: u64 = 3;
const TAG_SEQUENCE_NUM: u64 = 4;
const TAG_COMPACT_PTR: u64 = 5;
const TAG_DEL_TABLE: u64 = 6;
const TAG_ADD_TABLE: u64 = 7;
const TAG_PREV_JOURNAL_NUM: u64 = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactPtr {
    pub level: u32,
    pub ikey: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedTable {
    pub level: u32,
    pub num: u64,
    pub size: u64,
    pub min_ikey: Vec<u8>,
    pub max_ikey: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletedTable {
    pub level: u32,
    pub num: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRecord {
    pub comparer: Option<Vec<u8>>,
    pub journal_num: Option<u64>,
    pub next_file_num: Option<u64>,
    pub sequence_num: Option<u64>,
    pub compact_ptrs: Vec<CompactPtr>,
    pub added_tables: Vec<AddedTable>,
    pub deleted_tables: Vec<DeletedTable>,
}

impl SessionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_comparer(&mut self, name: &str) {
        self.comparer = Some(name.as_bytes().to_vec());
    }

    pub fn set_journal_num(&mut self, num: u64) {
        self.journal_num = Some(num);
    }

    pub fn set_next_file_num(&mut self, num: u64) {
        self.next_file_num = Some(num);
    }

    pub fn set_sequence_num(&mut self, seq: u64) {
        self.sequence_num = Some(seq);
    }

    pub fn set_compact_ptr(&mut self, level: u32, ikey: Vec<u8>) {
        self.compact_ptrs.push(CompactPtr { level, ikey });
    }

    pub fn add_table(&mut self, level: u32, num: u64, size: u64, min_ikey: Vec<u8>, max_ikey: Vec<u8>) {
        self.added_tables.push(AddedTable {
            level,
            num,
            size,
            min_ikey,
            max_ikey,
        });
    }

    pub fn delete_table(&mut self, level: u32, num: u64) {
        self.deleted_tables.push(DeletedTable { level, num });
    }

    /// True when nothing would be written.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Some(comparer) = &self.comparer {
            encoding::put_uvarint(&mut buf, TAG_COMPARER);
            put_bytes(&mut buf, comparer);
        }
        if let Some(num) = self.journal_num {
            encoding::put_uvarint(&mut buf, TAG_JOURNAL_NUM);
            encoding::put_uvarint(&mut buf, num);
        }
        if let Some(num) = self.next_file_num {
            encoding::put_uvarint(&mut buf, TAG_NEXT_FILE_NUM);
            encoding::put_uvarint(&mut buf, num);
        }
        if let Some(seq) = self.sequence_num {
            encoding::put_uvarint(&mut buf, TAG_SEQUENCE_NUM);
            encoding::put_uvarint(&mut buf, seq);
        }
        for ptr in &self.compact_ptrs {
            encoding::put_uvarint(&mut buf, TAG_COMPACT_PTR);
            encoding::put_uvarint(&mut buf, u64::from(ptr.level));
            put_bytes(&mut buf, &ptr.ikey);
        }
        for del in &self.deleted_tables {
            encoding::put_uvarint(&mut buf, TAG_DEL_TABLE);
            encoding::put_uvarint(&mut buf, u64::from(del.level));
            encoding::put_uvarint(&mut buf, del.num);
        }
        for add in &self.added_tables {
            encoding::put_uvarint(&mut buf, TAG_ADD_TABLE);
            encoding::put_uvarint(&mut buf, u64::from(add.level));
            encoding::put_uvarint(&mut buf, add.num);
            encoding::put_uvarint(&mut buf, add.size);
            put_bytes(&mut buf, &add.min_ikey);
            put_bytes(&mut buf, &add.max_ikey);
        }
        buf
    }

    pub fn decode(chunk: &[u8]) -> Result<Self> {
        let mut rec = Self::new();
        let mut pos = 0;
        while pos < chunk.len() {
            let (tag, n) = encoding::uvarint(&chunk[pos..])?;
            pos += n;
            match tag {
                TAG_COMPARER => {
                    rec.comparer = Some(read_bytes(chunk, &mut pos)?);
                }
                TAG_JOURNAL_NUM => {
                    rec.journal_num = Some(read_u64(chunk, &mut pos)?);
                }
                TAG_NEXT_FILE_NUM => {
                    rec.next_file_num = Some(read_u64(chunk, &mut pos)?);
                }
                TAG_SEQUENCE_NUM => {
                    rec.sequence_num = Some(read_u64(chunk, &mut pos)?);
                }
                TAG_COMPACT_PTR => {
                    let level = read_level(chunk, &mut pos)?;
                    let ikey = read_bytes(chunk, &mut pos)?;
                    rec.compact_ptrs.push(CompactPtr { level, ikey });
                }
                TAG_DEL_TABLE => {
                    let level = read_level(chunk, &mut pos)?;
                    let num = read_u64(chunk, &mut pos)?;
                    rec.deleted_tables.push(DeletedTable { level, num });
                }
                TAG_ADD_TABLE => {
                    let level = read_level(chunk, &mut pos)?;
                    let num = read_u64(chunk, &mut pos)?;
                    let size = read_u64(chunk, &mut pos)?;
                    let min_ikey = read_bytes(chunk, &mut pos)?;
                    let max_ikey = read_bytes(chunk, &mut pos)?;
                    rec.added_tables.push(AddedTable {
                        level,
                        num,
                        size,
                        min_ikey,
                        max_ikey,
                    });
                }
                TAG_PREV_JOURNAL_NUM => {
                    let _ = read_u64(chunk, &mut pos)?;
                }
                _ => {
                    return Err(Error::Corruption(format!(
                        "unknown session record tag: {tag}"
                    )))
                }
            }
        }
        Ok(rec)
    }
}

fn put_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    encoding::put_uvarint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

fn read_u64(chunk: &[u8], pos: &mut usize) -> Result<u64> {
    let (v, n) = encoding::uvarint(&chunk[*pos..])?;
    *pos += n;
    Ok(v)
}

fn read_level(chunk: &[u8], pos: &mut usize) -> Result<u32> {
    let v = read_u64(chunk, pos)?;
    u32::try_from(v).map_err(|_| Error::Corruption(format!("level out of range: {v}")))
}

fn read_bytes(chunk: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
    let len = read_u64(chunk, pos)? as usize;
    if *pos + len > chunk.len() {
        return Err(Error::Corruption(
            "session record bytes field truncated".to_string(),
        ));
    }
    let out = chunk[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_full() {
        let mut rec = SessionRecord::new();
        rec.set_comparer("emberdb.BytewiseComparer");
        rec.set_journal_num(12);
        rec.set_next_file_num(40);
        rec.set_sequence_num(99_000);
        rec.set_compact_ptr(1, b"pointer-key".to_vec());
        rec.add_table(0, 13, 4096, b"aaa".to_vec(), b"zzz".to_vec());
        rec.add_table(2, 14, 8192, b"bbb".to_vec(), b"ccc".to_vec());
        rec.delete_table(1, 7);

        let decoded = SessionRecord::decode(&rec.encode()).expect("decode failed");
        assert_eq!(decoded, rec);
    }

    #[test]
    fn test_roundtrip_sparse() {
        let mut rec = SessionRecord::new();
        rec.set_sequence_num(5);
        let decoded = SessionRecord::decode(&rec.encode()).expect("decode failed");
        assert_eq!(decoded, rec);
        assert_eq!(decoded.journal_num, None);
    }

    #[test]
    fn test_prev_journal_num_ignored() {
        // Tag 9 is obsolete but legal; it decodes to nothing.
        let mut buf = Vec::new();
        crate::encoding::put_uvarint(&mut buf, 9);
        crate::encoding::put_uvarint(&mut buf, 77);
        crate::encoding::put_uvarint(&mut buf, 4); // SequenceNum
        crate::encoding::put_uvarint(&mut buf, 11);

        let rec = SessionRecord::decode(&buf).expect("decode failed");
        assert_eq!(rec.sequence_num, Some(11));
        assert!(!rec.is_empty());
    }

    #[test]
    fn test_unknown_tag_is_corruption() {
        let mut buf = Vec::new();
        crate::encoding::put_uvarint(&mut buf, 42);
        assert!(matches!(
            SessionRecord::decode(&buf),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_truncated_bytes_field() {
        let mut rec = SessionRecord::new();
        rec.set_comparer("bytewise");
        let buf = rec.encode();
        assert!(SessionRecord::decode(&buf[..buf.len() - 2]).is_err());
    }

    #[test]
    fn test_empty() {
        assert!(SessionRecord::new().is_empty());
        assert_eq!(
            SessionRecord::decode(&[]).expect("decode failed"),
            SessionRecord::new()
        );
    }
}
