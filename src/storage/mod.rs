//! Files on disk.
//!
//! A database directory contains:
//!
//! | Name              | Contents                                   |
//! |-------------------|--------------------------------------------|
//! | `CURRENT`         | `MANIFEST-NNNNNN\n`, the active manifest   |
//! | `CURRENT.bak`     | previous CURRENT, kept across swaps        |
//! | `CURRENT.NNNNNN`  | transient, mid-swap                        |
//! | `LOCK`            | advisory lock                              |
//! | `MANIFEST-NNNNNN` | journal of session records                 |
//! | `NNNNNN.log`      | write-ahead journal                        |
//! | `NNNNNN.ldb`      | table file                                 |
//! | `NNNNNN.temp`     | table being built, renamed on completion   |
//!
//! File numbers are allocated monotonically by the session; a file's name
//! is derived from its descriptor and nothing else.

pub mod file_storage;

pub use file_storage::Storage;

/// What a numbered file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Manifest,
    Journal,
    Table,
    Temp,
}

/// A typed file number; the unit of naming, listing and deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileDesc {
    pub kind: FileKind,
    pub num: u64,
}

impl FileDesc {
    pub fn new(kind: FileKind, num: u64) -> Self {
        Self { kind, num }
    }

    pub fn file_name(&self) -> String {
        match self.kind {
            FileKind::Manifest => format!("MANIFEST-{:06}", self.num),
            FileKind::Journal => format!("{:06}.log", self.num),
            FileKind::Table => format!("{:06}.ldb", self.num),
            FileKind::Temp => format!("{:06}.temp", self.num),
        }
    }

    /// Inverse of `file_name`. Returns None for foreign names (LOCK,
    /// CURRENT and friends included).
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(num) = name.strip_prefix("MANIFEST-") {
            let num = num.parse().ok()?;
            return Some(Self::new(FileKind::Manifest, num));
        }
        let (stem, ext) = name.split_once('.')?;
        let num: u64 = stem.parse().ok()?;
        let kind = match ext {
            "log" => FileKind::Journal,
            "ldb" => FileKind::Table,
            "temp" => FileKind::Temp,
            _ => return None,
        };
        Some(Self::new(kind, num))
    }
}
