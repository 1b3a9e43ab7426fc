//! EmberDB: an embedded, ordered key-value store built on a
//! log-structured merge tree.
//!
//! A single process opens a directory and reads and writes byte-string
//! keys and values. All mutations are journaled before they are applied,
//! batches commit atomically, and background workers fold the write
//! stream into sorted, immutable table files arranged in levels.
//!
//! ```no_run
//! use emberdb::{Options, DB};
//!
//! let db = DB::open(Options::new("/tmp/demo-db"))?;
//! db.put(b"hello", b"world")?;
//! assert_eq!(db.get(b"hello")?, Some(b"world".to_vec()));
//! db.delete(b"hello")?;
//! # Ok::<(), emberdb::Error>(())
//! ```

pub mod batch;
pub mod cache;
pub mod comparer;
pub mod config;
pub mod db;
pub mod encoding;
pub mod error;
pub mod filter;
pub mod flock;
pub mod iter;
pub mod journal;
pub mod keys;
pub mod memtable;
pub mod session;
pub mod sstable;
pub mod storage;
pub mod table_cache;
pub mod tmpfs;
pub mod version;

pub use batch::Batch;
pub use config::Options;
pub use db::{Snapshot, DB};
pub use error::{Error, Result};
