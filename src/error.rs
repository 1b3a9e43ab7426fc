use std::fmt::Display;

/// EmberDB errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Data on disk failed validation: checksum mismatch, truncated frame,
    /// bad footer magic, a manifest missing required fields, and similar.
    Corruption(String),
    /// The requested key (or file) does not exist.
    NotFound,
    /// An insert would exceed the memtable capacity. Internal signal, the
    /// write path reacts by rotating the memtable.
    CapacityExceeded,
    /// The database has been closed.
    Closed,
    /// An IO error from the filesystem.
    Io(String),
    /// Invalid caller input, e.g. a comparer that does not match the one
    /// recorded in the manifest, or a write against a read-only store.
    InvalidArgument(String),
    /// A detected internal inconsistency, e.g. a negative reference count.
    /// These indicate a bug and are treated as fatal by the workers.
    Invariant(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::NotFound => write!(f, "not found"),
            Error::CapacityExceeded => write!(f, "memtable capacity exceeded"),
            Error::Closed => write!(f, "database closed"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Invariant(msg) => write!(f, "invariant violation: {msg}"),
        }
    }
}

/// Constructs an Error::Corruption from a format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)) };
}

/// Constructs an Error::Invariant from a format string.
#[macro_export]
macro_rules! errinvariant {
    ($($args:tt)*) => { $crate::error::Error::Invariant(format!($($args)*)) };
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}
