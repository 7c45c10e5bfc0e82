use std::fmt::Display;

/// Kiln errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Keys were not added in the order the relevant keyspace requires.
    KeyOrder(String),
    /// Overlapping range tombstones or range keys that are not aligned.
    Fragmentation(String),
    /// A non-obsolete-aware entry point was used on a strict-obsolete table,
    /// or a Merge was added to one.
    StrictObsolete(String),
    /// A range-key kind was passed to a point/tombstone entry point.
    KindMisroute(String),
    /// A range-key value did not contain a decodable end key.
    InvalidEndKey(String),
    /// A feature was used below the table format version that gates it.
    FormatTooOld(String),
    /// An I/O failure from the writable sink.
    Writable(String),
    /// Invalid data, typically decoding errors or corruption.
    InvalidData(String),
    /// The writer has already been closed.
    WriterClosed,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::KeyOrder(msg) => write!(f, "key order violation: {msg}"),
            Error::Fragmentation(msg) => write!(f, "fragmentation violation: {msg}"),
            Error::StrictObsolete(msg) => write!(f, "strict obsolete misuse: {msg}"),
            Error::KindMisroute(msg) => write!(f, "kind misroute: {msg}"),
            Error::InvalidEndKey(msg) => write!(f, "invalid end key: {msg}"),
            Error::FormatTooOld(msg) => write!(f, "table format too old: {msg}"),
            Error::Writable(msg) => write!(f, "writable error: {msg}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::WriterClosed => write!(f, "writer is closed"),
        }
    }
}

/// Constructs an Error::KeyOrder for the given format string.
#[macro_export]
macro_rules! errkeyorder {
    ($($args:tt)*) => { $crate::error::Error::KeyOrder(format!($($args)*)) };
}

/// Constructs an Error::Fragmentation for the given format string.
#[macro_export]
macro_rules! errfragment {
    ($($args:tt)*) => { $crate::error::Error::Fragmentation(format!($($args)*)) };
}

/// A kiln Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Writable(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Writable(err.to_string())
    }
}
