//! kiln: the write path of a log-structured merge-tree storage engine.
//!
//! Two cores: a streaming [`sstable::writer::Writer`] that turns ordered
//! key/value entries into an immutable block-structured table, and a
//! [`wal::writer::LogWriter`] that appends records to a write-ahead log with
//! group commit.

pub mod cache;
pub mod checksum;
pub mod compress;
pub mod config;
pub mod encoding;
pub mod error;
pub mod filter;
pub mod key;
pub mod keyspan;
pub mod rangekey;
pub mod sstable;
pub mod wal;
pub mod writable;

pub use config::{LogWriterConfig, WriterOptions};
pub use error::{Error, Result};
pub use key::{InternalKey, KeyKind};
pub use sstable::writer::{Writer, WriterMetadata};
pub use wal::writer::LogWriter;
