//! Byte sinks the writers own.
//!
//! The SST writer holds a `Writable`, which distinguishes a successful
//! `finish` from an `abort` so half-written tables are not durably
//! published. The WAL writer holds a `LogSink`, which only needs ordered
//! writes and fsync; its file lifecycle belongs to the log manager above.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::Result;

/// An append-only sink for a table under construction.
pub trait Writable: Send {
    /// Appends `buf` in its entirety.
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Flushes buffers and makes the contents durable.
    fn finish(&mut self) -> Result<()>;

    /// Discards the sink; the contents must not be treated as a valid table.
    fn abort(&mut self);
}

/// An append-only sink for a write-ahead log.
pub trait LogSink: Send {
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
}

/// A buffered file sink.
pub struct FileWritable {
    writer: BufWriter<File>,
}

impl FileWritable {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl Writable for FileWritable {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.writer.write_all(buf)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    fn abort(&mut self) {
        // The file is left behind for the caller to unlink; nothing here may
        // fail during error unwinding.
    }
}

impl LogSink for FileWritable {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.writer.write_all(buf)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

/// An in-memory sink for tests.
#[derive(Default)]
pub struct MemWritable {
    pub data: Vec<u8>,
    pub finished: bool,
    pub aborted: bool,
}

impl MemWritable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Writable for MemWritable {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.data.extend_from_slice(buf);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }

    fn abort(&mut self) {
        self.aborted = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn file_writable_persists_on_finish() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sink.sst");

        let mut w = FileWritable::create(&path).unwrap();
        Writable::write_all(&mut w, b"hello ").unwrap();
        Writable::write_all(&mut w, b"blocks").unwrap();
        w.finish().unwrap();

        let mut buf = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello blocks");
    }

    #[test]
    fn mem_writable_tracks_lifecycle() {
        let mut w = MemWritable::new();
        w.write_all(b"x").unwrap();
        assert!(!w.finished);
        w.finish().unwrap();
        assert!(w.finished && !w.aborted);
    }
}
