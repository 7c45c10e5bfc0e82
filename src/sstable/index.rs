//! Index block construction and two-level partitioning.
//!
//! Index entries map a separator key to the handle of the data block it
//! bounds. Separators use restart interval 1: they are deliberately
//! dissimilar, so prefix compression buys nothing and binary search wants
//! every entry restartable.

use std::sync::{Arc, Mutex};

use crate::key::InternalKey;
use crate::sstable::block::BlockWriter;
use crate::sstable::buffer::BufferPool;
use crate::sstable::estimate::SizeEstimate;
use crate::sstable::flush::{should_flush, FlushDecisionOptions};

pub const INDEX_BLOCK_RESTART_INTERVAL: usize = 1;

/// Estimated size of an index block with no entries: the restart-count
/// word. Matches `BlockWriter::estimated_size` on an empty block, which the
/// serial-mode consistency assertion depends on.
const EMPTY_ESTIMATED_SIZE: u64 = 4;

/// The in-progress index block, shared between the producer (which reads
/// the size estimate and registers inflight entries) and the write queue
/// (which adds the real entries). The two sides touch disjoint locks.
pub struct IndexBlockBuf {
    /// Only the write-queue side mutates the block when parallelism is on.
    block: Mutex<BlockWriter>,
    size: Mutex<SizeEstimate>,
    use_mutex: bool,
}

impl IndexBlockBuf {
    pub fn new(use_mutex: bool) -> Self {
        Self {
            block: Mutex::new(BlockWriter::new(INDEX_BLOCK_RESTART_INTERVAL)),
            size: Mutex::new(SizeEstimate::new(EMPTY_ESTIMATED_SIZE)),
            use_mutex,
        }
    }

    /// Whether appending `sep` with a `value_len`-byte handle should close
    /// this index block into a partition first.
    pub fn should_flush(
        &self,
        sep: &InternalKey,
        value_len: usize,
        options: FlushDecisionOptions,
        size_class_hints: &[usize],
    ) -> bool {
        let mut size = self.lock_size();
        let n_entries = size.num_total_entries();
        should_flush(
            sep.size(),
            value_len,
            INDEX_BLOCK_RESTART_INTERVAL,
            size.size() as usize,
            n_entries as usize,
            options,
            size_class_hints,
        )
    }

    /// Adds a finished index entry, retiring `inflight_size` previously
    /// registered for it.
    pub fn add(&self, key: &InternalKey, value: &[u8], inflight_size: usize) {
        let mut block = self.lock_block();
        block.add(key, value);
        let size = block.estimated_size();
        drop(block);
        self.lock_size().written_with_total(size as u64, inflight_size);
    }

    /// Registers the estimated size of an index entry whose handle is not
    /// yet known because its data block is still in the queue.
    pub fn add_inflight(&self, inflight_size: usize) {
        self.lock_size().add_inflight(inflight_size);
    }

    pub fn estimated_size(&self) -> u64 {
        let mut size = self.lock_size();
        if !self.use_mutex {
            // Size estimation must be exact when parallelism is off.
            debug_assert_eq!(size.inflight_size(), 0);
            debug_assert_eq!(
                size.size(),
                self.lock_block().estimated_size() as u64
            );
        }
        size.size()
    }

    pub fn n_entries(&self) -> usize {
        self.lock_block().n_entries()
    }

    /// The last separator added; becomes the partition's key in the
    /// top-level index.
    pub fn cur_key(&self) -> InternalKey {
        self.lock_block().cur_key()
    }

    pub fn finish(&self) -> Vec<u8> {
        self.lock_block().finish()
    }

    pub fn clear(&mut self) {
        self.block.get_mut().unwrap_or_else(|e| e.into_inner()).clear();
        self.size.get_mut().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn lock_block(&self) -> std::sync::MutexGuard<'_, BlockWriter> {
        self.block.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_size(&self) -> std::sync::MutexGuard<'_, SizeEstimate> {
        self.size.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Returns an index buffer to the pool once nothing else references it.
pub fn recycle_index_buf(buf: Arc<IndexBlockBuf>, pool: &BufferPool<IndexBlockBuf>) {
    if let Ok(mut inner) = Arc::try_unwrap(buf) {
        inner.clear();
        pool.put(inner);
    }
}

/// Takes an index buffer from the pool, or builds a fresh one.
pub fn new_index_buf(pool: &BufferPool<IndexBlockBuf>, use_mutex: bool) -> Arc<IndexBlockBuf> {
    match pool.get() {
        Some(mut buf) => {
            buf.use_mutex = use_mutex;
            Arc::new(buf)
        }
        None => Arc::new(IndexBlockBuf::new(use_mutex)),
    }
}

/// A closed index partition awaiting the two-level assembly at close.
pub struct IndexPartition {
    pub n_entries: usize,
    /// The last separator of the partition; its key in the top-level index.
    pub sep: InternalKey,
    pub properties: Vec<u8>,
    /// The finished partition block.
    pub block: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyKind;

    fn sep(s: &str) -> InternalKey {
        InternalKey::new(s.as_bytes().to_vec(), 0, KeyKind::Set)
    }

    #[test]
    fn inflight_then_written_keeps_estimate_consistent() {
        let buf = IndexBlockBuf::new(true);
        buf.add_inflight(40);
        assert!(buf.estimated_size() >= EMPTY_ESTIMATED_SIZE);
        buf.add(&sep("m"), b"handle", 40);
        // Written entries now back the whole estimate.
        let finished = buf.finish();
        assert!(!finished.is_empty());
    }

    #[test]
    fn serial_estimate_matches_block_exactly() {
        let buf = IndexBlockBuf::new(false);
        buf.add(&sep("a"), b"h1", 0);
        buf.add(&sep("b"), b"h2", 0);
        assert_eq!(buf.estimated_size(), {
            let b = buf.lock_block();
            b.estimated_size() as u64
        });
        assert_eq!(buf.n_entries(), 2);
        assert_eq!(buf.cur_key().user_key, b"b");
    }

    #[test]
    fn recycled_buf_comes_back_empty() {
        let pool = BufferPool::new();
        let buf = new_index_buf(&pool, false);
        buf.add(&sep("a"), b"h", 0);
        recycle_index_buf(buf, &pool);
        let reused = new_index_buf(&pool, true);
        assert_eq!(reused.n_entries(), 0);
    }
}
