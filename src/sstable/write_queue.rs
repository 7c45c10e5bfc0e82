//! The ordered write queue.
//!
//! Every data block reaches the file through this queue so blocks land in
//! the order they were cut. With parallelism on, a consumer thread drains a
//! bounded channel while the producer keeps filling the next block; with it
//! off, tasks are performed inline and the semantics are identical.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::cache::CacheInvalidator;
use crate::error::{Error, Result};
use crate::key::InternalKey;
use crate::sstable::buffer::{BufferPool, DataBlockBuf};
use crate::sstable::footer::{BlockHandle, BlockHandleWithProperties};
use crate::sstable::index::{recycle_index_buf, IndexBlockBuf, IndexPartition};
use crate::writable::Writable;

/// One finished data block on its way to the file, with everything the
/// consumer needs to back-propagate the block handle into the index.
pub struct WriteTask {
    /// The block, already compressed and checksummed by the producer.
    pub buf: DataBlockBuf,
    /// Separator key for this block's index entry.
    pub index_sep: InternalKey,
    /// Inflight estimate registered for the index entry; retired when the
    /// real entry is added.
    pub index_inflight_size: usize,
    /// The index block the entry goes into.
    pub curr_index_block: Arc<IndexBlockBuf>,
    /// When the producer decided to cut the index block at this task: the
    /// closed partition, finished by the consumer before the index add.
    pub flushable_index_block: Option<Arc<IndexBlockBuf>>,
    /// Index-block properties finished on the producer side.
    pub finished_index_props: Vec<u8>,
}

/// State shared between the producer and the queue consumer. Mutated only
/// under the mutex; in serial mode the lock is uncontended.
pub(crate) struct SharedCore {
    pub writable: Option<Box<dyn Writable>>,
    /// Bytes written so far; the offset of the next block.
    pub file_size: u64,
    pub index_partitions: Vec<IndexPartition>,
    /// Two-level mode engages with the first closed partition.
    pub two_level_index: bool,
    /// First error; everything after it fails fast.
    pub err: Option<Error>,
}

impl SharedCore {
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        let writable = self.writable.as_mut().ok_or(Error::WriterClosed)?;
        match writable.write_all(bytes) {
            Ok(()) => {
                self.file_size += bytes.len() as u64;
                Ok(())
            }
            Err(err) => {
                self.err = Some(err.clone());
                Err(err)
            }
        }
    }
}

struct ConsumerShared {
    core: Arc<Mutex<SharedCore>>,
    data_buf_pool: Arc<BufferPool<DataBlockBuf>>,
    index_buf_pool: Arc<BufferPool<IndexBlockBuf>>,
    cache: Option<Arc<dyn CacheInvalidator + Sync>>,
    file_num: u64,
}

impl ConsumerShared {
    /// Writes the task's block, adds its index entry, and recycles buffers.
    /// On a latched error the write is skipped but buffers are still
    /// recycled so a draining queue does not leak.
    fn perform(&self, mut task: WriteTask) {
        let mut core = self.lock_core();

        if core.err.is_none() {
            if let Err(err) = self.write_and_index(&mut core, &mut task) {
                core.err = Some(err);
            }
        }

        drop(core);
        if let Some(flushable) = task.flushable_index_block.take() {
            recycle_index_buf(flushable, &self.index_buf_pool);
        }
        task.buf.clear();
        self.data_buf_pool.put(task.buf);
    }

    fn write_and_index(
        &self,
        core: &mut MutexGuard<'_, SharedCore>,
        task: &mut WriteTask,
    ) -> Result<()> {
        let physical = task
            .buf
            .physical
            .take()
            .expect("write task carries a compressed block");

        let offset = core.file_size;
        if let Some(cache) = &self.cache {
            cache.invalidate(self.file_num, offset);
        }
        let handle = BlockHandle {
            offset,
            length: physical.data().len() as u64,
        };
        core.write_raw(physical.data())?;
        core.write_raw(physical.trailer())?;

        if let Some(flushable) = task.flushable_index_block.take() {
            // The first closed partition switches the table to a two-level
            // index.
            core.two_level_index = true;
            core.index_partitions.push(IndexPartition {
                n_entries: flushable.n_entries(),
                sep: flushable.cur_key(),
                properties: std::mem::take(&mut task.finished_index_props),
                block: flushable.finish(),
            });
            recycle_index_buf(flushable, &self.index_buf_pool);
        }

        let bhp = BlockHandleWithProperties {
            handle,
            props: std::mem::take(&mut task.buf.props),
        };
        task.curr_index_block
            .add(&task.index_sep, &bhp.encoded(), task.index_inflight_size);
        Ok(())
    }

    fn lock_core(&self) -> MutexGuard<'_, SharedCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Bounded, ordered queue of write tasks with an optional consumer thread.
pub struct WriteQueue {
    tx: Option<SyncSender<WriteTask>>,
    handle: Option<JoinHandle<()>>,
    shared: Arc<ConsumerShared>,
}

impl WriteQueue {
    /// `queue_size` of 0 disables the consumer thread; tasks then run
    /// inline through `add_sync`.
    pub(crate) fn new(
        queue_size: usize,
        core: Arc<Mutex<SharedCore>>,
        data_buf_pool: Arc<BufferPool<DataBlockBuf>>,
        index_buf_pool: Arc<BufferPool<IndexBlockBuf>>,
        cache: Option<Arc<dyn CacheInvalidator + Sync>>,
        file_num: u64,
    ) -> Self {
        let shared = Arc::new(ConsumerShared {
            core,
            data_buf_pool,
            index_buf_pool,
            cache,
            file_num,
        });
        if queue_size == 0 {
            return Self {
                tx: None,
                handle: None,
                shared,
            };
        }
        let (tx, rx): (SyncSender<WriteTask>, Receiver<WriteTask>) = sync_channel(queue_size);
        let consumer = shared.clone();
        let handle = std::thread::Builder::new()
            .name("kiln-write-queue".to_string())
            .spawn(move || {
                // Tasks arrive in enqueue order; the channel closing is the
                // drain signal.
                while let Ok(task) = rx.recv() {
                    consumer.perform(task);
                }
            })
            .expect("spawn write-queue thread");
        Self {
            tx: Some(tx),
            handle: Some(handle),
            shared,
        }
    }

    /// Enqueues a task, blocking while the queue is full.
    pub fn add(&self, task: WriteTask) {
        self.tx
            .as_ref()
            .expect("parallel queue required")
            .send(task)
            .expect("write-queue consumer alive");
    }

    /// Performs a task inline; the serial-mode path.
    pub fn add_sync(&self, task: WriteTask) -> Result<()> {
        self.shared.perform(task);
        self.latched_err()
    }

    /// Drains the queue and stops the consumer, returning any latched
    /// error. Must be called before reading writer state the consumer
    /// mutates.
    pub fn finish(&mut self) -> Result<()> {
        self.tx = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.latched_err()
    }

    fn latched_err(&self) -> Result<()> {
        match &self.shared.lock_core().err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumType;
    use crate::compress::Compression;
    use crate::key::KeyKind;
    use crate::sstable::index::new_index_buf;
    use crate::writable::MemWritable;

    fn core_with_mem() -> Arc<Mutex<SharedCore>> {
        Arc::new(Mutex::new(SharedCore {
            writable: Some(Box::new(MemWritable::new())),
            file_size: 0,
            index_partitions: Vec::new(),
            two_level_index: false,
            err: None,
        }))
    }

    fn task_for(
        key: &str,
        index_block: &Arc<IndexBlockBuf>,
    ) -> WriteTask {
        let mut buf = DataBlockBuf::new(16, ChecksumType::Crc32c);
        buf.block
            .add(&InternalKey::new(key.as_bytes().to_vec(), 1, KeyKind::Set), b"v");
        buf.compress_and_checksum(Compression::None);
        index_block.add_inflight(20);
        WriteTask {
            buf,
            index_sep: InternalKey::new(key.as_bytes().to_vec(), 1, KeyKind::Set),
            index_inflight_size: 20,
            curr_index_block: index_block.clone(),
            flushable_index_block: None,
            finished_index_props: Vec::new(),
        }
    }

    #[test]
    fn tasks_commit_in_enqueue_order() {
        let core = core_with_mem();
        let pool = Arc::new(BufferPool::new());
        let index_pool = Arc::new(BufferPool::new());
        let index_block = new_index_buf(&index_pool, true);
        let mut queue = WriteQueue::new(4, core.clone(), pool, index_pool, None, 0);

        for key in ["a", "b", "c", "d", "e"] {
            queue.add(task_for(key, &index_block));
        }
        queue.finish().unwrap();

        let guard = core.lock().unwrap();
        assert!(guard.file_size > 0);
        assert_eq!(index_block.n_entries(), 5);
        // Separators were added in order; the last one is the current key.
        assert_eq!(index_block.cur_key().user_key, b"e");
    }

    #[test]
    fn serial_add_sync_matches() {
        let core = core_with_mem();
        let pool = Arc::new(BufferPool::new());
        let index_pool = Arc::new(BufferPool::new());
        let index_block = new_index_buf(&index_pool, false);
        let queue = WriteQueue::new(0, core.clone(), pool.clone(), index_pool, None, 0);

        queue.add_sync(task_for("a", &index_block)).unwrap();
        assert_eq!(index_block.n_entries(), 1);
        // The buffer came back to the pool.
        assert!(pool.get().is_some());
    }

    #[test]
    fn flushable_partition_enables_two_level() {
        let core = core_with_mem();
        let pool = Arc::new(BufferPool::new());
        let index_pool = Arc::new(BufferPool::new());
        let old_index = new_index_buf(&index_pool, false);
        old_index.add(&InternalKey::new(*b"a", 1, KeyKind::Set), b"h", 0);
        let new_index = new_index_buf(&index_pool, false);

        let queue = WriteQueue::new(0, core.clone(), pool, index_pool, None, 0);
        let mut task = task_for("b", &new_index);
        task.flushable_index_block = Some(old_index);
        task.finished_index_props = b"props".to_vec();
        queue.add_sync(task).unwrap();

        let guard = core.lock().unwrap();
        assert!(guard.two_level_index);
        assert_eq!(guard.index_partitions.len(), 1);
        assert_eq!(guard.index_partitions[0].sep.user_key, b"a");
        assert_eq!(guard.index_partitions[0].properties, b"props");
    }

    struct FailingWritable;
    impl Writable for FailingWritable {
        fn write_all(&mut self, _buf: &[u8]) -> Result<()> {
            Err(Error::Writable("disk full".to_string()))
        }
        fn finish(&mut self) -> Result<()> {
            Ok(())
        }
        fn abort(&mut self) {}
    }

    #[test]
    fn first_error_latches_and_queue_still_drains() {
        let core = Arc::new(Mutex::new(SharedCore {
            writable: Some(Box::new(FailingWritable)),
            file_size: 0,
            index_partitions: Vec::new(),
            two_level_index: false,
            err: None,
        }));
        let pool = Arc::new(BufferPool::new());
        let index_pool = Arc::new(BufferPool::new());
        let index_block = new_index_buf(&index_pool, true);
        let mut queue = WriteQueue::new(2, core.clone(), pool.clone(), index_pool, None, 0);

        for key in ["a", "b", "c"] {
            queue.add(task_for(key, &index_block));
        }
        let err = queue.finish().unwrap_err();
        assert!(matches!(err, Error::Writable(_)));
        // All three buffers were recycled despite the error.
        let mut recycled = 0;
        while pool.get().is_some() {
            recycled += 1;
        }
        assert_eq!(recycled, 3);
    }
}
