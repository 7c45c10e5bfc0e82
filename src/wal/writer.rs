//! The WAL record writer.
//!
//! A single flusher thread drains full blocks and the current block's
//! unflushed tail to the sink, fsyncing when waiters are queued. Producers
//! append under the flusher mutex and never wait for I/O; the only blocking
//! wait is a caller's own sync waiter, released by the flusher.
//!
//! Multiple concurrent producers must be serialized by an external commit
//! mutex; the queue is single-producer on its push side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};

use crate::config::LogWriterConfig;
use crate::error::{Error, Result};
use crate::wal::metrics::{record_sample, LogWriterMetrics};
use crate::wal::queue::{FlusherCond, SyncQueue, SyncWaiter};
use crate::wal::{chunk_checksum, ChunkType, BLOCK_SIZE, HEADER_SIZE};
use crate::writable::LogSink;

/// Number of in-memory blocks; bounds buffered-but-unflushed data at 512KB.
const BLOCK_CAPACITY: usize = 16;

/// A timer armed after an fsync to end the min-sync-interval window.
pub trait SyncTimer: Send {
    fn stop(&self);
}

/// Schedules `f` after `d`; replaceable so tests can drive time by hand.
pub type AfterFunc =
    Box<dyn Fn(Duration, Box<dyn FnOnce() + Send>) -> Box<dyn SyncTimer> + Send>;

struct ThreadTimer {
    cancelled: Arc<AtomicBool>,
}

impl SyncTimer for ThreadTimer {
    fn stop(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

fn default_after_func(d: Duration, f: Box<dyn FnOnce() + Send>) -> Box<dyn SyncTimer> {
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();
    std::thread::spawn(move || {
        std::thread::sleep(d);
        if !flag.load(Ordering::Acquire) {
            f();
        }
    });
    Box::new(ThreadTimer { cancelled })
}

struct Block {
    buf: Vec<u8>,
    /// Bytes appended by the producer.
    written: usize,
    /// Bytes already handed to the sink.
    flushed: usize,
}

impl Block {
    fn new() -> Self {
        Self {
            buf: vec![0u8; BLOCK_SIZE],
            written: 0,
            flushed: 0,
        }
    }

    fn reset(&mut self) {
        self.written = 0;
        self.flushed = 0;
    }
}

struct FlusherState {
    current: Block,
    /// Full blocks awaiting the flusher, oldest first.
    pending: Vec<Block>,
    free: Vec<Block>,
    allocated: usize,
    /// Count of blocks queued so far; the current block's ordinal.
    block_num: u64,
    closed: bool,
    done: bool,
    err: Option<Error>,
    timer: Option<Box<dyn SyncTimer>>,
    after_func: AfterFunc,
    metrics: LogWriterMetrics,
}

struct Shared {
    mu: Mutex<FlusherState>,
    flusher_cond: FlusherCond,
    /// Signalled when blocks return to the free list.
    ready_cond: Condvar,
    /// Signalled when the flusher exits.
    done_cond: Condvar,
    sync_q: SyncQueue,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, FlusherState> {
        self.mu.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Writes records to a write-ahead log with group commit.
pub struct LogWriter {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl LogWriter {
    pub fn new(sink: Box<dyn LogSink>, config: LogWriterConfig) -> LogWriter {
        let shared = Arc::new(Shared {
            mu: Mutex::new(FlusherState {
                current: Block::new(),
                pending: Vec::new(),
                free: Vec::new(),
                allocated: 1,
                block_num: 0,
                closed: false,
                done: false,
                err: None,
                timer: None,
                after_func: Box::new(default_after_func),
                metrics: LogWriterMetrics::new(),
            }),
            flusher_cond: FlusherCond::new(),
            ready_cond: Condvar::new(),
            done_cond: Condvar::new(),
            sync_q: SyncQueue::new(),
        });
        let flusher_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("kiln-wal-flusher".to_string())
            .spawn(move || {
                flush_loop(flusher_shared, sink, config.min_sync_interval, config.on_fsync)
            })
            .expect("spawn wal flusher thread");
        LogWriter {
            shared,
            handle: Some(handle),
        }
    }

    /// Appends a record without requesting a sync.
    pub fn write_record(&self, p: &[u8]) -> Result<u64> {
        self.sync_record(p, None)
    }

    /// Appends a record, optionally registering a waiter to be released
    /// once the record is on stable storage. Returns the log offset past
    /// the record. The write itself never blocks on I/O; only the waiter
    /// does.
    pub fn sync_record(&self, p: &[u8], waiter: Option<Arc<SyncWaiter>>) -> Result<u64> {
        let mut guard = self.shared.lock();
        if guard.closed {
            return Err(Error::WriterClosed);
        }

        let mut rest = p;
        let mut first = true;
        // An empty record still emits one Full chunk.
        while first || !rest.is_empty() {
            let (g, r) = emit_fragment(&self.shared, guard, first, rest);
            guard = g;
            rest = r;
            first = false;
        }

        if let Some(waiter) = waiter {
            // The flusher writes partial blocks when a sync is requested, so
            // everything written up to here is covered by this sync.
            self.shared.sync_q.push(waiter);
        }
        let offset = guard.block_num * BLOCK_SIZE as u64 + guard.current.written as u64;
        // Publication happened under the mutex; the signal cannot be lost.
        self.shared.flusher_cond.signal();
        Ok(offset)
    }

    /// Flushes and syncs anything outstanding, releases all waiters, and
    /// stops the flusher.
    pub fn close(&mut self) -> Result<()> {
        let result = {
            let mut guard = self.shared.lock();
            if guard.closed {
                return Err(Error::WriterClosed);
            }
            guard.closed = true;
            self.shared.flusher_cond.signal();
            while !guard.done {
                guard = self
                    .shared
                    .done_cond
                    .wait(guard)
                    .unwrap_or_else(|e| e.into_inner());
            }
            guard.err.clone()
        };
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        match result {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// A snapshot of the flusher metrics.
    pub fn metrics(&self) -> LogWriterMetrics {
        self.shared.lock().metrics.clone()
    }

    #[cfg(test)]
    fn set_after_func_for_testing(&self, f: AfterFunc) {
        self.shared.lock().after_func = f;
    }

    #[cfg(test)]
    fn sync_queue_waiters(&self) -> u32 {
        let (head, tail) = self.shared.sync_q.raw_load();
        head.wrapping_sub(tail)
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.close();
        }
    }
}

/// Appends one chunk of `p` to the current block, cutting a new block when
/// the tail cannot hold another header. Returns the unwritten remainder.
fn emit_fragment<'a, 'g>(
    shared: &Arc<Shared>,
    mut guard: MutexGuard<'g, FlusherState>,
    first: bool,
    p: &'a [u8],
) -> (MutexGuard<'g, FlusherState>, &'a [u8]) {
    let block = &mut guard.current;
    let i = block.written;
    debug_assert!(BLOCK_SIZE - i >= HEADER_SIZE);
    let payload_len = p.len().min(BLOCK_SIZE - i - HEADER_SIZE);
    let last = payload_len == p.len();
    let chunk_type = match (first, last) {
        (true, true) => ChunkType::Full,
        (true, false) => ChunkType::First,
        (false, true) => ChunkType::Last,
        (false, false) => ChunkType::Middle,
    };

    let payload = &p[..payload_len];
    let checksum = chunk_checksum(chunk_type, payload);
    LittleEndian::write_u32(&mut block.buf[i..i + 4], checksum);
    LittleEndian::write_u16(&mut block.buf[i + 4..i + 6], payload_len as u16);
    block.buf[i + 6] = chunk_type as u8;
    block.buf[i + HEADER_SIZE..i + HEADER_SIZE + payload_len].copy_from_slice(payload);
    block.written = i + HEADER_SIZE + payload_len;

    if BLOCK_SIZE - block.written < HEADER_SIZE {
        // Too small for another chunk; zero the tail and queue the block.
        block.buf[block.written..].fill(0);
        block.written = BLOCK_SIZE;
        guard = queue_block(shared, guard);
    }
    (guard, &p[payload_len..])
}

/// Moves the full current block to the pending list, taking a free block to
/// replace it. Blocks the producer while all buffers are in flight.
fn queue_block<'g>(
    shared: &Arc<Shared>,
    mut guard: MutexGuard<'g, FlusherState>,
) -> MutexGuard<'g, FlusherState> {
    let replacement = loop {
        if let Some(block) = guard.free.pop() {
            break block;
        }
        if guard.allocated < BLOCK_CAPACITY {
            guard.allocated += 1;
            break Block::new();
        }
        guard = shared
            .ready_cond
            .wait(guard)
            .unwrap_or_else(|e| e.into_inner());
    };
    let full = std::mem::replace(&mut guard.current, replacement);
    guard.pending.push(full);
    guard.block_num += 1;
    shared.flusher_cond.signal();
    guard
}

#[allow(clippy::type_complexity)]
fn flush_loop(
    shared: Arc<Shared>,
    mut sink: Box<dyn LogSink>,
    min_sync_interval: Option<Box<dyn Fn() -> Duration + Send>>,
    on_fsync: Option<Box<dyn Fn(Duration) + Send>>,
) {
    let mut guard = shared.lock();
    loop {
        let idle_start = Instant::now();
        loop {
            let has_data =
                !guard.pending.is_empty() || guard.current.written > guard.current.flushed;
            if guard.closed || has_data || !shared.sync_q.empty() {
                break;
            }
            guard = shared.flusher_cond.wait(guard);
        }
        guard.metrics.idle_duration += idle_start.elapsed();

        if guard.closed {
            // A pending min-sync-interval window must not outlive the
            // writer; the final fsync releases everyone.
            shared.sync_q.clear_blocked();
            if let Some(timer) = guard.timer.take() {
                timer.stop();
            }
        }

        let (head, tail) = shared.sync_q.load();
        let sync_requested = head != tail;
        let has_data =
            !guard.pending.is_empty() || guard.current.written > guard.current.flushed;
        if guard.closed && !has_data && !sync_requested {
            guard.done = true;
            shared.done_cond.notify_all();
            return;
        }

        let pending_len = guard.pending.len() as u64;
        record_sample(&mut guard.metrics.pending_buffer_len, pending_len);
        record_sample(
            &mut guard.metrics.sync_queue_len,
            u64::from(head.wrapping_sub(tail)),
        );

        let pending = std::mem::take(&mut guard.pending);
        let tail_chunk =
            guard.current.buf[guard.current.flushed..guard.current.written].to_vec();
        guard.current.flushed = guard.current.written;
        drop(guard);

        // I/O happens without the lock so producers keep appending.
        let work_start = Instant::now();
        let mut io_err: Option<Error> = None;
        let mut bytes = 0u64;
        for block in &pending {
            if io_err.is_none() {
                match sink.write_all(&block.buf[block.flushed..]) {
                    Ok(()) => bytes += (BLOCK_SIZE - block.flushed) as u64,
                    Err(err) => io_err = Some(err),
                }
            }
        }
        if io_err.is_none() && !tail_chunk.is_empty() {
            match sink.write_all(&tail_chunk) {
                Ok(()) => bytes += tail_chunk.len() as u64,
                Err(err) => io_err = Some(err),
            }
        }

        let mut defer_syncs_for = None;
        if sync_requested && io_err.is_none() {
            let sync_start = Instant::now();
            match sink.sync() {
                Ok(()) => {
                    if let Some(callback) = &on_fsync {
                        callback(sync_start.elapsed());
                    }
                    if let Some(interval) = &min_sync_interval {
                        let d = interval();
                        if d > Duration::ZERO {
                            // Block further syncs before releasing the
                            // waiters, so a commit racing with the release
                            // cannot slip in an early fsync.
                            shared.sync_q.set_blocked();
                            defer_syncs_for = Some(d);
                        }
                    }
                }
                Err(err) => io_err = Some(err),
            }
        }
        // Every waiter of the batch observes the same outcome.
        shared.sync_q.pop(head, tail, io_err.clone());
        let work = work_start.elapsed();

        guard = shared.lock();
        guard.metrics.write_throughput_bytes += bytes;
        guard.metrics.work_duration += work;
        for mut block in pending {
            block.reset();
            guard.free.push(block);
        }
        shared.ready_cond.notify_all();
        if let Some(err) = io_err {
            tracing::warn!(error = %err, "wal flush failed");
            if guard.err.is_none() {
                guard.err = Some(err);
            }
        }
        if let Some(d) = defer_syncs_for {
            if guard.closed {
                shared.sync_q.clear_blocked();
            } else {
                let timer_shared = shared.clone();
                let timer = (guard.after_func)(
                    d,
                    Box::new(move || {
                        timer_shared.sync_q.clear_blocked();
                        let _guard = timer_shared.lock();
                        timer_shared.flusher_cond.signal();
                    }),
                );
                guard.timer = Some(timer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::reader::LogReader;
    use std::sync::atomic::AtomicU64;

    /// A sink recording write and sync positions, like a file that tracks
    /// what has reached stable storage.
    #[derive(Default)]
    struct PosSink {
        data: Arc<Mutex<Vec<u8>>>,
        write_pos: Arc<AtomicU64>,
        sync_pos: Arc<AtomicU64>,
    }

    impl LogSink for PosSink {
        fn write_all(&mut self, buf: &[u8]) -> Result<()> {
            self.data.lock().unwrap().extend_from_slice(buf);
            self.write_pos.fetch_add(buf.len() as u64, Ordering::Release);
            Ok(())
        }
        fn sync(&mut self) -> Result<()> {
            self.sync_pos
                .store(self.write_pos.load(Ordering::Acquire), Ordering::Release);
            Ok(())
        }
    }

    fn pos_sink() -> (PosSink, Arc<Mutex<Vec<u8>>>, Arc<AtomicU64>, Arc<AtomicU64>) {
        let sink = PosSink::default();
        (
            PosSink {
                data: sink.data.clone(),
                write_pos: sink.write_pos.clone(),
                sync_pos: sink.sync_pos.clone(),
            },
            sink.data,
            sink.write_pos,
            sink.sync_pos,
        )
    }

    /// Retries `f` with doubling sleeps until it passes or time runs out.
    fn eventually(max_total: Duration, mut f: impl FnMut() -> bool) -> bool {
        let mut total = Duration::ZERO;
        let mut d = Duration::from_millis(1);
        loop {
            std::thread::sleep(d);
            total += d;
            if f() {
                return true;
            }
            if total >= max_total {
                return false;
            }
            d *= 2;
        }
    }

    #[test]
    fn records_roundtrip_through_reader() {
        let (sink, data, _, _) = pos_sink();
        let mut w = LogWriter::new(Box::new(sink), LogWriterConfig::default());

        let records: Vec<Vec<u8>> = vec![
            b"small".to_vec(),
            Vec::new(),
            vec![0xab; 100_000], // spans multiple blocks
            b"tail".to_vec(),
        ];
        for record in &records {
            w.write_record(record).unwrap();
        }
        w.close().unwrap();

        let bytes = data.lock().unwrap().clone();
        let reader = LogReader::new(std::io::Cursor::new(bytes));
        let read: Vec<Vec<u8>> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(read, records);
    }

    #[test]
    fn synced_record_waits_for_stable_storage() {
        let (sink, _, write_pos, sync_pos) = pos_sink();
        let mut w = LogWriter::new(Box::new(sink), LogWriterConfig::default());

        for _ in 0..1000 {
            let waiter = Arc::new(SyncWaiter::new());
            let offset = w.sync_record(b"hello", Some(waiter.clone())).unwrap();
            assert!(waiter.wait().is_none());
            assert_eq!(offset, write_pos.load(Ordering::Acquire));
            assert_eq!(offset, sync_pos.load(Ordering::Acquire));
        }
        w.close().unwrap();
    }

    struct SyncErrorSink {
        inner: PosSink,
    }

    impl LogSink for SyncErrorSink {
        fn write_all(&mut self, buf: &[u8]) -> Result<()> {
            self.inner.write_all(buf)
        }
        fn sync(&mut self) -> Result<()> {
            Err(Error::Writable("injected error".to_string()))
        }
    }

    #[test]
    fn all_waiters_observe_the_sync_error() {
        let (inner, _, _, _) = pos_sink();
        let mut w = LogWriter::new(
            Box::new(SyncErrorSink { inner }),
            LogWriterConfig::default(),
        );

        // The first waiter receives the error, and so does every later
        // batch against the same sink.
        for _ in 0..3 {
            let waiter = Arc::new(SyncWaiter::new());
            w.sync_record(b"hello", Some(waiter.clone())).unwrap();
            assert_eq!(
                waiter.wait(),
                Some(Error::Writable("injected error".to_string()))
            );
        }
        let _ = w.close();
    }

    /// A sink whose writes stall until the gate opens.
    struct GatedSink {
        inner: PosSink,
        gate: Arc<(Mutex<bool>, Condvar)>,
    }

    impl LogSink for GatedSink {
        fn write_all(&mut self, buf: &[u8]) -> Result<()> {
            let (lock, cond) = &*self.gate;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cond.wait(open).unwrap();
            }
            drop(open);
            self.inner.write_all(buf)
        }
        fn sync(&mut self) -> Result<()> {
            self.inner.sync()
        }
    }

    #[test]
    fn unsynced_writes_batch_into_large_flushes() {
        let (inner, _, _, _) = pos_sink();
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let mut w = LogWriter::new(
            Box::new(GatedSink {
                inner,
                gate: gate.clone(),
            }),
            LogWriterConfig::default(),
        );

        // 9-byte payloads + 7-byte headers = 16 bytes per record.
        const RECORD_SIZE: u64 = 16;
        let offset = w.write_record(b"hello-wal").unwrap();
        assert_eq!(offset, RECORD_SIZE);
        // 512KB of buffer capacity; fill 87.5% of it (~14 blocks) while the
        // flusher is stalled on its first write.
        const NUM_RECORDS: u64 = 28 << 10;
        for _ in 0..NUM_RECORDS {
            w.write_record(b"hello-wal").unwrap();
        }

        {
            let (lock, cond) = &*gate;
            *lock.lock().unwrap() = true;
            cond.notify_all();
        }
        w.close().unwrap();

        let m = w.metrics();
        // The stalled flusher accumulated at least 4 blocks on average.
        assert!(m.pending_buffer_len.mean() >= 4.0);
        // No record asked to be synced.
        assert_eq!(m.sync_queue_len.mean() as u64, 0);
        assert!(m.write_throughput_bytes > NUM_RECORDS * RECORD_SIZE);
    }

    struct FakeTimer;
    impl SyncTimer for FakeTimer {
        fn stop(&self) {}
    }

    #[test]
    fn min_sync_interval_defers_syncs_until_the_timer_fires() {
        let min_interval = Duration::from_millis(100);
        let (sink, _, write_pos, sync_pos) = pos_sink();
        let mut w = LogWriter::new(
            Box::new(sink),
            LogWriterConfig::default().min_sync_interval(move || min_interval),
        );
        let fired: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>> = Arc::new(Mutex::new(None));
        let captured = fired.clone();
        w.set_after_func_for_testing(Box::new(move |d, f| {
            assert_eq!(d, min_interval);
            *captured.lock().unwrap() = Some(f);
            Box::new(FakeTimer)
        }));

        // The first sync arms the interval timer.
        let waiter = Arc::new(SyncWaiter::new());
        w.sync_record(b"a", Some(waiter.clone())).unwrap();
        assert!(waiter.wait().is_none());

        let start_write_pos = write_pos.load(Ordering::Acquire);
        let start_sync_pos = sync_pos.load(Ordering::Acquire);

        // Writes are non-blocking and queue up as waiters; the sync
        // position cannot move while the timer is pending.
        let mut last_waiter = None;
        for i in 0..100u32 {
            let waiter = Arc::new(SyncWaiter::new());
            w.sync_record(&vec![b'a'; 10_000], Some(waiter.clone()))
                .unwrap();
            assert_eq!(sync_pos.load(Ordering::Acquire), start_sync_pos);
            assert_eq!(w.sync_queue_waiters(), i + 1);
            last_waiter = Some(waiter);
        }

        // The flusher keeps writing even though syncs are deferred.
        assert!(eventually(Duration::from_secs(5), || {
            write_pos.load(Ordering::Acquire) > start_write_pos
        }));

        // Firing the timer releases the accumulated waiters.
        let f = fired.lock().unwrap().take().expect("timer armed");
        f();
        assert!(last_waiter.unwrap().wait().is_none());
        assert_eq!(
            sync_pos.load(Ordering::Acquire),
            write_pos.load(Ordering::Acquire)
        );
        w.close().unwrap();
    }

    #[test]
    fn close_releases_waiters_blocked_on_the_interval() {
        let min_interval = Duration::from_millis(100);
        let (sink, _, _, _) = pos_sink();
        let mut w = LogWriter::new(
            Box::new(sink),
            LogWriterConfig::default().min_sync_interval(move || min_interval),
        );
        let captured: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>> = Arc::new(Mutex::new(None));
        let slot = captured.clone();
        w.set_after_func_for_testing(Box::new(move |_d, f| {
            *slot.lock().unwrap() = Some(f);
            Box::new(FakeTimer)
        }));

        let first = Arc::new(SyncWaiter::new());
        w.sync_record(b"a", Some(first.clone())).unwrap();
        assert!(first.wait().is_none());

        // This record cannot sync until the timer fires or the writer
        // closes.
        let second = Arc::new(SyncWaiter::new());
        w.sync_record(b"b", Some(second.clone())).unwrap();

        let closer = std::thread::spawn(move || w.close());
        assert!(second.wait().is_none());
        closer.join().unwrap().unwrap();
    }

    #[test]
    fn fsync_latency_callback_fires() {
        let latencies: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_latencies = latencies.clone();
        let (sink, _, _, _) = pos_sink();
        let mut w = LogWriter::new(
            Box::new(sink),
            LogWriterConfig::default().on_fsync(move |d| {
                sink_latencies.lock().unwrap().push(d);
            }),
        );
        let waiter = Arc::new(SyncWaiter::new());
        w.sync_record(b"hello", Some(waiter.clone())).unwrap();
        waiter.wait();
        w.close().unwrap();
        assert!(!latencies.lock().unwrap().is_empty());
        let m = w.metrics();
        assert!(m.write_throughput_bytes >= 12);
    }

    #[test]
    fn operations_fail_after_close() {
        let (sink, _, _, _) = pos_sink();
        let mut w = LogWriter::new(Box::new(sink), LogWriterConfig::default());
        w.write_record(b"x").unwrap();
        w.close().unwrap();
        assert!(matches!(w.write_record(b"y"), Err(Error::WriterClosed)));
        assert!(matches!(w.close(), Err(Error::WriterClosed)));
    }
}
