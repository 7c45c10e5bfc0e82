//! The sync queue and the flusher's condition variable.
//!
//! The sync queue is a fixed ring of waiters coordinating group commit: many
//! producers push (serialized by the commit mutex above this crate), the
//! single flusher pops whole ranges after an fsync and stores the sync error
//! into every popped slot.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::error::Error;

/// Capacity of the sync queue; bounds the number of unsynced commits.
pub const SYNC_CONCURRENCY: usize = 1 << 12;

/// A caller blocked on an fsync. Signalled exactly once by the flusher with
/// the outcome of the batch's sync.
pub struct SyncWaiter {
    state: Mutex<WaiterState>,
    cond: Condvar,
}

struct WaiterState {
    done: bool,
    err: Option<Error>,
}

impl SyncWaiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WaiterState {
                done: false,
                err: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Blocks until the flusher signals, returning the sync error if any.
    pub fn wait(&self) -> Option<Error> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while !state.done {
            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        state.err.clone()
    }

    pub fn signal(&self, err: Option<Error>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.done = true;
        state.err = err;
        self.cond.notify_all();
    }
}

impl Default for SyncWaiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Head and tail indices packed into one atomic word: the head (next slot to
/// fill) in the high 32 bits, the tail (oldest unpopped slot) in the low 32.
/// Indices wrap modulo the ring size when used.
pub struct SyncQueue {
    head_tail: AtomicU64,
    /// While blocked, `load` reports the queue as empty so the flusher
    /// defers fsyncs; pushes still land. Set during the min-sync-interval
    /// window.
    blocked: AtomicBool,
    slots: Vec<Mutex<Option<std::sync::Arc<SyncWaiter>>>>,
}

const DEQUEUE_BITS: u32 = 32;

impl SyncQueue {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(SYNC_CONCURRENCY);
        slots.resize_with(SYNC_CONCURRENCY, || Mutex::new(None));
        Self {
            head_tail: AtomicU64::new(0),
            blocked: AtomicBool::new(false),
            slots,
        }
    }

    fn unpack(ht: u64) -> (u32, u32) {
        ((ht >> DEQUEUE_BITS) as u32, ht as u32)
    }

    /// Adds a waiter. Single producer side; callers hold the commit mutex.
    pub fn push(&self, waiter: std::sync::Arc<SyncWaiter>) {
        let (head, tail) = Self::unpack(self.head_tail.load(Ordering::Acquire));
        assert!(
            head.wrapping_sub(tail) < SYNC_CONCURRENCY as u32,
            "sync queue is full"
        );
        let slot = &self.slots[head as usize & (SYNC_CONCURRENCY - 1)];
        *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(waiter);
        // Release the slot before bumping the head so the consumer sees it.
        self.head_tail
            .fetch_add(1 << DEQUEUE_BITS, Ordering::Release);
    }

    /// The poppable range. Reports empty while blocked.
    pub fn load(&self) -> (u32, u32) {
        if self.blocked.load(Ordering::Acquire) {
            return (0, 0);
        }
        Self::unpack(self.head_tail.load(Ordering::Acquire))
    }

    /// The true range regardless of blocking; for introspection only.
    pub fn raw_load(&self) -> (u32, u32) {
        Self::unpack(self.head_tail.load(Ordering::Acquire))
    }

    pub fn empty(&self) -> bool {
        let (head, tail) = self.load();
        head == tail
    }

    /// Pops `[tail, head)`, storing `err` into every waiter before release.
    pub fn pop(&self, head: u32, tail: u32, err: Option<Error>) {
        let mut i = tail;
        while i != head {
            let slot = &self.slots[i as usize & (SYNC_CONCURRENCY - 1)];
            let waiter = slot
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
                .expect("popped an empty sync-queue slot");
            self.head_tail.fetch_add(1, Ordering::Release);
            waiter.signal(err.clone());
            i = i.wrapping_add(1);
        }
    }

    pub fn set_blocked(&self) {
        self.blocked.store(true, Ordering::Release);
    }

    pub fn clear_blocked(&self) {
        self.blocked.store(false, Ordering::Release);
    }
}

impl Default for SyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A condition variable whose `signal` only touches the OS primitive when
/// the flusher is actually waiting. The waiting flag flips under the same
/// mutex producers publish under, so a wake-up cannot be lost.
pub struct FlusherCond {
    waiting: AtomicBool,
    cond: Condvar,
}

impl FlusherCond {
    pub fn new() -> Self {
        Self {
            waiting: AtomicBool::new(false),
            cond: Condvar::new(),
        }
    }

    /// Waits on the condition. The caller holds the flusher mutex.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.waiting.store(true, Ordering::SeqCst);
        let guard = self.cond.wait(guard).unwrap_or_else(|e| e.into_inner());
        self.waiting.store(false, Ordering::SeqCst);
        guard
    }

    /// Wakes the flusher if it is waiting. Callers must have published their
    /// work under the flusher mutex first.
    pub fn signal(&self) {
        if self.waiting.load(Ordering::SeqCst) {
            self.cond.notify_one();
        }
    }
}

impl Default for FlusherCond {
    fn default() -> Self {
        Self::new()
    }
}
