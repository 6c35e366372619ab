//! Buffer slots: the fixed arena entries that hold cached block content.
//!
//! A slot carries two kinds of state with two different guardians:
//!
//! - Metadata (identity, validity, reference count, recency stamp) is stored
//!   in atomics and mutated only under the structural lock of the shard that
//!   currently lists the slot (or under the coordinator during eviction).
//! - The payload is guarded exclusively by the slot's [`ContentLock`], a
//!   blocking lock that may be held across device I/O.

use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, ThreadId};

/// Packed identity value for a slot that has never cached a block.
pub(crate) const UNASSIGNED: u64 = u64::MAX;

/// Identity of one device block: `(device id, block number)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BlockId {
    pub dev: u32,
    pub blockno: u32,
}

impl BlockId {
    pub(crate) fn new(dev: u32, blockno: u32) -> Self {
        Self { dev, blockno }
    }

    /// Packs the identity into a single word for atomic storage.
    ///
    /// `(u32::MAX, u32::MAX)` packs to [`UNASSIGNED`] and is rejected at the
    /// cache boundary, so a packed identity never collides with the sentinel.
    pub(crate) fn pack(self) -> u64 {
        ((self.dev as u64) << 32) | self.blockno as u64
    }

    pub(crate) fn unpack(packed: u64) -> Self {
        Self { dev: (packed >> 32) as u32, blockno: packed as u32 }
    }
}

/// A blocking lock over a buffer's payload.
///
/// Unlike a structural lock, this lock is expected to be held across device
/// I/O, so waiters sleep on a condvar instead of spinning. The lock records
/// its holding thread, which is what lets `write` and `release` verify the
/// caller actually holds it and turn a violation into an immediate panic.
///
/// Not re-entrant: a thread acquiring a lock it already holds deadlocks.
#[derive(Debug)]
pub(crate) struct ContentLock {
    holder: Mutex<Option<ThreadId>>,
    available: Condvar,
}

impl ContentLock {
    pub(crate) fn new() -> Self {
        Self { holder: Mutex::new(None), available: Condvar::new() }
    }

    /// Blocks until the lock is free, then takes it for the calling thread.
    pub(crate) fn acquire(&self) {
        let mut holder = self.holder.lock();
        while holder.is_some() {
            self.available.wait(&mut holder);
        }
        *holder = Some(thread::current().id());
    }

    /// Releases the lock and wakes one waiter.
    ///
    /// The caller must hold the lock; the cache checks this before calling.
    pub(crate) fn release(&self) {
        let mut holder = self.holder.lock();
        debug_assert_eq!(*holder, Some(thread::current().id()));
        *holder = None;
        drop(holder);
        self.available.notify_one();
    }

    /// Whether the calling thread currently holds the lock.
    pub(crate) fn held_by_current(&self) -> bool {
        *self.holder.lock() == Some(thread::current().id())
    }
}

/// One arena entry: a reusable container for the content of a single block.
#[derive(Debug)]
pub(crate) struct BufferSlot {
    /// Packed [`BlockId`], or [`UNASSIGNED`] for a slot that has never
    /// cached a block. Stable while `refcnt > 0`.
    id: AtomicU64,
    /// Does the payload reflect the on-disk content of `id`?
    valid: AtomicBool,
    /// Number of active holders. The slot may be recycled only at zero.
    refcnt: AtomicU32,
    /// Logical recency tick of the last successful acquisition.
    stamp: AtomicU64,
    /// Guards the payload, never the metadata above.
    lock: ContentLock,
    data: UnsafeCell<Box<[u8]>>,
}

// The payload cell is only ever accessed by the thread holding `lock`;
// everything else is atomics.
unsafe impl Sync for BufferSlot {}

impl BufferSlot {
    pub(crate) fn new(block_size: usize) -> Self {
        Self {
            id: AtomicU64::new(UNASSIGNED),
            valid: AtomicBool::new(false),
            refcnt: AtomicU32::new(0),
            stamp: AtomicU64::new(0),
            lock: ContentLock::new(),
            data: UnsafeCell::new(vec![0u8; block_size].into_boxed_slice()),
        }
    }

    pub(crate) fn id_packed(&self) -> u64 {
        self.id.load(Ordering::Relaxed)
    }

    pub(crate) fn is_unassigned(&self) -> bool {
        self.id_packed() == UNASSIGNED
    }

    /// Assigns a new identity. Only called by the thread that just claimed
    /// the slot (set its refcnt from 0 to 1), so there is no racing writer.
    pub(crate) fn set_id(&self, id: BlockId) {
        self.id.store(id.pack(), Ordering::Relaxed);
    }

    /// Returns the slot to the never-used state. Caller must have claimed
    /// the slot and must hold the shard lock it is being re-listed under.
    pub(crate) fn reset(&self) {
        self.id.store(UNASSIGNED, Ordering::Relaxed);
        self.valid.store(false, Ordering::Relaxed);
        self.refcnt.store(0, Ordering::Relaxed);
        self.stamp.store(0, Ordering::Relaxed);
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Release);
    }

    pub(crate) fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Relaxed)
    }

    pub(crate) fn set_refcnt(&self, refcnt: u32) {
        self.refcnt.store(refcnt, Ordering::Relaxed);
    }

    pub(crate) fn inc_ref(&self) -> u32 {
        self.refcnt.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn dec_ref(&self) -> u32 {
        let old = self.refcnt.fetch_sub(1, Ordering::Relaxed);
        assert!(old > 0, "reference count underflow");
        old - 1
    }

    pub(crate) fn stamp(&self) -> u64 {
        self.stamp.load(Ordering::Relaxed)
    }

    pub(crate) fn set_stamp(&self, tick: u64) {
        self.stamp.store(tick, Ordering::Relaxed);
    }

    pub(crate) fn lock_content(&self) {
        self.lock.acquire();
    }

    pub(crate) fn unlock_content(&self) {
        self.lock.release();
    }

    pub(crate) fn content_held_by_current(&self) -> bool {
        self.lock.held_by_current()
    }

    /// Shared view of the payload.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the content lock and must not hold a
    /// live mutable payload reference.
    pub(crate) unsafe fn payload(&self) -> &[u8] {
        &*self.data.get()
    }

    /// Mutable view of the payload.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the content lock and must not hold any
    /// other live payload reference.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn payload_mut(&self) -> &mut [u8] {
        &mut *self.data.get()
    }
}
