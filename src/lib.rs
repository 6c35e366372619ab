//! # bufcache - A Sharded Buffer Cache for Fixed-Size Disk Blocks
//!
//! bufcache is an in-memory cache of fixed-size device blocks shared by many
//! concurrent threads. It avoids redundant device reads and doubles as a
//! synchronization point: one authoritative copy of each block's content,
//! with controlled concurrent access.
//!
//! ## Architecture
//!
//! The cache consists of several key components:
//!
//! - **Buffer slots**: a fixed arena of reusable block-content containers
//! - **Shards**: buckets of an open hash table, each a recency-ordered list
//!   of slots behind its own structural lock
//! - **Hash router**: maps a `(device, block)` identity to its home shard,
//!   spreading contention
//! - **Coordinator**: a global lock taken only on the rare cross-shard
//!   eviction path
//! - **Content locks**: one blocking lock per slot guarding the payload,
//!   held across device I/O
//!
//! A lookup first tries the home shard alone (hit, or a free slot there);
//! only on a full miss does it scan the other shards and, last of all,
//! evict the least-recently-used unreferenced buffer under the coordinator.
//!
//! ## Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use bufcache::{BufferCache, MemStore, Options};
//!
//! # fn main() -> Result<(), bufcache::Error> {
//! let store = Arc::new(MemStore::new());
//! let cache = BufferCache::new(store, Options::default())?;
//!
//! // Acquire block 7 on device 0. The buffer comes back with its content
//! // lock held and its payload read from the device.
//! let mut buf = cache.read(0, 7)?;
//! buf.data_mut()[0] = 42;
//!
//! // Persist the payload, then hand the buffer back.
//! cache.write(&buf);
//! cache.release(buf);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod config;
pub mod error;
pub mod store;

mod shard;
mod slot;

// Re-exports
pub use config::Options;
pub use error::{Error, Result};
pub use store::{BlockStore, MemStore};

use parking_lot::Mutex;
use shard::{shard_of, Shard};
use slot::{BlockId, BufferSlot, UNASSIGNED};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Statistics for cache performance monitoring.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Total number of block acquisitions attempted.
    pub lookups: u64,
    /// Acquisitions satisfied by a buffer already caching the block.
    pub hits: u64,
    /// Acquisitions that had to allocate or recycle a buffer.
    pub misses: u64,
    /// Buffers recycled away from one identity to serve another.
    pub evictions: u64,
    /// Acquisitions that failed because every buffer was referenced.
    pub exhaustions: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }
}

/// A capacity-bounded, hash-sharded, LRU-evicting cache of device blocks.
///
/// # Thread Safety
///
/// `BufferCache` is designed to be shared across threads using
/// `Arc<BufferCache>`. Structural state (shard lists, metadata) is guarded
/// by short per-shard locks; every buffer payload is guarded by its own
/// blocking content lock, which [`read`](Self::read) acquires on the
/// caller's behalf before returning.
///
/// # Locking contract
///
/// [`write`](Self::write) and [`release`](Self::release) require the calling
/// thread to hold the buffer's content lock (it does, if the handle came
/// from `read` and stayed on this thread). Violating that contract is a
/// caller bug and panics immediately.
pub struct BufferCache {
    /// Configuration, fixed at construction.
    options: Options,

    /// The fixed arena of buffer slots. Never grows.
    slots: Vec<BufferSlot>,

    /// Hash buckets; each mutex guards only its shard's list membership.
    shards: Vec<Mutex<Shard>>,

    /// Serializes cross-shard evictions so two threads never unlink the
    /// same victim. Always acquired before any shard lock within one
    /// eviction sequence, and never held across device I/O.
    coordinator: Mutex<()>,

    /// Logical clock for recency stamps.
    ticks: AtomicU64,

    /// The device the cache reads and writes through.
    device: Arc<dyn BlockStore>,

    // Statistics counters
    lookups: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    exhaustions: AtomicU64,
}

impl BufferCache {
    /// Creates a cache with `options.capacity` slots distributed round-robin
    /// across `options.shard_count` shards, backed by `device`.
    ///
    /// All locks are constructed before any buffer is reachable, so the
    /// returned cache can immediately be shared across threads.
    pub fn new(device: Arc<dyn BlockStore>, options: Options) -> Result<Self> {
        options.validate()?;

        let slots: Vec<BufferSlot> =
            (0..options.capacity).map(|_| BufferSlot::new(options.block_size)).collect();

        let mut shards: Vec<Mutex<Shard>> =
            (0..options.shard_count).map(|_| Mutex::new(Shard::new())).collect();
        for idx in 0..options.capacity {
            shards[idx % options.shard_count].get_mut().push_mru(idx);
        }

        log::info!(
            "buffer cache initialized: {} slots of {} bytes across {} shards",
            options.capacity,
            options.block_size,
            options.shard_count
        );

        Ok(Self {
            options,
            slots,
            shards,
            coordinator: Mutex::new(()),
            ticks: AtomicU64::new(0),
            device,
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            exhaustions: AtomicU64::new(0),
        })
    }

    /// Total number of buffer slots.
    pub fn capacity(&self) -> usize {
        self.options.capacity
    }

    /// Number of hash shards.
    pub fn shard_count(&self) -> usize {
        self.options.shard_count
    }

    /// Size of one block payload in bytes.
    pub fn block_size(&self) -> usize {
        self.options.block_size
    }

    /// Returns a snapshot of the cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            exhaustions: self.exhaustions.load(Ordering::Relaxed),
        }
    }

    /// Acquires the buffer caching block `(dev, blockno)`, reading it from
    /// the device first if the cached copy is not valid.
    ///
    /// The returned handle owns the buffer's content lock; no other thread
    /// can touch the payload until [`release`](Self::release). The handle
    /// must be released on the thread that acquired it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheExhausted`] if every buffer in the cache is
    /// currently referenced, which can happen under heavy pinning.
    pub fn read(&self, dev: u32, blockno: u32) -> Result<BufferHandle<'_>> {
        let id = BlockId::new(dev, blockno);
        if id.pack() == UNASSIGNED {
            return Err(Error::invalid_argument(
                "(u32::MAX, u32::MAX) is a reserved block identity",
            ));
        }

        let idx = self.lookup_or_allocate(id)?;
        let slot = &self.slots[idx];
        if !slot.is_valid() {
            // Content lock is held, structural locks are not; the device is
            // free to block this thread.
            let data = unsafe { slot.payload_mut() };
            self.device.read_block(dev, blockno, data);
            slot.set_valid(true);
        }
        Ok(BufferHandle { cache: self, idx, id })
    }

    /// Writes the buffer's payload through to the device.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not hold the buffer's content lock,
    /// or if the handle belongs to a different cache.
    pub fn write(&self, buf: &BufferHandle<'_>) {
        assert!(std::ptr::eq(self, buf.cache), "buffer belongs to a different cache");
        let slot = &self.slots[buf.idx];
        if !slot.content_held_by_current() {
            panic!(
                "write: content lock for dev {} block {} not held by the calling thread",
                buf.id.dev, buf.id.blockno
            );
        }
        let data = unsafe { slot.payload() };
        self.device.write_block(buf.id.dev, buf.id.blockno, data);
    }

    /// Releases a buffer: unlocks its content lock and drops the caller's
    /// reference. When the last reference goes away the cached copy is
    /// invalidated, so the next acquisition of this block re-reads the
    /// device even though the payload is still resident.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not hold the buffer's content lock,
    /// or if the handle belongs to a different cache.
    pub fn release(&self, buf: BufferHandle<'_>) {
        assert!(std::ptr::eq(self, buf.cache), "buffer belongs to a different cache");
        let slot = &self.slots[buf.idx];
        if !slot.content_held_by_current() {
            panic!(
                "release: content lock for dev {} block {} not held by the calling thread",
                buf.id.dev, buf.id.blockno
            );
        }

        slot.unlock_content();

        let _shard = self.shards[shard_of(buf.id, self.shards.len())].lock();
        if slot.dec_ref() == 0 {
            // Eager invalidation on last release.
            slot.set_valid(false);
        }
    }

    /// Takes an extra reference on the buffer so it survives in the cache
    /// after the handle is released, without touching the content lock.
    ///
    /// A pinned buffer is never selected for eviction. The returned token
    /// carries the reference until [`unpin`](Self::unpin).
    pub fn pin(&self, buf: &BufferHandle<'_>) -> PinnedBlock<'_> {
        assert!(std::ptr::eq(self, buf.cache), "buffer belongs to a different cache");
        let _shard = self.shards[shard_of(buf.id, self.shards.len())].lock();
        self.slots[buf.idx].inc_ref();
        PinnedBlock { cache: self, idx: buf.idx, id: buf.id }
    }

    /// Drops the reference taken by [`pin`](Self::pin).
    pub fn unpin(&self, pin: PinnedBlock<'_>) {
        assert!(std::ptr::eq(self, pin.cache), "pin belongs to a different cache");
        let _shard = self.shards[shard_of(pin.id, self.shards.len())].lock();
        self.slots[pin.idx].dec_ref();
    }

    fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Finds or allocates the slot for `id`, returning its index with the
    /// caller's reference counted and the content lock held.
    fn lookup_or_allocate(&self, id: BlockId) -> Result<usize> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let home = shard_of(id, self.shards.len());

        {
            let mut shard = self.shards[home].lock();

            // Fast path: the block is already cached. Bump the refcount
            // under the structural lock, then block on the content lock
            // outside it so slow I/O never stalls this shard.
            if let Some(idx) = shard.find(id.pack(), &self.slots) {
                self.slots[idx].inc_ref();
                drop(shard);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(self.finish_acquire(idx));
            }
            self.misses.fetch_add(1, Ordering::Relaxed);

            // Fast miss: a never-used slot right in the home shard. Claim
            // and re-list it within one critical section so a racing miss
            // for the same identity finds it.
            if let Some(idx) = shard.take_unassigned(&self.slots) {
                let slot = &self.slots[idx];
                slot.set_refcnt(1);
                slot.set_valid(false);
                slot.set_id(id);
                shard.push_mru(idx);
                drop(shard);
                return Ok(self.finish_acquire(idx));
            }
        }

        log::debug!(
            "shard {} full for dev {} block {}, scanning all shards",
            home,
            id.dev,
            id.blockno
        );

        loop {
            // Cross-shard scan, one structural lock at a time: claim the
            // first never-used slot, otherwise remember the unreferenced
            // slot with the globally oldest stamp as the eviction victim.
            // Strict comparison makes the first-seen slot win stamp ties.
            let mut candidate: Option<(usize, u64)> = None;
            for shard_mutex in &self.shards {
                let mut shard = shard_mutex.lock();
                if let Some(idx) = shard.take_unassigned(&self.slots) {
                    let slot = &self.slots[idx];
                    slot.set_refcnt(1);
                    slot.set_valid(false);
                    slot.set_id(id);
                    drop(shard);
                    let idx = self.install_in_home(home, id, idx);
                    return Ok(self.finish_acquire(idx));
                }
                for idx in shard.iter() {
                    let slot = &self.slots[idx];
                    let best = candidate.map_or(u64::MAX, |(_, stamp)| stamp);
                    if slot.refcnt() == 0 && slot.stamp() < best {
                        candidate = Some((idx, slot.stamp()));
                    }
                }
            }

            let Some((victim, _)) = candidate else {
                self.exhaustions.fetch_add(1, Ordering::Relaxed);
                log::warn!("cache exhausted: all {} buffers referenced", self.slots.len());
                return Err(Error::CacheExhausted { capacity: self.slots.len() });
            };

            // Slow path: recycle the victim under the coordinator, which
            // serializes evictions so two threads never unlink the same
            // slot. The coordinator is taken strictly before any shard lock
            // in this sequence.
            let coordinator = self.coordinator.lock();
            let slot = &self.slots[victim];
            let old_packed = slot.id_packed();
            if old_packed == UNASSIGNED {
                drop(coordinator);
                continue;
            }
            let old = BlockId::unpack(old_packed);
            {
                let mut shard = self.shards[shard_of(old, self.shards.len())].lock();
                let stale = slot.id_packed() != old_packed
                    || slot.refcnt() != 0
                    || !shard.unlink(victim);
                if stale {
                    // The victim was re-referenced or recycled since the
                    // scan; pick again.
                    drop(shard);
                    drop(coordinator);
                    continue;
                }
            }

            log::debug!(
                "evicting dev {} block {} to cache dev {} block {}",
                old.dev,
                old.blockno,
                id.dev,
                id.blockno
            );
            self.evictions.fetch_add(1, Ordering::Relaxed);

            slot.set_refcnt(1);
            slot.set_valid(false);
            slot.set_id(id);
            let idx = self.install_in_home(home, id, victim);
            drop(coordinator);
            return Ok(self.finish_acquire(idx));
        }
    }

    /// Lists a freshly claimed slot in the home shard.
    ///
    /// If a racing thread cached the same identity while this thread was off
    /// scanning, folds onto that buffer instead and returns the claimed slot
    /// to the pool unused, so two referenced buffers never share an
    /// identity. Returns the index actually serving the request.
    fn install_in_home(&self, home: usize, id: BlockId, idx: usize) -> usize {
        let mut shard = self.shards[home].lock();
        match shard.find(id.pack(), &self.slots) {
            Some(existing) => {
                self.slots[existing].inc_ref();
                self.slots[idx].reset();
                shard.push_lru(idx);
                existing
            }
            None => {
                shard.push_mru(idx);
                idx
            }
        }
    }

    /// Blocks on the slot's content lock, then stamps its recency.
    fn finish_acquire(&self, idx: usize) -> usize {
        let slot = &self.slots[idx];
        slot.lock_content();
        slot.set_stamp(self.tick());
        idx
    }
}

impl fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferCache")
            .field("capacity", &self.options.capacity)
            .field("shard_count", &self.options.shard_count)
            .field("block_size", &self.options.block_size)
            .finish_non_exhaustive()
    }
}

/// A locked, referenced buffer returned by [`BufferCache::read`].
///
/// The handle owns the buffer's content lock for its whole life: payload
/// access never blocks and never races. Hand it back with
/// [`BufferCache::release`] on the acquiring thread; a handle that is merely
/// dropped keeps its reference and its lock forever.
#[derive(Debug)]
pub struct BufferHandle<'a> {
    cache: &'a BufferCache,
    idx: usize,
    id: BlockId,
}

impl BufferHandle<'_> {
    /// Device id of the cached block.
    pub fn dev(&self) -> u32 {
        self.id.dev
    }

    /// Block number of the cached block.
    pub fn blockno(&self) -> u32 {
        self.id.blockno
    }

    /// The block payload.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not hold the content lock (the
    /// handle was moved to another thread).
    pub fn data(&self) -> &[u8] {
        let slot = &self.cache.slots[self.idx];
        if !slot.content_held_by_current() {
            panic!(
                "data: content lock for dev {} block {} not held by the calling thread",
                self.id.dev, self.id.blockno
            );
        }
        unsafe { slot.payload() }
    }

    /// The block payload, mutably. Changes are not persisted until
    /// [`BufferCache::write`].
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not hold the content lock.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let slot = &self.cache.slots[self.idx];
        if !slot.content_held_by_current() {
            panic!(
                "data_mut: content lock for dev {} block {} not held by the calling thread",
                self.id.dev, self.id.blockno
            );
        }
        unsafe { slot.payload_mut() }
    }
}

/// A reference token keeping a block resident without holding its content
/// lock, returned by [`BufferCache::pin`].
///
/// While the token lives, the block's buffer is never recycled, so a
/// multi-step operation can release and re-acquire the block between steps
/// and keep addressing the same buffer. Drop the reference with
/// [`BufferCache::unpin`]; a token that is merely dropped keeps the block
/// pinned forever.
#[derive(Debug)]
pub struct PinnedBlock<'a> {
    cache: &'a BufferCache,
    idx: usize,
    id: BlockId,
}

impl PinnedBlock<'_> {
    /// Device id of the pinned block.
    pub fn dev(&self) -> u32 {
        self.id.dev
    }

    /// Block number of the pinned block.
    pub fn blockno(&self) -> u32 {
        self.id.blockno
    }
}
