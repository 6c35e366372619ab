//! The block device interface consumed by the cache.
//!
//! The cache does not talk to hardware itself. It is handed an
//! implementation of [`BlockStore`] at construction time and invokes it
//! synchronously, always while holding the target buffer's content lock and
//! never while holding a structural lock.
//!
//! Device failures are not modeled at this layer: an implementation that
//! cannot complete a transfer must panic rather than return corrupt data.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A synchronous block device.
///
/// Both operations block the calling thread until the transfer completes.
/// `buf` always has exactly the cache's configured block size.
pub trait BlockStore: Send + Sync {
    /// Reads the block identified by `(dev, blockno)` into `buf`.
    fn read_block(&self, dev: u32, blockno: u32, buf: &mut [u8]);

    /// Writes `buf` as the new content of the block identified by
    /// `(dev, blockno)`.
    fn write_block(&self, dev: u32, blockno: u32, buf: &[u8]);
}

/// An in-memory [`BlockStore`] backed by a hash map.
///
/// Blocks that have never been written read back as zeroes, like a freshly
/// zeroed disk. The store counts reads and writes, which lets tests and
/// benchmarks observe exactly when the cache goes to the device.
///
/// # Example
///
/// ```rust
/// use bufcache::{BlockStore, MemStore};
///
/// let store = MemStore::new();
/// store.put(0, 7, &[1, 2, 3]);
///
/// let mut buf = [0u8; 8];
/// store.read_block(0, 7, &mut buf);
/// assert_eq!(&buf[..3], &[1, 2, 3]);
/// assert_eq!(store.read_count(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MemStore {
    blocks: Mutex<HashMap<(u32, u32), Vec<u8>>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the content of a block without counting it as a device write.
    pub fn put(&self, dev: u32, blockno: u32, data: &[u8]) {
        self.blocks.lock().insert((dev, blockno), data.to_vec());
    }

    /// Returns the current content of a block without counting it as a
    /// device read, or `None` if the block has never been written.
    pub fn get(&self, dev: u32, blockno: u32) -> Option<Vec<u8>> {
        self.blocks.lock().get(&(dev, blockno)).cloned()
    }

    /// Number of `read_block` calls made so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of `write_block` calls made so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl BlockStore for MemStore {
    fn read_block(&self, dev: u32, blockno: u32, buf: &mut [u8]) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        buf.fill(0);
        if let Some(data) = self.blocks.lock().get(&(dev, blockno)) {
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
        }
    }

    fn write_block(&self, dev: u32, blockno: u32, buf: &[u8]) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.blocks.lock().insert((dev, blockno), buf.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwritten_block_reads_as_zeroes() {
        let store = MemStore::new();
        let mut buf = [0xffu8; 16];
        store.read_block(3, 42, &mut buf);
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let store = MemStore::new();
        let data = [7u8; 16];
        store.write_block(1, 5, &data);

        let mut buf = [0u8; 16];
        store.read_block(1, 5, &mut buf);
        assert_eq!(buf, data);
        assert_eq!(store.read_count(), 1);
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn test_put_and_get_do_not_count() {
        let store = MemStore::new();
        store.put(0, 0, &[1, 2, 3]);
        assert_eq!(store.get(0, 0), Some(vec![1, 2, 3]));
        assert_eq!(store.read_count(), 0);
        assert_eq!(store.write_count(), 0);
    }
}
