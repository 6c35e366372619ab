//! Hash shards: the buckets of the cache's open hash table.
//!
//! Each shard owns a recency-ordered list of slot indices into the cache's
//! arena (front = least recently inserted, back = most recently inserted)
//! and is protected by one `parking_lot::Mutex` at the cache level. The
//! shard guards only list membership; slot payloads have their own locks.

use crate::slot::{BlockId, BufferSlot};
use std::collections::VecDeque;

/// Routes a block identity to its home shard.
///
/// Spreads independent lookups across independent structural locks so that
/// unrelated blocks never contend.
pub(crate) fn shard_of(id: BlockId, shard_count: usize) -> usize {
    ((id.dev as u64 + id.blockno as u64) % shard_count as u64) as usize
}

/// One bucket of the hash table: an ordered list of arena indices.
#[derive(Debug, Default)]
pub(crate) struct Shard {
    list: VecDeque<usize>,
}

impl Shard {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Finds the slot currently caching `packed`, if any.
    pub(crate) fn find(&self, packed: u64, slots: &[BufferSlot]) -> Option<usize> {
        self.list.iter().copied().find(|&idx| slots[idx].id_packed() == packed)
    }

    /// Unlinks and returns a slot that has never cached a block, if this
    /// shard has one.
    pub(crate) fn take_unassigned(&mut self, slots: &[BufferSlot]) -> Option<usize> {
        let pos = self.list.iter().position(|&idx| slots[idx].is_unassigned())?;
        self.list.remove(pos)
    }

    /// Unlinks a specific slot. Returns false if the slot is not listed
    /// here (it moved or was recycled since the caller last looked).
    pub(crate) fn unlink(&mut self, idx: usize) -> bool {
        match self.list.iter().position(|&i| i == idx) {
            Some(pos) => {
                self.list.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Inserts at the most-recently-used end.
    pub(crate) fn push_mru(&mut self, idx: usize) {
        self.list.push_back(idx);
    }

    /// Inserts at the least-recently-used end.
    pub(crate) fn push_lru(&mut self, idx: usize) {
        self.list.push_front(idx);
    }

    /// Iterates slot indices from the LRU end to the MRU end.
    pub(crate) fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.list.iter().copied()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.list.len()
    }
}
