//! Configuration options for the buffer cache.

use crate::error::{Error, Result};

/// Configuration options for constructing a [`BufferCache`](crate::BufferCache).
///
/// All values are fixed at construction time; the cache never grows or
/// re-shards at runtime.
#[derive(Debug, Clone)]
pub struct Options {
    /// Total number of buffer slots in the cache.
    /// Default: 30
    pub capacity: usize,

    /// Number of hash shards the slots are distributed over. Each shard
    /// owns its own structural lock, so this is the contention-sharding
    /// factor for independent block lookups.
    /// Default: 13
    pub shard_count: usize,

    /// Size of one block payload in bytes. Every cached block has exactly
    /// this size.
    /// Default: 1024
    pub block_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self { capacity: 30, shard_count: 13, block_size: 1024 }
    }
}

impl Options {
    /// Creates options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the total number of buffer slots.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the number of hash shards.
    pub fn with_shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count;
        self
    }

    /// Sets the block payload size in bytes.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Validates the options, returning an error describing the first
    /// problem found.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::invalid_argument("capacity must be non-zero"));
        }
        if self.shard_count == 0 {
            return Err(Error::invalid_argument("shard_count must be non-zero"));
        }
        if self.block_size == 0 {
            return Err(Error::invalid_argument("block_size must be non-zero"));
        }
        Ok(())
    }
}
