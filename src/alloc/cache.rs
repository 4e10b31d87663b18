//! Arena-Backed Sharded Cache
//!
//! In-process byte cache whose values live inside buddy arenas instead of
//! individually heap-allocated buffers.
//!
//! # Design
//!
//! - One [`Arena`] per shard, each behind its own mutex
//! - Key hash picks the shard, so unrelated keys rarely contend
//! - When a shard's arena is full, pseudo-random entries of that shard are
//!   evicted until the new value fits

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use tracing::trace;

use super::arena::{Arena, BlockHandle};
use crate::config::ArenaConfig;
use crate::diskcache::CacheMetrics;
use crate::error::Result;

/// Single shard: an arena plus the key index into it
struct ArenaShard {
    arena: Arena,
    entries: HashMap<String, BlockHandle>,
    /// Bytes of live values (requested lengths, not block sizes)
    size_bytes: u64,
}

impl ArenaShard {
    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(handle) => {
                self.size_bytes -= handle.len() as u64;
                self.arena.free(handle);
                true
            }
            None => false,
        }
    }

    /// Evict one pseudo-random entry, returning its length
    fn evict_one(&mut self) -> Option<u64> {
        let victim = self.entries.keys().choose(&mut rand::thread_rng())?.clone();
        trace!(key = %victim, "evicting arena cache entry");
        let handle = self.entries.remove(&victim)?;
        let len = handle.len() as u64;
        self.size_bytes -= len;
        self.arena.free(handle);
        Some(len)
    }
}

/// Sharded in-memory cache storing values in arena blocks
pub struct ArenaCache {
    shards: Box<[Mutex<ArenaShard>]>,
    metrics: CacheMetrics,
    writes: AtomicU64,
}

impl ArenaCache {
    /// Create a cache of `shard_count` shards, each an arena of
    /// `2^order` units of `block_size` bytes
    pub fn new(shard_count: usize, order: u32, block_size: usize) -> Self {
        assert!(shard_count > 0, "shard count must be positive");
        let shards = (0..shard_count)
            .map(|_| {
                Mutex::new(ArenaShard {
                    arena: Arena::with_block_size(order, block_size),
                    entries: HashMap::new(),
                    size_bytes: 0,
                })
            })
            .collect();

        Self {
            shards,
            metrics: CacheMetrics::new(),
            writes: AtomicU64::new(0),
        }
    }

    /// Build from the `arena` config section
    pub fn from_config(config: &ArenaConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config.shards, config.order, config.block_size))
    }

    /// Get the shard count
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Store a value, replacing any previous one.
    ///
    /// Returns `false` if the value cannot fit in an empty shard arena.
    pub fn put(&self, key: &str, value: &[u8]) -> bool {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut shard = self.shards[self.shard_index(key)].lock();

        if value.len() > shard.arena.capacity() {
            return false;
        }

        shard.remove(key);

        loop {
            if let Some((handle, buf)) = shard.arena.alloc(value.len()) {
                buf.copy_from_slice(value);
                shard.size_bytes += value.len() as u64;
                shard.entries.insert(key.to_string(), handle);
                return true;
            }

            match shard.evict_one() {
                Some(bytes) => self.metrics.record_eviction(bytes),
                None => return false,
            }
        }
    }

    /// Copy a value out of the cache
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let shard = self.shards[self.shard_index(key)].lock();
        match shard.entries.get(key) {
            Some(handle) => {
                self.metrics.record_hit();
                Some(Bytes::copy_from_slice(shard.arena.get(handle)))
            }
            None => {
                self.metrics.record_miss();
                None
            }
        }
    }

    /// Remove a value, returning whether it was present
    pub fn remove(&self, key: &str) -> bool {
        self.shards[self.shard_index(key)].lock().remove(key)
    }

    /// Check if a key exists
    pub fn contains(&self, key: &str) -> bool {
        self.shards[self.shard_index(key)]
            .lock()
            .entries
            .contains_key(key)
    }

    /// Total number of entries across all shards
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().entries.len()).sum()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes of stored values
    pub fn size_bytes(&self) -> u64 {
        self.shards.iter().map(|s| s.lock().size_bytes).sum()
    }

    /// Total put calls
    pub fn total_writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Hit/miss/eviction counters
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }
}

// =============================================================================
// Tests
// =============================================================================
