//! In-memory backend
//!
//! DashMap-backed store for tests and for small hot data sets.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;

use super::{DriverResult, KvDriver, Stat};
use crate::error::DriverError;

/// In-memory key/value backend
#[derive(Debug, Default)]
pub struct MemoryStorage {
    storage: DashMap<String, Bytes>,
    object_count: AtomicU64,
    total_bytes: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Counts of (reads, writes, deletes) served
    pub fn op_counts(&self) -> (u64, u64, u64) {
        (
            self.reads.load(Ordering::Relaxed),
            self.writes.load(Ordering::Relaxed),
            self.deletes.load(Ordering::Relaxed),
        )
    }
}

#[async_trait]
impl KvDriver for MemoryStorage {
    async fn put(&self, key: &str, value: Bytes) -> DriverResult<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);

        let size = value.len() as u64;
        match self.storage.insert(key.to_string(), value) {
            Some(old) => {
                let old_size = old.len() as u64;
                if size > old_size {
                    self.total_bytes.fetch_add(size - old_size, Ordering::Relaxed);
                } else {
                    self.total_bytes.fetch_sub(old_size - size, Ordering::Relaxed);
                }
            }
            None => {
                self.object_count.fetch_add(1, Ordering::Relaxed);
                self.total_bytes.fetch_add(size, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> DriverResult<Bytes> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.storage
            .get(key)
            .map(|v| v.value().clone())
            .ok_or(DriverError::NotFound)
    }

    async fn delete(&self, key: &str) -> DriverResult<()> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        if let Some((_, data)) = self.storage.remove(key) {
            self.object_count.fetch_sub(1, Ordering::Relaxed);
            self.total_bytes.fetch_sub(data.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn stat(&self) -> Stat {
        Stat {
            used_bytes: self.total_bytes.load(Ordering::Relaxed),
            object_count: self.object_count.load(Ordering::Relaxed),
            updated_at: Some(Utc::now()),
            ..Stat::default()
        }
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}
