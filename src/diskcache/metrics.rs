//! Cache Metrics Collection
//!
//! Counters shared by the disk caches and the arena cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,

    // Populate-on-miss
    populates: AtomicU64,
    populate_failures: AtomicU64,

    // Aging
    promotions: AtomicU64,
    generation_flips: AtomicU64,

    // Eviction
    evictions: AtomicU64,
    evicted_bytes: AtomicU64,

    // Populate latency (microseconds, exponential moving average)
    populate_latency_us: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    // Populate tracking
    pub fn record_populate(&self, duration: Duration) {
        self.populates.fetch_add(1, Ordering::Relaxed);
        self.update_latency_ema(&self.populate_latency_us, duration);
    }

    pub fn record_populate_failure(&self) {
        self.populate_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn populates(&self) -> u64 {
        self.populates.load(Ordering::Relaxed)
    }

    pub fn populate_failures(&self) -> u64 {
        self.populate_failures.load(Ordering::Relaxed)
    }

    pub fn populate_latency(&self) -> Duration {
        Duration::from_micros(self.populate_latency_us.load(Ordering::Relaxed))
    }

    fn update_latency_ema(&self, target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    // Aging
    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_generation_flip(&self) {
        self.generation_flips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::Relaxed)
    }

    pub fn generation_flips(&self) -> u64 {
        self.generation_flips.load(Ordering::Relaxed)
    }

    // Eviction
    pub fn record_eviction(&self, bytes: u64) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.evicted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn evicted_bytes(&self) -> u64 {
        self.evicted_bytes.load(Ordering::Relaxed)
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            populates: self.populates(),
            populate_failures: self.populate_failures(),
            populate_latency: self.populate_latency(),
            promotions: self.promotions(),
            generation_flips: self.generation_flips(),
            evictions: self.evictions(),
            evicted_bytes: self.evicted_bytes(),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.populates.store(0, Ordering::Relaxed);
        self.populate_failures.store(0, Ordering::Relaxed);
        self.promotions.store(0, Ordering::Relaxed);
        self.generation_flips.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.evicted_bytes.store(0, Ordering::Relaxed);
        self.populate_latency_us.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,

    pub populates: u64,
    pub populate_failures: u64,
    pub populate_latency: Duration,

    pub promotions: u64,
    pub generation_flips: u64,

    pub evictions: u64,
    pub evicted_bytes: u64,
}

// =============================================================================
// Tests
// =============================================================================
