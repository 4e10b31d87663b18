//! Quota Disk Cache
//!
//! Byte-budgeted cache spread over a fixed number of shard directories.
//!
//! # Layout
//!
//! ```text
//! root/
//!   0/  1/  2/ ... <shard_count - 1>/
//!        └── <hex of sha1(key)[1..]>
//! ```
//!
//! The shard index is the first two digest bytes (big-endian) modulo the
//! shard count.
//!
//! # Size control
//!
//! Directory walks are expensive, so the watcher measures one random shard
//! per cycle and extrapolates. When the estimate exceeds
//! `max_bytes * safety_factor`, every shard drops random files until it has
//! shed the sampled shard's excess over its share of the budget.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use sha1::{Digest, Sha1};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::singleflight::SingleFlight;
use super::CacheMetrics;
use crate::config::QuotaConfig;
use crate::error::{Error, Result};

/// Prefix of files still being written by `put`
const TMP_PREFIX: &str = ".tmp-";

/// Outcome of one watcher cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WatchReport {
    pub sampled_shard: usize,
    pub measured_bytes: u64,
    /// `measured_bytes * shard_count`
    pub estimated_bytes: u64,
    /// `max_bytes * safety_factor`
    pub target_bytes: u64,
    pub purged: bool,
    pub evicted_files: usize,
    pub evicted_bytes: u64,
}

struct Inner {
    root: PathBuf,
    shard_count: usize,
    max_bytes: u64,
    safety_factor: f64,
    flights: SingleFlight<Bytes>,
    metrics: CacheMetrics,
}

/// Sharded on-disk cache with a byte budget
pub struct QuotaCache {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl QuotaCache {
    /// Create every shard directory and start the watcher.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn new(config: &QuotaConfig) -> Result<Self> {
        config.validate()?;

        let root = config.root.clone();
        let shard_count = config.shard_count;
        tokio::task::spawn_blocking(move || -> Result<()> {
            for shard in 0..shard_count {
                std::fs::create_dir_all(root.join(shard.to_string()))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::Internal(format!("shard setup task failed: {}", e)))??;

        let inner = Arc::new(Inner {
            root: config.root.clone(),
            shard_count: config.shard_count,
            max_bytes: config.max_bytes,
            safety_factor: config.safety_factor,
            flights: SingleFlight::new(),
            metrics: CacheMetrics::new(),
        });

        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(Self::run_watcher(
            Arc::clone(&inner),
            config.watch_interval,
            cancel.clone(),
        ));

        info!(
            root = %config.root.display(),
            shards = config.shard_count,
            max_bytes = config.max_bytes,
            "quota cache started"
        );

        Ok(Self {
            inner,
            cancel,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    /// Shard index and file path for `key`
    pub fn location(&self, key: &str) -> (usize, PathBuf) {
        self.inner.location(key)
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn shard_count(&self) -> usize {
        self.inner.shard_count
    }

    /// Store `value`, replacing any previous one. Readers never see a
    /// partially written file.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.inner.put(key, value).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.inner.get(key).await
    }

    /// Remove a key, returning whether it was present
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let (_, path) = self.inner.location(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Read-through lookup.
    ///
    /// On a miss `getter` runs once per key no matter how many callers are
    /// waiting; its bytes are written back and returned to all of them. A
    /// failed write-back is logged and does not fail the call.
    #[instrument(skip(self, getter))]
    pub async fn fetch<F, Fut>(&self, key: &str, getter: F) -> Result<Bytes>
    where
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        if let Some(hit) = self.inner.get(key).await? {
            self.inner.metrics.record_hit();
            return Ok(hit);
        }

        let inner = Arc::clone(&self.inner);
        let owned = key.to_string();
        self.inner
            .flights
            .run(key, move || async move { inner.fetch_miss(owned, getter).await })
            .await
    }

    /// Fraction of `fetch` calls served from disk
    pub fn hit_rate(&self) -> f64 {
        self.inner.metrics.hit_ratio()
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.inner.metrics
    }

    /// Run one watcher cycle on the calling thread
    pub fn watch_once(&self) -> Result<WatchReport> {
        self.inner.watch_once()
    }

    /// Stop the watcher and wait for it to exit
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.watcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "quota watcher ended abnormally");
            }
        }
    }

    async fn run_watcher(inner: Arc<Inner>, every: Duration, cancel: CancellationToken) {
        let mut tick = interval_at(tokio::time::Instant::now() + every, every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(root = %inner.root.display(), "quota watcher stopping");
                    break;
                }
                _ = tick.tick() => {
                    let cycle = Arc::clone(&inner);
                    match tokio::task::spawn_blocking(move || cycle.watch_once()).await {
                        Ok(Ok(report)) => debug!(?report, "watch cycle finished"),
                        Ok(Err(e)) => error!(root = %inner.root.display(), "watch cycle failed: {}", e),
                        Err(e) => error!(root = %inner.root.display(), "watch cycle panicked: {}", e),
                    }
                }
            }
        }
    }
}

impl Drop for QuotaCache {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Inner {
    fn location(&self, key: &str) -> (usize, PathBuf) {
        let digest = Sha1::digest(key.as_bytes());
        let shard = u16::from_be_bytes([digest[0], digest[1]]) as usize % self.shard_count;
        let name: String = digest[1..].iter().map(|b| format!("{:02x}", b)).collect();
        (shard, self.root.join(shard.to_string()).join(name))
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let (_, path) = self.location(key);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let (_, path) = self.location(key);
        let dir = path
            .parent()
            .ok_or_else(|| Error::Internal(format!("cache path {} has no parent", path.display())))?;
        // shard directories can be removed from under us
        tokio::fs::create_dir_all(dir).await?;

        let tmp = dir.join(format!("{}{:016x}", TMP_PREFIX, rand::thread_rng().gen::<u64>()));
        if let Err(e) = tokio::fs::write(&tmp, value).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn fetch_miss<F, Fut>(&self, key: String, getter: F) -> Result<Bytes>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = anyhow::Result<Bytes>>,
    {
        // a flight that just finished may already have written the file
        if let Some(hit) = self.get(&key).await? {
            self.metrics.record_hit();
            return Ok(hit);
        }

        self.metrics.record_miss();
        let start = Instant::now();
        let data = match getter(key.clone()).await {
            Ok(data) => data,
            Err(source) => {
                self.metrics.record_populate_failure();
                return Err(Error::Populate { key, source });
            }
        };
        self.metrics.record_populate(start.elapsed());

        if let Err(e) = self.put(&key, &data).await {
            warn!(key = %key, error = %e, "failed to write fetched value to cache");
        }
        Ok(data)
    }

    fn shard_dir(&self, shard: usize) -> PathBuf {
        self.root.join(shard.to_string())
    }

    fn watch_once(&self) -> Result<WatchReport> {
        let shard = rand::thread_rng().gen_range(0..self.shard_count);
        let measured = dir_size(&self.shard_dir(shard));

        let target = (self.max_bytes as f64 * self.safety_factor) as u64;
        let mut report = WatchReport {
            sampled_shard: shard,
            measured_bytes: measured,
            estimated_bytes: measured.saturating_mul(self.shard_count as u64),
            target_bytes: target,
            ..WatchReport::default()
        };

        info!(
            shard,
            measured_bytes = measured,
            estimated_bytes = report.estimated_bytes,
            "quota cache survey"
        );

        let share = target / self.shard_count as u64;
        if measured > share {
            let (files, bytes) = self.purge(measured - share);
            report.purged = true;
            report.evicted_files = files;
            report.evicted_bytes = bytes;
        }
        Ok(report)
    }

    /// Remove random files from every shard until each has shed `amount`
    /// bytes or is empty. Returns (files, bytes) removed.
    fn purge(&self, amount: u64) -> (usize, u64) {
        info!(amount, "quota cache purge");
        let start = Instant::now();
        let mut total_names = 0;
        let mut evicted_files = 0;
        let mut evicted_bytes = 0;
        let mut rng = rand::thread_rng();

        for shard in 0..self.shard_count {
            let dir = self.shard_dir(shard);
            let mut names: Vec<_> = match std::fs::read_dir(&dir) {
                Ok(entries) => entries
                    .filter_map(|e| e.ok())
                    .filter(|e| !is_in_progress(e))
                    .map(|e| e.path())
                    .collect(),
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(dir = %dir.display(), error = %e, "cannot list shard");
                    }
                    continue;
                }
            };
            total_names += names.len();
            names.shuffle(&mut rng);

            let mut remaining = amount;
            for path in names {
                if remaining == 0 {
                    break;
                }
                let size = match std::fs::metadata(&path) {
                    Ok(meta) => meta.len(),
                    Err(_) => continue,
                };
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %path.display(), error = %e, "failed to evict");
                    }
                    continue;
                }
                remaining = remaining.saturating_sub(size);
                evicted_files += 1;
                evicted_bytes += size;
                self.metrics.record_eviction(size);
            }
        }

        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            names = total_names,
            evicted_files,
            "quota cache purge finished"
        );
        (evicted_files, evicted_bytes)
    }
}

fn is_in_progress(entry: &std::fs::DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with(TMP_PREFIX)
}

/// Sum of regular file sizes directly under `dir`, excluding in-progress
/// writes; unreadable entries count 0
fn dir_size(dir: &Path) -> u64 {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| !is_in_progress(e))
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

// =============================================================================
// Tests
// =============================================================================
