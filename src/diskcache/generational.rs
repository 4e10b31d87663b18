//! Generational (hot/cold) Disk Cache
//!
//! Files live in one directory as `"0" + key` or `"1" + key`. A generation
//! pointer decides which digit is hot. Instead of per-entry timestamps the
//! cache ages entries by flipping the pointer:
//!
//! ```text
//!   open(key)
//!     hot file exists ──────────────► open it
//!     cold file exists ─ rename ────► hot, open it          (promotion)
//!     neither ─ populate(key, hot) ─► open it               (miss)
//!
//!   purge cycle (every purge_interval)
//!     while files > max_files:
//!       evict a random cold file
//!       no cold files left ─► flip pointer, end cycle
//! ```
//!
//! After a flip, everything that was hot is cold and will be evicted next
//! cycle unless it is opened (and thereby promoted) first.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::fs::File;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::file::CacheFile;
use super::singleflight::SingleFlight;
use super::CacheMetrics;
use crate::config::GenerationalConfig;
use crate::error::{Error, Result};

// =============================================================================
// Populate callback
// =============================================================================

/// Produces the file for a missing key at `dest`
#[async_trait]
pub trait Populate: Send + Sync + 'static {
    async fn populate(&self, key: &str, dest: &Path) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Populate for F
where
    F: Fn(String, PathBuf) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn populate(&self, key: &str, dest: &Path) -> anyhow::Result<()> {
        (self)(key.to_string(), dest.to_path_buf()).await
    }
}

// =============================================================================
// Purge report
// =============================================================================

/// Outcome of one purge cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub hot_files: usize,
    pub cold_files: usize,
    /// Names without a generation digit
    pub invalid_files: usize,
    pub evicted: usize,
    pub flipped: bool,
}

// =============================================================================
// Cache
// =============================================================================

struct Inner {
    root: PathBuf,
    max_files: usize,
    generation: RwLock<u64>,
    populate: Box<dyn Populate>,
    flights: SingleFlight<CacheFile>,
    metrics: CacheMetrics,
}

/// Two-generation disk cache with deduplicated populate-on-miss
pub struct GenerationalCache {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    purger: Mutex<Option<JoinHandle<()>>>,
}

impl GenerationalCache {
    /// Create the cache directory and start the purger.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn new(config: &GenerationalConfig, populate: impl Populate) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.root).await?;

        let inner = Arc::new(Inner {
            root: config.root.clone(),
            max_files: config.max_files,
            generation: RwLock::new(0),
            populate: Box::new(populate),
            flights: SingleFlight::new(),
            metrics: CacheMetrics::new(),
        });

        let cancel = CancellationToken::new();
        let purger = tokio::spawn(Self::run_purger(
            Arc::clone(&inner),
            config.purge_interval,
            cancel.clone(),
        ));

        info!(
            root = %config.root.display(),
            max_files = config.max_files,
            interval = ?config.purge_interval,
            "generational cache started"
        );

        Ok(Self {
            inner,
            cancel,
            purger: Mutex::new(Some(purger)),
        })
    }

    /// Open the file for `key`, promoting or populating it as needed.
    ///
    /// Concurrent calls for one key share a single attempt and receive the
    /// same handle or the same error.
    #[instrument(skip(self), fields(root = %self.inner.root.display()))]
    pub async fn open(&self, key: &str) -> Result<CacheFile> {
        validate_key(key)?;
        let inner = Arc::clone(&self.inner);
        let owned = key.to_string();
        self.inner
            .flights
            .run(key, move || async move { inner.open_uncached(&owned).await })
            .await
    }

    /// Current hot path for `key`, whether or not the file exists
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.inner.paths(key).0
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Generation pointer, incremented on every flip
    pub fn generation(&self) -> u64 {
        *self.inner.generation.read()
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.inner.metrics
    }

    /// Run one purge cycle on the calling thread
    pub fn purge_once(&self) -> Result<PurgeReport> {
        self.inner.purge_once()
    }

    /// Stop the purger and wait for it to exit
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.purger.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "generational purger ended abnormally");
            }
        }
    }

    async fn run_purger(inner: Arc<Inner>, every: Duration, cancel: CancellationToken) {
        let mut tick = interval_at(tokio::time::Instant::now() + every, every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(root = %inner.root.display(), "generational purger stopping");
                    break;
                }
                _ = tick.tick() => {
                    let cycle = Arc::clone(&inner);
                    match tokio::task::spawn_blocking(move || cycle.purge_once()).await {
                        Ok(Ok(report)) if report.evicted > 0 || report.flipped => {
                            debug!(?report, "purge cycle finished");
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!(root = %inner.root.display(), "purge cycle failed: {}", e),
                        Err(e) => error!(root = %inner.root.display(), "purge cycle panicked: {}", e),
                    }
                }
            }
        }
    }
}

impl Drop for GenerationalCache {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Inner {
    /// (hot, cold) paths for `key` under the current generation
    fn paths(&self, key: &str) -> (PathBuf, PathBuf) {
        let generation = *self.generation.read();
        let hot = generation % 2;
        let cold = (generation + 1) % 2;
        (
            self.root.join(format!("{}{}", hot, key)),
            self.root.join(format!("{}{}", cold, key)),
        )
    }

    async fn open_uncached(&self, key: &str) -> Result<CacheFile> {
        let (hot, cold) = self.paths(key);

        match File::open(&hot).await {
            Ok(file) => {
                self.metrics.record_hit();
                return Ok(CacheFile::new(hot, file));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        match tokio::fs::rename(&cold, &hot).await {
            Ok(()) => {
                debug!(key, "promoted cold entry");
                self.metrics.record_hit();
                self.metrics.record_promotion();
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.metrics.record_miss();
                self.populate(key, &hot).await?;
            }
            Err(e) => return Err(e.into()),
        }

        let file = File::open(&hot).await?;
        Ok(CacheFile::new(hot, file))
    }

    async fn populate(&self, key: &str, dest: &Path) -> Result<()> {
        let start = Instant::now();
        match self.populate.populate(key, dest).await {
            Ok(()) => {
                self.metrics.record_populate(start.elapsed());
                Ok(())
            }
            Err(source) => {
                self.metrics.record_populate_failure();
                if let Err(e) = tokio::fs::remove_file(dest).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %dest.display(), error = %e, "failed to remove partial file");
                    }
                }
                warn!(key, error = %source, "populate failed");
                Err(Error::Populate {
                    key: key.to_string(),
                    source,
                })
            }
        }
    }

    fn purge_once(&self) -> Result<PurgeReport> {
        let generation = *self.generation.read();
        let hot = (generation % 2) as usize;
        let cold = ((generation + 1) % 2) as usize;

        let mut files: [Vec<String>; 2] = [Vec::new(), Vec::new()];
        let mut report = PurgeReport::default();

        for entry in std::fs::read_dir(&self.root)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable directory entry");
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            match name.as_bytes().first() {
                Some(b'0') => files[0].push(name),
                Some(b'1') => files[1].push(name),
                _ => report.invalid_files += 1,
            }
        }

        if report.invalid_files > 0 {
            warn!(
                root = %self.root.display(),
                count = report.invalid_files,
                "found files without a generation prefix"
            );
        }

        report.hot_files = files[hot].len();
        report.cold_files = files[cold].len();

        let mut candidates = std::mem::take(&mut files[cold]);
        candidates.shuffle(&mut rand::thread_rng());

        let mut count = report.hot_files + report.cold_files;
        while count > self.max_files {
            let Some(name) = candidates.pop() else {
                *self.generation.write() += 1;
                self.metrics.record_generation_flip();
                report.flipped = true;
                info!(
                    root = %self.root.display(),
                    new_cold = report.hot_files,
                    "hot and cold generations switched"
                );
                break;
            };

            let path = self.root.join(&name);
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            match std::fs::remove_file(&path) {
                Ok(()) => self.metrics.record_eviction(size),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to evict");
                    continue;
                }
            }
            report.evicted += 1;
            count -= 1;
        }

        if report.evicted > 0 {
            info!(root = %self.root.display(), evicted = report.evicted, "purged cold files");
        }
        Ok(report)
    }
}

/// Keys become file names; reject anything that would escape the directory
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains(['/', '\\', '\0']) || key == "." || key == ".." {
        return Err(Error::InvalidKey(key.to_string()));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn config(dir: &TempDir, max_files: usize) -> GenerationalConfig {
        GenerationalConfig {
            root: dir.path().join("cache"),
            max_files,
            // long enough that tests drive purging by hand
            purge_interval: Duration::from_secs(3600),
        }
    }

    /// Populate that writes the key as the file body and counts calls
    fn writer(calls: Arc<AtomicUsize>) -> impl Populate {
        move |key: String, dest: PathBuf| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::fs::write(&dest, key.as_bytes()).await?;
                Ok::<(), anyhow::Error>(())
            }
        }
    }

    fn count_files(root: &Path) -> usize {
        std::fs::read_dir(root).unwrap().count()
    }

    #[tokio::test]
    async fn test_miss_populates_then_hits() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = GenerationalCache::new(&config(&dir, 10), writer(Arc::clone(&calls)))
            .await
            .unwrap();

        let file = cache.open("alpha").await.unwrap();
        assert_eq!(file.read_to_end().await.unwrap(), b"alpha");
        assert_eq!(file.path(), cache.path_for("alpha"));
        assert!(cache.path_for("alpha").ends_with("0alpha"));

        cache.open("alpha").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.metrics().misses(), 1);
        assert_eq!(cache.metrics().hits(), 1);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_opens_populate_once() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let slow = move |key: String, dest: PathBuf| {
            let calls = Arc::clone(&counter);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                tokio::fs::write(&dest, key.as_bytes()).await?;
                Ok::<(), anyhow::Error>(())
            }
        };
        let cache = Arc::new(GenerationalCache::new(&config(&dir, 10), slow).await.unwrap());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.open("shared").await })
            })
            .collect();

        let mut files = Vec::new();
        for handle in handles {
            files.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(files.iter().all(|f| f.same_handle(&files[0])));
        assert_eq!(files[0].read_to_end().await.unwrap(), b"shared");
    }

    #[tokio::test]
    async fn test_populate_failure_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let failing = |_key: String, dest: PathBuf| async move {
            tokio::fs::write(&dest, b"partial").await?;
            Err::<(), anyhow::Error>(anyhow::anyhow!("upstream unavailable"))
        };
        let cache = GenerationalCache::new(&config(&dir, 10), failing).await.unwrap();

        let (a, b) = tokio::join!(cache.open("k"), cache.open("k"));
        for result in [a, b] {
            let err = result.unwrap_err();
            assert_matches!(err.root(), Error::Populate { key, .. } if key == "k");
        }

        assert!(!cache.path_for("k").exists());
        assert_eq!(count_files(cache.root()), 0);
        assert_eq!(cache.metrics().populate_failures(), 1);
    }

    #[tokio::test]
    async fn test_close_shared_handle_once() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = GenerationalCache::new(&config(&dir, 10), writer(calls)).await.unwrap();

        let file = cache.open("k").await.unwrap();
        let clone = file.clone();
        assert!(file.close().await.is_ok());
        assert!(clone.close().await.is_ok());
        assert!(file.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_path_keys() {
        let dir = TempDir::new().unwrap();
        let cache = GenerationalCache::new(&config(&dir, 10), writer(Arc::default()))
            .await
            .unwrap();
        assert_matches!(cache.open("../escape").await, Err(Error::InvalidKey(_)));
        assert_matches!(cache.open("").await, Err(Error::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_purge_converges_after_flip() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = GenerationalCache::new(&config(&dir, 3), writer(Arc::clone(&calls)))
            .await
            .unwrap();

        for i in 0..8 {
            cache.open(&format!("k{}", i)).await.unwrap();
        }
        assert_eq!(count_files(cache.root()), 8);

        // everything is hot: first cycle only flips
        let first = cache.purge_once().unwrap();
        assert!(first.flipped);
        assert_eq!(first.evicted, 0);
        assert_eq!(cache.generation(), 1);

        let second = cache.purge_once().unwrap();
        assert!(!second.flipped);
        assert_eq!(second.evicted, 5);
        assert_eq!(count_files(cache.root()), 3);

        let third = cache.purge_once().unwrap();
        assert_eq!(third, PurgeReport { hot_files: 0, cold_files: 3, ..Default::default() });
    }

    #[tokio::test]
    async fn test_promotion_protects_recent_entries() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = GenerationalCache::new(&config(&dir, 2), writer(Arc::clone(&calls)))
            .await
            .unwrap();

        for key in ["a", "b", "c", "d"] {
            cache.open(key).await.unwrap();
        }
        assert!(cache.purge_once().unwrap().flipped);

        // touching "a" after the flip renames it into the new hot generation
        let file = cache.open("a").await.unwrap();
        assert_eq!(file.read_to_end().await.unwrap(), b"a");
        assert_eq!(cache.metrics().promotions(), 1);
        assert!(cache.path_for("a").ends_with("1a"));

        let report = cache.purge_once().unwrap();
        assert_eq!(report.hot_files, 1);
        assert_eq!(report.evicted, 2);
        assert!(cache.path_for("a").exists());

        // promotion did not re-run populate
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_invalid_names_counted() {
        let dir = TempDir::new().unwrap();
        let cache = GenerationalCache::new(&config(&dir, 10), writer(Arc::default()))
            .await
            .unwrap();
        std::fs::write(cache.root().join("stray.tmp"), b"x").unwrap();

        let report = cache.purge_once().unwrap();
        assert_eq!(report.invalid_files, 1);
        assert!(!report.flipped);
    }

    #[tokio::test]
    async fn test_background_purger_runs() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, 1);
        cfg.purge_interval = Duration::from_secs(1);
        let cache = GenerationalCache::new(&cfg, writer(Arc::default())).await.unwrap();

        for key in ["a", "b", "c"] {
            cache.open(key).await.unwrap();
        }

        // flip on one tick, evict on the next
        tokio::time::sleep(Duration::from_millis(2600)).await;
        assert_eq!(count_files(cache.root()), 1);

        cache.shutdown().await;
        cache.shutdown().await;
    }
}
