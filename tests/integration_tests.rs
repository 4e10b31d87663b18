//! tiercache Integration Tests
//!
//! Exercises the public surface end to end:
//! - Storage nodes built from YAML configuration
//! - Disk caches populated from a storage node
//! - Token bucket pacing
//! - Arena-backed RAM cache

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tempfile::TempDir;

// =============================================================================
// Storage
// =============================================================================

mod storage_tests {
    use super::*;
    use tiercache::config::Config;
    use tiercache::{DriverError, StorageNode};

    #[tokio::test]
    async fn test_nodes_from_yaml() {
        let dir = TempDir::new().unwrap();
        let yaml = format!(
            r#"
storage:
  - name: ram
    type: memory
    weight: 2
  - name: disk
    type: embedded
    path: {}
    offline: true
"#,
            dir.path().join("nodes.redb").display()
        );
        let config = Config::from_yaml(&yaml).unwrap();
        let nodes: Vec<StorageNode> = config
            .storage
            .iter()
            .map(|c| StorageNode::from_config(c).unwrap())
            .collect();

        assert_eq!(nodes[0].to_string(), "ram(w:2,o:0)");
        assert!(nodes[1].is_offline());
        assert_eq!(nodes[1].driver().kind(), "embedded");

        for node in &nodes {
            node.put("k", Bytes::from_static(b"v")).await.unwrap();
            assert_eq!(node.get("k").await.unwrap(), Bytes::from_static(b"v"));
            node.delete("k").await.unwrap();
            assert_eq!(node.get("k").await, Err(DriverError::NotFound));
            node.delete("k").await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_stat_refresh_is_cached() {
        let config = Config::from_yaml("storage:\n  - name: ram\n    type: memory\n").unwrap();
        let node = StorageNode::from_config(&config.storage[0]).unwrap();

        node.put("a", Bytes::from(vec![0u8; 10])).await.unwrap();
        assert!(node.last_stat().updated_at.is_none());

        let stat = node.refresh_stat().await;
        assert_eq!(stat.object_count, 1);
        assert_eq!(node.last_stat().object_count, 1);
        assert!(node.last_stat().error.is_none());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let yaml = "storage:\n  - name: a\n    type: memory\n  - name: a\n    type: memory\n";
        assert!(Config::from_yaml(yaml).is_err());
    }
}

// =============================================================================
// Disk caches
// =============================================================================

mod disk_cache_tests {
    use super::*;
    use tiercache::config::{GenerationalConfig, QuotaConfig, StorageKind, StorageConfig};
    use tiercache::{GenerationalCache, QuotaCache, StorageNode};

    async fn origin() -> Arc<StorageNode> {
        let node = StorageNode::from_config(&StorageConfig::new("origin", StorageKind::Memory))
            .unwrap();
        for i in 0..20 {
            node.put(&format!("obj-{}", i), Bytes::from(format!("body {}", i)))
                .await
                .unwrap();
        }
        Arc::new(node)
    }

    #[tokio::test]
    async fn test_generational_cache_over_storage_node() {
        let dir = TempDir::new().unwrap();
        let node = origin().await;
        let fetches = Arc::new(AtomicUsize::new(0));

        let populate = {
            let node = Arc::clone(&node);
            let fetches = Arc::clone(&fetches);
            move |key: String, dest: std::path::PathBuf| {
                let node = Arc::clone(&node);
                let fetches = Arc::clone(&fetches);
                async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    let data = node.get(&key).await?;
                    tokio::fs::write(dest, &data).await?;
                    Ok::<(), anyhow::Error>(())
                }
            }
        };

        let config = GenerationalConfig {
            root: dir.path().join("gen"),
            max_files: 5,
            purge_interval: Duration::from_secs(3600),
        };
        let cache = GenerationalCache::new(&config, populate).await.unwrap();

        for i in 0..10 {
            let file = cache.open(&format!("obj-{}", i)).await.unwrap();
            assert_eq!(file.read_to_end().await.unwrap(), format!("body {}", i).into_bytes());
            file.close().await.unwrap();
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 10);

        // reopening hits disk
        let file = cache.open("obj-3").await.unwrap();
        file.close().await.unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 10);

        // missing origin key surfaces as a populate failure
        let err = cache.open("absent").await.unwrap_err();
        assert!(err.to_string().contains("absent"));

        let first = cache.purge_once().unwrap();
        assert!(first.flipped);
        let second = cache.purge_once().unwrap();
        assert_eq!(second.cold_files, 10);
        assert_eq!(second.evicted, 5);

        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_quota_cache_over_storage_node() {
        let dir = TempDir::new().unwrap();
        let node = origin().await;
        let config = QuotaConfig {
            root: dir.path().join("quota"),
            shard_count: 8,
            max_bytes: 1 << 20,
            safety_factor: 0.9,
            watch_interval: Duration::from_secs(3600),
        };
        let cache = QuotaCache::new(&config).await.unwrap();

        for _ in 0..2 {
            for i in 0..20 {
                let key = format!("obj-{}", i);
                let node = Arc::clone(&node);
                let data = cache
                    .fetch(&key, move |key| async move {
                        Ok::<Bytes, anyhow::Error>(node.get(&key).await?)
                    })
                    .await
                    .unwrap();
                assert_eq!(data, Bytes::from(format!("body {}", i)));
            }
        }

        assert_eq!(cache.metrics().misses(), 20);
        assert_eq!(cache.metrics().hits(), 20);
        assert!((cache.hit_rate() - 0.5).abs() < f64::EPSILON);

        let report = cache.watch_once().unwrap();
        assert!(!report.purged);
        cache.shutdown().await;
    }
}

// =============================================================================
// Rate limiting
// =============================================================================

mod limiter_tests {
    use super::*;
    use tiercache::TokenBucket;

    #[tokio::test]
    async fn test_bucket_paces_callers() {
        let bucket: Arc<TokenBucket> = Arc::new("100x1/100".parse().unwrap());
        let start = Instant::now();

        // 100 from the initial fill, then 50 more at 100/s
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                tokio::spawn(async move { bucket.consume(50).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(400), "took {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let bucket: TokenBucket = "".parse().unwrap();
        assert!(bucket.is_unlimited());
        let start = Instant::now();
        for _ in 0..100 {
            assert!(bucket.consume(1 << 30).await);
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}

// =============================================================================
// Arena
// =============================================================================

mod arena_tests {
    use tiercache::alloc::{Arena, ArenaCache};

    #[test]
    fn test_arena_fills_and_drains() {
        let mut arena = Arena::with_block_size(4, 16);
        let mut handles = Vec::new();
        while let Some((handle, buf)) = arena.alloc(16) {
            buf.fill(handles.len() as u8);
            handles.push(handle);
        }
        assert_eq!(handles.len(), 16);
        assert_eq!(arena.free_units(), 0);

        for (i, handle) in handles.iter().enumerate() {
            assert!(arena.get(handle).iter().all(|&b| b == i as u8));
        }
        for handle in handles {
            arena.free(handle);
        }
        assert_eq!(arena.blocks().len(), 1);
        assert_eq!(arena.used_units(), 0);
    }

    #[test]
    fn test_arena_cache_round_trip() {
        let cache = ArenaCache::new(4, 8, 64);
        assert!(cache.put("alpha", b"first"));
        assert!(cache.put("beta", &[7u8; 300]));
        assert_eq!(cache.get("alpha").unwrap().as_ref(), b"first");
        assert_eq!(cache.get("beta").unwrap().len(), 300);
        assert!(cache.remove("alpha"));
        assert!(cache.get("alpha").is_none());
        assert_eq!(cache.len(), 1);
    }
}
