//! Embedded database backend
//!
//! One `redb` file per node; objects live in a table named after the node.
//! redb holds an exclusive lock on the file, so a path can back only one
//! open node per process. redb calls are synchronous and run on the
//! blocking pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use redb::{Database, ReadableTableMetadata, TableDefinition, TableError};
use tracing::{debug, warn};

use super::{DriverResult, KvDriver, Stat};
use crate::error::{DriverError, Error, Result};

fn table(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

/// redb-backed key/value backend
pub struct EmbeddedStorage {
    db: Arc<Database>,
    table: Arc<str>,
    path: PathBuf,
}

impl std::fmt::Debug for EmbeddedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedStorage")
            .field("table", &self.table)
            .field("path", &self.path)
            .finish()
    }
}

impl EmbeddedStorage {
    /// Open or create the database file and bind to table `name`
    pub fn open(path: impl AsRef<Path>, name: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(&path).map_err(|e| {
            Error::Driver(DriverError::dead(format!(
                "failed to open {}: {}",
                path.display(),
                e
            )))
        })?;
        debug!(path = %path.display(), table = name, "opened embedded storage");

        Ok(Self {
            db: Arc::new(db),
            table: Arc::from(name),
            path,
        })
    }

    /// Run a synchronous database closure on the blocking pool
    async fn blocking<T, F>(&self, f: F) -> DriverResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database, &str) -> DriverResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let table = Arc::clone(&self.table);
        tokio::task::spawn_blocking(move || f(&db, &table))
            .await
            .map_err(DriverError::dead)?
    }
}

#[async_trait]
impl KvDriver for EmbeddedStorage {
    async fn put(&self, key: &str, value: Bytes) -> DriverResult<()> {
        let key = key.to_string();
        self.blocking(move |db, name| {
            let txn = db.begin_write().map_err(DriverError::dead)?;
            {
                let mut t = txn.open_table(table(name)).map_err(DriverError::dead)?;
                t.insert(key.as_str(), &value[..])
                    .map_err(DriverError::dead)?;
            }
            txn.commit().map_err(DriverError::dead)
        })
        .await
    }

    async fn get(&self, key: &str) -> DriverResult<Bytes> {
        let key = key.to_string();
        self.blocking(move |db, name| {
            let txn = db.begin_read().map_err(DriverError::dead)?;
            let t = match txn.open_table(table(name)) {
                Ok(t) => t,
                Err(TableError::TableDoesNotExist(_)) => return Err(DriverError::NotFound),
                Err(e) => return Err(DriverError::dead(e)),
            };
            match t.get(key.as_str()).map_err(DriverError::dead)? {
                Some(v) => Ok(Bytes::copy_from_slice(v.value())),
                None => Err(DriverError::NotFound),
            }
        })
        .await
    }

    async fn delete(&self, key: &str) -> DriverResult<()> {
        let key = key.to_string();
        self.blocking(move |db, name| {
            let txn = db.begin_write().map_err(DriverError::dead)?;
            {
                let mut t = txn.open_table(table(name)).map_err(DriverError::dead)?;
                t.remove(key.as_str()).map_err(DriverError::dead)?;
            }
            txn.commit().map_err(DriverError::dead)
        })
        .await
    }

    async fn stat(&self) -> Stat {
        let start = Instant::now();
        let path = self.path.clone();
        let counted = self
            .blocking(move |db, name| {
                let file_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                let txn = db.begin_read().map_err(DriverError::dead)?;
                let count = match txn.open_table(table(name)) {
                    Ok(t) => t.len().map_err(DriverError::dead)?,
                    Err(TableError::TableDoesNotExist(_)) => 0,
                    Err(e) => return Err(DriverError::dead(e)),
                };
                Ok((count, file_bytes))
            })
            .await;

        let mut stat = Stat {
            ping_millis: start.elapsed().as_millis() as u64,
            updated_at: Some(Utc::now()),
            ..Stat::default()
        };

        match counted {
            Ok((count, file_bytes)) => {
                stat.object_count = count;
                stat.used_bytes = file_bytes;
            }
            Err(e) => {
                warn!(table = %self.table, error = %e, "embedded stat failed");
                stat.error = Some(e.to_string());
            }
        }
        stat
    }

    fn kind(&self) -> &'static str {
        "embedded"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_table_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = EmbeddedStorage::open(dir.path().join("db.redb"), "node-a").unwrap();
        assert_matches!(store.get("k").await, Err(DriverError::NotFound));
        assert_eq!(store.stat().await.object_count, 0);
    }

    #[tokio::test]
    async fn test_round_trip_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = EmbeddedStorage::open(dir.path().join("db.redb"), "node-a").unwrap();

        store.put("k", Bytes::from_static(b"value")).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Bytes::from_static(b"value"));
        assert_matches!(store.get("other").await, Err(DriverError::NotFound));
        let stat = store.stat().await;
        assert_eq!(stat.object_count, 1);
        assert!(stat.used_bytes > 0);
        assert!(stat.error.is_none());

        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert_matches!(store.get("k").await, Err(DriverError::NotFound));
    }

    #[tokio::test]
    async fn test_delete_before_any_put() {
        let dir = TempDir::new().unwrap();
        let store = EmbeddedStorage::open(dir.path().join("nested/db.redb"), "n").unwrap();
        store.delete("nothing").await.unwrap();
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.redb");
        {
            let store = EmbeddedStorage::open(&path, "n").unwrap();
            store.put("k", Bytes::from_static(b"persisted")).await.unwrap();
        }
        let store = EmbeddedStorage::open(&path, "n").unwrap();
        assert_eq!(store.get("k").await.unwrap(), Bytes::from_static(b"persisted"));
    }
}
