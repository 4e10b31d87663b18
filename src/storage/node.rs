//! Weighted storage node
//!
//! Pairs a driver with the immutable name and weight an external router
//! selects on, and remembers the most recent [`Stat`].

use std::fmt;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{info, instrument};

use super::{DriverResult, EmbeddedStorage, KvDriver, MemoryStorage, RemoteBlobStorage, Stat};
use crate::config::{StorageConfig, StorageKind};
use crate::error::{Error, Result};

/// Named, weighted backend
pub struct StorageNode {
    name: String,
    weight: u64,
    offline: bool,
    driver: Box<dyn KvDriver>,
    last_stat: RwLock<Stat>,
}

impl StorageNode {
    /// Wrap a driver. Weight must be positive.
    pub fn new(name: impl Into<String>, weight: u64, driver: Box<dyn KvDriver>) -> Result<Self> {
        let name = name.into();
        if weight == 0 {
            return Err(Error::Config(format!(
                "storage node {} has zero weight",
                name
            )));
        }

        Ok(Self {
            name,
            weight,
            offline: false,
            driver,
            last_stat: RwLock::new(Stat::default()),
        })
    }

    /// Build the backend named by `config.kind`
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        config.validate()?;

        let driver: Box<dyn KvDriver> = match config.kind {
            StorageKind::Memory => Box::new(MemoryStorage::new()),
            StorageKind::Embedded => {
                let path = config.path.as_ref().ok_or_else(|| {
                    Error::Config(format!("embedded storage node {} needs a path", config.name))
                })?;
                Box::new(EmbeddedStorage::open(path, &config.name)?)
            }
            StorageKind::Remote => Box::new(RemoteBlobStorage::from_config(config)?),
        };

        info!(
            node = %config.name,
            kind = driver.kind(),
            weight = config.weight,
            offline = config.offline,
            "storage node ready"
        );

        let mut node = Self::new(config.name.clone(), config.weight, driver)?;
        node.offline = config.offline;
        Ok(node)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> u64 {
        self.weight
    }

    /// Offline nodes keep serving reads but should not take new objects
    pub fn is_offline(&self) -> bool {
        self.offline
    }

    pub fn driver(&self) -> &dyn KvDriver {
        self.driver.as_ref()
    }

    pub async fn put(&self, key: &str, value: Bytes) -> DriverResult<()> {
        self.driver.put(key, value).await
    }

    pub async fn get(&self, key: &str) -> DriverResult<Bytes> {
        self.driver.get(key).await
    }

    pub async fn delete(&self, key: &str) -> DriverResult<()> {
        self.driver.delete(key).await
    }

    /// Query the backend and remember the result
    #[instrument(skip(self), fields(node = %self.name))]
    pub async fn refresh_stat(&self) -> Stat {
        let stat = self.driver.stat().await;
        *self.last_stat.write() = stat.clone();
        stat
    }

    /// Same as [`refresh_stat`](Self::refresh_stat)
    pub async fn stat(&self) -> Stat {
        self.refresh_stat().await
    }

    /// Most recent stat without touching the backend
    pub fn last_stat(&self) -> Stat {
        self.last_stat.read().clone()
    }
}

impl fmt::Display for StorageNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(w:{},o:{})",
            self.name,
            self.weight,
            self.last_stat.read().object_count
        )
    }
}

impl fmt::Debug for StorageNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageNode")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .field("offline", &self.offline)
            .field("kind", &self.driver.kind())
            .finish()
    }
}
