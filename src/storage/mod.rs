//! Key/Value Storage Drivers
//!
//! One async contract over heterogeneous backends so callers never branch on
//! the backend type.
//!
//! # Outcomes
//!
//! | Result                         | Meaning                                  |
//! |--------------------------------|------------------------------------------|
//! | `Ok(..)`                       | operation succeeded                      |
//! | `Err(DriverError::NotFound)`   | key absent                               |
//! | `Err(DriverError::Throttled)`  | local or remote rate limit refused       |
//! | `Err(DriverError::Dead(_))`    | network, auth or unexpected response     |
//!
//! `Throttled` and `Dead` are the failover signals for an external router.
//! Delete is idempotent on every backend.

mod embedded;
mod memory;
mod node;
mod remote;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DriverError;

pub use embedded::EmbeddedStorage;
pub use memory::MemoryStorage;
pub use node::StorageNode;
pub use remote::{object_path, RemoteBlobStorage};

/// Result of a driver call
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Key/value backend contract
#[async_trait]
pub trait KvDriver: Send + Sync {
    /// Store a value, replacing any previous one
    async fn put(&self, key: &str, value: Bytes) -> DriverResult<()>;

    /// Fetch a value
    async fn get(&self, key: &str) -> DriverResult<Bytes>;

    /// Remove a value. Absent keys are not an error.
    async fn delete(&self, key: &str) -> DriverResult<()>;

    /// Current health and capacity. Failures are reported in `Stat::error`.
    async fn stat(&self) -> Stat;

    /// Short backend name for logs
    fn kind(&self) -> &'static str;
}

/// Backend health and capacity snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stat {
    /// Capacity in bytes, 0 if unbounded or unknown
    pub total_bytes: u64,
    pub used_bytes: u64,
    /// Free bytes, 0 if unbounded or unknown
    pub available_bytes: u64,
    /// Round trip of the stat request itself
    pub ping_millis: u64,
    pub object_count: u64,
    pub upload_bytes: u64,
    pub download_bytes: u64,
    /// Backend refuses new writes
    pub sealed: bool,
    pub error: Option<String>,
    /// Token bucket in its string form, empty if the backend has none
    pub throttle: String,
    pub updated_at: Option<DateTime<Utc>>,
}
