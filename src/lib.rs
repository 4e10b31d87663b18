//! tiercache - Tiered Caching and Storage Substrate
//!
//! Building blocks for a content-delivery or media-serving backend that keeps
//! hot objects close and cold objects on cheap, slow, or metered storage.
//!
//! # Architecture
//!
//! ```text
//!  RAM                   Local disk                     Backends
//! ┌────────────────┐    ┌─────────────────────┐    ┌──────────────────────┐
//! │ ArenaCache     │    │ GenerationalCache   │    │ StorageNode          │
//! │ (buddy arenas) │    │ QuotaCache          │◄───│  ├ MemoryStorage     │
//! └────────────────┘    └─────────────────────┘    │  ├ EmbeddedStorage   │
//!                                                  │  └ RemoteBlobStorage │
//!                                                  │       └ TokenBucket  │
//!                                                  └──────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`alloc`] - Buddy allocation over fixed byte arenas
//! - [`config`] - YAML configuration
//! - [`diskcache`] - Hot/cold generational cache and quota cache
//! - [`error`] - Error types
//! - [`limiter`] - Token bucket rate limiting
//! - [`storage`] - Key/value driver contract, backends, and storage nodes
//! - [`telemetry`] - Logging setup

pub mod alloc;
pub mod config;
pub mod diskcache;
pub mod error;
pub mod limiter;
pub mod storage;
pub mod telemetry;

// Re-export commonly used types
pub use alloc::{Arena, ArenaCache, BlockHandle};
pub use config::Config;
pub use diskcache::{CacheFile, GenerationalCache, Populate, QuotaCache};
pub use error::{DriverError, Error, Result};
pub use limiter::TokenBucket;
pub use storage::{KvDriver, Stat, StorageNode};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
