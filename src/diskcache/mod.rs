//! On-Disk Caches
//!
//! Two file-backed caches for objects that are too large or too numerous for
//! RAM.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────┐   ┌───────────────────────────────┐
//! │      GenerationalCache        │   │          QuotaCache           │
//! │  root/<generation>/<key>      │   │  root/<shard>/<sha1 hex>      │
//! │  count bound (max_files)      │   │  byte bound (max_bytes)       │
//! │  hot/cold flip + promotion    │   │  sampled survey + random purge│
//! ├───────────────────────────────┤   ├───────────────────────────────┤
//! │  SingleFlight<CacheFile>      │   │  SingleFlight<Bytes>          │
//! └───────────────────────────────┘   └───────────────────────────────┘
//!                 │                                   │
//!                 └──────────── CacheMetrics ─────────┘
//! ```
//!
//! Both run their bound enforcement on a background task that stops on
//! `shutdown` or when the cache is dropped.

mod file;
mod generational;
mod metrics;
mod quota;
mod singleflight;

pub use file::CacheFile;
pub use generational::{GenerationalCache, Populate, PurgeReport};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use quota::{QuotaCache, WatchReport};
pub use singleflight::SingleFlight;
