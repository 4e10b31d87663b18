//! Fixed-Arena Buddy Allocation
//!
//! Hands out power-of-two blocks from one pre-allocated byte arena so that
//! transient buffers for in-process caching never touch the global allocator
//! after startup.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     ArenaCache                            │
//! │   shard 0 (Mutex)   shard 1 (Mutex)   ...   shard N-1     │
//! │        │                  │                     │         │
//! │        ▼                  ▼                     ▼         │
//! │  ┌────────────┐    ┌────────────┐        ┌────────────┐   │
//! │  │   Arena    │    │   Arena    │        │   Arena    │   │
//! │  │ blocks +   │    │ blocks +   │        │ blocks +   │   │
//! │  │ Bitmap     │    │ Bitmap     │        │ Bitmap     │   │
//! │  └────────────┘    └────────────┘        └────────────┘   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! [`Arena`] itself takes `&mut self` everywhere; [`ArenaCache`] supplies the
//! per-shard locking.

mod arena;
mod bitmap;
mod cache;
mod proptest;

pub use arena::{Arena, Block, BlockHandle, BlockPath};
pub use bitmap::Bitmap;
pub use cache::ArenaCache;

/// Default unit size in bytes
pub const DEFAULT_BLOCK_SIZE: usize = 256;
