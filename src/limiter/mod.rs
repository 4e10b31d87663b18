//! Rate Limiting
//!
//! Bounds how fast a slow or metered backend is hit. The remote blob backend
//! charges every download against a [`TokenBucket`] sized by the object.

mod token_bucket;

pub use token_bucket::TokenBucket;
