//! Versioned response cache with offline support.
//!
//! This module provides the storage side of the agent:
//! - Named buckets of request → response snapshots, one per deployed version
//! - Lookups across every bucket, oldest first
//! - All-or-nothing batch writes for precaching
//! - SQLite persistence so buckets survive restarts

mod bucket;
mod storage;
mod traits;

pub use bucket::CacheBucket;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheKey, CacheResult};

#[cfg(test)]
pub use traits::CacheSource;
