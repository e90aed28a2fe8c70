//! Idempotent persistence sinks for observed records.
//!
//! Every loader offers each record it sees to its configured [`Cacher`],
//! whether or not the process function ends up consuming it. A cacher keys
//! records by `(device, kind, timestamp)` and writes a key at most once, so
//! replays and overlapping existing/stream scans never store duplicates.

pub mod file;
pub mod redis;

use std::sync::Arc;

use uuid::Uuid;

use crate::error::Result;
use crate::types::{BoxFuture, LoaderObjectType};

pub use file::FileCache;
pub use redis::RedisCache;

/// Trait for idempotent record caches.
pub trait Cacher: Send + Sync {
    /// Persists `data` unless a record with the same timestamp is already stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the timestamp cannot be decoded or the write fails.
    fn check_and_save<'a>(
        &'a self,
        device: Uuid,
        kind: LoaderObjectType,
        data: &'a [u8],
    ) -> BoxFuture<'a, Result<()>>;
}

/// A cacher shared between a loader and its clones.
pub type SharedCacher = Arc<dyn Cacher>;
