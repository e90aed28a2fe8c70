//! # edge-telemetry
//!
//! Telemetry retrieval for edge nodes managed by a controller.
//!
//! This crate provides:
//!
//! - [`Loader`]: Replays and tails records from a controller backend
//!   ([`FileLoader`], [`RedisLoader`], [`PostgresLoader`], [`RemoteLoader`])
//! - [`Cacher`]: Idempotent copies of every record seen ([`FileCache`], [`RedisCache`])
//! - [`Query`]: Regex filters over record field paths
//! - [`RetryPolicy`]: Bounded reconnects for network backends
//! - [`run_checker`]: Existing, new, any and tail search modes
//! - [`TelemetryConfig`]: JSON configuration and loader factory
//!
//! ## Example
//!
//! ```rust
//! use edge_telemetry::{LogEntry, Query, Record};
//!
//! let query = Query::new([("severity", "^ERROR$"), ("content", "disk")])?;
//! let entry = LogEntry::decode(br#"{"severity":"ERROR","content":"disk full"}"#)?;
//! assert!(query.matches(&entry));
//! # Ok::<(), edge_telemetry::TelemetryError>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod checker;
pub mod config;
pub mod error;
pub mod loader;
pub mod query;
pub mod records;
pub mod retry;
pub mod types;

// Re-export main types
pub use cache::{Cacher, FileCache, RedisCache, SharedCacher};
pub use checker::{CheckerMode, run_checker};
pub use config::{CacheConfig, ControllerKind, TelemetryConfig};
pub use error::{Result, TelemetryError};
pub use loader::{
    ClientFactory, FileLoader, FileOrder, Loader, PostgresLoader, RedisLoader, RemoteLoader,
};
pub use query::{FieldPath, PrintResult, Query, select};
pub use records::{ApiRequest, FlowMessage, InfoMsg, LogEntry, MetricMsg, Record};
pub use retry::{ProcessFunction, RetryPolicy};
pub use types::{Layout, LoaderObjectType, PostgresEndpoint, RecordTimestamp, RedisEndpoint, Scope};
