//! Retrieval configuration.
//!
//! A JSON document selects the controller backend to read from, carries
//! the connection settings of every backend, the reconnect policy and an
//! optional cache. Everything except the chosen backend's address has a
//! default.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::cache::{FileCache, RedisCache, SharedCacher};
use crate::error::{Result, TelemetryError};
use crate::loader::{
    ClientFactory, FileLoader, FileOrder, Loader, PostgresLoader, RedisLoader, RemoteLoader,
    file, postgres, redis, remote,
};
use crate::retry::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY, RetryPolicy};
use crate::types::{Layout, PostgresEndpoint, RedisEndpoint};

const fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

fn layout_over<'de, D: Deserializer<'de>>(
    deserializer: D,
    preset: Layout,
) -> std::result::Result<Layout, D::Error> {
    Ok(Layout::deserialize(deserializer)?.fill_from(preset))
}

fn directories_layout<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Layout, D::Error> {
    layout_over(deserializer, Layout::directories())
}

fn streams_layout<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Layout, D::Error> {
    layout_over(deserializer, Layout::streams())
}

fn tables_layout<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Layout, D::Error> {
    layout_over(deserializer, Layout::tables())
}

fn admin_urls_layout<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Layout, D::Error> {
    layout_over(deserializer, Layout::admin_urls())
}

/// Which controller backend records are read from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKind {
    /// On-disk device tree.
    #[default]
    File,
    /// Redis streams.
    Redis,
    /// Postgres tables with `LISTEN`/`NOTIFY`.
    Postgres,
    /// Controller admin HTTP API.
    Remote,
}

/// File backend settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FileConfig {
    /// Root of the device tree.
    pub root: PathBuf,
    /// Order in which stored files are read.
    pub order: FileOrder,
    /// Pause before reading a file, in milliseconds.
    pub settle_delay_ms: u64,
    /// Directory per record kind, relative to `root`.
    #[serde(deserialize_with = "directories_layout")]
    pub layout: Layout,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            order: FileOrder::default(),
            settle_delay_ms: millis(file::DEFAULT_SETTLE_DELAY),
            layout: Layout::directories(),
        }
    }
}

/// Redis backend settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RedisConfig {
    /// Server address, password and database.
    #[serde(flatten)]
    pub endpoint: RedisEndpoint,
    /// Entries fetched per `XRANGE`/`XREAD`.
    pub batch_size: usize,
    /// Stream name per record kind.
    #[serde(deserialize_with = "streams_layout")]
    pub layout: Layout,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            endpoint: RedisEndpoint::default(),
            batch_size: redis::DEFAULT_BATCH_SIZE,
            layout: Layout::streams(),
        }
    }
}

/// Postgres backend settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PostgresConfig {
    /// Server address, credentials and database.
    #[serde(flatten)]
    pub endpoint: PostgresEndpoint,
    /// Rows fetched per query.
    pub batch_size: usize,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Table per record kind.
    #[serde(deserialize_with = "tables_layout")]
    pub layout: Layout,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            endpoint: PostgresEndpoint::default(),
            batch_size: postgres::DEFAULT_BATCH_SIZE,
            connect_timeout_ms: millis(postgres::DEFAULT_CONNECT_TIMEOUT),
            layout: Layout::tables(),
        }
    }
}

/// Remote controller settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the controller, e.g. `http://localhost:3000`.
    pub base_url: String,
    /// Timeout of listing requests in milliseconds.
    pub request_timeout_ms: u64,
    /// Pause after each streamed record, in milliseconds.
    pub settle_delay_ms: u64,
    /// URL path per record kind, relative to `base_url`.
    #[serde(deserialize_with = "admin_urls_layout")]
    pub layout: Layout,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            request_timeout_ms: millis(remote::DEFAULT_REQUEST_TIMEOUT),
            settle_delay_ms: millis(remote::DEFAULT_SETTLE_DELAY),
            layout: Layout::admin_urls(),
        }
    }
}

/// Reconnect policy settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
    /// Pause between attempts in milliseconds.
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay_ms: millis(DEFAULT_RETRY_DELAY),
        }
    }
}

impl RetryConfig {
    /// The policy these settings describe.
    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.delay_ms))
    }
}

/// Where retrieved records are copied, if anywhere.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheConfig {
    /// No cache.
    #[default]
    None,
    /// One file per record under `root`.
    File {
        /// Cache root directory.
        root: PathBuf,
        /// Directory per record kind, relative to `root`.
        #[serde(default = "Layout::directories", deserialize_with = "directories_layout")]
        layout: Layout,
    },
    /// One stream entry per record.
    Redis {
        /// Cache server.
        endpoint: RedisEndpoint,
        /// Stream name per record kind.
        #[serde(default = "Layout::streams", deserialize_with = "streams_layout")]
        layout: Layout,
    },
}

/// Full retrieval configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Backend to read from.
    #[serde(default)]
    pub controller: ControllerKind,
    /// File backend settings.
    #[serde(default)]
    pub file: FileConfig,
    /// Redis backend settings.
    #[serde(default)]
    pub redis: RedisConfig,
    /// Postgres backend settings.
    #[serde(default)]
    pub postgres: PostgresConfig,
    /// Remote controller settings.
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Reconnect policy.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl TelemetryConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            TelemetryError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| TelemetryError::Config(format!("invalid JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Only the selected backend's settings are checked, plus the cache.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Config`] naming the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(TelemetryError::Config(
                "retry.max_attempts must be greater than 0".to_string(),
            ));
        }

        match self.controller {
            ControllerKind::File => {
                if self.file.root.as_os_str().is_empty() {
                    return Err(TelemetryError::Config("file.root cannot be empty".to_string()));
                }
            }
            ControllerKind::Redis => {
                if self.redis.endpoint.addr.is_empty() {
                    return Err(TelemetryError::Config("redis.addr cannot be empty".to_string()));
                }
                if self.redis.batch_size == 0 {
                    return Err(TelemetryError::Config(
                        "redis.batch_size must be greater than 0".to_string(),
                    ));
                }
            }
            ControllerKind::Postgres => {
                let endpoint = &self.postgres.endpoint;
                if endpoint.addr.is_empty() {
                    return Err(TelemetryError::Config("postgres.addr cannot be empty".to_string()));
                }
                if endpoint.username.is_empty() {
                    return Err(TelemetryError::Config(
                        "postgres.username cannot be empty".to_string(),
                    ));
                }
                if endpoint.database.is_empty() {
                    return Err(TelemetryError::Config(
                        "postgres.database cannot be empty".to_string(),
                    ));
                }
                if self.postgres.batch_size == 0 {
                    return Err(TelemetryError::Config(
                        "postgres.batch_size must be greater than 0".to_string(),
                    ));
                }
            }
            ControllerKind::Remote => {
                let url = &self.remote.base_url;
                if url.is_empty() {
                    return Err(TelemetryError::Config(
                        "remote.base_url cannot be empty".to_string(),
                    ));
                }
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(TelemetryError::Config(
                        "remote.base_url must start with http:// or https://".to_string(),
                    ));
                }
            }
        }

        match &self.cache {
            CacheConfig::None => {}
            CacheConfig::File { root, .. } => {
                if root.as_os_str().is_empty() {
                    return Err(TelemetryError::Config("cache.root cannot be empty".to_string()));
                }
            }
            CacheConfig::Redis { endpoint, .. } => {
                if endpoint.addr.is_empty() {
                    return Err(TelemetryError::Config("cache.endpoint.addr cannot be empty".to_string()));
                }
            }
        }

        Ok(())
    }

    /// Builds the configured cache, if any.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Config`] if the cache settings are invalid.
    pub fn build_cache(&self) -> Result<Option<SharedCacher>> {
        let cache: SharedCacher = match &self.cache {
            CacheConfig::None => return Ok(None),
            CacheConfig::File { root, layout } => {
                if root.as_os_str().is_empty() {
                    return Err(TelemetryError::Config("cache.root cannot be empty".to_string()));
                }
                Arc::new(FileCache::new(root, layout.clone()))
            }
            CacheConfig::Redis { endpoint, layout } => {
                if endpoint.addr.is_empty() {
                    return Err(TelemetryError::Config("cache.endpoint.addr cannot be empty".to_string()));
                }
                Arc::new(RedisCache::new(endpoint.clone(), layout.clone()))
            }
        };
        Ok(Some(cache))
    }

    /// Builds the configured loader with the cache attached.
    ///
    /// No connection is opened here; backends connect on first use.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Config`] if the configuration is invalid.
    pub fn build_loader(&self) -> Result<Box<dyn Loader>> {
        self.validate()?;
        let retry = self.retry.policy();

        let mut loader: Box<dyn Loader> = match self.controller {
            ControllerKind::File => Box::new(
                FileLoader::new(&self.file.root, self.file.layout.clone())
                    .with_order(self.file.order)
                    .with_settle_delay(Duration::from_millis(self.file.settle_delay_ms)),
            ),
            ControllerKind::Redis => Box::new(
                RedisLoader::new(self.redis.endpoint.clone(), self.redis.layout.clone())
                    .with_retry(retry)
                    .with_batch_size(self.redis.batch_size),
            ),
            ControllerKind::Postgres => Box::new(
                PostgresLoader::new(self.postgres.endpoint.clone(), self.postgres.layout.clone())
                    .with_retry(retry)
                    .with_batch_size(self.postgres.batch_size)
                    .with_connect_timeout(Duration::from_millis(self.postgres.connect_timeout_ms)),
            ),
            ControllerKind::Remote => {
                let factory: ClientFactory = Arc::new(reqwest::Client::new);
                Box::new(
                    RemoteLoader::new(&self.remote.base_url, self.remote.layout.clone(), factory)
                        .with_retry(retry)
                        .with_request_timeout(Duration::from_millis(self.remote.request_timeout_ms))
                        .with_settle_delay(Duration::from_millis(self.remote.settle_delay_ms)),
                )
            }
        };

        if let Some(cache) = self.build_cache()? {
            loader.set_cache(cache);
        }
        Ok(loader)
    }
}
