//! Redis stream cache.

use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::StreamRangeReply;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};
use uuid::Uuid;

use super::Cacher;
use crate::error::{Result, TelemetryError};
use crate::loader::redis::{OBJECT_FIELD, connect, entry_object, next_stream_id};
use crate::records::timestamp_of;
use crate::types::{BoxFuture, Layout, LoaderObjectType, RecordTimestamp, RedisEndpoint, Scope};

const BACKEND: &str = "redis cache";
const SCAN_BATCH: usize = 100;

/// Appends records to per-device Redis streams, skipping timestamps already present.
///
/// The connection is opened on first use. Scan and append run under one lock
/// so concurrent offers of the same record from one process cannot both append.
pub struct RedisCache {
    endpoint: RedisEndpoint,
    layout: Layout,
    conn: OnceCell<MultiplexedConnection>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("addr", &self.endpoint.addr)
            .field("db", &self.endpoint.db)
            .field("connected", &self.conn.initialized())
            .finish()
    }
}

impl RedisCache {
    /// Creates a cache writing into the streams named by `layout`.
    #[must_use]
    pub fn new(endpoint: RedisEndpoint, layout: Layout) -> Self {
        Self {
            endpoint,
            layout,
            conn: OnceCell::new(),
            write_lock: Mutex::new(()),
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let conn = self
            .conn
            .get_or_try_init(|| connect(&self.endpoint))
            .await?;
        Ok(conn.clone())
    }

    async fn contains(
        conn: &mut MultiplexedConnection,
        kind: LoaderObjectType,
        stream: &str,
        wanted: RecordTimestamp,
    ) -> Result<bool> {
        let mut start = "-".to_string();
        loop {
            let reply: StreamRangeReply = conn.xrange_count(stream, &start, "+", SCAN_BATCH).await?;
            for entry in &reply.ids {
                let Some(object) = entry_object(entry) else {
                    continue;
                };
                match timestamp_of(kind, &object) {
                    Ok(ts) if ts == wanted => return Ok(true),
                    Ok(_) => {}
                    Err(e) => debug!(stream, id = %entry.id, error = %e, "skipping undecodable entry"),
                }
            }
            match reply.ids.last() {
                Some(last) if reply.ids.len() == SCAN_BATCH => start = next_stream_id(&last.id)?,
                _ => return Ok(false),
            }
        }
    }

    async fn save(&self, device: Uuid, kind: LoaderObjectType, data: &[u8]) -> Result<()> {
        if kind.is_app_scoped() {
            return Err(TelemetryError::Unsupported {
                backend: BACKEND,
                kind,
            });
        }
        let stream = self.layout.render(BACKEND, kind, &Scope::device(device))?;
        let timestamp = timestamp_of(kind, data)?;
        let mut conn = self.connection().await?;

        let _guard = self.write_lock.lock().await;
        if Self::contains(&mut conn, kind, &stream, timestamp).await? {
            debug!(%stream, key = %timestamp.cache_key(), "record already cached");
            return Ok(());
        }
        let id: String = conn
            .xadd(&stream, "*", &[(OBJECT_FIELD, data.to_vec())])
            .await
            .inspect_err(|e| warn!(%stream, error = %e, "XADD failed"))?;
        debug!(%stream, %id, "record cached");
        Ok(())
    }
}

impl Cacher for RedisCache {
    fn check_and_save<'a>(
        &'a self,
        device: Uuid,
        kind: LoaderObjectType,
        data: &'a [u8],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.save(device, kind, data))
    }
}
