//! Redis streams loader.
//!
//! The controller appends one stream entry per record, the record bytes in
//! the `object` field. Existing records are read with `XRANGE` in batches;
//! new ones with `XREAD BLOCK 0` from the last entry id seen in this call.

use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use tracing::{debug, info};
use uuid::Uuid;

use super::{Binding, Loader};
use crate::cache::SharedCacher;
use crate::error::{Result, TelemetryError};
use crate::retry::{Backend, Delivery, Flow, Mode, ProcessFunction, RetryPolicy, with_timeout};
use crate::types::{BoxFuture, Layout, LoaderObjectType, RedisEndpoint};

/// Stream entry field carrying the record bytes.
pub const OBJECT_FIELD: &str = "object";

/// Default number of entries per `XRANGE`/`XREAD` round trip.
pub const DEFAULT_BATCH_SIZE: usize = 100;

const BACKEND: &str = "redis";

async fn open(endpoint: &RedisEndpoint) -> redis::RedisResult<MultiplexedConnection> {
    let client = redis::Client::open(endpoint.url())?;
    let mut conn = client.get_multiplexed_async_connection().await?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(conn)
}

/// Opens a checked connection, reporting refusal as [`TelemetryError::Connect`].
pub(crate) async fn connect(endpoint: &RedisEndpoint) -> Result<MultiplexedConnection> {
    open(endpoint).await.map_err(|e| TelemetryError::Connect {
        backend: BACKEND,
        reason: e.to_string(),
    })
}

/// Record bytes of a stream entry, if it has any.
pub(crate) fn entry_object(entry: &StreamId) -> Option<Vec<u8>> {
    entry.get::<Vec<u8>>(OBJECT_FIELD)
}

/// Smallest stream id strictly greater than `id`.
pub(crate) fn next_stream_id(id: &str) -> Result<String> {
    let malformed = || TelemetryError::Decode(format!("malformed stream id {id:?}"));
    let (ms, seq) = id.split_once('-').ok_or_else(malformed)?;
    let ms: u64 = ms.parse().map_err(|_| malformed())?;
    let seq: u64 = seq.parse().map_err(|_| malformed())?;
    Ok(match seq.checked_add(1) {
        Some(seq) => format!("{ms}-{seq}"),
        None => format!("{}-0", ms.saturating_add(1)),
    })
}

/// Reads records from Redis streams.
#[derive(Debug, Clone)]
pub struct RedisLoader {
    endpoint: RedisEndpoint,
    layout: Layout,
    retry: RetryPolicy,
    batch_size: usize,
    binding: Binding,
}

impl RedisLoader {
    /// Creates a loader reading the streams named by `layout`.
    #[must_use]
    pub fn new(endpoint: RedisEndpoint, layout: Layout) -> Self {
        Self {
            endpoint,
            layout,
            retry: RetryPolicy::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            binding: Binding::default(),
        }
    }

    /// Sets the reconnect policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the batch size, at least one.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    async fn run(&self, process: ProcessFunction, kind: LoaderObjectType, mode: Mode) -> Result<()> {
        let mut delivery = self.binding.delivery(kind, process)?;
        let stream = self.layout.render(BACKEND, kind, self.binding.scope())?;
        let conn = connect(&self.endpoint).await?;
        debug!(%stream, ?mode, "reading redis stream");

        let mut cursor = StreamCursor {
            endpoint: self.endpoint.clone(),
            stream,
            conn,
            batch_size: self.batch_size,
            last_id: None,
        };
        self.retry.drive(&mut cursor, mode, &mut delivery).await
    }
}

impl Loader for RedisLoader {
    fn set_uuid(&mut self, device: Uuid) {
        self.binding.set_device(device);
    }

    fn set_app_uuid(&mut self, app: Uuid) {
        self.binding.set_app(app);
    }

    fn set_cache(&mut self, cache: SharedCacher) {
        self.binding.set_cache(cache);
    }

    fn process_existing(
        &mut self,
        process: ProcessFunction,
        kind: LoaderObjectType,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.run(process, kind, Mode::Existing))
    }

    fn process_stream(
        &mut self,
        process: ProcessFunction,
        kind: LoaderObjectType,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(with_timeout(timeout, self.run(process, kind, Mode::Stream)))
    }

    fn clone_loader(&self) -> Box<dyn Loader> {
        Box::new(self.clone())
    }

    fn stream_includes_existing(&self) -> bool {
        true
    }
}

/// One call's connection and position in a stream.
struct StreamCursor {
    endpoint: RedisEndpoint,
    stream: String,
    conn: MultiplexedConnection,
    batch_size: usize,
    last_id: Option<String>,
}

impl StreamCursor {
    async fn deliver(&mut self, entries: &[StreamId], delivery: &mut Delivery) -> Result<Flow> {
        for entry in entries {
            self.last_id = Some(entry.id.clone());
            let Some(object) = entry_object(entry) else {
                debug!(stream = %self.stream, id = %entry.id, "entry without object field");
                continue;
            };
            if delivery.offer(&object).await? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    async fn range(&mut self, delivery: &mut Delivery) -> Result<Flow> {
        loop {
            let start = match &self.last_id {
                Some(id) => next_stream_id(id)?,
                None => "-".to_string(),
            };
            let reply: StreamRangeReply = self
                .conn
                .xrange_count(&self.stream, &start, "+", self.batch_size)
                .await?;
            if self.deliver(&reply.ids, delivery).await? == Flow::Stop {
                return Ok(Flow::Stop);
            }
            if reply.ids.len() < self.batch_size {
                return Ok(Flow::Continue);
            }
        }
    }

    async fn read_blocking(&mut self, delivery: &mut Delivery) -> Result<Flow> {
        let from = self.last_id.clone().unwrap_or_else(|| "0-0".to_string());
        let options = StreamReadOptions::default().count(self.batch_size).block(0);
        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.stream], &[&from], &options)
            .await?;
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            if self.deliver(&key.ids, delivery).await? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }
}

impl Backend for StreamCursor {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn reconnect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            info!(stream = %self.stream, last_id = ?self.last_id, "reconnecting to redis");
            self.conn = open(&self.endpoint).await?;
            Ok(())
        })
    }

    fn fetch_existing<'a>(&'a mut self, delivery: &'a mut Delivery) -> BoxFuture<'a, Result<Flow>> {
        Box::pin(self.range(delivery))
    }

    fn fetch_next<'a>(&'a mut self, delivery: &'a mut Delivery) -> BoxFuture<'a, Result<Flow>> {
        Box::pin(self.read_blocking(delivery))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use test_case::test_case;

    #[test_case("1526919030474-55", "1526919030474-56" ; "plain")]
    #[test_case("0-0", "0-1" ; "zero")]
    #[test_case("7-18446744073709551615", "8-0" ; "sequence overflow")]
    fn successor_ids(id: &str, expected: &str) {
        assert_eq!(next_stream_id(id).unwrap(), expected);
    }

    #[test_case("" ; "empty")]
    #[test_case("12" ; "no separator")]
    #[test_case("a-1" ; "non numeric")]
    fn malformed_ids(id: &str) {
        assert!(next_stream_id(id).unwrap_err().is_decode());
    }

    #[tokio::test]
    async fn refused_connection_fails_fast() {
        let mut loader = RedisLoader::new(RedisEndpoint::new("127.0.0.1:1"), Layout::streams())
            .with_retry(RetryPolicy::new(20, Duration::from_secs(60)));
        loader.set_uuid(Uuid::new_v4());

        let err = loader
            .process_existing(Box::new(|_| Ok(true)), LoaderObjectType::Logs)
            .await
            .unwrap_err();
        assert!(matches!(err, TelemetryError::Connect { backend: "redis", .. }), "{err}");
    }

    #[tokio::test]
    async fn unbound_loader_is_config_error() {
        let mut loader = RedisLoader::new(RedisEndpoint::new("127.0.0.1:1"), Layout::streams());
        let err = loader
            .process_existing(Box::new(|_| Ok(true)), LoaderObjectType::Info)
            .await
            .unwrap_err();
        assert!(matches!(err, TelemetryError::Config(_)));
    }

    fn live_endpoint() -> RedisEndpoint {
        RedisEndpoint::new(
            std::env::var("EDGE_TELEMETRY_REDIS").unwrap_or_else(|_| "127.0.0.1:6379".into()),
        )
    }

    fn log_record(second: u32) -> Vec<u8> {
        format!(r#"{{"severity":"INFO","content":"n{second}","timestamp":"2023-01-01T00:00:{second:02}Z"}}"#)
            .into_bytes()
    }

    fn collector() -> (ProcessFunction, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let process: ProcessFunction = Box::new(move |data| {
            sink.lock().unwrap().push(data.to_vec());
            Ok(true)
        });
        (process, seen)
    }

    // Needs a Redis server; set EDGE_TELEMETRY_REDIS to its host:port.
    #[tokio::test]
    #[ignore]
    async fn live_existing_reads_in_batches() {
        let endpoint = live_endpoint();
        let device = Uuid::new_v4();
        let mut conn = connect(&endpoint).await.unwrap();
        for second in 0..5 {
            let _: String = conn
                .xadd(format!("LOGS_EVE_{device}"), "*", &[(OBJECT_FIELD, log_record(second))])
                .await
                .unwrap();
        }

        let mut loader = RedisLoader::new(endpoint, Layout::streams()).with_batch_size(2);
        loader.set_uuid(device);
        let (process, seen) = collector();
        loader.process_existing(process, LoaderObjectType::Logs).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[4], log_record(4));
    }

    #[tokio::test]
    #[ignore]
    async fn live_stream_sees_entries_added_later() {
        let endpoint = live_endpoint();
        let device = Uuid::new_v4();
        let mut loader = RedisLoader::new(endpoint.clone(), Layout::streams());
        loader.set_uuid(device);

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let mut conn = connect(&endpoint).await.unwrap();
            let _: String = conn
                .xadd(format!("LOGS_EVE_{device}"), "*", &[(OBJECT_FIELD, log_record(9))])
                .await
                .unwrap();
        });

        let process: ProcessFunction = Box::new(|_| Ok(false));
        loader
            .process_stream(process, LoaderObjectType::Logs, Duration::from_secs(5))
            .await
            .unwrap();
        writer.await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn live_cursor_survives_reconnect() {
        let endpoint = live_endpoint();
        let stream = format!("LOGS_EVE_{}", Uuid::new_v4());
        let mut conn = connect(&endpoint).await.unwrap();
        for second in 0..2 {
            let _: String = conn
                .xadd(&stream, "*", &[(OBJECT_FIELD, log_record(second))])
                .await
                .unwrap();
        }

        let mut cursor = StreamCursor {
            endpoint: endpoint.clone(),
            stream: stream.clone(),
            conn: conn.clone(),
            batch_size: 1,
            last_id: None,
        };
        let (process, seen) = collector();
        let mut delivery = Delivery::new(Uuid::new_v4(), LoaderObjectType::Logs, None, process);

        cursor.fetch_existing(&mut delivery).await.unwrap();
        cursor.reconnect().await.unwrap();
        let _: String = conn
            .xadd(&stream, "*", &[(OBJECT_FIELD, log_record(2))])
            .await
            .unwrap();
        cursor.fetch_existing(&mut delivery).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, [log_record(0), log_record(1), log_record(2)]);
    }
}
