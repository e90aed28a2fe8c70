//! Postgres loader.
//!
//! One table per record kind with `id bigserial`, `ref text` (device UUID,
//! or app UUID for app logs) and `data bytea`. The controller fires
//! `NOTIFY <table>, '{"id": ..., "ref": ...}'` after every insert.

use std::time::Duration;

use serde::Deserialize;
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Binding, Loader};
use crate::cache::SharedCacher;
use crate::error::{Result, TelemetryError};
use crate::retry::{Backend, Delivery, Flow, Mode, ProcessFunction, RetryPolicy, with_timeout};
use crate::types::{BoxFuture, Layout, LoaderObjectType, PostgresEndpoint};

/// Default rows fetched per query.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default time allowed for the initial connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const BACKEND: &str = "postgres";

#[derive(Debug, Deserialize)]
struct RowNotification {
    #[serde(deserialize_with = "id_from_number_or_string")]
    id: i64,
    #[serde(rename = "ref")]
    reference: String,
}

fn id_from_number_or_string<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(i64),
        Text(String),
    }
    match Repr::deserialize(deserializer)? {
        Repr::Number(n) => Ok(n),
        Repr::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn check_table_name(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(TelemetryError::Config(format!("invalid table name {table:?}")))
    }
}

/// Reads records from the controller's Postgres tables.
#[derive(Debug, Clone)]
pub struct PostgresLoader {
    endpoint: PostgresEndpoint,
    layout: Layout,
    retry: RetryPolicy,
    batch_size: usize,
    connect_timeout: Duration,
    binding: Binding,
}

impl PostgresLoader {
    /// Creates a loader reading the tables named by `layout`.
    #[must_use]
    pub fn new(endpoint: PostgresEndpoint, layout: Layout) -> Self {
        Self {
            endpoint,
            layout,
            retry: RetryPolicy::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
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

    /// Sets how long the initial connection may take.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn connect(&self) -> Result<PgPool> {
        PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(self.connect_timeout)
            .connect(&self.endpoint.dsn())
            .await
            .map_err(|e| TelemetryError::Connect {
                backend: BACKEND,
                reason: e.to_string(),
            })
    }

    async fn run(&self, process: ProcessFunction, kind: LoaderObjectType, mode: Mode) -> Result<()> {
        let mut delivery = self.binding.delivery(kind, process)?;
        let table = self.layout.render(BACKEND, kind, self.binding.scope())?;
        check_table_name(&table)?;
        let scope = self.binding.scope();
        let reference = match (kind.is_app_scoped(), scope.app) {
            (true, Some(app)) => app,
            _ => scope.device,
        };
        let pool = self.connect().await?;
        debug!(%table, %reference, ?mode, "reading postgres table");

        let mut cursor = TableCursor {
            pool,
            table,
            reference: reference.to_string(),
            batch_size: self.batch_size,
            listener: None,
            last_row_id: 0,
        };
        self.retry.drive(&mut cursor, mode, &mut delivery).await
    }
}

impl Loader for PostgresLoader {
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

/// One call's pool, listener and row cursor.
///
/// `last_row_id` survives reconnects, so rows delivered before a drop are
/// not delivered again.
struct TableCursor {
    pool: PgPool,
    table: String,
    reference: String,
    batch_size: usize,
    listener: Option<PgListener>,
    last_row_id: i64,
}

impl TableCursor {
    async fn drain(&mut self, delivery: &mut Delivery) -> Result<Flow> {
        let sql = format!(
            "SELECT id, data FROM {} WHERE ref = $1 AND id > $2 ORDER BY id LIMIT $3",
            self.table
        );
        let limit = i64::try_from(self.batch_size).unwrap_or(i64::MAX);
        loop {
            let rows: Vec<(i64, Vec<u8>)> = sqlx::query_as(&sql)
                .bind(&self.reference)
                .bind(self.last_row_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
            let fetched = rows.len();
            for (id, data) in rows {
                self.last_row_id = id;
                if delivery.offer(&data).await? == Flow::Stop {
                    return Ok(Flow::Stop);
                }
            }
            if fetched < self.batch_size {
                return Ok(Flow::Continue);
            }
        }
    }

    async fn listen(&mut self) -> Result<()> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.table).await?;
        self.listener = Some(listener);
        Ok(())
    }

    async fn wait_for_rows(&mut self, delivery: &mut Delivery) -> Result<Flow> {
        if self.listener.is_none() {
            self.listen().await?;
        }
        loop {
            let notification = match self.listener.as_mut() {
                Some(listener) => listener.try_recv().await?,
                None => None,
            };
            let Some(notification) = notification else {
                // the listener lost its connection; notifications may have been missed
                self.listener = None;
                return Err(TelemetryError::StreamEnded(BACKEND));
            };
            let row: RowNotification = match serde_json::from_str(notification.payload()) {
                Ok(row) => row,
                Err(e) => {
                    warn!(table = %self.table, payload = notification.payload(), error = %e, "ignoring malformed notification");
                    continue;
                }
            };
            if row.reference != self.reference || row.id <= self.last_row_id {
                continue;
            }
            return self.drain(delivery).await;
        }
    }
}

impl Backend for TableCursor {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn reconnect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            info!(table = %self.table, last_row_id = self.last_row_id, "reconnecting to postgres");
            self.listener = None;
            Ok(())
        })
    }

    fn subscribe(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.listen())
    }

    fn fetch_existing<'a>(&'a mut self, delivery: &'a mut Delivery) -> BoxFuture<'a, Result<Flow>> {
        Box::pin(self.drain(delivery))
    }

    fn fetch_next<'a>(&'a mut self, delivery: &'a mut Delivery) -> BoxFuture<'a, Result<Flow>> {
        Box::pin(self.wait_for_rows(delivery))
    }
}
