//! HTTP loader reading from a remote controller's admin API.
//!
//! A plain `GET` on a kind's URL lists every stored record as concatenated
//! JSON values. The same request with `X-Stream: true` is held open and
//! yields only records that arrive afterwards. Because the listing has no
//! cursor, resuming after a dropped stream relies on counting: the loader
//! remembers how many records it has accounted for and, on reconnect,
//! re-lists and skips that many before reopening the stream.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Binding, Loader};
use crate::cache::SharedCacher;
use crate::error::{Result, TelemetryError};
use crate::records::canonicalize;
use crate::retry::{Backend, Delivery, Flow, Mode, ProcessFunction, RetryPolicy, with_timeout};
use crate::types::{BoxFuture, Layout, LoaderObjectType};

/// Header switching a request to streaming mode.
pub const STREAM_HEADER: &str = "X-Stream";

/// Default timeout for listing requests. Streaming requests have none.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default pause after each streamed record.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

const BACKEND: &str = "remote";

/// Builds the HTTP client a loader (or a reconnect) uses.
pub type ClientFactory = Arc<dyn Fn() -> reqwest::Client + Send + Sync>;

/// Splits a byte stream of concatenated JSON values into values.
///
/// Decoded bytes are skipped by offset and only compacted away once they
/// make up half the buffer. An incomplete value is not parsed again until
/// more bytes arrive.
#[derive(Debug, Default)]
pub struct JsonStreamDecoder {
    buf: Vec<u8>,
    start: usize,
    starved: bool,
}

impl JsonStreamDecoder {
    /// Appends received bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        if self.start > 0 && self.start * 2 >= self.buf.len() {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.extend_from_slice(chunk);
        self.starved = false;
    }

    /// Returns the next complete value, or `None` if more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Decode`] on malformed input.
    pub fn next_value(&mut self) -> Result<Option<Value>> {
        if self.starved {
            return Ok(None);
        }
        let (item, consumed) = {
            let mut values = serde_json::Deserializer::from_slice(self.pending()).into_iter::<Value>();
            let item = values.next();
            (item, values.byte_offset())
        };
        match item {
            Some(Ok(value)) => {
                self.start += consumed;
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => {
                self.starved = true;
                Ok(None)
            }
            Some(Err(e)) => Err(e.into()),
            None => {
                self.start += consumed;
                self.starved = true;
                Ok(None)
            }
        }
    }

    fn pending(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    /// Checks that nothing but whitespace is left once the body has ended.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Decode`] if a value was cut off.
    pub fn finish(&self) -> Result<()> {
        let pending = self.pending();
        if pending.iter().all(u8::is_ascii_whitespace) {
            Ok(())
        } else {
            Err(TelemetryError::Decode(format!(
                "body ended inside a record ({} bytes left)",
                pending.len()
            )))
        }
    }
}

/// Reads records over HTTP from a remote controller.
#[derive(Clone)]
pub struct RemoteLoader {
    base_url: String,
    layout: Layout,
    client_factory: ClientFactory,
    retry: RetryPolicy,
    request_timeout: Duration,
    settle_delay: Duration,
    binding: Binding,
}

impl std::fmt::Debug for RemoteLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteLoader")
            .field("base_url", &self.base_url)
            .field("retry", &self.retry)
            .field("request_timeout", &self.request_timeout)
            .field("settle_delay", &self.settle_delay)
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

impl RemoteLoader {
    /// Creates a loader against `base_url`, resolving per-kind paths with `layout`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, layout: Layout, client_factory: ClientFactory) -> Self {
        Self {
            base_url: base_url.into(),
            layout,
            client_factory,
            retry: RetryPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            binding: Binding::default(),
        }
    }

    /// Sets the reconnect policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the listing request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the pause after each streamed record.
    #[must_use]
    pub const fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    fn url(&self, kind: LoaderObjectType) -> Result<String> {
        let path = self.layout.render(BACKEND, kind, self.binding.scope())?;
        Ok(format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        ))
    }

    async fn run(&self, process: ProcessFunction, kind: LoaderObjectType, mode: Mode) -> Result<()> {
        let mut delivery = self.binding.delivery(kind, process)?;
        let url = self.url(kind)?;
        debug!(%url, ?mode, "remote controller request");

        let mut feed = ControllerFeed {
            client: (self.client_factory)(),
            client_factory: Arc::clone(&self.client_factory),
            url,
            kind,
            request_timeout: self.request_timeout,
            settle_delay: self.settle_delay,
            accounted: match mode {
                Mode::Existing => Some(0),
                Mode::Stream => None,
            },
        };
        self.retry.drive(&mut feed, mode, &mut delivery).await
    }
}

impl Loader for RemoteLoader {
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
}

/// One call's client and record counter.
struct ControllerFeed {
    client: reqwest::Client,
    client_factory: ClientFactory,
    url: String,
    kind: LoaderObjectType,
    request_timeout: Duration,
    settle_delay: Duration,
    /// Records already handled, counted from the start of the listing.
    /// `None` until the first listing of a stream call has been counted.
    accounted: Option<usize>,
}

impl ControllerFeed {
    async fn get(&self, stream: bool) -> Result<reqwest::Response> {
        let mut request = self.client.get(&self.url);
        request = if stream {
            request.header(STREAM_HEADER, "true")
        } else {
            request.timeout(self.request_timeout)
        };
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TelemetryError::HttpStatus {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn list(&mut self, delivery: &mut Delivery) -> Result<Flow> {
        let response = self.get(false).await?;
        let mut body = response.bytes_stream();
        let mut decoder = JsonStreamDecoder::default();
        let baseline = self.accounted;
        let mut index = 0usize;

        while let Some(chunk) = body.next().await {
            decoder.push(&chunk?);
            while let Some(value) = decoder.next_value()? {
                let data = canonicalize(self.kind, value)?;
                index += 1;
                match baseline {
                    Some(skip) if index > skip => {
                        self.accounted = Some(index);
                        if delivery.offer(&data).await? == Flow::Stop {
                            return Ok(Flow::Stop);
                        }
                    }
                    _ => delivery.cache_only(&data).await,
                }
            }
        }
        decoder.finish()?;

        if baseline.is_none() {
            debug!(url = %self.url, existing = index, "counted existing records");
            self.accounted = Some(index);
        }
        Ok(Flow::Continue)
    }

    async fn follow(&mut self, delivery: &mut Delivery) -> Result<Flow> {
        let response = self.get(true).await?;
        let mut body = response.bytes_stream();
        let mut decoder = JsonStreamDecoder::default();

        while let Some(chunk) = body.next().await {
            decoder.push(&chunk?);
            while let Some(value) = decoder.next_value()? {
                let data = canonicalize(self.kind, value)?;
                *self.accounted.get_or_insert(0) += 1;
                if delivery.offer(&data).await? == Flow::Stop {
                    return Ok(Flow::Stop);
                }
                sleep(self.settle_delay).await;
            }
        }
        Err(TelemetryError::StreamEnded(BACKEND))
    }
}

impl Backend for ControllerFeed {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn reconnect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            info!(url = %self.url, accounted = ?self.accounted, "re-establishing connection with controller");
            self.client = (self.client_factory)();
            Ok(())
        })
    }

    fn fetch_existing<'a>(&'a mut self, delivery: &'a mut Delivery) -> BoxFuture<'a, Result<Flow>> {
        Box::pin(self.list(delivery))
    }

    fn fetch_next<'a>(&'a mut self, delivery: &'a mut Delivery) -> BoxFuture<'a, Result<Flow>> {
        Box::pin(self.follow(delivery))
    }
}
