//! Record delivery and the reconnect policy shared by network-backed loaders.
//!
//! A loader adapts its backend to the [`Backend`] capability trait and hands
//! it to [`RetryPolicy::drive`], which owns the replay-then-tail sequencing
//! and the bounded reconnect loop. Backends only know how to fetch.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::SharedCacher;
use crate::error::{Result, TelemetryError};
use crate::types::{BoxFuture, LoaderObjectType};

/// Default number of consecutive failed attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// Default pause between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Callback invoked once per raw record.
///
/// Returns `Ok(true)` to keep going and `Ok(false)` to stop. Decoding and
/// filtering are the callback's business.
pub type ProcessFunction = Box<dyn FnMut(&[u8]) -> Result<bool> + Send>;

/// Whether delivery should go on after a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep delivering.
    Continue,
    /// The process function asked to stop.
    Stop,
}

/// Per-call delivery state: the bound scope, the cacher and the process function.
pub struct Delivery {
    device: Uuid,
    kind: LoaderObjectType,
    cache: Option<SharedCacher>,
    process: ProcessFunction,
    delivered: u64,
    first_offer: Option<Instant>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("device", &self.device)
            .field("kind", &self.kind)
            .field("cached", &self.cache.is_some())
            .field("delivered", &self.delivered)
            .finish_non_exhaustive()
    }
}

impl Delivery {
    /// Creates delivery state for one loader call.
    #[must_use]
    pub fn new(
        device: Uuid,
        kind: LoaderObjectType,
        cache: Option<SharedCacher>,
        process: ProcessFunction,
    ) -> Self {
        Self {
            device,
            kind,
            cache,
            process,
            delivered: 0,
            first_offer: None,
        }
    }

    /// Record kind being delivered.
    #[must_use]
    pub const fn kind(&self) -> LoaderObjectType {
        self.kind
    }

    /// Device the records belong to.
    #[must_use]
    pub const fn device(&self) -> Uuid {
        self.device
    }

    /// Number of records handed to the process function so far.
    #[must_use]
    pub const fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Offers a record to the cacher only.
    ///
    /// Cache failures are logged; they never interrupt delivery.
    pub async fn cache_only(&mut self, data: &[u8]) {
        let Some(cache) = &self.cache else {
            return;
        };
        if let Err(e) = cache.check_and_save(self.device, self.kind, data).await {
            error!(device = %self.device, kind = %self.kind, error = %e, "cache write failed");
        }
    }

    /// Caches the record, then hands it to the process function.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Handler`] wrapping whatever the process function returned.
    pub async fn offer(&mut self, data: &[u8]) -> Result<Flow> {
        self.cache_only(data).await;
        self.delivered += 1;
        self.first_offer.get_or_insert_with(Instant::now);
        match (self.process)(data) {
            Ok(true) => Ok(Flow::Continue),
            Ok(false) => {
                debug!(device = %self.device, kind = %self.kind, "process function stopped delivery");
                Ok(Flow::Stop)
            }
            Err(e) => Err(TelemetryError::Handler(Box::new(e))),
        }
    }
}

/// What a network-backed loader must provide to be driven by [`RetryPolicy`].
pub trait Backend: Send {
    /// Short name for logs and errors.
    fn name(&self) -> &'static str;

    /// Re-establishes the connection after a transient failure.
    ///
    /// Cursor state must survive; only the transport is replaced.
    fn reconnect(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Registers interest in new records before the existing ones are drained,
    /// so nothing written in between is missed.
    fn subscribe(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Delivers every record currently stored past the cursor.
    fn fetch_existing<'a>(&'a mut self, delivery: &'a mut Delivery) -> BoxFuture<'a, Result<Flow>>;

    /// Waits for the next batch of new records and delivers it.
    fn fetch_next<'a>(&'a mut self, delivery: &'a mut Delivery) -> BoxFuture<'a, Result<Flow>>;
}

/// Which half of the protocol to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Scan stored records once.
    Existing,
    /// Drain stored records, then tail new ones until stopped.
    Stream,
}

/// Bounded reconnect policy with a fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failed attempts allowed before giving up.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// An attempt that stayed established this long is forgiven when it finally fails.
    ///
    /// An attempt counts as established once it delivered a record or, in
    /// stream mode, finished draining stored records. Time spent connecting
    /// or waiting on an unresponsive backend does not count.
    #[must_use]
    pub fn healthy_after(&self) -> Duration {
        self.delay.saturating_mul(2)
    }

    /// Runs `mode` against `backend`, reconnecting on transient failures.
    ///
    /// # Errors
    ///
    /// Non-transient errors are returned as they are. Transient errors become
    /// [`TelemetryError::RetriesExhausted`] after `max_attempts` consecutive failures.
    pub async fn drive<B>(&self, backend: &mut B, mode: Mode, delivery: &mut Delivery) -> Result<()>
    where
        B: Backend + ?Sized,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut failures: u32 = 0;
        let mut needs_reconnect = false;

        loop {
            delivery.first_offer = None;
            let mut drained = None;
            let result = if needs_reconnect {
                match backend.reconnect().await {
                    Ok(()) => run_once(backend, mode, delivery, &mut drained).await,
                    Err(e) => Err(e),
                }
            } else {
                run_once(backend, mode, delivery, &mut drained).await
            };

            let err = match result {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };

            let established = match (drained, delivery.first_offer) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            if established.is_some_and(|at| at.elapsed() >= self.healthy_after()) && failures > 0 {
                info!(backend = backend.name(), "connection was healthy, resetting attempt counter");
                failures = 0;
            }
            failures += 1;
            if failures >= max_attempts {
                error!(backend = backend.name(), attempts = failures, error = %err, "giving up");
                return Err(TelemetryError::RetriesExhausted {
                    attempts: failures,
                    last: err.to_string(),
                });
            }

            warn!(
                backend = backend.name(),
                attempt = failures,
                max_attempts,
                delay = ?self.delay,
                error = %err,
                "backend failed, reconnecting"
            );
            sleep(self.delay).await;
            needs_reconnect = true;
        }
    }
}

async fn run_once<B>(
    backend: &mut B,
    mode: Mode,
    delivery: &mut Delivery,
    drained: &mut Option<Instant>,
) -> Result<()>
where
    B: Backend + ?Sized,
{
    match mode {
        Mode::Existing => {
            backend.fetch_existing(delivery).await?;
            Ok(())
        }
        Mode::Stream => {
            backend.subscribe().await?;
            let flow = backend.fetch_existing(delivery).await?;
            *drained = Some(Instant::now());
            if flow == Flow::Stop {
                return Ok(());
            }
            while backend.fetch_next(delivery).await? == Flow::Continue {}
            Ok(())
        }
    }
}

/// Awaits `fut`, failing with [`TelemetryError::Timeout`] once `timeout` elapses.
///
/// A zero timeout waits forever. On expiry the future is dropped, which
/// cancels whatever backend read it was blocked in.
///
/// # Errors
///
/// Returns the future's own error, or `Timeout`.
pub async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| TelemetryError::Timeout(timeout))?
}
