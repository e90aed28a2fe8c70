//! Search modes combining replay and tail over any loader.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::loader::Loader;
use crate::query::Query;
use crate::records::Record;
use crate::retry::ProcessFunction;
use crate::types::{LoaderObjectType, Scope};

/// How [`run_checker`] looks for records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckerMode {
    /// Scan stored records only.
    Existing,
    /// Wait for new records only.
    New,
    /// Scan stored records and wait for new ones at the same time.
    ///
    /// Loaders whose stream replays stored records on its own run the stream
    /// alone, so no record reaches the handler twice.
    Any,
    /// Hand only the last `n` matching stored records to the handler.
    Tail(usize),
}

impl CheckerMode {
    /// Returns true if this mode waits for new records, so a timeout applies.
    #[must_use]
    pub const fn waits(self) -> bool {
        matches!(self, Self::New | Self::Any)
    }
}

fn matching<R, F>(query: Arc<Query>, mut on_match: F) -> ProcessFunction
where
    R: Record,
    F: FnMut(R) -> bool + Send + 'static,
{
    Box::new(move |data| {
        let record = R::decode(data)?;
        if !query.matches(&record) {
            return Ok(true);
        }
        Ok(on_match(record))
    })
}

fn handing_to<R, H>(handler: &Arc<Mutex<H>>, found: &Arc<AtomicBool>) -> impl FnMut(R) -> bool + Send + 'static
where
    R: Record,
    H: FnMut(&R) -> bool + Send + 'static,
{
    let handler = Arc::clone(handler);
    let found = Arc::clone(found);
    move |record| {
        let keep_going = (&mut *handler.lock())(&record);
        if !keep_going {
            found.store(true, Ordering::SeqCst);
        }
        keep_going
    }
}

/// Runs `handler` over records of `kind` for `scope` that match `query`.
///
/// The handler returns `false` to stop. `timeout` bounds the waiting modes;
/// zero waits forever. Records that fail to decode as `R` abort the run.
/// The loader is cloned up front, so the returned future owns everything it uses.
///
/// # Errors
///
/// The future yields loader and decode errors, and
/// [`crate::TelemetryError::Timeout`] if a waiting mode sees no stop before
/// the deadline.
pub fn run_checker<R, H>(
    loader: &dyn Loader,
    scope: Scope,
    kind: LoaderObjectType,
    query: Query,
    handler: H,
    mode: CheckerMode,
    timeout: Duration,
) -> impl Future<Output = Result<()>> + Send + 'static
where
    R: Record,
    H: FnMut(&R) -> bool + Send + 'static,
{
    let mut base = loader.clone_loader();
    base.set_uuid(scope.device);
    if let Some(app) = scope.app {
        base.set_app_uuid(app);
    }

    async move {
        let query = Arc::new(query);
        let handler = Arc::new(Mutex::new(handler));
        let found = Arc::new(AtomicBool::new(false));
        debug!(device = %scope.device, %kind, ?mode, "running checker");

        match mode {
            CheckerMode::Existing => {
                let process = matching(query, handing_to::<R, H>(&handler, &found));
                base.process_existing(process, kind).await
            }
            CheckerMode::New => {
                let process = matching(query, handing_to::<R, H>(&handler, &found));
                base.process_stream(process, kind, timeout).await
            }
            CheckerMode::Any if base.stream_includes_existing() => {
                let process = matching(query, handing_to::<R, H>(&handler, &found));
                base.process_stream(process, kind, timeout).await
            }
            CheckerMode::Any => {
                let mut existing = base.clone_loader();
                let replay = matching(Arc::clone(&query), handing_to::<R, H>(&handler, &found));
                let tail = matching(query, handing_to::<R, H>(&handler, &found));

                let mut replay = existing.process_existing(replay, kind);
                let mut tail = base.process_stream(tail, kind, timeout);
                tokio::select! {
                    res = &mut replay => res?,
                    res = &mut tail => return res,
                }
                if found.load(Ordering::SeqCst) {
                    return Ok(());
                }
                debug!(%kind, "no stored match, waiting for new records");
                tail.await
            }
            CheckerMode::Tail(count) => {
                let ring: Arc<Mutex<VecDeque<R>>> = Arc::new(Mutex::new(VecDeque::new()));
                let sink = Arc::clone(&ring);
                let process = matching(query, move |record: R| {
                    let mut ring = sink.lock();
                    ring.push_back(record);
                    if ring.len() > count {
                        ring.pop_front();
                    }
                    true
                });
                base.process_existing(process, kind).await?;

                let records = std::mem::take(&mut *ring.lock());
                let mut handler = handler.lock();
                for record in &records {
                    if !(&mut *handler)(record) {
                        break;
                    }
                }
                Ok(())
            }
        }
    }
}
