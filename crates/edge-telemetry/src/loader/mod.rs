//! Backend readers producing ordered record sequences for a bound device.
//!
//! Every loader follows one contract: bind a scope with [`Loader::set_uuid`]
//! (and [`Loader::set_app_uuid`] for app logs), then replay with
//! [`Loader::process_existing`] or tail with [`Loader::process_stream`].
//! A loader owns its cursor and connection state; run calls concurrently on
//! separate [`Loader::clone_loader`] copies, never on one instance.

pub mod file;
pub mod postgres;
pub mod redis;
pub mod remote;

use std::time::Duration;

use uuid::Uuid;

use crate::cache::SharedCacher;
use crate::error::{Result, TelemetryError};
use crate::retry::{Delivery, ProcessFunction};
use crate::types::{BoxFuture, LoaderObjectType, Scope};

pub use file::{FileLoader, FileOrder};
pub use postgres::PostgresLoader;
pub use redis::RedisLoader;
pub use remote::{ClientFactory, RemoteLoader};

/// Trait for telemetry backends.
pub trait Loader: Send {
    /// Binds the device whose records are read.
    fn set_uuid(&mut self, device: Uuid);

    /// Binds the application for [`LoaderObjectType::AppLog`] reads.
    fn set_app_uuid(&mut self, app: Uuid);

    /// Attaches a cacher that sees every record this loader observes.
    fn set_cache(&mut self, cache: SharedCacher);

    /// Delivers every stored record of `kind` once, oldest first.
    ///
    /// Returns `Ok(())` when the records are exhausted or `process` asks to stop.
    ///
    /// # Errors
    ///
    /// Returns configuration, backend and decode errors. Errors raised by
    /// `process` come back wrapped in [`TelemetryError::Handler`].
    fn process_existing(
        &mut self,
        process: ProcessFunction,
        kind: LoaderObjectType,
    ) -> BoxFuture<'_, Result<()>>;

    /// Delivers records of `kind` as they arrive until `process` asks to stop.
    ///
    /// A zero `timeout` waits forever.
    ///
    /// # Errors
    ///
    /// As [`Loader::process_existing`], plus [`TelemetryError::Timeout`] when
    /// nothing stops the stream before the deadline.
    fn process_stream(
        &mut self,
        process: ProcessFunction,
        kind: LoaderObjectType,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<()>>;

    /// Returns an unconnected copy with the same configuration, scope and cacher.
    fn clone_loader(&self) -> Box<dyn Loader>;

    /// Whether [`Loader::process_stream`] delivers the records already stored
    /// before it waits for new ones.
    fn stream_includes_existing(&self) -> bool {
        false
    }
}

/// Scope and cacher shared by every loader implementation.
#[derive(Clone, Default)]
pub struct Binding {
    scope: Scope,
    cache: Option<SharedCacher>,
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("scope", &self.scope)
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

impl Binding {
    /// Currently bound scope.
    #[must_use]
    pub const fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Sets the device UUID.
    pub fn set_device(&mut self, device: Uuid) {
        self.scope.device = device;
    }

    /// Sets the application UUID.
    pub fn set_app(&mut self, app: Uuid) {
        self.scope.app = Some(app);
    }

    /// Sets the cacher.
    pub fn set_cache(&mut self, cache: SharedCacher) {
        self.cache = Some(cache);
    }

    /// Builds the per-call delivery state.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Config`] if no device is bound, or if `kind`
    /// is app-scoped and no app is bound.
    pub fn delivery(&self, kind: LoaderObjectType, process: ProcessFunction) -> Result<Delivery> {
        if self.scope.device.is_nil() {
            return Err(TelemetryError::Config("device UUID is not set".to_string()));
        }
        if kind.is_app_scoped() && self.scope.app.is_none() {
            return Err(TelemetryError::Config(format!("{kind} records need an app UUID")));
        }
        Ok(Delivery::new(
            self.scope.device,
            kind,
            self.cache.clone(),
            process,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> ProcessFunction {
        Box::new(|_| Ok(true))
    }

    #[test]
    fn delivery_requires_device() {
        let binding = Binding::default();
        let err = binding.delivery(LoaderObjectType::Logs, noop()).unwrap_err();
        assert!(matches!(err, TelemetryError::Config(_)));
    }

    #[test]
    fn app_logs_require_app() {
        let mut binding = Binding::default();
        binding.set_device(Uuid::new_v4());
        assert!(binding.delivery(LoaderObjectType::AppLog, noop()).is_err());

        binding.set_app(Uuid::new_v4());
        let delivery = binding.delivery(LoaderObjectType::AppLog, noop()).unwrap();
        assert_eq!(delivery.kind(), LoaderObjectType::AppLog);
    }
}
