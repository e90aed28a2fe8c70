//! Error types for the telemetry retrieval engine.

use std::time::Duration;

use thiserror::Error;

use crate::types::LoaderObjectType;

/// Errors that can occur while loading, caching or filtering telemetry.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Invalid or incomplete configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The backend refused the initial connection.
    #[error("cannot connect to {backend}: {reason}")]
    Connect {
        /// Backend name.
        backend: &'static str,
        /// Underlying failure.
        reason: String,
    },

    /// A query path or regular expression could not be compiled.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A record payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A record decoded fine but carries no timestamp.
    #[error("record of kind {0} has no timestamp")]
    MissingTimestamp(LoaderObjectType),

    /// The backend has no location configured for this record kind.
    #[error("{backend} backend does not carry {kind} records")]
    Unsupported {
        /// Backend name.
        backend: &'static str,
        /// Requested record kind.
        kind: LoaderObjectType,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Filesystem watch failure.
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    /// The filesystem watcher stopped delivering events.
    #[error("watcher closed")]
    WatcherClosed,

    /// Redis command failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Postgres query or notification wait failed.
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// HTTP transport failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The controller answered with a non-success status.
    #[error("unexpected status {status} from {url}")]
    HttpStatus {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// A long-held stream ended without a stop decision.
    #[error("{0} stream ended")]
    StreamEnded(&'static str),

    /// No terminating event before the deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The retry policy gave up.
    #[error("all {attempts} connection attempts failed, last error: {last}")]
    RetriesExhausted {
        /// Number of consecutive failed attempts.
        attempts: u32,
        /// Display form of the last failure.
        last: String,
    },

    /// The process function returned an error.
    #[error("process function failed: {0}")]
    Handler(#[source] Box<TelemetryError>),
}

impl TelemetryError {
    /// Returns true for backend failures the retry policy should absorb.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Redis(_)
                | Self::Postgres(_)
                | Self::Http(_)
                | Self::HttpStatus { .. }
                | Self::StreamEnded(_)
        )
    }

    /// Returns true if this error reports an elapsed deadline.
    ///
    /// Callers use this to tell "nothing matched in time" apart from hard failures.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Returns true if a record payload, possibly inside a handler error, failed to decode.
    #[must_use]
    pub fn is_decode(&self) -> bool {
        match self {
            Self::Decode(_) => true,
            Self::Handler(inner) => inner.is_decode(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for TelemetryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<prost::DecodeError> for TelemetryError {
    fn from(err: prost::DecodeError) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<regex::Error> for TelemetryError {
    fn from(err: regex::Error) -> Self {
        Self::InvalidQuery(err.to_string())
    }
}

/// Result type alias for telemetry operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = TelemetryError::Config("missing addr".to_string());
        assert_eq!(err.to_string(), "configuration error: missing addr");

        let err = TelemetryError::MissingTimestamp(LoaderObjectType::Info);
        assert_eq!(err.to_string(), "record of kind info has no timestamp");

        let err = TelemetryError::Unsupported {
            backend: "postgres",
            kind: LoaderObjectType::FlowLog,
        };
        assert_eq!(
            err.to_string(),
            "postgres backend does not carry flowlog records"
        );

        let err = TelemetryError::RetriesExhausted {
            attempts: 3,
            last: "refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "all 3 connection attempts failed, last error: refused"
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TelemetryError>();
    }

    #[test]
    fn transient_classification() {
        assert!(TelemetryError::StreamEnded("remote").is_transient());
        assert!(
            TelemetryError::HttpStatus {
                url: "http://x".to_string(),
                status: 503
            }
            .is_transient()
        );
        assert!(!TelemetryError::Decode("bad".to_string()).is_transient());
        assert!(!TelemetryError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!TelemetryError::WatcherClosed.is_transient());
        assert!(
            !TelemetryError::Handler(Box::new(TelemetryError::StreamEnded("redis")))
                .is_transient()
        );
    }

    #[test]
    fn timeout_and_decode_predicates() {
        assert!(TelemetryError::Timeout(Duration::from_millis(5)).is_timeout());
        assert!(!TelemetryError::WatcherClosed.is_timeout());

        let nested = TelemetryError::Handler(Box::new(TelemetryError::Decode("x".into())));
        assert!(nested.is_decode());
        assert!(!TelemetryError::WatcherClosed.is_decode());
    }

    #[test]
    fn serde_json_error_becomes_decode() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: TelemetryError = json_err.into();
        assert!(matches!(err, TelemetryError::Decode(_)));
    }

    #[test]
    fn io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TelemetryError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
    }
}
