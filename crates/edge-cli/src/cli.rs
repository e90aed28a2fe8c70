//! Command-line argument parsing with clap.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use edge_telemetry::{CheckerMode, LoaderObjectType, Query, Scope};
use uuid::Uuid;

/// Search telemetry of edge nodes stored by a controller.
#[derive(Parser, Debug, Clone)]
#[command(name = "edgetel")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// JSON configuration file selecting the controller backend.
    #[arg(short, long, env = "EDGETEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Read from this on-disk device tree instead of a configured backend.
    #[arg(long, conflicts_with = "config")]
    pub root: Option<PathBuf>,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = Format::Lines)]
    pub format: Format,

    /// Kind of record to search.
    #[arg(value_enum)]
    pub kind: Kind,

    /// Device UUID.
    #[arg(short, long)]
    pub device: Uuid,

    /// Application instance UUID, required for app logs.
    #[arg(short, long, required_if_eq("kind", "applog"))]
    pub app: Option<Uuid>,

    /// Field filter as `path=regex`; repeat to require several.
    #[arg(short, long = "query", value_name = "PATH=REGEX", value_parser = parse_term)]
    pub query: Vec<(String, String)>,

    /// Which records to search.
    #[arg(short, long, value_enum, default_value_t = Mode::Existing)]
    pub mode: Mode,

    /// Print only the last N stored matches.
    #[arg(short, long, conflicts_with = "mode")]
    pub tail: Option<usize>,

    /// Seconds to wait for new records; 0 waits forever.
    #[arg(long, default_value_t = 0)]
    pub timeout: u64,

    /// Print only these field paths (comma-separated).
    #[arg(long, value_delimiter = ',')]
    pub fields: Vec<String>,

    /// Stop after the first match.
    #[arg(long)]
    pub once: bool,
}

impl Cli {
    /// Scope of the search.
    #[must_use]
    pub const fn scope(&self) -> Scope {
        match self.app {
            Some(app) => Scope::app(self.device, app),
            None => Scope::device(self.device),
        }
    }

    /// Compiled field filters.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed path or regex.
    pub fn compile_query(&self) -> edge_telemetry::Result<Query> {
        Query::new(self.query.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// Search mode, with `--tail` taking precedence.
    #[must_use]
    pub fn checker_mode(&self) -> CheckerMode {
        match self.tail {
            Some(n) => CheckerMode::Tail(n),
            None => self.mode.into(),
        }
    }

    /// Wait bound for the waiting modes.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

fn parse_term(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((path, regex)) if !path.is_empty() => Ok((path.to_string(), regex.to_string())),
        _ => Err(format!("expected PATH=REGEX, got '{raw}'")),
    }
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Format {
    /// One compact line per record.
    #[default]
    Lines,
    /// Pretty-printed JSON per record.
    Json,
}

/// Record kinds as named on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Kind {
    /// Device logs.
    Log,
    /// Device info snapshots.
    Info,
    /// Device metrics.
    Metric,
    /// Network flow logs.
    Flowlog,
    /// Controller API requests.
    Request,
    /// Application instance logs.
    Applog,
}

impl From<Kind> for LoaderObjectType {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Log => Self::Logs,
            Kind::Info => Self::Info,
            Kind::Metric => Self::Metrics,
            Kind::Flowlog => Self::FlowLog,
            Kind::Request => Self::Request,
            Kind::Applog => Self::AppLog,
        }
    }
}

/// Search modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Stored records only.
    Existing,
    /// New records only.
    New,
    /// Stored and new records.
    Any,
}

impl From<Mode> for CheckerMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Existing => Self::Existing,
            Mode::New => Self::New,
            Mode::Any => Self::Any,
        }
    }
}
