//! Runs one search described by the command line.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, bail};
use edge_telemetry::{
    ApiRequest, FlowMessage, InfoMsg, Loader, LoaderObjectType, LogEntry, MetricMsg, Record,
    TelemetryConfig, run_checker,
};
use parking_lot::Mutex;
use tracing::debug;

use crate::cli::Cli;
use crate::output::Printer;

/// How a search ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Records printed.
    pub printed: usize,
    /// Whether the wait for new records hit its deadline.
    pub timed_out: bool,
}

/// Resolves the configuration named on the command line.
///
/// # Errors
///
/// Returns an error if neither `--config` nor `--root` is given, or if the
/// configuration is invalid.
pub fn load_config(cli: &Cli) -> anyhow::Result<TelemetryConfig> {
    if let Some(path) = &cli.config {
        return TelemetryConfig::from_file(path)
            .with_context(|| format!("cannot load configuration from {}", path.display()));
    }
    let Some(root) = &cli.root else {
        bail!("either --config or --root is required");
    };
    let mut config = TelemetryConfig::default();
    config.file.root.clone_from(root);
    config.validate()?;
    Ok(config)
}

/// Searches with the loader `config` describes, writing matches to `out`.
///
/// A timeout ends the search normally; [`Outcome::timed_out`] reports it.
///
/// # Errors
///
/// Returns loader, query and output errors.
pub async fn search<W>(cli: &Cli, config: &TelemetryConfig, out: W) -> anyhow::Result<Outcome>
where
    W: Write + Send + 'static,
{
    let loader = config.build_loader()?;
    match LoaderObjectType::from(cli.kind) {
        LoaderObjectType::Logs | LoaderObjectType::AppLog => {
            run::<LogEntry, W>(loader.as_ref(), cli, out).await
        }
        LoaderObjectType::Info => run::<InfoMsg, W>(loader.as_ref(), cli, out).await,
        LoaderObjectType::Metrics => run::<MetricMsg, W>(loader.as_ref(), cli, out).await,
        LoaderObjectType::FlowLog => run::<FlowMessage, W>(loader.as_ref(), cli, out).await,
        LoaderObjectType::Request => run::<ApiRequest, W>(loader.as_ref(), cli, out).await,
    }
}

async fn run<R, W>(loader: &dyn Loader, cli: &Cli, mut out: W) -> anyhow::Result<Outcome>
where
    R: Record,
    W: Write + Send + 'static,
{
    let query = cli.compile_query()?;
    let printer = Printer::new(cli.format, cli.fields.clone());
    let once = cli.once;

    let printed = Arc::new(AtomicUsize::new(0));
    let failure: Arc<Mutex<Option<anyhow::Error>>> = Arc::new(Mutex::new(None));
    let counter = Arc::clone(&printed);
    let slot = Arc::clone(&failure);
    let handler = move |record: &R| {
        let written = printer
            .render(record)
            .map_err(anyhow::Error::from)
            .and_then(|line| writeln!(out, "{line}").map_err(anyhow::Error::from));
        match written {
            Ok(()) => {
                counter.fetch_add(1, Ordering::SeqCst);
                !once
            }
            Err(e) => {
                *slot.lock() = Some(e);
                false
            }
        }
    };

    let kind = LoaderObjectType::from(cli.kind);
    let mode = cli.checker_mode();
    debug!(%kind, ?mode, "starting search");
    let result = run_checker::<R, _>(loader, cli.scope(), kind, query, handler, mode, cli.timeout()).await;

    if let Some(e) = failure.lock().take() {
        return Err(e.context("cannot print record"));
    }
    let printed = printed.load(Ordering::SeqCst);
    match result {
        Ok(()) => Ok(Outcome {
            printed,
            timed_out: false,
        }),
        Err(e) if e.is_timeout() => Ok(Outcome {
            printed,
            timed_out: true,
        }),
        Err(e) => Err(e.into()),
    }
}
