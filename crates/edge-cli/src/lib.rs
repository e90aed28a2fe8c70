//! # edge-cli
//!
//! Command-line search over edge node telemetry.
//!
//! `edgetel` loads a [`edge_telemetry::TelemetryConfig`], builds the loader
//! it describes and prints every record of one kind that matches the given
//! field filters, replaying stored records, waiting for new ones, or both.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod output;
pub mod search;

pub use cli::{Cli, Format, Kind, Mode};
pub use output::Printer;
pub use search::{Outcome, search};
