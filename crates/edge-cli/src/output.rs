//! Output formatting for matched records.
//!
//! Supports one-line (compact JSON) and pretty JSON output, either of whole
//! records or of selected field paths.

use std::fmt::Write as _;

use edge_telemetry::{PrintResult, Record, select};
use serde::Serialize;

use crate::cli::Format;

/// Renders matched records for printing.
#[derive(Debug, Clone)]
pub struct Printer {
    format: Format,
    fields: Vec<String>,
}

impl Printer {
    /// Create a printer; an empty `fields` list prints whole records.
    #[must_use]
    pub const fn new(format: Format, fields: Vec<String>) -> Self {
        Self { format, fields }
    }

    /// Render one record, without a trailing newline.
    ///
    /// # Errors
    ///
    /// Returns an error if a field path is malformed or the record cannot
    /// be serialized.
    pub fn render<R: Record>(&self, record: &R) -> edge_telemetry::Result<String> {
        if self.fields.is_empty() {
            return self.serialize(record);
        }
        let selected = select(record, &self.fields)?;
        match self.format {
            Format::Json => self.serialize(&selected),
            Format::Lines => Ok(self.fields_line(&selected)),
        }
    }

    fn serialize<T: Serialize>(&self, value: &T) -> edge_telemetry::Result<String> {
        Ok(match self.format {
            Format::Lines => serde_json::to_string(value)?,
            Format::Json => serde_json::to_string_pretty(value)?,
        })
    }

    // requested order, not map order
    fn fields_line(&self, selected: &PrintResult) -> String {
        let mut line = String::new();
        for path in &self.fields {
            let values = selected.get(path).map(|v| v.join(",")).unwrap_or_default();
            if !line.is_empty() {
                line.push(' ');
            }
            let _ = write!(line, "{path}={values}");
        }
        line
    }
}
