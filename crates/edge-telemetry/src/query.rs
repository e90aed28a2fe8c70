//! Field-path queries over decoded records.
//!
//! A [`Query`] maps dotted field paths to regular expressions. Paths walk the
//! serde projection of a record, so one engine serves every record type:
//!
//! - `severity`: a plain field
//! - `dinfo.network[0].devName`: a fixed element of a repeated field
//! - `flows[].flow.destPort`: every element of a repeated field
//!
//! Field names compare case-insensitively with `_` and `-` ignored, so
//! `Severity`, `client-ip` and `clientIp` all resolve.
//!
//! A record matches when **every** path has **at least one** resolved value
//! matching its expression.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, TelemetryError};

/// Index part of a path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Index {
    /// Plain field access.
    None,
    /// A fixed element, `field[n]`.
    At(usize),
    /// Every element, `field[]`.
    All,
}

/// One step of a [`FieldPath`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Field name; empty when the path starts with an index.
    pub name: String,
    /// Optional index applied after the field lookup.
    pub index: Index,
}

/// A parsed dotted field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: Vec<Segment>,
}

impl FieldPath {
    /// Parses a path such as `items[].name` or `dinfo.network[2]`.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidQuery`] on empty segments or malformed brackets.
    pub fn parse(path: &str) -> Result<Self> {
        let trimmed = path.trim().trim_start_matches('.');
        if trimmed.is_empty() {
            return Err(TelemetryError::InvalidQuery("empty field path".to_string()));
        }

        let mut segments = Vec::new();
        for part in trimmed.split('.') {
            segments.extend(parse_segment(part, path)?);
        }
        Ok(Self {
            raw: path.to_string(),
            segments,
        })
    }

    /// The path as written by the caller.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The parsed segments.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Resolves the path against a JSON value, expanding wildcards.
    ///
    /// Missing fields and out-of-range indexes resolve to nothing.
    #[must_use]
    pub fn resolve<'v>(&self, root: &'v Value) -> Vec<&'v Value> {
        let mut current = vec![root];
        for segment in &self.segments {
            let mut next = Vec::new();
            for value in current {
                let field = if segment.name.is_empty() {
                    Some(value)
                } else {
                    lookup_field(value, &segment.name)
                };
                let Some(field) = field else { continue };
                match segment.index {
                    Index::None => next.push(field),
                    Index::At(n) => {
                        if let Some(item) = field.as_array().and_then(|items| items.get(n)) {
                            next.push(item);
                        }
                    }
                    Index::All => match field {
                        Value::Array(items) => next.extend(items.iter()),
                        Value::Object(map) => next.extend(map.values()),
                        _ => {}
                    },
                }
            }
            if next.is_empty() {
                return next;
            }
            current = next;
        }
        current
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// A dot-separated part may carry several indexes: `matrix[1][]`.
fn parse_segment(part: &str, path: &str) -> Result<Vec<Segment>> {
    let malformed = || TelemetryError::InvalidQuery(format!("malformed path: {path}"));

    let (name, mut rest) = match part.find('[') {
        Some(pos) => (&part[..pos], &part[pos..]),
        None => (part, ""),
    };
    if name.contains(']') || (name.is_empty() && rest.is_empty()) {
        return Err(malformed());
    }

    let mut segments = Vec::new();
    let mut name = name.to_string();
    if rest.is_empty() {
        segments.push(Segment {
            name,
            index: Index::None,
        });
        return Ok(segments);
    }
    while !rest.is_empty() {
        if !rest.starts_with('[') {
            return Err(malformed());
        }
        let close = rest.find(']').ok_or_else(malformed)?;
        let inner = rest[1..close].trim();
        let index = if inner.is_empty() {
            Index::All
        } else {
            Index::At(inner.parse().map_err(|_| malformed())?)
        };
        segments.push(Segment {
            name: std::mem::take(&mut name),
            index,
        });
        rest = &rest[close + 1..];
    }
    Ok(segments)
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

fn lookup_field<'v>(value: &'v Value, name: &str) -> Option<&'v Value> {
    let map = value.as_object()?;
    if let Some(found) = map.get(name) {
        return Some(found);
    }
    let wanted = normalize(name);
    map.iter()
        .find(|(key, _)| normalize(key) == wanted)
        .map(|(_, v)| v)
}

/// Renders a resolved value the way it is matched and printed.
#[must_use]
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Compiled set of path → regex predicates.
#[derive(Debug, Clone, Default)]
pub struct Query {
    predicates: Vec<(FieldPath, Regex)>,
}

impl Query {
    /// Compiles a query from a path → regex map.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidQuery`] for a malformed path or regex.
    pub fn new<K, V>(terms: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut predicates = Vec::new();
        for (path, pattern) in terms {
            let path = FieldPath::parse(path.as_ref())?;
            let regex = Regex::new(pattern.as_ref()).map_err(|e| {
                TelemetryError::InvalidQuery(format!("bad expression for {path}: {e}"))
            })?;
            predicates.push((path, regex));
        }
        Ok(Self { predicates })
    }

    /// Compiles a query from a `HashMap`, the shape CLI collaborators pass around.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidQuery`] for a malformed path or regex.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        Self::new(map.iter())
    }

    /// Returns true if the query has no predicates and so matches everything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Matches a decoded record.
    ///
    /// A record that cannot be projected to JSON never matches.
    pub fn matches<T: Serialize>(&self, record: &T) -> bool {
        if self.is_empty() {
            return true;
        }
        match serde_json::to_value(record) {
            Ok(value) => self.matches_value(&value),
            Err(e) => {
                tracing::debug!(error = %e, "record has no JSON projection");
                false
            }
        }
    }

    /// Matches an already projected record.
    #[must_use]
    pub fn matches_value(&self, value: &Value) -> bool {
        self.predicates.iter().all(|(path, regex)| {
            path.resolve(value)
                .into_iter()
                .any(|v| regex.is_match(&stringify(v)))
        })
    }
}

/// Field values selected for printing, keyed by the requested path.
pub type PrintResult = BTreeMap<String, Vec<String>>;

/// Collects the stringified values at each of `paths`.
///
/// # Errors
///
/// Returns an error if a path is malformed or the record cannot be projected.
pub fn select<T: Serialize>(record: &T, paths: &[String]) -> Result<PrintResult> {
    let value = serde_json::to_value(record)?;
    let mut result = PrintResult::new();
    for raw in paths {
        let path = FieldPath::parse(raw)?;
        let values = path.resolve(&value).into_iter().map(stringify).collect();
        result.insert(raw.clone(), values);
    }
    Ok(result)
}
