//! Nested path engine
//!
//! A nested path is a dot-separated list of segments such as
//! `address.city` or `names.0`. Each segment is resolved against the kind
//! of the node it meets:
//!
//! - map: the segment is a string key
//! - list: the segment must be a non-negative decimal index
//! - record: the segment names a declared field
//!
//! Reads stop quietly at the first segment that does not resolve. Writes
//! create missing intermediate map entries but never extend lists or add
//! record fields.

use std::fmt;
use std::str::FromStr;

use crate::{StateError, StateResult, Value};

pub const SEPARATOR: char = '.';

/// A parsed, non-empty nested path
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NestedPath {
    raw: String,
    segments: Vec<String>,
}

impl NestedPath {
    /// Parse a dotted path, rejecting empty paths and empty segments
    pub fn parse(path: &str) -> StateResult<Self> {
        if path.is_empty() {
            return Err(StateError::invalid_argument("path must not be empty"));
        }

        let segments: Vec<String> = path.split(SEPARATOR).map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(StateError::invalid_argument(format!(
                "path '{path}' contains an empty segment"
            )));
        }

        Ok(NestedPath {
            raw: path.to_string(),
            segments,
        })
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[inline]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments (always at least one)
    #[inline]
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Leading segments and the terminal segment
    pub fn split_last(&self) -> (&[String], &str) {
        match self.segments.split_last() {
            Some((last, parents)) => (parents, last.as_str()),
            None => (&[], ""),
        }
    }

    /// Path formed by appending `other` below this one
    pub fn join(&self, other: &NestedPath) -> NestedPath {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        NestedPath {
            raw: format!("{}{SEPARATOR}{}", self.raw, other.raw),
            segments,
        }
    }

    /// The first `n` segments rendered as a dotted string
    fn prefix(&self, n: usize) -> String {
        let n = n.min(self.segments.len());
        self.segments[..n].join(".")
    }
}

impl fmt::Display for NestedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for NestedPath {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NestedPath::parse(s)
    }
}

/// Parse a sequence index: ASCII digits only, no sign
pub fn parse_index(segment: &str) -> Option<usize> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

/// Resolve one segment against a node
pub fn child<'a>(current: &'a Value, segment: &str) -> Option<&'a Value> {
    match current {
        Value::Map(map) => map.get(segment),
        Value::List(items) => parse_index(segment).and_then(|i| items.get(i)),
        Value::Record(record) => record.field(segment),
        _ => None,
    }
}

/// Resolve a full path; `None` if any segment is missing or the terminal is null
pub fn resolve<'a>(root: &'a Value, path: &NestedPath) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.segments() {
        current = child(current, segment)?;
    }
    match current {
        Value::Null => None,
        value => Some(value),
    }
}

/// Write `value` at `path`, creating missing intermediate maps
pub fn assign(root: &mut Value, path: &NestedPath, value: Value) -> StateResult<()> {
    let (parents, last) = path.split_last();
    let mut current = root;
    for (depth, segment) in parents.iter().enumerate() {
        current = descend_or_create(current, segment, path, depth)?;
    }
    put(current, last, value, path)
}

fn descend_or_create<'a>(
    current: &'a mut Value,
    segment: &str,
    path: &NestedPath,
    depth: usize,
) -> StateResult<&'a mut Value> {
    let slot = match current {
        Value::Map(map) => map.entry(segment.to_string()).or_insert(Value::Null),
        Value::List(items) => {
            let index = parse_index(segment).ok_or_else(|| {
                StateError::invalid_path(
                    path.as_str(),
                    format!("'{segment}' is not an index into the list at '{}'", path.prefix(depth)),
                )
            })?;
            let len = items.len();
            items.get_mut(index).ok_or(StateError::IndexOutOfRange {
                path: path.prefix(depth + 1),
                index,
                len,
            })?
        }
        Value::Record(record) => {
            let type_name = record.type_name().to_string();
            record
                .field_mut(segment)
                .ok_or_else(|| StateError::NoSuchField {
                    record: type_name,
                    field: segment.to_string(),
                })?
        }
        other => {
            return Err(StateError::invalid_path(
                path.as_str(),
                format!("cannot descend into {} at '{}'", other.kind(), path.prefix(depth)),
            ))
        }
    };

    if slot.is_null() {
        *slot = Value::empty_map();
    }
    Ok(slot)
}

fn put(target: &mut Value, segment: &str, value: Value, path: &NestedPath) -> StateResult<()> {
    match target {
        Value::Map(map) => {
            map.insert(segment.to_string(), value);
            Ok(())
        }
        Value::List(items) => {
            let index = parse_index(segment).ok_or_else(|| {
                StateError::invalid_path(path.as_str(), format!("'{segment}' is not a list index"))
            })?;
            let len = items.len();
            match items.get_mut(index) {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(StateError::IndexOutOfRange {
                    path: path.as_str().to_string(),
                    index,
                    len,
                }),
            }
        }
        Value::Record(record) => record.set_field(segment, value),
        other => Err(StateError::invalid_path(
            path.as_str(),
            format!("cannot assign into {}", other.kind()),
        )),
    }
}
