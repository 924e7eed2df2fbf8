//! Reference marker syntax.
//!
//! # Responsibility
//! - Decode the structured form `{"<type>": {"<field>": <value>, ...}}`.
//! - Decode the legacy string form `#ref:<type>:<field>:<value>...`.
//!
//! # Invariants
//! - Both forms decode into the same `ReferenceMarker` shape.
//! - A marker always carries at least one predicate pair.

use serde_json::{Map, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Prefix that turns a string value into a legacy reference marker.
pub const LEGACY_REFERENCE_PREFIX: &str = "#ref:";

const LEGACY_SEPARATOR: char = ':';

/// Reference marker syntax error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedReference {
    pub input: String,
    pub reason: &'static str,
}

impl Display for MalformedReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed reference `{}`: {}", self.input, self.reason)
    }
}

impl Error for MalformedReference {}

/// Request to substitute an existing record for a literal value.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceMarker {
    /// Target record-type name as written in the document.
    pub schema: String,
    /// Exact-match lookup predicate; values may contain nested markers.
    pub predicate: Map<String, Value>,
}

impl ReferenceMarker {
    /// Builds a marker from one structured `{"<type>": {...}}` entry.
    pub fn structured(
        schema: &str,
        predicate: &Map<String, Value>,
    ) -> Result<Self, MalformedReference> {
        if predicate.is_empty() {
            return Err(MalformedReference {
                input: format!("{{\"{schema}\": {{}}}}"),
                reason: "lookup predicate must name at least one field",
            });
        }
        Ok(Self {
            schema: schema.to_string(),
            predicate: predicate.clone(),
        })
    }

    /// Returns whether `value` uses the legacy string surface syntax.
    pub fn is_legacy(value: &str) -> bool {
        value.starts_with(LEGACY_REFERENCE_PREFIX)
    }

    /// Parses `#ref:<type>:<field1>:<value1>:<field2>:<value2>...`.
    ///
    /// Values are kept as JSON strings; the store coerces them to the
    /// declared field kind.
    pub fn parse_legacy(value: &str) -> Result<Self, MalformedReference> {
        let malformed = |reason| MalformedReference {
            input: value.to_string(),
            reason,
        };

        let body = value
            .strip_prefix(LEGACY_REFERENCE_PREFIX)
            .ok_or_else(|| malformed("missing `#ref:` prefix"))?;
        let mut tokens = body.split(LEGACY_SEPARATOR);
        let schema = tokens
            .next()
            .map(str::trim)
            .filter(|schema| !schema.is_empty())
            .ok_or_else(|| malformed("record type is empty"))?;

        let pairs: Vec<&str> = tokens.collect();
        if pairs.is_empty() {
            return Err(malformed("lookup predicate must name at least one field"));
        }
        if pairs.len() % 2 != 0 {
            return Err(malformed("expected field/value pairs after the record type"));
        }

        let mut predicate = Map::new();
        for pair in pairs.chunks_exact(2) {
            let field = pair[0].trim();
            if field.is_empty() {
                return Err(malformed("field name is empty"));
            }
            predicate.insert(field.to_string(), Value::String(pair[1].to_string()));
        }

        Ok(Self {
            schema: schema.to_string(),
            predicate,
        })
    }
}
