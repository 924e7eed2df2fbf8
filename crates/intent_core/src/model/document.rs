//! Intended state document model.
//!
//! # Responsibility
//! - Parse the JSON payload into ordered record groups and record specs.
//! - Pop `set`/`add` directives off a record spec.
//!
//! # Invariants
//! - Record-type order and spec order match the payload text.
//! - Shape errors are reported before any record is touched.
//! - A top-level directive wins over one nested in `defaults`; only the
//!   winner is removed from the spec.

use serde_json::{Map, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Key holding creation-only field values.
pub const DEFAULTS_KEY: &str = "defaults";

/// Relationship mutation directive kind.
///
/// `Set` replaces the members of a collection, `Add` appends to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Set,
    Add,
}

impl Directive {
    /// Accepted spellings, in lookup order.
    pub fn keys(self) -> &'static [&'static str] {
        match self {
            Self::Set => &["set", "#set"],
            Self::Add => &["add", "#add"],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Add => "add",
        }
    }
}

impl Display for Directive {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload shape error. Always fatal for the run.
#[derive(Debug)]
pub enum DocumentError {
    InvalidJson(serde_json::Error),
    NotAnObject,
    GroupNotArray { schema: String },
    SpecNotObject { schema: String, index: usize },
    DefaultsNotObject { schema: String, index: usize },
}

impl Display for DocumentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJson(err) => write!(f, "invalid intended state JSON: {err}"),
            Self::NotAnObject => write!(f, "intended state must be a JSON object"),
            Self::GroupNotArray { schema } => {
                write!(f, "records for `{schema}` must be a JSON array")
            }
            Self::SpecNotObject { schema, index } => {
                write!(f, "record #{index} of `{schema}` must be a JSON object")
            }
            Self::DefaultsNotObject { schema, index } => write!(
                f,
                "`{DEFAULTS_KEY}` of record #{index} of `{schema}` must be a JSON object"
            ),
        }
    }
}

impl Error for DocumentError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidJson(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for DocumentError {
    fn from(value: serde_json::Error) -> Self {
        Self::InvalidJson(value)
    }
}

/// Whole intended state payload.
#[derive(Debug, Clone, PartialEq)]
pub struct IntendedState {
    pub groups: Vec<RecordGroup>,
}

/// Specs targeting one record type, in payload order.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordGroup {
    /// Record-type name as written in the payload.
    pub schema: String,
    pub specs: Vec<RecordSpec>,
}

/// One desired record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSpec {
    /// Lookup fields plus any directives not yet popped.
    pub fields: Map<String, Value>,
    /// Values applied on create or as updates to the matched record.
    pub defaults: Map<String, Value>,
}

/// Directive payloads popped off one spec.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecDirectives {
    pub set: Option<Value>,
    pub add: Option<Value>,
}

impl IntendedState {
    /// Parses UTF-8 JSON text.
    pub fn from_json_str(payload: &str) -> Result<Self, DocumentError> {
        let value: Value = serde_json::from_str(payload)?;
        Self::from_value(value)
    }

    /// Validates shape and splits each spec into fields and defaults.
    pub fn from_value(value: Value) -> Result<Self, DocumentError> {
        let Value::Object(root) = value else {
            return Err(DocumentError::NotAnObject);
        };

        let mut groups = Vec::with_capacity(root.len());
        for (schema, records) in root {
            let Value::Array(items) = records else {
                return Err(DocumentError::GroupNotArray { schema });
            };

            let mut specs = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                specs.push(RecordSpec::from_value(&schema, index, item)?);
            }
            groups.push(RecordGroup { schema, specs });
        }

        Ok(Self { groups })
    }

    /// Total number of record specs across all groups.
    pub fn spec_count(&self) -> usize {
        self.groups.iter().map(|group| group.specs.len()).sum()
    }
}

impl RecordSpec {
    fn from_value(schema: &str, index: usize, value: Value) -> Result<Self, DocumentError> {
        let Value::Object(mut fields) = value else {
            return Err(DocumentError::SpecNotObject {
                schema: schema.to_string(),
                index,
            });
        };

        let defaults = match fields.shift_remove(DEFAULTS_KEY) {
            None => Map::new(),
            Some(Value::Object(defaults)) => defaults,
            Some(_) => {
                return Err(DocumentError::DefaultsNotObject {
                    schema: schema.to_string(),
                    index,
                })
            }
        };

        Ok(Self { fields, defaults })
    }

    /// Pops both directives using top-level-first precedence.
    pub fn take_directives(&mut self) -> SpecDirectives {
        SpecDirectives {
            set: self.take_directive(Directive::Set),
            add: self.take_directive(Directive::Add),
        }
    }

    fn take_directive(&mut self, directive: Directive) -> Option<Value> {
        for source in [&mut self.fields, &mut self.defaults] {
            for key in directive.keys() {
                if let Some(payload) = source.shift_remove(*key) {
                    return Some(payload);
                }
            }
        }
        None
    }
}
