//! Resolved values and record identities.
//!
//! # Responsibility
//! - Represent document values after reference resolution.
//! - Identify stored records independently of the storage backend.
//!
//! # Invariants
//! - `ResolvedValue::Scalar` never wraps a JSON array or object.
//! - A `RecordRef` always names the schema its id belongs to.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Stable identifier of one stored record.
pub type RecordId = Uuid;

/// Resolved field map keyed by field name.
pub type FieldValues = BTreeMap<String, ResolvedValue>;

/// Identity of one stored record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    pub schema: String,
    pub id: RecordId,
}

impl RecordRef {
    pub fn new(schema: impl Into<String>, id: RecordId) -> Self {
        Self {
            schema: schema.into(),
            id,
        }
    }
}

impl Display for RecordRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.schema, self.id)
    }
}

/// Document value with every reference marker replaced by a record.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedValue {
    Scalar(Value),
    Record(RecordRef),
    List(Vec<ResolvedValue>),
    Map(FieldValues),
}

impl ResolvedValue {
    /// Converts plain JSON without looking for markers.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => Self::Map(
                map.iter()
                    .map(|(key, item)| (key.clone(), Self::from_json(item)))
                    .collect(),
            ),
            scalar => Self::Scalar(scalar.clone()),
        }
    }

    /// Renders the storable JSON form; records collapse to their id string.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Scalar(value) => value.clone(),
            Self::Record(record) => Value::String(record.id.to_string()),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => Value::Object(
                map.iter()
                    .map(|(key, item)| (key.clone(), item.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn as_record(&self) -> Option<&RecordRef> {
        match self {
            Self::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Scalar(Value::Null))
    }

    /// Wraps a bare value into a one-element list; lists pass through.
    pub fn into_members(self) -> Vec<ResolvedValue> {
        match self {
            Self::List(items) => items,
            other => vec![other],
        }
    }
}

impl From<RecordRef> for ResolvedValue {
    fn from(value: RecordRef) -> Self {
        Self::Record(value)
    }
}

impl From<Value> for ResolvedValue {
    fn from(value: Value) -> Self {
        Self::from_json(&value)
    }
}
