//! Reference resolution.
//!
//! # Responsibility
//! - Replace every reference marker reachable from a JSON value with the
//!   record it denotes.
//!
//! # Invariants
//! - Input values are never mutated; a new resolved structure is returned.
//! - A marker resolves to exactly one record or fails; lookup failures are
//!   returned to the caller, never swallowed.
//! - Predicate values are resolved before the predicate is used.

use crate::model::reference::{MalformedReference, ReferenceMarker};
use crate::model::value::{FieldValues, ResolvedValue};
use crate::registry::schema_registry::SchemaRegistry;
use crate::store::{RecordStore, StoreError};
use log::trace;
use serde_json::{Map, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type ResolveResult<T> = Result<T, ResolveError>;

/// Reference resolution failure.
#[derive(Debug)]
pub enum ResolveError {
    MalformedReference(MalformedReference),
    /// Marker names a record type the registry does not know.
    UnknownSchema(String),
    Store(StoreError),
}

impl ResolveError {
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Store(err) => err.is_fatal(),
            Self::MalformedReference(_) | Self::UnknownSchema(_) => false,
        }
    }
}

impl Display for ResolveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedReference(err) => write!(f, "{err}"),
            Self::UnknownSchema(name) => write!(f, "reference to unknown record type `{name}`"),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ResolveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::MalformedReference(err) => Some(err),
            Self::UnknownSchema(_) => None,
            Self::Store(err) => Some(err),
        }
    }
}

impl From<MalformedReference> for ResolveError {
    fn from(value: MalformedReference) -> Self {
        Self::MalformedReference(value)
    }
}

impl From<StoreError> for ResolveError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

/// Resolution failure attributed to one field of a field map.
#[derive(Debug)]
pub struct FieldResolveError {
    pub field: String,
    pub error: ResolveError,
}

impl Display for FieldResolveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "field `{}`: {}", self.field, self.error)
    }
}

impl Error for FieldResolveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.error)
    }
}

/// Resolves reference markers against a registry and a record store.
pub struct ReferenceResolver<'a, S: RecordStore> {
    registry: &'a SchemaRegistry,
    store: &'a S,
}

impl<'a, S: RecordStore> ReferenceResolver<'a, S> {
    pub fn new(registry: &'a SchemaRegistry, store: &'a S) -> Self {
        Self { registry, store }
    }

    /// Returns `value` with every reachable marker replaced by a record.
    pub fn resolve(&self, value: &Value) -> ResolveResult<ResolvedValue> {
        match value {
            Value::Object(map) => match self.structured_marker(map)? {
                Some(marker) => self.resolve_marker(&marker),
                None => Ok(ResolvedValue::Map(self.resolve_map(map)?)),
            },
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve(item))
                .collect::<ResolveResult<Vec<_>>>()
                .map(ResolvedValue::List),
            Value::String(text) if ReferenceMarker::is_legacy(text) => {
                let marker = ReferenceMarker::parse_legacy(text)?;
                self.resolve_marker(&marker)
            }
            scalar => Ok(ResolvedValue::Scalar(scalar.clone())),
        }
    }

    /// Resolves every value of a field map, naming the field that failed.
    pub fn resolve_fields(
        &self,
        fields: &Map<String, Value>,
    ) -> Result<FieldValues, FieldResolveError> {
        let mut resolved = FieldValues::new();
        for (field, value) in fields {
            let value = self.resolve(value).map_err(|error| FieldResolveError {
                field: field.clone(),
                error,
            })?;
            resolved.insert(field.clone(), value);
        }
        Ok(resolved)
    }

    fn resolve_map(&self, map: &Map<String, Value>) -> ResolveResult<FieldValues> {
        map.iter()
            .map(|(key, item)| Ok((key.clone(), self.resolve(item)?)))
            .collect()
    }

    /// A single-key object whose key is a registered record type and whose
    /// value is an object is a marker; anything else is a literal.
    fn structured_marker(
        &self,
        map: &Map<String, Value>,
    ) -> ResolveResult<Option<ReferenceMarker>> {
        if map.len() != 1 {
            return Ok(None);
        }
        let Some((schema, Value::Object(predicate))) = map.iter().next() else {
            return Ok(None);
        };
        if !self.registry.contains(schema) {
            return Ok(None);
        }
        Ok(Some(ReferenceMarker::structured(schema, predicate)?))
    }

    fn resolve_marker(&self, marker: &ReferenceMarker) -> ResolveResult<ResolvedValue> {
        let schema = self
            .registry
            .resolve(&marker.schema)
            .map_err(|_| ResolveError::UnknownSchema(marker.schema.clone()))?;
        let predicate = self.resolve_map(&marker.predicate)?;
        let record = self.store.find_by(&schema, &predicate)?;
        trace!(
            "event=reference_resolved module=resolver status=ok schema={} record={}",
            schema.name,
            record.id
        );
        Ok(ResolvedValue::Record(record))
    }
}
