//! Record schema declarations.
//!
//! # Responsibility
//! - Describe one record type: typed scalar fields, unique field sets and
//!   relationship collections.
//! - Provide a builder API and a serde shape for config files.
//!
//! # Invariants
//! - Field and relationship names share one namespace per schema.
//! - `defaults`, `set`, `add` and `id` are reserved and never declared as
//!   fields.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pseudo-field addressing a record by its stable id in lookups.
pub const ID_FIELD: &str = "id";

/// Field names that carry document structure or record identity.
pub const RESERVED_FIELD_NAMES: &[&str] = &["defaults", "set", "add", "#set", "#add", ID_FIELD];

/// Storage kind of one scalar field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Integer,
    Float,
    Boolean,
    /// Arbitrary JSON; nested record references are stored by id.
    Json,
    /// Single reference to a record of `target` schema.
    Reference { target: String },
}

impl FieldKind {
    /// Stable name used in diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Json => "json",
            Self::Reference { .. } => "reference",
        }
    }
}

/// Declaration of one scalar field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    #[serde(flatten)]
    pub kind: FieldKind,
    /// Field must be present and non-null after every write.
    #[serde(default)]
    pub required: bool,
    /// Upper bound in characters, meaningful for `text` fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

impl FieldDef {
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            required: false,
            max_length: None,
        }
    }

    pub fn text() -> Self {
        Self::new(FieldKind::Text)
    }

    pub fn integer() -> Self {
        Self::new(FieldKind::Integer)
    }

    pub fn float() -> Self {
        Self::new(FieldKind::Float)
    }

    pub fn boolean() -> Self {
        Self::new(FieldKind::Boolean)
    }

    pub fn json() -> Self {
        Self::new(FieldKind::Json)
    }

    pub fn reference(target: impl Into<String>) -> Self {
        Self::new(FieldKind::Reference {
            target: target.into(),
        })
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }
}

/// Declaration of one many-to-many relationship collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipDef {
    /// Schema name every member must belong to.
    pub target: String,
}

/// One record type known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDef {
    pub name: String,
    /// Field used to render human-readable outcome labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_field: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDef>,
    #[serde(default)]
    pub relationships: BTreeMap<String, RelationshipDef>,
    /// Field sets whose combined values must be unique within the schema.
    #[serde(default)]
    pub unique: Vec<Vec<String>>,
}

impl SchemaDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_field: None,
            fields: BTreeMap::new(),
            relationships: BTreeMap::new(),
            unique: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, def: FieldDef) -> Self {
        self.fields.insert(name.into(), def);
        self
    }

    pub fn relationship(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.relationships.insert(
            name.into(),
            RelationshipDef {
                target: target.into(),
            },
        );
        self
    }

    pub fn unique<I, T>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.unique
            .push(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn display_field(mut self, name: impl Into<String>) -> Self {
        self.display_field = Some(name.into());
        self
    }

    pub fn field_def(&self, name: &str) -> Option<&FieldDef> {
        self.fields.get(name)
    }

    pub fn relationship_def(&self, name: &str) -> Option<&RelationshipDef> {
        self.relationships.get(name)
    }
}
