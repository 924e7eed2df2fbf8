//! In-process schema registry.

use crate::model::schema::{FieldKind, SchemaDef, RESERVED_FIELD_NAMES};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::Arc;

static SCHEMA_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z][a-z0-9_]*(\.[a-z][a-z0-9_]*)*$").expect("valid schema name regex")
});
static FIELD_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid field name regex"));

/// Schema registration/lookup errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    InvalidSchemaName(String),
    DuplicateSchema(String),
    UnknownSchema(String),
    InvalidFieldName {
        schema: String,
        field: String,
    },
    DuplicateFieldName {
        schema: String,
        field: String,
    },
    UnknownDeclaredField {
        schema: String,
        field: String,
        usage: &'static str,
    },
    DanglingTarget {
        schema: String,
        field: String,
        target: String,
    },
    Config(String),
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSchemaName(value) => write!(f, "schema name is invalid: {value}"),
            Self::DuplicateSchema(value) => write!(f, "schema already registered: {value}"),
            Self::UnknownSchema(value) => write!(f, "unknown record type: {value}"),
            Self::InvalidFieldName { schema, field } => {
                write!(f, "field name `{field}` of `{schema}` is invalid or reserved")
            }
            Self::DuplicateFieldName { schema, field } => write!(
                f,
                "`{field}` of `{schema}` is declared as both a field and a relationship"
            ),
            Self::UnknownDeclaredField {
                schema,
                field,
                usage,
            } => write!(f, "{usage} of `{schema}` names unknown field `{field}`"),
            Self::DanglingTarget {
                schema,
                field,
                target,
            } => write!(
                f,
                "`{schema}.{field}` targets unregistered record type `{target}`"
            ),
            Self::Config(message) => write!(f, "invalid schema config: {message}"),
        }
    }
}

impl Error for RegistryError {}

/// Serde shape of a schema config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub schemas: Vec<SchemaDef>,
}

/// Name to schema handle mapping, populated at load time.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, Arc<SchemaDef>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry and checks every cross-schema target.
    pub fn from_schemas(schemas: impl IntoIterator<Item = SchemaDef>) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for schema in schemas {
            registry.register(schema)?;
        }
        registry.validate_targets()?;
        Ok(registry)
    }

    pub fn from_config(config: RegistryConfig) -> Result<Self, RegistryError> {
        Self::from_schemas(config.schemas)
    }

    /// Parses a JSON schema config document.
    pub fn from_json_str(payload: &str) -> Result<Self, RegistryError> {
        let config: RegistryConfig =
            serde_json::from_str(payload).map_err(|err| RegistryError::Config(err.to_string()))?;
        Self::from_config(config)
    }

    /// Reads and parses a JSON schema config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let payload = std::fs::read_to_string(path).map_err(|err| {
            RegistryError::Config(format!("failed to read `{}`: {err}", path.display()))
        })?;
        Self::from_json_str(&payload)
    }

    /// Registers one schema after validating its own declarations.
    ///
    /// Targets of reference fields and relationships are checked by
    /// `validate_targets` once all schemas are known.
    pub fn register(&mut self, mut schema: SchemaDef) -> Result<(), RegistryError> {
        schema.name = normalize_schema_name(&schema.name);
        if !SCHEMA_NAME_RE.is_match(&schema.name) {
            return Err(RegistryError::InvalidSchemaName(schema.name));
        }
        if self.schemas.contains_key(&schema.name) {
            return Err(RegistryError::DuplicateSchema(schema.name));
        }
        validate_declarations(&mut schema)?;

        self.schemas.insert(schema.name.clone(), Arc::new(schema));
        Ok(())
    }

    /// Checks that every reference field and relationship targets a
    /// registered schema.
    pub fn validate_targets(&self) -> Result<(), RegistryError> {
        for schema in self.schemas.values() {
            let field_targets = schema.fields.iter().filter_map(|(name, def)| match &def.kind {
                FieldKind::Reference { target } => Some((name, target)),
                _ => None,
            });
            let relationship_targets = schema
                .relationships
                .iter()
                .map(|(name, def)| (name, &def.target));

            for (field, target) in field_targets.chain(relationship_targets) {
                if !self.contains(target) {
                    return Err(RegistryError::DanglingTarget {
                        schema: schema.name.clone(),
                        field: field.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Resolves a record-type name to its schema handle.
    pub fn resolve(&self, name: &str) -> Result<Arc<SchemaDef>, RegistryError> {
        let normalized = normalize_schema_name(name);
        self.schemas
            .get(&normalized)
            .cloned()
            .ok_or(RegistryError::UnknownSchema(normalized))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(&normalize_schema_name(name))
    }

    /// Returns sorted schema names.
    pub fn schema_names(&self) -> Vec<String> {
        self.schemas.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

/// Normalizes a record-type name for lookup (trimmed, lowercase).
pub fn normalize_schema_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

fn validate_declarations(schema: &mut SchemaDef) -> Result<(), RegistryError> {
    let invalid_name = |field: &str| {
        !FIELD_NAME_RE.is_match(field) || RESERVED_FIELD_NAMES.contains(&field)
    };

    for field in schema.fields.keys().chain(schema.relationships.keys()) {
        if invalid_name(field.as_str()) {
            return Err(RegistryError::InvalidFieldName {
                schema: schema.name.clone(),
                field: field.clone(),
            });
        }
    }
    if let Some(field) = schema
        .relationships
        .keys()
        .find(|name| schema.fields.contains_key(*name))
    {
        return Err(RegistryError::DuplicateFieldName {
            schema: schema.name.clone(),
            field: field.clone(),
        });
    }

    if let Some(display) = schema.display_field.as_ref() {
        if !schema.fields.contains_key(display) {
            return Err(RegistryError::UnknownDeclaredField {
                schema: schema.name.clone(),
                field: display.clone(),
                usage: "display_field",
            });
        }
    }
    for field in schema.unique.iter().flatten() {
        if !schema.fields.contains_key(field) {
            return Err(RegistryError::UnknownDeclaredField {
                schema: schema.name.clone(),
                field: field.clone(),
                usage: "unique constraint",
            });
        }
    }

    for def in schema.fields.values_mut() {
        if let FieldKind::Reference { target } = &mut def.kind {
            *target = normalize_schema_name(target);
        }
    }
    for def in schema.relationships.values_mut() {
        def.target = normalize_schema_name(&def.target);
    }

    Ok(())
}
