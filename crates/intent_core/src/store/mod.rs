//! Record storage boundary.
//!
//! # Responsibility
//! - Define the operations the reconciler needs from storage: lookup by
//!   predicate, upsert, relationship mutation, validated save and scoped
//!   units of work.
//! - Provide the SQLite-backed implementation.
//!
//! # Invariants
//! - Lookups are exact-match on every predicate field.
//! - Zero matches and multiple matches are distinct typed failures.
//! - A scope either commits all of its writes or none of them.

pub mod sqlite_store;

use crate::db::DbError;
use crate::model::schema::{RelationshipDef, SchemaDef};
use crate::model::value::{FieldValues, RecordRef};
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage failure taxonomy.
#[derive(Debug)]
pub enum StoreError {
    /// Field or relationship is not declared on the schema.
    UnknownField { schema: String, field: String },
    /// Predicate value cannot be used for an exact-match lookup.
    InvalidLookup { schema: String, message: String },
    /// No record matched the predicate.
    NotFound { schema: String, predicate: String },
    /// More than one record matched the predicate.
    MultipleMatches {
        schema: String,
        predicate: String,
        count: usize,
    },
    /// Record state violates the schema.
    Validation {
        schema: String,
        field: Option<String>,
        message: String,
    },
    /// Uniqueness constraint conflict.
    Integrity { schema: String, message: String },
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    MissingRequiredTable(&'static str),
    /// Persisted data cannot be decoded.
    InvalidData(String),
    Db(DbError),
    /// Undoing a failed unit of work failed; its writes may have survived.
    RollbackFailed(DbError),
}

impl StoreError {
    /// Whether the failure means storage itself is unusable, as opposed to
    /// one record being rejected.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UninitializedConnection { .. }
                | Self::MissingRequiredTable(_)
                | Self::InvalidData(_)
                | Self::Db(_)
                | Self::RollbackFailed(_)
        )
    }

    /// Field the failure is attributed to, when known.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::UnknownField { field, .. } => Some(field),
            Self::Validation { field, .. } => field.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn validation(
        schema: &SchemaDef,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Validation {
            schema: schema.name.clone(),
            field: Some(field.into()),
            message: message.into(),
        }
    }

    pub(crate) fn unknown_field(schema: &SchemaDef, field: impl Into<String>) -> Self {
        Self::UnknownField {
            schema: schema.name.clone(),
            field: field.into(),
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownField { schema, field } => {
                write!(f, "`{schema}` has no field `{field}`")
            }
            Self::InvalidLookup { schema, message } => {
                write!(f, "invalid lookup on `{schema}`: {message}")
            }
            Self::NotFound { schema, predicate } => {
                write!(f, "`{schema}` matching {predicate} does not exist")
            }
            Self::MultipleMatches {
                schema,
                predicate,
                count,
            } => write!(
                f,
                "expected one `{schema}` matching {predicate}, found {count}"
            ),
            Self::Validation {
                schema,
                field: Some(field),
                message,
            } => write!(f, "invalid `{schema}.{field}`: {message}"),
            Self::Validation {
                schema,
                field: None,
                message,
            } => write!(f, "invalid `{schema}`: {message}"),
            Self::Integrity { schema, message } => {
                write!(f, "integrity conflict on `{schema}`: {message}")
            }
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "record store requires schema version {expected_version}, got {actual_version}"
            ),
            Self::MissingRequiredTable(table) => {
                write!(f, "record store requires table `{table}`")
            }
            Self::InvalidData(message) => write!(f, "invalid persisted record data: {message}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::RollbackFailed(err) => write!(f, "failed to roll back unit of work: {err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) | Self::RollbackFailed(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Result of an update-or-create call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Upserted {
    pub record: RecordRef,
    /// Human-readable label, from the schema's display field when set.
    pub label: String,
    /// `true` when the record was inserted, `false` when a match was updated.
    pub created: bool,
}

/// Storage operations required by the reconciler.
pub trait RecordStore {
    /// Returns the single record matching every predicate field.
    fn find_by(&self, schema: &SchemaDef, predicate: &FieldValues) -> StoreResult<RecordRef>;

    /// Updates the record matching `lookup` with `defaults`, or creates one
    /// from `lookup` plus `defaults`.
    fn update_or_create(
        &self,
        schema: &SchemaDef,
        lookup: &FieldValues,
        defaults: &FieldValues,
    ) -> StoreResult<Upserted>;

    /// Re-validates and saves a record after relationship mutation.
    fn persist(&self, schema: &SchemaDef, record: &RecordRef) -> StoreResult<()>;

    /// Makes the members of `field` exactly `members`.
    fn replace_members(
        &self,
        owner: &RecordRef,
        field: &str,
        relationship: &RelationshipDef,
        members: &[RecordRef],
    ) -> StoreResult<()>;

    /// Appends `members` to `field`; members already present are kept once.
    fn add_members(
        &self,
        owner: &RecordRef,
        field: &str,
        relationship: &RelationshipDef,
        members: &[RecordRef],
    ) -> StoreResult<()>;

    /// Runs `work` as one all-or-nothing unit. Writes are kept only when
    /// `work` returns `Ok`; scopes may nest.
    ///
    /// When undoing a failed `work` itself fails, the result is
    /// [`StoreError::RollbackFailed`] instead of the error `work` returned.
    fn scoped<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<StoreError>;
}

/// Mutation handle for one relationship collection of one record.
pub struct RelationshipField<'a, S: RecordStore> {
    store: &'a S,
    owner: &'a RecordRef,
    name: &'a str,
    def: &'a RelationshipDef,
}

impl<'a, S: RecordStore> RelationshipField<'a, S> {
    /// Looks up relationship `name` on `schema` for `owner`.
    pub fn bind(
        store: &'a S,
        schema: &'a SchemaDef,
        owner: &'a RecordRef,
        name: &'a str,
    ) -> StoreResult<Self> {
        let def = schema
            .relationship_def(name)
            .ok_or_else(|| StoreError::unknown_field(schema, name))?;
        Ok(Self {
            store,
            owner,
            name,
            def,
        })
    }

    /// Schema name every member must belong to.
    pub fn target(&self) -> &str {
        &self.def.target
    }

    pub fn replace(&self, members: &[RecordRef]) -> StoreResult<()> {
        self.store
            .replace_members(self.owner, self.name, self.def, members)
    }

    pub fn add(&self, members: &[RecordRef]) -> StoreResult<()> {
        self.store.add_members(self.owner, self.name, self.def, members)
    }
}
