//! Intended state reconciliation core.
//! Resolves record references and upserts declared records into a store.

pub mod db;
pub mod logging;
pub mod model;
pub mod registry;
pub mod service;
pub mod store;

pub use db::{open_db, open_db_in_memory, DbError, DbResult};
pub use logging::{default_log_level, init_logging, logging_status, LogTarget};
pub use model::document::{Directive, DocumentError, IntendedState, RecordGroup, RecordSpec};
pub use model::reference::{MalformedReference, ReferenceMarker};
pub use model::schema::{FieldDef, FieldKind, RelationshipDef, SchemaDef};
pub use model::value::{FieldValues, RecordId, RecordRef, ResolvedValue};
pub use registry::schema_registry::{RegistryConfig, RegistryError, SchemaRegistry};
pub use service::reconciler::{
    ReconcileError, ReconcileFailure, ReconcileOptions, ReconcileReport, Reconciler, RecordError,
    RecordOutcome, RecordStage, RecordWarning,
};
pub use service::resolver::{FieldResolveError, ReferenceResolver, ResolveError, ResolveResult};
pub use store::sqlite_store::{SqliteRecordStore, StoredRecord};
pub use store::{RecordStore, RelationshipField, StoreError, StoreResult, Upserted};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
