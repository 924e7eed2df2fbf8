//! Intended state reconciliation.
//!
//! # Responsibility
//! - Upsert every record spec of a document in payload order.
//! - Apply `set`/`add` relationship directives to the upserted record.
//! - Collect per-record failures as warnings and surface fatal ones.
//!
//! # Invariants
//! - Specs are processed strictly sequentially; a later spec may reference
//!   a record created by an earlier one.
//! - A rejected spec leaves no writes behind and never stops its siblings.
//! - In atomic mode a fatal error rolls back every write of the run.

use crate::logging::sanitize_message;
use crate::model::document::{Directive, DocumentError, IntendedState, RecordSpec};
use crate::model::schema::SchemaDef;
use crate::model::value::{FieldValues, RecordRef, ResolvedValue};
use crate::registry::schema_registry::SchemaRegistry;
use crate::service::resolver::{FieldResolveError, ReferenceResolver, ResolveError};
use crate::store::{RecordStore, RelationshipField, StoreError, Upserted};
use log::{error, info, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;
use uuid::Uuid;

const MAX_LOGGED_ERROR_CHARS: usize = 240;

/// Run policy for one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Run the whole document as one all-or-nothing unit.
    pub atomic: bool,
}

/// Step of record handling a warning was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStage {
    Resolve,
    Upsert,
    Directive,
}

impl RecordStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resolve => "resolve",
            Self::Upsert => "upsert",
            Self::Directive => "directive",
        }
    }
}

impl Display for RecordStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One successfully reconciled spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordOutcome {
    pub schema: String,
    /// Position of the spec within its record-type group.
    pub index: usize,
    pub record: RecordRef,
    pub label: String,
    pub created: bool,
}

/// One spec skipped because of a per-record failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordWarning {
    pub schema: String,
    pub index: usize,
    pub stage: RecordStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

/// Result of a reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub outcomes: Vec<RecordOutcome>,
    pub warnings: Vec<RecordWarning>,
}

impl ReconcileReport {
    pub fn created_count(&self) -> usize {
        self.outcomes.iter().filter(|outcome| outcome.created).count()
    }

    pub fn updated_count(&self) -> usize {
        self.outcomes.len() - self.created_count()
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Failure confined to one record spec.
#[derive(Debug)]
pub enum RecordError {
    Resolve { field: String, source: ResolveError },
    Store(StoreError),
    MalformedDirective { directive: Directive, reason: String },
}

impl RecordError {
    /// Whether the failure must abort the run instead of skipping the spec.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Resolve { source, .. } => source.is_fatal(),
            Self::Store(err) => err.is_fatal(),
            Self::MalformedDirective { .. } => false,
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Resolve { field, .. } => Some(field),
            Self::Store(err) => err.field(),
            Self::MalformedDirective { .. } => None,
        }
    }
}

impl Display for RecordError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolve { field, source } => write!(f, "field `{field}`: {source}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::MalformedDirective { directive, reason } => {
                write!(f, "malformed `{directive}` directive: {reason}")
            }
        }
    }
}

impl Error for RecordError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Resolve { source, .. } => Some(source),
            Self::Store(err) => Some(err),
            Self::MalformedDirective { .. } => None,
        }
    }
}

impl From<StoreError> for RecordError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<FieldResolveError> for RecordError {
    fn from(value: FieldResolveError) -> Self {
        Self::Resolve {
            field: value.field,
            source: value.error,
        }
    }
}

/// Failure that aborts a reconciliation run.
#[derive(Debug)]
pub enum ReconcileError {
    Document(DocumentError),
    /// Top-level record type is not registered.
    UnknownSchema(String),
    Store(StoreError),
    /// Fatal failure raised while handling one spec.
    Record {
        schema: String,
        index: usize,
        source: RecordError,
    },
}

impl Display for ReconcileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Document(err) => write!(f, "{err}"),
            Self::UnknownSchema(name) => write!(f, "unknown record type `{name}`"),
            Self::Store(err) => write!(f, "{err}"),
            Self::Record {
                schema,
                index,
                source,
            } => write!(f, "record #{index} of `{schema}`: {source}"),
        }
    }
}

impl Error for ReconcileError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Document(err) => Some(err),
            Self::UnknownSchema(_) => None,
            Self::Store(err) => Some(err),
            Self::Record { source, .. } => Some(source),
        }
    }
}

impl From<DocumentError> for ReconcileError {
    fn from(value: DocumentError) -> Self {
        Self::Document(value)
    }
}

impl From<StoreError> for ReconcileError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

/// Fatal run failure together with what was done before it.
#[derive(Debug)]
pub struct ReconcileFailure {
    pub error: ReconcileError,
    /// `true` when every write of the run was undone.
    pub rolled_back: bool,
    /// Outcomes and warnings gathered before the failure. When
    /// `rolled_back` is set none of the outcomes are persisted.
    pub report: ReconcileReport,
}

impl Display for ReconcileFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.rolled_back {
            write!(f, "reconciliation rolled back: {}", self.error)
        } else {
            write!(f, "reconciliation aborted: {}", self.error)
        }
    }
}

impl Error for ReconcileFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.error)
    }
}

/// Per-record failure tagged with the step that raised it.
#[derive(Debug)]
struct SpecFailure {
    stage: RecordStage,
    error: RecordError,
}

impl SpecFailure {
    fn at<E: Into<RecordError>>(stage: RecordStage) -> impl FnOnce(E) -> Self {
        move |error| Self {
            stage,
            error: error.into(),
        }
    }
}

impl From<StoreError> for SpecFailure {
    fn from(value: StoreError) -> Self {
        Self {
            stage: RecordStage::Upsert,
            error: RecordError::Store(value),
        }
    }
}

/// Directive payloads after reference resolution.
#[derive(Debug, Default)]
struct ResolvedDirectives {
    set: Option<FieldValues>,
    add: Option<FieldValues>,
}

/// Applies intended state documents through a record store.
pub struct Reconciler<'a, S: RecordStore> {
    registry: &'a SchemaRegistry,
    store: &'a S,
}

impl<'a, S: RecordStore> Reconciler<'a, S> {
    pub fn new(registry: &'a SchemaRegistry, store: &'a S) -> Self {
        Self { registry, store }
    }

    /// Parses `payload` and reconciles it.
    ///
    /// Shape errors fail before any record is touched.
    pub fn reconcile_json(
        &self,
        payload: &str,
        options: &ReconcileOptions,
    ) -> Result<ReconcileReport, ReconcileFailure> {
        let state = IntendedState::from_json_str(payload).map_err(|err| {
            error!(
                "event=reconcile_run module=reconciler status=error stage=parse error={}",
                sanitize_message(&err.to_string(), MAX_LOGGED_ERROR_CHARS)
            );
            ReconcileFailure {
                error: err.into(),
                rolled_back: false,
                report: ReconcileReport::default(),
            }
        })?;
        self.reconcile(state, options)
    }

    /// Reconciles every spec of `state` in payload order.
    ///
    /// Per-record failures become report warnings. The first fatal failure
    /// stops the run; with `atomic` set, all writes of the run are undone.
    pub fn reconcile(
        &self,
        state: IntendedState,
        options: &ReconcileOptions,
    ) -> Result<ReconcileReport, ReconcileFailure> {
        let started_at = Instant::now();
        let spec_count = state.spec_count();
        let mut report = ReconcileReport::default();

        let result = if options.atomic {
            self.store.scoped(|| self.apply_groups(state, &mut report))
        } else {
            self.apply_groups(state, &mut report)
        };
        let duration_ms = started_at.elapsed().as_millis();

        match result {
            Ok(()) => {
                info!(
                    "event=reconcile_run module=reconciler status=ok atomic={} specs={} created={} updated={} skipped={} duration_ms={}",
                    options.atomic,
                    spec_count,
                    report.created_count(),
                    report.updated_count(),
                    report.warnings.len(),
                    duration_ms
                );
                Ok(report)
            }
            Err(err) => {
                let rolled_back = options.atomic
                    && !matches!(err, ReconcileError::Store(StoreError::RollbackFailed(_)));
                error!(
                    "event=reconcile_run module=reconciler status=error atomic={} rolled_back={} duration_ms={} error={}",
                    options.atomic,
                    rolled_back,
                    duration_ms,
                    sanitize_message(&err.to_string(), MAX_LOGGED_ERROR_CHARS)
                );
                Err(ReconcileFailure {
                    error: err,
                    rolled_back,
                    report,
                })
            }
        }
    }

    fn apply_groups(
        &self,
        state: IntendedState,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        for group in state.groups {
            let schema = self
                .registry
                .resolve(&group.schema)
                .map_err(|_| ReconcileError::UnknownSchema(group.schema.clone()))?;

            for (index, spec) in group.specs.into_iter().enumerate() {
                match self.apply_spec(&schema, spec) {
                    Ok(upserted) => {
                        info!(
                            "event=record_reconciled module=reconciler status=ok action={} schema={} index={} record={} label={}",
                            if upserted.created { "created" } else { "updated" },
                            schema.name,
                            index,
                            upserted.record.id,
                            sanitize_message(&upserted.label, MAX_LOGGED_ERROR_CHARS)
                        );
                        report.outcomes.push(RecordOutcome {
                            schema: schema.name.clone(),
                            index,
                            record: upserted.record,
                            label: upserted.label,
                            created: upserted.created,
                        });
                    }
                    Err(failure) if failure.error.is_fatal() => {
                        return Err(ReconcileError::Record {
                            schema: schema.name.clone(),
                            index,
                            source: failure.error,
                        });
                    }
                    Err(failure) => {
                        let message = failure.error.to_string();
                        warn!(
                            "event=record_skipped module=reconciler status=warn schema={} index={} stage={} error={}",
                            schema.name,
                            index,
                            failure.stage,
                            sanitize_message(&message, MAX_LOGGED_ERROR_CHARS)
                        );
                        report.warnings.push(RecordWarning {
                            schema: schema.name.clone(),
                            index,
                            stage: failure.stage,
                            field: failure.error.field().map(str::to_string),
                            message,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolves, upserts and applies directives for one spec.
    ///
    /// Storage effects of the spec run in their own scope, so a failed
    /// directive also undoes the spec's upsert.
    fn apply_spec(&self, schema: &SchemaDef, mut spec: RecordSpec) -> Result<Upserted, SpecFailure> {
        let resolver = ReferenceResolver::new(self.registry, self.store);

        let directives = spec.take_directives();
        let directives = ResolvedDirectives {
            set: self
                .resolve_directive(&resolver, Directive::Set, directives.set)
                .map_err(SpecFailure::at(RecordStage::Directive))?,
            add: self
                .resolve_directive(&resolver, Directive::Add, directives.add)
                .map_err(SpecFailure::at(RecordStage::Directive))?,
        };

        let lookup = resolver
            .resolve_fields(&spec.fields)
            .map_err(SpecFailure::at(RecordStage::Resolve))?;
        let defaults = resolver
            .resolve_fields(&spec.defaults)
            .map_err(SpecFailure::at(RecordStage::Resolve))?;

        self.store.scoped(|| {
            let upserted = self
                .store
                .update_or_create(schema, &lookup, &defaults)
                .map_err(SpecFailure::at(RecordStage::Upsert))?;

            if let Some(payload) = &directives.set {
                self.apply_directive(schema, &upserted.record, Directive::Set, payload)
                    .map_err(SpecFailure::at(RecordStage::Directive))?;
            }
            if let Some(payload) = &directives.add {
                self.apply_directive(schema, &upserted.record, Directive::Add, payload)
                    .map_err(SpecFailure::at(RecordStage::Directive))?;
            }
            Ok(upserted)
        })
    }

    fn resolve_directive(
        &self,
        resolver: &ReferenceResolver<'_, S>,
        directive: Directive,
        payload: Option<Value>,
    ) -> Result<Option<FieldValues>, RecordError> {
        let Some(payload) = payload else {
            return Ok(None);
        };
        let fields = directive_fields(directive, &payload)?;
        Ok(Some(resolver.resolve_fields(fields)?))
    }

    fn apply_directive(
        &self,
        schema: &SchemaDef,
        owner: &RecordRef,
        directive: Directive,
        payload: &FieldValues,
    ) -> Result<(), RecordError> {
        for (name, value) in payload {
            let field = RelationshipField::bind(self.store, schema, owner, name)?;
            let members = member_refs(schema, name, field.target(), value)?;
            match directive {
                Directive::Set => field.replace(&members)?,
                Directive::Add => field.add(&members)?,
            }
        }
        self.store.persist(schema, owner)?;
        Ok(())
    }
}

fn directive_fields(directive: Directive, payload: &Value) -> Result<&Map<String, Value>, RecordError> {
    payload
        .as_object()
        .ok_or_else(|| RecordError::MalformedDirective {
            directive,
            reason: "payload must map relationship names to members".to_string(),
        })
}

/// Converts a resolved directive value into relationship members.
///
/// A single value counts as a one-member list. Plain strings are taken as
/// ids of `target` records.
fn member_refs(
    schema: &SchemaDef,
    field: &str,
    target: &str,
    value: &ResolvedValue,
) -> Result<Vec<RecordRef>, StoreError> {
    value
        .clone()
        .into_members()
        .into_iter()
        .map(|member| match member {
            ResolvedValue::Record(record) => Ok(record),
            ResolvedValue::Scalar(Value::String(text)) => Uuid::parse_str(text.trim())
                .map(|id| RecordRef::new(target, id))
                .map_err(|_| {
                    StoreError::validation(schema, field, format!("`{text}` is not a record id"))
                }),
            other => Err(StoreError::validation(
                schema,
                field,
                format!("members must be records, got {}", other.to_json()),
            )),
        })
        .collect()
}
