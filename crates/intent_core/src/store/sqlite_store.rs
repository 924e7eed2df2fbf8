//! SQLite-backed record store.
//!
//! # Responsibility
//! - Persist records of any registered schema as JSON field documents.
//! - Enforce field kinds, required fields, `max_length` and unique sets.
//! - Keep relationship collections in `record_links`.
//!
//! # Invariants
//! - Stored field values are already coerced to their declared kind.
//! - Reference fields and link members point at existing records of the
//!   declared target schema.
//! - Scopes are SQLite savepoints; an unreleased scope rolls back on drop.

use crate::db::DbError;
use crate::db::migrations::{current_user_version, latest_version};
use crate::model::schema::{FieldDef, FieldKind, RelationshipDef, SchemaDef, ID_FIELD};
use crate::model::value::{FieldValues, RecordId, RecordRef, ResolvedValue};
use crate::store::{RecordStore, StoreError, StoreResult, Upserted};
use log::{debug, error};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{Map, Number, Value};
use std::cell::Cell;
use uuid::Uuid;

const RECORD_SELECT_SQL: &str = "SELECT
    uuid,
    schema_name,
    fields,
    created_at,
    updated_at
FROM records";

/// Stored record snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub record: RecordRef,
    pub fields: Map<String, Value>,
    /// Epoch ms creation timestamp.
    pub created_at: i64,
    /// Epoch ms update timestamp.
    pub updated_at: i64,
}

impl StoredRecord {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Normalized exact-match lookup.
#[derive(Debug, Default)]
struct Lookup {
    id: Option<RecordId>,
    fields: Map<String, Value>,
}

impl Lookup {
    fn describe(&self) -> String {
        let mut shown = self.fields.clone();
        if let Some(id) = self.id {
            shown.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
        }
        Value::Object(shown).to_string()
    }
}

/// SQLite-backed record store over one borrowed connection.
pub struct SqliteRecordStore<'conn> {
    conn: &'conn Connection,
    scope_depth: Cell<u32>,
}

impl<'conn> SqliteRecordStore<'conn> {
    /// Creates a store from a migrated connection.
    pub fn try_new(conn: &'conn Connection) -> StoreResult<Self> {
        ensure_store_connection_ready(conn)?;
        Ok(Self {
            conn,
            scope_depth: Cell::new(0),
        })
    }

    /// Loads one record by identity.
    pub fn get_record(&self, record: &RecordRef) -> StoreResult<Option<StoredRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{RECORD_SELECT_SQL}
             WHERE uuid = ?1
               AND schema_name = ?2;"
        ))?;
        let mut rows = stmt.query(params![record.id.to_string(), record.schema.as_str()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_record_row(row)?));
        }
        Ok(None)
    }

    /// Lists all records of one schema in creation order.
    pub fn list_records(&self, schema: &str) -> StoreResult<Vec<StoredRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{RECORD_SELECT_SQL}
             WHERE schema_name = ?1
             ORDER BY created_at ASC, rowid ASC;"
        ))?;
        let mut rows = stmt.query([schema])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(parse_record_row(row)?);
        }
        Ok(records)
    }

    pub fn count_records(&self, schema: &str) -> StoreResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE schema_name = ?1;",
            [schema],
            |row| row.get(0),
        )?;
        usize::try_from(count).map_err(|_| StoreError::InvalidData(format!("negative count {count}")))
    }

    /// Lists members of one relationship collection in insertion order.
    pub fn list_members(&self, owner: &RecordRef, field: &str) -> StoreResult<Vec<RecordRef>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.uuid, r.schema_name
             FROM record_links l
             INNER JOIN records r ON r.uuid = l.member_uuid
             WHERE l.parent_uuid = ?1
               AND l.field_name = ?2
             ORDER BY l.position ASC, r.uuid ASC;",
        )?;
        let mut rows = stmt.query(params![owner.id.to_string(), field])?;
        let mut members = Vec::new();
        while let Some(row) = rows.next()? {
            let uuid_text: String = row.get(0)?;
            members.push(RecordRef::new(
                row.get::<_, String>(1)?,
                parse_uuid(&uuid_text)?,
            ));
        }
        Ok(members)
    }

    fn record_exists(&self, record: &RecordRef) -> StoreResult<bool> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM records
                WHERE uuid = ?1
                  AND schema_name = ?2
            );",
            params![record.id.to_string(), record.schema.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }

    fn require_record(&self, record: &RecordRef) -> StoreResult<()> {
        if self.record_exists(record)? {
            return Ok(());
        }
        Err(StoreError::NotFound {
            schema: record.schema.clone(),
            predicate: format!("{{\"{ID_FIELD}\":\"{}\"}}", record.id),
        })
    }

    fn match_records(
        &self,
        schema: &SchemaDef,
        lookup: &Lookup,
        exclude: Option<RecordId>,
    ) -> StoreResult<Vec<StoredRecord>> {
        let mut sql = format!("{RECORD_SELECT_SQL} WHERE schema_name = ?");
        let mut bind_values = vec![SqlValue::Text(schema.name.clone())];

        if let Some(id) = lookup.id {
            sql.push_str(" AND uuid = ?");
            bind_values.push(SqlValue::Text(id.to_string()));
        }

        for (field, value) in &lookup.fields {
            let path = SqlValue::Text(format!("$.{field}"));
            match value {
                Value::Null => {
                    sql.push_str(" AND json_extract(fields, ?) IS NULL");
                    bind_values.push(path);
                }
                Value::Bool(flag) => {
                    sql.push_str(" AND json_extract(fields, ?) = ?");
                    bind_values.push(path);
                    bind_values.push(SqlValue::Integer(i64::from(*flag)));
                }
                Value::Number(number) => {
                    sql.push_str(" AND json_extract(fields, ?) = ?");
                    bind_values.push(path);
                    bind_values.push(number_to_sql(number));
                }
                Value::String(text) => {
                    sql.push_str(" AND json_extract(fields, ?) = ?");
                    bind_values.push(path);
                    bind_values.push(SqlValue::Text(text.clone()));
                }
                Value::Array(_) | Value::Object(_) => {
                    return Err(StoreError::InvalidLookup {
                        schema: schema.name.clone(),
                        message: format!("field `{field}` cannot be matched by a list or object"),
                    });
                }
            }
        }

        if let Some(id) = exclude {
            sql.push_str(" AND uuid <> ?");
            bind_values.push(SqlValue::Text(id.to_string()));
        }
        sql.push_str(" ORDER BY created_at ASC, rowid ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(parse_record_row(row)?);
        }
        Ok(records)
    }

    fn normalize_lookup(&self, schema: &SchemaDef, values: &FieldValues) -> StoreResult<Lookup> {
        let mut lookup = Lookup::default();
        for (field, value) in values {
            if field == ID_FIELD {
                lookup.id = Some(lookup_id(schema, value)?);
                continue;
            }
            let normalized = self.normalize_field(schema, field, value)?;
            lookup.fields.insert(field.clone(), normalized);
        }
        Ok(lookup)
    }

    fn normalize_fields(
        &self,
        schema: &SchemaDef,
        values: &FieldValues,
    ) -> StoreResult<Map<String, Value>> {
        let mut fields = Map::new();
        for (field, value) in values {
            let normalized = self.normalize_field(schema, field, value)?;
            fields.insert(field.clone(), normalized);
        }
        Ok(fields)
    }

    /// Coerces one value to the declared field kind.
    fn normalize_field(
        &self,
        schema: &SchemaDef,
        field: &str,
        value: &ResolvedValue,
    ) -> StoreResult<Value> {
        let def = schema
            .field_def(field)
            .ok_or_else(|| StoreError::unknown_field(schema, field))?;
        if value.is_null() {
            return Ok(Value::Null);
        }

        let mismatch = || {
            StoreError::validation(
                schema,
                field,
                format!("expected {} value, got {}", def.kind.as_str(), describe(value)),
            )
        };

        match (&def.kind, value) {
            (FieldKind::Json, other) => Ok(other.to_json()),
            (FieldKind::Reference { target }, ResolvedValue::Record(record)) => {
                if &record.schema != target {
                    return Err(mismatch());
                }
                self.require_record(record)?;
                Ok(Value::String(record.id.to_string()))
            }
            (FieldKind::Reference { target }, ResolvedValue::Scalar(Value::String(text))) => {
                let id = Uuid::parse_str(text.trim()).map_err(|_| mismatch())?;
                self.require_record(&RecordRef::new(target.clone(), id))?;
                Ok(Value::String(id.to_string()))
            }
            (kind, ResolvedValue::Scalar(scalar)) => {
                coerce_scalar(kind, scalar).ok_or_else(mismatch).and_then(|coerced| {
                    check_length(schema, field, def, &coerced)?;
                    Ok(coerced)
                })
            }
            _ => Err(mismatch()),
        }
    }

    /// Rejects a field map that would break a unique constraint.
    fn check_unique(
        &self,
        schema: &SchemaDef,
        fields: &Map<String, Value>,
        exclude: Option<RecordId>,
    ) -> StoreResult<()> {
        for unique_set in &schema.unique {
            let mut lookup = Lookup::default();
            for field in unique_set {
                match fields.get(field) {
                    Some(value) if !value.is_null() => {
                        lookup.fields.insert(field.clone(), value.clone());
                    }
                    _ => break,
                }
            }
            if lookup.fields.len() != unique_set.len() {
                continue;
            }

            if let Some(existing) = self.match_records(schema, &lookup, exclude)?.first() {
                return Err(StoreError::Integrity {
                    schema: schema.name.clone(),
                    message: format!(
                        "{} is already used by {}",
                        lookup.describe(),
                        existing.record
                    ),
                });
            }
        }
        Ok(())
    }

    fn insert_record(
        &self,
        schema: &SchemaDef,
        id: RecordId,
        fields: &Map<String, Value>,
    ) -> StoreResult<()> {
        let taken: i64 = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM records WHERE uuid = ?1);",
            [id.to_string()],
            |row| row.get(0),
        )?;
        if taken == 1 {
            return Err(StoreError::Integrity {
                schema: schema.name.clone(),
                message: format!("record id {id} is already in use"),
            });
        }

        self.conn.execute(
            "INSERT INTO records (uuid, schema_name, fields) VALUES (?1, ?2, ?3);",
            params![id.to_string(), schema.name.as_str(), encode_fields(fields)?],
        )?;
        Ok(())
    }

    fn update_record(&self, id: RecordId, fields: &Map<String, Value>) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE records
             SET
                fields = ?2,
                updated_at = (strftime('%s', 'now') * 1000)
             WHERE uuid = ?1;",
            params![id.to_string(), encode_fields(fields)?],
        )?;
        Ok(())
    }

    fn check_members(
        &self,
        owner: &RecordRef,
        field: &str,
        relationship: &RelationshipDef,
        members: &[RecordRef],
    ) -> StoreResult<()> {
        self.require_record(owner)?;
        for member in members {
            if member.schema != relationship.target {
                return Err(StoreError::Validation {
                    schema: owner.schema.clone(),
                    field: Some(field.to_string()),
                    message: format!(
                        "member {member} is not a `{}` record",
                        relationship.target
                    ),
                });
            }
            self.require_record(member)?;
        }
        Ok(())
    }

    fn insert_links(
        &self,
        owner: &RecordRef,
        field: &str,
        members: &[RecordRef],
    ) -> StoreResult<()> {
        let mut position: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(position), -1) + 1
             FROM record_links
             WHERE parent_uuid = ?1
               AND field_name = ?2;",
            params![owner.id.to_string(), field],
            |row| row.get(0),
        )?;
        for member in members {
            let inserted = self.conn.execute(
                "INSERT OR IGNORE INTO record_links (parent_uuid, field_name, member_uuid, position)
                 VALUES (?1, ?2, ?3, ?4);",
                params![owner.id.to_string(), field, member.id.to_string(), position],
            )?;
            position += i64::try_from(inserted).unwrap_or(0);
        }
        Ok(())
    }
}

impl RecordStore for SqliteRecordStore<'_> {
    fn find_by(&self, schema: &SchemaDef, predicate: &FieldValues) -> StoreResult<RecordRef> {
        let lookup = self.normalize_lookup(schema, predicate)?;
        if lookup.id.is_none() && lookup.fields.is_empty() {
            return Err(StoreError::InvalidLookup {
                schema: schema.name.clone(),
                message: "lookup predicate is empty".to_string(),
            });
        }

        let mut matches = self.match_records(schema, &lookup, None)?;
        match matches.len() {
            0 => Err(StoreError::NotFound {
                schema: schema.name.clone(),
                predicate: lookup.describe(),
            }),
            1 => Ok(matches.remove(0).record),
            count => Err(StoreError::MultipleMatches {
                schema: schema.name.clone(),
                predicate: lookup.describe(),
                count,
            }),
        }
    }

    fn update_or_create(
        &self,
        schema: &SchemaDef,
        lookup: &FieldValues,
        defaults: &FieldValues,
    ) -> StoreResult<Upserted> {
        let lookup = self.normalize_lookup(schema, lookup)?;
        let defaults = self.normalize_fields(schema, defaults)?;

        let mut matches = self.match_records(schema, &lookup, None)?;
        let (id, fields, created) = match matches.len() {
            0 => {
                let id = lookup.id.unwrap_or_else(Uuid::new_v4);
                let mut fields = lookup.fields;
                fields.extend(defaults);
                validate_required(schema, &fields)?;
                self.check_unique(schema, &fields, None)?;
                self.insert_record(schema, id, &fields)?;
                (id, fields, true)
            }
            1 => {
                let existing = matches.remove(0);
                let id = existing.record.id;
                let mut fields = existing.fields;
                fields.extend(defaults);
                validate_required(schema, &fields)?;
                self.check_unique(schema, &fields, Some(id))?;
                self.update_record(id, &fields)?;
                (id, fields, false)
            }
            count => {
                return Err(StoreError::MultipleMatches {
                    schema: schema.name.clone(),
                    predicate: lookup.describe(),
                    count,
                })
            }
        };

        let record = RecordRef::new(schema.name.clone(), id);
        debug!(
            "event=record_upsert module=store status=ok schema={} record={} created={created}",
            schema.name, record.id
        );
        Ok(Upserted {
            label: display_label(schema, &record, &fields),
            record,
            created,
        })
    }

    fn persist(&self, schema: &SchemaDef, record: &RecordRef) -> StoreResult<()> {
        let stored = self.get_record(record)?.ok_or_else(|| StoreError::NotFound {
            schema: record.schema.clone(),
            predicate: format!("{{\"{ID_FIELD}\":\"{}\"}}", record.id),
        })?;
        validate_required(schema, &stored.fields)?;
        self.check_unique(schema, &stored.fields, Some(record.id))?;

        for (field, relationship) in &schema.relationships {
            for member in self.list_members(record, field)? {
                if member.schema != relationship.target {
                    return Err(StoreError::validation(
                        schema,
                        field.as_str(),
                        format!("member {member} is not a `{}` record", relationship.target),
                    ));
                }
            }
        }

        self.conn.execute(
            "UPDATE records
             SET updated_at = (strftime('%s', 'now') * 1000)
             WHERE uuid = ?1;",
            [record.id.to_string()],
        )?;
        Ok(())
    }

    fn replace_members(
        &self,
        owner: &RecordRef,
        field: &str,
        relationship: &RelationshipDef,
        members: &[RecordRef],
    ) -> StoreResult<()> {
        self.check_members(owner, field, relationship, members)?;
        self.scoped(|| {
            self.conn.execute(
                "DELETE FROM record_links WHERE parent_uuid = ?1 AND field_name = ?2;",
                params![owner.id.to_string(), field],
            )?;
            self.insert_links(owner, field, members)
        })
    }

    fn add_members(
        &self,
        owner: &RecordRef,
        field: &str,
        relationship: &RelationshipDef,
        members: &[RecordRef],
    ) -> StoreResult<()> {
        self.check_members(owner, field, relationship, members)?;
        self.scoped(|| self.insert_links(owner, field, members))
    }

    fn scoped<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<StoreError>,
    {
        let savepoint = Savepoint::open(self.conn, &self.scope_depth).map_err(StoreError::from)?;
        match work() {
            Ok(value) => {
                savepoint.release().map_err(StoreError::from)?;
                Ok(value)
            }
            Err(err) => match savepoint.rollback() {
                Ok(()) => Err(err),
                Err(rollback_err) => {
                    error!("event=scope_rollback module=store status=error error={rollback_err}");
                    Err(StoreError::RollbackFailed(DbError::Sqlite(rollback_err)).into())
                }
            },
        }
    }
}

/// Nested unit of work on one connection.
///
/// Dropping an open savepoint rolls it back.
struct Savepoint<'a> {
    conn: &'a Connection,
    depth: &'a Cell<u32>,
    name: String,
    finished: bool,
}

impl<'a> Savepoint<'a> {
    fn open(conn: &'a Connection, depth: &'a Cell<u32>) -> rusqlite::Result<Self> {
        let level = depth.get();
        let name = format!("intent_scope_{level}");
        conn.execute_batch(&format!("SAVEPOINT {name};"))?;
        depth.set(level + 1);
        Ok(Self {
            conn,
            depth,
            name,
            finished: false,
        })
    }

    fn release(mut self) -> rusqlite::Result<()> {
        self.conn
            .execute_batch(&format!("RELEASE {};", self.name))?;
        self.finished = true;
        Ok(())
    }

    fn rollback(mut self) -> rusqlite::Result<()> {
        self.finished = true;
        self.conn.execute_batch(&rollback_sql(&self.name))
    }
}

impl Drop for Savepoint<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.conn.execute_batch(&rollback_sql(&self.name)) {
                error!("event=scope_rollback module=store status=error error={err}");
            }
        }
        self.depth.set(self.depth.get().saturating_sub(1));
    }
}

fn rollback_sql(name: &str) -> String {
    format!("ROLLBACK TO {name}; RELEASE {name};")
}

fn coerce_scalar(kind: &FieldKind, scalar: &Value) -> Option<Value> {
    match (kind, scalar) {
        (FieldKind::Text, Value::String(_)) => Some(scalar.clone()),
        (FieldKind::Text, Value::Number(number)) => Some(Value::String(number.to_string())),
        (FieldKind::Text, Value::Bool(flag)) => Some(Value::String(flag.to_string())),
        (FieldKind::Integer, Value::Number(number)) => number.as_i64().map(Value::from),
        (FieldKind::Integer, Value::String(text)) => text.trim().parse::<i64>().ok().map(Value::from),
        (FieldKind::Float, Value::Number(number)) => number
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number),
        (FieldKind::Float, Value::String(text)) => text
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        (FieldKind::Boolean, Value::Bool(_)) => Some(scalar.clone()),
        (FieldKind::Boolean, Value::Number(number)) => match number.as_i64() {
            Some(0) => Some(Value::Bool(false)),
            Some(1) => Some(Value::Bool(true)),
            _ => None,
        },
        (FieldKind::Boolean, Value::String(text)) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(Value::Bool(true)),
            "false" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}

fn check_length(schema: &SchemaDef, field: &str, def: &FieldDef, value: &Value) -> StoreResult<()> {
    let (Some(max_length), Value::String(text)) = (def.max_length, value) else {
        return Ok(());
    };
    let length = text.chars().count();
    if length > max_length {
        return Err(StoreError::validation(
            schema,
            field,
            format!("length {length} exceeds max_length {max_length}"),
        ));
    }
    Ok(())
}

fn validate_required(schema: &SchemaDef, fields: &Map<String, Value>) -> StoreResult<()> {
    for (name, def) in &schema.fields {
        if !def.required {
            continue;
        }
        if fields.get(name).map_or(true, Value::is_null) {
            return Err(StoreError::validation(schema, name.as_str(), "field is required"));
        }
    }
    Ok(())
}

fn lookup_id(schema: &SchemaDef, value: &ResolvedValue) -> StoreResult<RecordId> {
    let invalid = || StoreError::InvalidLookup {
        schema: schema.name.clone(),
        message: format!("`{ID_FIELD}` must be a record id, got {}", describe(value)),
    };
    match value {
        ResolvedValue::Record(record) if record.schema == schema.name => Ok(record.id),
        ResolvedValue::Scalar(Value::String(text)) => {
            Uuid::parse_str(text.trim()).map_err(|_| invalid())
        }
        _ => Err(invalid()),
    }
}

fn display_label(schema: &SchemaDef, record: &RecordRef, fields: &Map<String, Value>) -> String {
    match schema
        .display_field
        .as_ref()
        .and_then(|field| fields.get(field))
    {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => record.to_string(),
        Some(other) => other.to_string(),
    }
}

fn describe(value: &ResolvedValue) -> &'static str {
    match value {
        ResolvedValue::Scalar(Value::Null) => "null",
        ResolvedValue::Scalar(Value::Bool(_)) => "boolean",
        ResolvedValue::Scalar(Value::Number(_)) => "number",
        ResolvedValue::Scalar(Value::String(_)) => "string",
        ResolvedValue::Scalar(_) => "json",
        ResolvedValue::Record(_) => "record reference",
        ResolvedValue::List(_) => "list",
        ResolvedValue::Map(_) => "object",
    }
}

fn number_to_sql(number: &Number) -> SqlValue {
    match (number.as_i64(), number.as_f64()) {
        (Some(integer), _) => SqlValue::Integer(integer),
        (None, Some(real)) => SqlValue::Real(real),
        (None, None) => SqlValue::Text(number.to_string()),
    }
}

fn encode_fields(fields: &Map<String, Value>) -> StoreResult<String> {
    serde_json::to_string(fields)
        .map_err(|err| StoreError::InvalidData(format!("failed to encode fields: {err}")))
}

fn parse_record_row(row: &Row<'_>) -> StoreResult<StoredRecord> {
    let uuid_text: String = row.get("uuid")?;
    let fields_text: String = row.get("fields")?;
    let fields = match serde_json::from_str::<Value>(&fields_text) {
        Ok(Value::Object(fields)) => fields,
        Ok(_) | Err(_) => {
            return Err(StoreError::InvalidData(format!(
                "records.fields of {uuid_text} is not a JSON object"
            )))
        }
    };

    Ok(StoredRecord {
        record: RecordRef::new(row.get::<_, String>("schema_name")?, parse_uuid(&uuid_text)?),
        fields,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn parse_uuid(value: &str) -> StoreResult<RecordId> {
    Uuid::parse_str(value)
        .map_err(|_| StoreError::InvalidData(format!("invalid uuid value `{value}` in records.uuid")))
}

fn ensure_store_connection_ready(conn: &Connection) -> StoreResult<()> {
    let expected_version = latest_version();
    let actual_version = current_user_version(conn)?;
    if actual_version != expected_version {
        return Err(StoreError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    for table in ["records", "record_links"] {
        let present = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1;",
                [table],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        if present.is_none() {
            return Err(StoreError::MissingRequiredTable(table));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{coerce_scalar, SqliteRecordStore};
    use crate::db::open_db_in_memory;
    use crate::model::schema::FieldKind;
    use crate::store::{RecordStore, StoreError};
    use rusqlite::Connection;
    use serde_json::json;

    #[test]
    fn coerces_legacy_string_values_to_declared_kinds() {
        assert_eq!(
            coerce_scalar(&FieldKind::Integer, &json!("42")),
            Some(json!(42))
        );
        assert_eq!(
            coerce_scalar(&FieldKind::Boolean, &json!("True")),
            Some(json!(true))
        );
        assert_eq!(coerce_scalar(&FieldKind::Integer, &json!("4.5")), None);
        assert_eq!(coerce_scalar(&FieldKind::Text, &json!(7)), Some(json!("7")));
    }

    #[test]
    fn rejects_unmigrated_connection() {
        let conn = Connection::open_in_memory().unwrap();
        let err = SqliteRecordStore::try_new(&conn).err().unwrap();
        assert!(matches!(
            err,
            StoreError::UninitializedConnection {
                actual_version: 0,
                ..
            }
        ));
    }

    #[test]
    fn failed_scope_rolls_back_and_successful_scope_commits() {
        let conn = open_db_in_memory().unwrap();
        let store = SqliteRecordStore::try_new(&conn).unwrap();
        let insert = |id: &str| {
            conn.execute(
                "INSERT INTO records (uuid, schema_name, fields) VALUES (?1, 'tag', '{}');",
                [id],
            )
            .map(|_| ())
            .map_err(StoreError::from)
        };

        let failed: Result<(), StoreError> = store.scoped(|| {
            insert("a")?;
            store.scoped(|| insert("b"))?;
            Err(StoreError::InvalidData("abort".to_string()))
        });
        assert!(failed.is_err());
        assert_eq!(store.count_records("tag").unwrap(), 0);

        store
            .scoped(|| {
                insert("c")?;
                let inner: Result<(), StoreError> = store.scoped(|| {
                    insert("d")?;
                    Err(StoreError::InvalidData("inner abort".to_string()))
                });
                assert!(inner.is_err());
                Ok::<(), StoreError>(())
            })
            .unwrap();
        assert_eq!(store.count_records("tag").unwrap(), 1);
        assert_eq!(store.scope_depth.get(), 0);
    }

    #[test]
    fn failed_rollback_is_reported_instead_of_work_error() {
        let conn = open_db_in_memory().unwrap();
        let store = SqliteRecordStore::try_new(&conn).unwrap();

        let result: Result<(), StoreError> = store.scoped(|| {
            conn.execute(
                "INSERT INTO records (uuid, schema_name, fields) VALUES ('kept', 'tag', '{}');",
                [],
            )?;
            // Ends the enclosing transaction, so the savepoint is gone.
            conn.execute_batch("COMMIT;")?;
            Err(StoreError::InvalidData("abort".to_string()))
        });

        let err = result.unwrap_err();
        assert!(matches!(err, StoreError::RollbackFailed(_)));
        assert!(err.is_fatal());
        assert_eq!(store.count_records("tag").unwrap(), 1);
        assert_eq!(store.scope_depth.get(), 0);
    }
}
