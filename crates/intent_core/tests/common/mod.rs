#![allow(dead_code)]

use intent_core::{FieldDef, RecordRef, SchemaDef, SchemaRegistry, SqliteRecordStore};
use serde_json::Value;

/// Registry used across integration tests:
/// departments, people with a department and tags, teams with members.
pub fn registry() -> SchemaRegistry {
    SchemaRegistry::from_schemas([
        SchemaDef::new("department")
            .field("name", FieldDef::text().required().max_length(32))
            .field("floor", FieldDef::integer())
            .unique(["name"])
            .display_field("name"),
        SchemaDef::new("person")
            .field("name", FieldDef::text().required())
            .field("age", FieldDef::integer())
            .field("active", FieldDef::boolean())
            .field("department", FieldDef::reference("department"))
            .field("profile", FieldDef::json())
            .relationship("tags", "tag")
            .unique(["name"])
            .display_field("name"),
        SchemaDef::new("tag")
            .field("name", FieldDef::text().required())
            .unique(["name"])
            .display_field("name"),
        SchemaDef::new("team")
            .field("name", FieldDef::text().required())
            .relationship("members", "person")
            .relationship("tags", "tag")
            .unique(["name"])
            .display_field("name"),
    ])
    .unwrap()
}

/// Names of the members of `owner.field`, in insertion order.
pub fn member_names(store: &SqliteRecordStore<'_>, owner: &RecordRef, field: &str) -> Vec<String> {
    store
        .list_members(owner, field)
        .unwrap()
        .iter()
        .map(|member| record_name(store, member))
        .collect()
}

pub fn record_name(store: &SqliteRecordStore<'_>, record: &RecordRef) -> String {
    let stored = store.get_record(record).unwrap().unwrap();
    match stored.field("name") {
        Some(Value::String(name)) => name.clone(),
        other => panic!("record {record} has no name: {other:?}"),
    }
}

/// Finds the record of `schema` whose `name` field equals `name`.
pub fn record_named(store: &SqliteRecordStore<'_>, schema: &str, name: &str) -> RecordRef {
    store
        .list_records(schema)
        .unwrap()
        .into_iter()
        .find(|stored| stored.field("name") == Some(&Value::String(name.to_string())))
        .map(|stored| stored.record)
        .unwrap_or_else(|| panic!("no {schema} named {name}"))
}
