mod common;

use common::{member_names, record_name, record_named, registry};
use intent_core::db::{open_db, open_db_in_memory};
use intent_core::{
    IntendedState, ReconcileError, ReconcileFailure, ReconcileOptions, ReconcileReport,
    Reconciler, RecordError, RecordStage, SchemaRegistry, SqliteRecordStore, StoreError,
};
use serde_json::{json, Value};

fn apply(
    store: &SqliteRecordStore<'_>,
    registry: &SchemaRegistry,
    document: &str,
    atomic: bool,
) -> Result<ReconcileReport, ReconcileFailure> {
    Reconciler::new(registry, store).reconcile_json(document, &ReconcileOptions { atomic })
}

const PEOPLE: &str = r##"{
    "department": [{"name": "Engineering", "defaults": {"floor": 3}}],
    "person": [
        {"name": "Ada", "defaults": {"age": 36, "department": {"department": {"name": "Engineering"}}}},
        {"name": "Grace", "defaults": {"age": 45, "department": "#ref:department:name:Engineering"}},
        {"name": "Linus", "defaults": {"age": 28}}
    ]
}"##;

#[test]
fn applying_same_document_twice_is_idempotent() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteRecordStore::try_new(&conn).unwrap();
    let registry = registry();

    let first = apply(&store, &registry, PEOPLE, false).unwrap();
    assert!(first.is_clean());
    assert_eq!(first.created_count(), 4);

    let second = apply(&store, &registry, PEOPLE, false).unwrap();
    assert!(second.is_clean());
    assert_eq!(second.created_count(), 0);
    assert_eq!(second.updated_count(), 4);

    let first_ids: Vec<_> = first.outcomes.iter().map(|o| o.record.clone()).collect();
    let second_ids: Vec<_> = second.outcomes.iter().map(|o| o.record.clone()).collect();
    assert_eq!(first_ids, second_ids);
    assert_eq!(store.count_records("department").unwrap(), 1);
    assert_eq!(store.count_records("person").unwrap(), 3);
}

#[test]
fn outcomes_follow_payload_order_with_labels() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteRecordStore::try_new(&conn).unwrap();
    let registry = registry();

    let report = apply(&store, &registry, PEOPLE, false).unwrap();
    let labels: Vec<(&str, usize, &str)> = report
        .outcomes
        .iter()
        .map(|o| (o.schema.as_str(), o.index, o.label.as_str()))
        .collect();
    assert_eq!(
        labels,
        vec![
            ("department", 0, "Engineering"),
            ("person", 0, "Ada"),
            ("person", 1, "Grace"),
            ("person", 2, "Linus"),
        ]
    );
}

#[test]
fn structured_and_legacy_references_store_same_record() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteRecordStore::try_new(&conn).unwrap();
    let registry = registry();
    apply(&store, &registry, PEOPLE, false).unwrap();

    let engineering = record_named(&store, "department", "Engineering");
    let ada = store
        .get_record(&record_named(&store, "person", "Ada"))
        .unwrap()
        .unwrap();
    let grace = store
        .get_record(&record_named(&store, "person", "Grace"))
        .unwrap()
        .unwrap();

    let expected = json!(engineering.id.to_string());
    assert_eq!(ada.field("department"), Some(&expected));
    assert_eq!(grace.field("department"), Some(&expected));
}

#[test]
fn forward_reference_fails_but_later_records_apply() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteRecordStore::try_new(&conn).unwrap();
    let registry = registry();

    let report = apply(
        &store,
        &registry,
        r##"{
            "person": [{"name": "Ada", "defaults": {"department": {"department": {"name": "Ops"}}}}],
            "department": [{"name": "Ops"}]
        }"##,
        false,
    )
    .unwrap();

    assert_eq!(report.warnings.len(), 1);
    let warning = &report.warnings[0];
    assert_eq!(warning.schema, "person");
    assert_eq!(warning.index, 0);
    assert_eq!(warning.stage, RecordStage::Resolve);
    assert_eq!(warning.field.as_deref(), Some("department"));

    assert_eq!(store.count_records("person").unwrap(), 0);
    assert_eq!(store.count_records("department").unwrap(), 1);
}

#[test]
fn set_directive_makes_collection_exact() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteRecordStore::try_new(&conn).unwrap();
    let registry = registry();
    apply(&store, &registry, PEOPLE, false).unwrap();

    apply(
        &store,
        &registry,
        r##"{"team": [{"name": "core", "set": {"members": [
            {"person": {"name": "Ada"}}, "#ref:person:name:Grace"
        ]}}]}"##,
        false,
    )
    .unwrap();
    let core = record_named(&store, "team", "core");
    assert_eq!(member_names(&store, &core, "members"), vec!["Ada", "Grace"]);

    let report = apply(
        &store,
        &registry,
        r##"{"team": [{"name": "core", "set": {"members": ["#ref:person:name:Linus"]}}]}"##,
        false,
    )
    .unwrap();
    assert!(report.is_clean());
    assert!(!report.outcomes[0].created);
    assert_eq!(member_names(&store, &core, "members"), vec!["Linus"]);

    apply(
        &store,
        &registry,
        r##"{"team": [{"name": "core", "set": {"members": []}}]}"##,
        false,
    )
    .unwrap();
    assert!(member_names(&store, &core, "members").is_empty());
}

#[test]
fn one_directive_can_set_several_relationships() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteRecordStore::try_new(&conn).unwrap();
    let registry = registry();
    apply(&store, &registry, PEOPLE, false).unwrap();

    let report = apply(
        &store,
        &registry,
        r##"{
            "tag": [{"name": "red"}, {"name": "blue"}],
            "team": [{"name": "core", "set": {
                "members": ["#ref:person:name:Ada"],
                "tags": ["#ref:tag:name:red", {"tag": {"name": "blue"}}]
            }}]
        }"##,
        false,
    )
    .unwrap();

    assert!(report.is_clean());
    let core = record_named(&store, "team", "core");
    assert_eq!(member_names(&store, &core, "members"), vec!["Ada"]);
    assert_eq!(member_names(&store, &core, "tags"), vec!["red", "blue"]);
}

#[test]
fn add_directive_is_additive_and_tolerates_existing_members() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteRecordStore::try_new(&conn).unwrap();
    let registry = registry();
    apply(&store, &registry, PEOPLE, false).unwrap();

    apply(
        &store,
        &registry,
        r##"{"team": [{"name": "core", "add": {"members": "#ref:person:name:Ada"}}]}"##,
        false,
    )
    .unwrap();
    let report = apply(
        &store,
        &registry,
        r##"{"team": [{"name": "core", "add": {"members": [
            "#ref:person:name:Grace", "#ref:person:name:Ada"
        ]}}]}"##,
        false,
    )
    .unwrap();

    assert!(report.is_clean());
    let core = record_named(&store, "team", "core");
    assert_eq!(member_names(&store, &core, "members"), vec!["Ada", "Grace"]);
}

#[test]
fn set_then_add_on_same_spec_applies_in_order() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteRecordStore::try_new(&conn).unwrap();
    let registry = registry();
    apply(&store, &registry, PEOPLE, false).unwrap();

    apply(
        &store,
        &registry,
        r##"{"team": [{
            "name": "core",
            "defaults": {"add": {"members": ["#ref:person:name:Linus"]}},
            "set": {"members": ["#ref:person:name:Ada"]}
        }]}"##,
        false,
    )
    .unwrap();

    let core = record_named(&store, "team", "core");
    assert_eq!(member_names(&store, &core, "members"), vec!["Ada", "Linus"]);
}

#[test]
fn failing_record_does_not_affect_siblings() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteRecordStore::try_new(&conn).unwrap();
    let registry = registry();

    let report = apply(
        &store,
        &registry,
        r##"{"tag": [{"name": "red"}, {"name": null}, {"name": "blue"}]}"##,
        false,
    )
    .unwrap();

    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].index, 1);
    assert_eq!(report.warnings[0].stage, RecordStage::Upsert);
    assert_eq!(report.warnings[0].field.as_deref(), Some("name"));

    let names: Vec<String> = store
        .list_records("tag")
        .unwrap()
        .iter()
        .map(|stored| record_name(&store, &stored.record))
        .collect();
    assert_eq!(names, vec!["red", "blue"]);
}

#[test]
fn failed_directive_rolls_back_own_upsert() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteRecordStore::try_new(&conn).unwrap();
    let registry = registry();
    apply(&store, &registry, PEOPLE, false).unwrap();

    let report = apply(
        &store,
        &registry,
        r##"{"team": [
            {"name": "ghost", "set": {"owners": ["#ref:person:name:Ada"]}},
            {"name": "phantom", "add": {"members": ["#ref:person:name:Nobody"]}},
            {"name": "core", "add": {"members": ["#ref:person:name:Ada"]}}
        ]}"##,
        false,
    )
    .unwrap();

    assert_eq!(report.warnings.len(), 2);
    assert!(report
        .warnings
        .iter()
        .all(|warning| warning.stage == RecordStage::Directive));
    assert_eq!(report.warnings[0].field.as_deref(), Some("owners"));
    assert_eq!(report.warnings[1].field.as_deref(), Some("members"));

    assert_eq!(store.count_records("team").unwrap(), 1);
    let core = record_named(&store, "team", "core");
    assert_eq!(member_names(&store, &core, "members"), vec!["Ada"]);
}

#[test]
fn malformed_directive_payload_skips_record() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteRecordStore::try_new(&conn).unwrap();
    let registry = registry();

    let report = apply(
        &store,
        &registry,
        r##"{"team": [{"name": "core", "set": ["#ref:person:name:Ada"]}]}"##,
        false,
    )
    .unwrap();

    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].stage, RecordStage::Directive);
    assert!(report.warnings[0].message.contains("set"));
    assert_eq!(store.count_records("team").unwrap(), 0);
}

#[test]
fn losing_nested_directive_is_rejected_as_unknown_field() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteRecordStore::try_new(&conn).unwrap();
    let registry = registry();
    apply(&store, &registry, PEOPLE, false).unwrap();

    let report = apply(
        &store,
        &registry,
        r##"{"team": [{
            "name": "core",
            "set": {"members": ["#ref:person:name:Ada"]},
            "defaults": {"set": {"members": ["#ref:person:name:Grace"]}}
        }]}"##,
        false,
    )
    .unwrap();

    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].stage, RecordStage::Upsert);
    assert_eq!(report.warnings[0].field.as_deref(), Some("set"));
    assert_eq!(store.count_records("team").unwrap(), 0);
}

const PARTIAL_THEN_FATAL: &str = r##"{
    "tag": [{"name": "red"}, {"name": "blue"}],
    "building": [{"name": "HQ"}],
    "department": [{"name": "Never"}]
}"##;

#[test]
fn atomic_run_rolls_back_everything_on_fatal_error() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteRecordStore::try_new(&conn).unwrap();
    let registry = registry();

    let failure = apply(&store, &registry, PARTIAL_THEN_FATAL, true).unwrap_err();
    assert!(failure.rolled_back);
    assert!(matches!(
        &failure.error,
        ReconcileError::UnknownSchema(name) if name == "building"
    ));
    assert_eq!(failure.report.outcomes.len(), 2);

    assert_eq!(store.count_records("tag").unwrap(), 0);
    assert_eq!(store.count_records("department").unwrap(), 0);
}

#[test]
fn non_atomic_run_keeps_records_before_fatal_error() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteRecordStore::try_new(&conn).unwrap();
    let registry = registry();

    let failure = apply(&store, &registry, PARTIAL_THEN_FATAL, false).unwrap_err();
    assert!(!failure.rolled_back);
    assert!(matches!(failure.error, ReconcileError::UnknownSchema(_)));

    assert_eq!(store.count_records("tag").unwrap(), 2);
    assert_eq!(store.count_records("department").unwrap(), 0);
}

const SECOND_TAG_FAILS: &str = r##"{"tag": [{"name": "ok"}, {"name": "boom"}]}"##;

fn reject_tag_named_boom(conn: &rusqlite::Connection) {
    conn.execute_batch(
        "CREATE TRIGGER reject_boom BEFORE INSERT ON records
         WHEN json_extract(NEW.fields, '$.name') = 'boom'
         BEGIN SELECT RAISE(ABORT, 'boom rejected'); END;",
    )
    .unwrap();
}

fn assert_second_tag_failed(error: &ReconcileError) {
    match error {
        ReconcileError::Record {
            schema,
            index,
            source: RecordError::Store(StoreError::Db(_)),
        } => {
            assert_eq!(schema, "tag");
            assert_eq!(*index, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn atomic_run_rolls_back_earlier_specs_of_same_group_on_fatal_error() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteRecordStore::try_new(&conn).unwrap();
    let registry = registry();
    reject_tag_named_boom(&conn);

    let failure = apply(&store, &registry, SECOND_TAG_FAILS, true).unwrap_err();
    assert!(failure.rolled_back);
    assert_second_tag_failed(&failure.error);
    assert_eq!(failure.report.outcomes.len(), 1);
    assert_eq!(store.count_records("tag").unwrap(), 0);
}

#[test]
fn non_atomic_run_keeps_earlier_specs_of_same_group_on_fatal_error() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteRecordStore::try_new(&conn).unwrap();
    let registry = registry();
    reject_tag_named_boom(&conn);

    let failure = apply(&store, &registry, SECOND_TAG_FAILS, false).unwrap_err();
    assert!(!failure.rolled_back);
    assert_second_tag_failed(&failure.error);
    assert_eq!(store.count_records("tag").unwrap(), 1);
    assert_eq!(record_named(&store, "tag", "ok").schema, "tag");
}

#[test]
fn atomic_run_keeps_everything_on_success_even_with_warnings() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteRecordStore::try_new(&conn).unwrap();
    let registry = registry();

    let report = apply(
        &store,
        &registry,
        r##"{"tag": [{"name": "red"}, {"name": null}], "Department": [{"name": "Ops"}]}"##,
        true,
    )
    .unwrap();

    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(store.count_records("tag").unwrap(), 1);
    assert_eq!(store.count_records("department").unwrap(), 1);
}

#[test]
fn document_shape_errors_fail_before_any_write() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteRecordStore::try_new(&conn).unwrap();
    let registry = registry();

    let failure = apply(
        &store,
        &registry,
        r##"{"tag": [{"name": "red"}], "team": {"name": "core"}}"##,
        false,
    )
    .unwrap_err();
    assert!(matches!(failure.error, ReconcileError::Document(_)));
    assert!(!failure.rolled_back);
    assert_eq!(store.count_records("tag").unwrap(), 0);
}

#[test]
fn fatal_store_error_aborts_run() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteRecordStore::try_new(&conn).unwrap();
    let registry = registry();
    conn.execute_batch("DROP TABLE record_links; DROP TABLE records;")
        .unwrap();

    let failure = apply(&store, &registry, r##"{"tag": [{"name": "red"}]}"##, false).unwrap_err();
    match failure.error {
        ReconcileError::Record {
            schema,
            index,
            source: RecordError::Store(StoreError::Db(_)),
        } => {
            assert_eq!(schema, "tag");
            assert_eq!(index, 0);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn reconcile_accepts_parsed_state_and_file_databases() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("intent.db");
    let registry = registry();

    {
        let conn = open_db(&path).unwrap();
        let store = SqliteRecordStore::try_new(&conn).unwrap();
        let state =
            IntendedState::from_json_str(r##"{"tag": [{"name": "red"}, {"name": "blue"}]}"##)
                .unwrap();
        let report = Reconciler::new(&registry, &store)
            .reconcile(state, &ReconcileOptions::default())
            .unwrap();
        assert_eq!(report.created_count(), 2);
    }

    let conn = open_db(&path).unwrap();
    let store = SqliteRecordStore::try_new(&conn).unwrap();
    assert_eq!(store.count_records("tag").unwrap(), 2);
}

#[test]
fn report_serializes_for_machine_output() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteRecordStore::try_new(&conn).unwrap();
    let registry = registry();

    let report = apply(
        &store,
        &registry,
        r##"{"tag": [{"name": "red"}, {"name": null}]}"##,
        false,
    )
    .unwrap();
    let value = serde_json::to_value(&report).unwrap();

    assert_eq!(value["outcomes"][0]["schema"], json!("tag"));
    assert_eq!(value["outcomes"][0]["label"], json!("red"));
    assert_eq!(value["outcomes"][0]["created"], json!(true));
    assert_eq!(value["outcomes"][0]["record"]["schema"], json!("tag"));
    assert!(matches!(value["outcomes"][0]["record"]["id"], Value::String(_)));
    assert_eq!(value["warnings"][0]["stage"], json!("upsert"));
    assert_eq!(value["warnings"][0]["field"], json!("name"));
}
