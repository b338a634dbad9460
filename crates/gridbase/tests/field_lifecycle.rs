mod common;

use common::{cell, column_names, fixture, Fixture};
use gridbase::ops::RawOpType;
use gridbase::{
    DbFieldType, FieldInstance, FieldType, FieldUpdate, GridError, NewField, OpsMap, OtOperation,
    ReferenceGraph,
};
use serde_json::{json, Value};

fn edit(field_id: &str, key: &str, value: Value) -> FieldUpdate {
    FieldUpdate::new(field_id, vec![OtOperation::set_field_property(key, value, Value::Null)])
}

async fn unique_indexes(fx: &Fixture, field: &FieldInstance, db_field_name: &str) -> Vec<String> {
    fx.db
        .field_manager()
        .find_unique_indexes_for_field(fx.db.connection(), &fx.table.db_table_name, db_field_name, &field.id)
        .await
        .unwrap()
}

fn sorted(mut ids: Vec<String>) -> Vec<String> {
    ids.sort();
    ids
}

/// Adds a formula field reading from Score
async fn add_total(fx: &mut Fixture) -> FieldInstance {
    let total = FieldInstance::new("Total", FieldType::Formula, DbFieldType::Real);
    fx.db
        .field_manager()
        .create_field(
            &mut fx.ctx,
            fx.db.connection(),
            &fx.table.id,
            NewField::depending_on(total, vec![fx.score.id.clone()]),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn not_null_at_creation_is_rejected_but_the_field_exists() {
    let mut fx = fixture().await;
    let reference = FieldInstance::new("Reference", FieldType::SingleLineText, DbFieldType::Text)
        .with_unique(true)
        .with_not_null(true);
    let id = reference.id.clone();
    let manager = fx.db.field_manager();

    let err = manager
        .create_field(&mut fx.ctx, fx.db.connection(), &fx.table.id, reference.into())
        .await
        .unwrap_err();
    assert!(matches!(err, GridError::Validation(_)));

    let created = manager
        .get_field(fx.db.connection(), &fx.table.id, &id)
        .await
        .unwrap();
    assert!(created.unique);
    assert!(!created.not_null);
    assert_eq!(created.db_field_name, "Reference");
    assert_eq!(created.order, 3.0);

    let indexes = unique_indexes(&fx, &created, &created.db_field_name).await;
    assert_eq!(indexes.len(), 1);
    assert!(indexes[0].len() <= 63);
    assert_eq!(indexes[0], indexes[0].to_lowercase());
    assert!(column_names(&fx.db, &fx.table.db_table_name)
        .await
        .contains(&"Reference".to_string()));
}

#[tokio::test]
async fn unique_is_refused_for_types_without_support() {
    let mut fx = fixture().await;
    let flag = FieldInstance::new("Done", FieldType::Checkbox, DbFieldType::Boolean).with_unique(true);

    let err = fx
        .db
        .field_manager()
        .create_field(&mut fx.ctx, fx.db.connection(), &fx.table.id, flag.into())
        .await
        .unwrap_err();

    assert!(matches!(err, GridError::Validation(ref msg) if msg.contains("checkbox")));
    let fields = fx
        .db
        .field_manager()
        .get_fields(fx.db.connection(), &fx.table.id)
        .await
        .unwrap();
    assert_eq!(fields.len(), 3);
}

#[tokio::test]
async fn generated_column_names_avoid_collisions() {
    let fx = fixture().await;
    let manager = fx.db.field_manager();

    let fresh = manager
        .generate_db_field_name(fx.db.connection(), &fx.table.id, "Due date")
        .await
        .unwrap();
    assert_eq!(fresh, "Due_date");

    let taken = manager
        .generate_db_field_name(fx.db.connection(), &fx.table.id, "Title")
        .await
        .unwrap();
    assert_ne!(taken, "Title");
    assert!(taken.starts_with("Title"));

    let both = manager
        .generate_db_field_names(
            fx.db.connection(),
            &fx.table.id,
            &["Notes".to_string(), "Notes".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(both[0], "Notes");
    assert_ne!(both[0], both[1]);
}

#[tokio::test]
async fn explicit_column_names_must_be_free() {
    let mut fx = fixture().await;
    let manager = fx.db.field_manager();

    for taken in ["Code", "__version"] {
        let field = FieldInstance::new("Other code", FieldType::SingleLineText, DbFieldType::Text)
            .with_db_field_name(taken);
        let err = manager
            .create_field(&mut fx.ctx, fx.db.connection(), &fx.table.id, field.into())
            .await
            .unwrap_err();
        assert!(matches!(err, GridError::Validation(ref msg) if msg.contains(taken)));
    }

    let twice = vec![
        NewField::from(FieldInstance::new("A", FieldType::SingleLineText, DbFieldType::Text).with_db_field_name("Notes")),
        NewField::from(FieldInstance::new("B", FieldType::SingleLineText, DbFieldType::Text).with_db_field_name("Notes")),
    ];
    let err = manager
        .batch_create_fields(&mut fx.ctx, fx.db.connection(), &fx.table.id, twice)
        .await
        .unwrap_err();
    assert!(matches!(err, GridError::Validation(_)));

    let fields = manager
        .get_fields(fx.db.connection(), &fx.table.id)
        .await
        .unwrap();
    assert_eq!(fields.len(), 3);
    assert!(!column_names(&fx.db, &fx.table.db_table_name)
        .await
        .contains(&"Notes".to_string()));
}

#[tokio::test]
async fn generated_names_step_around_explicit_ones_in_the_batch() {
    let mut fx = fixture().await;
    let batch = vec![
        NewField::from(FieldInstance::new("Memo", FieldType::LongText, DbFieldType::Text).with_db_field_name("Notes")),
        NewField::from(FieldInstance::new("Notes", FieldType::LongText, DbFieldType::Text)),
    ];

    let created = fx
        .db
        .field_manager()
        .batch_create_fields(&mut fx.ctx, fx.db.connection(), &fx.table.id, batch)
        .await
        .unwrap();

    assert_eq!(created[0].db_field_name, "Notes");
    assert_ne!(created[1].db_field_name, "Notes");
    assert!(created[1].db_field_name.starts_with("Notes"));
    let columns = column_names(&fx.db, &fx.table.db_table_name).await;
    assert!(columns.contains(&created[1].db_field_name));
}

#[tokio::test]
async fn renaming_the_column_keeps_its_data() {
    let mut fx = fixture().await;
    let manager = fx.db.field_manager();

    let outcome = manager
        .batch_update_fields(
            &mut fx.ctx,
            fx.db.connection(),
            &fx.table.id,
            vec![edit(&fx.title.id, "dbFieldName", json!("Headline"))],
        )
        .await
        .unwrap();
    assert_eq!(outcome.updated, vec![fx.title.id.clone()]);
    assert!(outcome.rejected.is_empty());

    let columns = column_names(&fx.db, &fx.table.db_table_name).await;
    assert!(columns.contains(&"Headline".to_string()));
    assert!(!columns.contains(&"Title".to_string()));
    assert_eq!(
        cell::<Option<String>>(&fx.db, &fx.table.db_table_name, &fx.rec_a, "Headline")
            .await
            .as_deref(),
        Some("a")
    );

    let renamed = manager
        .get_field(fx.db.connection(), &fx.table.id, &fx.title.id)
        .await
        .unwrap();
    assert_eq!(renamed.db_field_name, "Headline");
    assert_eq!(renamed.version, 1);

    let history = fx
        .db
        .op_log()
        .get_ops(fx.db.connection(), &fx.table.id, &fx.title.id)
        .await
        .unwrap();
    let kinds: Vec<(RawOpType, i64)> = history.iter().map(|op| (op.op_type(), op.v)).collect();
    assert_eq!(kinds, vec![(RawOpType::Create, 0), (RawOpType::Edit, 1)]);
    let collection = format!("fld_{}", fx.table.id);
    assert!(fx.ctx.raw_op_maps()[0].contains_key(&collection));
}

#[tokio::test]
async fn renaming_onto_a_taken_column_is_rejected() {
    let mut fx = fixture().await;
    let before = column_names(&fx.db, &fx.table.db_table_name).await;

    let err = fx
        .db
        .field_manager()
        .batch_update_fields(
            &mut fx.ctx,
            fx.db.connection(),
            &fx.table.id,
            vec![edit(&fx.title.id, "dbFieldName", json!("Code"))],
        )
        .await
        .unwrap_err();

    assert!(matches!(err, GridError::Validation(ref msg) if msg.contains("Code")));
    assert_eq!(column_names(&fx.db, &fx.table.db_table_name).await, before);
    let title = fx
        .db
        .field_manager()
        .get_field(fx.db.connection(), &fx.table.id, &fx.title.id)
        .await
        .unwrap();
    assert_eq!(title.version, 0);
}

#[tokio::test]
async fn display_names_are_unique_per_table() {
    let mut fx = fixture().await;

    let err = fx
        .db
        .field_manager()
        .batch_update_fields(
            &mut fx.ctx,
            fx.db.connection(),
            &fx.table.id,
            vec![edit(&fx.title.id, "name", json!("Code"))],
        )
        .await
        .unwrap_err();

    assert!(matches!(err, GridError::Validation(_)));
}

#[tokio::test]
async fn unknown_edit_rejects_only_that_field() {
    let mut fx = fixture().await;
    let manager = fx.db.field_manager();

    let outcome = manager
        .batch_update_fields(
            &mut fx.ctx,
            fx.db.connection(),
            &fx.table.id,
            vec![
                edit(&fx.title.id, "colour", json!("red")),
                edit(&fx.score.id, "description", json!("points earned")),
            ],
        )
        .await
        .unwrap();

    assert_eq!(outcome.updated, vec![fx.score.id.clone()]);
    assert_eq!(outcome.rejected.len(), 1);
    assert_eq!(outcome.rejected[0].field_id, fx.title.id);
    assert!(outcome.rejected[0].reason.contains("colour"));

    let score = manager
        .get_field(fx.db.connection(), &fx.table.id, &fx.score.id)
        .await
        .unwrap();
    assert_eq!(score.description.as_deref(), Some("points earned"));
    assert_eq!(score.version, 1);
    let title = manager
        .get_field(fx.db.connection(), &fx.table.id, &fx.title.id)
        .await
        .unwrap();
    assert_eq!(title.version, 0);
}

#[tokio::test]
async fn invalid_edit_value_aborts_the_whole_call() {
    let mut fx = fixture().await;
    let manager = fx.db.field_manager();

    let err = manager
        .batch_update_fields(
            &mut fx.ctx,
            fx.db.connection(),
            &fx.table.id,
            vec![
                edit(&fx.score.id, "description", json!("points earned")),
                edit(&fx.title.id, "dbFieldType", json!("VARCHAR")),
            ],
        )
        .await
        .unwrap_err();

    assert!(matches!(err, GridError::Validation(ref msg) if msg.contains("VARCHAR")));
    assert!(err.is_client_error());
    let score = manager
        .get_field(fx.db.connection(), &fx.table.id, &fx.score.id)
        .await
        .unwrap();
    assert_eq!(score.version, 0);
    assert_eq!(score.description, None);
    assert!(fx.ctx.raw_op_maps().is_empty());
}

#[tokio::test]
async fn lookup_edits_move_the_reference_edges() {
    let mut fx = fixture().await;
    let manager = fx.db.field_manager();
    let graph = ReferenceGraph::new();
    let lookup = FieldInstance::new("Code of title", FieldType::SingleLineText, DbFieldType::Text)
        .with_lookup_options(json!({"linkFieldId": fx.title.id, "lookupFieldId": fx.code.id}));

    let lookup = manager
        .create_field(
            &mut fx.ctx,
            fx.db.connection(),
            &fx.table.id,
            NewField::depending_on(lookup, vec![fx.score.id.clone()]),
        )
        .await
        .unwrap();
    assert!(lookup.is_lookup);
    assert!(!lookup.has_error);
    let edges = sorted(graph.dependencies(fx.db.connection(), &lookup.id).await.unwrap());
    assert_eq!(edges, sorted(vec![fx.title.id.clone(), fx.code.id.clone(), fx.score.id.clone()]));

    manager
        .batch_update_fields(
            &mut fx.ctx,
            fx.db.connection(),
            &fx.table.id,
            vec![edit(
                &lookup.id,
                "lookupOptions",
                json!({"linkFieldId": fx.code.id, "lookupFieldId": fx.code.id}),
            )],
        )
        .await
        .unwrap();
    let edges = sorted(graph.dependencies(fx.db.connection(), &lookup.id).await.unwrap());
    assert_eq!(edges, sorted(vec![fx.code.id.clone(), fx.score.id.clone()]));
    let stored = manager
        .get_field(fx.db.connection(), &fx.table.id, &lookup.id)
        .await
        .unwrap();
    assert_eq!(stored.lookup_linked_field_id().as_deref(), Some(fx.code.id.as_str()));

    manager
        .batch_update_fields(
            &mut fx.ctx,
            fx.db.connection(),
            &fx.table.id,
            vec![edit(&lookup.id, "isLookup", Value::Null)],
        )
        .await
        .unwrap();
    let edges = graph.dependencies(fx.db.connection(), &lookup.id).await.unwrap();
    assert_eq!(edges, vec![fx.score.id.clone()]);
}

#[tokio::test]
async fn toggling_unique_adds_and_drops_the_index() {
    let mut fx = fixture().await;
    let manager = fx.db.field_manager();
    assert_eq!(unique_indexes(&fx, &fx.code, "Code").await.len(), 1);

    manager
        .batch_update_fields(
            &mut fx.ctx,
            fx.db.connection(),
            &fx.table.id,
            vec![edit(&fx.code.id, "unique", Value::Null)],
        )
        .await
        .unwrap();
    assert!(unique_indexes(&fx, &fx.code, "Code").await.is_empty());
    let code = manager
        .get_field(fx.db.connection(), &fx.table.id, &fx.code.id)
        .await
        .unwrap();
    assert!(!code.unique);

    manager
        .batch_update_fields(
            &mut fx.ctx,
            fx.db.connection(),
            &fx.table.id,
            vec![edit(&fx.code.id, "unique", json!(true))],
        )
        .await
        .unwrap();
    assert_eq!(unique_indexes(&fx, &fx.code, "Code").await.len(), 1);
}

#[tokio::test]
async fn unique_over_duplicate_data_names_the_field() {
    let mut fx = fixture().await;
    let mut ops = OpsMap::new();
    ops.push(
        &fx.table.id,
        &fx.rec_b,
        OtOperation::set_record(&fx.title.id, json!("a"), json!("b")),
    );
    fx.db
        .batch_coordinator()
        .update_records(&mut fx.ctx, fx.db.connection(), &ops, None, None)
        .await
        .unwrap();

    let err = fx
        .db
        .field_manager()
        .batch_update_fields(
            &mut fx.ctx,
            fx.db.connection(),
            &fx.table.id,
            vec![edit(&fx.title.id, "unique", json!(true))],
        )
        .await
        .unwrap_err();

    match err {
        GridError::FieldValueDuplicate {
            table_name,
            field_names,
            ..
        } => {
            assert_eq!(table_name, "Tasks");
            assert_eq!(field_names, vec!["Title".to_string()]);
        }
        other => panic!("expected a duplicate error, got {:?}", other),
    }
    assert!(unique_indexes(&fx, &fx.title, "Title").await.is_empty());
}

#[tokio::test]
async fn not_null_over_empty_values_names_the_field() {
    let mut fx = fixture().await;

    let err = fx
        .db
        .field_manager()
        .batch_update_fields(
            &mut fx.ctx,
            fx.db.connection(),
            &fx.table.id,
            vec![edit(&fx.score.id, "notNull", json!(true))],
        )
        .await
        .unwrap_err();

    match &err {
        GridError::FieldValueNotNull {
            table_name,
            field_ids,
            field_names,
        } => {
            assert_eq!(table_name, "Tasks");
            assert_eq!(field_ids, &vec![fx.score.id.clone()]);
            assert_eq!(field_names, &vec!["Score".to_string()]);
        }
        other => panic!("expected a not-null error, got {:?}", other),
    }
    assert_eq!(err.i18n_key(), Some("httpErrors.custom.fieldValueNotNull"));
    let score = fx
        .db
        .field_manager()
        .get_field(fx.db.connection(), &fx.table.id, &fx.score.id)
        .await
        .unwrap();
    assert!(!score.not_null);
    assert_eq!(score.version, 0);
}

#[tokio::test]
async fn toggling_not_null_rebuilds_the_table_in_place() {
    let mut fx = fixture().await;
    let manager = fx.db.field_manager();
    let columns = column_names(&fx.db, &fx.table.db_table_name).await;

    manager
        .batch_update_fields(
            &mut fx.ctx,
            fx.db.connection(),
            &fx.table.id,
            vec![edit(&fx.title.id, "notNull", json!(true))],
        )
        .await
        .unwrap();

    let title = manager
        .get_field(fx.db.connection(), &fx.table.id, &fx.title.id)
        .await
        .unwrap();
    assert!(title.not_null);
    assert_eq!(title.version, 1);
    let table = &fx.table.db_table_name;
    assert_eq!(cell::<Option<String>>(&fx.db, table, &fx.rec_a, "Title").await.as_deref(), Some("a"));
    assert_eq!(cell::<Option<String>>(&fx.db, table, &fx.rec_b, "Code").await.as_deref(), Some("B-1"));
    assert_eq!(unique_indexes(&fx, &fx.code, "Code").await.len(), 1);
    assert_eq!(column_names(&fx.db, table).await, columns);

    manager
        .batch_update_fields(
            &mut fx.ctx,
            fx.db.connection(),
            &fx.table.id,
            vec![edit(&fx.title.id, "notNull", Value::Null)],
        )
        .await
        .unwrap();
    let title = manager
        .get_field(fx.db.connection(), &fx.table.id, &fx.title.id)
        .await
        .unwrap();
    assert!(!title.not_null);
    assert_eq!(title.version, 2);
}

#[tokio::test]
async fn retyping_clears_existing_values() {
    let mut fx = fixture().await;

    fx.db
        .field_manager()
        .batch_update_fields(
            &mut fx.ctx,
            fx.db.connection(),
            &fx.table.id,
            vec![FieldUpdate::new(
                fx.title.id.clone(),
                vec![
                    OtOperation::set_field_property("dbFieldType", json!("INTEGER"), json!("TEXT")),
                    OtOperation::set_field_property("type", json!("number"), json!("singleLineText")),
                ],
            )],
        )
        .await
        .unwrap();

    let title = fx
        .db
        .field_manager()
        .get_field(fx.db.connection(), &fx.table.id, &fx.title.id)
        .await
        .unwrap();
    assert_eq!(title.db_field_type, DbFieldType::Integer);
    assert_eq!(title.field_type, FieldType::Number);
    assert_eq!(
        cell::<Option<String>>(&fx.db, &fx.table.db_table_name, &fx.rec_a, "Title").await,
        None
    );
}

#[tokio::test]
async fn computed_fields_start_pending() {
    let mut fx = fixture().await;
    let total = add_total(&mut fx).await;
    assert!(total.is_pending);
    assert!(total.is_computed);
    assert!(!total.has_error);

    let manager = fx.db.field_manager();
    manager
        .resolve_pending(&mut fx.ctx, fx.db.connection(), &fx.table.id, &[total.id.clone()])
        .await
        .unwrap();
    let total = manager
        .get_field(fx.db.connection(), &fx.table.id, &total.id)
        .await
        .unwrap();
    assert!(!total.is_pending);
    assert_eq!(total.version, 1);
}

#[tokio::test]
async fn depending_on_a_missing_field_flags_an_error() {
    let mut fx = fixture().await;
    let broken = FieldInstance::new("Broken", FieldType::Formula, DbFieldType::Real);

    let created = fx
        .db
        .field_manager()
        .create_field(
            &mut fx.ctx,
            fx.db.connection(),
            &fx.table.id,
            NewField::depending_on(broken, vec!["fldNowhere".to_string()]),
        )
        .await
        .unwrap();

    assert!(created.has_error);
}

#[tokio::test]
async fn deleting_a_field_drops_its_column_and_flags_dependents() {
    let mut fx = fixture().await;
    let total = add_total(&mut fx).await;
    let manager = fx.db.field_manager();

    manager
        .batch_delete_fields(&mut fx.ctx, fx.db.connection(), &fx.table.id, &[fx.score.id.clone()])
        .await
        .unwrap();

    assert!(!column_names(&fx.db, &fx.table.db_table_name)
        .await
        .contains(&"Score".to_string()));
    let err = manager
        .get_field(fx.db.connection(), &fx.table.id, &fx.score.id)
        .await
        .unwrap_err();
    assert!(matches!(err, GridError::NotFound(_)));

    let snapshots = manager
        .get_snapshot_bulk(fx.db.connection(), &fx.table.id, &[fx.score.id.clone(), fx.title.id.clone()])
        .await
        .unwrap();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].id, fx.score.id);
    assert_eq!(snapshots[0].v, 1);
    assert_eq!(snapshots[0].kind, "json0");
    assert_eq!(snapshots[1].id, fx.title.id);

    let history = fx
        .db
        .op_log()
        .get_ops(fx.db.connection(), &fx.table.id, &fx.score.id)
        .await
        .unwrap();
    assert!(history.is_empty());

    let total = manager
        .get_field(fx.db.connection(), &fx.table.id, &total.id)
        .await
        .unwrap();
    assert!(total.has_error);
}

#[tokio::test]
async fn deleting_a_unique_field_drops_its_index() {
    let mut fx = fixture().await;

    fx.db
        .field_manager()
        .batch_delete_fields(&mut fx.ctx, fx.db.connection(), &fx.table.id, &[fx.code.id.clone()])
        .await
        .unwrap();

    assert!(unique_indexes(&fx, &fx.code, "Code").await.is_empty());
    assert!(!column_names(&fx.db, &fx.table.db_table_name)
        .await
        .contains(&"Code".to_string()));
}

#[tokio::test]
async fn deleting_an_unknown_field_fails() {
    let mut fx = fixture().await;

    let err = fx
        .db
        .field_manager()
        .batch_delete_fields(
            &mut fx.ctx,
            fx.db.connection(),
            &fx.table.id,
            &[fx.title.id.clone(), "fldUnknown".to_string()],
        )
        .await
        .unwrap_err();

    assert!(matches!(err, GridError::Validation(ref msg) if msg == "delete field not found"));
    assert!(column_names(&fx.db, &fx.table.db_table_name)
        .await
        .contains(&"Title".to_string()));
}

#[tokio::test]
async fn purge_waits_for_live_dependents() {
    let mut fx = fixture().await;
    let total = add_total(&mut fx).await;
    let manager = fx.db.field_manager();
    let score_ids = vec![fx.score.id.clone()];

    let err = manager
        .purge_fields(fx.db.connection(), &fx.table.id, &score_ids)
        .await
        .unwrap_err();
    assert!(matches!(err, GridError::Validation(ref msg) if msg.contains("deleted before")));

    manager
        .batch_delete_fields(&mut fx.ctx, fx.db.connection(), &fx.table.id, &score_ids)
        .await
        .unwrap();
    let err = manager
        .purge_fields(fx.db.connection(), &fx.table.id, &score_ids)
        .await
        .unwrap_err();
    assert!(matches!(err, GridError::Validation(ref msg) if msg.contains(&total.id)));

    manager
        .batch_delete_fields(&mut fx.ctx, fx.db.connection(), &fx.table.id, &[total.id.clone()])
        .await
        .unwrap();
    let purged = manager
        .purge_fields(fx.db.connection(), &fx.table.id, &score_ids)
        .await
        .unwrap();
    assert_eq!(purged, 1);

    let snapshots = manager
        .get_snapshot_bulk(fx.db.connection(), &fx.table.id, &score_ids)
        .await
        .unwrap();
    assert!(snapshots.is_empty());

    let again = manager
        .purge_fields(fx.db.connection(), &fx.table.id, &score_ids)
        .await
        .unwrap();
    assert_eq!(again, 0);
}
