#![allow(dead_code)]

use gridbase::dialect::ID_COLUMN;
use gridbase::entity::table_meta;
use gridbase::{
    Database, DbFieldType, FieldInstance, FieldType, GridConfig, NewField, NewRecord,
    RequestContext,
};
use sea_orm::{ConnectionTrait, TryGetable};
use serde_json::{json, Map, Value};

pub const ACTOR: &str = "usrTester";

pub struct Fixture {
    pub db: Database,
    pub ctx: RequestContext,
    pub table: table_meta::Model,
    pub title: FieldInstance,
    pub code: FieldInstance,
    pub score: FieldInstance,
    pub rec_a: String,
    pub rec_b: String,
}

pub fn sqlite_config() -> GridConfig {
    GridConfig {
        max_connections: 1,
        min_connections: 1,
        ..GridConfig::new("sqlite::memory:")
    }
}

pub async fn database(config: GridConfig) -> Database {
    let db = Database::connect(&config).await.unwrap();
    db.migrate().await.unwrap();
    db
}

/// A `Tasks` table with Title, Code (unique) and Score fields and two records
pub async fn fixture() -> Fixture {
    fixture_with(sqlite_config()).await
}

pub async fn fixture_with(config: GridConfig) -> Fixture {
    let db = database(config).await;
    let mut ctx = RequestContext::new(ACTOR);
    let table = db
        .table_manager()
        .create_table(&ctx, db.connection(), "Tasks", "tasks")
        .await
        .unwrap();

    let fields = vec![
        NewField::from(
            FieldInstance::new("Title", FieldType::SingleLineText, DbFieldType::Text)
                .with_db_field_name("Title"),
        ),
        NewField::from(
            FieldInstance::new("Code", FieldType::SingleLineText, DbFieldType::Text)
                .with_db_field_name("Code")
                .with_unique(true),
        ),
        NewField::from(
            FieldInstance::new("Score", FieldType::Number, DbFieldType::Real)
                .with_db_field_name("Score"),
        ),
    ];
    let mut created = db
        .field_manager()
        .batch_create_fields(&mut ctx, db.connection(), &table.id, fields)
        .await
        .unwrap();
    let score = created.pop().unwrap();
    let code = created.pop().unwrap();
    let title = created.pop().unwrap();

    let records = vec![
        NewRecord::with_id("recA", cells(&[(title.id.as_str(), json!("a")), (code.id.as_str(), json!("A-1"))])),
        NewRecord::with_id("recB", cells(&[(title.id.as_str(), json!("b")), (code.id.as_str(), json!("B-1"))])),
    ];
    let fields = vec![title.clone(), code.clone(), score.clone()];
    let ids = db
        .record_store()
        .create_records(&mut ctx, db.connection(), &table.id, &table.db_table_name, &fields, records)
        .await
        .unwrap();
    ctx.take_raw_op_maps();

    Fixture {
        db,
        ctx,
        table,
        title,
        code,
        score,
        rec_a: ids[0].clone(),
        rec_b: ids[1].clone(),
    }
}

pub fn cells(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Read one cell straight from the physical table
pub async fn cell<T: TryGetable>(db: &Database, db_table_name: &str, record_id: &str, column: &str) -> T {
    let d = db.dialect();
    let sql = format!(
        "SELECT {} AS value FROM {} WHERE {} = ?",
        d.quote(column),
        d.quote_table(db_table_name),
        d.quote(ID_COLUMN)
    );
    let row = db
        .connection()
        .query_one(d.statement(sql, vec![record_id.into()]))
        .await
        .unwrap()
        .unwrap();
    row.try_get::<T>("", "value").unwrap()
}

pub async fn version(db: &Database, db_table_name: &str, record_id: &str) -> i64 {
    let versions = db
        .record_store()
        .fetch_versions(db.connection(), db_table_name, &[record_id.to_string()])
        .await
        .unwrap();
    versions[record_id].version
}

pub async fn column_names(db: &Database, db_table_name: &str) -> Vec<String> {
    let rows = db
        .connection()
        .query_all(db.dialect().column_names_query(db_table_name))
        .await
        .unwrap();
    rows.iter()
        .map(|r| r.try_get::<String>("", "name").unwrap())
        .collect()
}
