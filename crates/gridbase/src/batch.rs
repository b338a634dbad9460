//! Versioned batch record updates

use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, TransactionTrait};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;
use tracing::{debug, info};

use crate::bulk::{BulkMutationExecutor, BulkRow};
use crate::config::GridConfig;
use crate::context::RequestContext;
use crate::dialect::{
    ColumnSchema, Dialect, ID_COLUMN, LAST_MODIFIED_BY_COLUMN, LAST_MODIFIED_TIME_COLUMN,
    VERSION_COLUMN,
};
use crate::entity::{field, table_meta};
use crate::error::{GridError, Result};
use crate::field::FieldInstance;
use crate::op_log::{OpEntry, OpLog, OpPayload};
use crate::ops::{IdPrefix, OpsMap, RecordOps};
use crate::record_store::{modified_columns, VersionedRecordStore};
use crate::schema::SchemaType;

/// field id -> field
pub type FieldMap = HashMap<String, FieldInstance>;

/// table id -> physical table name
pub type TableNameMap = HashMap<String, String>;

/// What one `update_records` call wrote
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchUpdateSummary {
    pub updated_records: usize,
    /// Field ids written by each bulk statement, in execution order
    pub bulk_updates: Vec<Vec<String>>,
}

/// A record whose edits were folded into one cell map
#[derive(Debug, Clone, PartialEq)]
struct FoldedRecord {
    record_id: String,
    version: i64,
    cells: BTreeMap<String, JsonValue>,
}

/// Records sharing the exact set of written fields
#[derive(Debug, Clone, PartialEq)]
struct ColumnGroup {
    field_ids: Vec<String>,
    records: Vec<FoldedRecord>,
}

/// Applies an [`OpsMap`] to physical tables and logs one Edit op per record
#[derive(Debug, Clone, Copy)]
pub struct BatchCoordinator {
    dialect: Dialect,
    calc_chunk_size: usize,
    executor: BulkMutationExecutor,
    store: VersionedRecordStore,
    op_log: OpLog,
}

impl BatchCoordinator {
    pub fn new(dialect: Dialect, config: &GridConfig) -> Self {
        Self {
            dialect,
            calc_chunk_size: config.calc_chunk_size.max(1),
            executor: BulkMutationExecutor::new(dialect, config.max_bind_params),
            store: VersionedRecordStore::new(dialect),
            op_log: OpLog::new(),
        }
    }

    /// Write every pending record edit in `ops_map`.
    ///
    /// `field_map` and `table_names` are caches; anything an op references
    /// that they lack is loaded from the metadata tables. Tables are handled
    /// in insertion order, each in sequential chunks of `calc_chunk_size`
    /// records, every chunk in its own nested transaction.
    pub async fn update_records<C>(
        &self,
        ctx: &mut RequestContext,
        conn: &C,
        ops_map: &OpsMap,
        field_map: Option<FieldMap>,
        table_names: Option<TableNameMap>,
    ) -> Result<BatchUpdateSummary>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let start = Instant::now();
        let (field_map, table_names) = self
            .complete_missing_ctx(conn, ops_map, field_map.unwrap_or_default(), table_names.unwrap_or_default())
            .await?;

        let mut summary = BatchUpdateSummary::default();
        for table in ops_map.tables() {
            if table.is_empty() {
                continue;
            }
            let db_table_name = table_names
                .get(&table.table_id)
                .ok_or_else(|| GridError::NotFound(format!("table {}", table.table_id)))?;

            for chunk in table.records().chunks(self.calc_chunk_size) {
                let txn = conn.begin().await?;
                let groups = self
                    .update_records_chunk(ctx, &txn, &table.table_id, db_table_name, &field_map, chunk)
                    .await?;
                txn.commit().await?;
                summary.updated_records += chunk.len();
                summary.bulk_updates.extend(groups);
            }
        }

        info!(
            "Updated {} records with {} bulk statements in {}ms",
            summary.updated_records,
            summary.bulk_updates.len(),
            start.elapsed().as_millis()
        );
        Ok(summary)
    }

    async fn complete_missing_ctx<C>(
        &self,
        conn: &C,
        ops_map: &OpsMap,
        mut field_map: FieldMap,
        mut table_names: TableNameMap,
    ) -> Result<(FieldMap, TableNameMap)>
    where
        C: ConnectionTrait,
    {
        let missing_fields: BTreeSet<String> = ops_map
            .tables()
            .iter()
            .flat_map(|t| t.records())
            .flat_map(|r| r.ops.iter())
            .filter_map(|op| op.detect_set_record().map(|c| c.field_id.to_string()))
            .filter(|id| !field_map.contains_key(id))
            .collect();
        let missing_tables: Vec<String> = ops_map
            .table_ids()
            .filter(|id| !table_names.contains_key(*id))
            .map(str::to_string)
            .collect();

        if !missing_tables.is_empty() {
            let tables = table_meta::Entity::find()
                .filter(table_meta::Column::Id.is_in(missing_tables))
                .filter(table_meta::Column::DeletedTime.is_null())
                .all(conn)
                .await?;
            table_names.extend(tables.into_iter().map(|t| (t.id, t.db_table_name)));
        }

        if !missing_fields.is_empty() {
            debug!("Loading {} fields missing from the batch context", missing_fields.len());
            let raws = field::Entity::find()
                .filter(field::Column::Id.is_in(missing_fields))
                .filter(field::Column::DeletedTime.is_null())
                .all(conn)
                .await?;
            for raw in &raws {
                let instance = FieldInstance::try_from(raw)?;
                field_map.insert(instance.id.clone(), instance);
            }
        }

        Ok((field_map, table_names))
    }

    async fn update_records_chunk<C>(
        &self,
        ctx: &mut RequestContext,
        conn: &C,
        table_id: &str,
        db_table_name: &str,
        field_map: &FieldMap,
        chunk: &[RecordOps],
    ) -> Result<Vec<Vec<String>>>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let record_ids: Vec<String> = chunk.iter().map(|r| r.record_id.clone()).collect();
        let versions = self.store.fetch_versions(conn, db_table_name, &record_ids).await?;
        if let Some(missing) = record_ids.iter().find(|id| !versions.contains_key(*id)) {
            return Err(GridError::Validation(format!(
                "Record {} not found in {}",
                missing, table_id
            )));
        }

        let folded = chunk
            .iter()
            .map(|record| fold_record(record, versions[&record.record_id].version, field_map))
            .collect::<Result<Vec<_>>>()?;

        let groups = group_by_columns(folded);
        let mut written = Vec::with_capacity(groups.len());
        for group in &groups {
            self.execute_group(ctx, conn, db_table_name, field_map, group)
                .await?;
            written.push(group.field_ids.clone());
        }

        let entries = chunk
            .iter()
            .map(|record| {
                OpEntry::new(
                    record.record_id.clone(),
                    versions[&record.record_id].version + 1,
                    OpPayload::Edit(record.ops.clone()),
                )
            })
            .collect();
        self.op_log
            .save_raw_ops(ctx, conn, table_id, IdPrefix::Record, entries)
            .await?;

        Ok(written)
    }

    async fn execute_group<C>(
        &self,
        ctx: &RequestContext,
        conn: &C,
        db_table_name: &str,
        field_map: &FieldMap,
        group: &ColumnGroup,
    ) -> Result<u64>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let fields: Vec<&FieldInstance> = group.field_ids.iter().map(|id| &field_map[id]).collect();

        let mut schemas: Vec<ColumnSchema> = fields
            .iter()
            .map(|f| ColumnSchema::new(f.db_field_name.clone(), f.db_field_type.schema_type()))
            .collect();
        schemas.push(ColumnSchema::new(VERSION_COLUMN, SchemaType::Integer));
        schemas.push(ColumnSchema::new(LAST_MODIFIED_TIME_COLUMN, SchemaType::Datetime));
        schemas.push(ColumnSchema::new(LAST_MODIFIED_BY_COLUMN, SchemaType::String));

        let mut rows = Vec::with_capacity(group.records.len());
        for record in &group.records {
            let mut row = BulkRow::new(record.record_id.clone());
            for field in &fields {
                let cell = &record.cells[&field.id];
                row.set(field.db_field_name.clone(), field.convert_cell_value(self.dialect, cell)?);
            }
            for (column, value) in modified_columns(ctx.actor_id(), record.version + 1) {
                row.set(column, value);
            }
            rows.push(row);
        }

        self.executor
            .batch_update(conn, db_table_name, ID_COLUMN, &schemas, &rows)
            .await
    }
}

/// Fold a record's edits into field id -> final value; later edits win.
///
/// Edits to fields absent from `field_map` are dropped from the write.
fn fold_record(record: &RecordOps, version: i64, field_map: &FieldMap) -> Result<FoldedRecord> {
    let mut cells = BTreeMap::new();
    for op in &record.ops {
        let edit = op
            .detect_set_record()
            .ok_or_else(|| GridError::IllegalOperation(format!("illegal op {} found", op)))?;
        if field_map.contains_key(edit.field_id) {
            cells.insert(edit.field_id.to_string(), edit.new_cell_value.clone());
        }
    }
    Ok(FoldedRecord {
        record_id: record.record_id.clone(),
        version,
        cells,
    })
}

/// Group records by their exact written field set, groups in first-seen order
fn group_by_columns(records: Vec<FoldedRecord>) -> Vec<ColumnGroup> {
    let mut groups: Vec<ColumnGroup> = Vec::new();
    let mut index: HashMap<Vec<String>, usize> = HashMap::new();
    for record in records {
        let key: Vec<String> = record.cells.keys().cloned().collect();
        match index.get(&key) {
            Some(&i) => groups[i].records.push(record),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push(ColumnGroup {
                    field_ids: key,
                    records: vec![record],
                });
            }
        }
    }
    groups
}
