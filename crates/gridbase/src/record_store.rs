//! Versioned access to the rows of a physical table

use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, Value};
use serde_json::{json, Map, Value as JsonValue};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::context::RequestContext;
use crate::dialect::{
    Dialect, CREATED_BY_COLUMN, ID_COLUMN, LAST_MODIFIED_BY_COLUMN, LAST_MODIFIED_TIME_COLUMN,
    VERSION_COLUMN,
};
use crate::error::{GridError, Result};
use crate::field::FieldInstance;
use crate::op_log::{OpEntry, OpLog, OpPayload};
use crate::ops::IdPrefix;

/// Current version and modification stamp of one record
#[derive(Debug, Clone, PartialEq)]
pub struct RecordVersion {
    pub id: String,
    pub version: i64,
    pub last_modified_time: Option<DateTime<Utc>>,
    pub last_modified_by: Option<String>,
}

/// A record to insert, keyed by field id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewRecord {
    pub id: Option<String>,
    pub fields: Map<String, JsonValue>,
}

impl NewRecord {
    pub fn new(fields: Map<String, JsonValue>) -> Self {
        Self { id: None, fields }
    }

    pub fn with_id(id: impl Into<String>, fields: Map<String, JsonValue>) -> Self {
        Self {
            id: Some(id.into()),
            fields,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VersionedRecordStore {
    dialect: Dialect,
    op_log: OpLog,
}

impl VersionedRecordStore {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            op_log: OpLog::new(),
        }
    }

    /// Versions of the given records; ids that do not exist are absent from the map
    pub async fn fetch_versions<C>(
        &self,
        conn: &C,
        db_table_name: &str,
        record_ids: &[String],
    ) -> Result<HashMap<String, RecordVersion>>
    where
        C: ConnectionTrait,
    {
        if record_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = self.dialect.select_versions(db_table_name, record_ids.len());
        let values = record_ids.iter().map(|id| Value::from(id.as_str())).collect();
        let rows = conn.query_all(self.dialect.statement(sql, values)).await?;

        let mut versions = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("", ID_COLUMN)?;
            let version: i64 = row.try_get("", VERSION_COLUMN)?;
            let last_modified_time: Option<DateTime<Utc>> =
                row.try_get("", LAST_MODIFIED_TIME_COLUMN).ok().flatten();
            let last_modified_by: Option<String> =
                row.try_get("", LAST_MODIFIED_BY_COLUMN).ok().flatten();
            versions.insert(
                id.clone(),
                RecordVersion {
                    id,
                    version,
                    last_modified_time,
                    last_modified_by,
                },
            );
        }
        Ok(versions)
    }

    /// Insert records at version 0 and log their Create ops.
    ///
    /// Cell values are keyed by field id; every id must be one of `fields`.
    pub async fn create_records<C>(
        &self,
        ctx: &mut RequestContext,
        conn: &C,
        table_id: &str,
        db_table_name: &str,
        fields: &[FieldInstance],
        records: Vec<NewRecord>,
    ) -> Result<Vec<String>>
    where
        C: ConnectionTrait,
    {
        let field_map: HashMap<&str, &FieldInstance> =
            fields.iter().map(|f| (f.id.as_str(), f)).collect();
        let mut ids = Vec::with_capacity(records.len());
        let mut entries = Vec::with_capacity(records.len());

        for record in records {
            let id = record.id.unwrap_or_else(|| IdPrefix::Record.generate());
            let mut columns = vec![ID_COLUMN, VERSION_COLUMN, CREATED_BY_COLUMN];
            let mut values = vec![
                Value::from(id.as_str()),
                Value::BigInt(Some(0)),
                Value::from(ctx.actor_id()),
            ];
            for (field_id, cell) in &record.fields {
                let field = field_map.get(field_id.as_str()).ok_or_else(|| {
                    GridError::Validation(format!("Field {} not found in {}", field_id, table_id))
                })?;
                columns.push(field.db_field_name.as_str());
                values.push(field.convert_cell_value(self.dialect, cell)?);
            }

            let sql = self.dialect.insert_rows(db_table_name, &columns, 1);
            conn.execute(self.dialect.statement(sql, values)).await?;

            entries.push(OpEntry::new(
                id.clone(),
                0,
                OpPayload::Create(json!({ "id": id, "fields": record.fields })),
            ));
            ids.push(id);
        }

        self.op_log
            .save_raw_ops(ctx, conn, table_id, IdPrefix::Record, entries)
            .await?;
        info!("Created {} records in {}", ids.len(), db_table_name);
        Ok(ids)
    }

    /// Hard-delete records and drop their op history
    pub async fn delete_records<C>(
        &self,
        ctx: &mut RequestContext,
        conn: &C,
        table_id: &str,
        db_table_name: &str,
        record_ids: &[String],
    ) -> Result<u64>
    where
        C: ConnectionTrait,
    {
        if record_ids.is_empty() {
            return Ok(0);
        }
        let versions = self.fetch_versions(conn, db_table_name, record_ids).await?;
        if let Some(missing) = record_ids.iter().find(|id| !versions.contains_key(*id)) {
            return Err(GridError::Validation(format!(
                "Record {} not found in {}",
                missing, table_id
            )));
        }

        let entries = record_ids
            .iter()
            .map(|id| OpEntry::new(id.clone(), versions[id].version + 1, OpPayload::Del))
            .collect();
        self.op_log
            .save_raw_ops(ctx, conn, table_id, IdPrefix::Record, entries)
            .await?;

        let sql = self.dialect.delete_rows(db_table_name, record_ids.len());
        let values = record_ids.iter().map(|id| Value::from(id.as_str())).collect();
        let result = conn.execute(self.dialect.statement(sql, values)).await?;
        debug!("Deleted {} records from {}", result.rows_affected(), db_table_name);
        Ok(result.rows_affected())
    }
}

pub(crate) fn modified_columns(actor_id: &str, version: i64) -> [(&'static str, Value); 3] {
    [
        (VERSION_COLUMN, Value::BigInt(Some(version))),
        (LAST_MODIFIED_TIME_COLUMN, Value::from(Utc::now())),
        (LAST_MODIFIED_BY_COLUMN, Value::from(actor_id)),
    ]
}
