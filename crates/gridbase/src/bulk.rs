//! Staging-table bulk updates with constraint translation

use sea_orm::{
    ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, TransactionTrait,
    Value,
};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::dialect::{ColumnSchema, Dialect};
use crate::entity::{field, table_meta};
use crate::error::{classify_violation, ConstraintViolation, GridError, Result};

/// New values of one row, keyed by physical column name
#[derive(Debug, Clone, PartialEq)]
pub struct BulkRow {
    pub id: String,
    pub values: HashMap<String, Value>,
}

impl BulkRow {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            values: HashMap::new(),
        }
    }

    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        self.values.insert(column.into(), value);
    }
}

/// Applies rows sharing one column shape through a transaction-scoped staging table
#[derive(Debug, Clone, Copy)]
pub struct BulkMutationExecutor {
    dialect: Dialect,
    max_bind_params: usize,
}

impl BulkMutationExecutor {
    pub fn new(dialect: Dialect, max_bind_params: usize) -> Self {
        Self {
            dialect,
            max_bind_params: max_bind_params.max(1),
        }
    }

    /// Update every row in `rows` or none of them.
    ///
    /// Runs in a nested transaction; when the update step hits a unique or
    /// not-null constraint the nested transaction is rolled back and the
    /// failure is reported against the constrained fields among `schemas`.
    pub async fn batch_update<C>(
        &self,
        conn: &C,
        db_table_name: &str,
        id_column: &str,
        schemas: &[ColumnSchema],
        rows: &[BulkRow],
    ) -> Result<u64>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        if rows.is_empty() || schemas.is_empty() {
            return Ok(0);
        }
        let start = Instant::now();
        let temp_table = format!("temp_{}", &Uuid::new_v4().simple().to_string()[..10]);
        let columns: Vec<&str> = schemas.iter().map(|s| s.name.as_str()).collect();
        let inserts = self.staging_inserts(&temp_table, id_column, &columns, rows)?;

        let txn = conn.begin().await?;
        txn.execute_unprepared(&self.dialect.create_temp_table(&temp_table, id_column, schemas))
            .await?;
        for insert in inserts {
            txn.execute(insert).await?;
        }

        let update = self
            .dialect
            .update_from_temp(db_table_name, &temp_table, id_column, &columns);
        let updated = match txn.execute_unprepared(&update).await {
            Ok(result) => result.rows_affected(),
            Err(err) => {
                let violation = classify_violation(&err);
                txn.rollback().await?;
                if self.dialect == Dialect::MySql {
                    // temporary tables outlive a rollback on mysql
                    let drop = self.dialect.drop_temp_table(&temp_table);
                    if let Err(e) = conn.execute_unprepared(&drop).await {
                        warn!("Failed to drop staging table {}: {}", temp_table, e);
                    }
                }
                return Err(match violation {
                    Some(violation) => {
                        self.translate_violation(conn, violation, db_table_name, &columns)
                            .await?
                    }
                    None => err.into(),
                });
            }
        };

        txn.execute_unprepared(&self.dialect.drop_temp_table(&temp_table))
            .await?;
        txn.commit().await?;

        debug!(
            "Bulk updated {} rows of {} ({} columns) in {}ms",
            updated,
            db_table_name,
            columns.len(),
            start.elapsed().as_millis()
        );
        Ok(updated)
    }

    fn staging_inserts(
        &self,
        temp_table: &str,
        id_column: &str,
        columns: &[&str],
        rows: &[BulkRow],
    ) -> Result<Vec<sea_orm::Statement>> {
        let mut insert_columns = Vec::with_capacity(columns.len() + 1);
        insert_columns.push(id_column);
        insert_columns.extend_from_slice(columns);

        let rows_per_statement = (self.max_bind_params / insert_columns.len()).max(1);
        let mut statements = Vec::new();
        for chunk in rows.chunks(rows_per_statement) {
            let mut values = Vec::with_capacity(chunk.len() * insert_columns.len());
            for row in chunk {
                values.push(Value::from(row.id.as_str()));
                for column in columns {
                    let value = row.values.get(*column).ok_or_else(|| {
                        GridError::IllegalOperation(format!(
                            "row {} has no value for column {}",
                            row.id, column
                        ))
                    })?;
                    values.push(value.clone());
                }
            }
            let sql = self.dialect.insert_rows(temp_table, &insert_columns, chunk.len());
            statements.push(self.dialect.statement(sql, values));
        }
        Ok(statements)
    }

    async fn translate_violation<C>(
        &self,
        conn: &C,
        violation: ConstraintViolation,
        db_table_name: &str,
        columns: &[&str],
    ) -> Result<GridError>
    where
        C: ConnectionTrait,
    {
        let table = table_meta::Entity::find()
            .filter(table_meta::Column::DbTableName.eq(db_table_name))
            .one(conn)
            .await?
            .ok_or_else(|| GridError::NotFound(format!("table {}", db_table_name)))?;

        // system columns never carry field constraints
        let field_columns: Vec<String> = columns
            .iter()
            .filter(|c| !c.starts_with("__"))
            .map(|c| c.to_string())
            .collect();
        let flag = match violation {
            ConstraintViolation::Unique => field::Column::Unique,
            ConstraintViolation::NotNull => field::Column::NotNull,
        };
        let fields = field::Entity::find()
            .filter(field::Column::TableId.eq(table.id.as_str()))
            .filter(field::Column::DbFieldName.is_in(field_columns))
            .filter(field::Column::DeletedTime.is_null())
            .filter(flag.eq(true))
            .order_by_asc(field::Column::Order)
            .all(conn)
            .await?;

        warn!(
            "{:?} violation while bulk updating {} ({} constrained fields)",
            violation,
            db_table_name,
            fields.len()
        );
        Ok(GridError::constraint(
            violation,
            table.name,
            fields.iter().map(|f| f.id.clone()).collect(),
            fields.into_iter().map(|f| f.name).collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::ID_COLUMN;

    fn row(id: &str, title: &str) -> BulkRow {
        let mut row = BulkRow::new(id);
        row.set("Title", Value::from(title.to_string()));
        row
    }

    #[test]
    fn staging_inserts_respect_bind_limit() {
        let executor = BulkMutationExecutor::new(Dialect::Postgres, 4);
        let rows = vec![row("rec1", "a"), row("rec2", "b"), row("rec3", "c")];
        let statements = executor
            .staging_inserts("temp_x", ID_COLUMN, &["Title"], &rows)
            .unwrap();
        // two columns per row, four binds per statement
        assert_eq!(statements.len(), 2);
        assert_eq!(
            statements[0].sql,
            "INSERT INTO \"temp_x\" (\"__id\", \"Title\") VALUES ($1, $2), ($3, $4)"
        );
        assert_eq!(statements[1].values.as_ref().map(|v| v.0.len()), Some(2));
    }

    #[test]
    fn staging_inserts_reject_rows_missing_a_column() {
        let executor = BulkMutationExecutor::new(Dialect::Sqlite, 100);
        let rows = vec![BulkRow::new("rec1")];
        let err = executor
            .staging_inserts("temp_x", ID_COLUMN, &["Title"], &rows)
            .unwrap_err();
        assert!(matches!(err, GridError::IllegalOperation(_)));
    }
}
