//! Field lifecycle and the physical schema behind it
//!
//! [`FieldSchemaManager`] keeps the `field` metadata rows and the physical
//! columns of the owning table in step: creating a field adds its column,
//! renaming or retyping it alters the column, toggling a constraint adds or
//! drops the matching index, and a soft delete drops the column while the
//! metadata row stays behind until [`FieldSchemaManager::purge_fields`].

mod model;

pub use model::{FieldInstance, FieldType, NewField};

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, IntoActiveModel, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::context::RequestContext;
use crate::dialect::{Dialect, TableColumn};
use crate::entity::{field, table_meta};
use crate::error::{classify_violation, GridError, Result};
use crate::op_log::{OpEntry, OpLog, OpPayload};
use crate::ops::{FieldPropertyChange, IdPrefix, OtOperation};
use crate::reference::ReferenceGraph;
use crate::schema::{
    field_unique_key_name, is_field_unique_index, sanitize_db_field_name, DbFieldType,
};
use crate::table::TableManager;

/// Ordered property edits for one field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub field_id: String,
    pub ops: Vec<OtOperation>,
}

impl FieldUpdate {
    pub fn new(field_id: impl Into<String>, ops: Vec<OtOperation>) -> Self {
        Self {
            field_id: field_id.into(),
            ops,
        }
    }
}

/// A field whose edits were refused
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedFieldUpdate {
    pub field_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldUpdateOutcome {
    pub updated: Vec<String>,
    pub rejected: Vec<RejectedFieldUpdate>,
}

/// Versioned field snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSnapshot {
    pub id: String,
    pub v: i64,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: FieldInstance,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSchemaManager {
    dialect: Dialect,
    tables: TableManager,
    references: ReferenceGraph,
    op_log: OpLog,
}

impl FieldSchemaManager {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            tables: TableManager::new(dialect),
            references: ReferenceGraph::new(),
            op_log: OpLog::new(),
        }
    }

    pub async fn get_db_table_name<C>(&self, conn: &C, table_id: &str) -> Result<String>
    where
        C: ConnectionTrait,
    {
        self.tables.get_db_table_name(conn, table_id).await
    }

    async fn column_names<C>(&self, conn: &C, db_table_name: &str) -> Result<Vec<String>>
    where
        C: ConnectionTrait,
    {
        let rows = conn
            .query_all(self.dialect.column_names_query(db_table_name))
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String>("", "name").map_err(GridError::from))
            .collect()
    }

    /// Physical column name for a display name, unique within the table
    pub async fn generate_db_field_name<C>(&self, conn: &C, table_id: &str, name: &str) -> Result<String>
    where
        C: ConnectionTrait,
    {
        let mut names = self
            .generate_db_field_names(conn, table_id, &[name.to_string()])
            .await?;
        names
            .pop()
            .ok_or_else(|| GridError::Validation(format!("No column name for {}", name)))
    }

    /// Physical column names for several display names.
    ///
    /// A name colliding with an existing column, or with one generated
    /// earlier in the same call, gets a millisecond timestamp suffix.
    pub async fn generate_db_field_names<C>(
        &self,
        conn: &C,
        table_id: &str,
        names: &[String],
    ) -> Result<Vec<String>>
    where
        C: ConnectionTrait,
    {
        let db_table_name = self.get_db_table_name(conn, table_id).await?;
        let mut taken: HashSet<String> = self
            .column_names(conn, &db_table_name)
            .await?
            .into_iter()
            .collect();
        let ts = Utc::now().timestamp_millis();

        let mut generated = Vec::with_capacity(names.len());
        for name in names {
            let base = sanitize_db_field_name(name);
            let mut candidate = base.clone();
            let mut bump = 0;
            while taken.contains(&candidate) {
                candidate = format!("{}{}", base, ts + bump);
                bump += 1;
            }
            taken.insert(candidate.clone());
            generated.push(candidate);
        }
        Ok(generated)
    }

    pub async fn create_field<C>(
        &self,
        ctx: &mut RequestContext,
        conn: &C,
        table_id: &str,
        field: NewField,
    ) -> Result<FieldInstance>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let mut created = self
            .batch_create_fields(ctx, conn, table_id, vec![field])
            .await?;
        created
            .pop()
            .ok_or_else(|| GridError::Validation("No field created".to_string()))
    }

    /// Create fields with their physical columns and log Create ops at version 0.
    ///
    /// Unique fields get their index right away. A not-null declaration
    /// cannot be honoured on a new column: the fields are still created,
    /// nullable, and the call then fails with a validation error.
    pub async fn batch_create_fields<C>(
        &self,
        ctx: &mut RequestContext,
        conn: &C,
        table_id: &str,
        fields: Vec<NewField>,
    ) -> Result<Vec<FieldInstance>>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let start = Instant::now();
        let txn = conn.begin().await?;
        let table = self.tables.get_table(&txn, table_id).await?;

        for new in &fields {
            let f = &new.field;
            if f.unique && !f.field_type.supports_unique(f.is_lookup) {
                return Err(GridError::Validation(format!(
                    "Field type \"{}\" does not support field value unique validation",
                    f.field_type
                )));
            }
        }

        let mut taken: HashSet<String> = self
            .column_names(&txn, &table.db_table_name)
            .await?
            .into_iter()
            .collect();
        for new in fields.iter().filter(|f| !f.field.db_field_name.is_empty()) {
            let db_field_name = &new.field.db_field_name;
            if db_field_name.starts_with("__") || !taken.insert(db_field_name.clone()) {
                return Err(GridError::Validation(format!(
                    "Db Field name {} already exists in this table",
                    db_field_name
                )));
            }
        }

        let unnamed: Vec<String> = fields
            .iter()
            .filter(|f| f.field.db_field_name.is_empty())
            .map(|f| f.field.name.clone())
            .collect();
        let mut generated = self
            .generate_db_field_names(&txn, table_id, &unnamed)
            .await?
            .into_iter();

        let last = field::Entity::find()
            .filter(field::Column::TableId.eq(table_id))
            .filter(field::Column::DeletedTime.is_null())
            .order_by_desc(field::Column::Order)
            .limit(1)
            .one(&txn)
            .await?;
        let base_order = last.map(|f| f.order + 1.0).unwrap_or(0.0);

        let mut created = Vec::with_capacity(fields.len());
        let mut entries = Vec::with_capacity(fields.len());
        let mut rejected_not_null = Vec::new();

        for (i, NewField { mut field, mut depends_on }) in fields.into_iter().enumerate() {
            if field.db_field_name.is_empty() {
                let mut name = generated.next().unwrap_or_default();
                // explicit names in this batch are not visible to the generator
                while taken.contains(&name) {
                    name.push('_');
                }
                taken.insert(name.clone());
                field.db_field_name = name;
            }
            for id in field.lookup_dependencies() {
                if !depends_on.contains(&id) {
                    depends_on.push(id);
                }
            }
            field.table_id = table_id.to_string();
            field.order = base_order + i as f64;
            field.version = 0;
            field.is_pending = field.is_computed;
            if field.not_null {
                rejected_not_null.push(field.field_type);
                field.not_null = false;
            }
            if !depends_on.is_empty() {
                let wanted: HashSet<&String> = depends_on.iter().collect();
                let live = field::Entity::find()
                    .filter(field::Column::Id.is_in(depends_on.iter().cloned()))
                    .filter(field::Column::DeletedTime.is_null())
                    .count(&txn)
                    .await?;
                field.has_error = (live as usize) < wanted.len();
            }

            to_active_model(&field, ctx.actor_id()).insert(&txn).await?;

            txn.execute_unprepared(&self.dialect.add_column(
                &table.db_table_name,
                &field.db_field_name,
                field.db_field_type.schema_type(),
            ))
            .await?;
            if field.unique {
                let index = field_unique_key_name(&table.db_table_name, &field.id);
                self.execute_translated(
                    &txn,
                    vec![self
                        .dialect
                        .create_unique_index(&table.db_table_name, &field.db_field_name, &index)],
                    &table.name,
                    &field,
                )
                .await?;
            }
            if !depends_on.is_empty() {
                self.references
                    .set_dependencies(&txn, &field.id, &depends_on)
                    .await?;
            }

            entries.push(OpEntry::new(
                field.id.clone(),
                0,
                OpPayload::Create(serde_json::to_value(&field)?),
            ));
            created.push(field);
        }

        self.op_log
            .save_raw_ops(ctx, &txn, table_id, IdPrefix::Field, entries)
            .await?;
        txn.commit().await?;

        info!(
            "Created {} fields in {} in {}ms",
            created.len(),
            table.db_table_name,
            start.elapsed().as_millis()
        );
        if let Some(field_type) = rejected_not_null.first() {
            return Err(GridError::Validation(format!(
                "Field type \"{}\" does not support field validation when creating a new field",
                field_type
            )));
        }
        Ok(created)
    }

    /// Apply property edits field by field, logging one Edit op per updated field.
    ///
    /// A field whose edits contain an unknown kind is rejected on its own;
    /// validation failures abort the whole call.
    pub async fn batch_update_fields<C>(
        &self,
        ctx: &mut RequestContext,
        conn: &C,
        table_id: &str,
        updates: Vec<FieldUpdate>,
    ) -> Result<FieldUpdateOutcome>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let mut outcome = FieldUpdateOutcome::default();
        if updates.is_empty() {
            return Ok(outcome);
        }
        let txn = conn.begin().await?;
        let table = self.tables.get_table(&txn, table_id).await?;
        let mut raws: HashMap<String, field::Model> = field::Entity::find()
            .filter(field::Column::TableId.eq(table_id))
            .filter(field::Column::Id.is_in(updates.iter().map(|u| u.field_id.clone())))
            .filter(field::Column::DeletedTime.is_null())
            .all(&txn)
            .await?
            .into_iter()
            .map(|f| (f.id.clone(), f))
            .collect();

        let mut entries = Vec::with_capacity(updates.len());
        for FieldUpdate { field_id, ops } in updates {
            let raw = raws
                .remove(&field_id)
                .ok_or_else(|| GridError::NotFound(format!("field {} in table {}", field_id, table_id)))?;

            let changes = match ops
                .iter()
                .map(FieldPropertyChange::from_op)
                .collect::<Result<Vec<_>>>()
            {
                Ok(changes) => changes,
                Err(err @ GridError::IllegalOperation(_)) => {
                    warn!("Rejected edits of field {}: {}", field_id, err);
                    outcome.rejected.push(RejectedFieldUpdate {
                        field_id,
                        reason: err.to_string(),
                    });
                    continue;
                }
                Err(err) => return Err(err),
            };

            for change in &changes {
                if let FieldPropertyChange::Name(name) = change {
                    self.check_field_name(&txn, table_id, &field_id, name).await?;
                }
            }

            let version = raw.version + 1;
            let mut current = FieldInstance::try_from(&raw)?;
            let lookup_edited = changes.iter().any(|c| {
                matches!(c, FieldPropertyChange::LookupOptions(_) | FieldPropertyChange::IsLookup(_))
            });
            let lookup_before = current.lookup_dependencies();
            let mut active = raw.into_active_model();
            for change in changes {
                self.apply_change(&txn, &table, &mut current, &mut active, change)
                    .await?;
            }
            if lookup_edited {
                self.refresh_lookup_dependencies(&txn, &field_id, &lookup_before, &current.lookup_dependencies())
                    .await?;
            }
            active.version = Set(version);
            active.last_modified_time = Set(Some(Utc::now()));
            active.last_modified_by = Set(Some(ctx.actor_id().to_string()));
            active.update(&txn).await?;

            entries.push(OpEntry::new(field_id.clone(), version, OpPayload::Edit(ops)));
            outcome.updated.push(field_id);
        }

        if !entries.is_empty() {
            self.op_log
                .save_raw_ops(ctx, &txn, table_id, IdPrefix::Field, entries)
                .await?;
        }
        txn.commit().await?;
        debug!(
            "Updated {} fields of {}, rejected {}",
            outcome.updated.len(),
            table_id,
            outcome.rejected.len()
        );
        Ok(outcome)
    }

    async fn apply_change<C>(
        &self,
        conn: &C,
        table: &table_meta::Model,
        current: &mut FieldInstance,
        active: &mut field::ActiveModel,
        change: FieldPropertyChange,
    ) -> Result<()>
    where
        C: ConnectionTrait,
    {
        match change {
            FieldPropertyChange::Name(name) => {
                active.name = Set(name.clone());
                current.name = name;
            }
            FieldPropertyChange::Description(description) => {
                active.description = Set(description);
            }
            FieldPropertyChange::Type(field_type) => {
                active.field_type = Set(field_type.as_str().to_string());
                current.field_type = field_type;
            }
            FieldPropertyChange::Options(options) => {
                active.options = Set(Some(serde_json::to_string(&options)?));
            }
            FieldPropertyChange::AiConfig(config) => {
                active.ai_config = Set(config.as_ref().map(serde_json::to_string).transpose()?);
            }
            FieldPropertyChange::LookupOptions(options) => {
                current.lookup_options = options;
                active.lookup_linked_field_id = Set(current.lookup_linked_field_id());
                active.lookup_options = Set(current
                    .lookup_options
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?);
            }
            FieldPropertyChange::NotNull(not_null) => {
                self.alter_not_null(conn, table, current, not_null).await?;
                active.not_null = Set(Some(not_null));
                current.not_null = not_null;
            }
            FieldPropertyChange::Unique(unique) => {
                self.alter_unique(conn, table, current, unique).await?;
                active.unique = Set(Some(unique));
                current.unique = unique;
            }
            FieldPropertyChange::IsPrimary(v) => active.is_primary = Set(v),
            FieldPropertyChange::IsComputed(v) => active.is_computed = Set(v),
            FieldPropertyChange::IsLookup(v) => {
                active.is_lookup = Set(v);
                current.is_lookup = v.unwrap_or(false);
            }
            FieldPropertyChange::IsPending(v) => active.is_pending = Set(v),
            FieldPropertyChange::HasError(v) => active.has_error = Set(v),
            FieldPropertyChange::DbFieldName(db_field_name) => {
                self.rename_db_field_name(conn, table, current, &db_field_name)
                    .await?;
                active.db_field_name = Set(db_field_name.clone());
                current.db_field_name = db_field_name;
            }
            FieldPropertyChange::DbFieldType(db_field_type) => {
                self.retype(conn, table, current, db_field_type).await?;
                active.db_field_type = Set(db_field_type.as_str().to_string());
                current.db_field_type = db_field_type;
            }
            FieldPropertyChange::CellValueType(v) => active.cell_value_type = Set(v),
            FieldPropertyChange::IsMultipleCellValue(v) => active.is_multiple_cell_value = Set(v),
        }
        Ok(())
    }

    /// Swap the lookup edges of a field, keeping the edges it has for other reasons
    async fn refresh_lookup_dependencies<C>(
        &self,
        conn: &C,
        field_id: &str,
        before: &[String],
        after: &[String],
    ) -> Result<()>
    where
        C: ConnectionTrait,
    {
        if before == after {
            return Ok(());
        }
        let mut depends_on: Vec<String> = self
            .references
            .dependencies(conn, field_id)
            .await?
            .into_iter()
            .filter(|id| !before.contains(id))
            .collect();
        for id in after {
            if !depends_on.contains(id) {
                depends_on.push(id.clone());
            }
        }
        self.references
            .set_dependencies(conn, field_id, &depends_on)
            .await
    }

    async fn check_field_name<C>(&self, conn: &C, table_id: &str, field_id: &str, name: &str) -> Result<()>
    where
        C: ConnectionTrait,
    {
        let existing = field::Entity::find()
            .filter(field::Column::TableId.eq(table_id))
            .filter(field::Column::Id.ne(field_id))
            .filter(field::Column::Name.eq(name))
            .filter(field::Column::DeletedTime.is_null())
            .one(conn)
            .await?;
        if existing.is_some() {
            return Err(GridError::Validation(format!(
                "Field name {} already exists in this table",
                name
            )));
        }
        Ok(())
    }

    async fn rename_db_field_name<C>(
        &self,
        conn: &C,
        table: &table_meta::Model,
        current: &FieldInstance,
        db_field_name: &str,
    ) -> Result<()>
    where
        C: ConnectionTrait,
    {
        let existing = field::Entity::find()
            .filter(field::Column::TableId.eq(table.id.as_str()))
            .filter(field::Column::DbFieldName.eq(db_field_name))
            .filter(field::Column::DeletedTime.is_null())
            .one(conn)
            .await?;
        if existing.is_some() {
            return Err(GridError::Validation(format!(
                "Db Field name {} already exists in this table",
                db_field_name
            )));
        }

        for sql in self
            .dialect
            .rename_column(&table.db_table_name, &current.db_field_name, db_field_name)
        {
            conn.execute_unprepared(&sql).await?;
        }
        Ok(())
    }

    /// Null the column, then change its storage type
    async fn retype<C>(
        &self,
        conn: &C,
        table: &table_meta::Model,
        current: &FieldInstance,
        db_field_type: DbFieldType,
    ) -> Result<()>
    where
        C: ConnectionTrait,
    {
        let mut sqls = vec![self
            .dialect
            .reset_column(&table.db_table_name, &current.db_field_name)];
        sqls.extend(self.dialect.modify_column_type(
            &table.db_table_name,
            &current.db_field_name,
            db_field_type.schema_type(),
        ));
        self.execute_translated(conn, sqls, &table.name, current).await
    }

    async fn alter_unique<C>(
        &self,
        conn: &C,
        table: &table_meta::Model,
        current: &FieldInstance,
        unique: bool,
    ) -> Result<()>
    where
        C: ConnectionTrait,
    {
        if !current.field_type.supports_unique(current.is_lookup) {
            return Err(GridError::Validation(format!(
                "Field type \"{}\" does not support field value unique validation",
                current.field_type
            )));
        }
        let existing = self
            .find_unique_indexes_for_field(conn, &table.db_table_name, &current.db_field_name, &current.id)
            .await?;
        let sqls = if unique {
            if !existing.is_empty() {
                return Ok(());
            }
            let index = field_unique_key_name(&table.db_table_name, &current.id);
            vec![self
                .dialect
                .create_unique_index(&table.db_table_name, &current.db_field_name, &index)]
        } else {
            existing
                .iter()
                .map(|index| self.dialect.drop_index(&table.db_table_name, index))
                .collect()
        };
        self.execute_translated(conn, sqls, &table.name, current).await
    }

    async fn alter_not_null<C>(
        &self,
        conn: &C,
        table: &table_meta::Model,
        current: &FieldInstance,
        not_null: bool,
    ) -> Result<()>
    where
        C: ConnectionTrait,
    {
        if !current.field_type.supports_validation(current.is_lookup) {
            return Err(GridError::Validation(format!(
                "Field type \"{}\" does not support field validation",
                current.field_type
            )));
        }
        let sqls = match self.dialect {
            Dialect::Sqlite => {
                self.rebuild_with_nullability(conn, &table.db_table_name, &current.db_field_name, not_null)
                    .await?
            }
            Dialect::Postgres | Dialect::MySql => self.dialect.set_not_null(
                &table.db_table_name,
                &current.db_field_name,
                current.db_field_type.schema_type(),
                not_null,
            )?,
        };
        self.execute_translated(conn, sqls, &table.name, current).await
    }

    /// SQLite table rebuild statements that flip the nullability of one column
    async fn rebuild_with_nullability<C>(
        &self,
        conn: &C,
        db_table_name: &str,
        db_field_name: &str,
        not_null: bool,
    ) -> Result<Vec<String>>
    where
        C: ConnectionTrait,
    {
        let rows = conn
            .query_all(self.dialect.table_columns_query(db_table_name))
            .await?;
        let mut columns = rows
            .iter()
            .map(|row| {
                Ok(TableColumn {
                    name: row.try_get("", "name")?,
                    sql_type: row.try_get("", "type")?,
                    not_null: row.try_get::<i64>("", "not_null")? != 0,
                    default: row.try_get("", "dflt_value")?,
                    primary_key: row.try_get("", "pk")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let column = columns
            .iter_mut()
            .find(|c| c.name == db_field_name)
            .ok_or_else(|| GridError::NotFound(format!("column {} in {}", db_field_name, db_table_name)))?;
        column.not_null = not_null;

        let index_sqls = conn
            .query_all(self.dialect.index_definitions_query(db_table_name))
            .await?
            .iter()
            .map(|row| row.try_get::<String>("", "sql").map_err(GridError::from))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.dialect.rebuild_table(db_table_name, &columns, &index_sqls))
    }

    /// Run DDL, reporting constraint violations against `field`
    async fn execute_translated<C>(
        &self,
        conn: &C,
        sqls: Vec<String>,
        table_name: &str,
        field: &FieldInstance,
    ) -> Result<()>
    where
        C: ConnectionTrait,
    {
        for sql in sqls {
            if let Err(err) = conn.execute_unprepared(&sql).await {
                return Err(match classify_violation(&err) {
                    Some(violation) => GridError::constraint(
                        violation,
                        table_name.to_string(),
                        vec![field.id.clone()],
                        vec![field.name.clone()],
                    ),
                    None => err.into(),
                });
            }
        }
        Ok(())
    }

    /// Names of the unique indexes backing a field's uniqueness constraint
    pub async fn find_unique_indexes_for_field<C>(
        &self,
        conn: &C,
        db_table_name: &str,
        db_field_name: &str,
        field_id: &str,
    ) -> Result<Vec<String>>
    where
        C: ConnectionTrait,
    {
        let rows = conn
            .query_all(self.dialect.table_indexes_query(db_table_name))
            .await?;
        let mut names = Vec::new();
        for row in rows {
            let name: String = row.try_get("", "name")?;
            if is_field_unique_index(&name, db_field_name, field_id) {
                names.push(name);
            }
        }
        Ok(names)
    }

    pub async fn resolve_pending<C>(
        &self,
        ctx: &mut RequestContext,
        conn: &C,
        table_id: &str,
        field_ids: &[String],
    ) -> Result<FieldUpdateOutcome>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let updates = field_ids
            .iter()
            .map(|id| {
                FieldUpdate::new(
                    id.clone(),
                    vec![OtOperation::set_field_property("isPending", JsonValue::Null, JsonValue::Bool(true))],
                )
            })
            .collect();
        self.batch_update_fields(ctx, conn, table_id, updates).await
    }

    pub async fn mark_error<C>(
        &self,
        ctx: &mut RequestContext,
        conn: &C,
        table_id: &str,
        field_ids: &[String],
        has_error: bool,
    ) -> Result<FieldUpdateOutcome>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let (new_value, old_value) = if has_error {
            (JsonValue::Bool(true), JsonValue::Null)
        } else {
            (JsonValue::Null, JsonValue::Bool(true))
        };
        let updates = field_ids
            .iter()
            .map(|id| {
                FieldUpdate::new(
                    id.clone(),
                    vec![OtOperation::set_field_property("hasError", new_value.clone(), old_value.clone())],
                )
            })
            .collect();
        self.batch_update_fields(ctx, conn, table_id, updates).await
    }

    /// Soft-delete fields: stamp `deleted_time`, drop their columns and flag live dependents.
    ///
    /// The Del ops purge the fields' op history; the metadata rows stay
    /// until [`FieldSchemaManager::purge_fields`].
    pub async fn batch_delete_fields<C>(
        &self,
        ctx: &mut RequestContext,
        conn: &C,
        table_id: &str,
        field_ids: &[String],
    ) -> Result<()>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        if field_ids.is_empty() {
            return Ok(());
        }
        let txn = conn.begin().await?;
        let table = self.tables.get_table(&txn, table_id).await?;
        let raws = field::Entity::find()
            .filter(field::Column::TableId.eq(table_id))
            .filter(field::Column::Id.is_in(field_ids.iter().cloned()))
            .filter(field::Column::DeletedTime.is_null())
            .all(&txn)
            .await?;
        if raws.len() != field_ids.len() {
            return Err(GridError::Validation("delete field not found".to_string()));
        }

        let entries = raws
            .iter()
            .map(|raw| OpEntry::new(raw.id.clone(), raw.version + 1, OpPayload::Del))
            .collect();
        self.op_log
            .save_raw_ops(ctx, &txn, table_id, IdPrefix::Field, entries)
            .await?;

        let now = Utc::now();
        for raw in raws {
            let indexes = self
                .find_unique_indexes_for_field(&txn, &table.db_table_name, &raw.db_field_name, &raw.id)
                .await?;
            for sql in self
                .dialect
                .drop_column(&table.db_table_name, &raw.db_field_name, &indexes)
            {
                txn.execute_unprepared(&sql).await?;
            }

            let version = raw.version + 1;
            let mut active = raw.into_active_model();
            active.deleted_time = Set(Some(now));
            active.last_modified_time = Set(Some(now));
            active.last_modified_by = Set(Some(ctx.actor_id().to_string()));
            active.version = Set(version);
            active.update(&txn).await?;
        }

        let deleted: HashSet<&String> = field_ids.iter().collect();
        let dependent_ids: Vec<String> = self
            .references
            .dependents(&txn, field_ids)
            .await?
            .into_iter()
            .map(|edge| edge.to_field_id)
            .filter(|id| !deleted.contains(id))
            .collect();
        if !dependent_ids.is_empty() {
            let dependents = field::Entity::find()
                .filter(field::Column::Id.is_in(dependent_ids))
                .filter(field::Column::DeletedTime.is_null())
                .all(&txn)
                .await?;
            let mut by_table: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for dependent in dependents.into_iter().filter(|f| f.has_error != Some(true)) {
                by_table.entry(dependent.table_id).or_default().push(dependent.id);
            }
            for (dependent_table, ids) in by_table {
                self.mark_error(ctx, &txn, &dependent_table, &ids, true).await?;
            }
        }

        txn.commit().await?;
        info!("Deleted {} fields from {}", field_ids.len(), table.db_table_name);
        Ok(())
    }

    /// Permanently remove soft-deleted fields with their references and op history.
    ///
    /// Ids that are already gone are ignored, so repeating a purge is a no-op.
    pub async fn purge_fields<C>(&self, conn: &C, table_id: &str, field_ids: &[String]) -> Result<u64>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        if field_ids.is_empty() {
            return Ok(0);
        }
        let txn = conn.begin().await?;
        let raws = field::Entity::find()
            .filter(field::Column::TableId.eq(table_id))
            .filter(field::Column::Id.is_in(field_ids.iter().cloned()))
            .all(&txn)
            .await?;
        if raws.is_empty() {
            return Ok(0);
        }
        if let Some(live) = raws.iter().find(|f| f.deleted_time.is_none()) {
            return Err(GridError::Validation(format!(
                "Field {} must be deleted before it is purged",
                live.id
            )));
        }

        let ids: Vec<String> = raws.iter().map(|f| f.id.clone()).collect();
        let purging: HashSet<&String> = ids.iter().collect();
        let dependent_ids: Vec<String> = self
            .references
            .dependents(&txn, &ids)
            .await?
            .into_iter()
            .map(|edge| edge.to_field_id)
            .filter(|id| !purging.contains(id))
            .collect();
        if !dependent_ids.is_empty() {
            let live = field::Entity::find()
                .filter(field::Column::Id.is_in(dependent_ids))
                .filter(field::Column::DeletedTime.is_null())
                .one(&txn)
                .await?;
            if let Some(dependent) = live {
                return Err(GridError::Validation(format!(
                    "Field {} is still referenced by field {}",
                    ids.join(", "),
                    dependent.id
                )));
            }
        }

        self.references.delete_for_fields(&txn, &ids).await?;
        self.op_log.purge(&txn, table_id, &ids).await?;
        let result = field::Entity::delete_many()
            .filter(field::Column::Id.is_in(ids))
            .exec(&txn)
            .await?;
        txn.commit().await?;
        info!("Purged {} fields of {}", result.rows_affected, table_id);
        Ok(result.rows_affected)
    }

    pub async fn get_field<C>(&self, conn: &C, table_id: &str, field_id: &str) -> Result<FieldInstance>
    where
        C: ConnectionTrait,
    {
        let raw = field::Entity::find_by_id(field_id.to_string())
            .filter(field::Column::TableId.eq(table_id))
            .filter(field::Column::DeletedTime.is_null())
            .one(conn)
            .await?
            .ok_or_else(|| GridError::NotFound(format!("field {} in table {}", field_id, table_id)))?;
        FieldInstance::try_from(&raw)
    }

    /// Live fields of a table, primary field first, then by order
    pub async fn get_fields<C>(&self, conn: &C, table_id: &str) -> Result<Vec<FieldInstance>>
    where
        C: ConnectionTrait,
    {
        let raws = field::Entity::find()
            .filter(field::Column::TableId.eq(table_id))
            .filter(field::Column::DeletedTime.is_null())
            .order_by_asc(field::Column::Order)
            .order_by_asc(field::Column::CreatedTime)
            .all(conn)
            .await?;
        let mut fields = raws
            .iter()
            .map(FieldInstance::try_from)
            .collect::<Result<Vec<_>>>()?;
        fields.sort_by_key(|f| !f.is_primary);
        Ok(fields)
    }

    /// Snapshots of fields (deleted ones included) in the order of `ids`
    pub async fn get_snapshot_bulk<C>(&self, conn: &C, table_id: &str, ids: &[String]) -> Result<Vec<FieldSnapshot>>
    where
        C: ConnectionTrait,
    {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let raws = field::Entity::find()
            .filter(field::Column::TableId.eq(table_id))
            .filter(field::Column::Id.is_in(ids.iter().cloned()))
            .all(conn)
            .await?;
        let position: HashMap<&str, usize> =
            ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();

        let mut snapshots = raws
            .iter()
            .map(|raw| {
                Ok(FieldSnapshot {
                    id: raw.id.clone(),
                    v: raw.version,
                    kind: "json0",
                    data: FieldInstance::try_from(raw)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        snapshots.sort_by_key(|s| position.get(s.id.as_str()).copied().unwrap_or(usize::MAX));
        Ok(snapshots)
    }
}

fn to_active_model(field: &FieldInstance, actor_id: &str) -> field::ActiveModel {
    let flag = |v: bool| Set(v.then_some(true));
    field::ActiveModel {
        id: Set(field.id.clone()),
        table_id: Set(field.table_id.clone()),
        name: Set(field.name.clone()),
        description: Set(field.description.clone()),
        field_type: Set(field.field_type.as_str().to_string()),
        options: Set(Some(field.options.to_string())),
        ai_config: Set(field.ai_config.as_ref().map(JsonValue::to_string)),
        lookup_options: Set(field.lookup_options.as_ref().map(JsonValue::to_string)),
        lookup_linked_field_id: Set(field.lookup_linked_field_id()),
        not_null: flag(field.not_null),
        unique: flag(field.unique),
        is_primary: flag(field.is_primary),
        is_computed: flag(field.is_computed),
        is_lookup: flag(field.is_lookup),
        is_pending: flag(field.is_pending),
        has_error: flag(field.has_error),
        db_field_name: Set(field.db_field_name.clone()),
        db_field_type: Set(field.db_field_type.as_str().to_string()),
        cell_value_type: Set(field.cell_value_type.clone()),
        is_multiple_cell_value: flag(field.is_multiple_cell_value),
        order: Set(field.order),
        version: Set(field.version),
        created_time: Set(Utc::now()),
        created_by: Set(actor_id.to_string()),
        last_modified_time: Set(None),
        last_modified_by: Set(None),
        deleted_time: Set(None),
    }
}
