//! Logical table provisioning

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use tracing::info;

use crate::context::RequestContext;
use crate::dialect::Dialect;
use crate::entity::table_meta;
use crate::error::{GridError, Result};
use crate::ops::IdPrefix;

#[derive(Debug, Clone, Copy)]
pub struct TableManager {
    dialect: Dialect,
}

impl TableManager {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    /// Register a table and create its physical table with the system columns
    pub async fn create_table<C>(
        &self,
        ctx: &RequestContext,
        conn: &C,
        name: &str,
        db_table_name: &str,
    ) -> Result<table_meta::Model>
    where
        C: ConnectionTrait,
    {
        let taken = table_meta::Entity::find()
            .filter(table_meta::Column::DbTableName.eq(db_table_name))
            .one(conn)
            .await?;
        if taken.is_some() {
            return Err(GridError::Validation(format!(
                "Db table name {} already exists",
                db_table_name
            )));
        }

        let last = table_meta::Entity::find()
            .filter(table_meta::Column::DeletedTime.is_null())
            .order_by_desc(table_meta::Column::Order)
            .limit(1)
            .one(conn)
            .await?;
        let order = last.map(|t| t.order + 1.0).unwrap_or(0.0);

        let table = table_meta::ActiveModel {
            id: Set(IdPrefix::Table.generate()),
            name: Set(name.to_string()),
            db_table_name: Set(db_table_name.to_string()),
            version: Set(0),
            order: Set(order),
            created_time: Set(Utc::now()),
            created_by: Set(ctx.actor_id().to_string()),
            last_modified_time: Set(None),
            last_modified_by: Set(None),
            deleted_time: Set(None),
        }
        .insert(conn)
        .await?;

        for sql in self.dialect.create_physical_table(db_table_name) {
            conn.execute_unprepared(&sql).await?;
        }
        info!("Created table {} ({}) as {}", table.name, table.id, db_table_name);
        Ok(table)
    }

    /// Live table by id
    pub async fn get_table<C>(&self, conn: &C, table_id: &str) -> Result<table_meta::Model>
    where
        C: ConnectionTrait,
    {
        table_meta::Entity::find_by_id(table_id.to_string())
            .filter(table_meta::Column::DeletedTime.is_null())
            .one(conn)
            .await?
            .ok_or_else(|| GridError::NotFound(format!("table {}", table_id)))
    }

    pub async fn get_db_table_name<C>(&self, conn: &C, table_id: &str) -> Result<String>
    where
        C: ConnectionTrait,
    {
        Ok(self.get_table(conn, table_id).await?.db_table_name)
    }
}
