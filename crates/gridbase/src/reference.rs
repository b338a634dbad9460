//! Dependency edges between fields

use chrono::Utc;
use sea_orm::{
    ActiveValue::NotSet, ColumnTrait, Condition, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use std::collections::BTreeSet;
use tracing::debug;

use crate::entity::reference;
use crate::error::Result;

/// Reader and writer of the `reference` table.
///
/// An edge `from -> to` means the field `to` is computed from `from`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceGraph;

impl ReferenceGraph {
    pub fn new() -> Self {
        Self
    }

    /// Replace every incoming edge of `to_field_id`
    pub async fn set_dependencies<C>(
        &self,
        conn: &C,
        to_field_id: &str,
        from_field_ids: &[String],
    ) -> Result<()>
    where
        C: ConnectionTrait,
    {
        reference::Entity::delete_many()
            .filter(reference::Column::ToFieldId.eq(to_field_id))
            .exec(conn)
            .await?;

        let unique: BTreeSet<&String> = from_field_ids.iter().collect();
        if unique.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let edges = unique.into_iter().map(|from| reference::ActiveModel {
            id: NotSet,
            from_field_id: Set(from.clone()),
            to_field_id: Set(to_field_id.to_string()),
            created_time: Set(now),
        });
        reference::Entity::insert_many(edges).exec(conn).await?;
        debug!("Field {} now depends on {} fields", to_field_id, from_field_ids.len());
        Ok(())
    }

    /// Fields `to_field_id` is computed from
    pub async fn dependencies<C>(&self, conn: &C, to_field_id: &str) -> Result<Vec<String>>
    where
        C: ConnectionTrait,
    {
        let edges = reference::Entity::find()
            .filter(reference::Column::ToFieldId.eq(to_field_id))
            .order_by_asc(reference::Column::Id)
            .all(conn)
            .await?;
        Ok(edges.into_iter().map(|e| e.from_field_id).collect())
    }

    /// Edges leaving any of `from_field_ids`
    pub async fn dependents<C>(&self, conn: &C, from_field_ids: &[String]) -> Result<Vec<reference::Model>>
    where
        C: ConnectionTrait,
    {
        if from_field_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(reference::Entity::find()
            .filter(reference::Column::FromFieldId.is_in(from_field_ids.iter().cloned()))
            .order_by_asc(reference::Column::Id)
            .all(conn)
            .await?)
    }

    /// Remove every edge touching the given fields
    pub async fn delete_for_fields<C>(&self, conn: &C, field_ids: &[String]) -> Result<u64>
    where
        C: ConnectionTrait,
    {
        if field_ids.is_empty() {
            return Ok(0);
        }
        let result = reference::Entity::delete_many()
            .filter(
                Condition::any()
                    .add(reference::Column::FromFieldId.is_in(field_ids.iter().cloned()))
                    .add(reference::Column::ToFieldId.is_in(field_ids.iter().cloned())),
            )
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }
}
