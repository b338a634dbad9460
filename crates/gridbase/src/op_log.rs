//! Append-only operation log

use chrono::Utc;
use sea_orm::{
    ActiveValue::NotSet, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

use crate::context::RequestContext;
use crate::entity::ops;
use crate::error::{GridError, Result};
use crate::ops::{CreateData, IdPrefix, OtOperation, RawOp, RawOpMap, RawOpMeta};

/// What happened to a document
#[derive(Debug, Clone, PartialEq)]
pub enum OpPayload {
    /// Initial snapshot of a new document
    Create(Value),
    /// Document removed; its history is purged
    Del,
    /// Ordered edits applied to the document
    Edit(Vec<OtOperation>),
}

/// One document entry handed to [`OpLog::save_raw_ops`]
#[derive(Debug, Clone, PartialEq)]
pub struct OpEntry {
    pub doc_id: String,
    pub version: i64,
    pub payload: OpPayload,
}

impl OpEntry {
    pub fn new(doc_id: impl Into<String>, version: i64, payload: OpPayload) -> Self {
        Self {
            doc_id: doc_id.into(),
            version,
            payload,
        }
    }
}

/// Writer and reader of the `ops` table
#[derive(Debug, Clone, Copy, Default)]
pub struct OpLog;

impl OpLog {
    pub fn new() -> Self {
        Self
    }

    /// Record one op per entry and hand the resulting map to the request context.
    ///
    /// Deletions are not stored: they remove the accumulated history of the
    /// document instead. Everything else is appended.
    pub async fn save_raw_ops<C>(
        &self,
        ctx: &mut RequestContext,
        conn: &C,
        collection_id: &str,
        doc_type: IdPrefix,
        entries: Vec<OpEntry>,
    ) -> Result<RawOpMap>
    where
        C: ConnectionTrait,
    {
        let start = Instant::now();
        let collection = format!("{}_{}", doc_type, collection_id);
        let meta = RawOpMeta {
            ts: Utc::now().timestamp_millis(),
        };
        debug!("saveOp: {}-{}", ctx.request_id(), collection);

        let mut docs = HashMap::with_capacity(entries.len());
        let mut deleted_ids = Vec::new();
        let mut inserts = Vec::new();
        let now = Utc::now();

        for entry in entries {
            let mut raw = RawOp {
                src: ctx.request_id().to_string(),
                seq: 1,
                m: meta.clone(),
                v: entry.version,
                create: None,
                del: None,
                op: None,
            };
            match entry.payload {
                OpPayload::Create(data) => {
                    raw.create = Some(CreateData {
                        kind: "json0".to_string(),
                        data,
                    })
                }
                OpPayload::Del => raw.del = Some(true),
                OpPayload::Edit(edits) => raw.op = Some(edits),
            }

            if raw.is_del() {
                deleted_ids.push(entry.doc_id.clone());
            } else {
                inserts.push(ops::ActiveModel {
                    id: NotSet,
                    collection: Set(collection_id.to_string()),
                    doc_type: Set(doc_type.as_str().to_string()),
                    doc_id: Set(entry.doc_id.clone()),
                    version: Set(entry.version),
                    operation: Set(serde_json::to_string(&raw)?),
                    created_time: Set(now),
                    created_by: Set(ctx.actor_id().to_string()),
                });
            }
            docs.insert(entry.doc_id, raw);
        }

        if !deleted_ids.is_empty() {
            let purged = ops::Entity::delete_many()
                .filter(ops::Column::Collection.eq(collection_id))
                .filter(ops::Column::DocId.is_in(deleted_ids))
                .exec(conn)
                .await?;
            debug!("Purged {} ops of deleted documents in {}", purged.rows_affected, collection);
        }

        if !inserts.is_empty() {
            let count = inserts.len();
            ops::Entity::insert_many(inserts).exec(conn).await?;
            debug!(
                "Inserted {} ops into {} in {}ms",
                count,
                collection,
                start.elapsed().as_millis()
            );
        }

        let mut map = RawOpMap::new();
        map.insert(collection, docs);
        ctx.push_raw_op_map(map.clone());
        Ok(map)
    }

    /// Stored history of one document in version order
    pub async fn get_ops<C>(&self, conn: &C, collection_id: &str, doc_id: &str) -> Result<Vec<RawOp>>
    where
        C: ConnectionTrait,
    {
        let rows = ops::Entity::find()
            .filter(ops::Column::Collection.eq(collection_id))
            .filter(ops::Column::DocId.eq(doc_id))
            .order_by_asc(ops::Column::Version)
            .all(conn)
            .await?;

        rows.iter()
            .map(|row| serde_json::from_str::<RawOp>(&row.operation).map_err(GridError::from))
            .collect()
    }

    /// Version of the last stored op of a document
    pub async fn latest_version<C>(
        &self,
        conn: &C,
        collection_id: &str,
        doc_id: &str,
    ) -> Result<Option<i64>>
    where
        C: ConnectionTrait,
    {
        let latest = ops::Entity::find()
            .filter(ops::Column::Collection.eq(collection_id))
            .filter(ops::Column::DocId.eq(doc_id))
            .order_by_desc(ops::Column::Version)
            .one(conn)
            .await?;

        Ok(latest.map(|m| m.version))
    }

    /// Drop the stored history of documents regardless of their kind
    pub async fn purge<C>(&self, conn: &C, collection_id: &str, doc_ids: &[String]) -> Result<u64>
    where
        C: ConnectionTrait,
    {
        if doc_ids.is_empty() {
            return Ok(0);
        }
        let result = ops::Entity::delete_many()
            .filter(ops::Column::Collection.eq(collection_id))
            .filter(ops::Column::DocId.is_in(doc_ids.iter().cloned()))
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }
}
