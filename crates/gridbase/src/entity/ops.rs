//! ops entity
//! Append-only operation history per collection and document

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "ops")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub collection: String,  // table id the document lives in
    pub doc_type: String,  // id prefix of the document kind, e.g. "rec" or "fld"
    pub doc_id: String,
    pub version: i64,
    #[sea_orm(column_type = "Text")]
    pub operation: String,  // serialized raw op
    pub created_time: DateTimeUtc,
    pub created_by: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
