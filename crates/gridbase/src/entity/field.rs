//! field entity
//! Logical column definitions mapped onto physical columns

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "field")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub table_id: String,
    pub name: String,
    #[sea_orm(column_type = "Text", nullable)]
    pub description: Option<String>,
    #[sea_orm(column_name = "type")]
    pub field_type: String,
    #[sea_orm(column_type = "Text", nullable)]
    pub options: Option<String>,  // JSON blob
    #[sea_orm(column_type = "Text", nullable)]
    pub ai_config: Option<String>,  // JSON blob
    #[sea_orm(column_type = "Text", nullable)]
    pub lookup_options: Option<String>,  // JSON blob
    pub lookup_linked_field_id: Option<String>,
    pub not_null: Option<bool>,
    pub unique: Option<bool>,
    pub is_primary: Option<bool>,
    pub is_computed: Option<bool>,
    pub is_lookup: Option<bool>,
    pub is_pending: Option<bool>,
    pub has_error: Option<bool>,
    pub db_field_name: String,
    pub db_field_type: String,
    pub cell_value_type: String,
    pub is_multiple_cell_value: Option<bool>,
    pub order: f64,
    pub version: i64,
    pub created_time: DateTimeUtc,
    pub created_by: String,
    pub last_modified_time: Option<DateTimeUtc>,
    pub last_modified_by: Option<String>,
    pub deleted_time: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::table_meta::Entity",
        from = "Column::TableId",
        to = "super::table_meta::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    TableMeta,
}

impl Related<super::table_meta::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TableMeta.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
