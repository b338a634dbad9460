//! Logical-to-physical schema mapping for field columns

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::GridError;

/// Maximum identifier length honoured by every supported engine
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Maximum length of a generated physical column name
pub const MAX_DB_FIELD_NAME_LENGTH: usize = 40;

/// Physical storage kind declared on a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DbFieldType {
    Text,
    Integer,
    DateTime,
    Real,
    Blob,
    Json,
    Boolean,
}

impl DbFieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbFieldType::Text => "TEXT",
            DbFieldType::Integer => "INTEGER",
            DbFieldType::DateTime => "DATETIME",
            DbFieldType::Real => "REAL",
            DbFieldType::Blob => "BLOB",
            DbFieldType::Json => "JSON",
            DbFieldType::Boolean => "BOOLEAN",
        }
    }

    /// Column kind used when rendering DDL for this storage type
    pub fn schema_type(&self) -> SchemaType {
        match self {
            DbFieldType::Text => SchemaType::Text,
            DbFieldType::Integer => SchemaType::Integer,
            DbFieldType::DateTime => SchemaType::Datetime,
            DbFieldType::Real => SchemaType::Double,
            DbFieldType::Blob => SchemaType::Binary,
            DbFieldType::Json => SchemaType::Json,
            DbFieldType::Boolean => SchemaType::Boolean,
        }
    }
}

impl fmt::Display for DbFieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbFieldType {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TEXT" => Ok(DbFieldType::Text),
            "INTEGER" => Ok(DbFieldType::Integer),
            "DATETIME" => Ok(DbFieldType::DateTime),
            "REAL" => Ok(DbFieldType::Real),
            "BLOB" => Ok(DbFieldType::Blob),
            "JSON" => Ok(DbFieldType::Json),
            "BOOLEAN" => Ok(DbFieldType::Boolean),
            other => Err(GridError::Validation(format!(
                "unknown db field type {}",
                other
            ))),
        }
    }
}

/// Dialect-neutral column kind, rendered to a concrete SQL type by [`crate::dialect::Dialect`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaType {
    String,
    Text,
    Integer,
    Double,
    Datetime,
    Boolean,
    Json,
    Binary,
}

/// Split `schema.table` into its parts; names without a dot have no schema
pub fn split_table_name(db_table_name: &str) -> (Option<&str>, &str) {
    match db_table_name.split_once('.') {
        Some((schema, table)) => (Some(schema), table),
        None => (None, db_table_name),
    }
}

/// Name of the unique index backing a field's uniqueness constraint.
///
/// The suffix carries the field id so the index can be found again after a
/// column rename; the prefix is truncated to keep the whole name within
/// [`MAX_IDENTIFIER_LENGTH`].
pub fn field_unique_key_name(db_table_name: &str, field_id: &str) -> String {
    let (schema, table) = split_table_name(db_table_name);
    let suffix = format!("___{}_unique", field_id).to_lowercase();
    let prefix = match schema {
        Some(schema) => format!("{}_{}", schema, table),
        None => table.to_string(),
    };
    let budget = MAX_IDENTIFIER_LENGTH.saturating_sub(suffix.len());
    let prefix: String = prefix.chars().take(budget).collect();
    format!("{}{}", prefix.to_lowercase(), suffix)
}

/// Whether an index name belongs to the uniqueness constraint of a field
pub fn is_field_unique_index(index_name: &str, db_field_name: &str, field_id: &str) -> bool {
    index_name.contains(&format!("{}_unique", db_field_name.to_lowercase()))
        || index_name.contains(&format!("{}_unique", field_id.to_lowercase()))
}

/// Turn a display name into a usable physical column name
pub fn sanitize_db_field_name(name: &str) -> String {
    let mut out: String = name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    if out.is_empty() || out.chars().all(|c| c == '_') {
        out = "unnamed".to_string();
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, 't');
    }
    // system columns own the double underscore prefix
    if out.starts_with("__") {
        out = out.trim_start_matches('_').to_string();
    }
    out.chars().take(MAX_DB_FIELD_NAME_LENGTH).collect()
}
