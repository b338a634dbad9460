//! Field types and the in-memory field snapshot

use sea_orm::Value;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

use crate::dialect::Dialect;
use crate::entity::field;
use crate::error::{GridError, Result};
use crate::ops::IdPrefix;
use crate::schema::DbFieldType;

/// Logical field type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    SingleLineText,
    LongText,
    User,
    Attachment,
    Checkbox,
    MultipleSelect,
    SingleSelect,
    Date,
    Number,
    Duration,
    Rating,
    Formula,
    Rollup,
    Link,
    CreatedTime,
    LastModifiedTime,
    CreatedBy,
    LastModifiedBy,
    AutoNumber,
    Button,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::SingleLineText => "singleLineText",
            FieldType::LongText => "longText",
            FieldType::User => "user",
            FieldType::Attachment => "attachment",
            FieldType::Checkbox => "checkbox",
            FieldType::MultipleSelect => "multipleSelect",
            FieldType::SingleSelect => "singleSelect",
            FieldType::Date => "date",
            FieldType::Number => "number",
            FieldType::Duration => "duration",
            FieldType::Rating => "rating",
            FieldType::Formula => "formula",
            FieldType::Rollup => "rollup",
            FieldType::Link => "link",
            FieldType::CreatedTime => "createdTime",
            FieldType::LastModifiedTime => "lastModifiedTime",
            FieldType::CreatedBy => "createdBy",
            FieldType::LastModifiedBy => "lastModifiedBy",
            FieldType::AutoNumber => "autoNumber",
            FieldType::Button => "button",
        }
    }

    /// Values of these types are derived from other fields or from system columns
    pub fn is_computed(&self) -> bool {
        matches!(
            self,
            FieldType::Formula
                | FieldType::Rollup
                | FieldType::CreatedTime
                | FieldType::LastModifiedTime
                | FieldType::CreatedBy
                | FieldType::LastModifiedBy
                | FieldType::AutoNumber
        )
    }

    /// Whether a not-null or unique constraint can be declared on the type at all
    pub fn supports_validation(&self, is_lookup: bool) -> bool {
        !is_lookup && !self.is_computed() && *self != FieldType::Button
    }

    pub fn supports_unique(&self, is_lookup: bool) -> bool {
        self.supports_validation(is_lookup)
            && !matches!(
                self,
                FieldType::Checkbox
                    | FieldType::Attachment
                    | FieldType::MultipleSelect
                    | FieldType::Link
            )
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(JsonValue::String(s.to_string()))
            .map_err(|_| GridError::Validation(format!("unknown field type {}", s)))
    }
}

/// Snapshot of a field as published in ops and returned by reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldInstance {
    pub id: String,
    pub table_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub options: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_config: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_options: Option<JsonValue>,
    #[serde(default)]
    pub not_null: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub is_computed: bool,
    #[serde(default)]
    pub is_lookup: bool,
    #[serde(default)]
    pub is_pending: bool,
    #[serde(default)]
    pub has_error: bool,
    pub db_field_name: String,
    pub db_field_type: DbFieldType,
    pub cell_value_type: String,
    #[serde(default)]
    pub is_multiple_cell_value: bool,
    #[serde(default)]
    pub order: f64,
    #[serde(default)]
    pub version: i64,
}

impl FieldInstance {
    /// A fresh field with a generated id; the physical column name is
    /// assigned on creation when left empty.
    pub fn new(name: impl Into<String>, field_type: FieldType, db_field_type: DbFieldType) -> Self {
        Self {
            id: IdPrefix::Field.generate(),
            table_id: String::new(),
            name: name.into(),
            description: None,
            field_type,
            options: JsonValue::Object(Default::default()),
            ai_config: None,
            lookup_options: None,
            not_null: false,
            unique: false,
            is_primary: false,
            is_computed: field_type.is_computed(),
            is_lookup: false,
            is_pending: false,
            has_error: false,
            db_field_name: String::new(),
            db_field_type,
            cell_value_type: default_cell_value_type(db_field_type).to_string(),
            is_multiple_cell_value: db_field_type == DbFieldType::Json,
            order: 0.0,
            version: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_db_field_name(mut self, db_field_name: impl Into<String>) -> Self {
        self.db_field_name = db_field_name.into();
        self
    }

    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn with_not_null(mut self, not_null: bool) -> Self {
        self.not_null = not_null;
        self
    }

    /// Mark the field as a lookup configured by `lookup_options`
    pub fn with_lookup_options(mut self, lookup_options: JsonValue) -> Self {
        self.is_lookup = true;
        self.lookup_options = Some(lookup_options);
        self
    }

    /// Fields a lookup reads from: its link field and the looked-up field
    pub fn lookup_dependencies(&self) -> Vec<String> {
        if !self.is_lookup {
            return Vec::new();
        }
        let mut ids: Vec<String> = Vec::new();
        for key in ["linkFieldId", "lookupFieldId"] {
            let id = self
                .lookup_options
                .as_ref()
                .and_then(|o| o.get(key))
                .and_then(JsonValue::as_str);
            if let Some(id) = id {
                if !ids.iter().any(|existing| existing == id) {
                    ids.push(id.to_string());
                }
            }
        }
        ids
    }

    /// Id of the link field a lookup reads through, if any
    pub fn lookup_linked_field_id(&self) -> Option<String> {
        self.lookup_options
            .as_ref()
            .and_then(|o| o.get("linkFieldId"))
            .and_then(JsonValue::as_str)
            .map(str::to_string)
    }

    /// Bind value for `cell` in this field's physical column.
    ///
    /// JSON null maps to a typed SQL null so PostgreSQL can infer the
    /// parameter type in staging inserts.
    pub fn convert_cell_value(&self, dialect: Dialect, cell: &JsonValue) -> Result<Value> {
        let converted = match (self.db_field_type, cell) {
            (db_type, JsonValue::Null) => typed_null(db_type),
            (DbFieldType::Json, value) => match dialect {
                Dialect::Postgres => Value::from(value.clone()),
                Dialect::MySql | Dialect::Sqlite => Value::from(serde_json::to_string(value)?),
            },
            (DbFieldType::Text, JsonValue::String(s)) => Value::from(s.clone()),
            (DbFieldType::Text, JsonValue::Number(n)) => Value::from(n.to_string()),
            (DbFieldType::Text, JsonValue::Bool(b)) => Value::from(b.to_string()),
            (DbFieldType::Integer, JsonValue::Number(n)) => match n.as_i64() {
                Some(i) => Value::BigInt(Some(i)),
                None => match n.as_f64() {
                    // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive
                    Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                        Value::BigInt(Some(f as i64))
                    }
                    _ => return Err(self.unconvertible(cell)),
                },
            },
            (DbFieldType::Integer, JsonValue::Bool(b)) => Value::BigInt(Some(i64::from(*b))),
            (DbFieldType::Real, JsonValue::Number(n)) => match n.as_f64() {
                Some(f) => Value::Double(Some(f)),
                None => return Err(self.unconvertible(cell)),
            },
            (DbFieldType::Boolean, JsonValue::Bool(b)) => Value::Bool(Some(*b)),
            (DbFieldType::DateTime, JsonValue::String(s)) => {
                let parsed = chrono::DateTime::parse_from_rfc3339(s)
                    .map_err(|_| self.unconvertible(cell))?;
                Value::from(parsed.with_timezone(&chrono::Utc))
            }
            (DbFieldType::Blob, JsonValue::String(s)) => Value::from(s.as_bytes().to_vec()),
            _ => return Err(self.unconvertible(cell)),
        };
        Ok(converted)
    }

    fn unconvertible(&self, cell: &JsonValue) -> GridError {
        GridError::Validation(format!(
            "Value {} cannot be stored in field {} ({})",
            cell, self.name, self.db_field_type
        ))
    }
}

fn typed_null(db_field_type: DbFieldType) -> Value {
    match db_field_type {
        DbFieldType::Text => Value::String(None),
        DbFieldType::Integer => Value::BigInt(None),
        DbFieldType::Real => Value::Double(None),
        DbFieldType::Boolean => Value::Bool(None),
        DbFieldType::DateTime => Value::ChronoDateTimeUtc(None),
        DbFieldType::Json => Value::Json(None),
        DbFieldType::Blob => Value::Bytes(None),
    }
}

fn default_cell_value_type(db_field_type: DbFieldType) -> &'static str {
    match db_field_type {
        DbFieldType::Integer | DbFieldType::Real => "number",
        DbFieldType::Boolean => "boolean",
        DbFieldType::DateTime => "dateTime",
        DbFieldType::Text | DbFieldType::Json | DbFieldType::Blob => "string",
    }
}

fn parse_json_blob(blob: Option<&str>) -> Result<Option<JsonValue>> {
    blob.map(serde_json::from_str).transpose().map_err(GridError::from)
}

impl TryFrom<&field::Model> for FieldInstance {
    type Error = GridError;

    fn try_from(raw: &field::Model) -> Result<Self> {
        Ok(Self {
            id: raw.id.clone(),
            table_id: raw.table_id.clone(),
            name: raw.name.clone(),
            description: raw.description.clone(),
            field_type: raw.field_type.parse()?,
            options: parse_json_blob(raw.options.as_deref())?.unwrap_or(JsonValue::Null),
            ai_config: parse_json_blob(raw.ai_config.as_deref())?,
            lookup_options: parse_json_blob(raw.lookup_options.as_deref())?,
            not_null: raw.not_null.unwrap_or(false),
            unique: raw.unique.unwrap_or(false),
            is_primary: raw.is_primary.unwrap_or(false),
            is_computed: raw.is_computed.unwrap_or(false),
            is_lookup: raw.is_lookup.unwrap_or(false),
            is_pending: raw.is_pending.unwrap_or(false),
            has_error: raw.has_error.unwrap_or(false),
            db_field_name: raw.db_field_name.clone(),
            db_field_type: raw.db_field_type.parse()?,
            cell_value_type: raw.cell_value_type.clone(),
            is_multiple_cell_value: raw.is_multiple_cell_value.unwrap_or(false),
            order: raw.order,
            version: raw.version,
        })
    }
}

/// A field to create together with the fields it is computed from
#[derive(Debug, Clone, PartialEq)]
pub struct NewField {
    pub field: FieldInstance,
    pub depends_on: Vec<String>,
}

impl From<FieldInstance> for NewField {
    fn from(field: FieldInstance) -> Self {
        Self {
            field,
            depends_on: Vec::new(),
        }
    }
}

impl NewField {
    pub fn depending_on(field: FieldInstance, depends_on: Vec<String>) -> Self {
        Self { field, depends_on }
    }
}
