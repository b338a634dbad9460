//! Operation model: json0 edits, raw ops and the pending ops map

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{GridError, Result};
use crate::field::FieldType;
use crate::schema::DbFieldType;

/// One segment of a json0 path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Key(String),
    Index(u64),
}

impl PathSegment {
    pub fn as_key(&self) -> Option<&str> {
        match self {
            PathSegment::Key(k) => Some(k),
            PathSegment::Index(_) => None,
        }
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

/// A json0 object-replace operation (`p`, `oi`, `od`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtOperation {
    pub p: Vec<PathSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oi: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub od: Option<Value>,
}

/// A recognised record cell edit
#[derive(Debug, Clone, PartialEq)]
pub struct SetRecordContext<'a> {
    pub field_id: &'a str,
    pub new_cell_value: &'a Value,
    pub old_cell_value: Option<&'a Value>,
}

impl OtOperation {
    fn replace(path: Vec<PathSegment>, new_value: Value, old_value: Value) -> Self {
        Self {
            p: path,
            oi: Some(new_value).filter(|v| !v.is_null()),
            od: Some(old_value).filter(|v| !v.is_null()),
        }
    }

    /// Cell edit on a record: `["fields", field_id]`
    pub fn set_record(field_id: &str, new_cell_value: Value, old_cell_value: Value) -> Self {
        Self::replace(
            vec!["fields".into(), field_id.into()],
            new_cell_value,
            old_cell_value,
        )
    }

    /// Property edit on a field: `[key]`
    pub fn set_field_property(key: &str, new_value: Value, old_value: Value) -> Self {
        Self::replace(vec![key.into()], new_value, old_value)
    }

    /// Recognise a record cell edit; `None` when the op has another shape
    pub fn detect_set_record(&self) -> Option<SetRecordContext<'_>> {
        match self.p.as_slice() {
            [PathSegment::Key(root), PathSegment::Key(field_id)] if root == "fields" => {
                Some(SetRecordContext {
                    field_id,
                    new_cell_value: self.oi.as_ref().unwrap_or(&Value::Null),
                    old_cell_value: self.od.as_ref(),
                })
            }
            _ => None,
        }
    }
}

impl fmt::Display for OtOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

/// Closed set of field property edits
#[derive(Debug, Clone, PartialEq)]
pub enum FieldPropertyChange {
    Name(String),
    Description(Option<String>),
    Type(FieldType),
    Options(Value),
    AiConfig(Option<Value>),
    LookupOptions(Option<Value>),
    NotNull(bool),
    Unique(bool),
    IsPrimary(Option<bool>),
    IsComputed(Option<bool>),
    IsLookup(Option<bool>),
    IsPending(Option<bool>),
    HasError(Option<bool>),
    DbFieldName(String),
    DbFieldType(DbFieldType),
    CellValueType(String),
    IsMultipleCellValue(Option<bool>),
}

impl FieldPropertyChange {
    pub fn key(&self) -> &'static str {
        match self {
            FieldPropertyChange::Name(_) => "name",
            FieldPropertyChange::Description(_) => "description",
            FieldPropertyChange::Type(_) => "type",
            FieldPropertyChange::Options(_) => "options",
            FieldPropertyChange::AiConfig(_) => "aiConfig",
            FieldPropertyChange::LookupOptions(_) => "lookupOptions",
            FieldPropertyChange::NotNull(_) => "notNull",
            FieldPropertyChange::Unique(_) => "unique",
            FieldPropertyChange::IsPrimary(_) => "isPrimary",
            FieldPropertyChange::IsComputed(_) => "isComputed",
            FieldPropertyChange::IsLookup(_) => "isLookup",
            FieldPropertyChange::IsPending(_) => "isPending",
            FieldPropertyChange::HasError(_) => "hasError",
            FieldPropertyChange::DbFieldName(_) => "dbFieldName",
            FieldPropertyChange::DbFieldType(_) => "dbFieldType",
            FieldPropertyChange::CellValueType(_) => "cellValueType",
            FieldPropertyChange::IsMultipleCellValue(_) => "isMultipleCellValue",
        }
    }

    /// Parse a `[key]` property edit into its typed form
    pub fn from_op(op: &OtOperation) -> Result<Self> {
        let key = match op.p.as_slice() {
            [PathSegment::Key(key)] => key.as_str(),
            _ => {
                return Err(GridError::IllegalOperation(format!(
                    "unknown field editing op {}",
                    op
                )))
            }
        };
        let value = op.oi.clone().unwrap_or(Value::Null);

        let change = match key {
            "name" => FieldPropertyChange::Name(required_string(key, value)?),
            "description" => FieldPropertyChange::Description(optional_string(key, value)?),
            "type" => FieldPropertyChange::Type(required_string(key, value)?.parse()?),
            "options" => {
                if value.is_null() {
                    return Err(GridError::IllegalOperation(
                        "field options is required".to_string(),
                    ));
                }
                FieldPropertyChange::Options(value)
            }
            "aiConfig" => FieldPropertyChange::AiConfig(Some(value).filter(|v| !v.is_null())),
            "lookupOptions" => {
                FieldPropertyChange::LookupOptions(Some(value).filter(|v| !v.is_null()))
            }
            "notNull" => FieldPropertyChange::NotNull(optional_bool(key, value)?.unwrap_or(false)),
            "unique" => FieldPropertyChange::Unique(optional_bool(key, value)?.unwrap_or(false)),
            "isPrimary" => FieldPropertyChange::IsPrimary(optional_bool(key, value)?),
            "isComputed" => FieldPropertyChange::IsComputed(optional_bool(key, value)?),
            "isLookup" => FieldPropertyChange::IsLookup(optional_bool(key, value)?),
            "isPending" => FieldPropertyChange::IsPending(optional_bool(key, value)?),
            "hasError" => FieldPropertyChange::HasError(optional_bool(key, value)?),
            "dbFieldName" => FieldPropertyChange::DbFieldName(required_string(key, value)?),
            "dbFieldType" => FieldPropertyChange::DbFieldType(required_string(key, value)?.parse()?),
            "cellValueType" => FieldPropertyChange::CellValueType(required_string(key, value)?),
            "isMultipleCellValue" => {
                FieldPropertyChange::IsMultipleCellValue(optional_bool(key, value)?)
            }
            other => {
                return Err(GridError::IllegalOperation(format!(
                    "unknown field property {} in op {}",
                    other, op
                )))
            }
        };
        Ok(change)
    }
}

fn required_string(key: &str, value: Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(GridError::IllegalOperation(format!(
            "field property {} expects a string, got {}",
            key, other
        ))),
    }
}

fn optional_string(key: &str, value: Value) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        other => required_string(key, other).map(Some),
    }
}

fn optional_bool(key: &str, value: Value) -> Result<Option<bool>> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(b)),
        other => Err(GridError::IllegalOperation(format!(
            "field property {} expects a boolean, got {}",
            key, other
        ))),
    }
}

/// Kind of document an op belongs to, rendered as its id prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdPrefix {
    Table,
    Field,
    View,
    Record,
}

impl IdPrefix {
    /// Fresh document id carrying this prefix
    pub fn generate(&self) -> String {
        let random = Uuid::new_v4().simple().to_string();
        format!("{}{}", self.as_str(), &random[..16])
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IdPrefix::Table => "tbl",
            IdPrefix::Field => "fld",
            IdPrefix::View => "viw",
            IdPrefix::Record => "rec",
        }
    }
}

impl fmt::Display for IdPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawOpType {
    Create,
    Del,
    Edit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOpMeta {
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateData {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

/// Serialized form of an applied op, as stored in the op log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOp {
    pub src: String,
    pub seq: u64,
    pub m: RawOpMeta,
    pub v: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<CreateData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub del: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<Vec<OtOperation>>,
}

impl RawOp {
    pub fn is_del(&self) -> bool {
        self.del.unwrap_or(false)
    }

    pub fn op_type(&self) -> RawOpType {
        if self.create.is_some() {
            RawOpType::Create
        } else if self.is_del() {
            RawOpType::Del
        } else {
            RawOpType::Edit
        }
    }
}

/// `"{doc_type}_{collection}"` -> document id -> op
pub type RawOpMap = HashMap<String, HashMap<String, RawOp>>;

/// Pending edits of one record
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOps {
    pub record_id: String,
    pub ops: Vec<OtOperation>,
}

/// Pending edits of one table, records kept in insertion order
#[derive(Debug, Clone, Default)]
pub struct TableOps {
    pub table_id: String,
    records: Vec<RecordOps>,
    index: HashMap<String, usize>,
}

impl TableOps {
    pub fn records(&self) -> &[RecordOps] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// table -> record -> ordered edits, not yet committed
#[derive(Debug, Clone, Default)]
pub struct OpsMap {
    tables: Vec<TableOps>,
    index: HashMap<String, usize>,
}

impl OpsMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, table_id: &str, record_id: &str, op: OtOperation) {
        self.extend(table_id, record_id, std::iter::once(op));
    }

    pub fn extend(
        &mut self,
        table_id: &str,
        record_id: &str,
        ops: impl IntoIterator<Item = OtOperation>,
    ) {
        let table_idx = match self.index.get(table_id) {
            Some(&idx) => idx,
            None => {
                self.tables.push(TableOps {
                    table_id: table_id.to_string(),
                    ..TableOps::default()
                });
                self.index.insert(table_id.to_string(), self.tables.len() - 1);
                self.tables.len() - 1
            }
        };
        let table = &mut self.tables[table_idx];
        let record_idx = match table.index.get(record_id) {
            Some(&idx) => idx,
            None => {
                table.records.push(RecordOps {
                    record_id: record_id.to_string(),
                    ops: Vec::new(),
                });
                table.index.insert(record_id.to_string(), table.records.len() - 1);
                table.records.len() - 1
            }
        };
        table.records[record_idx].ops.extend(ops);
    }

    pub fn tables(&self) -> &[TableOps] {
        &self.tables
    }

    pub fn table_ids(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.table_id.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.tables.iter().all(TableOps::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_record_cell_edits() {
        let op = OtOperation::set_record("fldTitle", json!("x"), Value::Null);
        let ctx = op.detect_set_record().unwrap();
        assert_eq!(ctx.field_id, "fldTitle");
        assert_eq!(ctx.new_cell_value, &json!("x"));
        assert_eq!(ctx.old_cell_value, None);

        let cleared = OtOperation::set_record("fldTitle", Value::Null, json!("x"));
        assert_eq!(cleared.detect_set_record().unwrap().new_cell_value, &Value::Null);

        let foreign: OtOperation = serde_json::from_value(json!({"p": ["name"], "oi": "t"})).unwrap();
        assert!(foreign.detect_set_record().is_none());
        let indexed: OtOperation =
            serde_json::from_value(json!({"p": ["fields", 0], "oi": "t"})).unwrap();
        assert!(indexed.detect_set_record().is_none());
    }

    #[test]
    fn json0_shape_round_trips_through_serde() {
        let op = OtOperation::set_record("fldA", json!(3), json!(2));
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({"p": ["fields", "fldA"], "oi": 3, "od": 2})
        );
    }

    #[test]
    fn parses_field_property_changes() {
        let op = OtOperation::set_field_property("dbFieldType", json!("REAL"), json!("TEXT"));
        assert_eq!(
            FieldPropertyChange::from_op(&op).unwrap(),
            FieldPropertyChange::DbFieldType(DbFieldType::Real)
        );

        let op = OtOperation::set_field_property("isPending", Value::Null, json!(true));
        assert_eq!(
            FieldPropertyChange::from_op(&op).unwrap(),
            FieldPropertyChange::IsPending(None)
        );

        let op = OtOperation::set_field_property("unique", json!(true), Value::Null);
        assert_eq!(FieldPropertyChange::from_op(&op).unwrap().key(), "unique");

        let op = OtOperation::set_field_property("colour", json!("red"), Value::Null);
        assert!(matches!(
            FieldPropertyChange::from_op(&op),
            Err(GridError::IllegalOperation(_))
        ));

        let op = OtOperation::set_field_property("options", Value::Null, json!({}));
        assert!(FieldPropertyChange::from_op(&op).is_err());
    }

    #[test]
    fn ops_map_keeps_insertion_order() {
        let mut map = OpsMap::new();
        map.push("tblB", "rec2", OtOperation::set_record("f1", json!(1), Value::Null));
        map.push("tblA", "rec1", OtOperation::set_record("f1", json!(1), Value::Null));
        map.push("tblB", "rec1", OtOperation::set_record("f1", json!(1), Value::Null));
        map.push("tblB", "rec2", OtOperation::set_record("f2", json!(2), Value::Null));

        assert_eq!(map.table_ids().collect::<Vec<_>>(), vec!["tblB", "tblA"]);
        let tbl_b = &map.tables()[0];
        assert_eq!(tbl_b.records()[0].record_id, "rec2");
        assert_eq!(tbl_b.records()[0].ops.len(), 2);
        assert_eq!(tbl_b.records()[1].record_id, "rec1");
        assert!(!map.is_empty());
    }

    #[test]
    fn generated_ids_carry_prefix() {
        let id = IdPrefix::Record.generate();
        assert!(id.starts_with("rec"));
        assert_eq!(id.len(), 19);
        assert_ne!(id, IdPrefix::Record.generate());
    }

    #[test]
    fn raw_op_kinds() {
        let raw: RawOp = serde_json::from_value(json!({
            "src": "usr1", "seq": 1, "m": {"ts": 1}, "v": 0, "del": true
        }))
        .unwrap();
        assert_eq!(raw.op_type(), RawOpType::Del);
        let raw: RawOp = serde_json::from_value(json!({
            "src": "usr1", "seq": 1, "m": {"ts": 1}, "v": 0,
            "create": {"type": "json0", "data": {"id": "rec1"}}
        }))
        .unwrap();
        assert_eq!(raw.op_type(), RawOpType::Create);
    }
}
