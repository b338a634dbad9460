//! Write path of a spreadsheet-style table store
//!
//! This crate provides:
//! - Versioned batch record updates through staging-table bulk writes
//! - Field lifecycle management with the matching physical DDL
//! - Translation of unique / not-null violations into named-field errors
//! - An append-only operation log per collection and document
//! - Metadata entities and schema migration for PostgreSQL, MySQL and SQLite
//!
//! Can be used as a library or through the `gridbase` operator binary

pub mod batch;
pub mod bulk;
pub mod config;
pub mod context;
pub mod database;
pub mod dialect;
pub mod entity;
pub mod error;
pub mod field;
pub mod op_log;
pub mod ops;
pub mod record_store;
pub mod reference;
pub mod schema;
pub mod table;

// Re-export commonly used types
pub use batch::{BatchCoordinator, BatchUpdateSummary, FieldMap, TableNameMap};
pub use bulk::{BulkMutationExecutor, BulkRow};
pub use config::GridConfig;
pub use context::RequestContext;
pub use database::Database;
pub use dialect::{ColumnSchema, Dialect, TableColumn};
pub use error::{GridError, Result};
pub use field::{
    FieldInstance, FieldSchemaManager, FieldSnapshot, FieldType, FieldUpdate, FieldUpdateOutcome,
    NewField, RejectedFieldUpdate,
};
pub use op_log::{OpEntry, OpLog, OpPayload};
pub use ops::{FieldPropertyChange, IdPrefix, OpsMap, OtOperation, RawOp, RawOpMap};
pub use record_store::{NewRecord, RecordVersion, VersionedRecordStore};
pub use reference::ReferenceGraph;
pub use schema::{DbFieldType, SchemaType};
pub use table::TableManager;
