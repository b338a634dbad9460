//! Error types for the gridbase write path

use sea_orm::{DbErr, SqlErr};
use thiserror::Error;

pub const FIELD_VALUE_DUPLICATE_KEY: &str = "httpErrors.custom.fieldValueDuplicate";
pub const FIELD_VALUE_NOT_NULL_KEY: &str = "httpErrors.custom.fieldValueNotNull";

/// Error type for record, field and op-log operations
#[derive(Error, Debug)]
pub enum GridError {
    /// Database connection or statement error
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    /// Caller supplied something that cannot be applied
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Referenced table or field does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A bulk write or constraint change hit a unique index
    #[error("Fields {} unique validation failed", .field_ids.join(", "))]
    FieldValueDuplicate {
        table_name: String,
        field_ids: Vec<String>,
        field_names: Vec<String>,
    },

    /// A bulk write or constraint change hit a not-null constraint
    #[error("Fields {} not null validation failed", .field_ids.join(", "))]
    FieldValueNotNull {
        table_name: String,
        field_ids: Vec<String>,
        field_names: Vec<String>,
    },

    /// Malformed operation produced upstream
    #[error("Illegal operation: {0}")]
    IllegalOperation(String),

    /// The connected engine cannot perform the requested change
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl GridError {
    /// Whether the error was caused by the request rather than by a bug or the backend
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            GridError::Validation(_)
                | GridError::NotFound(_)
                | GridError::FieldValueDuplicate { .. }
                | GridError::FieldValueNotNull { .. }
        )
    }

    /// Named-field error for a classified constraint violation
    pub fn constraint(
        violation: ConstraintViolation,
        table_name: String,
        field_ids: Vec<String>,
        field_names: Vec<String>,
    ) -> Self {
        match violation {
            ConstraintViolation::Unique => GridError::FieldValueDuplicate {
                table_name,
                field_ids,
                field_names,
            },
            ConstraintViolation::NotNull => GridError::FieldValueNotNull {
                table_name,
                field_ids,
                field_names,
            },
        }
    }

    /// Localization key for translated constraint violations
    pub fn i18n_key(&self) -> Option<&'static str> {
        match self {
            GridError::FieldValueDuplicate { .. } => Some(FIELD_VALUE_DUPLICATE_KEY),
            GridError::FieldValueNotNull { .. } => Some(FIELD_VALUE_NOT_NULL_KEY),
            _ => None,
        }
    }
}

/// Constraint class of a failed statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintViolation {
    Unique,
    NotNull,
}

/// Classify a database error as a unique or not-null violation.
///
/// Covers the wording of PostgreSQL, MySQL and SQLite; anything else is `None`.
pub fn classify_violation(err: &DbErr) -> Option<ConstraintViolation> {
    if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
        return Some(ConstraintViolation::Unique);
    }
    classify_message(&err.to_string())
}

pub(crate) fn classify_message(message: &str) -> Option<ConstraintViolation> {
    let lower = message.to_lowercase();
    if lower.contains("unique constraint failed")
        || lower.contains("duplicate key value")
        || lower.contains("duplicate entry")
        || lower.contains("could not create unique index")
    {
        Some(ConstraintViolation::Unique)
    } else if lower.contains("not null constraint failed")
        || lower.contains("violates not-null constraint")
        || lower.contains("contains null values")
        || lower.contains("cannot be null")
        || lower.contains("invalid use of null value")
    {
        Some(ConstraintViolation::NotNull)
    } else {
        None
    }
}

/// Result type alias for gridbase operations
pub type Result<T> = std::result::Result<T, GridError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_engine_messages() {
        assert_eq!(
            classify_message("UNIQUE constraint failed: bse_tbl.name"),
            Some(ConstraintViolation::Unique)
        );
        assert_eq!(
            classify_message(
                "duplicate key value violates unique constraint \"bse_tbl___fld_unique\""
            ),
            Some(ConstraintViolation::Unique)
        );
        assert_eq!(
            classify_message("Duplicate entry 'x' for key 'tbl___fldx_unique'"),
            Some(ConstraintViolation::Unique)
        );
        assert_eq!(
            classify_message("NOT NULL constraint failed: tbl.title"),
            Some(ConstraintViolation::NotNull)
        );
        assert_eq!(
            classify_message("column \"title\" of relation \"tbl\" contains null values"),
            Some(ConstraintViolation::NotNull)
        );
        assert_eq!(classify_message("syntax error near FROM"), None);
    }

    #[test]
    fn translated_errors_are_client_errors() {
        let err = GridError::FieldValueDuplicate {
            table_name: "Tasks".to_string(),
            field_ids: vec!["fldA".to_string(), "fldB".to_string()],
            field_names: vec!["Title".to_string(), "Code".to_string()],
        };
        assert!(err.is_client_error());
        assert_eq!(err.i18n_key(), Some(FIELD_VALUE_DUPLICATE_KEY));
        assert_eq!(err.to_string(), "Fields fldA, fldB unique validation failed");

        let err = GridError::IllegalOperation("bad op".to_string());
        assert!(!err.is_client_error());
        assert_eq!(err.i18n_key(), None);
    }
}
