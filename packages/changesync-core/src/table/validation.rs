//! Validation methods for table schema and rows.

use std::collections::HashSet;

use super::schema::TableSchema;
use super::table::RowMap;
use crate::error::DbError;
use crate::value::{RowKey, Value};

/// Validates column names and the presence of a primary key.
pub(crate) fn validate_schema(schema: &TableSchema) -> Result<(), DbError> {
    if schema.columns.is_empty() {
        return Err(DbError::InvalidSchema {
            table: schema.name.clone(),
            reason: "table must have at least one column".to_string(),
        });
    }

    let mut seen_names = HashSet::new();
    for column in &schema.columns {
        if !seen_names.insert(column.name.as_str()) {
            return Err(DbError::InvalidSchema {
                table: schema.name.clone(),
                reason: format!("duplicate column '{}'", column.name),
            });
        }
    }

    if !schema.columns.iter().any(|c| c.primary_key) {
        return Err(DbError::InvalidSchema {
            table: schema.name.clone(),
            reason: "table must declare a primary key".to_string(),
        });
    }
    Ok(())
}

/// Validates a row against column count, absent cells and NOT NULL.
pub(crate) fn validate_row(schema: &TableSchema, row: &[Value]) -> Result<(), DbError> {
    if row.len() != schema.column_count() {
        return Err(DbError::ColumnCountMismatch {
            table: schema.name.clone(),
            expected: schema.column_count(),
            got: row.len(),
        });
    }

    for (column, value) in schema.columns.iter().zip(row) {
        if value.is_absent() {
            return Err(DbError::AbsentValue {
                table: schema.name.clone(),
                column: column.name.clone(),
            });
        }
        if value.is_null() && (column.not_null || column.primary_key) {
            return Err(DbError::NotNullViolation {
                table: schema.name.clone(),
                column: column.name.clone(),
            });
        }
    }
    Ok(())
}

/// Validates UNIQUE columns against every other row in the table.
///
/// `own_key` is skipped so that a row may keep its own value on update.
pub(crate) fn validate_unique(
    schema: &TableSchema,
    rows: &RowMap,
    row: &[Value],
    own_key: Option<&RowKey>,
) -> Result<(), DbError> {
    for (index, column) in schema.columns.iter().enumerate() {
        if !column.unique || row[index].is_null() {
            continue;
        }
        let clash = rows
            .iter()
            .filter(|(key, _)| Some(*key) != own_key)
            .any(|(_, other)| other[index] == row[index]);
        if clash {
            return Err(DbError::UniqueViolation {
                table: schema.name.clone(),
                column: column.name.clone(),
            });
        }
    }
    Ok(())
}
