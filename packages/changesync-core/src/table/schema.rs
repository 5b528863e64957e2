//! Table schema: ordered columns and the primary-key mask derived from them.

use serde::{Deserialize, Serialize};

use crate::error::DbError;
use crate::value::{RowKey, Value};

use super::column::Column;
use super::validation;

/// Table schema with ordered column list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name
    pub name: String,
    /// Column definitions in declaration order
    pub columns: Vec<Column>,
}

impl TableSchema {
    /// Creates a schema, validating column names and the primary key.
    ///
    /// # Arguments
    /// * `name` - Table name
    /// * `columns` - Column definitions, at least one marked primary key
    ///
    /// # Returns
    /// `Result<TableSchema, DbError>` containing the schema or a validation error.
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Result<Self, DbError> {
        let schema = Self {
            name: name.into(),
            columns,
        };
        validation::validate_schema(&schema)?;
        Ok(schema)
    }

    /// Number of columns.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Primary-key flag per column.
    pub fn primary_key_mask(&self) -> Vec<bool> {
        self.columns.iter().map(|c| c.primary_key).collect()
    }

    /// Indices of the primary-key columns.
    pub fn primary_key_indices(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.primary_key.then_some(i))
            .collect()
    }

    /// Index of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Primary-key values of a full-width row.
    pub fn primary_key_of(&self, row: &[Value]) -> Vec<Value> {
        self.columns
            .iter()
            .zip(row)
            .filter_map(|(c, v)| c.primary_key.then(|| v.clone()))
            .collect()
    }

    /// Store key of a full-width row.
    pub fn row_key(&self, row: &[Value]) -> RowKey {
        RowKey::from_values(
            self.columns
                .iter()
                .zip(row)
                .filter_map(|(c, v)| c.primary_key.then_some(v)),
        )
    }
}
