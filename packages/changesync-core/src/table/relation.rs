//! Foreign key reference from a column to a column of another table.

use serde::{Deserialize, Serialize};

/// Foreign key reference from a column to a column of another table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// Name of the target table
    pub to_table: String,
    /// Column name in target table
    pub to_column: String,
}

impl Relation {
    pub fn new(to_table: impl Into<String>, to_column: impl Into<String>) -> Self {
        Self {
            to_table: to_table.into(),
            to_column: to_column.into(),
        }
    }
}
