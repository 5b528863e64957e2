//! Column definition within a table.

use serde::{Deserialize, Serialize};

use super::relation::Relation;

/// Column definition within a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Part of the primary key
    pub primary_key: bool,
    /// Rejects NULL values
    pub not_null: bool,
    /// Rejects duplicate non-NULL values
    pub unique: bool,
    /// Foreign key reference, checked at commit
    pub references: Option<Relation>,
}

impl Column {
    /// Creates a plain nullable column.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: false,
            not_null: false,
            unique: false,
            references: None,
        }
    }

    /// Marks the column as part of the primary key.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some(Relation::new(table, column));
        self
    }
}
