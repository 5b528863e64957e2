//! Table row storage.
//!
//! Each table has:
//! - Fixed schema with column definitions
//! - Row map swapped atomically on commit, read without locks
//! - Rows keyed and ordered by encoded primary key

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::value::{Row, RowKey};

use super::schema::TableSchema;

/// Rows of a table keyed by encoded primary key.
pub type RowMap = BTreeMap<RowKey, Row>;

/// Table schema and row storage.
#[derive(Debug)]
pub struct Table {
    /// Immutable schema
    pub schema: Arc<TableSchema>,
    /// Committed rows, replaced wholesale on commit
    rows: ArcSwap<RowMap>,
}

impl Table {
    /// Creates an empty table.
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema: Arc::new(schema),
            rows: ArcSwap::from_pointee(RowMap::new()),
        }
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    /// Returns a snapshot of the committed rows.
    pub fn snapshot(&self) -> Arc<RowMap> {
        self.rows.load_full()
    }

    /// Replaces the committed rows.
    pub(crate) fn store(&self, rows: Arc<RowMap>) {
        self.rows.store(rows);
    }

    /// Reads a row by key.
    pub fn get(&self, key: &RowKey) -> Option<Row> {
        self.rows.load().get(key).cloned()
    }

    /// Returns the number of committed rows.
    pub fn row_count(&self) -> usize {
        self.rows.load().len()
    }

    /// Returns all committed rows in primary-key order.
    pub fn rows(&self) -> Vec<Row> {
        self.rows.load().values().cloned().collect()
    }
}
