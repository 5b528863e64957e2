use std::sync::Arc;

use crate::table::{RowMap, Table};

/// Holds staged rows for a single table.
///
/// Starts as a shared snapshot of the committed rows and is copied on the
/// first write, so untouched tables cost nothing.
#[derive(Debug)]
pub struct StagedTable {
    /// Table the rows belong to
    pub table: Arc<Table>,
    /// Copy of the table rows with staged changes applied
    pub rows: Arc<RowMap>,
    /// Number of writes staged against this table
    pub writes: usize,
}

impl StagedTable {
    /// Creates a staging area from a table's current state.
    pub fn new(table: Arc<Table>) -> Self {
        let rows = table.snapshot();
        Self {
            table,
            rows,
            writes: 0,
        }
    }

    /// Mutable access to the staged rows, copying them on first use.
    pub fn rows_mut(&mut self) -> &mut RowMap {
        self.writes += 1;
        Arc::make_mut(&mut self.rows)
    }
}
