//! Database container managing tables, the writer lock and mutation hooks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::DbError;
use crate::table::{Table, TableSchema};
use crate::transaction::{HookId, MutationHook, RowMutation, Transaction};
use crate::value::{Row, RowKey, Value};

/// In-memory row store holding tables and the hooks observing them.
pub struct Database {
    /// Map of table name to table instance
    tables: RwLock<HashMap<String, Arc<Table>>>,
    /// Registered mutation hooks, in registration order
    hooks: RwLock<Vec<(HookId, Arc<dyn MutationHook>)>>,
    next_hook_id: AtomicU64,
    /// Single-writer lock held by every open transaction
    writer: Mutex<()>,
}

impl Database {
    /// Creates a new empty database.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            hooks: RwLock::new(Vec::new()),
            next_hook_id: AtomicU64::new(1),
            writer: Mutex::new(()),
        }
    }

    /// Creates a new table from a schema.
    ///
    /// # Arguments
    /// * `schema` - Validated table schema
    ///
    /// # Returns
    /// `Result<(), DbError>` indicating success or failure.
    pub fn create_table(&self, schema: TableSchema) -> Result<(), DbError> {
        let mut tables = self.tables.write().map_err(|_| DbError::LockPoisoned)?;
        if tables.contains_key(&schema.name) {
            return Err(DbError::TableAlreadyExists(schema.name));
        }
        tracing::debug!(
            "Creating table {} with {} columns",
            schema.name,
            schema.column_count()
        );
        tables.insert(schema.name.clone(), Arc::new(Table::new(schema)));
        Ok(())
    }

    /// Deletes a table by name.
    pub fn drop_table(&self, name: &str) -> Result<(), DbError> {
        let mut tables = self.tables.write().map_err(|_| DbError::LockPoisoned)?;
        tables.remove(name).ok_or_else(|| DbError::TableNotFound {
            table: name.to_string(),
        })?;
        Ok(())
    }

    /// Gets a table handle by name.
    pub fn table(&self, name: &str) -> Result<Arc<Table>, DbError> {
        let tables = self.tables.read().map_err(|_| DbError::LockPoisoned)?;
        tables
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::TableNotFound {
                table: name.to_string(),
            })
    }

    /// Gets a table schema by name.
    pub fn table_schema(&self, name: &str) -> Result<Arc<TableSchema>, DbError> {
        Ok(self.table(name)?.schema.clone())
    }

    /// Returns all table names, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let tables = match self.tables.read() {
            Ok(tables) => tables,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut names: Vec<String> = tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the number of tables in the database.
    pub fn table_count(&self) -> usize {
        self.table_names().len()
    }

    /// Reads a committed row by primary-key values.
    pub fn get_row(&self, table: &str, pk: &[Value]) -> Result<Option<Row>, DbError> {
        Ok(self.table(table)?.get(&RowKey::from_values(pk)))
    }

    /// Returns the committed rows of a table in primary-key order.
    pub fn rows(&self, table: &str) -> Result<Vec<Row>, DbError> {
        Ok(self.table(table)?.rows())
    }

    /// Returns the number of committed rows in a table.
    pub fn row_count(&self, table: &str) -> Result<usize, DbError> {
        Ok(self.table(table)?.row_count())
    }

    /// Begins a write transaction, waiting for any open one to finish.
    pub fn begin(&self) -> Result<Transaction<'_>, DbError> {
        let writer = self.writer.lock().map_err(|_| DbError::LockPoisoned)?;
        Ok(Transaction::new(self, writer))
    }

    /// Runs a closure in a transaction and commits it if the closure succeeds.
    ///
    /// # Arguments
    /// * `f` - Closure staging writes
    ///
    /// # Returns
    /// `Result<R, DbError>` containing the closure's result.
    pub fn write<F, R>(&self, f: F) -> Result<R, DbError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R, DbError>,
    {
        let mut tx = self.begin()?;
        let result = f(&mut tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Registers a hook receiving every committed row write.
    pub fn register_hook(&self, hook: Arc<dyn MutationHook>) -> Result<HookId, DbError> {
        let id = HookId(self.next_hook_id.fetch_add(1, Ordering::SeqCst));
        let mut hooks = self.hooks.write().map_err(|_| DbError::LockPoisoned)?;
        hooks.push((id, hook));
        Ok(id)
    }

    /// Removes a previously registered hook. Returns `false` if unknown.
    pub fn unregister_hook(&self, id: HookId) -> Result<bool, DbError> {
        let mut hooks = self.hooks.write().map_err(|_| DbError::LockPoisoned)?;
        let before = hooks.len();
        hooks.retain(|(hook_id, _)| *hook_id != id);
        Ok(hooks.len() != before)
    }

    /// Delivers committed writes to every hook.
    pub(crate) fn notify(&self, mutations: &[RowMutation]) {
        if mutations.is_empty() {
            return;
        }
        let hooks: Vec<Arc<dyn MutationHook>> = match self.hooks.read() {
            Ok(hooks) => hooks.iter().map(|(_, hook)| hook.clone()).collect(),
            Err(_) => {
                tracing::error!("Hook registry lock poisoned, dropping notifications");
                return;
            }
        };
        for mutation in mutations {
            for hook in &hooks {
                hook.on_mutation(mutation);
            }
        }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("tables", &self.table_names())
            .finish()
    }
}
