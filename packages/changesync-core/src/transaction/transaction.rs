use std::collections::{HashMap, HashSet};
use std::sync::{Arc, MutexGuard};

use crate::changeset::OpKind;
use crate::database::Database;
use crate::error::DbError;
use crate::table::{validation, Relation, RowMap};
use crate::value::{Row, RowKey, Value};

use super::mutation::RowMutation;
use super::staging::StagedTable;

/// Write transaction holding staged changes across multiple tables.
///
/// Changes are isolated from committed rows until commit. Only one
/// transaction can be open per database; `begin()` blocks until the
/// previous one is finished. If the transaction is not committed it is
/// rolled back when dropped.
pub struct Transaction<'db> {
    db: &'db Database,
    _writer: MutexGuard<'db, ()>,
    /// Map of table name to staged rows
    staging: HashMap<String, StagedTable>,
    /// Row writes in execution order
    mutations: Vec<RowMutation>,
    /// Flag subsequent writes as indirect
    indirect: bool,
    committed: bool,
    aborted: bool,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(db: &'db Database, writer: MutexGuard<'db, ()>) -> Self {
        Self {
            db,
            _writer: writer,
            staging: HashMap::new(),
            mutations: Vec::new(),
            indirect: false,
            committed: false,
            aborted: false,
        }
    }

    /// Flags subsequent writes as indirect (trigger or cascade side effects).
    pub fn set_indirect(&mut self, indirect: bool) {
        self.indirect = indirect;
    }

    /// Row writes staged so far, in execution order.
    pub fn mutations(&self) -> &[RowMutation] {
        &self.mutations
    }

    /// Returns whether the transaction is still active (not committed or aborted).
    pub fn is_active(&self) -> bool {
        !self.committed && !self.aborted
    }

    fn ensure_active(&self) -> Result<(), DbError> {
        if self.committed {
            return Err(DbError::TransactionConflict(
                "transaction already committed".to_string(),
            ));
        }
        if self.aborted {
            return Err(DbError::TransactionConflict(
                "transaction aborted".to_string(),
            ));
        }
        Ok(())
    }

    /// Gets or creates the staging area for the given table.
    fn stage(&mut self, table: &str) -> Result<&mut StagedTable, DbError> {
        if !self.staging.contains_key(table) {
            let handle = self.db.table(table)?;
            self.staging
                .insert(table.to_string(), StagedTable::new(handle));
        }
        self.staging
            .get_mut(table)
            .ok_or_else(|| DbError::TableNotFound {
                table: table.to_string(),
            })
    }

    /// Rows of a table as seen by this transaction.
    fn view(&self, table: &str) -> Result<Arc<RowMap>, DbError> {
        match self.staging.get(table) {
            Some(staged) => Ok(staged.rows.clone()),
            None => Ok(self.db.table(table)?.snapshot()),
        }
    }

    /// Reads a row by primary-key values, seeing staged writes.
    ///
    /// # Arguments
    /// * `table` - Table name
    /// * `pk` - Primary-key values in column order
    pub fn get(&self, table: &str, pk: &[Value]) -> Result<Option<Row>, DbError> {
        let key = RowKey::from_values(pk);
        Ok(self.view(table)?.get(&key).cloned())
    }

    /// Stages a row insertion.
    ///
    /// # Arguments
    /// * `table` - Table name
    /// * `row` - Full-width row
    ///
    /// # Returns
    /// `Result<(), DbError>` failing on constraint violations.
    pub fn insert(&mut self, table: &str, row: Row) -> Result<(), DbError> {
        self.ensure_active()?;
        let indirect = self.indirect;
        let staged = self.stage(table)?;
        let schema = staged.table.schema.clone();

        validation::validate_row(&schema, &row)?;
        let key = schema.row_key(&row);
        if staged.rows.contains_key(&key) {
            return Err(DbError::DuplicateKey {
                table: table.to_string(),
            });
        }
        validation::validate_unique(&schema, &staged.rows, &row, None)?;
        staged.rows_mut().insert(key, row.clone());

        self.mutations.push(RowMutation {
            table: table.to_string(),
            schema,
            op: OpKind::Insert,
            old: None,
            new: Some(row),
            indirect,
        });
        Ok(())
    }

    /// Stages a row update, possibly changing its primary key.
    ///
    /// # Arguments
    /// * `table` - Table name
    /// * `pk` - Primary-key values of the row to update
    /// * `row` - New full-width row
    pub fn update(&mut self, table: &str, pk: &[Value], row: Row) -> Result<(), DbError> {
        self.ensure_active()?;
        let indirect = self.indirect;
        let staged = self.stage(table)?;
        let schema = staged.table.schema.clone();

        let key = RowKey::from_values(pk);
        let old = staged
            .rows
            .get(&key)
            .cloned()
            .ok_or_else(|| DbError::RowNotFound {
                table: table.to_string(),
            })?;

        validation::validate_row(&schema, &row)?;
        let new_key = schema.row_key(&row);
        if new_key != key && staged.rows.contains_key(&new_key) {
            return Err(DbError::DuplicateKey {
                table: table.to_string(),
            });
        }
        validation::validate_unique(&schema, &staged.rows, &row, Some(&key))?;

        let rows = staged.rows_mut();
        rows.remove(&key);
        rows.insert(new_key, row.clone());

        self.mutations.push(RowMutation {
            table: table.to_string(),
            schema,
            op: OpKind::Update,
            old: Some(old),
            new: Some(row),
            indirect,
        });
        Ok(())
    }

    /// Stages a row deletion and returns the deleted row.
    ///
    /// # Arguments
    /// * `table` - Table name
    /// * `pk` - Primary-key values of the row to delete
    pub fn delete(&mut self, table: &str, pk: &[Value]) -> Result<Row, DbError> {
        self.ensure_active()?;
        let indirect = self.indirect;
        let staged = self.stage(table)?;
        let schema = staged.table.schema.clone();

        let key = RowKey::from_values(pk);
        if !staged.rows.contains_key(&key) {
            return Err(DbError::RowNotFound {
                table: table.to_string(),
            });
        }
        let old = staged
            .rows_mut()
            .remove(&key)
            .ok_or_else(|| DbError::RowNotFound {
                table: table.to_string(),
            })?;

        self.mutations.push(RowMutation {
            table: table.to_string(),
            schema,
            op: OpKind::Delete,
            old: Some(old.clone()),
            new: None,
            indirect,
        });
        Ok(old)
    }

    /// Rows of a table as committed before this transaction.
    fn committed_rows(&self, table: &str) -> Result<Arc<RowMap>, DbError> {
        match self.staging.get(table) {
            Some(staged) => Ok(staged.table.snapshot()),
            None => Ok(self.db.table(table)?.snapshot()),
        }
    }

    /// Whether the staged rows hold a parent matching `value`.
    fn parent_exists(&self, relation: &Relation, value: &Value) -> Result<bool, DbError> {
        let Ok(schema) = self.db.table_schema(&relation.to_table) else {
            return Ok(false);
        };
        let Some(column) = schema.column_index(&relation.to_column) else {
            return Ok(false);
        };
        Ok(self
            .view(&relation.to_table)?
            .values()
            .any(|row| &row[column] == value))
    }

    /// Counts foreign key violations introduced by this transaction.
    ///
    /// Checks child rows it inserted or whose reference it changed, and
    /// children left dangling by parent rows it deleted or re-keyed. Orphans
    /// committed earlier are not counted again.
    pub fn foreign_key_violations(&self) -> Result<usize, DbError> {
        let mut dangling: HashSet<(String, RowKey, usize)> = HashSet::new();

        for mutation in &self.mutations {
            let Some(written) = &mutation.new else {
                continue;
            };
            let key = mutation.schema.row_key(written);
            let Some(row) = self.view(&mutation.table)?.get(&key).cloned() else {
                continue;
            };
            let before = self.committed_rows(&mutation.table)?.get(&key).cloned();

            for (index, column) in mutation.schema.columns.iter().enumerate() {
                let Some(relation) = &column.references else {
                    continue;
                };
                let value = &row[index];
                if value.is_null() || before.as_ref().is_some_and(|b| &b[index] == value) {
                    continue;
                }
                if !self.parent_exists(relation, value)? {
                    dangling.insert((mutation.table.clone(), key.clone(), index));
                }
            }
        }

        for mutation in &self.mutations {
            let Some(old) = &mutation.old else {
                continue;
            };
            for name in self.db.table_names() {
                let schema = self.db.table_schema(&name)?;
                for (index, column) in schema.columns.iter().enumerate() {
                    let Some(relation) = &column.references else {
                        continue;
                    };
                    if relation.to_table != mutation.table {
                        continue;
                    }
                    let Some(p) = mutation.schema.column_index(&relation.to_column) else {
                        continue;
                    };
                    let value = &old[p];
                    if value.is_null()
                        || mutation.new.as_ref().is_some_and(|n| &n[p] == value)
                        || self.parent_exists(relation, value)?
                    {
                        continue;
                    }
                    for (key, child) in self.view(&name)?.iter() {
                        if &child[index] == value {
                            dangling.insert((name.clone(), key.clone(), index));
                        }
                    }
                }
            }
        }
        Ok(dangling.len())
    }

    /// Commits all staged changes atomically.
    ///
    /// Checks foreign keys first; on violation the transaction stays open
    /// and is rolled back when dropped.
    pub fn commit(self) -> Result<(), DbError> {
        self.finish(true)
    }

    /// Commits without the deferred foreign key check.
    pub(crate) fn commit_unchecked(self) -> Result<(), DbError> {
        self.finish(false)
    }

    fn finish(mut self, check_foreign_keys: bool) -> Result<(), DbError> {
        self.ensure_active()?;
        if check_foreign_keys {
            let count = self.foreign_key_violations()?;
            if count > 0 {
                return Err(DbError::ForeignKeyViolation { count });
            }
        }

        // Sort tables by name to keep installation order deterministic
        let mut table_names: Vec<&String> = self.staging.keys().collect();
        table_names.sort();
        for name in &table_names {
            let staged = &self.staging[*name];
            let current = self.db.table(name)?;
            if !Arc::ptr_eq(&current, &staged.table) {
                return Err(DbError::TableNotFound {
                    table: name.to_string(),
                });
            }
        }
        for name in table_names {
            let staged = &self.staging[name];
            if staged.writes > 0 {
                staged.table.store(staged.rows.clone());
            }
        }

        self.committed = true;
        tracing::debug!(
            "Committed {} row writes across {} tables",
            self.mutations.len(),
            self.staging.len()
        );
        self.db.notify(&self.mutations);
        Ok(())
    }

    /// Discards all staged changes.
    pub fn rollback(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if self.is_active() {
            self.aborted = true;
            self.staging.clear();
            self.mutations.clear();
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.is_active() {
            if !self.mutations.is_empty() {
                tracing::debug!(
                    "Rolling back {} uncommitted row writes",
                    self.mutations.len()
                );
            }
            self.abort();
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("staged_tables", &self.staging.len())
            .field("mutations", &self.mutations.len())
            .field("indirect", &self.indirect)
            .field("committed", &self.committed)
            .field("aborted", &self.aborted)
            .finish()
    }
}
