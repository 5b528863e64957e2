//! Session recorder: captures committed row writes on attached tables and
//! produces changesets or patchsets from them.
//!
//! A session registers itself as a mutation hook on its database. Every
//! committed write to a tracked table is folded into one record per primary
//! key, so a row inserted and then updated yields a single INSERT carrying
//! the final values.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::changeset::{ChangeRecord, Changeset, ChangesetKind, OpKind, TableGroup, TableHeader};
use crate::config::SessionConfig;
use crate::database::Database;
use crate::error::{ChangesetError, DbError, Result};
use crate::table::TableSchema;
use crate::transaction::{HookId, MutationHook, RowMutation};
use crate::value::{Row, RowKey, Value};

type TableFilter = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Accumulated change for one primary key, holding full row images.
#[derive(Debug, Clone)]
struct SessionChange {
    op: OpKind,
    old: Option<Row>,
    new: Option<Row>,
    indirect: bool,
}

#[derive(Debug)]
struct TrackedTable {
    /// Name and primary-key mask snapshotted at attach time
    header: TableHeader,
    /// Changes in first-recorded order; coalesced-away changes leave `None`
    slots: Vec<Option<SessionChange>>,
    index: HashMap<RowKey, usize>,
}

impl TrackedTable {
    fn new(schema: &TableSchema) -> Self {
        Self {
            header: TableHeader::new(schema.name.clone(), schema.primary_key_mask()),
            slots: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn check_row(&self, row: &[Value]) -> Result<()> {
        if row.len() != self.header.column_count() {
            return Err(ChangesetError::SchemaError(format!(
                "table '{}' was attached with {} columns, row has {}",
                self.header.name,
                self.header.column_count(),
                row.len()
            )));
        }
        if row.iter().any(Value::is_absent) {
            return Err(ChangesetError::SchemaError(format!(
                "row for table '{}' contains an absent value",
                self.header.name
            )));
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn merge(&mut self, key: RowKey, change: SessionChange) -> Result<()> {
        let Some(&slot) = self.index.get(&key) else {
            self.index.insert(key, self.slots.len());
            self.slots.push(Some(change));
            return Ok(());
        };
        let Some(existing) = self.slots[slot].as_ref() else {
            self.index.insert(key, self.slots.len());
            self.slots.push(Some(change));
            return Ok(());
        };
        let merged = coalesce(&self.header.name, existing, change)?;
        if merged.is_none() {
            self.index.remove(&key);
        }
        self.slots[slot] = merged;
        Ok(())
    }

    fn records(&self, kind: ChangesetKind) -> Result<Vec<ChangeRecord>> {
        let mut records = Vec::with_capacity(self.len());
        for change in self.slots.iter().flatten() {
            if let Some(record) = to_record(&self.header, change, kind)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn memory_used(&self) -> usize {
        let rows: usize = self
            .slots
            .iter()
            .flatten()
            .flat_map(|c| c.old.iter().chain(c.new.iter()))
            .flat_map(|row| row.iter())
            .map(Value::byte_size)
            .sum();
        let keys: usize = self.index.keys().map(|k| k.as_bytes().len()).sum();
        self.header.name.len() + self.header.column_count() + rows + keys
    }
}

/// Combines an existing change with a later one for the same row.
///
/// Returns `None` when the two cancel out. The old image always comes from
/// the earliest change; a missing one stays missing.
fn coalesce(
    table: &str,
    existing: &SessionChange,
    incoming: SessionChange,
) -> Result<Option<SessionChange>> {
    let indirect = existing.indirect && incoming.indirect;
    let merged = match (existing.op, incoming.op) {
        (OpKind::Insert, OpKind::Update) => Some(SessionChange {
            op: OpKind::Insert,
            old: None,
            new: incoming.new,
            indirect,
        }),
        (OpKind::Insert, OpKind::Delete) => None,
        (OpKind::Update, OpKind::Update) => Some(SessionChange {
            op: OpKind::Update,
            old: existing.old.clone(),
            new: incoming.new,
            indirect,
        }),
        (OpKind::Update, OpKind::Delete) => Some(SessionChange {
            op: OpKind::Delete,
            old: existing.old.clone(),
            new: None,
            indirect,
        }),
        (OpKind::Delete, OpKind::Insert) => Some(SessionChange {
            op: OpKind::Update,
            old: existing.old.clone(),
            new: incoming.new,
            indirect,
        }),
        (first, second) => {
            return Err(ChangesetError::SchemaConflict {
                table: table.to_string(),
                reason: format!("{} followed by {} for the same row", first, second),
            })
        }
    };
    Ok(merged)
}

/// Encodes an accumulated change. UPDATEs that change nothing yield `None`.
fn to_record(
    header: &TableHeader,
    change: &SessionChange,
    kind: ChangesetKind,
) -> Result<Option<ChangeRecord>> {
    let patchset = kind == ChangesetKind::Patchset;
    let record = match change.op {
        OpKind::Insert => {
            let new = change.new.clone().unwrap_or_default();
            ChangeRecord::insert(new)
        }
        OpKind::Delete => {
            let old = change.old.as_ref().ok_or_else(|| missing_old(header))?;
            let cells = if patchset {
                key_only(header, old)
            } else {
                old.clone()
            };
            ChangeRecord::delete(cells)
        }
        OpKind::Update => {
            let old = change.old.as_ref().ok_or_else(|| missing_old(header))?;
            let new = change.new.as_deref().unwrap_or_default();
            let mut old_cells = Vec::with_capacity(old.len());
            let mut new_cells = Vec::with_capacity(old.len());
            let mut changed = false;
            for (i, (before, after)) in old.iter().zip(new).enumerate() {
                if header.is_primary_key(i) {
                    old_cells.push(before.clone());
                    new_cells.push(Value::Absent);
                } else if before != after {
                    changed = true;
                    old_cells.push(if patchset {
                        Value::Absent
                    } else {
                        before.clone()
                    });
                    new_cells.push(after.clone());
                } else {
                    old_cells.push(Value::Absent);
                    new_cells.push(Value::Absent);
                }
            }
            if !changed {
                return Ok(None);
            }
            ChangeRecord::update(old_cells, new_cells)
        }
    };
    Ok(Some(record.with_indirect(change.indirect)))
}

fn key_only(header: &TableHeader, row: &[Value]) -> Vec<Value> {
    row.iter()
        .enumerate()
        .map(|(i, v)| {
            if header.is_primary_key(i) {
                v.clone()
            } else {
                Value::Absent
            }
        })
        .collect()
}

fn missing_old(header: &TableHeader) -> ChangesetError {
    ChangesetError::NotSupported(format!(
        "no old row image was captured for a change to table '{}'",
        header.name
    ))
}

struct SessionState {
    closed: bool,
    enabled: bool,
    indirect: bool,
    attach_all: bool,
    filter: Option<TableFilter>,
    /// Tracked tables in attach order
    tables: Vec<TrackedTable>,
    /// First write the hook could not record; later output fails with it
    failed: Option<ChangesetError>,
}

impl SessionState {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(ChangesetError::SessionClosed);
        }
        Ok(())
    }

    fn position(&self, table: &str) -> Option<usize> {
        self.tables.iter().position(|t| t.header.name == table)
    }

    fn accepts(&self, table: &str) -> bool {
        self.filter.as_ref().is_none_or(|filter| filter(table))
    }

    /// Tracked table for a write, auto-attaching in attach-all mode.
    fn tracked(&mut self, table: &str, schema: Option<&TableSchema>) -> Option<&mut TrackedTable> {
        let index = match (self.position(table), schema) {
            (Some(index), _) => index,
            (None, Some(schema)) if self.attach_all && self.accepts(table) => {
                tracing::debug!("Session auto-attaching table {}", table);
                self.tables.push(TrackedTable::new(schema));
                self.tables.len() - 1
            }
            _ => return None,
        };
        self.tables.get_mut(index)
    }

    fn record(
        &mut self,
        table: &str,
        schema: Option<&TableSchema>,
        op: OpKind,
        old: Option<Row>,
        new: Option<Row>,
        indirect: bool,
    ) -> Result<()> {
        self.ensure_open()?;
        if !self.enabled {
            return Ok(());
        }
        let indirect = indirect || self.indirect;
        let Some(table) = self.tracked(table, schema) else {
            return Ok(());
        };

        match op {
            OpKind::Insert => {
                let new = new.ok_or_else(|| missing_image(table, op, "new"))?;
                table.check_row(&new)?;
                let key = table.header.key_of(&new);
                table.merge(key, change(OpKind::Insert, None, Some(new), indirect))
            }
            OpKind::Delete => {
                let old = old.ok_or_else(|| missing_image(table, op, "old"))?;
                table.check_row(&old)?;
                let key = table.header.key_of(&old);
                table.merge(key, change(OpKind::Delete, Some(old), None, indirect))
            }
            OpKind::Update => {
                let new = new.ok_or_else(|| missing_image(table, op, "new"))?;
                table.check_row(&new)?;
                let new_key = table.header.key_of(&new);
                match old {
                    Some(old) => {
                        table.check_row(&old)?;
                        let old_key = table.header.key_of(&old);
                        if old_key != new_key {
                            // A primary key move is a delete of the old row and an insert of the new one
                            table.merge(old_key, change(OpKind::Delete, Some(old), None, indirect))?;
                            return table.merge(
                                new_key,
                                change(OpKind::Insert, None, Some(new), indirect),
                            );
                        }
                        table.merge(new_key, change(OpKind::Update, Some(old), Some(new), indirect))
                    }
                    None => table.merge(new_key, change(OpKind::Update, None, Some(new), indirect)),
                }
            }
        }
    }

    fn build(&self, kind: ChangesetKind) -> Result<Changeset> {
        self.ensure_open()?;
        if let Some(e) = &self.failed {
            return Err(e.clone());
        }
        let mut groups = Vec::with_capacity(self.tables.len());
        for table in &self.tables {
            let records = table.records(kind)?;
            if !records.is_empty() {
                groups.push(TableGroup {
                    header: table.header.clone(),
                    records,
                });
            }
        }
        Changeset::from_groups(kind, &groups)
    }
}

fn change(op: OpKind, old: Option<Row>, new: Option<Row>, indirect: bool) -> SessionChange {
    SessionChange {
        op,
        old,
        new,
        indirect,
    }
}

fn missing_image(table: &TrackedTable, op: OpKind, side: &str) -> ChangesetError {
    ChangesetError::SchemaError(format!(
        "{} on table '{}' requires a {} row",
        op, table.header.name, side
    ))
}

/// Mutation hook half of a session, shared with the database's hook list.
struct Recorder {
    state: Mutex<SessionState>,
}

impl Recorder {
    fn lock(&self) -> Result<MutexGuard<'_, SessionState>> {
        self.state
            .lock()
            .map_err(|_| ChangesetError::Db(DbError::LockPoisoned))
    }
}

impl MutationHook for Recorder {
    fn on_mutation(&self, mutation: &RowMutation) {
        let mut state = match self.lock() {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("Session dropped {} on table {}: {}", mutation.op, mutation.table, e);
                return;
            }
        };
        if state.closed || state.failed.is_some() {
            return;
        }
        let result = state.record(
            &mutation.table,
            Some(&mutation.schema),
            mutation.op,
            mutation.old.clone(),
            mutation.new.clone(),
            mutation.indirect,
        );
        if let Err(e) = result {
            tracing::warn!(
                "Session failed to record {} on table {}: {}",
                mutation.op,
                mutation.table,
                e
            );
            state.failed = Some(e);
        }
    }
}

/// Change-capture session bound to a database.
///
/// Closed explicitly with [`Session::close`] or implicitly when dropped;
/// after closing every operation fails with `SessionClosed`.
pub struct Session {
    db: Arc<Database>,
    recorder: Arc<Recorder>,
    hook: Option<HookId>,
}

impl Session {
    /// Creates a session and registers it with the database.
    pub fn create(db: &Arc<Database>, config: SessionConfig) -> Result<Self> {
        let recorder = Arc::new(Recorder {
            state: Mutex::new(SessionState {
                closed: false,
                enabled: config.enabled,
                indirect: config.indirect,
                attach_all: false,
                filter: None,
                tables: Vec::new(),
                failed: None,
            }),
        });
        let hook = db.register_hook(recorder.clone())?;
        let session = Self {
            db: db.clone(),
            recorder,
            hook: Some(hook),
        };
        if config.attach_all {
            session.attach(None)?;
        }
        tracing::debug!("Created session");
        Ok(session)
    }

    /// Starts tracking a table, or every table when `table` is `None`.
    ///
    /// Attaching all tables also tracks tables first written later, subject
    /// to the table filter.
    pub fn attach(&self, table: Option<&str>) -> Result<()> {
        let mut state = self.recorder.lock()?;
        state.ensure_open()?;
        match table {
            Some(name) => {
                if state.position(name).is_some() {
                    return Err(ChangesetError::AlreadyAttached(name.to_string()));
                }
                let schema = self.db.table_schema(name).map_err(|e| match e {
                    DbError::TableNotFound { table } => ChangesetError::UnknownTable(table),
                    other => other.into(),
                })?;
                tracing::debug!("Session attaching table {}", name);
                state.tables.push(TrackedTable::new(&schema));
            }
            None => {
                state.attach_all = true;
                for name in self.db.table_names() {
                    if state.position(&name).is_some() || !state.accepts(&name) {
                        continue;
                    }
                    let schema = self.db.table_schema(&name)?;
                    tracing::debug!("Session attaching table {}", name);
                    state.tables.push(TrackedTable::new(&schema));
                }
            }
        }
        Ok(())
    }

    /// Restricts which tables attach-all mode tracks.
    pub fn set_table_filter<F>(&self, filter: F) -> Result<()>
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        let mut state = self.recorder.lock()?;
        state.ensure_open()?;
        state.filter = Some(Box::new(filter));
        Ok(())
    }

    /// Pauses or resumes recording.
    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        let mut state = self.recorder.lock()?;
        state.ensure_open()?;
        state.enabled = enabled;
        Ok(())
    }

    /// Flags subsequently recorded changes as indirect.
    pub fn set_indirect(&self, indirect: bool) -> Result<()> {
        let mut state = self.recorder.lock()?;
        state.ensure_open()?;
        state.indirect = indirect;
        Ok(())
    }

    /// Records one row write on an attached table.
    ///
    /// Called by the mutation hook for every committed write. Hosts that
    /// deliver writes themselves may call it directly. Writes to tables that
    /// are not tracked are ignored.
    pub fn record_mutation(
        &self,
        table: &str,
        op: OpKind,
        old: Option<Row>,
        new: Option<Row>,
    ) -> Result<()> {
        let schema = self.db.table_schema(table).ok();
        let mut state = self.recorder.lock()?;
        state.ensure_open()?;
        // A dropped table stays tracked under its attach-time header
        if schema.is_none() && state.position(table).is_none() {
            return Err(ChangesetError::UnknownTable(table.to_string()));
        }
        state.record(table, schema.as_deref(), op, old, new, false)
    }

    /// Changeset of everything recorded so far. Does not clear the session.
    pub fn changeset(&self) -> Result<Changeset> {
        self.recorder.lock()?.build(ChangesetKind::Changeset)
    }

    /// Patchset of everything recorded so far: old values reduced to the key.
    pub fn patchset(&self) -> Result<Changeset> {
        self.recorder.lock()?.build(ChangesetKind::Patchset)
    }

    /// Whether no change has been recorded.
    pub fn is_empty(&self) -> Result<bool> {
        let state = self.recorder.lock()?;
        state.ensure_open()?;
        Ok(state.tables.iter().all(|t| t.len() == 0))
    }

    /// Approximate heap bytes held by recorded changes.
    pub fn memory_used(&self) -> Result<usize> {
        let state = self.recorder.lock()?;
        state.ensure_open()?;
        Ok(state.tables.iter().map(TrackedTable::memory_used).sum())
    }

    /// Tracked table names in attach order.
    pub fn tables(&self) -> Result<Vec<String>> {
        let state = self.recorder.lock()?;
        state.ensure_open()?;
        Ok(state.tables.iter().map(|t| t.header.name.clone()).collect())
    }

    /// Unregisters the session and releases recorded changes.
    pub fn close(&mut self) -> Result<()> {
        {
            let mut state = self.recorder.lock()?;
            state.ensure_open()?;
            state.closed = true;
            state.tables.clear();
            state.filter = None;
        }
        if let Some(hook) = self.hook.take() {
            self.db.unregister_hook(hook)?;
        }
        tracing::debug!("Closed session");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(hook) = self.hook.take() {
            if let Err(e) = self.db.unregister_hook(hook) {
                tracing::warn!("Failed to unregister session hook: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("open", &self.hook.is_some())
            .finish()
    }
}
