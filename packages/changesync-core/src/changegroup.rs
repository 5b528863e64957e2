//! Changegroup: folds several changesets into one minimal changeset.

use std::collections::HashMap;

use crate::changeset::{codec, ChangeRecord, Changeset, ChangesetKind, OpKind, TableGroup, TableHeader};
use crate::error::{ChangesetError, Result};
use crate::value::{RowKey, Value};

#[derive(Debug, Clone)]
struct GroupTable {
    header: TableHeader,
    slots: Vec<Option<ChangeRecord>>,
    index: HashMap<RowKey, usize>,
}

impl GroupTable {
    fn new(header: TableHeader) -> Self {
        Self {
            header,
            slots: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Live record held for a row.
    fn get(&self, key: &RowKey) -> Option<&ChangeRecord> {
        self.index
            .get(key)
            .and_then(|&slot| self.slots[slot].as_ref())
    }

    /// Installs the folds staged by one `add` call.
    ///
    /// A row that gained a record after having none moves to the end, the
    /// same place a fresh record would take.
    fn commit(&mut self, mut staged: PendingFolds) {
        for key in &staged.appended {
            if let Some(slot) = self.index.remove(key) {
                self.slots[slot] = None;
            }
        }
        for key in staged.appended {
            if let Some(Some(record)) = staged.rows.remove(&key) {
                self.index.insert(key, self.slots.len());
                self.slots.push(Some(record));
            }
        }
        for (key, record) in staged.rows {
            let Some(&slot) = self.index.get(&key) else {
                continue;
            };
            if record.is_none() {
                self.index.remove(&key);
            }
            self.slots[slot] = record;
        }
    }
}

/// Folds of one table from a single `add` call, kept apart from the group
/// until every record of the call has folded.
#[derive(Debug, Default)]
struct PendingFolds {
    /// Latest record per touched row; `None` once its changes cancel out
    rows: HashMap<RowKey, Option<ChangeRecord>>,
    /// Rows that had no live record when their latest one arrived, in order
    appended: Vec<RowKey>,
}

impl PendingFolds {
    fn fold(
        &mut self,
        kind: ChangesetKind,
        header: &TableHeader,
        committed: Option<&GroupTable>,
        record: ChangeRecord,
    ) -> Result<()> {
        let key = record.key(header);
        let touched = self.rows.contains_key(&key);
        let current = match self.rows.get(&key) {
            Some(staged) => staged.as_ref(),
            None => committed.and_then(|table| table.get(&key)),
        };
        let next = match current {
            Some(existing) => merge_records(kind, header, existing, record)?,
            None => {
                if touched {
                    self.appended.retain(|k| k != &key);
                }
                self.appended.push(key.clone());
                Some(record)
            }
        };
        self.rows.insert(key, next);
        Ok(())
    }
}

/// Accumulates changesets keyed by table and primary key.
///
/// Two records for the same row combine as follows:
///
/// | first  | second | result                                        |
/// |--------|--------|-----------------------------------------------|
/// | INSERT | UPDATE | INSERT with the updated values                |
/// | INSERT | DELETE | nothing                                       |
/// | UPDATE | UPDATE | UPDATE, old from the first, new from the last |
/// | UPDATE | DELETE | DELETE of the original row                    |
/// | DELETE | INSERT | UPDATE, or nothing if the row is unchanged    |
///
/// Any other pair fails with `SchemaConflict`.
#[derive(Debug, Clone, Default)]
pub struct Changegroup {
    kind: Option<ChangesetKind>,
    /// Tables in first-seen order
    tables: Vec<GroupTable>,
}

impl Changegroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a changeset or patchset and folds it into the group.
    ///
    /// Either every record is folded or, on error, the group is unchanged.
    pub fn add(&mut self, changeset: impl AsRef<[u8]>) -> Result<()> {
        let (kind, groups) = codec::decode(changeset.as_ref())?;

        if let Some(existing) = self.kind {
            if existing != kind {
                return Err(ChangesetError::SchemaConflict {
                    table: groups.first().map(|g| g.header.name.clone()).unwrap_or_default(),
                    reason: "cannot combine changesets and patchsets".to_string(),
                });
            }
        }
        for group in &groups {
            if let Some(table) = self.table(&group.header.name) {
                if table.header != group.header {
                    return Err(ChangesetError::SchemaError(format!(
                        "table '{}' has a different column count or primary key",
                        group.header.name
                    )));
                }
            }
        }

        // Decoding rejects repeated groups, so each group stages a distinct table
        let mut records = 0;
        let mut staged = Vec::with_capacity(groups.len());
        for group in groups {
            let committed = self.table(&group.header.name);
            let mut folds = PendingFolds::default();
            for record in group.records {
                records += 1;
                folds.fold(kind, &group.header, committed, record)?;
            }
            staged.push((group.header, folds));
        }

        self.kind = Some(kind);
        for (header, folds) in staged {
            let index = match self.tables.iter().position(|t| t.header.name == header.name) {
                Some(index) => index,
                None => {
                    self.tables.push(GroupTable::new(header));
                    self.tables.len() - 1
                }
            };
            self.tables[index].commit(folds);
        }
        tracing::debug!("Folded {} records into changegroup", records);
        Ok(())
    }

    fn table(&self, name: &str) -> Option<&GroupTable> {
        self.tables.iter().find(|t| t.header.name == name)
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.tables.iter().map(|t| t.index.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encodes the combined changes as one changeset.
    pub fn output(&self) -> Result<Changeset> {
        let kind = self.kind.unwrap_or(ChangesetKind::Changeset);
        let groups: Vec<TableGroup> = self
            .tables
            .iter()
            .map(|table| TableGroup {
                header: table.header.clone(),
                records: table.slots.iter().flatten().cloned().collect(),
            })
            .collect();
        Changeset::from_groups(kind, &groups)
    }
}

/// Combines two records for the same row. `None` means they cancel out.
pub(crate) fn merge_records(
    kind: ChangesetKind,
    header: &TableHeader,
    first: &ChangeRecord,
    second: ChangeRecord,
) -> Result<Option<ChangeRecord>> {
    let indirect = first.indirect && second.indirect;
    let merged = match (first.op, second.op) {
        (OpKind::Insert, OpKind::Update) => {
            let new = overlay(&first.new, &second.new);
            Some(ChangeRecord::insert(new))
        }
        (OpKind::Insert, OpKind::Delete) => None,
        (OpKind::Update, OpKind::Update) => {
            let old = overlay(&second.old, &first.old);
            let new = overlay(&first.new, &second.new);
            collapse_update(header, old, new)
        }
        (OpKind::Update, OpKind::Delete) => {
            let old = match kind {
                ChangesetKind::Changeset => overlay(&second.old, &first.old),
                ChangesetKind::Patchset => first.old.clone(),
            };
            Some(ChangeRecord::delete(old))
        }
        (OpKind::Delete, OpKind::Insert) => {
            let mut old = first.old.clone();
            let mut new = second.new;
            for (i, pk) in header.primary_key.iter().enumerate() {
                if *pk {
                    new[i] = Value::Absent;
                }
            }
            if kind == ChangesetKind::Patchset {
                // Only the key of the deleted row is known
                old.iter_mut()
                    .zip(&header.primary_key)
                    .filter(|(_, pk)| !**pk)
                    .for_each(|(cell, _)| *cell = Value::Absent);
            }
            collapse_update(header, old, new)
        }
        (a, b) => {
            return Err(ChangesetError::SchemaConflict {
                table: header.name.clone(),
                reason: format!("cannot combine {} followed by {} for the same row", a, b),
            })
        }
    };
    Ok(merged.map(|record| record.with_indirect(indirect)))
}

/// `top` cells where present, `base` cells elsewhere.
fn overlay(base: &[Value], top: &[Value]) -> Vec<Value> {
    base.iter()
        .zip(top)
        .map(|(b, t)| if t.is_absent() { b.clone() } else { t.clone() })
        .collect()
}

/// Clears non-key columns whose value did not change; drops the UPDATE if
/// none changed.
fn collapse_update(header: &TableHeader, mut old: Vec<Value>, mut new: Vec<Value>) -> Option<ChangeRecord> {
    let mut changed = false;
    for i in 0..header.column_count() {
        if header.is_primary_key(i) {
            new[i] = Value::Absent;
            continue;
        }
        if new[i].is_absent() {
            old[i] = Value::Absent;
        } else if !old[i].is_absent() && old[i] == new[i] {
            old[i] = Value::Absent;
            new[i] = Value::Absent;
        } else {
            changed = true;
        }
    }
    changed.then(|| ChangeRecord::update(old, new))
}
