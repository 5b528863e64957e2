//! Change records and table headers.

use serde::{Deserialize, Serialize};

use crate::value::{RowKey, Value};

/// Kind of row-level mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

impl OpKind {
    pub(crate) const INSERT_TAG: u8 = 18;
    pub(crate) const DELETE_TAG: u8 = 9;
    pub(crate) const UPDATE_TAG: u8 = 23;

    /// Stable wire tag.
    pub fn tag(self) -> u8 {
        match self {
            OpKind::Insert => Self::INSERT_TAG,
            OpKind::Update => Self::UPDATE_TAG,
            OpKind::Delete => Self::DELETE_TAG,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            Self::INSERT_TAG => Some(OpKind::Insert),
            Self::UPDATE_TAG => Some(OpKind::Update),
            Self::DELETE_TAG => Some(OpKind::Delete),
            _ => None,
        }
    }

    /// Whether the record carries old-row cells.
    pub fn has_old(self) -> bool {
        matches!(self, OpKind::Update | OpKind::Delete)
    }

    /// Whether the record carries new-row cells.
    pub fn has_new(self) -> bool {
        matches!(self, OpKind::Insert | OpKind::Update)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Insert => "INSERT",
            OpKind::Update => "UPDATE",
            OpKind::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full changeset (old values present) or patchset (old values reduced to the key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangesetKind {
    Changeset,
    Patchset,
}

impl ChangesetKind {
    pub(crate) fn marker(self) -> u8 {
        match self {
            ChangesetKind::Changeset => b'C',
            ChangesetKind::Patchset => b'P',
        }
    }

    pub(crate) fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            b'C' => Some(ChangesetKind::Changeset),
            b'P' => Some(ChangesetKind::Patchset),
            _ => None,
        }
    }
}

/// Table header preceding a group of records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableHeader {
    /// Table name
    pub name: String,
    /// Primary-key flag per column; its length is the column count
    pub primary_key: Vec<bool>,
}

impl TableHeader {
    pub fn new(name: impl Into<String>, primary_key: Vec<bool>) -> Self {
        Self {
            name: name.into(),
            primary_key,
        }
    }

    pub fn column_count(&self) -> usize {
        self.primary_key.len()
    }

    pub fn is_primary_key(&self, index: usize) -> bool {
        self.primary_key.get(index).copied().unwrap_or(false)
    }

    /// Key of a full-width cell list.
    pub fn key_of(&self, cells: &[Value]) -> RowKey {
        RowKey::from_row(&self.primary_key, cells)
    }

    /// Primary-key cells of a full-width cell list.
    pub fn primary_key_values(&self, cells: &[Value]) -> Vec<Value> {
        cells
            .iter()
            .zip(&self.primary_key)
            .filter_map(|(v, &pk)| pk.then(|| v.clone()))
            .collect()
    }
}

/// One row-level mutation.
///
/// `old` holds one cell per column for UPDATE and DELETE and is empty for
/// INSERT; `new` holds one cell per column for INSERT and UPDATE and is
/// empty for DELETE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub op: OpKind,
    pub indirect: bool,
    pub old: Vec<Value>,
    pub new: Vec<Value>,
}

impl ChangeRecord {
    pub fn insert(new: Vec<Value>) -> Self {
        Self {
            op: OpKind::Insert,
            indirect: false,
            old: Vec::new(),
            new,
        }
    }

    pub fn update(old: Vec<Value>, new: Vec<Value>) -> Self {
        Self {
            op: OpKind::Update,
            indirect: false,
            old,
            new,
        }
    }

    pub fn delete(old: Vec<Value>) -> Self {
        Self {
            op: OpKind::Delete,
            indirect: false,
            old,
            new: Vec::new(),
        }
    }

    pub fn with_indirect(mut self, indirect: bool) -> Self {
        self.indirect = indirect;
        self
    }

    /// Cells that identify the row: new cells for INSERT, old cells otherwise.
    pub fn key_cells(&self) -> &[Value] {
        match self.op {
            OpKind::Insert => &self.new,
            OpKind::Update | OpKind::Delete => &self.old,
        }
    }

    /// Key of the row this record applies to.
    pub fn key(&self, header: &TableHeader) -> RowKey {
        header.key_of(self.key_cells())
    }

    /// Approximate in-memory payload size.
    pub fn byte_size(&self) -> usize {
        self.old
            .iter()
            .chain(&self.new)
            .map(Value::byte_size)
            .sum()
    }
}

/// All records of one table, preceded by its header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableGroup {
    pub header: TableHeader,
    pub records: Vec<ChangeRecord>,
}

impl TableGroup {
    pub fn new(header: TableHeader) -> Self {
        Self {
            header,
            records: Vec::new(),
        }
    }
}
