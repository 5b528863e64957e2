use std::collections::HashSet;

use crate::error::{ChangesetError, Result};
use crate::value::{Row, Value};

use super::codec::Reader;
use super::record::{ChangeRecord, ChangesetKind, OpKind, TableHeader};

/// Lazy single-pass cursor over an encoded changeset or patchset.
///
/// The iterator borrows the buffer and decodes one record per call to
/// [`ChangeIter::next`]. Structural errors surface at the record where they
/// occur. Restarting requires a fresh iterator over the same buffer.
#[derive(Debug, Clone)]
pub struct ChangeIter<'a> {
    reader: Reader<'a>,
    kind: ChangesetKind,
    tables_left: u64,
    records_left: u64,
    seen_tables: HashSet<String>,
    header: Option<TableHeader>,
    current: Option<ChangeRecord>,
    /// Target row for the conflict being reported
    conflict: Option<Row>,
    /// Outstanding foreign key violations for a deferred-check conflict
    fk_conflicts: usize,
    finished: bool,
}

impl<'a> ChangeIter<'a> {
    /// Starts iterating a buffer, validating its preamble.
    pub fn start(data: &'a [u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let (kind, tables_left) = reader.preamble()?;
        Ok(Self {
            reader,
            kind,
            tables_left,
            records_left: 0,
            seen_tables: HashSet::new(),
            header: None,
            current: None,
            conflict: None,
            fk_conflicts: 0,
            finished: false,
        })
    }

    /// Changeset or patchset.
    pub fn kind(&self) -> ChangesetKind {
        self.kind
    }

    /// Advances to the next record. Returns `false` at end of sequence.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<bool> {
        self.current = None;
        self.conflict = None;
        if self.finished {
            return Ok(false);
        }

        while self.records_left == 0 {
            if self.tables_left == 0 {
                self.reader.finish()?;
                self.finished = true;
                self.header = None;
                return Ok(false);
            }
            let offset = self.reader.pos();
            let (header, record_count) = self.reader.table_header()?;
            if !self.seen_tables.insert(header.name.clone()) {
                return Err(ChangesetError::corrupt(
                    offset,
                    format!("table '{}' appears in more than one group", header.name),
                ));
            }
            self.tables_left -= 1;
            self.records_left = record_count;
            self.header = Some(header);
        }

        let header = self
            .header
            .as_ref()
            .ok_or_else(|| ChangesetError::corrupt(self.reader.pos(), "record outside a table group"))?;
        let record = self.reader.record(header, self.kind)?;
        self.records_left -= 1;
        self.current = Some(record);
        Ok(true)
    }

    /// Header of the table the current record belongs to.
    pub fn header(&self) -> Option<&TableHeader> {
        self.header.as_ref()
    }

    /// Current record, if positioned on one.
    pub fn current(&self) -> Option<&ChangeRecord> {
        self.current.as_ref()
    }

    /// Table name, column count, op kind and indirect flag of the current record.
    pub fn op(&self) -> Result<(&str, usize, OpKind, bool)> {
        let (header, record) = self.positioned()?;
        Ok((
            header.name.as_str(),
            header.column_count(),
            record.op,
            record.indirect,
        ))
    }

    /// Primary-key flags of the current table.
    pub fn pk(&self) -> Result<&[bool]> {
        Ok(&self.positioned()?.0.primary_key)
    }

    /// Old-row cell of the current record.
    ///
    /// Fails with `InvalidColumn` when the index is out of range or the
    /// record is an INSERT.
    pub fn old(&self, index: usize) -> Result<&Value> {
        let (_, record) = self.positioned_at(index)?;
        if !record.op.has_old() {
            return Err(ChangesetError::InvalidColumn {
                index,
                reason: "INSERT has no old values",
            });
        }
        Ok(&record.old[index])
    }

    /// New-row cell of the current record.
    ///
    /// Fails with `InvalidColumn` when the index is out of range or the
    /// record is a DELETE.
    pub fn new(&self, index: usize) -> Result<&Value> {
        let (_, record) = self.positioned_at(index)?;
        if !record.op.has_new() {
            return Err(ChangesetError::InvalidColumn {
                index,
                reason: "DELETE has no new values",
            });
        }
        Ok(&record.new[index])
    }

    /// Cell of the conflicting target row while a conflict handler runs.
    pub fn conflict(&self, index: usize) -> Result<&Value> {
        let row = self.conflict.as_ref().ok_or(ChangesetError::InvalidColumn {
            index,
            reason: "no conflicting row",
        })?;
        row.get(index).ok_or(ChangesetError::InvalidColumn {
            index,
            reason: "column index out of range",
        })
    }

    /// Conflicting target row while a conflict handler runs.
    pub fn conflict_row(&self) -> Option<&[Value]> {
        self.conflict.as_deref()
    }

    /// Number of outstanding foreign key violations during a deferred check.
    pub fn fk_conflicts(&self) -> usize {
        self.fk_conflicts
    }

    pub(crate) fn set_conflict(&mut self, row: Option<Row>) {
        self.conflict = row;
    }

    pub(crate) fn set_fk_conflicts(&mut self, count: usize) {
        self.fk_conflicts = count;
    }

    fn positioned(&self) -> Result<(&TableHeader, &ChangeRecord)> {
        match (&self.header, &self.current) {
            (Some(header), Some(record)) => Ok((header, record)),
            _ => Err(ChangesetError::NotSupported(
                "iterator is not positioned on a change".to_string(),
            )),
        }
    }

    fn positioned_at(&self, index: usize) -> Result<(&TableHeader, &ChangeRecord)> {
        let (header, record) = self.positioned()?;
        if index >= header.column_count() {
            return Err(ChangesetError::InvalidColumn {
                index,
                reason: "column index out of range",
            });
        }
        Ok((header, record))
    }
}
