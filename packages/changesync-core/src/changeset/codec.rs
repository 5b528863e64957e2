//! Binary changeset encoding and decoding.
//!
//! Layout (all varints are unsigned LEB128):
//!
//! ```text
//! buffer  := kind:u8 ('C' | 'P') version:u8 table_count:varint group*
//! group   := name_len:varint name n_col:varint pk_mask[ceil(n_col/8)]
//!            record_count:varint record*
//! record  := op:u8 (18 INSERT, 9 DELETE, 23 UPDATE) indirect:u8 old-cells new-cells
//! cell    := 0 Absent | 1 Null | 2 i64 (8 bytes BE) | 3 f64 (8 bytes BE)
//!          | 4 len:varint utf8 | 5 len:varint bytes
//! ```
//!
//! INSERT carries `n_col` new cells, DELETE `n_col` old cells, UPDATE `n_col`
//! old cells followed by `n_col` new cells. An empty changeset is the
//! three-byte preamble with a zero table count.

use std::collections::HashSet;

use crate::error::{ChangesetError, Result};
use crate::value::Value;

use super::record::{ChangeRecord, ChangesetKind, OpKind, TableGroup, TableHeader};

/// Format version written into every buffer.
pub const FORMAT_VERSION: u8 = 1;

pub(crate) const CELL_ABSENT: u8 = 0;
pub(crate) const CELL_NULL: u8 = 1;
pub(crate) const CELL_INTEGER: u8 = 2;
pub(crate) const CELL_FLOAT: u8 = 3;
pub(crate) const CELL_TEXT: u8 = 4;
pub(crate) const CELL_BLOB: u8 = 5;

/// Appends an unsigned LEB128 varint.
pub(crate) fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Appends one tagged cell.
pub(crate) fn put_cell(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Absent => out.push(CELL_ABSENT),
        Value::Null => out.push(CELL_NULL),
        Value::Integer(v) => {
            out.push(CELL_INTEGER);
            out.extend_from_slice(&v.to_be_bytes());
        }
        Value::Float(v) => {
            out.push(CELL_FLOAT);
            out.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        Value::Text(s) => {
            out.push(CELL_TEXT);
            put_varint(out, s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Blob(b) => {
            out.push(CELL_BLOB);
            put_varint(out, b.len() as u64);
            out.extend_from_slice(b);
        }
    }
}

fn put_header(out: &mut Vec<u8>, header: &TableHeader, record_count: usize) {
    put_varint(out, header.name.len() as u64);
    out.extend_from_slice(header.name.as_bytes());
    put_varint(out, header.column_count() as u64);
    let mut mask = vec![0u8; header.column_count().div_ceil(8)];
    for (i, &pk) in header.primary_key.iter().enumerate() {
        if pk {
            mask[i / 8] |= 1 << (i % 8);
        }
    }
    out.extend_from_slice(&mask);
    put_varint(out, record_count as u64);
}

fn check_width(header: &TableHeader, cells: &[Value], side: &str) -> Result<()> {
    if cells.len() != header.column_count() {
        return Err(ChangesetError::SchemaError(format!(
            "table '{}' has {} columns, {} record has {} {} cells",
            header.name,
            header.column_count(),
            side,
            cells.len(),
            side
        )));
    }
    Ok(())
}

/// Cell rules every record must satisfy, on both the encode and decode side.
fn check_cells(
    header: &TableHeader,
    kind: ChangesetKind,
    record: &ChangeRecord,
) -> std::result::Result<(), String> {
    let op = record.op;
    if op == OpKind::Insert && record.new.iter().any(Value::is_absent) {
        return Err("INSERT record with absent cell".to_string());
    }
    if op.has_old() {
        let pk_absent = record
            .old
            .iter()
            .zip(&header.primary_key)
            .any(|(v, &pk)| pk && v.is_absent());
        if pk_absent {
            return Err(format!("{} record without primary key", op));
        }
    }
    if op == OpKind::Delete
        && kind == ChangesetKind::Changeset
        && record.old.iter().any(Value::is_absent)
    {
        return Err("DELETE record with absent cell".to_string());
    }
    Ok(())
}

fn put_record(
    out: &mut Vec<u8>,
    header: &TableHeader,
    kind: ChangesetKind,
    record: &ChangeRecord,
) -> Result<()> {
    out.push(record.op.tag());
    out.push(u8::from(record.indirect));
    if record.op.has_old() {
        check_width(header, &record.old, "old")?;
        record.old.iter().for_each(|v| put_cell(out, v));
    }
    if record.op.has_new() {
        check_width(header, &record.new, "new")?;
        record.new.iter().for_each(|v| put_cell(out, v));
    }
    check_cells(header, kind, record).map_err(|reason| {
        ChangesetError::SchemaError(format!("table '{}': {}", header.name, reason))
    })
}

/// Serializes table groups into a changeset or patchset buffer.
///
/// Groups are written in the given order; groups without records are
/// skipped. Fails with `SchemaError` on anything [`decode`] would reject: a
/// table named twice, a header without a primary key, a record whose width
/// does not match its header, or a record with absent cells where values
/// are required.
pub fn encode(kind: ChangesetKind, groups: &[TableGroup]) -> Result<Vec<u8>> {
    let mut out = vec![kind.marker(), FORMAT_VERSION];
    let non_empty: Vec<&TableGroup> = groups.iter().filter(|g| !g.records.is_empty()).collect();
    put_varint(&mut out, non_empty.len() as u64);
    let mut seen = HashSet::new();
    for group in non_empty {
        let name = &group.header.name;
        if group.header.column_count() == 0 {
            return Err(ChangesetError::SchemaError(format!(
                "table '{}' has no columns",
                name
            )));
        }
        if !group.header.primary_key.iter().any(|&pk| pk) {
            return Err(ChangesetError::SchemaError(format!(
                "table '{}' has no primary key column",
                name
            )));
        }
        if !seen.insert(name.as_str()) {
            return Err(ChangesetError::SchemaError(format!(
                "table '{}' appears in more than one group",
                name
            )));
        }
        put_header(&mut out, &group.header, group.records.len());
        for record in &group.records {
            put_record(&mut out, &group.header, kind, record)?;
        }
    }
    Ok(out)
}

/// Decodes and structurally validates a buffer.
pub fn decode(data: &[u8]) -> Result<(ChangesetKind, Vec<TableGroup>)> {
    let mut reader = Reader::new(data);
    let (kind, table_count) = reader.preamble()?;
    let mut seen = HashSet::new();
    let mut groups = Vec::new();
    for _ in 0..table_count {
        let header_offset = reader.pos();
        let (header, record_count) = reader.table_header()?;
        if !seen.insert(header.name.clone()) {
            return Err(ChangesetError::corrupt(
                header_offset,
                format!("table '{}' appears in more than one group", header.name),
            ));
        }
        let mut group = TableGroup::new(header);
        for _ in 0..record_count {
            let record = reader.record(&group.header, kind)?;
            group.records.push(record);
        }
        groups.push(group);
    }
    reader.finish()?;
    Ok((kind, groups))
}

/// Cursor over an encoded buffer.
#[derive(Debug, Clone)]
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Fails if bytes remain after the last group.
    pub(crate) fn finish(&self) -> Result<()> {
        if self.remaining() > 0 {
            return Err(ChangesetError::corrupt(
                self.pos,
                format!("{} trailing bytes", self.remaining()),
            ));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| ChangesetError::corrupt(self.pos, "truncated buffer"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(ChangesetError::corrupt(self.pos, "truncated buffer"));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn varint(&mut self) -> Result<u64> {
        let start = self.pos;
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.u8()?;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ChangesetError::corrupt(start, "varint overflow"))
    }

    /// A varint used as a length, bounded by the bytes left in the buffer.
    fn length(&mut self, what: &str) -> Result<usize> {
        let start = self.pos;
        let len = self.varint()?;
        if len > self.remaining() as u64 {
            return Err(ChangesetError::corrupt(
                start,
                format!("{} length {} exceeds buffer", what, len),
            ));
        }
        Ok(len as usize)
    }

    pub(crate) fn preamble(&mut self) -> Result<(ChangesetKind, u64)> {
        let marker = self.u8()?;
        let kind = ChangesetKind::from_marker(marker)
            .ok_or_else(|| ChangesetError::corrupt(0, format!("unknown kind byte {:#04x}", marker)))?;
        let version = self.u8()?;
        if version != FORMAT_VERSION {
            return Err(ChangesetError::corrupt(
                1,
                format!("unsupported format version {}", version),
            ));
        }
        let table_count = self.varint()?;
        Ok((kind, table_count))
    }

    pub(crate) fn table_header(&mut self) -> Result<(TableHeader, u64)> {
        let name_len = self.length("table name")?;
        let name_offset = self.pos;
        let name = std::str::from_utf8(self.bytes(name_len)?)
            .map_err(|_| ChangesetError::corrupt(name_offset, "table name is not UTF-8"))?
            .to_string();

        let count_offset = self.pos;
        let n_col = self.varint()?;
        if n_col == 0 || n_col.div_ceil(8) > self.remaining() as u64 {
            return Err(ChangesetError::corrupt(
                count_offset,
                format!("invalid column count {} for table '{}'", n_col, name),
            ));
        }
        let n_col = n_col as usize;

        let mask_offset = self.pos;
        let mask = self.bytes(n_col.div_ceil(8))?;
        let primary_key: Vec<bool> = (0..n_col)
            .map(|i| mask[i / 8] & (1 << (i % 8)) != 0)
            .collect();
        let spare_bits = (n_col..mask.len() * 8).any(|i| mask[i / 8] & (1 << (i % 8)) != 0);
        if spare_bits {
            return Err(ChangesetError::corrupt(
                mask_offset,
                format!(
                    "primary key mask does not match column count {} for table '{}'",
                    n_col, name
                ),
            ));
        }
        if !primary_key.iter().any(|&pk| pk) {
            return Err(ChangesetError::corrupt(
                mask_offset,
                format!("table '{}' has no primary key column", name),
            ));
        }

        let record_count = self.varint()?;
        Ok((TableHeader { name, primary_key }, record_count))
    }

    fn cell(&mut self) -> Result<Value> {
        let offset = self.pos;
        match self.u8()? {
            CELL_ABSENT => Ok(Value::Absent),
            CELL_NULL => Ok(Value::Null),
            CELL_INTEGER => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(self.bytes(8)?);
                Ok(Value::Integer(i64::from_be_bytes(buf)))
            }
            CELL_FLOAT => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(self.bytes(8)?);
                Ok(Value::Float(f64::from_bits(u64::from_be_bytes(buf))))
            }
            CELL_TEXT => {
                let len = self.length("text")?;
                let text = std::str::from_utf8(self.bytes(len)?)
                    .map_err(|_| ChangesetError::corrupt(offset, "text cell is not UTF-8"))?;
                Ok(Value::Text(text.to_string()))
            }
            CELL_BLOB => {
                let len = self.length("blob")?;
                Ok(Value::Blob(self.bytes(len)?.to_vec()))
            }
            tag => Err(ChangesetError::corrupt(
                offset,
                format!("unknown cell type tag {}", tag),
            )),
        }
    }

    fn cells(&mut self, n_col: usize) -> Result<Vec<Value>> {
        // Each cell takes at least one byte
        if n_col > self.remaining() {
            return Err(ChangesetError::corrupt(self.pos, "truncated buffer"));
        }
        (0..n_col).map(|_| self.cell()).collect()
    }

    pub(crate) fn record(&mut self, header: &TableHeader, kind: ChangesetKind) -> Result<ChangeRecord> {
        let offset = self.pos;
        let tag = self.u8()?;
        let op = OpKind::from_tag(tag)
            .ok_or_else(|| ChangesetError::corrupt(offset, format!("unknown op tag {}", tag)))?;
        let indirect = match self.u8()? {
            0 => false,
            1 => true,
            flag => {
                return Err(ChangesetError::corrupt(
                    offset + 1,
                    format!("invalid indirect flag {}", flag),
                ))
            }
        };

        let n_col = header.column_count();
        let old = if op.has_old() { self.cells(n_col)? } else { Vec::new() };
        let new = if op.has_new() { self.cells(n_col)? } else { Vec::new() };

        let record = ChangeRecord {
            op,
            indirect,
            old,
            new,
        };
        check_cells(header, kind, &record).map_err(|reason| ChangesetError::corrupt(offset, reason))?;
        Ok(record)
    }
}
