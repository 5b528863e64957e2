use serde::{Deserialize, Serialize};

use crate::changegroup::Changegroup;
use crate::error::{ChangesetError, Result};
use crate::value::Value;

use super::codec;
use super::iter::ChangeIter;
use super::record::{ChangeRecord, ChangesetKind, OpKind, TableGroup};

/// Immutable, validated changeset or patchset buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct Changeset {
    kind: ChangesetKind,
    data: Vec<u8>,
    record_count: usize,
}

impl Changeset {
    /// Wraps an encoded buffer after structural validation.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let (kind, groups) = codec::decode(&data)?;
        let record_count = groups.iter().map(|g| g.records.len()).sum();
        Ok(Self {
            kind,
            data,
            record_count,
        })
    }

    /// Encodes table groups, rejecting any group or record that
    /// [`Changeset::from_bytes`] would reject.
    pub fn from_groups(kind: ChangesetKind, groups: &[TableGroup]) -> Result<Self> {
        let data = codec::encode(kind, groups)?;
        let record_count = groups.iter().map(|g| g.records.len()).sum();
        Ok(Self {
            kind,
            data,
            record_count,
        })
    }

    /// A buffer with no records.
    pub fn empty(kind: ChangesetKind) -> Self {
        Self {
            kind,
            data: vec![kind.marker(), codec::FORMAT_VERSION, 0],
            record_count: 0,
        }
    }

    pub fn kind(&self) -> ChangesetKind {
        self.kind
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Encoded size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer holds no records.
    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// Decodes all table groups.
    pub fn groups(&self) -> Result<Vec<TableGroup>> {
        Ok(codec::decode(&self.data)?.1)
    }

    /// Lazy iterator over the records.
    pub fn iter(&self) -> Result<ChangeIter<'_>> {
        ChangeIter::start(&self.data)
    }

    /// Returns the changeset that undoes this one.
    ///
    /// INSERT and DELETE swap, UPDATE swaps its old and new values. Patchsets
    /// lack the old values needed and fail with `NotSupported`.
    pub fn invert(&self) -> Result<Changeset> {
        if self.kind == ChangesetKind::Patchset {
            return Err(ChangesetError::NotSupported(
                "patchsets cannot be inverted".to_string(),
            ));
        }
        let groups: Vec<TableGroup> = self
            .groups()?
            .into_iter()
            .map(|group| {
                let records = group
                    .records
                    .into_iter()
                    .map(|record| invert_record(&group.header.primary_key, record))
                    .collect();
                TableGroup {
                    header: group.header,
                    records,
                }
            })
            .collect();
        Changeset::from_groups(ChangesetKind::Changeset, &groups)
    }

    /// Combines this changeset with a later one into a single minimal changeset.
    pub fn concat(&self, other: &Changeset) -> Result<Changeset> {
        let mut group = Changegroup::new();
        group.add(self)?;
        group.add(other)?;
        group.output()
    }
}

fn invert_record(primary_key: &[bool], record: ChangeRecord) -> ChangeRecord {
    let indirect = record.indirect;
    let inverted = match record.op {
        OpKind::Insert => ChangeRecord::delete(record.new),
        OpKind::Delete => ChangeRecord::insert(record.old),
        OpKind::Update => {
            let old = record
                .old
                .iter()
                .zip(&record.new)
                .zip(primary_key)
                .map(|((old, new), &pk)| if pk { old.clone() } else { new.clone() })
                .collect();
            let new = record
                .old
                .into_iter()
                .zip(&record.new)
                .zip(primary_key)
                .map(|((old, new), &pk)| {
                    if pk || new.is_absent() {
                        Value::Absent
                    } else {
                        old
                    }
                })
                .collect();
            ChangeRecord::update(old, new)
        }
    };
    inverted.with_indirect(indirect)
}

impl AsRef<[u8]> for Changeset {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl TryFrom<Vec<u8>> for Changeset {
    type Error = ChangesetError;

    fn try_from(data: Vec<u8>) -> Result<Self> {
        Changeset::from_bytes(data)
    }
}

impl From<Changeset> for Vec<u8> {
    fn from(changeset: Changeset) -> Self {
        changeset.data
    }
}
