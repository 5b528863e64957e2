//! Apply engine: replays a changeset against a database inside one
//! transaction, routing conflicts through a caller-supplied handler.

use std::collections::HashMap;
use std::fmt;

use crate::changeset::{ChangeIter, ChangeRecord, Changeset, OpKind, TableHeader};
use crate::config::ApplyConfig;
use crate::database::Database;
use crate::error::{ChangesetError, DbError, Result};
use crate::transaction::Transaction;
use crate::value::{Row, Value};

/// Why a record could not be applied as recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    /// Target row differs from the record's old values, or an inserted key exists
    Data,
    /// Target row expected to exist does not
    Missing,
    /// NOT NULL or UNIQUE rule violated
    Constraint,
    /// Deferred foreign key check failed at the end of apply
    ForeignKey,
}

impl ConflictKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictKind::Data => "DATA",
            ConflictKind::Missing => "MISSING",
            ConflictKind::Constraint => "CONSTRAINT",
            ConflictKind::ForeignKey => "FOREIGN_KEY",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conflict handler decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// Skip the record and continue
    Omit,
    /// Force the record over the conflicting row (`Data` conflicts only)
    Replace,
    /// Stop and roll back everything applied by this call
    Abort,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Omit => "OMIT",
            Resolution::Replace => "REPLACE",
            Resolution::Abort => "ABORT",
        }
    }
}

/// Per-call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    /// Records applied as recorded
    pub applied: usize,
    /// Records rejected by the table filter or skipped as no-op updates
    pub skipped: usize,
    /// Conflicting records resolved with `Omit`
    pub omitted: usize,
    /// Conflicting records forced with `Replace`
    pub replaced: usize,
}

/// Result of a completed apply call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Changes committed as a single transaction
    Committed(ApplyStats),
    /// Conflict handler aborted; the target is unchanged. `record` is the
    /// zero-based index of the record being applied, or `None` when the
    /// abort came from the deferred foreign key check.
    Aborted { record: Option<usize> },
}

impl ApplyOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, ApplyOutcome::Aborted { .. })
    }

    pub fn stats(&self) -> Option<&ApplyStats> {
        match self {
            ApplyOutcome::Committed(stats) => Some(stats),
            ApplyOutcome::Aborted { .. } => None,
        }
    }
}

enum Attempt {
    Applied,
    Noop,
    Conflict(ConflictKind, Option<Row>),
}

/// Applies a changeset with the default configuration.
///
/// # Arguments
/// * `db` - Target database
/// * `changeset` - Changeset or patchset to replay
/// * `filter` - Returns `false` for tables whose records are skipped
/// * `on_conflict` - Decides how each conflict is resolved
pub fn apply<F, C>(db: &Database, changeset: &Changeset, filter: F, on_conflict: C) -> Result<ApplyOutcome>
where
    F: FnMut(&str) -> bool,
    C: FnMut(ConflictKind, &ChangeIter<'_>) -> Resolution,
{
    apply_with_config(db, changeset, filter, on_conflict, &ApplyConfig::default())
}

/// Applies a changeset.
///
/// Records are replayed in order inside one transaction. Structural errors
/// (unknown table, schema mismatch, corrupt buffer) and invalid resolutions
/// fail the call; in every failing or aborted case the target is left as it
/// was before the call.
pub fn apply_with_config<F, C>(
    db: &Database,
    changeset: &Changeset,
    mut filter: F,
    mut on_conflict: C,
    config: &ApplyConfig,
) -> Result<ApplyOutcome>
where
    F: FnMut(&str) -> bool,
    C: FnMut(ConflictKind, &ChangeIter<'_>) -> Resolution,
{
    let inverted;
    let source = if config.invert {
        inverted = changeset.invert()?;
        &inverted
    } else {
        changeset
    };

    let mut tx = db.begin()?;
    let mut iter = source.iter()?;
    let mut stats = ApplyStats::default();
    let mut checked: HashMap<String, bool> = HashMap::new();
    let mut index = 0usize;

    while iter.next()? {
        let record_index = index;
        index += 1;
        let (Some(header), Some(record)) = (iter.header().cloned(), iter.current().cloned()) else {
            break;
        };

        let accepted = match checked.get(&header.name) {
            Some(&accepted) => accepted,
            None => {
                let accepted = filter(&header.name);
                if accepted {
                    check_schema(db, &header)?;
                }
                checked.insert(header.name.clone(), accepted);
                accepted
            }
        };
        if !accepted {
            stats.skipped += 1;
            continue;
        }

        tx.set_indirect(record.indirect);
        let mut force = false;
        loop {
            match attempt(&mut tx, &header, &record, config, force)? {
                Attempt::Applied if force => {
                    stats.replaced += 1;
                    break;
                }
                Attempt::Applied => {
                    stats.applied += 1;
                    break;
                }
                Attempt::Noop => {
                    stats.skipped += 1;
                    break;
                }
                Attempt::Conflict(kind, row) => {
                    iter.set_conflict(row);
                    let resolution = on_conflict(kind, &iter);
                    iter.set_conflict(None);
                    tracing::warn!(
                        "{} conflict on {} of table {} (record {}) resolved as {}",
                        kind,
                        record.op,
                        header.name,
                        record_index,
                        resolution.as_str()
                    );
                    match resolution {
                        Resolution::Omit => {
                            stats.omitted += 1;
                            break;
                        }
                        Resolution::Abort => {
                            tx.rollback();
                            tracing::warn!("Apply aborted at record {}, rolled back", record_index);
                            return Ok(ApplyOutcome::Aborted {
                                record: Some(record_index),
                            });
                        }
                        Resolution::Replace if kind == ConflictKind::Data && !force => {
                            force = true;
                        }
                        Resolution::Replace => {
                            return Err(ChangesetError::InvalidResolution {
                                conflict: kind.as_str(),
                                resolution: resolution.as_str(),
                            });
                        }
                    }
                }
            }
        }
    }

    let violations = tx.foreign_key_violations()?;
    if violations > 0 {
        let mut fk_iter = source.iter()?;
        fk_iter.set_fk_conflicts(violations);
        let resolution = on_conflict(ConflictKind::ForeignKey, &fk_iter);
        tracing::warn!(
            "{} foreign key violation(s) after apply resolved as {}",
            violations,
            resolution.as_str()
        );
        match resolution {
            Resolution::Omit => {}
            Resolution::Abort => {
                tx.rollback();
                return Ok(ApplyOutcome::Aborted { record: None });
            }
            Resolution::Replace => {
                return Err(ChangesetError::InvalidResolution {
                    conflict: ConflictKind::ForeignKey.as_str(),
                    resolution: resolution.as_str(),
                });
            }
        }
    }
    tx.commit_unchecked()?;

    tracing::info!(
        "Applied changeset: {} applied, {} replaced, {} omitted, {} skipped",
        stats.applied,
        stats.replaced,
        stats.omitted,
        stats.skipped
    );
    Ok(ApplyOutcome::Committed(stats))
}

/// Fails unless the target table matches the record header's shape.
fn check_schema(db: &Database, header: &TableHeader) -> Result<()> {
    let schema = db.table_schema(&header.name).map_err(|e| match e {
        DbError::TableNotFound { table } => {
            ChangesetError::SchemaError(format!("no table '{}' in target", table))
        }
        other => other.into(),
    })?;
    if schema.column_count() != header.column_count() {
        return Err(ChangesetError::SchemaError(format!(
            "table '{}' has {} columns in target, {} in changeset",
            header.name,
            schema.column_count(),
            header.column_count()
        )));
    }
    if schema.primary_key_mask() != header.primary_key {
        return Err(ChangesetError::SchemaError(format!(
            "primary key of table '{}' differs from changeset",
            header.name
        )));
    }
    Ok(())
}

/// Whether every present old cell matches the target row.
fn matches_old(old: &[Value], current: &[Value]) -> bool {
    old.iter()
        .zip(current)
        .all(|(expected, actual)| expected.is_absent() || expected == actual)
}

/// Maps a row-store write failure to a conflict, propagating other errors.
fn constraint(result: std::result::Result<(), DbError>) -> Result<Attempt> {
    match result {
        Ok(()) => Ok(Attempt::Applied),
        Err(e) if e.is_constraint() => {
            tracing::debug!("Constraint conflict: {}", e);
            Ok(Attempt::Conflict(ConflictKind::Constraint, None))
        }
        Err(e) => Err(e.into()),
    }
}

fn attempt(
    tx: &mut Transaction<'_>,
    header: &TableHeader,
    record: &ChangeRecord,
    config: &ApplyConfig,
    force: bool,
) -> Result<Attempt> {
    let table = header.name.as_str();
    let pk = header.primary_key_values(record.key_cells());
    let current = tx.get(table, &pk)?;

    match record.op {
        OpKind::Insert => match current {
            Some(existing) if !force => Ok(Attempt::Conflict(ConflictKind::Data, Some(existing))),
            Some(_) => constraint(tx.update(table, &pk, record.new.clone())),
            None => constraint(tx.insert(table, record.new.clone())),
        },
        OpKind::Delete => match current {
            None => Ok(Attempt::Conflict(ConflictKind::Missing, None)),
            Some(existing) if !force && !matches_old(&record.old, &existing) => {
                Ok(Attempt::Conflict(ConflictKind::Data, Some(existing)))
            }
            Some(_) => {
                tx.delete(table, &pk)?;
                Ok(Attempt::Applied)
            }
        },
        OpKind::Update => {
            let Some(existing) = current else {
                return Ok(Attempt::Conflict(ConflictKind::Missing, None));
            };
            if !force && !matches_old(&record.old, &existing) {
                return Ok(Attempt::Conflict(ConflictKind::Data, Some(existing)));
            }
            let updated: Row = existing
                .iter()
                .zip(&record.new)
                .map(|(current, new)| {
                    if new.is_absent() {
                        current.clone()
                    } else {
                        new.clone()
                    }
                })
                .collect();
            if config.ignore_noop_updates && updated == existing {
                return Ok(Attempt::Noop);
            }
            constraint(tx.update(table, &pk, updated))
        }
    }
}

impl Database {
    /// Applies a changeset to this database with the default configuration.
    pub fn apply_changeset<F, C>(
        &self,
        changeset: &Changeset,
        filter: F,
        on_conflict: C,
    ) -> Result<ApplyOutcome>
    where
        F: FnMut(&str) -> bool,
        C: FnMut(ConflictKind, &ChangeIter<'_>) -> Resolution,
    {
        apply(self, changeset, filter, on_conflict)
    }
}
