//! Changeset repository: commits local writes into the log, replays log
//! entries onto the database and merges diverged branches.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::json;
use uuid::Uuid;

use crate::apply::{apply, ApplyOutcome, Resolution};
use crate::changegroup::Changegroup;
use crate::changeset::Changeset;
use crate::config::{LogConfig, SessionConfig};
use crate::database::Database;
use crate::error::{ChangesetError, DbError, Result};
use crate::session::Session;
use crate::transaction::Transaction;

use super::changeset_log::ChangesetLog;
use super::entry::ChangesetEntry;

/// Database paired with the log of changesets that built it.
pub struct Repository {
    db: Arc<Database>,
    log: Mutex<ChangesetLog>,
    config: LogConfig,
}

impl Repository {
    /// Opens a repository, loading the saved log when persistence is on
    /// and the log file exists.
    pub fn new(db: Arc<Database>, config: LogConfig) -> Result<Self> {
        let path = config.path();
        let log = if config.persist && path.exists() {
            ChangesetLog::load(&path)?
        } else {
            ChangesetLog::new()
        };
        tracing::debug!("Opened changeset repository with {} entries", log.len());
        Ok(Self {
            db,
            log: Mutex::new(log),
            config,
        })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    fn lock(&self) -> Result<MutexGuard<'_, ChangesetLog>> {
        self.log
            .lock()
            .map_err(|_| ChangesetError::Db(DbError::LockPoisoned))
    }

    fn persist(&self, log: &ChangesetLog) -> Result<()> {
        if self.config.persist {
            log.save(&self.config.path())?;
        }
        Ok(())
    }

    /// Current head entry, `None` before the first commit or pull.
    pub fn head(&self) -> Result<Option<Uuid>> {
        Ok(self.lock()?.head())
    }

    pub fn entry(&self, id: Uuid) -> Result<Option<ChangesetEntry>> {
        Ok(self.lock()?.get(id).cloned())
    }

    /// All entries in insertion order.
    pub fn entries(&self) -> Result<Vec<ChangesetEntry>> {
        Ok(self.lock()?.entries().to_vec())
    }

    /// Entries no other entry follows.
    pub fn leaves(&self) -> Result<Vec<ChangesetEntry>> {
        Ok(self.lock()?.leaves().into_iter().cloned().collect())
    }

    /// Entries not yet sent to a remote replica.
    pub fn unpushed(&self) -> Result<Vec<ChangesetEntry>> {
        Ok(self
            .lock()?
            .entries()
            .iter()
            .filter(|e| !e.pushed)
            .cloned()
            .collect())
    }

    pub fn mark_pushed(&self, id: Uuid) -> Result<()> {
        let mut log = self.lock()?;
        log.mark_pushed(id)?;
        self.persist(&log)
    }

    /// Runs `f` in a transaction while recording its writes, and appends the
    /// recorded changeset as a child of head.
    ///
    /// Nothing is appended when `f` leaves the database unchanged.
    pub fn commit<F, R>(&self, meta: serde_json::Value, f: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction<'_>) -> std::result::Result<R, DbError>,
    {
        let mut log = self.lock()?;
        let mut session = Session::create(
            &self.db,
            SessionConfig {
                attach_all: true,
                ..Default::default()
            },
        )?;
        let result = self.db.write(f)?;
        let changeset = session.changeset()?;
        session.close()?;

        if changeset.is_empty() {
            tracing::debug!("Commit recorded no changes");
            return Ok(result);
        }
        let entry = ChangesetEntry::new(log.head(), changeset, meta);
        let id = entry.id;
        log.insert(entry)?;
        log.set_head(Some(id))?;
        self.persist(&log)?;
        tracing::info!("Committed changeset {}", id);
        Ok(result)
    }

    /// Applies entries following head until none is left. Conflicting
    /// records are omitted.
    ///
    /// Each entry is applied in its own transaction. If one fails, head is
    /// left on the last entry applied and saved there before the error is
    /// returned, so a later pull resumes from the failed entry.
    ///
    /// Returns whether any entry was applied.
    pub fn pull(&self) -> Result<bool> {
        let mut log = self.lock()?;
        let mut pulled = false;
        while let Some(child) = log.child_of(log.head()) {
            let id = child.id;
            if let Some(changeset) = child.changeset_from(log.head()) {
                let outcome = match apply(&self.db, changeset, |_| true, |_, _| Resolution::Omit) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::warn!("Pull stopped before changeset {}: {}", id, e);
                        if pulled {
                            self.persist(&log)?;
                        }
                        return Err(e);
                    }
                };
                if let ApplyOutcome::Committed(stats) = outcome {
                    tracing::debug!(
                        "Pulled changeset {}: {} applied, {} omitted",
                        id,
                        stats.applied,
                        stats.omitted
                    );
                }
            }
            log.set_head(Some(id))?;
            pulled = true;
        }
        if pulled {
            self.persist(&log)?;
            tracing::info!("Pulled up to changeset {:?}", log.head());
        }
        Ok(pulled)
    }

    /// Creates a merge entry joining `main` and `branch`.
    ///
    /// Its parent changeset holds the combined changes made only on
    /// `branch`, its merge changeset the combined changes made only on
    /// `main`. Head is not moved.
    pub fn merge(&self, main: Uuid, branch: Uuid) -> Result<ChangesetEntry> {
        let mut log = self.lock()?;
        for id in [main, branch] {
            if log.get(id).is_none() {
                return Err(ChangesetError::UnknownEntry(id));
            }
        }

        let (parent_changeset, parent_meta) = combine_branch(&log, main, branch)?;
        let (merge_changeset, merge_meta) = combine_branch(&log, branch, main)?;
        let entry = ChangesetEntry {
            id: Uuid::new_v4(),
            parent_id: Some(main),
            parent_changeset,
            merge_id: Some(branch),
            merge_changeset,
            pushed: false,
            meta: json!({ "parentMeta": parent_meta, "mergeMeta": merge_meta }),
        };
        log.insert(entry.clone())?;
        self.persist(&log)?;
        tracing::info!("Merged {} into {} as {}", branch, main, entry.id);
        Ok(entry)
    }

    /// Merges leaves pairwise until at most one is left. Returns the number
    /// of merge entries created.
    pub fn merge_all(&self) -> Result<usize> {
        let mut merges = 0;
        loop {
            let leaves: Vec<Uuid> = self.leaves()?.iter().map(|e| e.id).collect();
            if leaves.len() < 2 {
                return Ok(merges);
            }
            self.merge(leaves[0], leaves[1])?;
            merges += 1;
        }
    }

    /// Adds an entry produced by another replica.
    pub fn insert_entry(&self, entry: ChangesetEntry) -> Result<()> {
        let mut log = self.lock()?;
        let id = entry.id;
        log.insert(entry)?;
        self.persist(&log)?;
        tracing::debug!("Inserted changeset {}", id);
        Ok(())
    }

    /// Empties the log and clears head. Database rows are left untouched.
    pub fn reset(&self) -> Result<()> {
        let mut log = self.lock()?;
        log.clear();
        self.persist(&log)?;
        tracing::info!("Reset changeset log");
        Ok(())
    }
}

/// Combined changeset and metadata of the entries reachable from `branch`
/// but not from `main`.
fn combine_branch(
    log: &ChangesetLog,
    main: Uuid,
    branch: Uuid,
) -> Result<(Option<Changeset>, Vec<serde_json::Value>)> {
    let entries = log.branch_only(main, branch);
    let mut group = Changegroup::new();
    for changeset in entries.iter().filter_map(|e| e.parent_changeset.as_ref()) {
        group.add(changeset)?;
    }
    let meta = entries.iter().map(|e| e.meta.clone()).collect();
    let combined = if group.is_empty() {
        None
    } else {
        Some(group.output()?)
    };
    Ok((combined, meta))
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("db", &self.db)
            .field("config", &self.config)
            .finish()
    }
}
