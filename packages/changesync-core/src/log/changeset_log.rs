//! In-memory changeset DAG with a head pointer, persisted as checksummed JSON.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ChangesetError, DbError, Result};

use super::entry::ChangesetEntry;

const LOG_FILE_VERSION: u32 = 1;

/// On-disk layout of a saved log.
#[derive(Debug, Serialize, Deserialize)]
struct LogFile {
    version: u32,
    head: Option<Uuid>,
    /// CRC32 of the JSON-encoded entries
    checksum: u32,
    entries: Vec<ChangesetEntry>,
}

fn io_error(e: std::io::Error, context: &str) -> DbError {
    DbError::IoError(format!("{}: {}", context, e))
}

fn entries_checksum(entries: &[ChangesetEntry]) -> Result<u32> {
    let bytes =
        serde_json::to_vec(entries).map_err(|e| DbError::SerializationError(e.to_string()))?;
    let mut hasher = Hasher::new();
    hasher.update(&bytes);
    Ok(hasher.finalize())
}

/// Changeset entries in insertion order plus the current head.
#[derive(Debug, Clone, Default)]
pub struct ChangesetLog {
    entries: Vec<ChangesetEntry>,
    index: HashMap<Uuid, usize>,
    head: Option<Uuid>,
}

impl ChangesetLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Option<Uuid> {
        self.head
    }

    /// Moves the head. `None` means before the first entry.
    pub fn set_head(&mut self, head: Option<Uuid>) -> Result<()> {
        if let Some(id) = head {
            if !self.index.contains_key(&id) {
                return Err(ChangesetError::UnknownEntry(id));
            }
        }
        self.head = head;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&ChangesetEntry> {
        self.index.get(&id).map(|&i| &self.entries[i])
    }

    pub fn entries(&self) -> &[ChangesetEntry] {
        &self.entries
    }

    /// Appends an entry. Its parent and merge entries must already exist.
    pub fn insert(&mut self, entry: ChangesetEntry) -> Result<()> {
        if self.index.contains_key(&entry.id) {
            return Err(ChangesetError::DuplicateEntry(entry.id));
        }
        for edge in [entry.parent_id, entry.merge_id].into_iter().flatten() {
            if !self.index.contains_key(&edge) {
                return Err(ChangesetError::UnknownEntry(edge));
            }
        }
        self.index.insert(entry.id, self.entries.len());
        self.entries.push(entry);
        Ok(())
    }

    /// Flags an entry as sent to a remote replica.
    pub fn mark_pushed(&mut self, id: Uuid) -> Result<()> {
        let index = *self.index.get(&id).ok_or(ChangesetError::UnknownEntry(id))?;
        self.entries[index].pushed = true;
        Ok(())
    }

    /// Removes every entry and clears the head.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.head = None;
    }

    /// First entry, in insertion order, that directly follows `id`.
    pub fn child_of(&self, id: Option<Uuid>) -> Option<&ChangesetEntry> {
        self.entries.iter().find(|e| e.follows(id))
    }

    /// Entries no other entry follows, in insertion order.
    pub fn leaves(&self) -> Vec<&ChangesetEntry> {
        let referenced: HashSet<Uuid> = self
            .entries
            .iter()
            .flat_map(|e| [e.parent_id, e.merge_id])
            .flatten()
            .collect();
        self.entries
            .iter()
            .filter(|e| !referenced.contains(&e.id))
            .collect()
    }

    /// `id` and every entry reachable through parent and merge edges,
    /// mapped to the length of the longest path from `id`.
    pub fn ancestors(&self, id: Uuid) -> HashMap<Uuid, usize> {
        let mut depths: HashMap<Uuid, usize> = HashMap::new();
        let mut queue = VecDeque::from([(id, 0usize)]);
        while let Some((current, depth)) = queue.pop_front() {
            if depths.get(&current).is_some_and(|&d| d >= depth) {
                continue;
            }
            depths.insert(current, depth);
            if let Some(entry) = self.get(current) {
                for edge in [entry.parent_id, entry.merge_id].into_iter().flatten() {
                    queue.push_back((edge, depth + 1));
                }
            }
        }
        depths
    }

    /// Regular entries reachable from `branch` but not from `main`, oldest
    /// first.
    pub fn branch_only(&self, main: Uuid, branch: Uuid) -> Vec<&ChangesetEntry> {
        let on_main = self.ancestors(main);
        let on_branch = self.ancestors(branch);
        let mut found: Vec<(usize, usize, &ChangesetEntry)> = on_branch
            .into_iter()
            .filter(|(id, _)| !on_main.contains_key(id))
            .filter_map(|(id, depth)| {
                let index = *self.index.get(&id)?;
                let entry = &self.entries[index];
                (!entry.is_merge()).then_some((depth, index, entry))
            })
            .collect();
        // Deepest first, ties in insertion order
        found.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        found.into_iter().map(|(_, _, entry)| entry).collect()
    }

    /// Writes the log to `path` through a temporary file and a rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = LogFile {
            version: LOG_FILE_VERSION,
            head: self.head,
            checksum: entries_checksum(&self.entries)?,
            entries: self.entries.clone(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| DbError::SerializationError(e.to_string()))?;

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| io_error(e, "Failed to create log directory"))?;
        }
        let temp_path = path.with_extension("json.tmp");
        let mut out =
            File::create(&temp_path).map_err(|e| io_error(e, "Failed to create temp file"))?;
        out.write_all(json.as_bytes())
            .map_err(|e| io_error(e, "Failed to write changeset log"))?;
        out.sync_all()
            .map_err(|e| io_error(e, "Failed to sync changeset log"))?;
        fs::rename(&temp_path, path).map_err(|e| io_error(e, "Failed to rename changeset log"))?;

        tracing::debug!(
            "Saved changeset log with {} entries to {}",
            self.entries.len(),
            path.display()
        );
        Ok(())
    }

    /// Reads a log written by [`ChangesetLog::save`].
    ///
    /// A checksum mismatch, unparsable content or dangling reference is
    /// reported as `DataCorruption`.
    pub fn load(path: &Path) -> Result<Self> {
        let mut contents = String::new();
        File::open(path)
            .and_then(|mut f| f.read_to_string(&mut contents))
            .map_err(|e| io_error(e, "Failed to read changeset log"))?;

        let file: LogFile = serde_json::from_str(&contents).map_err(|e| {
            DbError::DataCorruption(format!("Failed to parse changeset log: {}", e))
        })?;
        if file.version != LOG_FILE_VERSION {
            return Err(DbError::SerializationError(format!(
                "Unsupported changeset log version: {}",
                file.version
            ))
            .into());
        }
        let checksum = entries_checksum(&file.entries)?;
        if checksum != file.checksum {
            return Err(DbError::DataCorruption(format!(
                "Changeset log checksum mismatch: expected {:#010x}, found {:#010x}",
                file.checksum, checksum
            ))
            .into());
        }

        let mut log = ChangesetLog::new();
        for entry in file.entries {
            log.insert(entry)
                .map_err(|e| DbError::DataCorruption(format!("Invalid changeset log: {}", e)))?;
        }
        log.set_head(file.head)
            .map_err(|e| DbError::DataCorruption(format!("Invalid changeset log head: {}", e)))?;
        tracing::debug!(
            "Loaded changeset log with {} entries from {}",
            log.len(),
            path.display()
        );
        Ok(log)
    }
}
