//! Session, apply and changeset log configuration.

use std::path::PathBuf;

/// Session recorder configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Whether mutations are recorded from the start
    pub enabled: bool,
    /// Flag every recorded change as indirect
    pub indirect: bool,
    /// Track every table, including tables created after the session
    pub attach_all: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            indirect: false,
            attach_all: false,
        }
    }
}

/// Apply engine configuration.
#[derive(Debug, Clone, Default)]
pub struct ApplyConfig {
    /// Apply the inverse of the changeset
    pub invert: bool,
    /// Skip an UPDATE whose target row already holds the new values
    pub ignore_noop_updates: bool,
}

/// Changeset log configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory holding the log file
    pub data_dir: PathBuf,
    /// Log file name inside `data_dir`
    pub file_name: String,
    /// Write the log after every commit, merge and pull
    pub persist: bool,
}

impl LogConfig {
    /// Full path of the log file.
    pub fn path(&self) -> PathBuf {
        self.data_dir.join(&self.file_name)
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            file_name: "changesets.json".to_string(),
            persist: false,
        }
    }
}
