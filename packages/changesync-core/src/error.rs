//! Error types for the row store and the change engine.

use thiserror::Error;
use uuid::Uuid;

/// Row store operation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DbError {
    /// Table not found
    #[error("Table '{table}' not found")]
    TableNotFound { table: String },

    /// Table already exists
    #[error("Table '{0}' already exists")]
    TableAlreadyExists(String),

    /// Schema definition rejected
    #[error("Invalid schema for table '{table}': {reason}")]
    InvalidSchema { table: String, reason: String },

    /// Row width does not match the table's column count
    #[error("Table '{table}' has {expected} columns, row has {got}")]
    ColumnCountMismatch {
        table: String,
        expected: usize,
        got: usize,
    },

    /// A stored row may not contain absent cells
    #[error("Column '{column}' of table '{table}' has no value")]
    AbsentValue { table: String, column: String },

    /// Row with the given primary key does not exist
    #[error("Row not found in table '{table}'")]
    RowNotFound { table: String },

    /// Primary key already present
    #[error("Duplicate primary key in table '{table}'")]
    DuplicateKey { table: String },

    /// NOT NULL constraint failed
    #[error("NOT NULL constraint failed: {table}.{column}")]
    NotNullViolation { table: String, column: String },

    /// UNIQUE constraint failed
    #[error("UNIQUE constraint failed: {table}.{column}")]
    UniqueViolation { table: String, column: String },

    /// Deferred foreign key check failed at commit
    #[error("FOREIGN KEY constraint failed: {count} violation(s)")]
    ForeignKeyViolation { count: usize },

    /// Transaction state conflict
    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    /// Lock poisoned (Mutex/RwLock poisoned)
    #[error("Lock poisoned")]
    LockPoisoned,

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Data corruption detected
    #[error("Data corruption detected: {0}")]
    DataCorruption(String),

    /// I/O error during persistence
    #[error("I/O error: {0}")]
    IoError(String),
}

impl DbError {
    /// Returns `true` for errors raised by a uniqueness or nullability rule.
    pub fn is_constraint(&self) -> bool {
        matches!(
            self,
            DbError::DuplicateKey { .. }
                | DbError::NotNullViolation { .. }
                | DbError::UniqueViolation { .. }
        )
    }
}

/// Change capture, codec, apply and merge errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChangesetError {
    /// Table does not exist in the bound database
    #[error("Unknown table '{0}'")]
    UnknownTable(String),

    /// Table attached twice to the same session
    #[error("Table '{0}' is already attached")]
    AlreadyAttached(String),

    /// Session used after close()
    #[error("Session is closed")]
    SessionClosed,

    /// Unknown or mismatched table, or wrong column count
    #[error("Schema error: {0}")]
    SchemaError(String),

    /// Malformed changeset buffer
    #[error("Corrupt changeset at byte {offset}: {reason}")]
    CorruptChangeset { offset: usize, reason: String },

    /// Column index out of range or not applicable to the current change
    #[error("Invalid column {index}: {reason}")]
    InvalidColumn { index: usize, reason: &'static str },

    /// Operation unavailable for the captured data
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Two changes for the same row cannot be combined
    #[error("Schema conflict in table '{table}': {reason}")]
    SchemaConflict { table: String, reason: String },

    /// Conflict handler returned a resolution that is not valid for the conflict
    #[error("Resolution {resolution} is not valid for a {conflict} conflict")]
    InvalidResolution {
        conflict: &'static str,
        resolution: &'static str,
    },

    /// Changeset log entry not found
    #[error("Changeset entry {0} not found")]
    UnknownEntry(Uuid),

    /// Changeset log entry already present
    #[error("Changeset entry {0} already exists")]
    DuplicateEntry(Uuid),

    /// Row store error
    #[error(transparent)]
    Db(#[from] DbError),
}

impl ChangesetError {
    pub(crate) fn corrupt(offset: usize, reason: impl Into<String>) -> Self {
        ChangesetError::CorruptChangeset {
            offset,
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = ChangesetError> = std::result::Result<T, E>;
