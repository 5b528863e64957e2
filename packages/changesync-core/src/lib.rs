//! Row-level change capture and replay for an in-memory relational store.
//!
//! Provides the host row store, session recording, the binary changeset
//! codec and iterator, conflict-aware apply, changegroup merging and a
//! changeset log for syncing replicas.

pub mod apply;
pub mod changegroup;
pub mod changeset;
pub mod config;
pub mod database;
pub mod error;
pub mod log;
pub mod session;
pub mod table;
pub mod transaction;
pub mod value;

pub use apply::{apply, apply_with_config, ApplyOutcome, ApplyStats, ConflictKind, Resolution};
pub use changegroup::Changegroup;
pub use changeset::{ChangeIter, ChangeRecord, Changeset, ChangesetKind, OpKind, TableGroup, TableHeader};
pub use config::{ApplyConfig, LogConfig, SessionConfig};
pub use database::Database;
pub use error::{ChangesetError, DbError, Result};
pub use log::{ChangesetEntry, ChangesetLog, Repository};
pub use session::Session;
pub use table::{Column, Relation, TableSchema};
pub use transaction::Transaction;
pub use value::{Row, RowKey, Value};
