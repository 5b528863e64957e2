//! Changeset log: a DAG of captured changesets with a head pointer, used to
//! sync a database across replicas.

mod changeset_log;
mod entry;
mod repository;

pub use changeset_log::ChangesetLog;
pub use entry::ChangesetEntry;
pub use repository::Repository;
