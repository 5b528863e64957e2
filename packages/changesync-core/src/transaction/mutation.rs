use std::sync::Arc;

use crate::changeset::OpKind;
use crate::table::TableSchema;
use crate::value::Row;

/// A committed row write, delivered to mutation hooks in commit order.
#[derive(Debug, Clone)]
pub struct RowMutation {
    /// Name of the written table
    pub table: String,
    /// Schema of the table at commit time
    pub schema: Arc<TableSchema>,
    /// Kind of write
    pub op: OpKind,
    /// Row image before the write (UPDATE, DELETE)
    pub old: Option<Row>,
    /// Row image after the write (INSERT, UPDATE)
    pub new: Option<Row>,
    /// Caused by a side effect rather than a direct write
    pub indirect: bool,
}

/// Receives every committed row write of a database.
///
/// Hooks run synchronously on the committing thread while the single
/// writer lock is held; they must not begin transactions.
pub trait MutationHook: Send + Sync {
    fn on_mutation(&self, mutation: &RowMutation);
}

/// Handle returned by hook registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(pub(crate) u64);
