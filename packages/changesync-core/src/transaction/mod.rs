//! Transaction isolation, staged rows, atomic commit and mutation hooks.

mod mutation;
mod staging;
#[allow(clippy::module_inception)]
mod transaction;

pub use mutation::{HookId, MutationHook, RowMutation};
pub use staging::StagedTable;
pub use transaction::Transaction;
