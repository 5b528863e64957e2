//! Change records, the binary changeset codec and the change iterator.

#[allow(clippy::module_inception)]
mod changeset;
pub mod codec;
mod iter;
mod record;

pub use changeset::Changeset;
pub use iter::ChangeIter;
pub use record::{ChangeRecord, ChangesetKind, OpKind, TableGroup, TableHeader};
