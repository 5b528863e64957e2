//! Table schema, column definitions, relations and row storage.

mod column;
mod relation;
mod schema;
#[allow(clippy::module_inception)]
mod table;
pub(crate) mod validation;

pub use column::Column;
pub use relation::Relation;
pub use schema::TableSchema;
pub use table::{RowMap, Table};
