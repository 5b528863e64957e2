use super::*;
use crate::error::DbError;
use crate::value::{RowKey, Value};
use ntest::timeout;

fn users_schema() -> TableSchema {
    TableSchema::new(
        "users",
        vec![
            Column::new("id").primary_key(),
            Column::new("email").unique().not_null(),
            Column::new("team").references("teams", "id"),
        ],
    )
    .unwrap()
}

#[timeout(1000)]
#[test]
fn test_schema_requires_primary_key() {
    let result = TableSchema::new("t", vec![Column::new("a"), Column::new("b")]);
    assert!(matches!(result, Err(DbError::InvalidSchema { .. })));
}

#[timeout(1000)]
#[test]
fn test_schema_rejects_duplicate_columns() {
    let result = TableSchema::new("t", vec![Column::new("a").primary_key(), Column::new("a")]);
    assert!(matches!(result, Err(DbError::InvalidSchema { .. })));
}

#[timeout(1000)]
#[test]
fn test_schema_rejects_empty_column_list() {
    assert!(TableSchema::new("t", vec![]).is_err());
}

#[timeout(1000)]
#[test]
fn test_primary_key_mask_and_indices() {
    let schema = TableSchema::new(
        "pairs",
        vec![
            Column::new("a").primary_key(),
            Column::new("v"),
            Column::new("b").primary_key(),
        ],
    )
    .unwrap();
    assert_eq!(schema.primary_key_mask(), vec![true, false, true]);
    assert_eq!(schema.primary_key_indices(), vec![0, 2]);
    assert_eq!(schema.column_index("v"), Some(1));

    let row = vec![Value::Integer(1), Value::Null, Value::Text("x".into())];
    assert_eq!(
        schema.primary_key_of(&row),
        vec![Value::Integer(1), Value::Text("x".into())]
    );
}

#[timeout(1000)]
#[test]
fn test_validate_row_rejects_absent_and_null() {
    let schema = users_schema();
    let absent = vec![Value::Integer(1), Value::Absent, Value::Null];
    assert!(matches!(
        validation::validate_row(&schema, &absent),
        Err(DbError::AbsentValue { .. })
    ));

    let null_email = vec![Value::Integer(1), Value::Null, Value::Null];
    assert!(matches!(
        validation::validate_row(&schema, &null_email),
        Err(DbError::NotNullViolation { .. })
    ));

    let short = vec![Value::Integer(1)];
    assert!(matches!(
        validation::validate_row(&schema, &short),
        Err(DbError::ColumnCountMismatch { expected: 3, got: 1, .. })
    ));
}

#[timeout(1000)]
#[test]
fn test_validate_unique_skips_own_row() {
    let schema = users_schema();
    let mut rows = RowMap::new();
    let row = vec![Value::Integer(1), Value::from("a@x"), Value::Null];
    let key = schema.row_key(&row);
    rows.insert(key.clone(), row.clone());

    assert!(validation::validate_unique(&schema, &rows, &row, Some(&key)).is_ok());

    let other = vec![Value::Integer(2), Value::from("a@x"), Value::Null];
    assert!(matches!(
        validation::validate_unique(&schema, &rows, &other, None),
        Err(DbError::UniqueViolation { .. })
    ));
}

#[timeout(1000)]
#[test]
fn test_table_snapshot_is_isolated_from_store() {
    let table = Table::new(users_schema());
    let before = table.snapshot();

    let mut next = (*before).clone();
    let row = vec![Value::Integer(7), Value::from("b@x"), Value::Null];
    next.insert(RowKey::from_values([&Value::Integer(7)]), row.clone());
    table.store(std::sync::Arc::new(next));

    assert!(before.is_empty());
    assert_eq!(table.row_count(), 1);
    assert_eq!(table.get(&RowKey::from_values([&Value::Integer(7)])), Some(row));
}
