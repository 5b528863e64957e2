//! Shared fixtures for integration tests.

use std::sync::Arc;

use changesync_core::{Changeset, Column, Database, Row, Session, SessionConfig, TableSchema, Value};

/// Database with `players(id PK, name NOT NULL, score)` and
/// `teams(id PK, name UNIQUE)`.
pub fn create_test_db() -> Arc<Database> {
    let db = Arc::new(Database::new());
    db.create_table(
        TableSchema::new(
            "players",
            vec![
                Column::new("id").primary_key(),
                Column::new("name").not_null(),
                Column::new("score"),
            ],
        )
        .unwrap(),
    )
    .unwrap();
    db.create_table(
        TableSchema::new(
            "teams",
            vec![Column::new("id").primary_key(), Column::new("name").unique()],
        )
        .unwrap(),
    )
    .unwrap();
    db
}

pub fn player(id: i64, name: &str, score: i64) -> Row {
    vec![Value::Integer(id), Value::from(name), Value::Integer(score)]
}

pub fn team(id: i64, name: &str) -> Row {
    vec![Value::Integer(id), Value::from(name)]
}

/// Committed rows of every table, by table name.
pub fn dump(db: &Database) -> Vec<(String, Vec<Row>)> {
    db.table_names()
        .into_iter()
        .map(|name| {
            let rows = db.rows(&name).unwrap();
            (name, rows)
        })
        .collect()
}

/// Records everything `f` writes to `db` through an attach-all session.
pub fn capture(db: &Arc<Database>, f: impl FnOnce(&Database)) -> Changeset {
    let session = Session::create(
        db,
        SessionConfig {
            attach_all: true,
            ..Default::default()
        },
    )
    .unwrap();
    f(db);
    session.changeset().unwrap()
}
