//! Syncing replicas through the changeset log.

use changesync_core::{
    ChangesetError, Column, DbError, LogConfig, Repository, TableSchema, Value,
};
use ntest::timeout;
use serde_json::json;
use uuid::Uuid;

use super::helpers::{create_test_db, dump, player};

fn repository() -> Repository {
    Repository::new(create_test_db(), LogConfig::default()).unwrap()
}

/// Copies every entry `to` has not seen yet.
fn exchange(from: &Repository, to: &Repository) {
    for entry in from.entries().unwrap() {
        if to.entry(entry.id).unwrap().is_none() {
            to.insert_entry(entry).unwrap();
        }
    }
}

#[timeout(1000)]
#[test]
fn test_commit_and_pull() {
    let local = repository();
    let remote = repository();

    local
        .commit(json!({"message": "add ann"}), |tx| {
            tx.insert("players", player(1, "ann", 1))
        })
        .unwrap();
    local
        .commit(json!({"message": "score"}), |tx| {
            tx.update("players", &[Value::Integer(1)], player(1, "ann", 5))
        })
        .unwrap();
    assert_eq!(local.entries().unwrap().len(), 2);

    exchange(&local, &remote);
    assert!(remote.pull().unwrap());
    assert!(!remote.pull().unwrap());
    assert_eq!(remote.head().unwrap(), local.head().unwrap());
    assert_eq!(dump(remote.database()), dump(local.database()));
}

#[timeout(1000)]
#[test]
fn test_empty_or_failed_commit_adds_nothing() {
    let repo = repository();
    repo.commit(json!(null), |tx| tx.get("players", &[Value::Integer(1)]))
        .unwrap();
    assert!(repo.entries().unwrap().is_empty());
    assert_eq!(repo.head().unwrap(), None);

    let result = repo.commit(json!(null), |tx| {
        tx.insert("players", player(1, "ann", 1))?;
        tx.insert("players", player(1, "dup", 1))
    });
    assert!(matches!(
        result,
        Err(ChangesetError::Db(DbError::DuplicateKey { .. }))
    ));
    assert!(repo.entries().unwrap().is_empty());
    assert_eq!(repo.database().row_count("players").unwrap(), 0);
}

#[timeout(1000)]
#[test]
fn test_diverged_replicas_converge_after_merge() {
    let local = repository();
    let remote = repository();

    local
        .commit(json!({"step": "root"}), |tx| {
            tx.insert("players", player(1, "ann", 1))
        })
        .unwrap();
    exchange(&local, &remote);
    remote.pull().unwrap();

    local
        .commit(json!({"step": "local"}), |tx| {
            tx.insert("players", player(2, "bob", 2))
        })
        .unwrap();
    remote
        .commit(json!({"step": "remote"}), |tx| {
            tx.insert("players", player(3, "cy", 3))
        })
        .unwrap();

    exchange(&remote, &local);
    assert_eq!(local.leaves().unwrap().len(), 2);
    assert_eq!(local.merge_all().unwrap(), 1);
    let leaves = local.leaves().unwrap();
    assert_eq!(leaves.len(), 1);
    let merge = &leaves[0];
    assert!(merge.is_merge());
    assert_eq!(merge.meta["parentMeta"], json!([{"step": "remote"}]));
    assert_eq!(merge.meta["mergeMeta"], json!([{"step": "local"}]));

    assert!(local.pull().unwrap());
    assert_eq!(local.head().unwrap(), Some(merge.id));

    exchange(&local, &remote);
    assert!(remote.pull().unwrap());
    assert_eq!(remote.head().unwrap(), Some(merge.id));

    let rows = local.database().rows("players").unwrap();
    assert_eq!(
        rows,
        vec![player(1, "ann", 1), player(2, "bob", 2), player(3, "cy", 3)]
    );
    assert_eq!(dump(remote.database()), dump(local.database()));
}

#[timeout(1000)]
#[test]
fn test_merge_of_unknown_entry() {
    let repo = repository();
    repo.commit(json!(null), |tx| tx.insert("players", player(1, "ann", 1)))
        .unwrap();
    let head = repo.head().unwrap().unwrap();
    assert!(matches!(
        repo.merge(head, Uuid::new_v4()),
        Err(ChangesetError::UnknownEntry(_))
    ));
}

#[timeout(1000)]
#[test]
fn test_log_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = LogConfig {
        data_dir: dir.path().to_path_buf(),
        file_name: "changesets.json".to_string(),
        persist: true,
    };

    let repo = Repository::new(create_test_db(), config.clone()).unwrap();
    repo.commit(json!({"n": 1}), |tx| tx.insert("players", player(1, "ann", 1)))
        .unwrap();
    repo.commit(json!({"n": 2}), |tx| tx.insert("players", player(2, "bob", 2)))
        .unwrap();
    let first = repo.entries().unwrap()[0].id;
    repo.mark_pushed(first).unwrap();
    let entries = repo.entries().unwrap();
    let head = repo.head().unwrap();
    let expected = dump(repo.database());
    drop(repo);

    let reopened = Repository::new(create_test_db(), config.clone()).unwrap();
    assert_eq!(reopened.entries().unwrap(), entries);
    assert_eq!(reopened.head().unwrap(), head);
    assert_eq!(reopened.unpushed().unwrap().len(), 1);

    // A fresh replica rebuilds the rows from the saved entries
    let replica = repository();
    exchange(&reopened, &replica);
    replica.pull().unwrap();
    assert_eq!(dump(replica.database()), expected);

    reopened.reset().unwrap();
    assert!(reopened.entries().unwrap().is_empty());
    assert_eq!(reopened.head().unwrap(), None);
    let after_reset = Repository::new(create_test_db(), config).unwrap();
    assert!(after_reset.entries().unwrap().is_empty());
}

#[timeout(1000)]
#[test]
fn test_failed_pull_keeps_head_at_last_applied_entry() {
    let coaches = || {
        TableSchema::new(
            "coaches",
            vec![Column::new("id").primary_key(), Column::new("name")],
        )
        .unwrap()
    };
    let source_db = create_test_db();
    source_db.create_table(coaches()).unwrap();
    let source = Repository::new(source_db, LogConfig::default()).unwrap();
    source
        .commit(json!({"n": 1}), |tx| tx.insert("players", player(1, "ann", 1)))
        .unwrap();
    let first = source.head().unwrap();
    source
        .commit(json!({"n": 2}), |tx| {
            tx.insert("coaches", vec![Value::Integer(1), Value::from("cy")])
        })
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let config = LogConfig {
        data_dir: dir.path().to_path_buf(),
        file_name: "changesets.json".to_string(),
        persist: true,
    };
    let replica = Repository::new(create_test_db(), config.clone()).unwrap();
    exchange(&source, &replica);

    assert!(matches!(
        replica.pull(),
        Err(ChangesetError::SchemaError(_))
    ));
    assert_eq!(replica.head().unwrap(), first);
    assert_eq!(replica.database().row_count("players").unwrap(), 1);

    let reopened = Repository::new(create_test_db(), config).unwrap();
    assert_eq!(reopened.head().unwrap(), first);

    replica.database().create_table(coaches()).unwrap();
    assert!(replica.pull().unwrap());
    assert_eq!(replica.head().unwrap(), source.head().unwrap());
    assert_eq!(dump(replica.database()), dump(source.database()));
}
