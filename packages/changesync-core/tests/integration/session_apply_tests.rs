//! Capture writes with a session and replay them onto other databases.

use std::sync::Arc;

use changesync_core::{
    apply, apply_with_config, ApplyConfig, ApplyOutcome, ChangeIter, ChangeRecord, Changeset,
    ChangesetKind, Column, ConflictKind, Database, OpKind, Resolution, Session, SessionConfig,
    TableGroup, TableHeader, TableSchema, Value,
};
use ntest::timeout;

use super::helpers::{capture, create_test_db, dump, player, team};

fn omit(_: ConflictKind, _: &ChangeIter<'_>) -> Resolution {
    Resolution::Omit
}

#[timeout(1000)]
#[test]
fn test_replica_converges() {
    let source = create_test_db();
    let replica = create_test_db();

    let changeset = capture(&source, |db| {
        db.write(|tx| {
            tx.insert("teams", team(1, "red"))?;
            tx.insert("players", player(1, "ann", 10))?;
            tx.insert("players", player(2, "bob", 20))
        })
        .unwrap();
        db.write(|tx| tx.update("players", &[Value::Integer(2)], player(2, "bob", 25)))
            .unwrap();
        db.write(|tx| tx.delete("players", &[Value::Integer(1)]).map(|_| ()))
            .unwrap();
    });

    let outcome = apply(&replica, &changeset, |_| true, omit).unwrap();
    assert!(!outcome.is_aborted());
    assert_eq!(dump(&replica), dump(&source));
}

#[timeout(1000)]
#[test]
fn test_reapply_with_omit_is_idempotent() {
    let base = create_test_db();
    base.write(|tx| {
        tx.insert("players", player(1, "ann", 1))?;
        tx.insert("players", player(2, "bob", 2))
    })
    .unwrap();
    let target = create_test_db();
    target
        .write(|tx| {
            tx.insert("players", player(1, "ann", 1))?;
            tx.insert("players", player(2, "bob", 2))
        })
        .unwrap();

    let changeset = capture(&base, |db| {
        db.write(|tx| {
            tx.insert("players", player(3, "cy", 3))?;
            tx.update("players", &[Value::Integer(1)], player(1, "ann", 100))?;
            tx.delete("players", &[Value::Integer(2)]).map(|_| ())
        })
        .unwrap();
    });

    apply(&target, &changeset, |_| true, omit).unwrap();
    let once = dump(&target);

    let mut conflicts = Vec::new();
    let outcome = apply(&target, &changeset, |_| true, |kind, _: &ChangeIter<'_>| {
        conflicts.push(kind);
        Resolution::Omit
    })
    .unwrap();

    assert_eq!(dump(&target), once);
    assert_eq!(
        conflicts,
        vec![ConflictKind::Data, ConflictKind::Data, ConflictKind::Missing]
    );
    assert_eq!(outcome.stats().unwrap().omitted, 3);
}

#[timeout(1000)]
#[test]
fn test_abort_on_third_of_five_restores_target() {
    let target = create_test_db();
    target
        .write(|tx| tx.insert("players", player(3, "taken", 0)))
        .unwrap();
    let before = dump(&target);

    let changeset = Changeset::from_groups(
        ChangesetKind::Changeset,
        &[TableGroup {
            header: TableHeader::new("players", vec![true, false, false]),
            records: (1..=5)
                .map(|id| ChangeRecord::insert(player(id, "new", id)))
                .collect(),
        }],
    )
    .unwrap();

    let mut calls = 0;
    let outcome = apply(&target, &changeset, |_| true, |kind, iter: &ChangeIter<'_>| {
        calls += 1;
        assert_eq!(kind, ConflictKind::Data);
        assert_eq!(iter.new(0).unwrap(), &Value::Integer(3));
        assert_eq!(iter.conflict(1).unwrap(), &Value::from("taken"));
        Resolution::Abort
    })
    .unwrap();

    assert_eq!(outcome, ApplyOutcome::Aborted { record: Some(2) });
    assert_eq!(calls, 1);
    assert_eq!(dump(&target), before);
}

#[timeout(1000)]
#[test]
fn test_empty_changeset() {
    let db = create_test_db();
    let session = Session::create(&db, SessionConfig::default()).unwrap();
    session.attach(Some("players")).unwrap();

    let changeset = session.changeset().unwrap();
    assert!(changeset.is_empty());
    assert!(!changeset.as_bytes().is_empty());

    let decoded = Changeset::from_bytes(changeset.as_bytes().to_vec()).unwrap();
    assert!(decoded.groups().unwrap().is_empty());
    let mut iter = decoded.iter().unwrap();
    assert!(!iter.next().unwrap());

    let outcome = apply(&db, &decoded, |_| true, omit).unwrap();
    assert_eq!(outcome.stats().unwrap().applied, 0);
}

#[timeout(1000)]
#[test]
fn test_insert_then_update_yields_single_insert() {
    let db = Arc::new(Database::new());
    db.create_table(
        TableSchema::new("T", vec![Column::new("id").primary_key(), Column::new("v")]).unwrap(),
    )
    .unwrap();
    let session = Session::create(&db, SessionConfig::default()).unwrap();
    session.attach(Some("T")).unwrap();

    db.write(|tx| tx.insert("T", vec![Value::Integer(1), Value::from("a")]))
        .unwrap();
    db.write(|tx| {
        tx.update(
            "T",
            &[Value::Integer(1)],
            vec![Value::Integer(1), Value::from("b")],
        )
    })
    .unwrap();

    let changeset = session.changeset().unwrap();
    let mut iter = changeset.iter().unwrap();
    assert!(iter.next().unwrap());
    assert_eq!(iter.op().unwrap(), ("T", 2, OpKind::Insert, false));
    assert_eq!(iter.new(1).unwrap(), &Value::from("b"));
    assert!(!iter.next().unwrap());
}

#[timeout(1000)]
#[test]
fn test_delete_of_missing_row() {
    let db = create_test_db();
    let changeset = Changeset::from_groups(
        ChangesetKind::Changeset,
        &[TableGroup {
            header: TableHeader::new("players", vec![true, false, false]),
            records: vec![ChangeRecord::delete(player(5, "gone", 0))],
        }],
    )
    .unwrap();

    let mut seen = None;
    let outcome = apply(&db, &changeset, |_| true, |kind, _: &ChangeIter<'_>| {
        seen = Some(kind);
        Resolution::Omit
    })
    .unwrap();
    assert_eq!(seen, Some(ConflictKind::Missing));
    assert_eq!(outcome.stats().unwrap().omitted, 1);
    assert_eq!(db.row_count("players").unwrap(), 0);

    let outcome = apply(&db, &changeset, |_| true, |_, _: &ChangeIter<'_>| Resolution::Abort)
        .unwrap();
    assert_eq!(outcome, ApplyOutcome::Aborted { record: Some(0) });
    assert_eq!(db.row_count("players").unwrap(), 0);
}

#[timeout(1000)]
#[test]
fn test_inverse_undoes_changeset() {
    let db = create_test_db();
    db.write(|tx| tx.insert("players", player(1, "ann", 1))).unwrap();
    let before = dump(&db);

    let changeset = capture(&db, |db| {
        db.write(|tx| {
            tx.insert("players", player(2, "bob", 2))?;
            tx.update("players", &[Value::Integer(1)], player(1, "ann", 50))
        })
        .unwrap();
    });
    assert_ne!(dump(&db), before);

    let config = ApplyConfig {
        invert: true,
        ..Default::default()
    };
    let outcome = apply_with_config(&db, &changeset, |_| true, omit, &config).unwrap();
    assert_eq!(outcome.stats().unwrap().applied, 2);
    assert_eq!(dump(&db), before);
}

#[timeout(1000)]
#[test]
fn test_patchset_applies_without_old_values() {
    let source = create_test_db();
    let replica = create_test_db();
    for db in [&source, &replica] {
        db.write(|tx| {
            tx.insert("players", player(1, "ann", 1))?;
            tx.insert("players", player(2, "bob", 2))
        })
        .unwrap();
    }
    // Diverge a column the patchset does not touch
    replica
        .write(|tx| tx.update("players", &[Value::Integer(1)], player(1, "ANN", 1)))
        .unwrap();

    let session = Session::create(&source, SessionConfig::default()).unwrap();
    session.attach(Some("players")).unwrap();
    source
        .write(|tx| {
            tx.update("players", &[Value::Integer(1)], player(1, "ann", 9))?;
            tx.delete("players", &[Value::Integer(2)]).map(|_| ())
        })
        .unwrap();

    let patchset = session.patchset().unwrap();
    assert_eq!(patchset.kind(), ChangesetKind::Patchset);
    assert!(patchset.len() < session.changeset().unwrap().len());

    let outcome = apply(&replica, &patchset, |_| true, |_, _: &ChangeIter<'_>| Resolution::Abort)
        .unwrap();
    assert!(!outcome.is_aborted());
    assert_eq!(replica.rows("players").unwrap(), vec![player(1, "ANN", 9)]);
}

#[timeout(1000)]
#[test]
fn test_indirect_flag_survives_capture_and_apply() {
    let source = create_test_db();
    let replica = create_test_db();

    let changeset = capture(&source, |db| {
        db.write(|tx| {
            tx.insert("teams", team(1, "red"))?;
            tx.set_indirect(true);
            tx.insert("players", player(1, "ann", 1))
        })
        .unwrap();
    });

    let flags: Vec<(String, bool)> = changeset
        .groups()
        .unwrap()
        .into_iter()
        .flat_map(|g| {
            let name = g.header.name.clone();
            g.records.into_iter().map(move |r| (name.clone(), r.indirect))
        })
        .collect();
    assert!(flags.contains(&("teams".to_string(), false)));
    assert!(flags.contains(&("players".to_string(), true)));

    // The replica's own session sees the replayed writes with the same flags
    let observer = Session::create(&replica, SessionConfig::default()).unwrap();
    observer.attach(Some("players")).unwrap();
    apply(&replica, &changeset, |_| true, omit).unwrap();
    let replayed = observer.changeset().unwrap().groups().unwrap();
    assert!(replayed[0].records[0].indirect);
}

#[timeout(1000)]
#[test]
fn test_filter_skips_tables() {
    let source = create_test_db();
    let replica = create_test_db();
    let changeset = capture(&source, |db| {
        db.write(|tx| {
            tx.insert("teams", team(1, "red"))?;
            tx.insert("players", player(1, "ann", 1))
        })
        .unwrap();
    });

    let outcome = apply(&replica, &changeset, |table| table == "teams", omit).unwrap();
    assert_eq!(outcome.stats().unwrap().skipped, 1);
    assert_eq!(replica.row_count("teams").unwrap(), 1);
    assert_eq!(replica.row_count("players").unwrap(), 0);
}

#[timeout(1000)]
#[test]
fn test_schema_mismatch_is_fatal_and_rolls_back() {
    let source = create_test_db();
    let changeset = capture(&source, |db| {
        db.write(|tx| {
            tx.insert("teams", team(1, "red"))?;
            tx.insert("players", player(1, "ann", 1))
        })
        .unwrap();
    });

    // players matches, teams has an extra column
    let replica = Arc::new(Database::new());
    replica
        .create_table(
            TableSchema::new(
                "players",
                vec![
                    Column::new("id").primary_key(),
                    Column::new("name"),
                    Column::new("score"),
                ],
            )
            .unwrap(),
        )
        .unwrap();
    replica
        .create_table(
            TableSchema::new(
                "teams",
                vec![
                    Column::new("id").primary_key(),
                    Column::new("name"),
                    Column::new("city"),
                ],
            )
            .unwrap(),
        )
        .unwrap();

    let result = apply(&replica, &changeset, |_| true, omit);
    assert!(matches!(
        result,
        Err(changesync_core::ChangesetError::SchemaError(_))
    ));
    assert_eq!(replica.row_count("players").unwrap(), 0);
}
