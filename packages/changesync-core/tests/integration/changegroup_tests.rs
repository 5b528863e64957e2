//! Combining captured changesets.

use std::sync::Arc;

use changesync_core::{
    apply, ChangeIter, Changegroup, Changeset, ChangesetError, ChangesetKind, ConflictKind,
    Database, Resolution, Session, SessionConfig, Value,
};
use ntest::timeout;

use super::helpers::{capture, create_test_db, dump, player, team};

fn abort(_: ConflictKind, _: &ChangeIter<'_>) -> Resolution {
    Resolution::Abort
}

fn seeded() -> Arc<Database> {
    let db = create_test_db();
    db.write(|tx| {
        tx.insert("players", player(1, "ann", 1))?;
        tx.insert("players", player(2, "bob", 2))?;
        tx.insert("teams", team(1, "red"))
    })
    .unwrap();
    db
}

/// Three consecutive changesets touching overlapping rows.
fn three_steps(source: &Arc<Database>) -> [Changeset; 3] {
    let a = capture(source, |db| {
        db.write(|tx| {
            tx.insert("players", player(3, "cy", 3))?;
            tx.update("players", &[Value::Integer(1)], player(1, "ann", 10))
        })
        .unwrap();
    });
    let b = capture(source, |db| {
        db.write(|tx| {
            tx.delete("players", &[Value::Integer(3)])?;
            tx.update("players", &[Value::Integer(1)], player(1, "anna", 10))?;
            tx.insert("teams", team(2, "blue"))
        })
        .unwrap();
    });
    let c = capture(source, |db| {
        db.write(|tx| {
            tx.insert("players", player(3, "cyd", 30))?;
            tx.delete("players", &[Value::Integer(2)])?;
            tx.update("teams", &[Value::Integer(1)], team(1, "crimson"))
        })
        .unwrap();
    });
    [a, b, c]
}

#[timeout(1000)]
#[test]
fn test_combined_matches_sequential_apply() {
    let source = seeded();
    let [a, b, c] = three_steps(&source);

    let sequential = seeded();
    for changeset in [&a, &b, &c] {
        let outcome = apply(&sequential, changeset, |_| true, abort).unwrap();
        assert!(!outcome.is_aborted());
    }

    let mut group = Changegroup::new();
    for changeset in [&a, &b, &c] {
        group.add(changeset).unwrap();
    }
    let combined = group.output().unwrap();
    assert!(combined.record_count() < a.record_count() + b.record_count() + c.record_count());

    let replica = seeded();
    let outcome = apply(&replica, &combined, |_| true, abort).unwrap();
    assert!(!outcome.is_aborted());

    assert_eq!(dump(&sequential), dump(&source));
    assert_eq!(dump(&replica), dump(&source));
}

#[timeout(1000)]
#[test]
fn test_grouping_is_associative() {
    let source = seeded();
    let [a, b, c] = three_steps(&source);

    let left = a.concat(&b).unwrap().concat(&c).unwrap();
    let right = a.concat(&b.concat(&c).unwrap()).unwrap();

    let on_left = seeded();
    apply(&on_left, &left, |_| true, abort).unwrap();
    let on_right = seeded();
    apply(&on_right, &right, |_| true, abort).unwrap();

    assert_eq!(dump(&on_left), dump(&source));
    assert_eq!(dump(&on_right), dump(&source));
    assert_eq!(left.record_count(), right.record_count());
}

#[timeout(1000)]
#[test]
fn test_combined_inverse_restores_start() {
    let source = seeded();
    let start = dump(&source);
    let [a, b, c] = three_steps(&source);

    let combined = a.concat(&b).unwrap().concat(&c).unwrap();
    let outcome = apply(&source, &combined.invert().unwrap(), |_| true, abort).unwrap();
    assert!(!outcome.is_aborted());
    assert_eq!(dump(&source), start);
}

#[timeout(1000)]
#[test]
fn test_changes_that_cancel_leave_empty_output() {
    let source = seeded();
    let forward = capture(&source, |db| {
        db.write(|tx| {
            tx.insert("players", player(9, "zed", 0))?;
            tx.update("teams", &[Value::Integer(1)], team(1, "green"))
        })
        .unwrap();
    });
    let back = forward.invert().unwrap();

    let mut group = Changegroup::new();
    group.add(&forward).unwrap();
    group.add(&back).unwrap();
    assert!(group.is_empty());

    let output = group.output().unwrap();
    assert!(output.is_empty());
    assert_eq!(output.kind(), ChangesetKind::Changeset);
}

#[timeout(1000)]
#[test]
fn test_patchsets_group_with_patchsets_only() {
    let source = seeded();
    let session = Session::create(
        &source,
        SessionConfig {
            attach_all: true,
            ..Default::default()
        },
    )
    .unwrap();
    source
        .write(|tx| tx.update("players", &[Value::Integer(2)], player(2, "bob", 20)))
        .unwrap();
    let first = session.patchset().unwrap();
    let changeset = session.changeset().unwrap();

    let second = capture(&source, |db| {
        db.write(|tx| tx.delete("players", &[Value::Integer(2)]).map(|_| ()))
            .unwrap();
    });

    let mut group = Changegroup::new();
    group.add(&first).unwrap();
    assert!(matches!(
        group.add(&second),
        Err(ChangesetError::SchemaConflict { .. })
    ));
    assert_eq!(group.len(), 1);

    let mut group = Changegroup::new();
    group.add(&changeset).unwrap();
    group.add(&second).unwrap();
    let combined = group.output().unwrap();
    let groups = combined.groups().unwrap();
    assert_eq!(groups.len(), 1);
    // UPDATE then DELETE keeps the row as it was before the update
    assert_eq!(groups[0].records[0].old, player(2, "bob", 2));
}
