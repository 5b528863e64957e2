//! Property-based tests for the changeset codec and capture/apply.
//!
//! Random change records must survive an encode/decode cycle with `Absent`
//! and `Null` kept apart, arbitrary bytes must never panic the decoder, and
//! random write sequences must replay onto an empty replica exactly.

use changesync_core::changeset::codec;
use changesync_core::{
    apply, ChangeIter, ChangeRecord, Changeset, ChangesetKind, ConflictKind, Resolution,
    TableGroup, TableHeader, Value,
};
use proptest::prelude::*;

use super::helpers::{capture, create_test_db, dump, player};

fn stored_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i64>().prop_map(Value::Integer),
        any::<f64>().prop_map(Value::Float),
        "[a-z0-9 \\x00]{0,12}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Blob),
    ]
}

fn maybe_value() -> impl Strategy<Value = Value> {
    prop_oneof![Just(Value::Absent), stored_value()]
}

prop_compose! {
    fn full_row()(cells in prop::collection::vec(stored_value(), 3)) -> Vec<Value> {
        cells
    }
}

prop_compose! {
    fn update_record()(
        key in stored_value(),
        old in prop::collection::vec(maybe_value(), 2),
        new in prop::collection::vec(maybe_value(), 2),
    ) -> ChangeRecord {
        let mut old_cells = vec![key];
        old_cells.extend(old);
        let mut new_cells = vec![Value::Absent];
        new_cells.extend(new);
        ChangeRecord::update(old_cells, new_cells)
    }
}

fn record() -> impl Strategy<Value = ChangeRecord> {
    (
        prop_oneof![
            full_row().prop_map(ChangeRecord::insert),
            full_row().prop_map(ChangeRecord::delete),
            update_record(),
        ],
        any::<bool>(),
    )
        .prop_map(|(record, indirect)| record.with_indirect(indirect))
}

fn abort(_: ConflictKind, _: &ChangeIter<'_>) -> Resolution {
    Resolution::Abort
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn test_records_survive_encoding(
        players in prop::collection::vec(record(), 0..12),
        teams in prop::collection::vec(record(), 0..12),
    ) {
        let groups = vec![
            TableGroup { header: TableHeader::new("players", vec![true, false, false]), records: players },
            TableGroup { header: TableHeader::new("teams", vec![true, false, false]), records: teams },
        ];
        let bytes = codec::encode(ChangesetKind::Changeset, &groups).unwrap();
        let (kind, decoded) = codec::decode(&bytes).unwrap();

        prop_assert_eq!(kind, ChangesetKind::Changeset);
        let expected: Vec<TableGroup> = groups.into_iter().filter(|g| !g.records.is_empty()).collect();
        prop_assert_eq!(decoded, expected);
    }

    #[test]
    fn test_arbitrary_bytes_never_panic(data in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = codec::decode(&data);
        if let Ok(mut iter) = ChangeIter::start(&data) {
            while let Ok(true) = iter.next() {}
        }
        let _ = Changeset::from_bytes(data);
    }

    #[test]
    fn test_random_writes_replay_onto_replica(
        ops in prop::collection::vec((0i64..6, 0u8..3, any::<i64>()), 1..24),
    ) {
        let source = create_test_db();
        let changeset = capture(&source, |db| {
            for &(id, op, score) in &ops {
                let key = [Value::Integer(id)];
                db.write(|tx| {
                    let existing = tx.get("players", &key)?;
                    match (op, existing) {
                        (0, None) => tx.insert("players", player(id, "p", score)),
                        (1, Some(_)) => tx.update("players", &key, player(id, "p", score)),
                        (2, Some(_)) => tx.delete("players", &key).map(|_| ()),
                        _ => Ok(()),
                    }
                })
                .unwrap();
            }
        });

        let replica = create_test_db();
        let outcome = apply(&replica, &changeset, |_| true, abort).unwrap();
        prop_assert!(!outcome.is_aborted());
        prop_assert_eq!(dump(&replica), dump(&source));

        let outcome = apply(&source, &changeset.invert().unwrap(), |_| true, abort).unwrap();
        prop_assert!(!outcome.is_aborted());
        prop_assert_eq!(source.row_count("players").unwrap(), 0);
    }
}
