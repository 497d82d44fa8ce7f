use frozendb::{Error, FrozenDb, OpenMode, Strategy};
use serde_json::json;

mod common;
use common::*;

const R: u64 = 256;

#[test]
fn commit_one_row() {
    let (_dir, path) = scratch_db(R, 5000);
    let db = FrozenDb::open(&path, OpenMode::Write, Strategy::InMemory).unwrap();

    let k1 = key_at(1000, 1);
    let tx = db.begin_tx().unwrap();
    tx.add_row(&k1, br#"{"a":1}"#).unwrap();
    tx.commit().unwrap();

    // header + initial checksum row + one data row
    assert_eq!(file_size(&path), 64 + R + R);
    assert_eq!(start_control(&path, R, 1), b'T');
    assert_eq!(&end_control(&path, R, 1), b"TC");

    assert_eq!(db.get::<serde_json::Value>(&k1).unwrap(), json!({"a": 1}));
    assert_eq!(db.get_raw(&k1).unwrap(), br#"{"a":1}"#);
    assert_eq!(db.max_timestamp(), 1000);

    db.check().unwrap();
    db.close().unwrap();
}

#[test]
fn two_rows_continue_then_commit() {
    let (_dir, path) = scratch_db(R, 5000);
    let db = FrozenDb::open(&path, OpenMode::Write, Strategy::InMemory).unwrap();

    let k1 = key_at(2000, 1);
    let k2 = key_at(2500, 2);
    let tx = db.begin_tx().unwrap();
    tx.add_row(&k1, b"{}").unwrap();
    tx.add_row(&k2, b"{}").unwrap();
    tx.commit().unwrap();

    assert_eq!(start_control(&path, R, 1), b'T');
    assert_eq!(&end_control(&path, R, 1), b"RE");
    assert_eq!(start_control(&path, R, 2), b'R');
    assert_eq!(&end_control(&path, R, 2), b"TC");

    assert_eq!(db.get_raw(&k1).unwrap(), b"{}");
    assert_eq!(db.get_raw(&k2).unwrap(), b"{}");
    db.close().unwrap();
}

#[test]
fn full_rollback_produces_null_row() {
    let (_dir, path) = scratch_db(R, 5000);
    let db = FrozenDb::open(&path, OpenMode::Write, Strategy::InMemory).unwrap();

    let tx = db.begin_tx().unwrap();
    tx.rollback(0).unwrap();

    assert_eq!(file_size(&path), 64 + 2 * R);
    assert_eq!(start_control(&path, R, 1), b'T');
    assert_eq!(&end_control(&path, R, 1), b"NR");

    assert!(matches!(
        db.get_raw(&key_at(1000, 9)),
        Err(Error::KeyNotFound)
    ));
    db.check().unwrap();
    db.close().unwrap();
}

#[test]
fn rolled_back_rows_are_not_found() {
    let (_dir, path) = scratch_db(R, 5000);
    let db = FrozenDb::open(&path, OpenMode::Write, Strategy::InMemory).unwrap();

    let k1 = key_at(1000, 1);
    let k2 = key_at(1100, 2);
    let tx = db.begin_tx().unwrap();
    tx.add_row(&k1, b"{}").unwrap();
    tx.add_row(&k2, b"{}").unwrap();
    tx.rollback(0).unwrap();

    assert_eq!(&end_control(&path, R, 2), b"R0");
    assert!(matches!(db.get_raw(&k1), Err(Error::KeyNotFound)));
    assert!(matches!(db.get_raw(&k2), Err(Error::KeyNotFound)));

    // the rolled-back timestamps still bound future writes
    assert_eq!(db.max_timestamp(), 1100);
    db.close().unwrap();
}

#[test]
fn savepoint_partial_rollback() {
    let (_dir, path) = scratch_db(R, 5000);
    let db = FrozenDb::open(&path, OpenMode::Write, Strategy::InMemory).unwrap();

    let k1 = key_at(10_000, 1);
    let k2 = key_at(10_500, 2);
    let tx = db.begin_tx().unwrap();
    tx.add_row(&k1, br#"{"v":1}"#).unwrap();
    assert_eq!(tx.savepoint().unwrap(), 1);
    tx.add_row(&k2, br#"{"v":2}"#).unwrap();
    tx.rollback(1).unwrap();

    assert_eq!(&end_control(&path, R, 1), b"SE");
    assert_eq!(&end_control(&path, R, 2), b"R1");

    assert_eq!(db.get_raw(&k1).unwrap(), br#"{"v":1}"#);
    assert!(matches!(db.get_raw(&k2), Err(Error::KeyNotFound)));
    db.check().unwrap();
    db.close().unwrap();
}

#[test]
fn savepoint_then_rollback_marks_final_row() {
    let (_dir, path) = scratch_db(R, 5000);
    let db = FrozenDb::open(&path, OpenMode::Write, Strategy::InMemory).unwrap();

    let k1 = key_at(10_000, 1);
    let k2 = key_at(10_500, 2);
    let tx = db.begin_tx().unwrap();
    tx.add_row(&k1, b"{}").unwrap();
    tx.savepoint().unwrap();
    tx.add_row(&k2, b"{}").unwrap();
    tx.savepoint().unwrap();
    // the final row declares savepoint 2, then rolls back to savepoint 1
    tx.rollback(1).unwrap();

    assert_eq!(&end_control(&path, R, 1), b"SE");
    assert_eq!(&end_control(&path, R, 2), b"S1");

    assert_eq!(db.get_raw(&k1).unwrap(), b"{}");
    assert!(matches!(db.get_raw(&k2), Err(Error::KeyNotFound)));
    db.close().unwrap();
}

#[test]
fn timestamp_ordering_is_enforced() {
    let (_dir, path) = scratch_db(R, 5000);
    let db = FrozenDb::open(&path, OpenMode::Write, Strategy::InMemory).unwrap();

    let tx = db.begin_tx().unwrap();
    tx.add_row(&key_at(1_000_000, 1), b"{}").unwrap();
    tx.commit().unwrap();
    assert_eq!(db.max_timestamp(), 1_000_000);

    let size_before = file_size(&path);
    let tx = db.begin_tx().unwrap();
    // 994_999 + 5000 <= 1_000_000
    let err = tx.add_row(&key_at(994_999, 2), b"{}").unwrap_err();
    assert!(matches!(err, Error::KeyOrdering { .. }));
    assert_eq!(file_size(&path), size_before);

    // 995_001 + 5000 > 1_000_000: inside the skew window
    tx.add_row(&key_at(995_001, 3), b"{}").unwrap();
    tx.commit().unwrap();
    assert_eq!(db.max_timestamp(), 1_000_000);
    db.close().unwrap();
}

#[test]
fn ordering_applies_within_a_transaction() {
    let (_dir, path) = scratch_db(R, 5000);
    let db = FrozenDb::open(&path, OpenMode::Write, Strategy::InMemory).unwrap();

    let tx = db.begin_tx().unwrap();
    tx.add_row(&key_at(50_000, 1), b"{}").unwrap();
    // the buffered row already bounds ordering
    assert!(matches!(
        tx.add_row(&key_at(40_000, 2), b"{}"),
        Err(Error::KeyOrdering { .. })
    ));
    tx.add_row(&key_at(50_001, 3), b"{}").unwrap();
    tx.commit().unwrap();
    db.close().unwrap();
}

#[test]
fn transaction_limits() {
    let (_dir, path) = scratch_db(R, 5000);
    let db = FrozenDb::open(&path, OpenMode::Write, Strategy::InMemory).unwrap();

    let tx = db.begin_tx().unwrap();
    assert!(matches!(tx.savepoint(), Err(Error::InvalidAction(_))));
    assert!(matches!(tx.rollback(1), Err(Error::InvalidAction(_))));

    for i in 0..100u32 {
        tx.add_row(&key_at(1000 + i as i64, i), b"{}").unwrap();
    }
    assert!(matches!(
        tx.add_row(&key_at(2000, 999), b"{}"),
        Err(Error::InvalidAction(_))
    ));
    tx.commit().unwrap();

    let tx = db.begin_tx().unwrap();
    tx.add_row(&key_at(10_000, 1000), b"{}").unwrap();
    tx.savepoint().unwrap();
    // one savepoint per row
    assert!(matches!(tx.savepoint(), Err(Error::InvalidAction(_))));
    tx.commit().unwrap();
    assert_eq!(&end_control(&path, R, 101), b"SC");

    // oversized value
    let tx = db.begin_tx().unwrap();
    let big = vec![b'x'; (R - 7 - 24 + 1) as usize];
    assert!(matches!(
        tx.add_row(&key_at(20_000, 2000), &big),
        Err(Error::InvalidInput(_))
    ));
    tx.rollback(0).unwrap();
    db.close().unwrap();
}

#[test]
fn savepoint_cap_is_nine() {
    let (_dir, path) = scratch_db(R, 5000);
    let db = FrozenDb::open(&path, OpenMode::Write, Strategy::InMemory).unwrap();

    let tx = db.begin_tx().unwrap();
    for i in 0..9i64 {
        tx.add_row(&key_at(1000 + i, i as u32 + 1), b"{}").unwrap();
        assert_eq!(tx.savepoint().unwrap(), i as u8 + 1);
    }
    tx.add_row(&key_at(2000, 100), b"{}").unwrap();
    assert!(matches!(tx.savepoint(), Err(Error::InvalidAction(_))));
    tx.commit().unwrap();

    for i in 1..=9 {
        assert_eq!(&end_control(&path, R, i), b"SE");
    }
    assert_eq!(&end_control(&path, R, 10), b"TC");
    db.close().unwrap();
}

#[test]
fn empty_commit_writes_nothing() {
    let (_dir, path) = scratch_db(R, 5000);
    let db = FrozenDb::open(&path, OpenMode::Write, Strategy::InMemory).unwrap();

    let tx = db.begin_tx().unwrap();
    tx.commit().unwrap();
    assert_eq!(file_size(&path), 64 + R);

    // completed transactions refuse further operations
    assert!(matches!(tx.commit(), Err(Error::InvalidAction(_))));
    assert!(matches!(
        tx.add_row(&key_at(1, 1), b"{}"),
        Err(Error::InvalidAction(_))
    ));

    db.begin_tx().unwrap().rollback(0).unwrap();
    db.close().unwrap();
}

#[test]
fn non_v7_keys_are_rejected() {
    let (_dir, path) = scratch_db(R, 5000);
    let db = FrozenDb::open(&path, OpenMode::Write, Strategy::InMemory).unwrap();

    let tx = db.begin_tx().unwrap();
    assert!(matches!(
        tx.add_row(&uuid::Uuid::nil(), b"{}"),
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        tx.add_row(&uuid::Uuid::new_v4(), b"{}"),
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        db.get_raw(&uuid::Uuid::new_v4()),
        Err(Error::InvalidInput(_))
    ));
    tx.rollback(0).unwrap();
    db.close().unwrap();
}

#[test]
fn stored_values_decode_into_caller_types() {
    let (_dir, path) = scratch_db(R, 5000);
    let db = FrozenDb::open(&path, OpenMode::Write, Strategy::InMemory).unwrap();

    #[derive(serde::Deserialize, Debug, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    let k1 = key_at(1000, 1);
    let k2 = key_at(1001, 2);
    let tx = db.begin_tx().unwrap();
    tx.add_row(&k1, br#"{"x":3,"y":4}"#).unwrap();
    tx.add_row(&k2, b"not json").unwrap();
    tx.commit().unwrap();

    assert_eq!(db.get::<Point>(&k1).unwrap(), Point { x: 3, y: 4 });
    assert!(matches!(db.get::<Point>(&k2), Err(Error::InvalidData(_))));
    // raw access still works on values that are not JSON
    assert_eq!(db.get_raw(&k2).unwrap(), b"not json");
    db.close().unwrap();
}

#[test]
fn get_inside_open_transaction_is_active() {
    let (_dir, path) = scratch_db(R, 5000);
    let db = FrozenDb::open(&path, OpenMode::Write, Strategy::InMemory).unwrap();

    let k1 = key_at(1000, 1);
    let k2 = key_at(1100, 2);
    let tx = db.begin_tx().unwrap();
    tx.add_row(&k1, b"{}").unwrap();
    // k1 is durable once k2's head replaces it in the buffer
    tx.add_row(&k2, b"{}").unwrap();

    assert!(matches!(db.get_raw(&k1), Err(Error::TransactionActive)));
    tx.commit().unwrap();
    assert_eq!(db.get_raw(&k1).unwrap(), b"{}");
    db.close().unwrap();
}
