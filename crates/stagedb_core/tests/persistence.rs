//! Reopening on-disk databases.

use stagedb_core::{Config, CoreError, Database};
use tempfile::TempDir;

fn config() -> Config {
    Config::default()
        .max_file_size(256)
        .index_node_elements(4)
        .extra_data_size(8)
}

fn key(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

fn value(n: u32) -> Vec<u8> {
    format!("value number {n}").into_bytes()
}

#[test]
fn data_survives_reopen_across_file_rollover() {
    let temp = TempDir::new().unwrap();
    {
        let db = Database::open_with_config(temp.path(), "multi", config()).unwrap();
        let a = db.load_index(0, 4, 1 << 16).unwrap();
        let b = db.load_index(9, 2, 1 << 16).unwrap();
        for n in 0..200 {
            db.write_value(a, &key(n), &value(n)).unwrap();
        }
        for n in 0..50u16 {
            db.write_value(b, &n.to_be_bytes(), &[n as u8; 3]).unwrap();
        }
        db.set_extra_data(b"header").unwrap();
        db.stage().unwrap();
        db.commit().unwrap();

        for n in (0..200).step_by(3) {
            db.remove_value(a, &key(n)).unwrap();
        }
        db.change_key(b, &1u16.to_be_bytes(), &1000u16.to_be_bytes()).unwrap();
        db.stage().unwrap();
        db.commit().unwrap();
        db.close().unwrap();
    }

    let dir = temp.path().join("multi");
    assert!(dir.join("val_0.dat").exists());
    assert!(dir.join("val_1.dat").exists());
    assert!(dir.join("idx_0_0.dat").exists());
    assert!(dir.join("idx_0_1.dat").exists());
    assert!(dir.join("del.dat").exists());

    let db = Database::open_with_config(temp.path(), "multi", config()).unwrap();
    let a = db.load_index(0, 4, 1 << 16).unwrap();
    let b = db.load_index(9, 2, 1 << 16).unwrap();
    for n in 0..200 {
        let expected = (n % 3 != 0).then(|| value(n));
        assert_eq!(db.get(a, &key(n)).unwrap(), expected, "key {n}");
    }
    assert_eq!(db.get(b, &1u16.to_be_bytes()).unwrap(), None);
    assert_eq!(db.get(b, &1000u16.to_be_bytes()).unwrap().unwrap(), vec![1; 3]);
    assert_eq!(db.extra_data().unwrap(), b"header\0\0");

    let keys = db
        .range(b, &0u16.to_be_bytes(), &u16::MAX.to_be_bytes())
        .unwrap()
        .entries()
        .count();
    assert_eq!(keys, 50);
}

#[test]
fn freed_space_is_reused_after_reopen() {
    let temp = TempDir::new().unwrap();
    let last_size = {
        let db = Database::open_with_config(temp.path(), "reuse", config()).unwrap();
        let a = db.load_index(0, 4, 0).unwrap();
        for n in 0..4 {
            db.write_value(a, &key(n), &[n as u8; 40]).unwrap();
        }
        db.stage().unwrap();
        db.commit().unwrap();
        db.remove_value(a, &key(1)).unwrap();
        db.stage().unwrap();
        db.commit().unwrap();
        db.close().unwrap();
        db.stats().value_last_size
    };

    let db = Database::open_with_config(temp.path(), "reuse", config()).unwrap();
    assert!(db.deletion_entries().iter().any(|e| e.length == 40));
    let a = db.load_index(0, 4, 0).unwrap();
    db.write_value(a, &key(9), &[9; 40]).unwrap();
    db.stage().unwrap();
    db.commit().unwrap();
    assert_eq!(db.stats().value_last_size, last_size);
    assert_eq!(db.get(a, &key(9)).unwrap().unwrap(), vec![9; 40]);
}

#[test]
fn second_open_is_locked_out() {
    let temp = TempDir::new().unwrap();
    let db = Database::open(temp.path(), "locked", 0).unwrap();
    let second = Database::open(temp.path(), "locked", 0);
    assert!(matches!(second, Err(CoreError::DatabaseLocked)));

    db.close().unwrap();
    drop(db);
    Database::open(temp.path(), "locked", 0).unwrap();
}

#[test]
fn missing_database_without_create() {
    let temp = TempDir::new().unwrap();
    let result = Database::open_with_config(
        temp.path(),
        "absent",
        Config::default().create_if_missing(false),
    );
    assert!(result.is_err());
    assert!(!temp.path().join("absent").exists());
}

#[test]
fn staged_changes_block_close_but_not_drop() {
    let temp = TempDir::new().unwrap();
    {
        let db = Database::open(temp.path(), "pending", 0).unwrap();
        let a = db.load_index(0, 4, 0).unwrap();
        db.write_value(a, &key(1), b"kept").unwrap();
        db.stage().unwrap();
        db.commit().unwrap();

        db.write_value(a, &key(2), b"lost").unwrap();
        db.stage().unwrap();
        assert!(matches!(db.close(), Err(CoreError::PendingStaged)));
    }

    let db = Database::open(temp.path(), "pending", 0).unwrap();
    let a = db.load_index(0, 4, 0).unwrap();
    assert_eq!(db.get(a, &key(1)).unwrap().unwrap(), b"kept");
    assert_eq!(db.get(a, &key(2)).unwrap(), None);
}
