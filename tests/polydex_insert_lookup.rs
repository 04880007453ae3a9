use polydex::{Polydex, PolydexConfig};
use tempfile::TempDir;

fn new_db() -> Polydex {
    let temp = TempDir::new().expect("tempdir");
    Polydex::open(PolydexConfig::new(temp.into_path())).expect("open polydex")
}

#[test]
fn insert_and_read_back() {
    let db = new_db();

    db.insert(b"alpha", b"one").expect("insert alpha");
    db.insert(b"beta", b"two").expect("insert beta");
    db.insert(b"gamma", b"three").expect("insert gamma");

    assert_eq!(db.get(b"alpha").unwrap(), Some(b"one".to_vec()));
    assert_eq!(db.get(b"beta").unwrap(), Some(b"two".to_vec()));
    assert_eq!(db.get(b"gamma").unwrap(), Some(b"three".to_vec()));
    assert_eq!(db.get(b"delta").unwrap(), None);
}

#[test]
fn duplicate_insert_overwrites_value() {
    let db = new_db();

    db.insert(b"key", b"first").unwrap();
    assert_eq!(db.get(b"key").unwrap(), Some(b"first".to_vec()));

    db.insert(b"key", b"second-and-longer").unwrap();
    assert_eq!(db.get(b"key").unwrap(), Some(b"second-and-longer".to_vec()));

    db.insert(b"key", b"short").unwrap();
    assert_eq!(db.get(b"key").unwrap(), Some(b"short".to_vec()));
}

#[test]
fn oversized_entry_is_rejected_before_touching_the_tree() {
    let db = new_db();
    let huge_value = vec![0u8; polydex::MAX_KV_SIZE];
    let err = db.insert(b"k", &huge_value).unwrap_err();
    assert!(matches!(err, polydex::error::PdxError::HarnessTooBig));
}
