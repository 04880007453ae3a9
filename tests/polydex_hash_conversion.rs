use polydex::{debug, Polydex, PolydexConfig};
use tempfile::TempDir;

fn new_db() -> Polydex {
    let temp = TempDir::new().expect("tempdir");
    Polydex::open(PolydexConfig::new(temp.into_path())).expect("open polydex")
}

#[test]
fn point_heavy_basic_leaf_converts_to_hash() {
    debug::reset_debug_counters();
    let db = new_db();

    for i in 0..10 {
        let key = format!("h-{i}");
        db.insert(key.as_bytes(), b"value").expect("insert");
    }

    let before = debug::basic_to_hash_conversions();

    // A single successful point-op bump already drives a fresh counter to
    // zero ("favors hash"); at the default 5% rate, 1000 lookups make at
    // least one success effectively certain.
    for _ in 0..1000 {
        db.get(b"h-0").expect("lookup");
    }

    // One more insert is what actually runs the adaptation check.
    db.insert(b"h-10", b"value").expect("insert");

    assert!(
        debug::basic_to_hash_conversions() > before,
        "expected the leaf to convert from basic to hash"
    );

    for i in 0..=10 {
        let key = format!("h-{i}");
        assert_eq!(db.get(key.as_bytes()).unwrap(), Some(b"value".to_vec()));
    }
}
