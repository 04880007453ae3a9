use polydex::{debug, Polydex, PolydexConfig};
use tempfile::TempDir;

fn new_db() -> Polydex {
    let temp = TempDir::new().expect("tempdir");
    Polydex::open(PolydexConfig::new(temp.into_path())).expect("open polydex")
}

// Dense1/Dense2 require every key's page-prefix-truncated suffix to be
// exactly 4 bytes. A brand-new root leaf has empty fences (prefix_len 0),
// so plain 4-byte big-endian keys qualify without needing a shared literal
// prefix.
fn dense_key(i: u32) -> [u8; 4] {
    i.to_be_bytes()
}

#[test]
fn range_heavy_basic_leaf_converts_to_dense() {
    debug::reset_debug_counters();
    let db = new_db();

    let value = [7u8; 8];
    for i in 0..20u32 {
        db.insert(&dense_key(i), &value).expect("insert");
    }

    let before = debug::basic_to_dense_conversions();

    // Each range() call gives the leaf one (probabilistic) chance to bump
    // its adaptation counter toward "range-heavy". Two successful bumps
    // reach the conversion threshold; 200 tries at the default 15% rate
    // make that a near certainty.
    for _ in 0..200 {
        db.range(&[0, 0, 0, 0], |_, _| true).expect("range scan");
    }

    // One more insert is what actually runs the adaptation check.
    db.insert(&dense_key(20), &value).expect("insert");

    assert!(
        debug::basic_to_dense_conversions() > before,
        "expected the leaf to convert from basic to a dense format"
    );

    for i in 0..=20u32 {
        assert_eq!(db.get(&dense_key(i)).unwrap(), Some(value.to_vec()));
    }
}
