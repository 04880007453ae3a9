use polydex::{Polydex, PolydexConfig};
use tempfile::TempDir;

fn new_db() -> Polydex {
    let temp = TempDir::new().expect("tempdir");
    Polydex::open(PolydexConfig::new(temp.into_path())).expect("open polydex")
}

fn collect_range(db: &Polydex, from_incl: &[u8], stop_after_excl: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    db.range(from_incl, |k, v| {
        if k >= stop_after_excl {
            return false;
        }
        out.push((k.to_vec(), v.to_vec()));
        true
    })
    .expect("range scan");
    out
}

#[test]
fn range_scan_single_leaf() {
    let db = new_db();
    db.insert(b"alpha", b"one").unwrap();
    db.insert(b"beta", b"two").unwrap();
    db.insert(b"delta", b"four").unwrap();

    let range = collect_range(&db, b"alpha", b"delta");
    assert_eq!(
        range,
        vec![
            (b"alpha".to_vec(), b"one".to_vec()),
            (b"beta".to_vec(), b"two".to_vec()),
        ]
    );
}

#[test]
fn range_scan_across_split_leaves() {
    let db = new_db();
    // Large enough that a page only fits a handful of entries, forcing
    // several splits across 200 inserts, but well under MAX_KV_SIZE.
    let payload = vec![0u8; 200];
    for i in 0..200 {
        let key = format!("key-{i:04}");
        db.insert(key.as_bytes(), &payload).expect("insert");
    }

    let results = collect_range(&db, b"key-0050", b"key-0100");
    assert_eq!(results.len(), 50);
    assert_eq!(results.first().unwrap().0, b"key-0050");
    assert_eq!(results.last().unwrap().0, b"key-0099");
}
