use polydex::{debug, Polydex, PolydexConfig};
use tempfile::TempDir;

fn new_db() -> Polydex {
    let temp = TempDir::new().expect("tempdir");
    Polydex::open(PolydexConfig::new(temp.into_path())).expect("open polydex")
}

// A single test function: debug counters are process-wide statics, and
// cargo runs tests within one binary on multiple threads by default, so a
// second test calling reset_debug_counters() here could interleave with
// this one and make the split count meaningless.
#[test]
fn splits_propagate_and_every_key_stays_readable() {
    debug::reset_debug_counters();
    let db = new_db();

    // Large payload so that only a handful of inserts fill the root leaf.
    let payload = vec![0u8; 200];
    let mut inserted = 0usize;
    while debug::split_requests() == 0 {
        assert!(
            inserted < 64,
            "expected a root split after a handful of large inserts"
        );
        let key = format!("key-{inserted:02}");
        db.insert(key.as_bytes(), &payload).expect("insert");
        inserted += 1;
    }
    for i in 0..inserted {
        let key = format!("key-{i:02}");
        assert!(
            db.get(key.as_bytes()).unwrap().is_some(),
            "missing key {key}"
        );
    }

    // Keep going well past the root split to exercise inner-node splits too.
    for i in inserted..500 {
        let key = format!("key-{i:03}");
        db.insert(key.as_bytes(), &payload).expect("insert");
    }
    assert!(
        debug::split_requests() > 1,
        "expected several splits across 500 large inserts"
    );
    for i in 0..500 {
        let key = if i < inserted {
            format!("key-{i:02}")
        } else {
            format!("key-{i:03}")
        };
        assert!(
            db.get(key.as_bytes()).unwrap().is_some(),
            "missing key {key}"
        );
    }
}
