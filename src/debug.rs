//! Process-wide introspection counters, read by tests and callers that want
//! to observe format-conversion/split behavior (spec scenarios S2, S5).
//! Weakly consistent by design - see spec Section 5, "Adaptation counter".

#![allow(dead_code)]

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::node::any::AnyLeaf;
use crate::types::{Tag, PAGE_SIZE};

/// A one-line human-readable summary of a leaf page, for ad hoc debugging
/// (the thesis lineage's `Node::print`). Not used on any hot path.
pub fn dump_leaf(page: &[u8; PAGE_SIZE]) -> String {
    let leaf = AnyLeaf::from_page(page);
    let fences = leaf.fences();
    let tag = match leaf {
        AnyLeaf::Basic(_) => "basic",
        AnyLeaf::Dense1(_) => "dense1",
        AnyLeaf::Dense2(_) => "dense2",
        AnyLeaf::Hash(_) => "hash",
    };
    let mut out = String::new();
    let _ = write!(
        out,
        "{tag} leaf: {} entries, lower={:?}, upper={:?}",
        leaf.len(),
        fences.lower,
        fences.upper
    );
    out
}

/// Like [`dump_leaf`] but for an inner page, printing its separator count
/// and fence range rather than leaf entries.
pub fn dump_inner(page: &[u8; PAGE_SIZE]) -> String {
    debug_assert_eq!(crate::node::tag(page), Tag::Inner);
    let inner = crate::node::any::AnyInner::from_page(page);
    let fences = inner.fences();
    format!(
        "inner: {} separators, lower={:?}, upper={:?}",
        inner.slot_count(),
        fences.lower,
        fences.upper
    )
}

static SPLIT_REQUESTS: AtomicU64 = AtomicU64::new(0);
static MERGE_REQUESTS: AtomicU64 = AtomicU64::new(0);
static HASH_TO_BASIC_CONVERSIONS: AtomicU64 = AtomicU64::new(0);
static BASIC_TO_HASH_CONVERSIONS: AtomicU64 = AtomicU64::new(0);
static BASIC_TO_DENSE_CONVERSIONS: AtomicU64 = AtomicU64::new(0);
static DENSE_TO_BASIC_CONVERSIONS: AtomicU64 = AtomicU64::new(0);
static RESTARTS: AtomicU64 = AtomicU64::new(0);

pub fn record_split_request() {
    SPLIT_REQUESTS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_merge_request() {
    MERGE_REQUESTS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_hash_to_basic() {
    HASH_TO_BASIC_CONVERSIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_basic_to_hash() {
    BASIC_TO_HASH_CONVERSIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_basic_to_dense() {
    BASIC_TO_DENSE_CONVERSIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_dense_to_basic() {
    DENSE_TO_BASIC_CONVERSIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_restart() {
    RESTARTS.fetch_add(1, Ordering::Relaxed);
}

pub fn reset_debug_counters() {
    SPLIT_REQUESTS.store(0, Ordering::Relaxed);
    MERGE_REQUESTS.store(0, Ordering::Relaxed);
    HASH_TO_BASIC_CONVERSIONS.store(0, Ordering::Relaxed);
    BASIC_TO_HASH_CONVERSIONS.store(0, Ordering::Relaxed);
    BASIC_TO_DENSE_CONVERSIONS.store(0, Ordering::Relaxed);
    DENSE_TO_BASIC_CONVERSIONS.store(0, Ordering::Relaxed);
    RESTARTS.store(0, Ordering::Relaxed);
}

pub fn split_requests() -> u64 {
    SPLIT_REQUESTS.load(Ordering::Relaxed)
}

pub fn merge_requests() -> u64 {
    MERGE_REQUESTS.load(Ordering::Relaxed)
}

pub fn hash_to_basic_conversions() -> u64 {
    HASH_TO_BASIC_CONVERSIONS.load(Ordering::Relaxed)
}

pub fn basic_to_hash_conversions() -> u64 {
    BASIC_TO_HASH_CONVERSIONS.load(Ordering::Relaxed)
}

pub fn basic_to_dense_conversions() -> u64 {
    BASIC_TO_DENSE_CONVERSIONS.load(Ordering::Relaxed)
}

pub fn dense_to_basic_conversions() -> u64 {
    DENSE_TO_BASIC_CONVERSIONS.load(Ordering::Relaxed)
}

pub fn restarts() -> u64 {
    RESTARTS.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::basic::BasicNodeMut;

    #[test]
    fn dump_leaf_reports_tag_and_count() {
        let mut buf = [0u8; PAGE_SIZE];
        let mut n = BasicNodeMut::init_leaf(&mut buf, &[], &[]);
        n.insert(b"a", b"1").unwrap();
        n.insert(b"b", b"2").unwrap();
        let summary = dump_leaf(&buf);
        assert!(summary.starts_with("basic leaf: 2 entries"));
    }

    #[test]
    fn dump_inner_reports_separator_count() {
        let mut buf = [0u8; PAGE_SIZE];
        let mut n = BasicNodeMut::init_inner(&mut buf, &[], &[], crate::types::PageId(7));
        n.insert_child(b"m", crate::types::PageId(1)).unwrap();
        let summary = dump_inner(&buf);
        assert!(summary.starts_with("inner: 1 separators"));
    }
}
