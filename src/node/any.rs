//! Tag-dispatched read access over whichever format a page happens to be
//! in (spec Section 4.6). `tree.rs` reaches for this whenever it only
//! needs to read - lookups, range scans, picking a split point - and
//! reaches for the concrete `node::*` types directly when it needs to
//! mutate a page it already knows the tag of.

use crate::fence::FenceData;
use crate::node::basic::BasicNodeMut;
use crate::node::{basic::BasicNode, dense::Dense1Leaf, dense::Dense2Leaf, hash::HashLeaf};
use crate::types::{PageId, Tag, PAGE_SIZE};

pub enum AnyLeaf<'p> {
    Basic(BasicNode<'p>),
    Dense1(Dense1Leaf<'p>),
    Dense2(Dense2Leaf<'p>),
    Hash(HashLeaf<'p>),
}

impl<'p> AnyLeaf<'p> {
    pub fn from_page(page: &'p [u8; PAGE_SIZE]) -> AnyLeaf<'p> {
        match crate::node::tag(page) {
            Tag::Basic => AnyLeaf::Basic(BasicNode::new(page)),
            Tag::Dense1 => AnyLeaf::Dense1(Dense1Leaf::new(page)),
            Tag::Dense2 => AnyLeaf::Dense2(Dense2Leaf::new(page)),
            Tag::Hash => AnyLeaf::Hash(HashLeaf::new(page)),
            Tag::Inner => panic!("AnyLeaf::from_page called on an inner page"),
        }
    }

    pub fn lookup(&self, key: &[u8]) -> Option<&'p [u8]> {
        match self {
            AnyLeaf::Basic(n) => n.lookup(key),
            AnyLeaf::Dense1(n) => n.lookup(key),
            AnyLeaf::Dense2(n) => n.lookup(key),
            AnyLeaf::Hash(n) => n.lookup(key),
        }
    }

    pub fn fences(&self) -> FenceData<'p> {
        match self {
            AnyLeaf::Basic(n) => n.fences(),
            AnyLeaf::Dense1(n) => n.fences(),
            AnyLeaf::Dense2(n) => n.fences(),
            AnyLeaf::Hash(n) => n.fences(),
        }
    }

    /// Number of live entries, used by the adaptation heuristics and split
    /// eligibility checks.
    pub fn len(&self) -> usize {
        match self {
            AnyLeaf::Basic(n) => n.slot_count(),
            AnyLeaf::Dense1(n) => {
                let mut c = 0;
                n.for_each(|_, _| c += 1);
                c
            }
            AnyLeaf::Dense2(n) => {
                let mut c = 0;
                n.for_each(|_, _| c += 1);
                c
            }
            AnyLeaf::Hash(n) => n.slot_count(),
        }
    }

    /// Collects every `(full_key, value)` pair in ascending key order.
    /// Used for format conversions and splits - leaves are small (one
    /// page) so materializing them is cheap relative to a page fault.
    pub fn collect_sorted(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let prefix = self.fences().prefix().to_vec();
        let mut out = Vec::with_capacity(self.len());
        match self {
            AnyLeaf::Basic(n) => {
                n.for_range(None, |k, v| {
                    out.push((concat_prefix(&prefix, k), v.to_vec()));
                    true
                });
            }
            AnyLeaf::Dense1(n) => {
                n.for_each(|idx, v| {
                    out.push((concat_prefix_idx(&prefix, n.base(), idx), v.to_vec()));
                });
                out.sort_by(|a, b| a.0.cmp(&b.0));
            }
            AnyLeaf::Dense2(n) => {
                n.for_each(|idx, v| {
                    out.push((concat_prefix_idx(&prefix, n.base(), idx), v.to_vec()));
                });
                out.sort_by(|a, b| a.0.cmp(&b.0));
            }
            AnyLeaf::Hash(n) => {
                n.for_each(|k, v| out.push((concat_prefix(&prefix, k), v.to_vec())));
                out.sort_by(|a, b| a.0.cmp(&b.0));
            }
        }
        out
    }
}

/// Merges `right`'s entries into `left`, rebuilding `left` as a Basic leaf
/// spanning both leaves' combined keyspace. Returns `false` (leaving `left`
/// untouched) if `right` isn't actually `left`'s right sibling, or if the
/// merged entries don't fit in one page.
///
/// This is a standalone maintenance primitive, not something the tree
/// driver calls on its own - splits only ever grow the tree, and inner-node
/// merging is out of scope (only leaf-level merging is defined). A caller
/// doing bulk deletes or compaction can invoke it directly against two
/// pages it already holds exclusively locked.
pub fn merge_right(left: &mut [u8; PAGE_SIZE], right: &[u8; PAGE_SIZE]) -> bool {
    let (left_fences, right_fences) = (AnyLeaf::from_page(left).fences(), AnyLeaf::from_page(right).fences());
    if left_fences.upper.is_empty() || left_fences.upper != right_fences.lower {
        return false;
    }
    let mut combined = AnyLeaf::from_page(left).collect_sorted();
    combined.extend(AnyLeaf::from_page(right).collect_sorted());

    let lower = left_fences.lower.to_vec();
    let upper = right_fences.upper.to_vec();
    let mut scratch = [0u8; PAGE_SIZE];
    let mut bm = BasicNodeMut::init_leaf(&mut scratch, &lower, &upper);
    for (k, v) in &combined {
        if bm.insert(k, v).is_err() {
            return false;
        }
    }
    *left = scratch;
    true
}

fn concat_prefix(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut full = Vec::with_capacity(prefix.len() + suffix.len());
    full.extend_from_slice(prefix);
    full.extend_from_slice(suffix);
    full
}

fn concat_prefix_idx(prefix: &[u8], base: u32, idx: u32) -> Vec<u8> {
    let mut full = Vec::with_capacity(prefix.len() + 4);
    full.extend_from_slice(prefix);
    full.extend_from_slice(&(base + idx).to_be_bytes());
    full
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_right_combines_adjacent_leaves() {
        let mut left_buf = [0u8; PAGE_SIZE];
        let mut left = BasicNodeMut::init_leaf(&mut left_buf, b"", b"key-m");
        left.insert(b"key-b", b"one").unwrap();
        left.insert(b"key-m", b"two").unwrap();

        let mut right_buf = [0u8; PAGE_SIZE];
        let mut right = BasicNodeMut::init_leaf(&mut right_buf, b"key-m", b"");
        right.insert(b"key-n", b"three").unwrap();
        right.insert(b"key-z", b"four").unwrap();

        assert!(merge_right(&mut left_buf, &right_buf));

        let merged = AnyLeaf::from_page(&left_buf);
        assert_eq!(merged.lookup(b"key-b"), Some(&b"one"[..]));
        assert_eq!(merged.lookup(b"key-m"), Some(&b"two"[..]));
        assert_eq!(merged.lookup(b"key-n"), Some(&b"three"[..]));
        assert_eq!(merged.lookup(b"key-z"), Some(&b"four"[..]));
        let fences = merged.fences();
        assert_eq!(fences.lower, b"");
        assert_eq!(fences.upper, b"");
    }

    #[test]
    fn merge_right_rejects_non_siblings() {
        let mut left_buf = [0u8; PAGE_SIZE];
        BasicNodeMut::init_leaf(&mut left_buf, b"", b"key-m");

        let mut unrelated_buf = [0u8; PAGE_SIZE];
        BasicNodeMut::init_leaf(&mut unrelated_buf, b"key-q", b"key-z");

        assert!(!merge_right(&mut left_buf, &unrelated_buf));
    }
}

pub struct AnyInner<'p> {
    node: BasicNode<'p>,
}

impl<'p> AnyInner<'p> {
    pub fn from_page(page: &'p [u8; PAGE_SIZE]) -> AnyInner<'p> {
        debug_assert_eq!(crate::node::tag(page), Tag::Inner);
        AnyInner {
            node: BasicNode::new(page),
        }
    }

    pub fn find_child(&self, key: &[u8]) -> PageId {
        self.node.find_child(key).1
    }

    pub fn fences(&self) -> FenceData<'p> {
        self.node.fences()
    }

    pub fn slot_count(&self) -> usize {
        self.node.slot_count()
    }
}
