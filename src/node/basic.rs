//! The "basic" slotted format (spec Section 3/4.3): a sorted array of
//! fixed-size slot descriptors pointing into a heap that grows down from
//! the end of the page. Used for both `Tag::Basic` leaves and `Tag::Inner`
//! pages - an inner page's slot "value" is a 4-byte child [`PageId`]
//! instead of a payload.
//!
//! Right after the common header/fences sits a small fixed-size hint array
//! (`HINT_COUNT` evenly-spaced 4-byte key heads) that narrows `search`'s
//! binary-search range before it falls back to a full comparison. It is
//! rebuilt wholesale after every successful `insert` rather than patched
//! incrementally slot-by-slot - cheap at this size (`HINT_BYTES` bytes) and
//! easier to keep provably in sync with the current slot array than an
//! incremental update would be (see DESIGN.md).

use crate::node::{self, InsufficientSpace};
use crate::types::{head, PageId, PrefixTruncatedKey, PAGE_SIZE};

const SLOT_LEN: usize = 8;

/// Bytes permanently reserved at the tail of an `Inner` page for its
/// right-most child pointer (the child owning everything above the last
/// separator key). Leaf pages don't reserve this - their heap runs all the
/// way to `PAGE_SIZE`.
const RIGHTMOST_RESERVED: usize = 4;

/// Number of evenly-spaced heads kept in the hint array.
const HINT_COUNT: usize = 16;
const HINT_BYTES: usize = HINT_COUNT * 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildSlot {
    Slot(usize),
    RightMost,
}

pub struct BasicNode<'p> {
    page: &'p [u8; PAGE_SIZE],
}

impl<'p> BasicNode<'p> {
    pub fn new(page: &'p [u8; PAGE_SIZE]) -> BasicNode<'p> {
        BasicNode { page }
    }

    /// Start of the hint array, right after the common header/fences.
    fn hints_start(&self) -> usize {
        node::body_start(self.page)
    }

    /// Start of the slot array, right after the hint array.
    fn body_start(&self) -> usize {
        node::body_start(self.page) + HINT_BYTES
    }

    fn count(&self) -> usize {
        node::count(self.page)
    }

    fn is_inner(&self) -> bool {
        node::tag(self.page) == crate::types::Tag::Inner
    }

    fn heap_start(&self) -> usize {
        node::read_u16(self.page, 12) as usize
    }

    fn slot_at(&self, i: usize) -> usize {
        self.body_start() + i * SLOT_LEN
    }

    fn hint_at(&self, i: usize) -> u32 {
        node::read_u32(self.page, self.hints_start() + i * 4)
    }

    fn slot_fields(&self, i: usize) -> (usize, usize, usize, usize) {
        let off = self.slot_at(i);
        (
            node::read_u16(self.page, off) as usize,
            node::read_u16(self.page, off + 2) as usize,
            node::read_u16(self.page, off + 4) as usize,
            node::read_u16(self.page, off + 6) as usize,
        )
    }

    pub fn prefix(&self) -> &'p [u8] {
        let pl = node::prefix_len(self.page);
        &node::lower_fence(self.page)[..pl]
    }

    pub fn fences(&self) -> crate::fence::FenceData<'p> {
        node::fences(self.page)
    }

    fn key_at(&self, i: usize) -> PrefixTruncatedKey<'p> {
        let (koff, klen, _, _) = self.slot_fields(i);
        PrefixTruncatedKey(&self.page[koff..koff + klen])
    }

    fn value_bytes_at(&self, i: usize) -> &'p [u8] {
        let (_, _, voff, vlen) = self.slot_fields(i);
        &self.page[voff..voff + vlen]
    }

    /// Uses the hint array to find a `[lo, hi)` bracket that's safe to bound
    /// the real binary search to. Heads are nondecreasing with slot index
    /// (order-preserving prefix of a sorted key array), so any sampled head
    /// strictly less than `target_head` proves every slot at or before it is
    /// strictly less than the query key, and any sampled head strictly
    /// greater proves the symmetric upper bound; a tied head proves nothing
    /// either way and is simply skipped, degrading gracefully to the full
    /// `[0, n)` range when heads are mostly equal (the "bad heads" case).
    fn search_hint_bounds(&self, target_head: u32) -> (usize, usize) {
        let n = self.count();
        if n == 0 {
            return (0, 0);
        }
        let mut lo = 0usize;
        let mut hi = n;
        for i in 0..HINT_COUNT {
            let slot = (i * n) / HINT_COUNT;
            if slot >= n {
                break;
            }
            let h = self.hint_at(i);
            if h < target_head {
                lo = lo.max(slot + 1);
            } else if h > target_head {
                hi = hi.min(slot);
                break;
            }
        }
        if lo > hi {
            (0, n)
        } else {
            (lo, hi)
        }
    }

    /// Binary search for `key` among the slots. `Ok(i)` means exact match at
    /// slot `i`; `Err(i)` means `key` would be inserted at `i` (the first
    /// slot whose key is `>= key`).
    fn search(&self, key: PrefixTruncatedKey<'_>) -> Result<usize, usize> {
        let target_head = head(key);
        let (mut lo, mut hi) = self.search_hint_bounds(target_head);
        while lo < hi {
            let mid = (lo + hi) / 2;
            let mid_key = self.key_at(mid);
            let ord = head(mid_key)
                .cmp(&target_head)
                .then_with(|| mid_key.cmp(&key));
            match ord {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    /// Spec 4.7's "bad heads" measurement: counts adjacent slots whose
    /// 4-byte heads are identical and compares that count against
    /// `count/16`. Many repeated heads mean the head-comparison shortcut
    /// this format's `search` relies on rarely discriminates, favoring a
    /// point-access format (hash) that doesn't depend on it.
    pub fn has_bad_heads(&self) -> bool {
        let n = self.count();
        if n < 2 {
            return false;
        }
        let mut repeats = 0usize;
        let mut prev = head(self.key_at(0));
        for i in 1..n {
            let h = head(self.key_at(i));
            if h == prev {
                repeats += 1;
            }
            prev = h;
        }
        repeats > n / 16
    }

    // ---- leaf API -----------------------------------------------------

    pub fn lookup(&self, key: &[u8]) -> Option<&'p [u8]> {
        let truncated = PrefixTruncatedKey(&key[node::prefix_len(self.page).min(key.len())..]);
        match self.search(truncated) {
            Ok(i) => Some(self.value_bytes_at(i)),
            Err(_) => None,
        }
    }

    pub fn for_range(
        &self,
        from_incl: Option<&[u8]>,
        mut f: impl FnMut(&'p [u8], &'p [u8]) -> bool,
    ) {
        let prefix = self.prefix().to_vec();
        let n = self.count();
        let start = match from_incl {
            None => 0,
            Some(full_key) => {
                let truncated = PrefixTruncatedKey(&full_key[prefix.len().min(full_key.len())..]);
                match self.search(truncated) {
                    Ok(i) => i,
                    Err(i) => i,
                }
            }
        };
        for i in start..n {
            let key = self.key_at(i);
            // caller wants full keys back; reconstruct lazily via a small
            // owned buffer only when needed by giving it the truncated
            // bytes plus prefix length context through a closure contract
            // that operates on truncated keys is awkward, so `tree.rs`
            // reconstructs full keys itself using `prefix()` + this.
            if !f(key.0, self.value_bytes_at(i)) {
                break;
            }
        }
    }

    // ---- inner API ------------------------------------------------------

    pub fn right_most_child(&self) -> PageId {
        debug_assert!(self.is_inner());
        let bytes = &self.page[PAGE_SIZE - RIGHTMOST_RESERVED..PAGE_SIZE];
        PageId(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn child_value(&self, i: usize) -> PageId {
        let bytes = self.value_bytes_at(i);
        PageId(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    /// Finds the child that should be descended into for `key`.
    pub fn find_child(&self, key: &[u8]) -> (ChildSlot, PageId) {
        debug_assert!(self.is_inner());
        let prefix_len = node::prefix_len(self.page);
        let truncated = PrefixTruncatedKey(&key[prefix_len.min(key.len())..]);
        match self.search(truncated) {
            Ok(i) => (ChildSlot::Slot(i), self.child_value(i)),
            Err(i) if i < self.count() => (ChildSlot::Slot(i), self.child_value(i)),
            Err(_) => (ChildSlot::RightMost, self.right_most_child()),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.count()
    }

    pub fn separator_key(&self, i: usize) -> PrefixTruncatedKey<'p> {
        self.key_at(i)
    }

    /// Free bytes available for a new slot + its key/value bytes.
    /// `heap_start` already excludes the right-most-child trailer on inner
    /// pages, so this is just the gap between the slot array and the heap.
    pub fn free_space(&self) -> usize {
        let slots_end = self.body_start() + self.count() * SLOT_LEN;
        self.heap_start().saturating_sub(slots_end)
    }

    fn space_needed(key_len: usize, val_len: usize) -> usize {
        SLOT_LEN + key_len + val_len
    }

    /// Finds a separator key at/after the middle of the node, for splitting.
    /// Mirrors `findSeparator` from the thesis lineage: prefer the shortest
    /// key that still distinguishes the left and right halves.
    pub fn find_separator(&self) -> (usize, &'p [u8]) {
        let n = self.count();
        debug_assert!(n >= 1);
        let mid = n / 2;
        (mid, self.key_at(mid).0)
    }

    /// Spec Testable Properties 1-4 (ordering, fence containment, prefix
    /// correctness, compaction identity's space accounting half).
    #[cfg(debug_assertions)]
    pub fn validate(&self) {
        let n = self.count();
        let fences = self.fences();
        fences.validate();
        let prefix = self.prefix();
        let mut prev: Option<PrefixTruncatedKey<'_>> = None;
        for i in 0..n {
            let k = self.key_at(i);
            if let Some(p) = prev {
                debug_assert!(p < k, "basic node slots must be strictly ascending");
            }
            prev = Some(k);
            if !self.is_inner() {
                let mut full = prefix.to_vec();
                full.extend_from_slice(k.0);
                debug_assert!(fences.contains(&full), "stored key escapes its page's fences");
            }
        }
        let slots_end = self.body_start() + n * SLOT_LEN;
        debug_assert!(
            self.heap_start() >= slots_end,
            "heap must not overlap the slot array"
        );
        for i in 0..HINT_COUNT {
            let slot = if n == 0 { 0 } else { ((i * n) / HINT_COUNT).min(n - 1) };
            let expected = if n == 0 { 0 } else { head(self.key_at(slot)) };
            debug_assert_eq!(self.hint_at(i), expected, "hint array out of sync with slots");
        }
    }
}

pub struct BasicNodeMut<'p> {
    page: &'p mut [u8; PAGE_SIZE],
}

impl<'p> BasicNodeMut<'p> {
    pub fn new(page: &'p mut [u8; PAGE_SIZE]) -> BasicNodeMut<'p> {
        BasicNodeMut { page }
    }

    fn as_ref(&self) -> BasicNode<'_> {
        BasicNode { page: self.page }
    }

    pub fn init_leaf(page: &'p mut [u8; PAGE_SIZE], lower: &[u8], upper: &[u8]) -> BasicNodeMut<'p> {
        node::init_header(page, crate::types::Tag::Basic, lower, upper);
        BasicNodeMut { page }
    }

    pub fn init_inner(
        page: &'p mut [u8; PAGE_SIZE],
        lower: &[u8],
        upper: &[u8],
        right_most: PageId,
    ) -> BasicNodeMut<'p> {
        node::init_header(page, crate::types::Tag::Inner, lower, upper);
        node::write_u16(page, 12, (PAGE_SIZE - RIGHTMOST_RESERVED) as u16);
        page[PAGE_SIZE - RIGHTMOST_RESERVED..PAGE_SIZE]
            .copy_from_slice(&right_most.0.to_be_bytes());
        BasicNodeMut { page }
    }

    fn is_inner(&self) -> bool {
        node::tag(self.page) == crate::types::Tag::Inner
    }

    fn hints_start(&self) -> usize {
        node::body_start(self.page)
    }

    fn body_start(&self) -> usize {
        node::body_start(self.page) + HINT_BYTES
    }

    fn slot_at(&self, i: usize) -> usize {
        self.body_start() + i * SLOT_LEN
    }

    fn heap_start(&self) -> usize {
        node::read_u16(self.page, 12) as usize
    }

    fn set_heap_start(&mut self, v: usize) {
        node::write_u16(self.page, 12, v as u16);
    }

    /// Rebuilds the hint array from scratch against the current slot
    /// array. Called at the end of every successful `insert` so the hint
    /// array is always exactly consistent with the slots it samples (see
    /// the module doc comment on why this rebuilds rather than patches a
    /// single entry).
    fn make_hint(&mut self) {
        let n = node::count(self.page);
        for i in 0..HINT_COUNT {
            let h = if n == 0 {
                0
            } else {
                let slot = ((i * n) / HINT_COUNT).min(n - 1);
                head(self.as_ref().key_at(slot))
            };
            let off = self.hints_start() + i * 4;
            node::write_u32(self.page, off, h);
        }
    }

    pub fn free_space(&self) -> usize {
        self.as_ref().free_space()
    }

    pub fn right_most_child(&self) -> PageId {
        self.as_ref().right_most_child()
    }

    pub fn set_right_most_child(&mut self, pid: PageId) {
        debug_assert!(self.is_inner());
        self.page[PAGE_SIZE - RIGHTMOST_RESERVED..PAGE_SIZE]
            .copy_from_slice(&pid.0.to_be_bytes());
    }

    pub fn set_child_at(&mut self, i: usize, pid: PageId) {
        let off = self.slot_at(i);
        let (_, _, voff, vlen) = {
            let koff = node::read_u16(self.page, off) as usize;
            let klen = node::read_u16(self.page, off + 2) as usize;
            let voff = node::read_u16(self.page, off + 4) as usize;
            let vlen = node::read_u16(self.page, off + 6) as usize;
            (koff, klen, voff, vlen)
        };
        debug_assert_eq!(vlen, 4);
        self.page[voff..voff + 4].copy_from_slice(&pid.0.to_be_bytes());
    }

    /// Allocates `n` bytes from the heap tail, returning their offset.
    fn alloc_heap(&mut self, n: usize) -> usize {
        let new_start = self.heap_start() - n;
        self.set_heap_start(new_start);
        new_start
    }

    fn shift_slots_up(&mut self, from: usize) {
        let n = node::count(self.page);
        let mut i = n;
        while i > from {
            let src = self.slot_at(i - 1);
            let dst = self.slot_at(i);
            self.page.copy_within(src..src + SLOT_LEN, dst);
            i -= 1;
        }
    }

    fn write_slot(&mut self, i: usize, koff: usize, klen: usize, voff: usize, vlen: usize) {
        let off = self.slot_at(i);
        node::write_u16(self.page, off, koff as u16);
        node::write_u16(self.page, off + 2, klen as u16);
        node::write_u16(self.page, off + 4, voff as u16);
        node::write_u16(self.page, off + 6, vlen as u16);
    }

    /// Repacks every live slot's key/value bytes back against the heap
    /// boundary, in slot order, reclaiming heap space left behind by
    /// overwrites that shrank or replaced a slot's payload. Slot count and
    /// order are untouched - this only rewrites heap offsets. Spec
    /// Testable Property 4 (compaction identity).
    pub fn compactify(&mut self) {
        let n = node::count(self.page);
        let reset_heap = if self.is_inner() {
            PAGE_SIZE - RIGHTMOST_RESERVED
        } else {
            PAGE_SIZE
        };
        if n == 0 {
            self.set_heap_start(reset_heap);
            return;
        }
        let entries: Vec<(Vec<u8>, Vec<u8>)> = {
            let r = self.as_ref();
            (0..n).map(|i| (r.key_at(i).0.to_vec(), r.value_bytes_at(i).to_vec())).collect()
        };
        self.set_heap_start(reset_heap);
        for (i, (k, v)) in entries.iter().enumerate() {
            let voff = self.alloc_heap(v.len());
            self.page[voff..voff + v.len()].copy_from_slice(v);
            let koff = self.alloc_heap(k.len());
            self.page[koff..koff + k.len()].copy_from_slice(k);
            self.write_slot(i, koff, k.len(), voff, v.len());
        }
    }

    /// Inserts `(key, value)` in sorted order. `key` is the *full* key (the
    /// caller has not stripped the page's prefix); `value` is raw bytes (a
    /// leaf payload, or 4 big-endian bytes for an inner child pointer).
    ///
    /// An exact-match overwrite reuses the existing slot's heap bytes when
    /// the new value still fits there (same space accounting, no fresh
    /// allocation); otherwise it falls through the same path a fresh insert
    /// takes, so the old bytes become reclaimable heap space rather than a
    /// permanent leak. `compactify` runs once, only if free space is
    /// otherwise insufficient, before this gives up with `InsufficientSpace`.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<(), InsufficientSpace> {
        let prefix_len = node::prefix_len(self.page);
        let truncated = &key[prefix_len.min(key.len())..];
        let tkey = PrefixTruncatedKey(truncated);

        if let Ok(idx) = self.as_ref().search(tkey) {
            let (koff, klen, voff, vlen) = self.as_ref().slot_fields(idx);
            if vlen >= value.len() {
                self.page[voff..voff + value.len()].copy_from_slice(value);
                self.write_slot(idx, koff, klen, voff, value.len());
                self.make_hint();
                return Ok(());
            }
        }

        let needed = BasicNode::space_needed(truncated.len(), value.len());
        if self.free_space() < needed {
            self.compactify();
            if self.free_space() < needed {
                return Err(InsufficientSpace);
            }
        }
        let (idx, exact) = match self.as_ref().search(tkey) {
            Ok(i) => (i, true),
            Err(i) => (i, false),
        };

        let voff = self.alloc_heap(value.len());
        self.page[voff..voff + value.len()].copy_from_slice(value);
        let koff = self.alloc_heap(truncated.len());
        self.page[koff..koff + truncated.len()].copy_from_slice(truncated);

        if exact {
            self.write_slot(idx, koff, truncated.len(), voff, value.len());
        } else {
            self.shift_slots_up(idx);
            self.write_slot(idx, koff, truncated.len(), voff, value.len());
            node::set_count(self.page, node::count(self.page) + 1);
        }
        self.make_hint();
        Ok(())
    }

    pub fn insert_child(
        &mut self,
        separator: &[u8],
        child: PageId,
    ) -> Result<(), InsufficientSpace> {
        debug_assert!(self.is_inner());
        self.insert(separator, &child.0.to_be_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup_roundtrip() {
        let mut buf = [0u8; PAGE_SIZE];
        let mut n = BasicNodeMut::init_leaf(&mut buf, &[], &[]);
        n.insert(b"hello", b"world").unwrap();
        n.insert(b"abc", b"123").unwrap();
        n.insert(b"zzz", b"last").unwrap();

        let r = BasicNode::new(&buf);
        assert_eq!(r.lookup(b"hello"), Some(&b"world"[..]));
        assert_eq!(r.lookup(b"abc"), Some(&b"123"[..]));
        assert_eq!(r.lookup(b"zzz"), Some(&b"last"[..]));
        assert_eq!(r.lookup(b"missing"), None);
        assert_eq!(r.slot_count(), 3);
        r.validate();
    }

    #[test]
    fn validate_rejects_nothing_on_a_bounded_leaf() {
        let mut buf = [0u8; PAGE_SIZE];
        let mut n = BasicNodeMut::init_leaf(&mut buf, b"row-a", b"row-z");
        n.insert(b"row-b", b"1").unwrap();
        n.insert(b"row-m", b"2").unwrap();
        BasicNode::new(&buf).validate();
    }

    #[test]
    fn overwrite_existing_key() {
        let mut buf = [0u8; PAGE_SIZE];
        let mut n = BasicNodeMut::init_leaf(&mut buf, &[], &[]);
        n.insert(b"k", b"v1").unwrap();
        n.insert(b"k", b"v2-longer").unwrap();
        let r = BasicNode::new(&buf);
        assert_eq!(r.lookup(b"k"), Some(&b"v2-longer"[..]));
        assert_eq!(r.slot_count(), 1);
    }

    #[test]
    fn inner_find_child_uses_rightmost_for_high_keys() {
        let mut buf = [0u8; PAGE_SIZE];
        let mut n = BasicNodeMut::init_inner(&mut buf, &[], &[], PageId(9));
        n.insert_child(b"m", PageId(1)).unwrap();
        let r = BasicNode::new(&buf);
        let (_, pid) = r.find_child(b"a");
        assert_eq!(pid, PageId(1));
        let (_, pid) = r.find_child(b"z");
        assert_eq!(pid, PageId(9));
    }

    #[test]
    fn repeated_overwrite_reclaims_heap_via_compaction() {
        let mut buf = [0u8; PAGE_SIZE];
        let mut n = BasicNodeMut::init_leaf(&mut buf, &[], &[]);
        n.insert(b"k", b"short").unwrap();
        // alternating a growing overwrite with a shrinking one means every
        // "long" insert needs a fresh heap allocation; 200 rounds at ~44
        // bytes each is well past this page's ~4000-byte heap, so without
        // compaction reclaiming the dead bytes left by earlier overwrites
        // one of these would return `InsufficientSpace` and panic here.
        for _ in 0..200 {
            n.insert(b"k", b"a value long enough to force reallocation").unwrap();
            n.insert(b"k", b"short").unwrap();
        }
        assert!(n.free_space() > 3000);
        let r = BasicNode::new(&buf);
        assert_eq!(r.lookup(b"k"), Some(&b"short"[..]));
        assert_eq!(r.slot_count(), 1);
        r.validate();
    }

    #[test]
    fn hint_array_narrows_search_for_many_slots() {
        let mut buf = [0u8; PAGE_SIZE];
        let mut n = BasicNodeMut::init_leaf(&mut buf, &[], &[]);
        // big-endian numeric keys so the first 4 bytes (the head) actually
        // vary across the slot array rather than sharing a common prefix.
        for i in 0..200u32 {
            n.insert(&i.to_be_bytes(), &i.to_be_bytes()).unwrap();
        }
        let r = BasicNode::new(&buf);
        assert_eq!(r.slot_count(), 200);
        assert!(!r.has_bad_heads());
        for i in [0u32, 1, 50, 100, 150, 199] {
            assert_eq!(r.lookup(&i.to_be_bytes()), Some(&i.to_be_bytes()[..]));
        }
        assert_eq!(r.lookup(&9999u32.to_be_bytes()), None);
        r.validate();
    }

    #[test]
    fn bad_heads_detected_when_heads_collide() {
        let mut buf = [0u8; PAGE_SIZE];
        let mut n = BasicNodeMut::init_leaf(&mut buf, &[], &[]);
        // all keys share the same first 4 bytes, so every head collides and
        // only the trailing byte distinguishes them.
        for i in 0..40u8 {
            n.insert(&[b'a', b'a', b'a', b'a', i], b"v").unwrap();
        }
        let r = BasicNode::new(&buf);
        assert!(r.has_bad_heads());
    }

    #[test]
    fn bad_heads_not_flagged_for_distinct_heads() {
        let mut buf = [0u8; PAGE_SIZE];
        let mut n = BasicNodeMut::init_leaf(&mut buf, &[], &[]);
        for i in 0..40u32 {
            n.insert(&i.to_be_bytes(), b"v").unwrap();
        }
        let r = BasicNode::new(&buf);
        assert!(!r.has_bad_heads());
    }
}
