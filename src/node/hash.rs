//! The hash leaf format (spec Section 3/4.4): unsorted slots plus a
//! parallel array of one-byte key digests, scanned with the SWAR trick in
//! [`crate::utils`] to skip most full-key comparisons. Point-access
//! friendly; has no use for key order, so inserts just append.

use crate::node::{self, InsufficientSpace};
use crate::types::PAGE_SIZE;
use crate::utils::{swar_eq_mask, swar_mask_lanes};

/// Fixed capacity for the parallel tag array. Keeping it a constant-size
/// reservation (rather than growing it in lockstep with the slot array)
/// means appending a slot never has to shift the tag array - see
/// DESIGN.md for the tradeoff.
pub const MAX_SLOTS: usize = 256;
const SLOT_LEN: usize = 8;

fn tag_of(key: &[u8]) -> u8 {
    let mut h: u32 = 2166136261;
    for &b in key {
        h ^= b as u32;
        h = h.wrapping_mul(16777619);
    }
    (h >> 24) as u8
}

pub struct HashLeaf<'p> {
    page: &'p [u8; PAGE_SIZE],
}

impl<'p> HashLeaf<'p> {
    pub fn new(page: &'p [u8; PAGE_SIZE]) -> HashLeaf<'p> {
        HashLeaf { page }
    }

    fn body_start(&self) -> usize {
        node::body_start(self.page)
    }

    fn count(&self) -> usize {
        node::count(self.page)
    }

    fn tags(&self) -> &'p [u8] {
        let start = self.body_start();
        &self.page[start..start + self.count()]
    }

    fn slots_start(&self) -> usize {
        self.body_start() + MAX_SLOTS
    }

    fn heap_start(&self) -> usize {
        node::read_u16(self.page, 12) as usize
    }

    fn slot_fields(&self, i: usize) -> (usize, usize, usize, usize) {
        let off = self.slots_start() + i * SLOT_LEN;
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

    pub fn slot_count(&self) -> usize {
        self.count()
    }

    fn key_at(&self, i: usize) -> &'p [u8] {
        let (koff, klen, _, _) = self.slot_fields(i);
        &self.page[koff..koff + klen]
    }

    fn value_at(&self, i: usize) -> &'p [u8] {
        let (_, _, voff, vlen) = self.slot_fields(i);
        &self.page[voff..voff + vlen]
    }

    pub fn lookup(&self, key: &[u8]) -> Option<&'p [u8]> {
        let prefix_len = node::prefix_len(self.page);
        let truncated = &key[prefix_len.min(key.len())..];
        let target = tag_of(truncated);
        let tags = self.tags();
        let n = tags.len();

        let mut base = 0;
        while base < n {
            let remaining = n - base;
            if remaining >= 8 {
                let chunk = u64::from_le_bytes(tags[base..base + 8].try_into().unwrap());
                let mask = swar_eq_mask(chunk, target);
                for lane in swar_mask_lanes(mask) {
                    let i = base + lane;
                    if self.key_at(i) == truncated {
                        return Some(self.value_at(i));
                    }
                }
                base += 8;
            } else {
                for lane in 0..remaining {
                    let i = base + lane;
                    if tags[i] == target && self.key_at(i) == truncated {
                        return Some(self.value_at(i));
                    }
                }
                base += remaining;
            }
        }
        None
    }

    pub fn for_each(&self, mut f: impl FnMut(&'p [u8], &'p [u8])) {
        for i in 0..self.count() {
            f(self.key_at(i), self.value_at(i));
        }
    }

    pub fn free_space(&self) -> usize {
        if self.count() >= MAX_SLOTS {
            return 0;
        }
        let slots_end = self.slots_start() + self.count() * SLOT_LEN;
        self.heap_start().saturating_sub(slots_end)
    }

    /// Spec Testable Property 5 (hash parity) plus fence containment.
    #[cfg(debug_assertions)]
    pub fn validate(&self) {
        let fences = self.fences();
        fences.validate();
        let prefix = self.prefix();
        let tags = self.tags();
        for i in 0..self.count() {
            debug_assert_eq!(tags[i], tag_of(self.key_at(i)), "hash leaf tag/key mismatch");
            let mut full = prefix.to_vec();
            full.extend_from_slice(self.key_at(i));
            debug_assert!(fences.contains(&full), "hash leaf slot escapes its page's fences");
        }
        let slots_end = self.slots_start() + self.count() * SLOT_LEN;
        debug_assert!(self.heap_start() >= slots_end, "hash leaf heap overlaps its slot array");
    }
}

pub struct HashLeafMut<'p> {
    page: &'p mut [u8; PAGE_SIZE],
}

impl<'p> HashLeafMut<'p> {
    pub fn init(page: &'p mut [u8; PAGE_SIZE], lower: &[u8], upper: &[u8]) -> HashLeafMut<'p> {
        node::init_header(page, crate::types::Tag::Hash, lower, upper);
        HashLeafMut { page }
    }

    /// Wraps an already-initialized hash leaf for further mutation,
    /// without touching its header (unlike `init`).
    pub fn new(page: &'p mut [u8; PAGE_SIZE]) -> HashLeafMut<'p> {
        debug_assert_eq!(node::tag(page), crate::types::Tag::Hash);
        HashLeafMut { page }
    }

    fn as_ref(&self) -> HashLeaf<'_> {
        HashLeaf { page: self.page }
    }

    fn body_start(&self) -> usize {
        node::body_start(self.page)
    }

    fn slots_start(&self) -> usize {
        self.body_start() + MAX_SLOTS
    }

    fn heap_start(&self) -> usize {
        node::read_u16(self.page, 12) as usize
    }

    fn set_heap_start(&mut self, v: usize) {
        node::write_u16(self.page, 12, v as u16);
    }

    fn alloc_heap(&mut self, n: usize) -> usize {
        let new_start = self.heap_start() - n;
        self.set_heap_start(new_start);
        new_start
    }

    pub fn free_space(&self) -> usize {
        self.as_ref().free_space()
    }

    pub fn slot_count(&self) -> usize {
        node::count(self.page)
    }

    /// Inserts or overwrites `key`/`value`. Unlike the basic node, a
    /// duplicate key is found with a full linear scan (there is no sort
    /// order to binary-search); existing entries are rare on the point-
    /// access-heavy workloads this format targets, so this is accepted as
    /// a flat cost here rather than optimized.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<(), InsufficientSpace> {
        let prefix_len = node::prefix_len(self.page);
        let truncated = &key[prefix_len.min(key.len())..];

        if let Some(i) = self.find_slot(truncated) {
            let (_, _, voff, vlen) = self.slot_fields(i);
            if vlen >= value.len() {
                self.page[voff..voff + value.len()].copy_from_slice(value);
                self.set_slot_vlen(i, value.len());
                return Ok(());
            }
            // the grown value no longer fits the old heap allocation;
            // repoint this same slot at a fresh one rather than appending
            // a second slot for the same key, which would leave the old
            // (now-stale) slot earlier in scan order and so the one every
            // lookup actually finds.
            if self.free_space() < value.len() {
                return Err(InsufficientSpace);
            }
            let voff = self.alloc_heap(value.len());
            self.page[voff..voff + value.len()].copy_from_slice(value);
            let slot_off = self.slots_start() + i * SLOT_LEN;
            node::write_u16(self.page, slot_off + 4, voff as u16);
            node::write_u16(self.page, slot_off + 6, value.len() as u16);
            return Ok(());
        }

        let n = node::count(self.page);
        if n >= MAX_SLOTS {
            return Err(InsufficientSpace);
        }
        let needed = SLOT_LEN + truncated.len() + value.len();
        if self.free_space() < needed {
            return Err(InsufficientSpace);
        }

        let voff = self.alloc_heap(value.len());
        self.page[voff..voff + value.len()].copy_from_slice(value);
        let koff = self.alloc_heap(truncated.len());
        self.page[koff..koff + truncated.len()].copy_from_slice(truncated);

        let tag_off = self.body_start() + n;
        self.page[tag_off] = tag_of(truncated);

        let slot_off = self.slots_start() + n * SLOT_LEN;
        node::write_u16(self.page, slot_off, koff as u16);
        node::write_u16(self.page, slot_off + 2, truncated.len() as u16);
        node::write_u16(self.page, slot_off + 4, voff as u16);
        node::write_u16(self.page, slot_off + 6, value.len() as u16);

        node::set_count(self.page, n + 1);
        Ok(())
    }

    fn slot_fields(&self, i: usize) -> (usize, usize, usize, usize) {
        let off = self.slots_start() + i * SLOT_LEN;
        (
            node::read_u16(self.page, off) as usize,
            node::read_u16(self.page, off + 2) as usize,
            node::read_u16(self.page, off + 4) as usize,
            node::read_u16(self.page, off + 6) as usize,
        )
    }

    fn set_slot_vlen(&mut self, i: usize, vlen: usize) {
        let off = self.slots_start() + i * SLOT_LEN + 6;
        node::write_u16(self.page, off, vlen as u16);
    }

    fn find_slot(&self, truncated: &[u8]) -> Option<usize> {
        let n = node::count(self.page);
        let target = tag_of(truncated);
        for i in 0..n {
            let (koff, klen, _, _) = self.slot_fields(i);
            let tag_off = self.body_start() + i;
            if self.page[tag_off] == target && &self.page[koff..koff + klen] == truncated {
                return Some(i);
            }
        }
        None
    }

    /// Copies every entry from `src` into `self`, used when converting a
    /// basic/dense leaf into hash form.
    pub fn append_all(&mut self, entries: impl Iterator<Item = (Vec<u8>, Vec<u8>)>) {
        for (k, v) in entries {
            self.insert(&k, &v)
                .expect("a freshly converted leaf must fit its source leaf's entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup() {
        let mut buf = [0u8; PAGE_SIZE];
        let mut n = HashLeafMut::init(&mut buf, &[], &[]);
        n.insert(b"alpha", b"1").unwrap();
        n.insert(b"beta", b"2").unwrap();
        n.insert(b"gamma", b"3").unwrap();

        let r = HashLeaf::new(&buf);
        assert_eq!(r.lookup(b"beta"), Some(&b"2"[..]));
        assert_eq!(r.lookup(b"missing"), None);
        assert_eq!(r.slot_count(), 3);
        r.validate();
    }

    #[test]
    fn overwrite_same_length_value() {
        let mut buf = [0u8; PAGE_SIZE];
        let mut n = HashLeafMut::init(&mut buf, &[], &[]);
        n.insert(b"k", b"v1").unwrap();
        n.insert(b"k", b"v2").unwrap();
        let r = HashLeaf::new(&buf);
        assert_eq!(r.lookup(b"k"), Some(&b"v2"[..]));
        assert_eq!(r.slot_count(), 1);
    }

    #[test]
    fn overwrite_growing_value_does_not_resurrect_stale_bytes() {
        let mut buf = [0u8; PAGE_SIZE];
        let mut n = HashLeafMut::init(&mut buf, &[], &[]);
        n.insert(b"k", b"v").unwrap();
        n.insert(b"other", b"x").unwrap();
        n.insert(b"k", b"a much longer value than before").unwrap();
        let r = HashLeaf::new(&buf);
        assert_eq!(r.lookup(b"k"), Some(&b"a much longer value than before"[..]));
        assert_eq!(r.lookup(b"other"), Some(&b"x"[..]));
        // the growth path must repoint the existing slot rather than
        // append a second one for the same key.
        assert_eq!(r.slot_count(), 2);
        r.validate();
    }
}
