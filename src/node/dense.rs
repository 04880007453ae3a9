//! The two dense leaf formats (spec Section 3/4.5). Both exploit leaves
//! whose keys, once the page prefix is stripped, collapse to a small
//! integer offset (the key suffix's 4-byte "head", per `types::head`) - a
//! common shape for auto-incrementing or otherwise densely-packed key
//! spaces. Neither stores keys at all; presence is tracked with a bitmap
//! indexed by that offset.
//!
//! `Dense1` additionally requires every value in the leaf to share one
//! fixed length, letting it lay out a flat value array with no heap at
//! all. `Dense2` drops that requirement and keeps a small heap for
//! variable-length values, trading some density for flexibility.
//!
//! A leaf is only eligible for either format when every key's suffix
//! (after the page's prefix) is at most 4 bytes - `head` would otherwise
//! not uniquely identify it. `dense_index` returns `None` when that
//! doesn't hold, and callers fall back to the basic/hash formats.

use crate::node::{self, InsufficientSpace};
use crate::types::{head, PrefixTruncatedKey, PAGE_SIZE};

/// Offset, within the format body, of the 4-byte base key.
const BASE_OFF: usize = 0;
/// Offset of the 2-byte slot capacity.
const CAP_OFF: usize = 4;
/// Offset of the 2-byte fixed value length (`Dense1` only).
const VALLEN_OFF: usize = 6;
const DENSE_HEADER_LEN: usize = 8;

/// Dense formats only cover leaves whose key suffix (after the page
/// prefix) is a full 4-byte big-endian integer - `head` left-justifies
/// shorter suffixes, so anything shorter would collide onto a handful of
/// enormous indices instead of a small dense range.
fn dense_index(prefix_len: usize, base: u32, key: &[u8]) -> Option<u32> {
    let suffix = &key[prefix_len.min(key.len())..];
    if suffix.len() != 4 {
        return None;
    }
    head(PrefixTruncatedKey(suffix)).checked_sub(base)
}

fn bitmap_len(capacity: u32) -> usize {
    (capacity as usize + 7) / 8
}

struct DenseCommon<'p> {
    page: &'p [u8; PAGE_SIZE],
}

impl<'p> DenseCommon<'p> {
    fn body(&self) -> usize {
        node::body_start(self.page)
    }
    fn base(&self) -> u32 {
        u32::from_be_bytes(
            self.page[self.body() + BASE_OFF..self.body() + BASE_OFF + 4]
                .try_into()
                .unwrap(),
        )
    }
    fn capacity(&self) -> u32 {
        node::read_u16(self.page, self.body() + CAP_OFF) as u32
    }
    fn bitmap_start(&self) -> usize {
        self.body() + DENSE_HEADER_LEN
    }
    fn bit(&self, i: u32) -> bool {
        let byte = self.page[self.bitmap_start() + (i / 8) as usize];
        byte & (1 << (i % 8)) != 0
    }
    fn prefix_len(&self) -> usize {
        node::prefix_len(self.page)
    }
}

// ---------------------------------------------------------------- Dense1 --

pub struct Dense1Leaf<'p> {
    common: DenseCommon<'p>,
}

impl<'p> Dense1Leaf<'p> {
    pub fn new(page: &'p [u8; PAGE_SIZE]) -> Dense1Leaf<'p> {
        Dense1Leaf {
            common: DenseCommon { page },
        }
    }

    fn value_len(&self) -> usize {
        node::read_u16(self.common.page, self.common.body() + VALLEN_OFF) as usize
    }

    fn values_start(&self) -> usize {
        self.common.bitmap_start() + bitmap_len(self.common.capacity())
    }

    pub fn prefix(&self) -> &'p [u8] {
        let pl = self.common.prefix_len();
        &node::lower_fence(self.common.page)[..pl]
    }

    pub fn fences(&self) -> crate::fence::FenceData<'p> {
        node::fences(self.common.page)
    }

    pub fn lookup(&self, key: &[u8]) -> Option<&'p [u8]> {
        let i = dense_index(self.common.prefix_len(), self.common.base(), key)?;
        if i >= self.common.capacity() || !self.common.bit(i) {
            return None;
        }
        let vl = self.value_len();
        let off = self.values_start() + i as usize * vl;
        Some(&self.common.page[off..off + vl])
    }

    pub fn for_each(&self, mut f: impl FnMut(u32, &'p [u8])) {
        let vl = self.value_len();
        for i in 0..self.common.capacity() {
            if self.common.bit(i) {
                let off = self.values_start() + i as usize * vl;
                f(i, &self.common.page[off..off + vl]);
            }
        }
    }

    pub fn base(&self) -> u32 {
        self.common.base()
    }

    pub fn capacity(&self) -> u32 {
        self.common.capacity()
    }

    /// Spec Testable Property 6 ("dense range"): every set bit's
    /// reconstructed key falls within the page's fences, and the value
    /// array never runs past the page.
    #[cfg(debug_assertions)]
    pub fn validate(&self) {
        let fences = self.fences();
        fences.validate();
        let prefix = self.prefix();
        let vl = self.value_len();
        debug_assert!(
            self.values_start() + self.capacity() as usize * vl <= PAGE_SIZE,
            "dense1 value array overruns the page"
        );
        self.for_each(|i, _| {
            let mut full = prefix.to_vec();
            full.extend_from_slice(&(self.base() + i).to_be_bytes());
            debug_assert!(fences.contains(&full), "dense1 slot escapes its page's fences");
        });
    }

    /// Whether every key/value pair yielded by `entries` can be represented
    /// exactly by a Dense1 leaf with `prefix_len` stripped: every suffix
    /// fits in 4 bytes and every value has the same length.
    pub fn eligible<'e>(
        prefix_len: usize,
        mut entries: impl Iterator<Item = (&'e [u8], &'e [u8])>,
    ) -> Option<(u32, u32, usize)> {
        let (first_key, first_val) = entries.next()?;
        let first_suffix = &first_key[prefix_len.min(first_key.len())..];
        if first_suffix.len() != 4 {
            return None;
        }
        let base = head(PrefixTruncatedKey(first_suffix));
        let value_len = first_val.len();
        let mut max_idx = 0u32;
        for (k, v) in entries {
            let suffix = &k[prefix_len.min(k.len())..];
            if suffix.len() != 4 || v.len() != value_len {
                return None;
            }
            let idx = head(PrefixTruncatedKey(suffix)).checked_sub(base)?;
            max_idx = max_idx.max(idx);
        }
        Some((base, max_idx + 1, value_len))
    }
}

pub struct Dense1LeafMut<'p> {
    page: &'p mut [u8; PAGE_SIZE],
}

impl<'p> Dense1LeafMut<'p> {
    /// Wraps an already-initialized Dense1 leaf for further mutation,
    /// without touching its header (unlike `init`).
    pub fn reopen(page: &'p mut [u8; PAGE_SIZE]) -> Dense1LeafMut<'p> {
        debug_assert_eq!(node::tag(page), crate::types::Tag::Dense1);
        Dense1LeafMut { page }
    }

    /// Builds an empty Dense1 leaf sized for `capacity` slots of
    /// `value_len` bytes each, anchored at `base`. Returns `None` if the
    /// resulting layout wouldn't fit in one page.
    pub fn init(
        page: &'p mut [u8; PAGE_SIZE],
        lower: &[u8],
        upper: &[u8],
        base: u32,
        capacity: u32,
        value_len: usize,
    ) -> Option<Dense1LeafMut<'p>> {
        node::init_header(page, crate::types::Tag::Dense1, lower, upper);
        let body = node::body_start(page);
        let needed = DENSE_HEADER_LEN + bitmap_len(capacity) + capacity as usize * value_len;
        if body + needed > PAGE_SIZE {
            return None;
        }
        page[body + BASE_OFF..body + BASE_OFF + 4].copy_from_slice(&base.to_be_bytes());
        node::write_u16(page, body + CAP_OFF, capacity as u16);
        node::write_u16(page, body + VALLEN_OFF, value_len as u16);
        let bitmap_start = body + DENSE_HEADER_LEN;
        page[bitmap_start..bitmap_start + bitmap_len(capacity)].fill(0);
        Some(Dense1LeafMut { page })
    }

    fn as_ref(&self) -> Dense1Leaf<'_> {
        Dense1Leaf::new(self.page)
    }

    pub fn set(&mut self, index: u32, value: &[u8]) {
        let body = node::body_start(self.page);
        let vl = node::read_u16(self.page, body + VALLEN_OFF) as usize;
        debug_assert_eq!(value.len(), vl);
        let bitmap_start = body + DENSE_HEADER_LEN;
        let cap = node::read_u16(self.page, body + CAP_OFF) as u32;
        let values_start = bitmap_start + bitmap_len(cap);
        let off = values_start + index as usize * vl;
        self.page[off..off + vl].copy_from_slice(value);
        self.page[bitmap_start + (index / 8) as usize] |= 1 << (index % 8);
        node::set_count(self.page, node::count(self.page) + 1);
    }

    pub fn insert_full(&mut self, key: &[u8], value: &[u8]) -> Result<(), InsufficientSpace> {
        let body = node::body_start(self.page);
        let base = u32::from_be_bytes(self.page[body..body + 4].try_into().unwrap());
        let prefix_len = node::prefix_len(self.page);
        let cap = node::read_u16(self.page, body + CAP_OFF) as u32;
        let idx = dense_index(prefix_len, base, key).ok_or(InsufficientSpace)?;
        if idx >= cap {
            return Err(InsufficientSpace);
        }
        self.set(idx, value);
        Ok(())
    }
}

// ---------------------------------------------------------------- Dense2 --

pub struct Dense2Leaf<'p> {
    common: DenseCommon<'p>,
}

impl<'p> Dense2Leaf<'p> {
    pub fn new(page: &'p [u8; PAGE_SIZE]) -> Dense2Leaf<'p> {
        Dense2Leaf {
            common: DenseCommon { page },
        }
    }

    fn slots_start(&self) -> usize {
        self.common.bitmap_start() + bitmap_len(self.common.capacity())
    }

    fn slot_fields(&self, i: u32) -> (usize, usize) {
        let off = self.slots_start() + i as usize * 4;
        (
            node::read_u16(self.common.page, off) as usize,
            node::read_u16(self.common.page, off + 2) as usize,
        )
    }

    pub fn prefix(&self) -> &'p [u8] {
        let pl = self.common.prefix_len();
        &node::lower_fence(self.common.page)[..pl]
    }

    pub fn fences(&self) -> crate::fence::FenceData<'p> {
        node::fences(self.common.page)
    }

    pub fn base(&self) -> u32 {
        self.common.base()
    }

    pub fn capacity(&self) -> u32 {
        self.common.capacity()
    }

    pub fn lookup(&self, key: &[u8]) -> Option<&'p [u8]> {
        let i = dense_index(self.common.prefix_len(), self.common.base(), key)?;
        if i >= self.common.capacity() || !self.common.bit(i) {
            return None;
        }
        let (off, len) = self.slot_fields(i);
        Some(&self.common.page[off..off + len])
    }

    pub fn for_each(&self, mut f: impl FnMut(u32, &'p [u8])) {
        for i in 0..self.common.capacity() {
            if self.common.bit(i) {
                let (off, len) = self.slot_fields(i);
                f(i, &self.common.page[off..off + len]);
            }
        }
    }

    fn heap_start(&self) -> usize {
        node::read_u16(self.common.page, 12) as usize
    }

    pub fn free_space(&self) -> usize {
        let slots_end = self.slots_start() + self.common.capacity() as usize * 4;
        self.heap_start().saturating_sub(slots_end)
    }

    /// Like `Dense1Leaf::eligible` but without the fixed-value-length
    /// requirement - `Dense2` keeps a heap for values of any length.
    pub fn eligible<'e>(
        prefix_len: usize,
        mut entries: impl Iterator<Item = (&'e [u8], &'e [u8])>,
    ) -> Option<(u32, u32)> {
        let (first_key, _) = entries.next()?;
        let first_suffix = &first_key[prefix_len.min(first_key.len())..];
        if first_suffix.len() != 4 {
            return None;
        }
        let base = head(PrefixTruncatedKey(first_suffix));
        let mut max_idx = 0u32;
        for (k, _) in entries {
            let suffix = &k[prefix_len.min(k.len())..];
            if suffix.len() != 4 {
                return None;
            }
            let idx = head(PrefixTruncatedKey(suffix)).checked_sub(base)?;
            max_idx = max_idx.max(idx);
        }
        Some((base, max_idx + 1))
    }

    #[cfg(debug_assertions)]
    pub fn validate(&self) {
        let fences = self.fences();
        fences.validate();
        let heap_start = self.heap_start();
        let slots_end = self.slots_start() + self.common.capacity() as usize * 4;
        debug_assert!(heap_start >= slots_end, "dense2 heap overlaps its slot array");
        let prefix = self.prefix();
        self.for_each(|i, v| {
            let mut full = prefix.to_vec();
            full.extend_from_slice(&(self.base() + i).to_be_bytes());
            debug_assert!(fences.contains(&full), "dense2 slot escapes its page's fences");
            let (off, len) = self.slot_fields(i);
            debug_assert_eq!(len, v.len(), "dense2 slot length mismatch");
            debug_assert!(off + len <= PAGE_SIZE, "dense2 slot value runs past the page");
        });
    }
}

pub struct Dense2LeafMut<'p> {
    page: &'p mut [u8; PAGE_SIZE],
}

impl<'p> Dense2LeafMut<'p> {
    /// Wraps an already-initialized Dense2 leaf for further mutation,
    /// without touching its header (unlike `init`).
    pub fn reopen(page: &'p mut [u8; PAGE_SIZE]) -> Dense2LeafMut<'p> {
        debug_assert_eq!(node::tag(page), crate::types::Tag::Dense2);
        Dense2LeafMut { page }
    }

    pub fn init(
        page: &'p mut [u8; PAGE_SIZE],
        lower: &[u8],
        upper: &[u8],
        base: u32,
        capacity: u32,
    ) -> Option<Dense2LeafMut<'p>> {
        node::init_header(page, crate::types::Tag::Dense2, lower, upper);
        let body = node::body_start(page);
        let slots_end = body + DENSE_HEADER_LEN + bitmap_len(capacity) + capacity as usize * 4;
        if slots_end > PAGE_SIZE {
            return None;
        }
        page[body + BASE_OFF..body + BASE_OFF + 4].copy_from_slice(&base.to_be_bytes());
        node::write_u16(page, body + CAP_OFF, capacity as u16);
        node::write_u16(page, body + VALLEN_OFF, 0xFFFF);
        let bitmap_start = body + DENSE_HEADER_LEN;
        page[bitmap_start..bitmap_start + bitmap_len(capacity)].fill(0);
        node::write_u16(page, 12, PAGE_SIZE as u16);
        Some(Dense2LeafMut { page })
    }

    fn as_ref(&self) -> Dense2Leaf<'_> {
        Dense2Leaf::new(self.page)
    }

    fn slots_start(&self) -> usize {
        let body = node::body_start(self.page);
        let cap = node::read_u16(self.page, body + CAP_OFF) as u32;
        body + DENSE_HEADER_LEN + bitmap_len(cap)
    }

    fn heap_start(&self) -> usize {
        node::read_u16(self.page, 12) as usize
    }

    fn set_heap_start(&mut self, v: usize) {
        node::write_u16(self.page, 12, v as u16);
    }

    pub fn free_space(&self) -> usize {
        self.as_ref().free_space()
    }

    pub fn insert_full(&mut self, key: &[u8], value: &[u8]) -> Result<(), InsufficientSpace> {
        let body = node::body_start(self.page);
        let base = u32::from_be_bytes(self.page[body..body + 4].try_into().unwrap());
        let prefix_len = node::prefix_len(self.page);
        let cap = node::read_u16(self.page, body + CAP_OFF) as u32;
        let idx = dense_index(prefix_len, base, key).ok_or(InsufficientSpace)?;
        if idx >= cap {
            return Err(InsufficientSpace);
        }
        if self.free_space() < value.len() + 4 {
            return Err(InsufficientSpace);
        }
        let off = self.heap_start() - value.len();
        self.set_heap_start(off);
        self.page[off..off + value.len()].copy_from_slice(value);

        let slot_off = self.slots_start() + idx as usize * 4;
        node::write_u16(self.page, slot_off, off as u16);
        node::write_u16(self.page, slot_off + 2, value.len() as u16);

        let bitmap_start = body + DENSE_HEADER_LEN;
        let was_set = self.page[bitmap_start + (idx / 8) as usize] & (1 << (idx % 8)) != 0;
        self.page[bitmap_start + (idx / 8) as usize] |= 1 << (idx % 8);
        if !was_set {
            node::set_count(self.page, node::count(self.page) + 1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense1_roundtrip() {
        // Lower/upper fences share a 3-byte prefix ("\0\0\0"), leaving a
        // full 4-byte integer suffix for the dense index.
        let mut buf = [0u8; PAGE_SIZE];
        let mut n = Dense1LeafMut::init(&mut buf, b"\0\0\0\0", b"\0\0\0\xff", 0, 16, 4).unwrap();
        n.insert_full(b"\0\0\0\0\0\0\x03", b"abcd").unwrap();
        n.insert_full(b"\0\0\0\0\0\0\x07", b"wxyz").unwrap();

        let r = Dense1Leaf::new(&buf);
        assert_eq!(r.lookup(b"\0\0\0\0\0\0\x03"), Some(&b"abcd"[..]));
        assert_eq!(r.lookup(b"\0\0\0\0\0\0\x07"), Some(&b"wxyz"[..]));
        assert_eq!(r.lookup(b"\0\0\0\0\0\0\x04"), None);
        r.validate();
    }

    #[test]
    fn dense1_eligibility_rejects_mismatched_value_lengths() {
        let entries: Vec<(&[u8], &[u8])> =
            vec![(b"\0\0\0\x01", b"xx"), (b"\0\0\0\x02", b"y")];
        assert!(Dense1Leaf::eligible(0, entries.into_iter()).is_none());
    }

    #[test]
    fn dense1_eligibility_rejects_non_four_byte_suffix() {
        let entries: Vec<(&[u8], &[u8])> = vec![(b"abc", b"xx"), (b"abd", b"yy")];
        assert!(Dense1Leaf::eligible(0, entries.into_iter()).is_none());
    }

    #[test]
    fn dense2_roundtrip_variable_length() {
        let mut buf = [0u8; PAGE_SIZE];
        let mut n = Dense2LeafMut::init(&mut buf, b"\0\0\0\0", b"\0\0\0\xff", 0, 16).unwrap();
        n.insert_full(b"\0\0\0\0\0\0\x03", b"short").unwrap();
        n.insert_full(b"\0\0\0\0\0\0\x07", b"a bit longer value").unwrap();

        let r = Dense2Leaf::new(&buf);
        assert_eq!(r.lookup(b"\0\0\0\0\0\0\x03"), Some(&b"short"[..]));
        assert_eq!(
            r.lookup(b"\0\0\0\0\0\0\x07"),
            Some(&b"a bit longer value"[..])
        );
        r.validate();
    }
}
