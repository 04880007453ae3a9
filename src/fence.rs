//! Fence-key bookkeeping shared by every node format (spec Section 3).

use crate::types::{common_prefix_len, PrefixTruncatedKey};

/// A page's lower (exclusive) and upper (inclusive) fence keys, plus the
/// length of their common prefix. An empty lower fence means "no lower
/// bound" (the page is the leftmost in its level); an empty upper fence
/// means "no upper bound" (the page is the rightmost).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FenceData<'a> {
    pub lower: &'a [u8],
    pub upper: &'a [u8],
}

impl<'a> FenceData<'a> {
    pub fn prefix_len(&self) -> usize {
        if self.lower.is_empty() || self.upper.is_empty() {
            // An empty fence carries no information to share a prefix with;
            // only a genuinely bounded-both-sides page gets truncation.
            0
        } else {
            common_prefix_len(self.lower, self.upper)
        }
    }

    pub fn prefix(&self) -> &'a [u8] {
        &self.lower[..self.prefix_len()]
    }

    /// A key `k` belongs in this page iff `lower < k <= upper` (or the
    /// corresponding bound is absent).
    pub fn contains(&self, key: &[u8]) -> bool {
        let above_lower = self.lower.is_empty() || key > self.lower;
        let below_upper = self.upper.is_empty() || key <= self.upper;
        above_lower && below_upper
    }

    pub fn truncate<'k>(&self, key: &'k [u8]) -> PrefixTruncatedKey<'k> {
        PrefixTruncatedKey(&key[self.prefix_len()..])
    }

    #[cfg(debug_assertions)]
    pub fn validate(&self) {
        if !self.lower.is_empty() && !self.upper.is_empty() {
            debug_assert!(
                self.lower < self.upper,
                "lower fence must be strictly less than upper fence"
            );
        }
    }
}
