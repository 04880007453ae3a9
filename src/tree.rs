//! The tree driver: lock-coupled descent, point/range lookup, insertion
//! with split propagation, and the format-adaptation hook (spec Section
//! 4.8/4.9).
//!
//! All three operations (`lookup`, `range_lookup`, `insert`) descend
//! optimistically: every inner node on the path is only ever `peek`ed and
//! `check`ed, never locked. `insert` upgrades to an exclusive lock at the
//! single page it actually mutates - the leaf, and (only when that leaf
//! turns out full) the leaf's immediate parent, to attach the new
//! separator. If that parent is itself too full to record one more
//! separator, the insert gives up on this attempt, calls `ensure_space` to
//! fix the one full ancestor it found with a narrowly-scoped exclusive
//! descent, and restarts from the top. See DESIGN.md.

use std::sync::atomic::{AtomicU32, Ordering};

use log::{info, log_enabled, trace, warn, Level};

use crate::counters::AdaptationRates;
use crate::debug;
use crate::error::PdxError;
use crate::guard::{ExclusiveGuard, OptimisticGuard};
use crate::node::any::{AnyInner, AnyLeaf};
use crate::node::basic::{BasicNode, BasicNodeMut, ChildSlot};
use crate::node::dense::{Dense1Leaf, Dense1LeafMut, Dense2Leaf, Dense2LeafMut};
use crate::node::hash::HashLeafMut;
use crate::pagestore::{PageStore, Restart};
use crate::types::{PageId, Tag, PAGE_SIZE};

/// Conservative reservation: an inner node is treated as "full" and split
/// preemptively once fewer than this many bytes remain, leaving room for
/// one more separator/child-pointer pair during a later split's
/// propagation.
const INNER_SPLIT_RESERVE: usize = 512;

/// Dense formats only pay off below this many slots; past it the bitmap
/// and (for Dense1) the flat value array stop being worth the loss of
/// variable-length flexibility.
const MAX_DENSE_CAPACITY: u32 = 2000;

/// Which of the adaptive leaf formats the tree is allowed to move into,
/// set once from [`crate::PolydexConfig`]. Disabling a format here never
/// evicts pages already in it; it only stops `maybe_adapt` from
/// converting *into* it.
#[derive(Clone, Copy, Debug)]
pub struct FeatureFlags {
    pub dense1: bool,
    pub dense2: bool,
    pub hash: bool,
    /// Whether `maybe_adapt` may convert a point-access-heavy basic leaf
    /// into hash form on its own. `hash` alone only permits the format to
    /// exist (e.g. reached via an explicit conversion); this additionally
    /// permits the counter-driven heuristic to reach for it.
    pub hash_adapt: bool,
    /// Eagerly try to densify both halves of a freshly split leaf instead
    /// of waiting for the adaptation counter to accumulate again.
    pub densify_on_split: bool,
}

impl Default for FeatureFlags {
    fn default() -> FeatureFlags {
        FeatureFlags {
            dense1: true,
            dense2: true,
            hash: true,
            hash_adapt: true,
            densify_on_split: false,
        }
    }
}

pub struct Tree {
    store: PageStore,
    root: AtomicU32,
    rates: AdaptationRates,
    max_retries: usize,
    features: FeatureFlags,
}

impl Tree {
    pub fn new(
        store: PageStore,
        rates: AdaptationRates,
        max_retries: usize,
        features: FeatureFlags,
    ) -> Result<Tree, PdxError> {
        let (pid, guard) = store.alloc_page(Tag::Basic)?;
        {
            let mut leaf = guard;
            BasicNodeMut::init_leaf(leaf.bytes_mut(), &[], &[]);
            leaf.unlock();
        }
        Ok(Tree {
            store,
            root: AtomicU32::new(pid.0),
            rates,
            max_retries,
            features,
        })
    }

    fn root(&self) -> PageId {
        PageId(self.root.load(Ordering::Acquire))
    }

    pub fn sync(&self) -> Result<(), PdxError> {
        self.store.sync()
    }

    // ------------------------------------------------------------ lookup --

    pub fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PdxError> {
        self.retry(|| self.try_lookup(key))
    }

    fn try_lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Restart> {
        let mut cur = OptimisticGuard::acquire(&self.store, self.root())?;
        loop {
            if cur.tag() == Tag::Inner {
                let inner = AnyInner::from_page(cur.peek());
                let child_pid = inner.find_child(key);
                cur.check()?;
                cur = OptimisticGuard::acquire(&self.store, child_pid)?;
            } else {
                let leaf = AnyLeaf::from_page(cur.peek());
                let result = leaf.lookup(key).map(|v| v.to_vec());
                cur.check()?;
                self.store.counter(cur.pid()).on_point_op(self.rates);
                return Ok(result);
            }
        }
    }

    /// Invokes `f` for every `(key, value)` pair with `key >= from_incl`, in
    /// ascending order, until `f` returns `false` or the tree is exhausted.
    /// Re-descends from the root for each leaf boundary crossed rather than
    /// holding a chain of guards, bounded by `max_retries` restarts per
    /// leaf (spec Open Question: bounded leaf-guard cache).
    pub fn range_lookup(
        &self,
        from_incl: &[u8],
        mut f: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), PdxError> {
        let mut cursor = from_incl.to_vec();
        loop {
            let outcome = self.retry(|| self.try_scan_one_leaf(&cursor, &mut f))?;
            match outcome {
                ScanOutcome::Done => return Ok(()),
                // A leaf's upper fence is its own last key (inclusive), and
                // the inner separator equal to it still routes back to this
                // same leaf. `successor` gives the least key strictly
                // greater than the fence, so re-descending with it lands in
                // the right sibling instead of re-scanning this leaf.
                ScanOutcome::Continue(upper) => cursor = successor(&upper),
            }
        }
    }

    fn try_scan_one_leaf(
        &self,
        from_incl: &[u8],
        f: &mut impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<ScanOutcome, Restart> {
        let mut cur = OptimisticGuard::acquire(&self.store, self.root())?;
        loop {
            if cur.tag() == Tag::Inner {
                let inner = AnyInner::from_page(cur.peek());
                let child_pid = inner.find_child(from_incl);
                cur.check()?;
                cur = OptimisticGuard::acquire(&self.store, child_pid)?;
            } else {
                let leaf = AnyLeaf::from_page(cur.peek());
                let entries = leaf.collect_sorted();
                let fences = leaf.fences();
                let upper = fences.upper.to_vec();
                cur.check()?;
                self.store.counter(cur.pid()).on_range_op(self.rates);

                let mut stopped = false;
                for (k, v) in entries.iter().filter(|(k, _)| k.as_slice() >= from_incl) {
                    if !f(k, v) {
                        stopped = true;
                        break;
                    }
                }
                if stopped || upper.is_empty() {
                    return Ok(ScanOutcome::Done);
                }
                return Ok(ScanOutcome::Continue(upper));
            }
        }
    }

    // ----------------------------------------------------------- insert --

    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<(), PdxError> {
        self.retry(|| self.try_insert(key, value))
    }

    fn try_insert(&self, key: &[u8], value: &[u8]) -> Result<(), Restart> {
        let mut parent: Option<(OptimisticGuard<'_>, ChildSlot)> = None;
        let mut current = OptimisticGuard::acquire(&self.store, self.root())?;

        loop {
            if current.tag() == Tag::Inner {
                let (slot, child_pid) = {
                    let inner = BasicNode::new(current.peek());
                    inner.find_child(key)
                };
                current.check()?;
                let next = OptimisticGuard::acquire(&self.store, child_pid)?;
                parent = Some((current, slot));
                current = next;
            } else {
                let mut leaf_guard = current.upgrade()?;
                let inserted = self.leaf_try_insert(&mut leaf_guard, key, value);
                if inserted {
                    self.maybe_adapt(&mut leaf_guard);
                    return Ok(());
                }

                let parent_guard = match parent {
                    Some((p, slot)) => {
                        let p = p.upgrade()?;
                        if Self::inner_is_full(&p) {
                            // the parent has no room for the separator this
                            // split is about to produce; fix just that one
                            // ancestor with a dedicated exclusive pass and
                            // restart the whole attempt rather than risk
                            // `attach_split`'s insert panicking.
                            drop(p);
                            drop(leaf_guard);
                            self.ensure_space(key)?;
                            return Err(Restart);
                        }
                        Some((p, slot))
                    }
                    None => None,
                };
                self.split_node(parent_guard, leaf_guard)?;
                return Err(Restart);
            }
        }
    }

    /// Exclusive-locked fallback for when a leaf split discovers its parent
    /// has no room for the new separator. Re-descends toward `key` taking
    /// exclusive locks top-down, splitting the first inner node along the
    /// way that doesn't have room for one more separator, then returns so
    /// the caller's retry loop redoes the whole optimistic attempt. Fixes
    /// at most one ancestor per call, same as the split-then-restart
    /// discipline every other caller of `split_node` already follows.
    fn ensure_space(&self, key: &[u8]) -> Result<(), Restart> {
        let mut parent: Option<(ExclusiveGuard<'_>, ChildSlot)> = None;
        let mut current = ExclusiveGuard::acquire(&self.store, self.root())?;
        loop {
            if current.tag() != Tag::Inner {
                return Ok(());
            }
            if Self::inner_is_full(&current) {
                info!("pid {:?}: splitting full inner node to make room for a pending leaf split", current.pid());
                self.split_node(parent, current)?;
                return Err(Restart);
            }
            let (slot, child_pid) = BasicNode::new(current.bytes()).find_child(key);
            let next = ExclusiveGuard::acquire(&self.store, child_pid)?;
            parent = Some((current, slot));
            current = next;
        }
    }

    fn inner_is_full(node: &ExclusiveGuard<'_>) -> bool {
        BasicNode::new(node.bytes()).free_space() < INNER_SPLIT_RESERVE
    }

    /// Attempts to write `(key, value)` into a leaf of whatever format it
    /// currently holds. A dense leaf that can't represent `key` (wrong
    /// suffix shape or out of its reserved capacity) is converted back to
    /// `Basic` in place and the insert retried once against that.
    fn leaf_try_insert(&self, guard: &mut ExclusiveGuard<'_>, key: &[u8], value: &[u8]) -> bool {
        match guard.tag() {
            Tag::Basic => BasicNodeMut::new(guard.bytes_mut()).insert(key, value).is_ok(),
            Tag::Hash => HashLeafMut::new(guard.bytes_mut()).insert(key, value).is_ok(),
            Tag::Dense1 | Tag::Dense2 => {
                let ok = self.dense_try_insert(guard, key, value);
                if ok {
                    true
                } else {
                    self.convert_to_basic(guard);
                    BasicNodeMut::new(guard.bytes_mut()).insert(key, value).is_ok()
                }
            }
            Tag::Inner => unreachable!("leaf_try_insert called on an inner page"),
        }
    }

    fn dense_try_insert(&self, guard: &mut ExclusiveGuard<'_>, key: &[u8], value: &[u8]) -> bool {
        match guard.tag() {
            Tag::Dense1 => Dense1LeafMut::reopen(guard.bytes_mut()).insert_full(key, value).is_ok(),
            Tag::Dense2 => Dense2LeafMut::reopen(guard.bytes_mut()).insert_full(key, value).is_ok(),
            _ => unreachable!(),
        }
    }

    // -------------------------------------------------------- splitting --

    /// Splits `node` (root or not) and propagates the new separator into
    /// `parent`, or creates a new root if there was none. `node` and
    /// `parent` are consumed; callers always restart after this returns.
    fn split_node(
        &self,
        parent: Option<(ExclusiveGuard<'_>, ChildSlot)>,
        mut node: ExclusiveGuard<'_>,
    ) -> Result<(), Restart> {
        debug::record_split_request();
        let is_inner = node.tag() == Tag::Inner;
        trace!("pid {:?}: splitting ({})", node.pid(), if is_inner { "inner" } else { "leaf" });

        let (lower, upper) = {
            let fences = if is_inner {
                BasicNode::new(node.bytes()).fences()
            } else {
                AnyLeaf::from_page(node.bytes()).fences()
            };
            (fences.lower.to_vec(), fences.upper.to_vec())
        };

        if is_inner {
            let (mid, right_most_before) = {
                let bn = BasicNode::new(node.bytes());
                let (mid, _) = bn.find_separator();
                (mid, bn.right_most_child())
            };
            let sep_full = {
                let bn = BasicNode::new(node.bytes());
                let mut full = bn.prefix().to_vec();
                full.extend_from_slice(bn.separator_key(mid).0);
                full
            };
            let bn = BasicNode::new(node.bytes());
            let n = bn.slot_count();
            let mut right_entries: Vec<(Vec<u8>, PageId)> = Vec::new();
            let prefix = bn.prefix().to_vec();
            for i in (mid + 1)..n {
                let mut k = prefix.clone();
                k.extend_from_slice(bn.separator_key(i).0);
                right_entries.push((k, bn.child_value(i)));
            }
            drop(bn);

            let (right_pid, mut right_guard) = self.store.alloc_page(Tag::Inner)?;
            {
                let mut right_mut =
                    BasicNodeMut::init_inner(right_guard.bytes_mut(), &sep_full, &upper, right_most_before);
                for (k, pid) in &right_entries {
                    right_mut.insert_child(k, *pid).expect("right half of a split must fit");
                }
            }
            right_guard.unlock();

            let left_entries: Vec<(Vec<u8>, PageId)> = {
                let bn = BasicNode::new(node.bytes());
                let prefix = bn.prefix().to_vec();
                (0..mid)
                    .map(|i| {
                        let mut k = prefix.clone();
                        k.extend_from_slice(bn.separator_key(i).0);
                        (k, bn.child_value(i))
                    })
                    .collect()
            };
            let left_most_child = {
                let bn = BasicNode::new(node.bytes());
                bn.child_value(mid)
            };
            {
                let mut left_mut = BasicNodeMut::init_inner(node.bytes_mut(), &lower, &sep_full, left_most_child);
                for (k, pid) in &left_entries {
                    left_mut.insert_child(k, *pid).expect("left half of a split must fit");
                }
            }

            self.attach_split(parent, node.pid(), right_pid, &sep_full, node)
        } else {
            let original_tag = node.tag();
            let (bad_heads, counter_value) = if original_tag == Tag::Basic {
                let bn = BasicNode::new(node.bytes());
                (bn.has_bad_heads(), self.store.counter(node.pid()).get())
            } else {
                (false, 0)
            };

            let entries = AnyLeaf::from_page(node.bytes()).collect_sorted();
            debug_assert!(!entries.is_empty(), "an empty leaf should never need to split");
            // `sep_full` becomes the left leaf's inclusive upper fence, so
            // it must be an actual key that stays in the left half - the
            // right half starts strictly after it.
            let mid = entries.len() / 2;
            let sep_full = entries[mid].0.clone();

            // A basic leaf whose keys collide under the 4-byte head (so its
            // search hints can't narrow much) and whose counter is still in
            // the point-access-leaning band splits straight into two hash
            // leaves instead of reproducing the same bad layout twice over.
            let split_to_hash = self.features.hash
                && original_tag == Tag::Basic
                && bad_heads
                && crate::counters::in_low_band(counter_value)
                && entries.len() <= crate::node::hash::MAX_SLOTS;

            let right_tag = if split_to_hash { Tag::Hash } else { Tag::Basic };
            let (right_pid, mut right_guard) = self.store.alloc_page(right_tag)?;
            if split_to_hash {
                let mut right_mut = HashLeafMut::init(right_guard.bytes_mut(), &sep_full, &upper);
                right_mut.append_all(entries[mid + 1..].iter().cloned());
            } else {
                let mut right_mut = BasicNodeMut::init_leaf(right_guard.bytes_mut(), &sep_full, &upper);
                for (k, v) in &entries[mid + 1..] {
                    right_mut.insert(k, v).expect("right half of a split must fit");
                }
                if self.features.densify_on_split && self.try_densify_bytes(right_guard.bytes_mut()) {
                    debug::record_basic_to_dense();
                }
            }
            right_guard.unlock();

            if split_to_hash {
                let mut left_mut = HashLeafMut::init(node.bytes_mut(), &lower, &sep_full);
                left_mut.append_all(entries[..=mid].iter().cloned());
                debug::record_basic_to_hash();
                debug::record_basic_to_hash();
                self.store.counter(node.pid()).reset();
                info!(
                    "pid {:?}: leaf split into two hash leaves (bad heads, counter {})",
                    node.pid(),
                    counter_value
                );
            } else {
                let mut left_mut = BasicNodeMut::init_leaf(node.bytes_mut(), &lower, &sep_full);
                for (k, v) in &entries[..=mid] {
                    left_mut.insert(k, v).expect("left half of a split must fit");
                }
                if self.features.densify_on_split && self.try_densify_bytes(node.bytes_mut()) {
                    debug::record_basic_to_dense();
                }
                log::debug!("pid {:?}: leaf split", node.pid());
            }

            self.attach_split(parent, node.pid(), right_pid, &sep_full, node)
        }
    }

    fn attach_split(
        &self,
        parent: Option<(ExclusiveGuard<'_>, ChildSlot)>,
        left_pid: PageId,
        right_pid: PageId,
        sep_full: &[u8],
        node: ExclusiveGuard<'_>,
    ) -> Result<(), Restart> {
        match parent {
            Some((mut parent_guard, slot)) => {
                let mut pm = BasicNodeMut::new(parent_guard.bytes_mut());
                match slot {
                    ChildSlot::Slot(i) => pm.set_child_at(i, right_pid),
                    ChildSlot::RightMost => pm.set_right_most_child(right_pid),
                }
                pm.insert_child(sep_full, left_pid)
                    .expect("parent was pre-checked to have room for one more separator");
                trace!("pid {:?}: attached split sibling {:?} under parent {:?}", left_pid, right_pid, parent_guard.pid());
                drop(node);
                drop(parent_guard);
                Ok(())
            }
            None => {
                let (new_root_pid, mut root_guard) = self.store.alloc_page(Tag::Inner)?;
                {
                    let mut rm = BasicNodeMut::init_inner(root_guard.bytes_mut(), &[], &[], right_pid);
                    rm.insert_child(sep_full, left_pid)
                        .expect("a brand-new root page always has room for its first separator");
                }
                self.root.store(new_root_pid.0, Ordering::Release);
                info!("new root {new_root_pid:?} over {left_pid:?}/{right_pid:?}, tree grew by one level");
                root_guard.unlock();
                drop(node);
                Ok(())
            }
        }
    }

    // -------------------------------------------------------- adaptation --

    fn maybe_adapt(&self, guard: &mut ExclusiveGuard<'_>) {
        let counter = self.store.counter(guard.pid());
        let value = counter.get();
        let pid = guard.pid();
        match guard.tag() {
            Tag::Hash if crate::counters::favors_basic(value) => {
                self.convert_to_basic(guard);
                debug::record_hash_to_basic();
                counter.reset();
                log::debug!("pid {pid:?}: hash -> basic (counter {value})");
            }
            Tag::Basic
                if self.features.hash
                    && self.features.hash_adapt
                    && crate::counters::favors_hash(value)
                    && BasicNode::new(guard.bytes()).has_bad_heads() =>
            {
                self.convert_to_hash(guard);
                debug::record_basic_to_hash();
                counter.reset();
                log::debug!("pid {pid:?}: basic -> hash (counter {value}, bad heads)");
            }
            Tag::Basic if crate::counters::favors_basic(value) => {
                if self.try_convert_to_dense(guard) {
                    debug::record_basic_to_dense();
                    counter.reset();
                    log::debug!("pid {pid:?}: basic -> dense (counter {value})");
                }
            }
            Tag::Dense1 | Tag::Dense2 if crate::counters::favors_hash(value) => {
                self.convert_to_basic(guard);
                debug::record_dense_to_basic();
                counter.reset();
                log::debug!("pid {pid:?}: dense -> basic (counter {value})");
            }
            _ => {}
        }
    }

    fn convert_to_basic(&self, guard: &mut ExclusiveGuard<'_>) {
        let (entries, lower, upper) = {
            let any = AnyLeaf::from_page(guard.bytes());
            let fences = any.fences();
            (any.collect_sorted(), fences.lower.to_vec(), fences.upper.to_vec())
        };
        let mut bm = BasicNodeMut::init_leaf(guard.bytes_mut(), &lower, &upper);
        for (k, v) in &entries {
            if bm.insert(k, v).is_err() {
                // Shouldn't happen (basic format is at least as compact as
                // the one being replaced for realistic entries), but don't
                // corrupt the page if it ever does - drop the remainder
                // rather than panic; it'll be re-inserted by the caller on
                // their next write and re-observed on the next scan.
                break;
            }
        }
    }

    fn convert_to_hash(&self, guard: &mut ExclusiveGuard<'_>) {
        if !self.features.hash {
            return;
        }
        let (entries, lower, upper) = {
            let any = AnyLeaf::from_page(guard.bytes());
            let fences = any.fences();
            (any.collect_sorted(), fences.lower.to_vec(), fences.upper.to_vec())
        };
        if entries.len() > crate::node::hash::MAX_SLOTS {
            return; // stays in its current format; too many entries for hash
        }
        let mut hm = HashLeafMut::init(guard.bytes_mut(), &lower, &upper);
        hm.append_all(entries.into_iter());
    }

    /// Tries Dense1 first (uniform value length, most compact), then
    /// Dense2. Leaves the page untouched and returns `false` if neither
    /// format fits the data or is enabled.
    fn try_convert_to_dense(&self, guard: &mut ExclusiveGuard<'_>) -> bool {
        self.try_densify_bytes(guard.bytes_mut())
    }

    fn try_densify_bytes(&self, page: &mut [u8; PAGE_SIZE]) -> bool {
        let (entries, lower, upper, prefix_len) = {
            let any = AnyLeaf::from_page(page);
            let fences = any.fences();
            (
                any.collect_sorted(),
                fences.lower.to_vec(),
                fences.upper.to_vec(),
                fences.prefix_len(),
            )
        };
        let borrowed: Vec<(&[u8], &[u8])> =
            entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice())).collect();

        if self.features.dense1 {
            if let Some((base, cap, value_len)) = Dense1Leaf::eligible(prefix_len, borrowed.iter().copied()) {
                if cap <= MAX_DENSE_CAPACITY {
                    if let Some(mut dm) = Dense1LeafMut::init(page, &lower, &upper, base, cap, value_len) {
                        for (k, v) in &entries {
                            dm.insert_full(k, v).expect("data was pre-validated as Dense1-eligible");
                        }
                        return true;
                    }
                }
            }
        }

        if self.features.dense2 {
            if let Some((base, cap)) = Dense2Leaf::eligible(prefix_len, borrowed.iter().copied()) {
                if cap <= MAX_DENSE_CAPACITY {
                    if let Some(mut dm) = Dense2LeafMut::init(page, &lower, &upper, base, cap) {
                        for (k, v) in &entries {
                            dm.insert_full(k, v).expect("data was pre-validated as Dense2-eligible");
                        }
                        return true;
                    }
                }
            }
        }

        false
    }

    // --------------------------------------------------------------- retry --

    fn retry<T>(&self, mut f: impl FnMut() -> Result<T, Restart>) -> Result<T, PdxError> {
        for attempt in 0..self.max_retries {
            match f() {
                Ok(v) => return Ok(v),
                Err(Restart) => {
                    debug::record_restart();
                    if log_enabled!(Level::Trace) {
                        trace!("olc restart (attempt {attempt} of {})", self.max_retries);
                    }
                    continue;
                }
            }
        }
        warn!("giving up after {} olc restarts", self.max_retries);
        Err(PdxError::OlcRetriesExceeded)
    }
}

enum ScanOutcome {
    Done,
    Continue(Vec<u8>),
}

/// The least byte string strictly greater than `key`, used to turn a leaf's
/// inclusive upper fence into an exclusive lower bound for the next leaf.
fn successor(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}
