//! Polydex - a concurrent, ordered, embedded key-value index whose leaves
//! autonomously switch between four page formats (basic slotted, dense-1,
//! dense-2, hash) depending on how each leaf is actually accessed.
//!
//! The data structure is a Bf-tree: inner nodes are a single slotted
//! format, optimistic lock coupling drives concurrent reads, and a
//! buffer-managed page store evicts cold pages with second-chance
//! replacement. See `DESIGN.md` for the grounding of each piece.

use std::path::{Path, PathBuf};

use log::info;

use crate::counters::AdaptationRates;
use crate::error::PdxError;
use crate::pagestore::PageStore;
use crate::tree::{FeatureFlags, Tree};
use crate::types::PAGE_SIZE;

pub mod counters;
pub mod debug;
pub mod error;
pub mod fence;
pub mod guard;
pub mod io_engine;
pub mod node;
pub mod pagestore;
pub mod rand;
pub mod tree;
pub mod types;
pub mod utils;

/// Largest `key.len() + value.len()` any leaf format can hold; a page must
/// fit its header, one fence pair, and at least one entry, so this is kept
/// a conservative fraction of [`PAGE_SIZE`] rather than the exact
/// worst-case remainder.
pub const MAX_KV_SIZE: usize = PAGE_SIZE / 4;

/// Configuration for a [`Polydex`] instance, read once at construction
/// (spec Section 6, "Environment / configuration").
///
/// Built via [`PolydexConfig::new`] plus chained `with_*` setters, then
/// passed to [`Polydex::open`], which validates it and returns
/// [`PdxError::BadConfig`] rather than panicking on a bad value.
#[derive(Clone, Debug)]
pub struct PolydexConfig {
    path: PathBuf,
    virtual_pages: u32,
    physical_page_budget: usize,
    workers: usize,
    page_size: usize,
    dense1: bool,
    dense2: bool,
    hash: bool,
    hash_adapt: bool,
    densify_on_split: bool,
    prefix_truncation: bool,
    basic_head: bool,
    hint_count: bool,
    rates: AdaptationRates,
    max_retries: usize,
}

impl PolydexConfig {
    /// Starts from the defaults below, pointed at `path` as the backing
    /// file (or directory - see [`resolve_data_path`]).
    ///
    /// - `virtual_pages`: 1 << 20 (a 4 GiB virtual address range)
    /// - `physical_page_budget`: 16384 resident pages (64 MiB)
    /// - `workers`: 1
    /// - all four leaf formats and eager split-time densification: see
    ///   their respective `with_*` doc comments
    /// - `max_retries`: 64 OLC restarts before giving up
    pub fn new<P: Into<PathBuf>>(path: P) -> PolydexConfig {
        PolydexConfig {
            path: path.into(),
            virtual_pages: 1 << 20,
            physical_page_budget: 16384,
            workers: 1,
            page_size: PAGE_SIZE,
            dense1: true,
            dense2: true,
            hash: true,
            hash_adapt: true,
            densify_on_split: false,
            prefix_truncation: true,
            basic_head: true,
            hint_count: true,
            rates: AdaptationRates::default(),
            max_retries: 64,
        }
    }

    /// Size of the virtual page-id address range. Pages are never
    /// reclaimed, so this is an upper bound on how many pages (inner and
    /// leaf) the tree can ever allocate over its lifetime.
    pub fn with_virtual_pages(mut self, virtual_pages: u32) -> PolydexConfig {
        self.virtual_pages = virtual_pages;
        self
    }

    /// How many pages the buffer pool keeps resident before the
    /// second-chance eviction sweep starts writing cold pages back and
    /// marking them evicted.
    pub fn with_physical_page_budget(mut self, physical_page_budget: usize) -> PolydexConfig {
        self.physical_page_budget = physical_page_budget;
        self
    }

    /// Recorded for callers sizing their own thread pools against this
    /// store; the store itself has no internal worker threads to size.
    pub fn with_workers(mut self, workers: usize) -> PolydexConfig {
        self.workers = workers;
        self
    }

    /// Must equal the compiled-in page size ([`PAGE_SIZE`]); every node
    /// format's byte layout is fixed at that width, so this exists as a
    /// named, checked config value rather than a silently-ignored one.
    pub fn with_page_size(mut self, page_size: usize) -> PolydexConfig {
        self.page_size = page_size;
        self
    }

    /// Allow `maybe_adapt` to convert range-accessed basic leaves with a
    /// uniform, exactly-4-byte key suffix and uniform value length into
    /// the flat dense-1 format.
    pub fn with_dense1(mut self, enabled: bool) -> PolydexConfig {
        self.dense1 = enabled;
        self
    }

    /// Same as [`Self::with_dense1`] for the variable-value-length
    /// dense-2 format.
    pub fn with_dense2(mut self, enabled: bool) -> PolydexConfig {
        self.dense2 = enabled;
        self
    }

    /// Allow the hash format to exist at all (reachable via explicit
    /// conversion). Disabling this also disables [`Self::with_hash_adapt`]
    /// regardless of its own setting.
    pub fn with_hash(mut self, enabled: bool) -> PolydexConfig {
        self.hash = enabled;
        self
    }

    /// Allow `maybe_adapt` to convert a point-access-heavy basic leaf into
    /// hash form on its own, on top of [`Self::with_hash`] permitting the
    /// format to exist.
    pub fn with_hash_adapt(mut self, enabled: bool) -> PolydexConfig {
        self.hash_adapt = enabled;
        self
    }

    /// Try to densify both halves of a freshly split leaf immediately,
    /// instead of waiting for their adaptation counters to accumulate
    /// again from scratch.
    pub fn with_densify_on_split(mut self, enabled: bool) -> PolydexConfig {
        self.densify_on_split = enabled;
        self
    }

    /// Whether to strip each page's longest common key prefix before
    /// storing entries. This implementation's fence/node layout assumes
    /// prefix truncation throughout, so only `true` validates.
    pub fn with_prefix_truncation(mut self, enabled: bool) -> PolydexConfig {
        self.prefix_truncation = enabled;
        self
    }

    /// Whether basic-node binary search compares a 4-byte integer "head"
    /// before falling back to a full key comparison. Baked into
    /// `BasicNode::search`, so only `true` validates.
    pub fn with_basic_head(mut self, enabled: bool) -> PolydexConfig {
        self.basic_head = enabled;
        self
    }

    /// Whether basic nodes keep a search-hint array alongside their slot
    /// array. `BasicNode::search` always builds and consults one, so only
    /// `true` validates; see DESIGN.md.
    pub fn with_hint_count(mut self, enabled: bool) -> PolydexConfig {
        self.hint_count = enabled;
        self
    }

    /// Probabilities that a range/point access nudges a leaf's
    /// adaptation counter; see [`AdaptationRates`].
    pub fn with_adaptation_rates(mut self, rates: AdaptationRates) -> PolydexConfig {
        self.rates = rates;
        self
    }

    /// How many OLC restarts an operation tolerates before giving up with
    /// [`PdxError::OlcRetriesExceeded`].
    pub fn with_max_retries(mut self, max_retries: usize) -> PolydexConfig {
        self.max_retries = max_retries;
        self
    }

    fn validate(&self) -> Result<(), PdxError> {
        if self.virtual_pages == 0 {
            return Err(PdxError::BadConfig("virtual_pages must be nonzero"));
        }
        if self.physical_page_budget == 0 {
            return Err(PdxError::BadConfig("physical_page_budget must hold at least one page"));
        }
        if self.workers == 0 {
            return Err(PdxError::BadConfig("workers must be nonzero"));
        }
        if self.page_size != PAGE_SIZE {
            return Err(PdxError::BadConfig("page_size must equal the compiled-in PAGE_SIZE"));
        }
        if !self.prefix_truncation {
            return Err(PdxError::BadConfig(
                "prefix_truncation is load-bearing in this node layout and cannot be disabled",
            ));
        }
        if !self.basic_head {
            return Err(PdxError::BadConfig(
                "basic_head is load-bearing in BasicNode::search and cannot be disabled",
            ));
        }
        if !self.hint_count {
            return Err(PdxError::BadConfig(
                "hint_count is load-bearing in BasicNode::search and cannot be disabled",
            ));
        }
        if self.max_retries == 0 {
            return Err(PdxError::BadConfig("max_retries must be nonzero"));
        }
        Ok(())
    }

    fn features(&self) -> FeatureFlags {
        FeatureFlags {
            dense1: self.dense1,
            dense2: self.dense2,
            hash: self.hash,
            hash_adapt: self.hash_adapt,
            densify_on_split: self.densify_on_split,
        }
    }
}

/// A concurrent ordered key-value index. Cheap to share across threads -
/// clone the surrounding `Arc`, not this type itself; every method takes
/// `&self` and relies on the tree driver's lock coupling for isolation.
pub struct Polydex {
    tree: Tree,
}

impl Polydex {
    /// Opens (or creates) the backing file named by `config` and builds an
    /// empty tree over it if the file was just created.
    pub fn open(config: PolydexConfig) -> Result<Polydex, PdxError> {
        config.validate()?;
        let data_path = resolve_data_path(&config.path);
        info!("opening polydex store at {}", data_path.display());

        let store = PageStore::new(&data_path, config.virtual_pages, config.physical_page_budget)?;
        let tree = Tree::new(store, config.rates, config.max_retries, config.features())?;
        Ok(Polydex { tree })
    }

    /// Inserts `value` at `key`, overwriting any existing value.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<(), PdxError> {
        if key.len() + value.len() > MAX_KV_SIZE {
            return Err(PdxError::HarnessTooBig);
        }
        self.tree.insert(key, value)
    }

    /// Looks up `key`, returning a copy of its value if present.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PdxError> {
        self.tree.lookup(key)
    }

    /// Visits every `(key, value)` pair with `key >= from_incl` in
    /// ascending order, until `f` returns `false` or the index is
    /// exhausted.
    pub fn range(&self, from_incl: &[u8], f: impl FnMut(&[u8], &[u8]) -> bool) -> Result<(), PdxError> {
        self.tree.range_lookup(from_incl, f)
    }

    /// Forces any dirty resident pages to the backing file. There is no
    /// write-ahead log; a crash between writes and this call can lose
    /// recent inserts, matching Section 7's "no recovery beyond page
    /// writeback" non-goal.
    pub fn sync(&self) -> Result<(), PdxError> {
        self.tree.sync()
    }
}

/// If `path` names a directory (or has no extension), the store lives at
/// `path/polydex.db`; otherwise `path` itself is the backing file.
fn resolve_data_path(path: &Path) -> PathBuf {
    if path.is_dir() || path.extension().is_none() {
        path.join("polydex.db")
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_page_size() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PolydexConfig::new(dir.path()).with_page_size(512);
        assert!(matches!(Polydex::open(cfg), Err(PdxError::BadConfig(_))));
    }

    #[test]
    fn rejects_zero_workers() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PolydexConfig::new(dir.path()).with_workers(0);
        assert!(matches!(Polydex::open(cfg), Err(PdxError::BadConfig(_))));
    }

    #[test]
    fn insert_then_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db = Polydex::open(PolydexConfig::new(dir.path())).unwrap();
        db.insert(b"alpha", b"1").unwrap();
        db.insert(b"beta", b"2").unwrap();
        assert_eq!(db.get(b"alpha").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(b"missing").unwrap(), None);
    }

    #[test]
    fn rejects_oversized_entry() {
        let dir = tempfile::tempdir().unwrap();
        let db = Polydex::open(PolydexConfig::new(dir.path())).unwrap();
        let huge = vec![0u8; MAX_KV_SIZE + 1];
        assert!(matches!(db.insert(b"k", &huge), Err(PdxError::HarnessTooBig)));
    }
}
