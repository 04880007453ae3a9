//! The page store: a virtual array of fixed-size frames addressed by
//! [`PageId`], the per-page versioned lock word, and second-chance
//! eviction over [`IoEngine`] (spec Section 4.1).
//!
//! Frames are allocated once, up front, for the whole virtual address
//! range (mirroring `quickstep::btree::BPTree`'s slab allocation). "Evicted"
//! therefore does not reclaim process memory in this implementation - it
//! only flips the page's logical residency so the state machine and
//! `handle_fault` contract match the spec exactly; see DESIGN.md for why
//! that's an acceptable simplification here.

use std::{
    alloc::{alloc, dealloc, Layout},
    collections::VecDeque,
    path::Path,
    ptr::NonNull,
    sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering},
    sync::Mutex,
};

use log::{debug, warn};

use crate::counters::{Counter, SENTINEL};
use crate::error::PdxError;
use crate::io_engine::IoEngine;
use crate::types::{PageId, Tag, PAGE_SIZE};

pub type PageBuf = [u8; PAGE_SIZE];

const STATE_BITS: u32 = 3;
const COUNT_BITS: u32 = 9;
const STATE_SHIFT: u32 = 0;
const COUNT_SHIFT: u32 = STATE_BITS;
const VERSION_SHIFT: u32 = STATE_BITS + COUNT_BITS;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;
const COUNT_MASK: u64 = ((1 << COUNT_BITS) - 1) << COUNT_SHIFT;
const MAX_SHARED: u32 = 252;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u64)]
pub enum PageState {
    Unlocked = 0,
    Shared = 1,
    Locked = 2,
    Marked = 3,
    Evicted = 4,
}

impl PageState {
    fn from_bits(bits: u64) -> PageState {
        match bits {
            0 => PageState::Unlocked,
            1 => PageState::Shared,
            2 => PageState::Locked,
            3 => PageState::Marked,
            4 => PageState::Evicted,
            _ => unreachable!("invalid page state bits"),
        }
    }
}

/// Decoded view of a page-state atomic word.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Word {
    pub state: PageState,
    pub shared_count: u32,
    pub version: u64,
}

impl Word {
    fn encode(self) -> u64 {
        ((self.version) << VERSION_SHIFT)
            | ((self.shared_count as u64) << COUNT_SHIFT)
            | (self.state as u64)
    }

    fn decode(bits: u64) -> Word {
        Word {
            state: PageState::from_bits(bits & STATE_MASK),
            shared_count: ((bits & COUNT_MASK) >> COUNT_SHIFT) as u32,
            version: bits >> VERSION_SHIFT,
        }
    }

    /// True when a concurrent optimistic reader holding this word's version
    /// must restart outright, independent of whether the version matches.
    pub fn blocks_optimistic_read(self) -> bool {
        matches!(self.state, PageState::Locked | PageState::Evicted)
    }
}

pub struct PageStore {
    frames: NonNull<PageBuf>,
    layout: Layout,
    cap: u32,
    state: Box<[AtomicU64]>,
    counters: Box<[AtomicU8]>,
    next_free: AtomicU32,
    physical_budget: usize,
    resident_count: AtomicUsize,
    resident_ring: Mutex<VecDeque<PageId>>,
    io: IoEngine,
}

unsafe impl Send for PageStore {}
unsafe impl Sync for PageStore {}

impl PageStore {
    pub fn new(
        path: &Path,
        virtual_pages: u32,
        physical_page_budget: usize,
    ) -> Result<PageStore, PdxError> {
        if virtual_pages == 0 {
            return Err(PdxError::BadConfig("virtual_pages must be nonzero"));
        }
        let layout = Layout::array::<PageBuf>(virtual_pages as usize)
            .map_err(|_| PdxError::BadConfig("virtual address range too large"))?;
        let raw = unsafe { alloc(layout) };
        let frames = NonNull::new(raw as *mut PageBuf)
            .ok_or(PdxError::BadConfig("failed to reserve virtual address range"))?;

        let mut state = Vec::with_capacity(virtual_pages as usize);
        state.resize_with(virtual_pages as usize, || AtomicU64::new(0));

        let mut counters = Vec::with_capacity(virtual_pages as usize);
        counters.resize_with(virtual_pages as usize, || AtomicU8::new(SENTINEL));

        let io = IoEngine::open(path)?;

        let store = PageStore {
            frames,
            layout,
            cap: virtual_pages,
            state: state.into_boxed_slice(),
            counters: counters.into_boxed_slice(),
            next_free: AtomicU32::new(1), // pid 0 is the metadata page
            physical_budget: physical_page_budget.max(1),
            resident_count: AtomicUsize::new(0),
            resident_ring: Mutex::new(VecDeque::new()),
            io,
        };

        // The metadata page is allocated eagerly and starts resident.
        store.state[0].store(Word { state: PageState::Unlocked, shared_count: 0, version: 0 }.encode(), Ordering::Relaxed);
        store.resident_ring.lock().unwrap().push_back(PageId::METADATA);
        store.resident_count.fetch_add(1, Ordering::Relaxed);

        Ok(store)
    }

    pub fn cap(&self) -> u32 {
        self.cap
    }

    /// Allocates a fresh page, tagged and exclusively locked from birth
    /// (spec Section 3, "Lifecycles").
    pub fn alloc_page(&self, tag: Tag) -> Result<(PageId, ExclusivePageRef<'_>), PdxError> {
        let idx = self.next_free.fetch_add(1, Ordering::AcqRel);
        if idx >= self.cap {
            return Err(PdxError::StoreFull);
        }
        let pid = PageId(idx);

        self.state[idx as usize].store(
            Word { state: PageState::Locked, shared_count: 0, version: 0 }.encode(),
            Ordering::Release,
        );

        let buf = unsafe { self.frame_mut(pid) };
        buf.fill(0);
        buf[0] = tag as u8;

        self.resident_ring.lock().unwrap().push_back(pid);
        let resident_now = self.resident_count.fetch_add(1, Ordering::Relaxed) + 1;
        if resident_now > self.physical_budget {
            self.evict_sweep();
        }

        Ok((pid, ExclusivePageRef { store: self, pid }))
    }

    #[inline]
    unsafe fn frame_mut(&self, pid: PageId) -> &mut PageBuf {
        &mut *self.frames.as_ptr().add(pid.0 as usize)
    }

    #[inline]
    unsafe fn frame_ref(&self, pid: PageId) -> &PageBuf {
        &*self.frames.as_ptr().add(pid.0 as usize)
    }

    fn word_cell(&self, pid: PageId) -> &AtomicU64 {
        &self.state[pid.0 as usize]
    }

    pub fn load(&self, pid: PageId) -> Word {
        Word::decode(self.word_cell(pid).load(Ordering::Acquire))
    }

    pub fn tag(&self, pid: PageId) -> Tag {
        unsafe { Tag::from_u8_unchecked(self.frame_ref(pid)[0]) }
    }

    pub fn is_dirty(&self, pid: PageId) -> bool {
        unsafe { self.frame_ref(pid)[1] & 1 != 0 }
    }

    pub fn set_dirty(&self, pid: PageId) {
        unsafe { self.frame_mut(pid)[1] |= 1 }
    }

    fn clear_dirty(&self, pid: PageId) {
        unsafe { self.frame_mut(pid)[1] &= !1 }
    }

    /// The out-of-band adaptation counter for `pid`, valid under any guard
    /// (it is updated independent of the page's own lock, by design - see
    /// DESIGN.md).
    pub fn counter(&self, pid: PageId) -> Counter<'_> {
        Counter::new(&self.counters[pid.0 as usize])
    }

    /// Raw byte access. Safe to call under any guard; callers must not
    /// mutate through a shared/optimistic borrow.
    pub fn page_bytes(&self, pid: PageId) -> &PageBuf {
        unsafe { self.frame_ref(pid) }
    }

    /// # Safety
    /// Caller must hold an exclusive lock on `pid`.
    pub unsafe fn page_bytes_mut(&self, pid: PageId) -> &mut PageBuf {
        self.frame_mut(pid)
    }

    // ---- state transitions -------------------------------------------------

    pub fn try_lock_x(&self, pid: PageId) -> Result<Word, Restart> {
        let cell = self.word_cell(pid);
        let mut cur = cell.load(Ordering::Acquire);
        loop {
            let w = Word::decode(cur);
            if !matches!(
                w.state,
                PageState::Unlocked | PageState::Marked | PageState::Evicted
            ) {
                return Err(Restart);
            }
            let new = Word {
                state: PageState::Locked,
                shared_count: 0,
                version: w.version,
            };
            match cell.compare_exchange_weak(
                cur,
                new.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if w.state == PageState::Evicted {
                        if let Err(e) = self.handle_fault(pid) {
                            warn!("page store fault-in failed for {pid:?}: {e}");
                            // Leave the page locked; caller will drop the guard
                            // and the unlock path restores a usable state.
                        }
                    }
                    return Ok(new);
                }
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn try_lock_s(&self, pid: PageId) -> Result<Word, Restart> {
        let cell = self.word_cell(pid);
        let mut cur = cell.load(Ordering::Acquire);
        loop {
            let w = Word::decode(cur);
            let new = match w.state {
                PageState::Unlocked | PageState::Marked => Word {
                    state: PageState::Shared,
                    shared_count: 1,
                    version: w.version,
                },
                PageState::Shared if w.shared_count < MAX_SHARED => Word {
                    state: PageState::Shared,
                    shared_count: w.shared_count + 1,
                    version: w.version,
                },
                _ => return Err(Restart),
            };
            match cell.compare_exchange_weak(
                cur,
                new.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(new),
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn try_mark(&self, pid: PageId) -> Result<(), Restart> {
        let cell = self.word_cell(pid);
        let cur = cell.load(Ordering::Acquire);
        let w = Word::decode(cur);
        if w.state != PageState::Unlocked {
            return Err(Restart);
        }
        let new = Word {
            state: PageState::Marked,
            shared_count: 0,
            version: w.version,
        };
        cell.compare_exchange(cur, new.encode(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Restart)
    }

    pub fn unlock_x(&self, pid: PageId) {
        let cell = self.word_cell(pid);
        let cur = Word::decode(cell.load(Ordering::Acquire));
        debug_assert_eq!(cur.state, PageState::Locked);
        cell.store(
            Word {
                state: PageState::Unlocked,
                shared_count: 0,
                version: cur.version + 1,
            }
            .encode(),
            Ordering::Release,
        );
    }

    pub fn unlock_x_evicted(&self, pid: PageId) {
        let cell = self.word_cell(pid);
        let cur = Word::decode(cell.load(Ordering::Acquire));
        debug_assert_eq!(cur.state, PageState::Locked);
        cell.store(
            Word {
                state: PageState::Evicted,
                shared_count: 0,
                version: cur.version + 1,
            }
            .encode(),
            Ordering::Release,
        );
    }

    /// Returns the post-downgrade version, per spec 4.2.
    pub fn downgrade_x_to_o(&self, pid: PageId) -> u64 {
        let cell = self.word_cell(pid);
        let cur = Word::decode(cell.load(Ordering::Acquire));
        debug_assert_eq!(cur.state, PageState::Locked);
        let new_version = cur.version + 1;
        cell.store(
            Word {
                state: PageState::Unlocked,
                shared_count: 0,
                version: new_version,
            }
            .encode(),
            Ordering::Release,
        );
        new_version
    }

    pub fn unlock_s(&self, pid: PageId) {
        let cell = self.word_cell(pid);
        let mut cur = cell.load(Ordering::Acquire);
        loop {
            let w = Word::decode(cur);
            debug_assert_eq!(w.state, PageState::Shared);
            let new = if w.shared_count <= 1 {
                Word {
                    state: PageState::Unlocked,
                    shared_count: 0,
                    version: w.version,
                }
            } else {
                Word {
                    state: PageState::Shared,
                    shared_count: w.shared_count - 1,
                    version: w.version,
                }
            };
            match cell.compare_exchange_weak(
                cur,
                new.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Opportunistically clears a `Marked` page back to `Unlocked` if the
    /// version still matches; failure is silently ignored (another thread
    /// raced us, which is fine - see spec 4.2).
    pub fn clear_mark_if_unchanged(&self, pid: PageId, version: u64) {
        let cell = self.word_cell(pid);
        let cur = Word {
            state: PageState::Marked,
            shared_count: 0,
            version,
        };
        let new = Word {
            state: PageState::Unlocked,
            shared_count: 0,
            version,
        };
        let _ = cell.compare_exchange(cur.encode(), new.encode(), Ordering::AcqRel, Ordering::Acquire);
    }

    /// # Safety
    /// Caller must hold `Locked` on an `Evicted` page.
    fn handle_fault(&self, pid: PageId) -> Result<(), PdxError> {
        if pid.is_metadata() {
            return Ok(());
        }
        let buf = unsafe { self.frame_mut(pid) };
        self.io.read_page(pid, buf)?;
        self.resident_ring.lock().unwrap().push_back(pid);
        let resident_now = self.resident_count.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("faulted in page {pid:?}, resident count now {resident_now}");
        if resident_now > self.physical_budget {
            self.evict_sweep();
        }
        Ok(())
    }

    /// One clock sweep: mark-then-evict, per spec 4.1 "Eviction".
    pub fn evict_sweep(&self) {
        let candidates: Vec<PageId> = {
            let ring = self.resident_ring.lock().unwrap();
            ring.iter().copied().collect()
        };

        let mut to_evict = Vec::new();
        let mut to_write = Vec::new();

        for pid in candidates {
            if pid.is_metadata() {
                continue;
            }
            let w = self.load(pid);
            match w.state {
                PageState::Marked if !self.is_dirty(pid) => to_evict.push(pid),
                PageState::Marked => {
                    if self.try_lock_s(pid).is_ok() {
                        to_write.push(pid);
                    }
                }
                PageState::Unlocked => {
                    let _ = self.try_mark(pid);
                }
                _ => {}
            }
        }

        for pid in &to_write {
            if let Err(e) = self.io.write_page(*pid, self.page_bytes(*pid)) {
                warn!("page store writeback failed for {pid:?}: {e}");
                self.unlock_s(*pid);
                continue;
            }
            // try to upgrade the shared lock we hold to exclusive so we can
            // flip the page to Evicted; if another reader got in first we
            // simply leave it resident for the next sweep.
            self.unlock_s(*pid);
            if self.try_lock_x(*pid).is_ok() {
                self.clear_dirty(*pid);
                self.unlock_x_evicted(*pid);
                to_evict.push(*pid);
            }
        }

        for pid in &to_evict {
            if self.try_lock_x(*pid).is_ok() {
                self.unlock_x_evicted(*pid);
            }
        }

        if !to_evict.is_empty() {
            let mut ring = self.resident_ring.lock().unwrap();
            ring.retain(|p| !to_evict.contains(p));
            self.resident_count
                .fetch_sub(to_evict.len(), Ordering::Relaxed);
        }
    }

    pub fn sync(&self) -> Result<(), PdxError> {
        Ok(self.io.sync()?)
    }
}

impl Drop for PageStore {
    fn drop(&mut self) {
        unsafe { dealloc(self.frames.as_ptr() as *mut u8, self.layout) }
    }
}

/// Zero-sized control-flow signal for an optimistic-lock-coupling restart.
/// Never surfaced to callers; see spec Section 5, "Restart semantics".
#[derive(Debug, Clone, Copy)]
pub struct Restart;

/// A page freshly returned from `alloc_page`, already exclusively locked.
pub struct ExclusivePageRef<'s> {
    store: &'s PageStore,
    pid: PageId,
}

impl<'s> ExclusivePageRef<'s> {
    pub fn pid(&self) -> PageId {
        self.pid
    }

    pub fn bytes_mut(&mut self) -> &mut PageBuf {
        unsafe { self.store.frame_mut(self.pid) }
    }

    pub fn bytes(&self) -> &PageBuf {
        unsafe { self.store.frame_ref(self.pid) }
    }

    pub fn unlock(self) {
        self.store.set_dirty(self.pid);
        self.store.unlock_x(self.pid);
        std::mem::forget(self);
    }
}

impl<'s> Drop for ExclusivePageRef<'s> {
    fn drop(&mut self) {
        self.store.set_dirty(self.pid);
        self.store.unlock_x(self.pid);
    }
}
