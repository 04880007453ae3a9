//! Lock-coupling guards over [`PageStore`] (spec Section 4.2). Three
//! flavors, matching the thesis/teacher lineage: `Optimistic` (version
//! snapshot, no blocking), `Shared` (reader lock) and `Exclusive` (writer
//! lock). All three are affine - dropping one releases its lock, and
//! `OptimisticGuard::check` is the only way to "redeem" the snapshot into a
//! value you can trust.

use std::marker::PhantomData;

use crate::pagestore::{PageState, PageStore, Restart};
use crate::types::{PageId, Tag, PAGE_SIZE};

/// An unvalidated snapshot of a page's contents. Reading through it is safe
/// (no data race - the writer always installs a new version before anyone
/// can observe torn bytes under our CAS discipline) but the contents may be
/// stale or mid-write; callers must call `check` before acting on anything
/// derived from them.
pub struct OptimisticGuard<'s> {
    store: &'s PageStore,
    pid: PageId,
    version: u64,
}

impl<'s> OptimisticGuard<'s> {
    pub fn acquire(store: &'s PageStore, pid: PageId) -> Result<OptimisticGuard<'s>, Restart> {
        let w = store.load(pid);
        if w.blocks_optimistic_read() {
            return Err(Restart);
        }
        Ok(OptimisticGuard {
            store,
            pid,
            version: w.version,
        })
    }

    pub fn pid(&self) -> PageId {
        self.pid
    }

    /// Reads the page's bytes without validating. Any decision made from
    /// this slice must be re-checked with `check` before being trusted.
    pub fn peek(&self) -> &'s [u8; PAGE_SIZE] {
        self.store.page_bytes(self.pid)
    }

    pub fn tag(&self) -> Tag {
        self.store.tag(self.pid)
    }

    /// Validates that nothing changed (and no writer interposed) since
    /// `acquire`. On success, opportunistically clears a `Marked` page back
    /// to `Unlocked` - the page was read, so it's no longer an eviction
    /// candidate the buffer manager can skip.
    pub fn check(&self) -> Result<(), Restart> {
        let w = self.store.load(self.pid);
        if w.blocks_optimistic_read() || w.version != self.version {
            return Err(Restart);
        }
        if w.state == PageState::Marked {
            self.store.clear_mark_if_unchanged(self.pid, self.version);
        }
        Ok(())
    }

    /// Re-validates and upgrades to an exclusive lock in one step. On
    /// failure the caller must restart its whole descent, not just retry
    /// the upgrade (the page may have changed shape entirely).
    pub fn upgrade(self) -> Result<ExclusiveGuard<'s>, Restart> {
        self.check()?;
        let w = self.store.try_lock_x(self.pid)?;
        if w.version != self.version {
            // Someone else locked/unlocked between our check and the CAS;
            // the content we validated may no longer hold.
            self.store.unlock_x(self.pid);
            return Err(Restart);
        }
        Ok(ExclusiveGuard {
            store: self.store,
            pid: self.pid,
            _not_send: PhantomData,
        })
    }

    pub fn upgrade_shared(self) -> Result<SharedGuard<'s>, Restart> {
        self.check()?;
        let w = self.store.try_lock_s(self.pid)?;
        if w.version != self.version {
            self.store.unlock_s(self.pid);
            return Err(Restart);
        }
        Ok(SharedGuard {
            store: self.store,
            pid: self.pid,
        })
    }
}

/// A held shared (reader) lock.
pub struct SharedGuard<'s> {
    store: &'s PageStore,
    pid: PageId,
}

impl<'s> SharedGuard<'s> {
    pub fn acquire(store: &'s PageStore, pid: PageId) -> Result<SharedGuard<'s>, Restart> {
        store.try_lock_s(pid)?;
        Ok(SharedGuard { store, pid })
    }

    pub fn pid(&self) -> PageId {
        self.pid
    }

    pub fn bytes(&self) -> &'s [u8; PAGE_SIZE] {
        self.store.page_bytes(self.pid)
    }

    pub fn tag(&self) -> Tag {
        self.store.tag(self.pid)
    }

    pub fn unlock(self) {
        drop(self);
    }
}

impl<'s> Drop for SharedGuard<'s> {
    fn drop(&mut self) {
        self.store.unlock_s(self.pid);
    }
}

/// A held exclusive (writer) lock. `'s` ties it to the store; it is not
/// `Send` across an await point by construction (this crate has no async
/// boundary, but the marker documents the intent of the original design).
pub struct ExclusiveGuard<'s> {
    store: &'s PageStore,
    pid: PageId,
    _not_send: PhantomData<*const ()>,
}

impl<'s> ExclusiveGuard<'s> {
    /// Acquires a brand-new exclusive lock, faulting the page in first if
    /// it was evicted (spec 4.1, "fault-in under an X lock").
    pub fn acquire(store: &'s PageStore, pid: PageId) -> Result<ExclusiveGuard<'s>, Restart> {
        store.try_lock_x(pid)?;
        Ok(ExclusiveGuard {
            store,
            pid,
            _not_send: PhantomData,
        })
    }

    pub fn pid(&self) -> PageId {
        self.pid
    }

    pub fn bytes(&self) -> &[u8; PAGE_SIZE] {
        self.store.page_bytes(self.pid)
    }

    pub fn bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        unsafe { self.store.page_bytes_mut(self.pid) }
    }

    pub fn tag(&self) -> Tag {
        self.store.tag(self.pid)
    }

    /// Downgrades to an optimistic guard without ever blocking, per spec
    /// 4.2's X->O transition. Consumes `self` since the exclusive lock is
    /// released as part of the downgrade.
    pub fn downgrade(self) -> OptimisticGuard<'s> {
        let pid = self.pid;
        let store = self.store;
        let new_version = store.downgrade_x_to_o(pid);
        std::mem::forget(self);
        OptimisticGuard {
            store,
            pid,
            version: new_version,
        }
    }

    /// Unlocks and marks the page evicted without writeback - used only
    /// when the page's physical backing has already been dropped (e.g. the
    /// frame was never written and is being discarded). Most callers want
    /// the implicit `Drop` instead, which keeps the page resident.
    pub fn unlock_evicted(self) {
        let pid = self.pid;
        let store = self.store;
        std::mem::forget(self);
        store.unlock_x_evicted(pid);
    }
}

impl<'s> Drop for ExclusiveGuard<'s> {
    fn drop(&mut self) {
        self.store.set_dirty(self.pid);
        self.store.unlock_x(self.pid);
    }
}
