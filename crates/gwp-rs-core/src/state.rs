//! Published allocator state.
//!
//! One `#[repr(C)]` record describing the pool geometry and the most recent
//! failure. It is written by the engine and read by the signal-side
//! classifier and by out-of-process crash printers, so it stays plain data:
//! fixed layout, no pointers to heap objects, atomics with relaxed ordering.
//!
//! Geometry fields are written once at init and never relocated. The
//! failure record is the out-of-process surface only: it is written by the
//! thread that raises an internal trap and examined post-mortem, once the
//! process is stopped and no concurrent fault can be in flight. In-process
//! handlers must not attribute a live fault from it (another thread's trap
//! may be mid-raise); they use the raising thread's thread-local record
//! instead. The relaxed ordering is enough because every cross-thread read
//! is advisory.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crate::error::ErrorKind;

/// Pool geometry plus the last-failure record, published for crash readers.
///
/// Zero state (`AllocatorState::new()`) is fully operational in the sense
/// required before `init`: `pointer_is_mine` is false for every address and
/// the page size is 0, so every allocation request is out of range.
#[repr(C)]
#[derive(Debug, Default)]
pub struct AllocatorState {
    pool_base: AtomicUsize,
    pool_size: AtomicUsize,
    max_simultaneous_allocations: AtomicUsize,
    page_size: AtomicUsize,
    failure_kind: AtomicU8,
    failure_address: AtomicUsize,
    internally_detected: AtomicBool,
}

impl AllocatorState {
    /// Zeroed state; usable before `init` per the pre-init safety contract.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pool_base: AtomicUsize::new(0),
            pool_size: AtomicUsize::new(0),
            max_simultaneous_allocations: AtomicUsize::new(0),
            page_size: AtomicUsize::new(0),
            failure_kind: AtomicU8::new(ErrorKind::Unknown as u8),
            failure_address: AtomicUsize::new(0),
            internally_detected: AtomicBool::new(false),
        }
    }

    /// Publish the pool geometry. Called exactly once, at init.
    pub fn publish_geometry(
        &self,
        pool_base: usize,
        pool_size: usize,
        max_simultaneous_allocations: usize,
        page_size: usize,
    ) {
        self.pool_base.store(pool_base, Ordering::Relaxed);
        self.pool_size.store(pool_size, Ordering::Relaxed);
        self.max_simultaneous_allocations
            .store(max_simultaneous_allocations, Ordering::Relaxed);
        self.page_size.store(page_size, Ordering::Relaxed);
    }

    #[must_use]
    pub fn pool_base(&self) -> usize {
        self.pool_base.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool_size.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn max_simultaneous_allocations(&self) -> usize {
        self.max_simultaneous_allocations.load(Ordering::Relaxed)
    }

    /// Platform page size, which is also the maximum guarded allocation size.
    /// Zero until init.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size.load(Ordering::Relaxed)
    }

    /// Whether `addr` falls inside the guarded pool mapping. False for every
    /// address while the pool is uninitialized (size 0).
    #[must_use]
    pub fn pointer_is_mine(&self, addr: usize) -> bool {
        let base = self.pool_base();
        let end = base.saturating_add(self.pool_size());
        (base..end).contains(&addr)
    }

    /// Address of the slot page for slot `index`.
    ///
    /// Layout: guard, slot 0, guard, slot 1, ..., slot N-1, guard. Slot `i`
    /// occupies page `2i + 1` of the pool.
    #[must_use]
    pub fn slot_to_addr(&self, index: usize) -> usize {
        self.pool_base() + (2 * index + 1) * self.page_size()
    }

    /// Whether `addr` (which must be inside the pool) lies on a guard page.
    #[must_use]
    pub fn is_guard_page(&self, addr: usize) -> bool {
        let page = (addr - self.pool_base()) / self.page_size();
        page % 2 == 0
    }

    /// Slot index whose page or adjacent guard region contains `addr`.
    ///
    /// Slot pages map directly. For a guard page, the faulting half picks
    /// the adjacent slot: an overflow from the slot on the left lands in the
    /// low half, an underflow from the slot on the right lands in the high
    /// half. Clamped at the pool edges.
    #[must_use]
    pub fn nearest_slot(&self, addr: usize) -> usize {
        let page_size = self.page_size();
        let rel = addr - self.pool_base();
        let page = rel / page_size;
        if page % 2 == 1 {
            return (page - 1) / 2;
        }
        if page == 0 {
            return 0;
        }
        if page == 2 * self.max_simultaneous_allocations() {
            return self.max_simultaneous_allocations() - 1;
        }
        if rel % page_size < page_size / 2 {
            page / 2 - 1
        } else {
            page / 2
        }
    }

    /// Record a failure detected during `deallocate` (double free, invalid
    /// free) before raising the trap that delivers it to the handler. This
    /// is the record out-of-process readers see; live in-process
    /// classification goes through the raising thread's local record.
    pub fn record_failure(&self, kind: ErrorKind, addr: usize, internally_detected: bool) {
        self.failure_kind.store(kind as u8, Ordering::Relaxed);
        self.failure_address.store(addr, Ordering::Relaxed);
        self.internally_detected
            .store(internally_detected, Ordering::Relaxed);
    }

    /// Retire the failure record after a recoverable report has been handled.
    pub fn clear_failure(&self) {
        self.failure_kind
            .store(ErrorKind::Unknown as u8, Ordering::Relaxed);
        self.failure_address.store(0, Ordering::Relaxed);
        self.internally_detected.store(false, Ordering::Relaxed);
    }

    #[must_use]
    pub fn failure_kind(&self) -> ErrorKind {
        ErrorKind::from_u8(self.failure_kind.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn failure_address(&self) -> usize {
        self.failure_address.load(Ordering::Relaxed)
    }

    /// True when the failure record was set by the engine (as opposed to a
    /// hardware fault classified after the fact).
    #[must_use]
    pub fn internally_detected(&self) -> bool {
        self.internally_detected.load(Ordering::Relaxed)
    }
}
