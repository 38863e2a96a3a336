//! The guarded pool engine.
//!
//! A process normally has exactly one `GuardedPoolAllocator` (see
//! [`singleton`]), but the type itself is instance-based so tests can stand
//! up isolated pools. The zero state is fully usable: `should_sample` and
//! `pointer_is_mine` answer false without touching any mapping, so the host
//! allocator may consult the pool before `init` has run.
//!
//! Locking: one pool mutex covers slot accounting and metadata mutation.
//! The sampling gate is thread-local and lock-free. Internal error traps are
//! raised while the mutex is held; the signal handler therefore never takes
//! it (see `gwp-rs-handler`).

use std::ptr;
use std::slice;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;

use gwp_rs_core::metadata::{MAX_TRACE_FRAMES, SlotMetadata};
use gwp_rs_core::options::{BacktraceFn, Options, OptionsError};
use gwp_rs_core::slots::SlotAccounting;
use gwp_rs_core::state::AllocatorState;
use gwp_rs_core::{ErrorKind, align, sampling, slots};

use crate::fork;
use crate::metrics::PoolMetrics;
use crate::platform;
use crate::tls::{self, ScopedRecursiveGuard};

/// Init-time configuration that the hot paths read without locking.
#[derive(Debug, Clone, Copy)]
struct RuntimeConfig {
    pub backtrace: Option<BacktraceFn>,
    pub perfectly_right_align: bool,
    pub recoverable: bool,
}

/// Slot accounting guarded by the pool mutex. The free-slot array itself
/// lives in a region mapped at init; only its address is stored here.
#[derive(Debug, Default)]
struct PoolInner {
    free_slots_addr: usize,
    accounting: SlotAccounting,
}

/// The sampling guarded-page allocator.
pub struct GuardedPoolAllocator {
    state: AllocatorState,
    inner: Mutex<PoolInner>,
    config: OnceLock<RuntimeConfig>,
    /// `sample_rate + 1`; zero is the uninitialized/stopped sentinel.
    adjusted_rate_plus_one: AtomicU32,
    stopped: AtomicBool,
    /// Base of the metadata region; set once at init, never relocated.
    metadata_addr: AtomicUsize,
    metrics: PoolMetrics,
}

impl GuardedPoolAllocator {
    const POOL_REGION: &'static str = "guarded page pool";
    const METADATA_REGION: &'static str = "slot metadata";
    const FREE_SLOTS_REGION: &'static str = "free slot list";

    /// Zero state. Usable (and inert) before `init`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AllocatorState::new(),
            inner: Mutex::new(PoolInner {
                free_slots_addr: 0,
                accounting: SlotAccounting {
                    num_sampled: 0,
                    free_len: 0,
                },
            }),
            config: OnceLock::new(),
            adjusted_rate_plus_one: AtomicU32::new(sampling::UNINITIALIZED_RATE_PLUS_ONE),
            stopped: AtomicBool::new(false),
            metadata_addr: AtomicUsize::new(0),
            metrics: PoolMetrics::new(),
        }
    }

    /// Map the pool and metadata, seed the PRNG, and arm the sampling gate.
    ///
    /// With `options.enabled == false` the pool stays in its zero state.
    /// Mappings created here are intentionally never unmapped: tearing them
    /// down at process exit could turn a late free into a wild access.
    pub fn init(&'static self, options: Options) -> Result<(), OptionsError> {
        options.validate()?;
        if !options.enabled {
            return Ok(());
        }

        let page_size = platform::page_size();
        let slot_count = options.max_simultaneous_allocations;
        let pool_size = (2 * slot_count + 1) * page_size;
        let pool_base = platform::map_inaccessible(pool_size, Self::POOL_REGION) as usize;

        let metadata_bytes = round_up(slot_count * size_of::<SlotMetadata>(), page_size);
        let metadata = platform::map_inaccessible(metadata_bytes, Self::METADATA_REGION);
        // SAFETY: freshly mapped region of metadata_bytes.
        unsafe { platform::mark_read_write(metadata, metadata_bytes) };
        // The zeroed bit pattern of a fresh mapping is the valid never-used
        // metadata state; no further initialization needed.

        let free_bytes = round_up(slot_count * size_of::<usize>(), page_size);
        let free_slots = platform::map_inaccessible(free_bytes, Self::FREE_SLOTS_REGION);
        // SAFETY: freshly mapped region of free_bytes.
        unsafe { platform::mark_read_write(free_slots, free_bytes) };

        {
            let mut inner = self.inner.lock();
            inner.free_slots_addr = free_slots as usize;
            inner.accounting = SlotAccounting::default();
        }
        self.metadata_addr.store(metadata as usize, Ordering::Release);
        // init is once per pool; a repeat keeps the original configuration.
        let _ = self.config.set(RuntimeConfig {
            backtrace: options.backtrace,
            perfectly_right_align: options.perfectly_right_align,
            recoverable: options.recoverable,
        });
        self.state
            .publish_geometry(pool_base, pool_size, slot_count, page_size);

        tls::seed_random(platform::entropy());
        self.adjusted_rate_plus_one.store(
            sampling::adjusted_rate_plus_one(options.sample_rate),
            Ordering::Relaxed,
        );

        if options.install_fork_handlers {
            fork::install(self);
        }
        Ok(())
    }

    /// Should the next allocation be diverted into the pool?
    ///
    /// Hot path: thread-local counter plus one relaxed load; no locks, no
    /// allocation, no init check (the zero sentinel handles pre-init).
    #[inline]
    pub fn should_sample(&self) -> bool {
        let rate_plus_one = self.adjusted_rate_plus_one.load(Ordering::Relaxed);
        let sampled = tls::with(|locals| {
            if locals.next_sample_counter == 0 {
                let rand = gwp_rs_core::prng::xorshift32(&mut locals.random_state);
                locals.next_sample_counter = sampling::next_sample_delay(rand, rate_plus_one);
            }
            locals.next_sample_counter -= 1;
            locals.next_sample_counter == 0
        });
        if sampled {
            PoolMetrics::inc(&self.metrics.samples);
        }
        sampled
    }

    /// Whether `ptr` points into the guarded pool.
    #[inline]
    #[must_use]
    pub fn pointer_is_mine(&self, ptr: *const u8) -> bool {
        self.state.pointer_is_mine(ptr as usize)
    }

    /// Allocate `size` bytes in a guarded slot.
    ///
    /// Returns null when the request is out of range, the pool is exhausted,
    /// stopped, or the call re-entered the allocator; the host falls back to
    /// its normal path.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        let page_size = self.state.page_size();
        if size == 0 || size > page_size || self.stopped.load(Ordering::Relaxed) {
            PoolMetrics::inc(&self.metrics.refused_allocations);
            return ptr::null_mut();
        }
        let Some(_recursion) = ScopedRecursiveGuard::enter() else {
            PoolMetrics::inc(&self.metrics.refused_allocations);
            return ptr::null_mut();
        };
        let Some(config) = self.config.get() else {
            return ptr::null_mut();
        };

        // Capture the allocation trace outside the mutex. The recursive
        // guard is set, so a capturer that allocates falls back to the host.
        let mut frames = [0usize; MAX_TRACE_FRAMES];
        let frame_count = capture_backtrace(config.backtrace, &mut frames);
        let slot_rand = tls::random_u32();
        let side_rand = tls::random_u32();
        let thread_id = platform::thread_id();

        let mut inner = self.inner.lock();
        if self.stopped.load(Ordering::Relaxed) {
            return ptr::null_mut();
        }
        let slot_count = self.state.max_simultaneous_allocations();
        let free_addr = inner.free_slots_addr;
        // SAFETY: the free-slot region holds slot_count entries and is only
        // touched under the pool mutex, which we hold.
        let free = unsafe { slice::from_raw_parts_mut(free_addr as *mut usize, slot_count) };
        let Some(slot) = slots::reserve_slot(&mut inner.accounting, free, slot_count, slot_rand)
        else {
            PoolMetrics::inc(&self.metrics.refused_allocations);
            return ptr::null_mut();
        };

        let page = self.state.slot_to_addr(slot);
        let user_ptr = if side_rand % 2 == 0 {
            align::right_aligned(page + page_size, size, config.perfectly_right_align)
        } else {
            align::left_aligned(page)
        };

        // SAFETY: the slot page is a page-aligned part of the pool mapping.
        unsafe { platform::mark_read_write(page as *mut u8, page_size) };
        // SAFETY: slot < slot_count; metadata is mutated under the pool mutex.
        let meta = unsafe { &mut *self.metadata_slot(slot) };
        meta.record_allocation(user_ptr, size, &frames[..frame_count], thread_id);

        PoolMetrics::inc(&self.metrics.guarded_allocations);
        user_ptr as *mut u8
    }

    /// Deallocate a pointer previously returned by [`allocate`].
    ///
    /// Double frees and wild frees are published into the allocator state
    /// and raised as a synchronous fault; in recoverable mode each slot
    /// reports at most once and is then retired.
    pub fn deallocate(&self, ptr: *mut u8) {
        let addr = ptr as usize;
        if !self.state.pointer_is_mine(addr) || self.stopped.load(Ordering::Relaxed) {
            return;
        }
        let Some(_recursion) = ScopedRecursiveGuard::enter() else {
            return;
        };
        let Some(config) = self.config.get() else {
            return;
        };

        // Captured outside the mutex; only stored on the valid-free path.
        let mut frames = [0usize; MAX_TRACE_FRAMES];
        let frame_count = capture_backtrace(config.backtrace, &mut frames);
        let thread_id = platform::thread_id();

        let slot = self.state.nearest_slot(addr);
        let mut inner = self.inner.lock();
        // SAFETY: slot < slot_count; metadata is mutated under the pool mutex.
        let meta = unsafe { &mut *self.metadata_slot(slot) };

        // A slot that has produced its one report is retired: deallocation
        // becomes a no-op and the slot is never recycled.
        if meta.has_crashed() {
            return;
        }
        if meta.addr != addr {
            self.trap_on_address(addr, ErrorKind::InvalidFree);
            return;
        }
        if meta.is_deallocated {
            self.trap_on_address(addr, ErrorKind::DoubleFree);
            return;
        }

        meta.record_deallocation(&frames[..frame_count], thread_id);
        let page = self.state.slot_to_addr(slot);
        let page_size = self.state.page_size();
        // SAFETY: protecting our own slot page; the slot is no longer live.
        unsafe { platform::mark_inaccessible(page as *mut u8, page_size) };

        let slot_count = self.state.max_simultaneous_allocations();
        let free_addr = inner.free_slots_addr;
        // SAFETY: as in allocate; the pool mutex is held.
        let free = unsafe { slice::from_raw_parts_mut(free_addr as *mut usize, slot_count) };
        slots::free_slot(&mut inner.accounting, free, slot);
        PoolMetrics::inc(&self.metrics.deallocations);
    }

    /// Publish an internally detected error and raise a synchronous fault.
    ///
    /// Called with the pool mutex held, which serializes every internal
    /// raise. The reported address may sit on an accessible page (a wild
    /// free into a live slot), so the fault is raised on the always-armed
    /// first guard page.
    ///
    /// The kind and address travel two ways: into the published state for
    /// out-of-process readers, and into a thread-local record for the
    /// in-process handler. The fault below is delivered synchronously on
    /// this thread, so the handler reads the thread-local record; a
    /// concurrent hardware fault on another thread sees no pending record
    /// and classifies from its own address.
    fn trap_on_address(&self, addr: usize, kind: ErrorKind) {
        PoolMetrics::inc(&self.metrics.internal_traps);
        self.state.record_failure(kind, addr, true);
        tls::set_pending_internal_error(kind, addr);
        let trap_page = self.state.pool_base() as *mut u8;
        // An earlier recoverable report may have disarmed the first guard
        // page (an underflow below slot 0 lands on it); re-protect so the
        // store below is guaranteed to fault.
        // SAFETY: protecting the first guard page of our own mapping.
        unsafe { platform::mark_inaccessible(trap_page, self.state.page_size()) };
        // SAFETY: an intentional fault. In recoverable mode the handler
        // reports, unprotects this page, and returns, letting the store
        // retire; otherwise the process dies here.
        unsafe { ptr::write_volatile(trap_page, 0) };
        // Recoverable mode only from here on: re-arm the trap page and
        // retire both failure records.
        // SAFETY: re-protecting the first guard page of our own mapping.
        unsafe { platform::mark_inaccessible(trap_page, self.state.page_size()) };
        tls::clear_pending_internal_error();
        self.state.clear_failure();
    }

    /// Size of the live allocation at `ptr`, or 0 if `ptr` is not the base
    /// of a live sampled allocation.
    #[must_use]
    pub fn get_size(&self, ptr: *const u8) -> usize {
        let addr = ptr as usize;
        if !self.state.pointer_is_mine(addr) {
            return 0;
        }
        let _inner = self.inner.lock();
        let slot = self.state.nearest_slot(addr);
        // SAFETY: read under the pool mutex.
        let meta = unsafe { &*self.metadata_slot(slot) };
        if meta.is_live() && meta.addr == addr {
            meta.requested_size
        } else {
            0
        }
    }

    /// Halt all slot transitions until [`enable`](Self::enable). Must not be
    /// re-entered by the thread that already disabled the pool.
    pub fn disable(&self) {
        std::mem::forget(self.inner.lock());
    }

    /// Release the hold taken by [`disable`](Self::disable).
    pub fn enable(&self) {
        // SAFETY: paired with disable(), which leaked the guard while
        // keeping the mutex locked.
        unsafe { self.inner.force_unlock() };
    }

    /// Visit every live sampled allocation whose range intersects
    /// `[base, base + size)`.
    ///
    /// Contract: the pool is disabled (the caller holds the pool mutex via
    /// `disable`), so metadata is quiescent and read without locking. The
    /// callback must not allocate.
    pub fn iterate<F: FnMut(usize, usize)>(&self, base: usize, size: usize, mut callback: F) {
        let end = base.saturating_add(size);
        for slot in 0..self.state.max_simultaneous_allocations() {
            // SAFETY: the metadata region is init-mapped and quiescent while
            // the pool is disabled.
            let meta = unsafe { &*self.metadata_slot(slot) };
            if meta.is_live() && meta.addr < end && meta.addr + meta.requested_size > base {
                callback(meta.addr, meta.requested_size);
            }
        }
    }

    /// Permanently wind the allocator down: the sampling gate is clamped to
    /// the zero sentinel and `allocate` refuses. One-way; safe from any
    /// context including a signal handler (two relaxed stores).
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.adjusted_rate_plus_one.store(
            sampling::UNINITIALIZED_RATE_PLUS_ONE,
            Ordering::Relaxed,
        );
    }

    /// Published state for crash readers.
    #[must_use]
    pub fn state(&self) -> &AllocatorState {
        &self.state
    }

    /// Base of the per-slot metadata region (null before init). The region
    /// holds `max_simultaneous_allocations` records and never moves.
    #[must_use]
    pub fn metadata_ptr(&self) -> *const SlotMetadata {
        self.metadata_addr.load(Ordering::Acquire) as *const SlotMetadata
    }

    /// Operation counters.
    #[must_use]
    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    /// Whether the pool was initialized in recoverable mode.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.config.get().is_some_and(|config| config.recoverable)
    }

    fn metadata_slot(&self, slot: usize) -> *mut SlotMetadata {
        // Callers uphold slot < max_simultaneous_allocations.
        self.metadata_ptr().cast_mut().wrapping_add(slot)
    }
}

impl Default for GuardedPoolAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn capture_backtrace(backtrace: Option<BacktraceFn>, frames: &mut [usize]) -> usize {
    match backtrace {
        Some(capture) => capture(frames).min(frames.len()),
        None => 0,
    }
}

const fn round_up(value: usize, granule: usize) -> usize {
    value.div_ceil(granule) * granule
}

static SINGLETON: GuardedPoolAllocator = GuardedPoolAllocator::new();

/// The process-wide pool instance.
#[must_use]
pub fn singleton() -> &'static GuardedPoolAllocator {
    &SINGLETON
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_backtrace(frames: &mut [usize]) -> usize {
        let fake = [0x40_1000usize, 0x40_1040, 0x40_0f80];
        let n = fake.len().min(frames.len());
        frames[..n].copy_from_slice(&fake[..n]);
        n
    }

    fn leaked_pool(slot_count: usize) -> &'static GuardedPoolAllocator {
        let pool: &'static GuardedPoolAllocator = Box::leak(Box::new(GuardedPoolAllocator::new()));
        pool.init(Options {
            sample_rate: 1,
            max_simultaneous_allocations: slot_count,
            backtrace: Some(test_backtrace),
            install_fork_handlers: false,
            ..Options::default()
        })
        .expect("valid test options");
        pool
    }

    fn slot_page_of(pool: &GuardedPoolAllocator, ptr: *const u8) -> usize {
        (ptr as usize - pool.state().pool_base()) / pool.state().page_size()
    }

    #[test]
    fn zero_state_is_inert() {
        let pool = GuardedPoolAllocator::new();
        assert!(!pool.pointer_is_mine(0x1000 as *const u8));
        assert!(pool.allocate(1).is_null());
        assert_eq!(pool.get_size(0x1000 as *const u8), 0);
        for _ in 0..4_000_000 {
            assert!(!pool.should_sample());
        }
    }

    #[test]
    fn allocation_lands_inside_one_slot_page() {
        let pool = leaked_pool(4);
        let page_size = pool.state().page_size();
        for size in [1usize, 2, 15, 16, 128, page_size] {
            let ptr = pool.allocate(size);
            assert!(!ptr.is_null(), "size {size}");
            assert!(pool.pointer_is_mine(ptr));
            // Entirely within an odd (slot) page.
            let page = slot_page_of(pool, ptr);
            assert_eq!(page % 2, 1, "size {size}");
            let page_base = pool.state().pool_base() + page * page_size;
            assert!(ptr as usize + size <= page_base + page_size);
            // The page is writable end to end of the allocation.
            // SAFETY: ptr..ptr+size was just returned as a live allocation.
            unsafe {
                ptr.write_volatile(0x5a);
                ptr.add(size - 1).write_volatile(0xa5);
            }
            pool.deallocate(ptr);
        }
    }

    #[test]
    fn oversized_and_zero_requests_are_refused() {
        let pool = leaked_pool(2);
        assert!(pool.allocate(0).is_null());
        assert!(pool.allocate(pool.state().page_size() + 1).is_null());
    }

    #[test]
    fn live_allocations_are_capped_at_the_slot_count() {
        let pool = leaked_pool(4);
        let ptrs: Vec<*mut u8> = (0..4).map(|_| pool.allocate(8)).collect();
        assert!(ptrs.iter().all(|p| !p.is_null()));
        assert!(pool.allocate(8).is_null(), "pool must be exhausted");
        pool.deallocate(ptrs[2]);
        assert!(!pool.allocate(8).is_null());
    }

    #[test]
    fn every_slot_is_used_once_before_any_recycling() {
        let pool = leaked_pool(4);
        let mut pages_seen = Vec::new();
        for _ in 0..4 {
            let ptr = pool.allocate(16);
            pages_seen.push(slot_page_of(pool, ptr));
            pool.deallocate(ptr);
        }
        pages_seen.sort_unstable();
        pages_seen.dedup();
        assert_eq!(pages_seen.len(), 4, "freed slots recycled too early");

        // Saturated now: the next allocation recycles one of them.
        let ptr = pool.allocate(16);
        assert!(pages_seen.contains(&slot_page_of(pool, ptr)));
        pool.deallocate(ptr);
    }

    #[test]
    fn placement_hugs_one_of_the_two_guard_pages() {
        let pool = leaked_pool(2);
        let page_size = pool.state().page_size();
        let size = 24usize;
        let mut saw_left = false;
        let mut saw_right = false;
        for _ in 0..64 {
            let ptr = pool.allocate(size) as usize;
            let page = pool.state().pool_base()
                + slot_page_of(pool, ptr as *const u8) * page_size;
            let right = align::right_aligned(page + page_size, size, false);
            if ptr == page {
                saw_left = true;
            } else if ptr == right {
                saw_right = true;
            } else {
                panic!("pointer {ptr:#x} is neither left- nor right-aligned");
            }
            pool.deallocate(ptr as *mut u8);
        }
        assert!(saw_left && saw_right, "both placements should occur");
    }

    #[test]
    fn get_size_tracks_liveness() {
        let pool = leaked_pool(2);
        let ptr = pool.allocate(100);
        assert_eq!(pool.get_size(ptr), 100);
        // An interior pointer is not an allocation base.
        // SAFETY: ptr + 1 stays within the slot page for size 100.
        assert_eq!(pool.get_size(unsafe { ptr.add(1) }), 0);
        pool.deallocate(ptr);
        assert_eq!(pool.get_size(ptr), 0);
    }

    #[test]
    fn sampling_every_allocation_at_rate_one() {
        let pool = leaked_pool(1);
        for _ in 0..1000 {
            assert!(pool.should_sample());
        }
    }

    #[test]
    fn stop_is_terminal() {
        let pool = leaked_pool(2);
        let ptr = pool.allocate(8);
        assert!(!ptr.is_null());
        pool.stop();
        assert!(pool.allocate(8).is_null());
        // Deallocation after stop performs no slot transition.
        pool.deallocate(ptr);
        assert_eq!(pool.get_size(ptr), 8);
    }

    #[test]
    fn disable_enable_round_trip() {
        let pool = leaked_pool(2);
        pool.disable();
        pool.enable();
        assert!(!pool.allocate(8).is_null());
    }

    #[test]
    fn iterate_visits_live_intersecting_allocations() {
        let pool = leaked_pool(4);
        let kept = pool.allocate(32);
        let freed = pool.allocate(32);
        pool.deallocate(freed);

        pool.disable();
        let mut visited = Vec::new();
        pool.iterate(pool.state().pool_base(), pool.state().pool_size(), |base, size| {
            visited.push((base, size));
        });
        pool.enable();

        assert_eq!(visited, vec![(kept as usize, 32)]);

        pool.disable();
        let mut outside = 0;
        pool.iterate(0x1000, 0x1000, |_, _| outside += 1);
        pool.enable();
        assert_eq!(outside, 0);
    }

    #[test]
    fn metrics_follow_the_allocation_lifecycle() {
        let pool = leaked_pool(2);
        let ptr = pool.allocate(8);
        pool.deallocate(ptr);
        assert!(pool.allocate(0).is_null());
        let snap = pool.metrics().snapshot();
        assert_eq!(snap.guarded_allocations, 1);
        assert_eq!(snap.deallocations, 1);
        assert_eq!(snap.refused_allocations, 1);
    }

    #[test]
    fn concurrent_valid_traffic_respects_the_cap() {
        let pool = leaked_pool(8);
        let threads: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(move || {
                    for _ in 0..2000 {
                        let ptr = pool.allocate(16);
                        if !ptr.is_null() {
                            // SAFETY: live allocation of 16 bytes.
                            unsafe { ptr.write_volatile(1) };
                            pool.deallocate(ptr);
                        }
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        let snap = pool.metrics().snapshot();
        assert_eq!(snap.guarded_allocations, snap.deallocations);
    }

    fn reentrant_backtrace(frames: &mut [usize]) -> usize {
        // A capturer that allocates must fall through to the host allocator.
        assert!(singleton().allocate(8).is_null());
        frames[0] = 0x1;
        1
    }

    #[test]
    fn capturer_reentry_falls_back_to_the_host() {
        singleton()
            .init(Options {
                sample_rate: 1,
                max_simultaneous_allocations: 2,
                backtrace: Some(reentrant_backtrace),
                install_fork_handlers: false,
                ..Options::default()
            })
            .expect("valid test options");
        let ptr = singleton().allocate(8);
        assert!(!ptr.is_null());
        singleton().deallocate(ptr);
    }
}
