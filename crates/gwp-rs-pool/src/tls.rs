//! Per-thread allocator state.
//!
//! The three most-touched variables in the system, packed into one `Cell`:
//! the sampling countdown, the PRNG state, and the re-entrancy guard. The
//! PRNG state starts at the pre-init magic seed so a thread that samples
//! before `init` draws an enormous first delay.

use std::cell::Cell;

use gwp_rs_core::{ErrorKind, prng};

#[derive(Debug, Clone, Copy)]
pub(crate) struct ThreadLocals {
    /// xorshift32 state.
    pub random_state: u32,
    /// Decrementing counter; the allocation that takes it to zero is sampled.
    pub next_sample_counter: u32,
    /// Set while allocator code runs on this thread. The backtrace capturer
    /// may itself allocate (e.g. via dlopen); when that re-enters the
    /// allocator, the request falls through to the host allocator instead of
    /// deadlocking on the pool mutex.
    pub recursive_guard: bool,
    /// Internal error this thread is currently raising (`ErrorKind` byte;
    /// `Unknown` means none). The fault provoked by the engine is delivered
    /// synchronously on the raising thread, so keeping the record
    /// thread-local means another thread's concurrent hardware fault can
    /// never read it and misattribute its own error.
    pub internal_error_kind: u8,
    /// Address the pending internal error was detected at.
    pub internal_error_address: usize,
}

impl ThreadLocals {
    const fn new() -> Self {
        Self {
            random_state: prng::PRE_INIT_SEED,
            next_sample_counter: 0,
            recursive_guard: false,
            internal_error_kind: ErrorKind::Unknown as u8,
            internal_error_address: 0,
        }
    }
}

thread_local! {
    static THREAD_LOCALS: Cell<ThreadLocals> = const { Cell::new(ThreadLocals::new()) };
}

/// Run `f` against this thread's allocator state.
pub(crate) fn with<R>(f: impl FnOnce(&mut ThreadLocals) -> R) -> R {
    THREAD_LOCALS.with(|cell| {
        let mut locals = cell.get();
        let result = f(&mut locals);
        cell.set(locals);
        result
    })
}

/// Draw the next 32-bit random value from this thread's PRNG.
pub(crate) fn random_u32() -> u32 {
    with(|locals| prng::xorshift32(&mut locals.random_state))
}

/// Reseed this thread's PRNG (done once, at init, on the initializing
/// thread; other threads keep the magic seed, exactly like the counter).
pub(crate) fn seed_random(seed: u32) {
    with(|locals| locals.random_state = seed | 1);
}

/// Record the internal error this thread is about to raise a fault for.
pub(crate) fn set_pending_internal_error(kind: ErrorKind, address: usize) {
    with(|locals| {
        locals.internal_error_kind = kind as u8;
        locals.internal_error_address = address;
    });
}

/// Retire this thread's internal-error record once the fault has been
/// handled.
pub(crate) fn clear_pending_internal_error() {
    with(|locals| {
        locals.internal_error_kind = ErrorKind::Unknown as u8;
        locals.internal_error_address = 0;
    });
}

/// The internal error the current thread is raising, if any.
///
/// A signal handler that observes `Some` is running on the very thread whose
/// store provoked the fault; a handler on any other thread observes `None`
/// and classifies from its own fault address instead.
#[must_use]
pub fn pending_internal_error() -> Option<(ErrorKind, usize)> {
    with(|locals| {
        let kind = ErrorKind::from_u8(locals.internal_error_kind);
        if kind == ErrorKind::Unknown {
            None
        } else {
            Some((kind, locals.internal_error_address))
        }
    })
}

/// Scoped re-entrancy guard. `enter` returns `None` when the current thread
/// is already inside the allocator, in which case the caller must bail out
/// to the host allocator.
pub(crate) struct ScopedRecursiveGuard(());

impl ScopedRecursiveGuard {
    pub(crate) fn enter() -> Option<Self> {
        with(|locals| {
            if locals.recursive_guard {
                None
            } else {
                locals.recursive_guard = true;
                Some(ScopedRecursiveGuard(()))
            }
        })
    }
}

impl Drop for ScopedRecursiveGuard {
    fn drop(&mut self) {
        with(|locals| locals.recursive_guard = false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_blocks_nested_entry() {
        let outer = ScopedRecursiveGuard::enter();
        assert!(outer.is_some());
        assert!(ScopedRecursiveGuard::enter().is_none());
        drop(outer);
        assert!(ScopedRecursiveGuard::enter().is_some());
    }

    #[test]
    fn fresh_threads_start_from_the_magic_seed() {
        std::thread::spawn(|| {
            assert_eq!(random_u32(), 0xffff_fea4);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn reseeding_changes_the_sequence() {
        std::thread::spawn(|| {
            seed_random(0x1234_5678);
            assert_ne!(random_u32(), 0xffff_fea4);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn pending_internal_error_round_trip() {
        assert_eq!(pending_internal_error(), None);
        set_pending_internal_error(ErrorKind::DoubleFree, 0x7000_1000);
        assert_eq!(
            pending_internal_error(),
            Some((ErrorKind::DoubleFree, 0x7000_1000))
        );
        clear_pending_internal_error();
        assert_eq!(pending_internal_error(), None);
    }

    #[test]
    fn pending_internal_error_is_invisible_to_other_threads() {
        set_pending_internal_error(ErrorKind::InvalidFree, 0x7000_2000);
        std::thread::spawn(|| {
            assert_eq!(pending_internal_error(), None);
        })
        .join()
        .unwrap();
        clear_pending_internal_error();
    }
}
