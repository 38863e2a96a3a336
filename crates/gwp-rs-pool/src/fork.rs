//! Fork handling.
//!
//! A `fork` that lands mid-mutation would hand the child a pool mutex locked
//! by a thread that does not exist there. The prepare hook therefore
//! acquires the pool mutex and both post-hooks release it, so the child
//! always inherits a quiescent, unlocked pool.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::platform;
use crate::pool::GuardedPoolAllocator;

static REGISTERED: AtomicPtr<GuardedPoolAllocator> = AtomicPtr::new(ptr::null_mut());
static HOOKS_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Register `pool` for fork quiescing. The libc-level hooks are installed
/// once per process; re-registration just swaps the pool they act on.
pub(crate) fn install(pool: &'static GuardedPoolAllocator) {
    REGISTERED.store(ptr::from_ref(pool).cast_mut(), Ordering::Release);
    if !HOOKS_INSTALLED.swap(true, Ordering::AcqRel) {
        platform::install_at_fork(prepare, parent, child);
    }
}

fn registered() -> Option<&'static GuardedPoolAllocator> {
    let pool = REGISTERED.load(Ordering::Acquire);
    // SAFETY: only 'static references are ever stored.
    unsafe { pool.cast_const().as_ref() }
}

extern "C" fn prepare() {
    if let Some(pool) = registered() {
        pool.disable();
    }
}

extern "C" fn parent() {
    if let Some(pool) = registered() {
        pool.enable();
    }
}

extern "C" fn child() {
    if let Some(pool) = registered() {
        pool.enable();
    }
}
