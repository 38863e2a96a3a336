//! Recoverable SIGSEGV handler.
//!
//! Installed once per process. On a fault the handler decides, from the
//! published state alone, whether the fault belongs to the guarded pool;
//! anything else is forwarded to the previously installed action.
//!
//! For pool faults it serializes on a dedicated spinlock (never the pool
//! mutex: internal traps are raised while that mutex is held), reports at
//! most once per slot, and in recoverable mode unprotects the faulting page
//! so the interrupted instruction can retry.

use std::cell::UnsafeCell;
use std::ffi::{c_int, c_void};
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use gwp_rs_pool::{GuardedPoolAllocator, PoolMetrics, pending_internal_error, platform};

use crate::diagnose::diagnose;
use crate::report::{Printer, print_report};

static REGISTERED_POOL: AtomicPtr<GuardedPoolAllocator> = AtomicPtr::new(ptr::null_mut());
static PRINTER: AtomicUsize = AtomicUsize::new(0);
static RECOVERABLE: AtomicBool = AtomicBool::new(false);
static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Serializes report generation across threads. A test-and-test-and-set
/// spin is async-signal-safe where a mutex is not.
struct ReportLock(AtomicBool);

impl ReportLock {
    fn lock(&self) {
        loop {
            if self
                .0
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            while self.0.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
    }

    fn unlock(&self) {
        self.0.store(false, Ordering::Release);
    }
}

static REPORT_LOCK: ReportLock = ReportLock(AtomicBool::new(false));

/// The action that was installed before ours; faults that are not ours are
/// handed back to it.
struct PreviousAction(UnsafeCell<MaybeUninit<libc::sigaction>>);

// SAFETY: written exactly once, at first install, before any fault can reach
// the handler; read-only afterwards.
unsafe impl Sync for PreviousAction {}

static PREVIOUS_ACTION: PreviousAction = PreviousAction(UnsafeCell::new(MaybeUninit::uninit()));

/// Install (or re-target) the SIGSEGV handler.
///
/// The libc-level action is installed once per process; later calls swap the
/// pool, printer, and recoverability it acts on. `printer` receives the
/// report line by line and must itself be async-signal-safe to the extent
/// the caller cares about.
pub fn install_signal_handler(
    pool: &'static GuardedPoolAllocator,
    printer: Printer,
    recoverable: bool,
) {
    REGISTERED_POOL.store(ptr::from_ref(pool).cast_mut(), Ordering::Release);
    PRINTER.store(printer as usize, Ordering::Release);
    RECOVERABLE.store(recoverable, Ordering::Release);
    if !HANDLER_INSTALLED.swap(true, Ordering::AcqRel) {
        // SAFETY: installing a process-wide action; the previous action is
        // saved before the handler can fire.
        unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            action.sa_sigaction = segv_handler as usize;
            action.sa_flags = libc::SA_SIGINFO;
            libc::sigemptyset(&mut action.sa_mask);
            let mut previous: libc::sigaction = mem::zeroed();
            libc::sigaction(libc::SIGSEGV, &action, &mut previous);
            (*PREVIOUS_ACTION.0.get()).write(previous);
        }
    }
}

fn printer() -> Option<Printer> {
    let raw = PRINTER.load(Ordering::Acquire);
    if raw == 0 {
        None
    } else {
        // SAFETY: only `Printer` values are ever stored.
        Some(unsafe { mem::transmute::<usize, Printer>(raw) })
    }
}

extern "C" fn segv_handler(signum: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    let pool_ptr = REGISTERED_POOL.load(Ordering::Acquire);
    // SAFETY: only 'static pools are registered.
    let Some(pool) = (unsafe { pool_ptr.cast_const().as_ref() }) else {
        // SAFETY: forwarding the original signal arguments.
        unsafe { forward_to_previous(signum, info, context) };
        return;
    };
    // SAFETY: info is valid in a SA_SIGINFO handler.
    let fault_addr = unsafe { (*info).si_addr() } as usize;
    let state = pool.state();
    // Only the thread whose trap raised this fault observes a pending
    // record; any other thread's fault is classified from its own address.
    let pending = pending_internal_error();
    if pending.is_none() && !state.pointer_is_mine(fault_addr) {
        // SAFETY: as above.
        unsafe { forward_to_previous(signum, info, context) };
        return;
    }

    REPORT_LOCK.lock();
    let Some(diagnosis) = diagnose(state, pool.metadata_ptr(), fault_addr, pending) else {
        // Inside the pool but unattributable (e.g. a wild access to a
        // never-used slot): not ours to explain.
        REPORT_LOCK.unlock();
        // SAFETY: as above.
        unsafe { forward_to_previous(signum, info, context) };
        return;
    };

    // SAFETY: the diagnosis slot indexes the published metadata region.
    let meta = unsafe { &*pool.metadata_ptr().add(diagnosis.slot) };
    if meta.set_crashed() {
        PoolMetrics::inc(&pool.metrics().reports_suppressed);
    } else {
        if let Some(printer) = printer() {
            print_report(printer, pool.metadata_ptr(), &diagnosis, platform::thread_id());
        }
        PoolMetrics::inc(&pool.metrics().reports_emitted);
    }

    if RECOVERABLE.load(Ordering::Relaxed) {
        // Unprotect the page the signal landed on so the interrupted
        // instruction retries successfully. For an internal trap this is the
        // first guard page; the raising thread re-arms it afterwards.
        let page_size = state.page_size();
        let page = fault_addr & !(page_size - 1);
        // SAFETY: the fault address lies inside the pool mapping.
        unsafe { platform::mark_read_write(page as *mut u8, page_size) };
        REPORT_LOCK.unlock();
        return;
    }

    REPORT_LOCK.unlock();
    // Non-recoverable: the report is written; hand the fault to the previous
    // action so the process dies with the original context.
    // SAFETY: as above.
    unsafe { forward_to_previous(signum, info, context) };
}

/// Re-deliver the fault to whatever was installed before us.
///
/// # Safety
/// Must be called from the signal handler with its original arguments.
unsafe fn forward_to_previous(signum: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    if !HANDLER_INSTALLED.load(Ordering::Acquire) {
        return;
    }
    // SAFETY: written once at install time.
    let previous = unsafe { (*PREVIOUS_ACTION.0.get()).assume_init() };
    let raw_handler = previous.sa_sigaction;
    if raw_handler == libc::SIG_DFL || raw_handler == libc::SIG_IGN {
        // Reinstate the original action and return; the faulting instruction
        // re-raises and the kernel applies it.
        // SAFETY: restoring a previously valid action.
        unsafe { libc::sigaction(signum, &previous, ptr::null_mut()) };
        return;
    }
    if previous.sa_flags & libc::SA_SIGINFO != 0 {
        // SAFETY: the previous action declared a three-argument handler.
        let handler: unsafe extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void) =
            unsafe { mem::transmute(raw_handler) };
        // SAFETY: forwarding the original arguments.
        unsafe { handler(signum, info, context) };
    } else {
        // SAFETY: the previous action declared a one-argument handler.
        let handler: unsafe extern "C" fn(c_int) = unsafe { mem::transmute(raw_handler) };
        // SAFETY: forwarding the original signal number.
        unsafe { handler(signum) };
    }
}
