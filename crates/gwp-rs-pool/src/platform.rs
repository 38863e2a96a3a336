//! Platform primitives.
//!
//! Raw libc behind small safe (or explicitly unsafe) functions: anonymous
//! page mapping, protection flips, page-size and thread-id queries, entropy
//! for the PRNG, and at-fork registration. Mapping and protection failures
//! are unrecoverable; the process is terminated with a signal-safe stderr
//! write, never an unwind.

use std::ffi::c_void;
use std::ptr;

/// Platform page size.
#[must_use]
pub fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions and cannot fail.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Map `size` bytes of anonymous, initially inaccessible memory.
///
/// `name` identifies the region in the fatal diagnostic if the mapping
/// fails. Memory becomes usable only after [`mark_read_write`].
#[must_use]
pub fn map_inaccessible(size: usize, name: &'static str) -> *mut u8 {
    // SAFETY: anonymous private mapping with no backing fd.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        die(name);
    }
    ptr.cast()
}

/// Unmap a region previously returned by [`map_inaccessible`].
///
/// # Safety
/// `ptr`/`size` must denote exactly such a region, with no live references
/// into it.
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    // SAFETY: per this function's contract.
    if unsafe { libc::munmap(ptr.cast::<c_void>(), size) } != 0 {
        die("munmap");
    }
}

/// Make pages readable and writable.
///
/// # Safety
/// `ptr`/`size` must be a page-aligned subrange of a live mapping.
pub unsafe fn mark_read_write(ptr: *mut u8, size: usize) {
    // SAFETY: per this function's contract.
    if unsafe { libc::mprotect(ptr.cast::<c_void>(), size, libc::PROT_READ | libc::PROT_WRITE) }
        != 0
    {
        die("mprotect(PROT_READ|PROT_WRITE)");
    }
}

/// Make pages inaccessible; any access traps.
///
/// # Safety
/// `ptr`/`size` must be a page-aligned subrange of a live mapping.
pub unsafe fn mark_inaccessible(ptr: *mut u8, size: usize) {
    // SAFETY: per this function's contract.
    if unsafe { libc::mprotect(ptr.cast::<c_void>(), size, libc::PROT_NONE) } != 0 {
        die("mprotect(PROT_NONE)");
    }
}

/// Kernel thread id of the calling thread.
#[cfg(target_os = "linux")]
#[must_use]
pub fn thread_id() -> u64 {
    // SAFETY: gettid has no preconditions.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// Thread id of the calling thread.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn thread_id() -> u64 {
    // SAFETY: pthread_self has no preconditions.
    unsafe { libc::pthread_self() as u64 }
}

/// Cheap per-thread PRNG seed. Not cryptographic; it only needs to decouple
/// slot selection across processes and threads.
#[must_use]
pub fn entropy() -> u32 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer for clock_gettime.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    (ts.tv_nsec as u32) ^ (ts.tv_sec as u32).rotate_left(16) ^ (thread_id() as u32)
}

/// Register process-lifetime fork hooks.
pub fn install_at_fork(
    prepare: extern "C" fn(),
    parent: extern "C" fn(),
    child: extern "C" fn(),
) {
    // SAFETY: the hooks are plain fns that live for the whole process.
    if unsafe { libc::pthread_atfork(Some(prepare), Some(parent), Some(child)) } != 0 {
        die("pthread_atfork");
    }
}

/// Unrecoverable platform failure: emit a diagnostic with async-signal-safe
/// writes and terminate.
fn die(what: &str) -> ! {
    let write = |bytes: &[u8]| {
        // SAFETY: raw write of a valid buffer to stderr.
        unsafe { libc::write(2, bytes.as_ptr().cast::<c_void>(), bytes.len()) };
    };
    write(b"gwp-asan: fatal platform failure: ");
    write(what.as_bytes());
    write(b"\n");
    // SAFETY: abort has no preconditions.
    unsafe { libc::abort() }
}
