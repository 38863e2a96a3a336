//! Fault classification.
//!
//! Works from the published allocator state and metadata region only, so it
//! can run inside a signal handler or in another process entirely. A fault
//! that cannot be attributed to a sampled allocation yields `None` and
//! should be treated as not ours.
//!
//! Engine-raised errors (double free, invalid free) are passed in as
//! `pending_internal` by the caller. In process, that is the raising
//! thread's thread-local record, which only the thread whose store provoked
//! the fault can observe; the published failure record in `AllocatorState`
//! is never consulted here, so a concurrent hardware fault on another
//! thread is always classified from its own address.

use gwp_rs_core::ErrorKind;
use gwp_rs_core::metadata::SlotMetadata;
use gwp_rs_core::state::AllocatorState;

/// Outcome of classifying a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Diagnosis {
    pub kind: ErrorKind,
    /// Slot the error is attributed to.
    pub slot: usize,
    /// The address the error happened at. For internally raised traps this
    /// is the recorded failure address, not the signal address.
    pub error_address: usize,
    /// Whether the engine published this error before raising the fault.
    pub internally_detected: bool,
}

/// Classify a fault at `fault_addr`.
///
/// - `pending_internal` (the kind and address the current thread's engine
///   call recorded before raising) takes precedence: the signal address is
///   only the trap vehicle.
/// - A fault on a freed slot page, or on a guard page next to a freed slot,
///   is a use-after-free.
/// - A fault on a guard page next to a live slot is an overflow when the
///   allocation sits left of the fault, otherwise an underflow.
/// - Anything else (never-used neighbor, live slot page) is unattributable.
pub fn diagnose(
    state: &AllocatorState,
    metadata: *const SlotMetadata,
    fault_addr: usize,
    pending_internal: Option<(ErrorKind, usize)>,
) -> Option<Diagnosis> {
    if let Some((kind, error_address)) = pending_internal {
        return Some(Diagnosis {
            kind,
            slot: state.nearest_slot(error_address),
            error_address,
            internally_detected: true,
        });
    }
    if metadata.is_null() || !state.pointer_is_mine(fault_addr) {
        return None;
    }
    let slot = state.nearest_slot(fault_addr);
    // SAFETY: slot is within the metadata region; reads are plain loads of
    // the published record.
    let meta = unsafe { &*metadata.add(slot) };
    if !meta.ever_used() {
        return None;
    }
    let kind = if state.is_guard_page(fault_addr) {
        if meta.is_deallocated {
            ErrorKind::UseAfterFree
        } else if meta.addr < fault_addr {
            ErrorKind::BufferOverflow
        } else {
            ErrorKind::BufferUnderflow
        }
    } else if meta.is_deallocated {
        ErrorKind::UseAfterFree
    } else {
        // A live slot page is accessible; a fault here is not ours.
        return None;
    };
    Some(Diagnosis {
        kind,
        slot,
        error_address: fault_addr,
        internally_detected: false,
    })
}
