//! Crash report writer.
//!
//! Formats a diagnosed error through a caller-supplied printer, one line per
//! call, using only stack storage: the printer may be invoked from a signal
//! handler. The header and error-kind strings are stable; tooling greps for
//! them.

use std::fmt;

use gwp_rs_core::metadata::{CallSiteInfo, MAX_TRACE_FRAMES, SlotMetadata};

use crate::diagnose::Diagnosis;

/// Report sink. Receives one formatted line per call.
pub type Printer = fn(fmt::Arguments<'_>);

/// Write the full report for `diagnosis` to `printer`.
///
/// `access_thread_id` is the thread the faulting access happened on (the
/// current thread, when called from the signal handler).
pub fn print_report(
    printer: Printer,
    metadata: *const SlotMetadata,
    diagnosis: &Diagnosis,
    access_thread_id: u64,
) {
    // SAFETY: the diagnosis slot indexes the published metadata region.
    let meta = unsafe { &*metadata.add(diagnosis.slot) };
    let base = meta.addr;
    let size = meta.requested_size;
    let error_address = diagnosis.error_address;
    let end = base.saturating_add(size);

    printer(format_args!("*** GWP-ASan detected a memory error ***\n"));
    if error_address < base {
        printer(format_args!(
            "{} at {:#x} ({} bytes to the left of a {}-byte allocation at {:#x}) by thread {} here:\n",
            diagnosis.kind,
            error_address,
            base - error_address,
            size,
            base,
            access_thread_id,
        ));
    } else if error_address >= end {
        printer(format_args!(
            "{} at {:#x} ({} bytes to the right of a {}-byte allocation at {:#x}) by thread {} here:\n",
            diagnosis.kind,
            error_address,
            error_address - end,
            size,
            base,
            access_thread_id,
        ));
    } else {
        printer(format_args!(
            "{} at {:#x} ({} bytes into a {}-byte allocation at {:#x}) by thread {} here:\n",
            diagnosis.kind,
            error_address,
            error_address - base,
            size,
            base,
            access_thread_id,
        ));
    }

    if meta.deallocation_site.is_recorded() {
        printer(format_args!(
            "{:#x} was deallocated by thread {} here:\n",
            base,
            meta.deallocation_site.thread_id(),
        ));
        print_trace(printer, &meta.deallocation_site);
    }
    if meta.allocation_site.is_recorded() {
        printer(format_args!(
            "{:#x} was allocated by thread {} here:\n",
            base,
            meta.allocation_site.thread_id(),
        ));
        print_trace(printer, &meta.allocation_site);
    }
    printer(format_args!("*** End GWP-ASan report ***\n"));
}

fn print_trace(printer: Printer, site: &CallSiteInfo) {
    let mut frames = [0usize; MAX_TRACE_FRAMES];
    let count = site.decompress_into(&mut frames);
    for (index, frame) in frames[..count].iter().enumerate() {
        printer(format_args!("  #{index} {frame:#x}\n"));
    }
    printer(format_args!("\n"));
}
