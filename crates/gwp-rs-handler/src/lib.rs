//! Crash-side companion to the guarded pool.
//!
//! Faults inside the pool range are classified from the published allocator
//! state and the per-slot metadata alone, with async-signal-safe reads: no
//! pool mutex, no heap, no language-runtime machinery. The same classifier
//! serves an in-process SIGSEGV handler and out-of-process crash printers.
//!
//! # Architecture
//!
//! - **Diagnosis** (`diagnose`): pure classification of a fault address
//! - **Report** (`report`): line-by-line report writer over a caller printer
//! - **Signal handler** (`segv`): optional SIGSEGV handler; in recoverable
//!   mode it reports once per slot, unprotects the faulting page, and
//!   resumes the program

mod diagnose;
mod report;
mod segv;

pub use diagnose::{Diagnosis, diagnose};
pub use report::{Printer, print_report};
pub use segv::install_signal_handler;
