//! Guarded-pool sampling allocator engine.
//!
//! A thin, opt-in sidecar to the process's primary allocator: a small fixed
//! population of allocations is diverted into page-isolated slots flanked by
//! inaccessible guard pages, so memory-safety bugs on sampled allocations
//! trap deterministically.
//!
//! # Architecture
//!
//! - **Platform layer** (`platform`): page mapping/protection, entropy,
//!   thread ids, at-fork registration
//! - **Thread locals** (`tls`): sampling counter, PRNG state, re-entrancy
//!   guard
//! - **Pool** (`pool`): the `GuardedPoolAllocator` engine
//! - **Fork handling** (`fork`): mutex quiescing across `fork`
//! - **Metrics** (`metrics`): atomic counters for observability
//!
//! The crash-side classifier and the recoverable signal handler live in
//! `gwp-rs-handler`; everything platform-independent lives in `gwp-rs-core`.

mod fork;
pub mod metrics;
pub mod platform;
mod pool;
mod tls;

pub use metrics::{MetricsSnapshot, PoolMetrics};
pub use pool::{GuardedPoolAllocator, singleton};
pub use tls::pending_internal_error;
