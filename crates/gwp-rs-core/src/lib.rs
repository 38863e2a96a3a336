//! Platform-independent core of the guarded-pool sampling allocator.
//!
//! Everything in this crate is plain data and pure policy; nothing here maps
//! memory, takes a lock, or calls the platform. The real engine lives in
//! `gwp-rs-pool`, the crash-side classifier in `gwp-rs-handler`.
//!
//! # Architecture
//!
//! - **Error taxonomy** (`error`): closed sum of memory-safety findings
//! - **Allocator state** (`state`): published pool geometry + failure record
//! - **Slot metadata** (`metadata`): per-slot allocation records with
//!   compressed call-site traces
//! - **Trace compressor** (`compressor`): zig-zag varint delta coding
//! - **Sampling** (`sampling`): geometric inter-sample delay math
//! - **Slot policy** (`slots`): first-use ordering, then uniform recycling
//! - **Alignment** (`align`): left/right in-page placement
//! - **PRNG** (`prng`): xorshift32 with the pre-init magic seed
//! - **Options** (`options`): init-time configuration and validation

#![deny(unsafe_code)]

pub mod align;
pub mod compressor;
pub mod error;
pub mod metadata;
pub mod options;
pub mod prng;
pub mod sampling;
pub mod slots;
pub mod state;

pub use error::ErrorKind;
pub use metadata::{
    CallSiteInfo, INVALID_THREAD_ID, MAX_TRACE_FRAMES, SlotMetadata, TRACE_BUFFER_BYTES,
};
pub use options::{BacktraceFn, Options, OptionsError};
pub use state::AllocatorState;
