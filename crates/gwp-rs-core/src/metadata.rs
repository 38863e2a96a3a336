//! Per-slot allocation metadata.
//!
//! One record per slot, laid out `#[repr(C)]` in a region that is mapped
//! once at init and never relocated, so a signal handler or an out-of-process
//! reader can walk it with plain memory reads. No heap pointers, no locks.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::compressor;

/// Maximum number of return addresses collected before compression.
pub const MAX_TRACE_FRAMES: usize = 128;

/// Fixed size of the compressed per-call-site trace buffer.
pub const TRACE_BUFFER_BYTES: usize = 256;

/// Sentinel thread id for a call site that has not been recorded.
pub const INVALID_THREAD_ID: u64 = u64::MAX;

/// A recorded allocation or deallocation site: compressed trace + thread id.
#[repr(C)]
#[derive(Debug)]
pub struct CallSiteInfo {
    /// Zig-zag varint delta encoding of the captured return addresses.
    compressed_trace: [u8; TRACE_BUFFER_BYTES],
    /// Bytes of `compressed_trace` in use.
    compressed_len: usize,
    /// Frames captured (pre-compression; may exceed what fit in the buffer).
    trace_len: usize,
    /// Capturing thread, [`INVALID_THREAD_ID`] when unset.
    thread_id: u64,
}

impl CallSiteInfo {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            compressed_trace: [0; TRACE_BUFFER_BYTES],
            compressed_len: 0,
            trace_len: 0,
            thread_id: INVALID_THREAD_ID,
        }
    }

    /// Record a captured trace for this call site.
    pub fn record(&mut self, frames: &[usize], thread_id: u64) {
        let (_, used) = compressor::pack(frames, &mut self.compressed_trace);
        self.compressed_len = used;
        self.trace_len = frames.len();
        self.thread_id = thread_id;
    }

    pub fn clear(&mut self) {
        self.compressed_len = 0;
        self.trace_len = 0;
        self.thread_id = INVALID_THREAD_ID;
    }

    /// Decompress the stored trace into `out`, returning the frame count.
    pub fn decompress_into(&self, out: &mut [usize]) -> usize {
        compressor::unpack(&self.compressed_trace[..self.compressed_len], out)
    }

    #[must_use]
    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    #[must_use]
    pub fn is_recorded(&self) -> bool {
        self.thread_id != INVALID_THREAD_ID
    }
}

/// Metadata for one guarded slot.
///
/// The zeroed bit pattern is the valid never-used state (`addr == 0`), which
/// is what the freshly mapped metadata region contains.
#[repr(C)]
#[derive(Debug)]
pub struct SlotMetadata {
    /// Base address of the current (or last) allocation; 0 if never used.
    pub addr: usize,
    /// User-requested size of the current (or last) allocation.
    pub requested_size: usize,
    /// Where the current allocation came from.
    pub allocation_site: CallSiteInfo,
    /// Where the last deallocation happened; recorded only once
    /// `is_deallocated` has ever been set.
    pub deallocation_site: CallSiteInfo,
    /// The slot was deallocated and has not been re-used since.
    pub is_deallocated: bool,
    /// Recoverable mode: this slot has produced its one report and is
    /// retired. Written from the signal handler, read under the pool mutex,
    /// so it is atomic; relaxed ordering suffices for a sticky flag.
    pub has_crashed: AtomicBool,
}

impl SlotMetadata {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            addr: 0,
            requested_size: 0,
            allocation_site: CallSiteInfo::empty(),
            deallocation_site: CallSiteInfo::empty(),
            is_deallocated: false,
            has_crashed: AtomicBool::new(false),
        }
    }

    /// The slot currently backs a live allocation.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.addr != 0 && !self.is_deallocated
    }

    /// The slot has held an allocation at some point.
    #[must_use]
    pub fn ever_used(&self) -> bool {
        self.addr != 0
    }

    /// Record a fresh allocation in this slot. The `has_crashed` flag is
    /// deliberately left alone: a slot that has produced a report stays
    /// retired for reporting purposes even when recycled.
    pub fn record_allocation(
        &mut self,
        addr: usize,
        requested_size: usize,
        frames: &[usize],
        thread_id: u64,
    ) {
        self.addr = addr;
        self.requested_size = requested_size;
        self.is_deallocated = false;
        self.allocation_site.record(frames, thread_id);
        self.deallocation_site.clear();
    }

    /// Record the deallocation of the current allocation.
    pub fn record_deallocation(&mut self, frames: &[usize], thread_id: u64) {
        self.is_deallocated = true;
        self.deallocation_site.record(frames, thread_id);
    }

    #[must_use]
    pub fn has_crashed(&self) -> bool {
        self.has_crashed.load(Ordering::Relaxed)
    }

    /// Retire the slot for reporting. Returns the previous value, so exactly
    /// one caller observes the transition.
    pub fn set_crashed(&self) -> bool {
        self.has_crashed.swap(true, Ordering::Relaxed)
    }
}

impl Default for SlotMetadata {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAMES: [usize; 3] = [0x40_1000, 0x40_1080, 0x40_0f20];

    #[test]
    fn fresh_slot_is_never_used() {
        let meta = SlotMetadata::new();
        assert!(!meta.ever_used());
        assert!(!meta.is_live());
        assert!(!meta.has_crashed());
        assert!(!meta.allocation_site.is_recorded());
    }

    #[test]
    fn allocation_then_deallocation_transitions() {
        let mut meta = SlotMetadata::new();
        meta.record_allocation(0x7000_1000, 24, &FRAMES, 42);
        assert!(meta.is_live());
        assert_eq!(meta.addr, 0x7000_1000);
        assert_eq!(meta.requested_size, 24);
        assert_eq!(meta.allocation_site.thread_id(), 42);
        assert!(!meta.deallocation_site.is_recorded());

        meta.record_deallocation(&FRAMES, 43);
        assert!(!meta.is_live());
        assert!(meta.ever_used());
        assert_eq!(meta.deallocation_site.thread_id(), 43);
    }

    #[test]
    fn reallocation_clears_deallocation_site() {
        let mut meta = SlotMetadata::new();
        meta.record_allocation(0x7000_1000, 8, &FRAMES, 1);
        meta.record_deallocation(&FRAMES, 2);
        meta.record_allocation(0x7000_1f00, 16, &FRAMES, 3);
        assert!(meta.is_live());
        assert!(!meta.deallocation_site.is_recorded());
    }

    #[test]
    fn crash_flag_survives_reallocation() {
        let mut meta = SlotMetadata::new();
        meta.record_allocation(0x7000_1000, 8, &FRAMES, 1);
        assert!(!meta.set_crashed());
        assert!(meta.set_crashed(), "second transition must observe the flag");
        meta.record_allocation(0x7000_1800, 8, &FRAMES, 1);
        assert!(meta.has_crashed());
    }

    #[test]
    fn call_site_trace_round_trips() {
        let mut site = CallSiteInfo::empty();
        site.record(&FRAMES, 7);
        let mut out = [0usize; MAX_TRACE_FRAMES];
        let n = site.decompress_into(&mut out);
        assert_eq!(&out[..n], &FRAMES);
    }

    #[test]
    fn long_traces_truncate_but_keep_prefix() {
        let frames: Vec<usize> = (0..MAX_TRACE_FRAMES)
            .map(|i| usize::MAX / 5 + i * 0x10_0000)
            .collect();
        let mut site = CallSiteInfo::empty();
        site.record(&frames, 7);
        let mut out = [0usize; MAX_TRACE_FRAMES];
        let n = site.decompress_into(&mut out);
        assert!(n > 0 && n < MAX_TRACE_FRAMES);
        assert_eq!(&out[..n], &frames[..n]);
    }
}
