//! Init-time configuration.
//!
//! The surrounding allocator populates an `Options` struct and hands it to
//! `init`; parsing from strings or the environment is the host's business.

use thiserror::Error;

/// Backtrace capturer supplied by the host: fills the buffer with return
/// addresses and returns how many were captured. May allocate internally;
/// the engine's recursive guard keeps any such allocation out of the pool.
pub type BacktraceFn = fn(frames: &mut [usize]) -> usize;

/// Configuration accepted by `GuardedPoolAllocator::init`.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Master switch; when false, `init` leaves the pool in its zero state.
    pub enabled: bool,
    /// Expected number of allocations between samples.
    pub sample_rate: u32,
    /// Number of guarded slots, i.e. the maximum live sampled allocations.
    pub max_simultaneous_allocations: usize,
    /// Force exact right alignment instead of snapping to natural alignment.
    pub perfectly_right_align: bool,
    /// Report-and-resume instead of report-and-die.
    pub recoverable: bool,
    /// Backtrace capturer; `None` records empty traces.
    pub backtrace: Option<BacktraceFn>,
    /// Quiesce the pool mutex across `fork`.
    pub install_fork_handlers: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 5000,
            max_simultaneous_allocations: 16,
            perfectly_right_align: false,
            recoverable: false,
            backtrace: None,
            install_fork_handlers: true,
        }
    }
}

/// Rejected configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("sample rate must be nonzero")]
    ZeroSampleRate,
    #[error("sample rate {0} leaves no room for the +1 adjustment")]
    SampleRateTooLarge(u32),
    #[error("slot count must be nonzero")]
    ZeroSlotCount,
    #[error("slot count {0} would overflow the pool mapping size")]
    SlotCountTooLarge(usize),
}

impl Options {
    /// Validate an enabled configuration. A disabled configuration is always
    /// acceptable (it leaves the pool untouched).
    pub fn validate(&self) -> Result<(), OptionsError> {
        if !self.enabled {
            return Ok(());
        }
        if self.sample_rate == 0 {
            return Err(OptionsError::ZeroSampleRate);
        }
        if self.sample_rate == u32::MAX {
            return Err(OptionsError::SampleRateTooLarge(self.sample_rate));
        }
        if self.max_simultaneous_allocations == 0 {
            return Err(OptionsError::ZeroSlotCount);
        }
        // 2N + 1 pages must be expressible in bytes on this platform; give
        // page sizes up to 64 KiB headroom.
        if self.max_simultaneous_allocations > usize::MAX / (2 * 65536) {
            return Err(OptionsError::SlotCountTooLarge(
                self.max_simultaneous_allocations,
            ));
        }
        Ok(())
    }
}
