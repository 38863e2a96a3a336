//! Memory-safety finding taxonomy.
//!
//! A closed set of tagged kinds published into plain allocator state, never
//! unwound as panics. The display strings are load-bearing: crash reports are
//! grepped for them by tooling and by the scenario suite.

use std::fmt;

/// Classification of a detected memory-safety error.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No error, or one that could not be attributed.
    #[default]
    Unknown = 0,
    /// Access to a slot after it was deallocated.
    UseAfterFree = 1,
    /// Deallocation of an already-deallocated slot.
    DoubleFree = 2,
    /// Deallocation with a pointer that is not the allocation base.
    InvalidFree = 3,
    /// Access past the right edge of an allocation, into a guard page.
    BufferOverflow = 4,
    /// Access past the left edge of an allocation, into a guard page.
    BufferUnderflow = 5,
}

impl ErrorKind {
    /// Human-readable name as it appears in crash reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::UseAfterFree => "Use After Free",
            Self::DoubleFree => "Double Free",
            Self::InvalidFree => "Invalid (Wild) Free",
            Self::BufferOverflow => "Buffer Overflow",
            Self::BufferUnderflow => "Buffer Underflow",
        }
    }

    /// Decode from the raw byte stored in the published allocator state.
    /// Unrecognized values decode as `Unknown`.
    #[must_use]
    pub const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::UseAfterFree,
            2 => Self::DoubleFree,
            3 => Self::InvalidFree,
            4 => Self::BufferOverflow,
            5 => Self::BufferUnderflow,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_byte_round_trip() {
        for kind in [
            ErrorKind::Unknown,
            ErrorKind::UseAfterFree,
            ErrorKind::DoubleFree,
            ErrorKind::InvalidFree,
            ErrorKind::BufferOverflow,
            ErrorKind::BufferUnderflow,
        ] {
            assert_eq!(ErrorKind::from_u8(kind as u8), kind);
        }
    }

    #[test]
    fn unrecognized_bytes_decode_as_unknown() {
        assert_eq!(ErrorKind::from_u8(6), ErrorKind::Unknown);
        assert_eq!(ErrorKind::from_u8(0xff), ErrorKind::Unknown);
    }

    #[test]
    fn report_strings() {
        assert_eq!(ErrorKind::DoubleFree.as_str(), "Double Free");
        assert_eq!(ErrorKind::InvalidFree.as_str(), "Invalid (Wild) Free");
        assert_eq!(ErrorKind::UseAfterFree.as_str(), "Use After Free");
        assert_eq!(ErrorKind::BufferOverflow.as_str(), "Buffer Overflow");
        assert_eq!(ErrorKind::BufferUnderflow.as_str(), "Buffer Underflow");
    }
}
