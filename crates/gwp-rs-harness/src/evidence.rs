//! Crash evidence extraction.
//!
//! Turns a captured report back into a structured, serializable record so
//! CI tooling can diff crash outcomes as JSON instead of grepping text.

use serde::{Deserialize, Serialize};

/// The machine-readable essence of one crash report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashEvidence {
    /// Error kind string as printed ("Double Free", "Use After Free", ...).
    pub kind: String,
    /// Address the error happened at.
    pub error_address: usize,
    /// Base of the involved allocation.
    pub allocation_address: usize,
    /// Requested size of the involved allocation.
    pub allocation_size: usize,
}

impl CrashEvidence {
    /// Parse the first report found in `output`, if any.
    #[must_use]
    pub fn parse(output: &str) -> Option<Self> {
        let mut lines = output.lines();
        lines.find(|line| line.contains("GWP-ASan detected a memory error"))?;
        let detail = lines.next()?;
        // "<Kind> at 0x<addr> (<n> bytes <where> a <size>-byte allocation
        //  at 0x<base>) by thread <tid> here:"
        let (kind, rest) = detail.split_once(" at 0x")?;
        let (addr_hex, rest) = rest.split_once(' ')?;
        let error_address = usize::from_str_radix(addr_hex, 16).ok()?;
        let (_, rest) = rest.split_once(" a ")?;
        let (size_text, rest) = rest.split_once("-byte allocation at 0x")?;
        let allocation_size = size_text.parse().ok()?;
        let (base_hex, _) = rest.split_once(')')?;
        let allocation_address = usize::from_str_radix(base_hex, 16).ok()?;
        Some(Self {
            kind: kind.trim().to_string(),
            error_address,
            allocation_address,
            allocation_size,
        })
    }

    /// Serialize for fixture files and CI diffs.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }
}
