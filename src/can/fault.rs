//! Fault taxonomies and classification.
//!
//! Two independent tables: a short, in-band taxonomy carried in the fault
//! byte of every feedback frame's identifier (6 bits, so codes 0-63), and an
//! extended taxonomy carried in the dedicated fault frame's two 32-bit
//! bitmaps. Both are matched by **equality against a single code**, not by
//! testing bit intersection, even though the wire fields are bitmaps. This
//! mirrors the reference firmware exactly and is a known-odd behaviour
//! (faults with more than one bit set simultaneously match nothing) that is
//! preserved rather than "fixed" — see the crate-level design notes.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultEntry {
    pub code: u32,
    pub critical: bool,
    pub description: &'static str,
}

const SHORT_TAXONOMY: &[FaultEntry] = &[
    FaultEntry { code: 0x01, critical: true, description: "over-temperature" },
    FaultEntry { code: 0x02, critical: true, description: "over-current" },
    FaultEntry { code: 0x04, critical: false, description: "under-voltage" },
    FaultEntry { code: 0x08, critical: true, description: "encoder fault" },
    FaultEntry { code: 0x10, critical: false, description: "over-voltage" },
    FaultEntry { code: 0x20, critical: false, description: "communication loss" },
];

const EXTENDED_TAXONOMY: &[FaultEntry] = &[
    FaultEntry { code: 0x0000_0001, critical: true, description: "over-temperature" },
    FaultEntry { code: 0x0000_0002, critical: true, description: "over-current" },
    FaultEntry { code: 0x0000_0004, critical: false, description: "under-voltage" },
    FaultEntry { code: 0x0000_0008, critical: true, description: "encoder fault" },
    FaultEntry { code: 0x0000_0010, critical: false, description: "over-voltage" },
    FaultEntry { code: 0x0000_0020, critical: false, description: "communication loss" },
    FaultEntry { code: 0x0000_0040, critical: true, description: "driver fault" },
];

// TODO: confirm with hardware whether multi-bit fault registers are
// possible in practice; if so this equality lookup silently drops them.
/// Looks up a 6-bit in-band fault code by equality. Zero never matches
/// (it means "no fault").
pub fn classify_short(code: u8) -> Option<&'static FaultEntry> {
    if code == 0 {
        return None;
    }
    SHORT_TAXONOMY.iter().find(|entry| entry.code == code as u32)
}

/// Looks up a 32-bit extended fault or warning code by equality.
pub fn classify_extended(code: u32) -> Option<&'static FaultEntry> {
    if code == 0 {
        return None;
    }
    EXTENDED_TAXONOMY.iter().find(|entry| entry.code == code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_over_temperature_is_critical() {
        let entry = classify_extended(0x0000_0001).unwrap();
        assert!(entry.critical);
        assert_eq!(entry.description, "over-temperature");
    }

    #[test]
    fn extended_under_voltage_is_warning() {
        let entry = classify_extended(0x0000_0004).unwrap();
        assert!(!entry.critical);
    }

    #[test]
    fn multi_bit_codes_match_nothing_by_design() {
        // 0x01 | 0x04 has two bits set; equality lookup must not match
        // either individual entry.
        assert!(classify_extended(0x0000_0005).is_none());
    }

    #[test]
    fn zero_is_never_a_fault() {
        assert!(classify_short(0).is_none());
        assert!(classify_extended(0).is_none());
    }
}
