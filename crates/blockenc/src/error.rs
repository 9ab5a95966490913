//! Error types for re-encoding failures.
//!
//! Only *encoding-time* conditions are surfaced as [`EncodeError`] — an
//! instruction that cannot legally be re-encoded at its new address. Malformed
//! caller input (bad width, mismatched output-slice lengths, duplicate
//! original addresses) is a programmer error and panics eagerly before any
//! encoding work begins; broken internal invariants (a unit growing after
//! initialization, an emitted byte count not matching the committed size)
//! are `assert!` failures, never ordinary errors.

use core::fmt;

/// Re-encoding error with the original address of the failing instruction.
///
/// Any single failing instruction aborts the whole encode operation; bytes
/// already written to the caller's sinks must be discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// The target address can be reached by no supported addressing form.
    TargetTooFar {
        /// Original address of the failing instruction.
        ip: u64,
        /// The unreachable target address.
        target: u64,
    },

    /// A branch displacement exceeds the range of the committed encoding.
    ///
    /// Reachable only when branch fix-up is disabled — with fix-up enabled
    /// the layout phase substitutes a wider form instead.
    BranchOutOfRange {
        /// Original address of the branch.
        ip: u64,
        /// The branch target address.
        target: u64,
        /// The actual displacement to the target.
        disp: i64,
        /// Maximum allowed displacement magnitude.
        max: i64,
    },

    /// The re-encoded instruction exposes a different address at runtime
    /// than the resolved target — the round-trip check failed.
    AddressRoundTrip {
        /// Original address of the failing instruction.
        ip: u64,
        /// The resolved target address the encoding was meant to reach.
        expected: u64,
        /// The address the emitted bytes actually compute.
        actual: u64,
    },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::TargetTooFar { ip, target } => {
                write!(
                    f,
                    "instruction at 0x{ip:X}: target 0x{target:X} too far away, unsupported"
                )
            }
            EncodeError::BranchOutOfRange {
                ip,
                target,
                disp,
                max,
            } => {
                write!(
                    f,
                    "branch at 0x{ip:X}: target 0x{target:X} out of range (displacement={disp}, max=±{max})"
                )
            }
            EncodeError::AddressRoundTrip {
                ip,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "instruction at 0x{ip:X}: re-encoded operand resolves to 0x{actual:X}, expected 0x{expected:X}"
                )
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for EncodeError {}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn target_too_far_display() {
        let err = EncodeError::TargetTooFar {
            ip: 0x1000,
            target: 0x1_0000_0000,
        };
        assert_eq!(
            format!("{err}"),
            "instruction at 0x1000: target 0x100000000 too far away, unsupported"
        );
    }

    #[test]
    fn branch_out_of_range_display() {
        let err = EncodeError::BranchOutOfRange {
            ip: 0x10,
            target: 0x9_0000_0010,
            disp: 0x9_0000_0000 - 5,
            max: i32::MAX as i64,
        };
        let s = format!("{err}");
        assert!(s.starts_with("branch at 0x10: target 0x900000010 out of range"));
    }

    #[test]
    fn address_round_trip_display() {
        let err = EncodeError::AddressRoundTrip {
            ip: 0x2000,
            expected: 0x3000,
            actual: 0x2F00,
        };
        assert_eq!(
            format!("{err}"),
            "instruction at 0x2000: re-encoded operand resolves to 0x2F00, expected 0x3000"
        );
    }
}
