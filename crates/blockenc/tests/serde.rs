#![cfg(feature = "serde")]
//! Serialization round-trips for the serde-enabled public types.

use blockenc::{Bitness, ConstantOffsets, RelocKind, RelocationEntry};

#[test]
fn relocation_entry_round_trips() {
    let entry = RelocationEntry {
        kind: RelocKind::Offset64,
        address: 0x8008,
    };
    let json = serde_json::to_string(&entry).unwrap();
    let back: RelocationEntry = serde_json::from_str(&json).unwrap();
    assert_eq!(back, entry);
}

#[test]
fn bitness_serializes_by_variant_name() {
    assert_eq!(
        serde_json::to_string(&Bitness::Bits64).unwrap(),
        "\"Bits64\""
    );
    let back: Bitness = serde_json::from_str("\"Bits16\"").unwrap();
    assert_eq!(back, Bitness::Bits16);
}

#[test]
fn constant_offsets_round_trip() {
    let offsets = ConstantOffsets {
        displacement_offset: 3,
        displacement_size: 4,
        immediate_offset: 7,
        immediate_size: 1,
    };
    let json = serde_json::to_string(&offsets).unwrap();
    let back: ConstantOffsets = serde_json::from_str(&json).unwrap();
    assert_eq!(back, offsets);
}
