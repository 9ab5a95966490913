#![cfg(not(target_arch = "wasm32"))]
//! Branch re-encoding: short/near selection, pointer-slot thunks for
//! out-of-reach 64-bit targets, and behavior with fix-up disabled.

use blockenc::{
    reencode, Bitness, BlockEncoder, BlockEncoderOptions, EncodeError, InstrBlock, Instruction,
};

fn reencode_with(
    bitness: Bitness,
    instructions: &[Instruction],
    new_base: u64,
    options: BlockEncoderOptions,
) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    let mut blocks = [InstrBlock::new(&mut out, instructions, new_base)];
    BlockEncoder::encode(bitness, &mut blocks, options)?;
    Ok(out)
}

#[test]
fn backward_jmp_shrinks_to_short() {
    let instructions = [
        Instruction::plain(0x1000, &[0x90]),
        Instruction::jmp(0x1001, 0x1000),
    ];
    let code = reencode(Bitness::Bits64, &instructions, 0x8000).unwrap();
    assert_eq!(code, [0x90, 0xEB, 0xFD]);
}

#[test]
fn forward_jmp_shrinks_to_short() {
    let instructions = [
        Instruction::jmp(0x1000, 0x1002),
        Instruction::plain(0x1002, &[0x90]),
    ];
    let code = reencode(Bitness::Bits64, &instructions, 0x8000).unwrap();
    assert_eq!(code, [0xEB, 0x00, 0x90]);
}

#[test]
fn jcc_near_to_external_target() {
    // jne to a fixed external address within ±2 GiB
    let instructions = [Instruction::jcc(0x1000, 5, 0x4000)];
    let code = reencode(Bitness::Bits64, &instructions, 0x1000).unwrap();
    assert_eq!(code, [0x0F, 0x85, 0xFA, 0x2F, 0x00, 0x00]);
}

#[test]
fn jcc_short_to_external_target() {
    let instructions = [Instruction::jcc(0x1000, 4, 0x1010)];
    let code = reencode(Bitness::Bits64, &instructions, 0x1000).unwrap();
    assert_eq!(code, [0x74, 0x0E]);
}

#[test]
fn call_has_no_short_form() {
    let instructions = [Instruction::call(0x1000, 0x2000)];
    let code = reencode(Bitness::Bits64, &instructions, 0x8000).unwrap();
    assert_eq!(code, [0xE8, 0xFB, 0x9F, 0xFF, 0xFF]);
}

#[test]
fn far_jmp_goes_through_pointer_slot() {
    let instructions = [
        Instruction::plain(0x1000, &[0x90]),
        Instruction::jmp(0x1001, 0x9_0000_0000),
    ];
    let code = reencode(Bitness::Bits64, &instructions, 0x8000).unwrap();
    // nop; jmp [rip+1] through the slot at 0x8008; INT3 alignment fill.
    assert_eq!(code[0], 0x90);
    assert_eq!(&code[1..7], &[0xFF, 0x25, 0x01, 0x00, 0x00, 0x00]);
    assert_eq!(code[7], 0xCC);
    assert_eq!(
        u64::from_le_bytes(code[8..16].try_into().unwrap()),
        0x9_0000_0000
    );
}

#[test]
fn far_call_goes_through_pointer_slot() {
    let instructions = [
        Instruction::plain(0x1000, &[0x90]),
        Instruction::call(0x1001, 0x9_0000_0000),
    ];
    let code = reencode(Bitness::Bits64, &instructions, 0x8000).unwrap();
    assert_eq!(&code[1..7], &[0xFF, 0x15, 0x01, 0x00, 0x00, 0x00]);
}

#[test]
fn far_jcc_inverts_condition_and_skips_the_thunk() {
    // je 0x9_0000_0000 becomes: jne +6; jmp [rip+disp32]
    let instructions = [
        Instruction::plain(0x1000, &[0x90]),
        Instruction::jcc(0x1001, 4, 0x9_0000_0000),
    ];
    let code = reencode(Bitness::Bits64, &instructions, 0x8000).unwrap();
    assert_eq!(code[0], 0x90);
    // inverted short jcc: 0x70 + (4 ^ 1) = 0x75, skipping the 6-byte thunk
    assert_eq!(&code[1..3], &[0x75, 0x06]);
    // slot lands at align8(0x8009) = 0x8010; disp32 = 0x8010 - 0x8009 = 7
    assert_eq!(&code[3..9], &[0xFF, 0x25, 0x07, 0x00, 0x00, 0x00]);
    assert_eq!(&code[9..16], &[0xCC; 7]);
    assert_eq!(
        u64::from_le_bytes(code[16..24].try_into().unwrap()),
        0x9_0000_0000
    );
}

#[test]
fn unfixed_branch_keeps_near_form() {
    // With fix-up disabled a short-reachable branch still encodes near.
    let instructions = [
        Instruction::jmp(0x1000, 0x1005),
        Instruction::plain(0x1005, &[0x90]),
    ];
    let code = reencode_with(
        Bitness::Bits64,
        &instructions,
        0x8000,
        BlockEncoderOptions { fix_branches: false },
    )
    .unwrap();
    assert_eq!(code, [0xE9, 0x00, 0x00, 0x00, 0x00, 0x90]);
}

#[test]
fn unfixed_branch_out_of_range_is_an_error() {
    let instructions = [Instruction::jmp(0x1000, 0x9_0000_0000)];
    let err = reencode_with(
        Bitness::Bits64,
        &instructions,
        0x8000,
        BlockEncoderOptions { fix_branches: false },
    )
    .unwrap_err();
    match err {
        EncodeError::BranchOutOfRange { ip, target, .. } => {
            assert_eq!(ip, 0x1000);
            assert_eq!(target, 0x9_0000_0000);
        }
        other => panic!("expected BranchOutOfRange, got {other}"),
    }
}

#[test]
fn thirty_two_bit_near_always_reaches() {
    // Displacement arithmetic wraps at 32 bits; no thunk exists or is needed.
    let instructions = [Instruction::jmp(0x1000, 0x9000_0000)];
    let code = reencode(Bitness::Bits32, &instructions, 0x1000).unwrap();
    let disp = 0x9000_0000u32.wrapping_sub(0x1005);
    let mut expect = vec![0xE9];
    expect.extend_from_slice(&disp.to_le_bytes());
    assert_eq!(code, expect);
}

#[test]
fn sixteen_bit_near_uses_rel16() {
    let instructions = [Instruction::jmp(0x100, 0x10)];
    let code = reencode(Bitness::Bits16, &instructions, 0xFFF0).unwrap();
    // next = 0xFFF3; disp16 wraps to 0x001D
    assert_eq!(code, [0xE9, 0x1D, 0x00]);
}

#[test]
fn mutually_referencing_branches_converge() {
    // Two jumps at opposite ends of a long block, each targeting the other's
    // side; both end up short once the intervening sizes settle.
    let mut instructions = vec![Instruction::jmp(0x1000, 0x1042)];
    for i in 0..0x20 {
        instructions.push(Instruction::plain(0x1002 + 2 * i, &[0x66, 0x90]));
    }
    instructions.push(Instruction::jmp(0x1042, 0x1000));
    let code = reencode(Bitness::Bits64, &instructions, 0x8000).unwrap();
    // 2 + 64 + 2 bytes once both branches settle on rel8
    assert_eq!(code.len(), 68);
    assert_eq!(&code[..2], &[0xEB, 0x40]);
    assert_eq!(&code[66..], &[0xEB, 0xBC]);
}
