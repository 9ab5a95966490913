#![cfg(not(target_arch = "wasm32"))]
//! Cross-validation tests: encode with blockenc, decode with iced-x86.
//!
//! Every emitted byte sequence is decoded with iced-x86 and checked for the
//! expected mnemonic, addressing form and resolved target. This provides
//! gold-standard validation against an independent, battle-tested decoder.

use blockenc::{reencode, Bitness, Instruction};
use iced_x86::{Decoder, DecoderOptions, Instruction as Decoded, Mnemonic, OpKind, Register};

// ─── Helpers ──────────────────────────────────────────────────────────────────

/// Decode `count` instructions starting at `ip`.
fn decode(bytes: &[u8], ip: u64, count: usize) -> Vec<Decoded> {
    let mut decoder = Decoder::with_ip(64, bytes, ip, DecoderOptions::NONE);
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        assert!(decoder.can_decode(), "ran out of bytes: {bytes:02X?}");
        let instr = decoder.decode();
        assert_ne!(
            instr.mnemonic(),
            Mnemonic::INVALID,
            "iced-x86 decoded INVALID in {bytes:02X?}"
        );
        out.push(instr);
    }
    out
}

// ─── IP-relative memory operands ──────────────────────────────────────────────

#[test]
fn rip_relative_mov_resolves_to_target() {
    let instructions = [Instruction::ip_rel_mem(0x1000, &[0x48, 0x8B], 0, 0x2000)];
    let code = reencode(Bitness::Bits64, &instructions, 0x8000).unwrap();
    let decoded = decode(&code, 0x8000, 1);
    assert_eq!(decoded[0].mnemonic(), Mnemonic::Mov);
    assert_eq!(decoded[0].memory_base(), Register::RIP);
    assert_eq!(decoded[0].ip_rel_memory_address(), 0x2000);
}

#[test]
fn eip_relative_form_resolves_with_wraparound() {
    let instructions = [Instruction::ip_rel_mem(0x1000, &[0x48, 0x8B], 0, 0x1000)];
    let code = reencode(Bitness::Bits64, &instructions, 0x2_0000_0000).unwrap();
    let decoded = decode(&code, 0x2_0000_0000, 1);
    assert_eq!(decoded[0].mnemonic(), Mnemonic::Mov);
    assert_eq!(decoded[0].memory_base(), Register::EIP);
    assert_eq!(decoded[0].ip_rel_memory_address(), 0x1000);
}

#[test]
fn immediate_survives_re_encoding() {
    let instructions =
        [Instruction::ip_rel_mem(0x1000, &[0x83], 7, 0x2000).with_immediate(&[0x12])];
    let code = reencode(Bitness::Bits64, &instructions, 0x8000).unwrap();
    let decoded = decode(&code, 0x8000, 1);
    assert_eq!(decoded[0].mnemonic(), Mnemonic::Cmp);
    assert_eq!(decoded[0].ip_rel_memory_address(), 0x2000);
    assert_eq!(decoded[0].immediate8(), 0x12);
}

// ─── Branches ─────────────────────────────────────────────────────────────────

#[test]
fn short_jmp_targets_its_companion() {
    let instructions = [
        Instruction::plain(0x1000, &[0x90]),
        Instruction::jmp(0x1001, 0x1000),
    ];
    let code = reencode(Bitness::Bits64, &instructions, 0x8000).unwrap();
    let decoded = decode(&code, 0x8000, 2);
    assert_eq!(decoded[0].mnemonic(), Mnemonic::Nop);
    assert_eq!(decoded[1].mnemonic(), Mnemonic::Jmp);
    assert_eq!(decoded[1].op0_kind(), OpKind::NearBranch64);
    assert_eq!(decoded[1].near_branch_target(), 0x8000);
}

#[test]
fn near_jcc_targets_external_address() {
    let instructions = [Instruction::jcc(0x1000, 5, 0x4000)];
    let code = reencode(Bitness::Bits64, &instructions, 0x1000).unwrap();
    let decoded = decode(&code, 0x1000, 1);
    assert_eq!(decoded[0].mnemonic(), Mnemonic::Jne);
    assert_eq!(decoded[0].near_branch_target(), 0x4000);
}

#[test]
fn near_call_targets_external_address() {
    let instructions = [Instruction::call(0x1000, 0x2000)];
    let code = reencode(Bitness::Bits64, &instructions, 0x8000).unwrap();
    let decoded = decode(&code, 0x8000, 1);
    assert_eq!(decoded[0].mnemonic(), Mnemonic::Call);
    assert_eq!(decoded[0].near_branch_target(), 0x2000);
}

#[test]
fn far_jmp_becomes_indirect_through_slot() {
    let instructions = [
        Instruction::plain(0x1000, &[0x90]),
        Instruction::jmp(0x1001, 0x9_0000_0000),
    ];
    let code = reencode(Bitness::Bits64, &instructions, 0x8000).unwrap();
    let decoded = decode(&code, 0x8000, 2);
    assert_eq!(decoded[1].mnemonic(), Mnemonic::Jmp);
    assert_eq!(decoded[1].op0_kind(), OpKind::Memory);
    assert_eq!(decoded[1].memory_base(), Register::RIP);
    // the slot holds the true target
    let slot = decoded[1].ip_rel_memory_address();
    let off = (slot - 0x8000) as usize;
    assert_eq!(
        u64::from_le_bytes(code[off..off + 8].try_into().unwrap()),
        0x9_0000_0000
    );
}

#[test]
fn far_call_becomes_indirect_through_slot() {
    let instructions = [
        Instruction::plain(0x1000, &[0x90]),
        Instruction::call(0x1001, 0x9_0000_0000),
    ];
    let code = reencode(Bitness::Bits64, &instructions, 0x8000).unwrap();
    let decoded = decode(&code, 0x8000, 2);
    assert_eq!(decoded[1].mnemonic(), Mnemonic::Call);
    assert_eq!(decoded[1].op0_kind(), OpKind::Memory);
    assert_eq!(decoded[1].memory_base(), Register::RIP);
}

#[test]
fn far_jcc_becomes_inverted_skip_plus_indirect_jmp() {
    // je becomes: jne past the thunk; jmp [rip+disp32]
    let instructions = [
        Instruction::plain(0x1000, &[0x90]),
        Instruction::jcc(0x1001, 4, 0x9_0000_0000),
    ];
    let code = reencode(Bitness::Bits64, &instructions, 0x8000).unwrap();
    let decoded = decode(&code, 0x8000, 3);
    assert_eq!(decoded[1].mnemonic(), Mnemonic::Jne);
    // skip lands just past the indirect jmp
    assert_eq!(decoded[1].near_branch_target(), 0x8009);
    assert_eq!(decoded[2].mnemonic(), Mnemonic::Jmp);
    assert_eq!(decoded[2].op0_kind(), OpKind::Memory);
    let slot = decoded[2].ip_rel_memory_address();
    let off = (slot - 0x8000) as usize;
    assert_eq!(
        u64::from_le_bytes(code[off..off + 8].try_into().unwrap()),
        0x9_0000_0000
    );
}
