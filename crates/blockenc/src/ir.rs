//! Instruction representation consumed by the block encoder.
//!
//! The block encoder does not decode binaries; the host tool supplies each
//! instruction pre-classified by operand shape:
//!
//! - [`Instruction::plain`] — position-independent bytes, copied verbatim.
//! - [`Instruction::ip_rel_mem`] — one IP-relative memory operand
//!   (ModR/M `mod=00, rm=101`), re-aimed at its original target.
//! - [`Instruction::jmp`] / [`Instruction::jcc`] / [`Instruction::call`] —
//!   near branches whose displacement is rewritten (and whose encoding may
//!   shrink or be substituted) during layout.
//!
//! Every instruction carries the *original* address it was decoded from;
//! this is the stable key other instructions use to reference it.

use crate::encoder::InstrBytes;

/// Addressing width of the code being re-encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Bitness {
    /// 16-bit addressing.
    Bits16,
    /// 32-bit addressing.
    Bits32,
    /// 64-bit addressing (required for RIP-relative memory operands).
    Bits64,
}

impl Bitness {
    /// Convert a raw width in bits.
    ///
    /// # Panics
    ///
    /// Panics if `bits` is not 16, 32 or 64.
    #[must_use]
    pub fn new(bits: u32) -> Self {
        match bits {
            16 => Bitness::Bits16,
            32 => Bitness::Bits32,
            64 => Bitness::Bits64,
            other => panic!("unsupported bitness {other}: expected 16, 32 or 64"),
        }
    }

    /// The width in bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Bitness::Bits16 => 16,
            Bitness::Bits32 => 32,
            Bitness::Bits64 => 64,
        }
    }

    #[inline]
    pub(crate) const fn is_64(self) -> bool {
        matches!(self, Bitness::Bits64)
    }
}

/// Addressing form of an IP-relative memory operand.
///
/// The wide (EIP) form carries a 0x67 address-size prefix and computes the
/// effective address with 32-bit wrap-around, which zero-extends the result —
/// usable whenever the target fits in an unsigned 32-bit value regardless of
/// where the instruction itself lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddrForm {
    /// `[RIP + disp32]` — signed 32-bit displacement from the next instruction.
    RipRel,
    /// `[EIP + disp32]` — 0x67-prefixed, 32-bit wrap-around addressing.
    EipRel,
}

/// An instruction with one IP-relative memory operand.
#[derive(Debug, Clone)]
pub(crate) struct IpRelMemOp {
    /// Legacy prefixes, REX and opcode bytes — everything before ModR/M.
    pub opcode: InstrBytes,
    /// ModR/M `reg` field (0–7; extension bits belong in the REX prefix).
    pub reg: u8,
    /// Address the memory operand refers to.
    pub target: u64,
    /// Immediate bytes trailing the displacement, if any.
    pub imm: InstrBytes,
    /// Currently selected addressing form.
    pub form: AddrForm,
}

/// Encoding form of a near branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BranchForm {
    /// rel8 form (`EB` / `7x`).
    Short,
    /// rel32 form (rel16 in 16-bit mode).
    Near,
}

/// Branch flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BranchKind {
    /// Unconditional `JMP`.
    Jmp,
    /// Conditional jump with condition code 0–15 (`JO` … `JG`).
    Jcc(u8),
    /// Near `CALL` (no short form).
    Call,
}

/// A near branch with a code target.
#[derive(Debug, Clone)]
pub(crate) struct BranchOp {
    pub kind: BranchKind,
    /// Address the branch transfers control to.
    pub target: u64,
    /// Currently selected encoding form.
    pub form: BranchForm,
}

/// Operand shape, dispatched on by the working-unit factory.
#[derive(Debug, Clone)]
pub(crate) enum InstrKind {
    Plain(InstrBytes),
    IpRelMem(IpRelMemOp),
    Branch(BranchOp),
}

/// A single instruction to be re-encoded at a new address.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub(crate) ip: u64,
    pub(crate) kind: InstrKind,
}

impl Instruction {
    /// A position-independent instruction, copied verbatim during emission.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is empty or longer than 15 bytes (the x86
    /// instruction length limit).
    #[must_use]
    pub fn plain(ip: u64, bytes: &[u8]) -> Self {
        assert!(
            !bytes.is_empty() && bytes.len() <= 15,
            "instruction length {} out of range 1..=15",
            bytes.len()
        );
        Self {
            ip,
            kind: InstrKind::Plain(InstrBytes::from_slice(bytes)),
        }
    }

    /// An instruction with one IP-relative memory operand.
    ///
    /// `opcode` holds every byte before ModR/M (legacy prefixes, REX, opcode);
    /// `reg` is the ModR/M reg field (0–7 — put extension bits in REX.R);
    /// `target` is the address the operand refers to. A trailing immediate
    /// can be attached with [`Instruction::with_immediate`].
    ///
    /// # Panics
    ///
    /// Panics if `opcode` is empty or longer than 10 bytes, or `reg > 7`.
    #[must_use]
    pub fn ip_rel_mem(ip: u64, opcode: &[u8], reg: u8, target: u64) -> Self {
        assert!(
            !opcode.is_empty() && opcode.len() <= 10,
            "opcode length {} out of range 1..=10",
            opcode.len()
        );
        assert!(reg <= 7, "ModR/M reg field {reg} out of range 0..=7");
        Self {
            ip,
            kind: InstrKind::IpRelMem(IpRelMemOp {
                opcode: InstrBytes::from_slice(opcode),
                reg,
                target,
                imm: InstrBytes::new(),
                form: AddrForm::RipRel,
            }),
        }
    }

    /// Attach trailing immediate bytes to an IP-relative memory instruction.
    ///
    /// # Panics
    ///
    /// Panics if the instruction has no IP-relative memory operand, or the
    /// immediate is longer than 8 bytes.
    #[must_use]
    pub fn with_immediate(mut self, imm: &[u8]) -> Self {
        assert!(imm.len() <= 8, "immediate length {} exceeds 8", imm.len());
        match &mut self.kind {
            InstrKind::IpRelMem(op) => op.imm = InstrBytes::from_slice(imm),
            _ => panic!("with_immediate requires an IP-relative memory instruction"),
        }
        self
    }

    /// An unconditional near `JMP` to `target`.
    #[must_use]
    pub fn jmp(ip: u64, target: u64) -> Self {
        Self {
            ip,
            kind: InstrKind::Branch(BranchOp {
                kind: BranchKind::Jmp,
                target,
                form: BranchForm::Near,
            }),
        }
    }

    /// A conditional near jump (`Jcc`) with the given condition code.
    ///
    /// Condition codes follow the x86 encoding: 0 = `JO`, 1 = `JNO`,
    /// 2 = `JB`, … 15 = `JG`.
    ///
    /// # Panics
    ///
    /// Panics if `cond > 15`.
    #[must_use]
    pub fn jcc(ip: u64, cond: u8, target: u64) -> Self {
        assert!(cond <= 15, "condition code {cond} out of range 0..=15");
        Self {
            ip,
            kind: InstrKind::Branch(BranchOp {
                kind: BranchKind::Jcc(cond),
                target,
                form: BranchForm::Near,
            }),
        }
    }

    /// A near `CALL` to `target`.
    #[must_use]
    pub fn call(ip: u64, target: u64) -> Self {
        Self {
            ip,
            kind: InstrKind::Branch(BranchOp {
                kind: BranchKind::Call,
                target,
                form: BranchForm::Near,
            }),
        }
    }

    /// The original address this instruction was decoded from.
    ///
    /// Zero means "unknown address": such instructions are accepted (any
    /// number of them) but cannot be referenced as branch or operand targets.
    #[must_use]
    pub fn ip(&self) -> u64 {
        self.ip
    }
}
