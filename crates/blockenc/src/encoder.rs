//! Low-level encode primitives: byte sinks, the inline instruction buffer,
//! and the [`Encoder`] that turns one [`Instruction`] into machine-code bytes
//! at a given address.
//!
//! The encoder is deliberately mechanical: it truncates displacements to the
//! width of the selected form and reports the address the emitted bytes will
//! expose at runtime. Deciding *which* form is legal at the instruction's new
//! address — and verifying the exposed address round-trips to the intended
//! target — is the working units' job (see `unit.rs`).

#[allow(unused_imports)]
use alloc::vec;
use alloc::vec::Vec;

use crate::ir::{AddrForm, BranchForm, BranchKind, Instruction, InstrKind};
use crate::Bitness;

// ─── CodeWriter: append-only byte sink ─────────────────────

/// Append-only byte sink the final emission writes through.
///
/// Each block supplies its own sink; it is written exactly once, sequentially,
/// during the emit phase.
pub trait CodeWriter {
    /// Append a single byte.
    fn write_u8(&mut self, value: u8);

    /// Append a slice of bytes.
    fn write_slice(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write_u8(b);
        }
    }
}

impl CodeWriter for Vec<u8> {
    #[inline]
    fn write_u8(&mut self, value: u8) {
        self.push(value);
    }

    #[inline]
    fn write_slice(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// A sink that drops everything — used for construction-time probing of
/// hypothetical encodings with zero observable side effects, which is why
/// probing is safe to repeat out of final order.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardWriter;

impl CodeWriter for DiscardWriter {
    #[inline]
    fn write_u8(&mut self, _value: u8) {}
}

// ─── InstrBytes: stack-allocated instruction buffer ────────

/// Stack-allocated instruction byte buffer.
///
/// x86/x86-64 instructions are at most 15 bytes, so a 16-byte inline buffer
/// holds any instruction without touching the heap.
#[derive(Clone, Copy)]
pub struct InstrBytes {
    data: [u8; 16],
    len: u8,
}

impl InstrBytes {
    /// Create an empty buffer.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            data: [0; 16],
            len: 0,
        }
    }

    /// Create a buffer pre-filled from a byte slice.
    ///
    /// # Panics
    ///
    /// Panics if `src` is longer than 16 bytes.
    #[inline]
    #[must_use]
    pub fn from_slice(src: &[u8]) -> Self {
        let mut buf = Self::new();
        buf.extend_from_slice(src);
        buf
    }

    /// Append a single byte.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is already full.
    #[inline]
    pub fn push(&mut self, byte: u8) {
        assert!(
            (self.len as usize) < 16,
            "InstrBytes overflow: cannot push beyond 16 bytes"
        );
        self.data[self.len as usize] = byte;
        self.len += 1;
    }

    /// Append a slice of bytes.
    ///
    /// # Panics
    ///
    /// Panics if appending would exceed the 16-byte capacity.
    #[inline]
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        let start = self.len as usize;
        let end = start + bytes.len();
        assert!(
            end <= 16,
            "InstrBytes overflow: {} + {} exceeds 16-byte capacity",
            start,
            bytes.len()
        );
        self.data[start..end].copy_from_slice(bytes);
        self.len = end as u8;
    }

    /// Number of bytes in the buffer.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the buffer is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for InstrBytes {
    fn default() -> Self {
        Self::new()
    }
}

impl core::ops::Deref for InstrBytes {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl AsRef<[u8]> for InstrBytes {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl core::fmt::Debug for InstrBytes {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "InstrBytes(")?;
        for (i, b) in self.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{b:02X}")?;
        }
        write!(f, ")")
    }
}

impl PartialEq for InstrBytes {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

impl Eq for InstrBytes {}

impl PartialEq<[u8]> for InstrBytes {
    fn eq(&self, other: &[u8]) -> bool {
        **self == *other
    }
}

// ─── ConstantOffsets ───────────────────────────────────────

/// Byte positions of the displacement and immediate embedded in an emitted
/// instruction, relative to the instruction's first byte.
///
/// A size of zero means the field is absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConstantOffsets {
    /// Offset of the displacement field.
    pub displacement_offset: u8,
    /// Size of the displacement field in bytes (0 if none).
    pub displacement_size: u8,
    /// Offset of the immediate field.
    pub immediate_offset: u8,
    /// Size of the immediate field in bytes (0 if none).
    pub immediate_size: u8,
}

impl ConstantOffsets {
    /// Whether the emitted bytes contain a displacement field.
    #[must_use]
    pub fn has_displacement(&self) -> bool {
        self.displacement_size != 0
    }

    /// Whether the emitted bytes contain an immediate field.
    #[must_use]
    pub fn has_immediate(&self) -> bool {
        self.immediate_size != 0
    }
}

// ─── EncodedInstr ──────────────────────────────────────────

/// Result of encoding a single instruction at a specific address.
#[derive(Debug, Clone, Copy)]
pub struct EncodedInstr {
    /// Length of the emitted bytes.
    pub len: u32,
    /// Positions of embedded displacement/immediate fields.
    pub offsets: ConstantOffsets,
    /// The address the emitted bytes compute at runtime (branch target or
    /// memory-operand address), after any width truncation. `None` for
    /// position-independent instructions.
    pub exposed_address: Option<u64>,
}

// ─── Encoder ───────────────────────────────────────────────

/// Encodes one [`Instruction`] into bytes through a [`CodeWriter`].
///
/// Tracks the cumulative byte count so callers can verify that every unit
/// writes exactly its committed size.
pub struct Encoder<'a> {
    bitness: Bitness,
    out: &'a mut dyn CodeWriter,
    written: u64,
}

impl<'a> Encoder<'a> {
    /// Create an encoder writing through `out`.
    pub fn new(bitness: Bitness, out: &'a mut dyn CodeWriter) -> Self {
        Self {
            bitness,
            out,
            written: 0,
        }
    }

    /// Cumulative bytes written through this encoder.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    #[inline]
    fn put_u8(&mut self, b: u8) {
        self.out.write_u8(b);
        self.written += 1;
    }

    #[inline]
    fn put_slice(&mut self, bytes: &[u8]) {
        self.out.write_slice(bytes);
        self.written += bytes.len() as u64;
    }

    /// Encode `instr` as if placed at address `ip`, honoring the addressing
    /// and branch forms currently set on the instruction.
    ///
    /// Displacements are truncated to the selected form's width; the computed
    /// runtime address is reported in [`EncodedInstr::exposed_address`] so the
    /// caller can verify the round-trip.
    pub fn encode(&mut self, instr: &Instruction, ip: u64) -> EncodedInstr {
        match &instr.kind {
            InstrKind::Plain(bytes) => {
                self.put_slice(bytes);
                EncodedInstr {
                    len: bytes.len() as u32,
                    offsets: ConstantOffsets::default(),
                    exposed_address: None,
                }
            }
            InstrKind::IpRelMem(op) => {
                assert!(
                    self.bitness.is_64(),
                    "internal: IP-relative memory encode outside 64-bit mode"
                );
                let prefix = match op.form {
                    AddrForm::RipRel => 0u32,
                    AddrForm::EipRel => 1u32,
                };
                let len = prefix + op.opcode.len() as u32 + 1 + 4 + op.imm.len() as u32;
                let next = ip.wrapping_add(u64::from(len));
                let (disp, exposed) = match op.form {
                    AddrForm::RipRel => {
                        let disp = op.target.wrapping_sub(next) as u32;
                        let exposed = next.wrapping_add(disp as i32 as i64 as u64);
                        (disp, exposed)
                    }
                    AddrForm::EipRel => {
                        let disp = (op.target as u32).wrapping_sub(next as u32);
                        let exposed = u64::from((next as u32).wrapping_add(disp));
                        (disp, exposed)
                    }
                };
                if op.form == AddrForm::EipRel {
                    self.put_u8(0x67);
                }
                self.put_slice(&op.opcode);
                self.put_u8((op.reg << 3) | 0b101);
                self.put_slice(&disp.to_le_bytes());
                self.put_slice(&op.imm);
                let disp_offset = (prefix + op.opcode.len() as u32 + 1) as u8;
                EncodedInstr {
                    len,
                    offsets: ConstantOffsets {
                        displacement_offset: disp_offset,
                        displacement_size: 4,
                        immediate_offset: if op.imm.is_empty() {
                            0
                        } else {
                            disp_offset + 4
                        },
                        immediate_size: op.imm.len() as u8,
                    },
                    exposed_address: Some(exposed),
                }
            }
            InstrKind::Branch(op) => self.encode_branch(op, ip),
        }
    }

    fn encode_branch(&mut self, op: &crate::ir::BranchOp, ip: u64) -> EncodedInstr {
        let len = branch_len(self.bitness, op.kind, op.form);
        let next = ip.wrapping_add(u64::from(len));
        match op.form {
            BranchForm::Short => {
                let opcode = match op.kind {
                    BranchKind::Jmp => 0xEB,
                    BranchKind::Jcc(cond) => 0x70 + cond,
                    BranchKind::Call => unreachable!("CALL has no short form"),
                };
                let disp = op.target.wrapping_sub(next) as u8;
                self.put_u8(opcode);
                self.put_u8(disp);
                EncodedInstr {
                    len,
                    offsets: ConstantOffsets {
                        displacement_offset: 1,
                        displacement_size: 1,
                        ..ConstantOffsets::default()
                    },
                    exposed_address: Some(self.wrap_branch(next, disp as i8 as i64)),
                }
            }
            BranchForm::Near => {
                let disp_offset = match op.kind {
                    BranchKind::Jmp => {
                        self.put_u8(0xE9);
                        1
                    }
                    BranchKind::Jcc(cond) => {
                        self.put_u8(0x0F);
                        self.put_u8(0x80 + cond);
                        2
                    }
                    BranchKind::Call => {
                        self.put_u8(0xE8);
                        1
                    }
                };
                let (disp_size, exposed) = if self.bitness == Bitness::Bits16 {
                    let disp = op.target.wrapping_sub(next) as u16;
                    self.put_slice(&disp.to_le_bytes());
                    (2, self.wrap_branch(next, disp as i16 as i64))
                } else {
                    let disp = op.target.wrapping_sub(next) as u32;
                    self.put_slice(&disp.to_le_bytes());
                    (4, self.wrap_branch(next, disp as i32 as i64))
                };
                EncodedInstr {
                    len,
                    offsets: ConstantOffsets {
                        displacement_offset: disp_offset,
                        displacement_size: disp_size,
                        ..ConstantOffsets::default()
                    },
                    exposed_address: Some(exposed),
                }
            }
        }
    }

    /// Branch target arithmetic wraps at the addressing width.
    fn wrap_branch(&self, next: u64, disp: i64) -> u64 {
        match self.bitness {
            Bitness::Bits16 => u64::from((next as u16).wrapping_add(disp as u16)),
            Bitness::Bits32 => u64::from((next as u32).wrapping_add(disp as u32)),
            Bitness::Bits64 => next.wrapping_add(disp as u64),
        }
    }
}

/// Byte length of a branch in the given form, without encoding it.
pub(crate) fn branch_len(bitness: Bitness, kind: BranchKind, form: BranchForm) -> u32 {
    let disp = match (bitness, form) {
        (_, BranchForm::Short) => 1,
        (Bitness::Bits16, BranchForm::Near) => 2,
        (_, BranchForm::Near) => 4,
    };
    let opcode = match (kind, form) {
        (BranchKind::Jcc(_), BranchForm::Near) => 2,
        _ => 1,
    };
    opcode + disp
}

/// Measure the encoded length of `instr` using a discard sink.
pub(crate) fn probe_len(bitness: Bitness, instr: &Instruction) -> u32 {
    let mut sink = DiscardWriter;
    let mut enc = Encoder::new(bitness, &mut sink);
    let encoded = enc.encode(instr, 0);
    debug_assert_eq!(u64::from(encoded.len), enc.bytes_written());
    encoded.len
}
