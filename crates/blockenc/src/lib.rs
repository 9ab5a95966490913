//! # blockenc — x86/x86-64 Block Re-Encoder
//!
//! `blockenc` re-encodes blocks of machine instructions at new memory
//! addresses, rewriting every branch displacement and IP-relative memory
//! operand so the moved code still references its original targets.
//!
//! ## Quick Start
//!
//! ```rust
//! use blockenc::{Bitness, BlockEncoder, BlockEncoderOptions, InstrBlock, Instruction};
//!
//! // mov rax, [rip+disp32] decoded at 0x1000, referencing 0x2000.
//! let instructions = [Instruction::ip_rel_mem(0x1000, &[0x48, 0x8B], 0, 0x2000)];
//!
//! // Re-encode the block at its new base address 0x8000.
//! let mut out = Vec::new();
//! let mut blocks = [InstrBlock::new(&mut out, &instructions, 0x8000)];
//! BlockEncoder::encode(Bitness::Bits64, &mut blocks, BlockEncoderOptions::default())?;
//!
//! // disp32 = 0x2000 - (0x8000 + 7) = -0x6007; still reaches 0x2000.
//! assert_eq!(out, [0x48, 0x8B, 0x05, 0xF9, 0x9F, 0xFF, 0xFF]);
//! # Ok::<(), blockenc::EncodeError>(())
//! ```
//!
//! ## Features
//!
//! - **Branch fix-up** — near branches shrink to `rel8` where the converged
//!   layout allows, and targets beyond ±2 GiB are reached through an 8-byte
//!   pointer slot appended after the block.
//! - **IP-relative operands** — `[RIP+disp32]` references are re-aimed, with
//!   automatic fallback to the 0x67-prefixed `[EIP+disp32]` form for low
//!   targets that fall out of signed 32-bit reach.
//! - **Deterministic layout** — a monotone fixed-point iteration over
//!   instruction sizes; identical inputs produce identical bytes.
//! - **`no_std` + `alloc`** — usable in loaders, hypervisors, WASM.

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]
// ── Pedantic lint policy ─────────────────────────────────────────────────
// An instruction encoder intentionally performs many narrowing and
// sign-changing casts between integer widths (u64→u32, u32→i64, disp
// truncation) and uses dense hex literals without separators (0xFF25).
// The lints below are expected and acceptable in this context.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_lossless,
    clippy::cast_possible_wrap,
    clippy::unreadable_literal,
    clippy::match_same_arms,
    clippy::bool_to_int_with_if,
    clippy::semicolon_if_nothing_returned,
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args,
    clippy::doc_markdown,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::single_match_else,
    clippy::manual_let_else,
    clippy::return_self_not_must_use,
    clippy::missing_errors_doc
)]

extern crate alloc;

/// Low-level encode primitives: byte sinks, instruction buffer, encoder.
pub mod encoder;
/// Error types for re-encoding failures.
pub mod error;
/// Instruction representation consumed by the block encoder.
pub mod ir;
/// Block layout: the convergence loop, pointer-slot data areas, emission.
pub mod layout;
pub(crate) mod unit;

// Re-exports
pub use encoder::{CodeWriter, ConstantOffsets, DiscardWriter, EncodedInstr, Encoder, InstrBytes};
pub use error::EncodeError;
pub use ir::{Bitness, Instruction};
pub use layout::{BlockEncoder, BlockEncoderOptions, InstrBlock, RelocKind, RelocationEntry};

use alloc::vec::Vec;

/// Re-encode one block of instructions at `new_base` into a fresh byte
/// vector, with default options.
///
/// Convenience wrapper over [`BlockEncoder::encode`] for the common
/// single-block case; use the full API to collect relocations, new offsets
/// or constant offsets, or to encode several blocks in one operation.
///
/// # Errors
///
/// Returns [`EncodeError`] if any instruction cannot be legally re-encoded
/// at its new address.
///
/// # Examples
///
/// ```rust
/// use blockenc::{reencode, Bitness, Instruction};
///
/// let instructions = [
///     Instruction::plain(0x1000, &[0x90]),
///     Instruction::jmp(0x1001, 0x1000),
/// ];
/// let code = reencode(Bitness::Bits64, &instructions, 0x8000)?;
/// // nop, then jmp rel8 back to it.
/// assert_eq!(code, [0x90, 0xEB, 0xFD]);
/// # Ok::<(), blockenc::EncodeError>(())
/// ```
pub fn reencode(
    bitness: Bitness,
    instructions: &[Instruction],
    new_base: u64,
) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    let mut blocks = [InstrBlock::new(&mut out, instructions, new_base)];
    BlockEncoder::encode(bitness, &mut blocks, BlockEncoderOptions::default())?;
    Ok(out)
}
