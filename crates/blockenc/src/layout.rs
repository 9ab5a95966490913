//! Block layout and final emission.
//!
//! The [`BlockEncoder`] owns the whole encode operation end-to-end, in five
//! strict phases (none revisited once passed):
//!
//! 1. **Build** — convert every source instruction into a working unit with
//!    a pessimistic size, sort blocks by base address, index units by their
//!    original address.
//! 2. **Initialize** — each unit resolves its target once and commits its
//!    first real size estimate.
//! 3. **Converge** — fixed-point iteration: re-stamp addresses, let every
//!    unit try to shrink, repeat until a full pass changes nothing (bounded
//!    by a safety cap). Sizes shrink monotonically, which guarantees that
//!    a displacement that once fit keeps fitting.
//! 4. **Data-finalize** — each block lays out its trailing pointer-slot area.
//! 5. **Emit** — write the final bytes through the caller's sinks, collect
//!    per-instruction offsets and relocation records.

use alloc::collections::BTreeMap;
#[allow(unused_imports)]
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;

use crate::encoder::{CodeWriter, ConstantOffsets, Encoder};
use crate::error::EncodeError;
use crate::unit::{Target, Unit};
use crate::{Bitness, Instruction};

/// Safety cap on convergence passes. Hitting it is not an error: the layout
/// proceeds with whatever sizes are currently stable.
const MAX_CONVERGE_PASSES: usize = 1000;

// ─── Relocations ───────────────────────────────────────────

/// How a collected relocation is to be patched after linking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RelocKind {
    /// A 64-bit absolute address stored little-endian at `address`.
    Offset64,
}

/// A location in the emitted output requiring post-link fix-up.
///
/// Produced for every pointer slot written to a block's trailing data area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RelocationEntry {
    /// How to patch the location.
    pub kind: RelocKind,
    /// Absolute address of the location.
    pub address: u64,
}

// ─── Options ───────────────────────────────────────────────

/// Options controlling the encode operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEncoderOptions {
    /// Rewrite branch encodings for their new addresses (shrink to `rel8`,
    /// substitute pointer-slot thunks for unreachable targets). When
    /// disabled, branches keep their near form and emission fails if the
    /// displacement no longer fits.
    pub fix_branches: bool,
}

impl Default for BlockEncoderOptions {
    fn default() -> Self {
        Self { fix_branches: true }
    }
}

// ─── InstrBlock: caller-supplied region ────────────────────

/// One caller-supplied contiguous instruction sequence to re-encode at a new
/// base address, with its byte sink and optional per-instruction outputs.
pub struct InstrBlock<'a> {
    pub(crate) writer: &'a mut dyn CodeWriter,
    pub(crate) instructions: &'a [Instruction],
    pub(crate) rip: u64,
    pub(crate) relocations: Option<&'a mut Vec<RelocationEntry>>,
    pub(crate) new_offsets: Option<&'a mut [Option<u64>]>,
    pub(crate) constant_offsets: Option<&'a mut [ConstantOffsets]>,
}

impl<'a> InstrBlock<'a> {
    /// A block of `instructions` to be re-encoded at base address `rip`,
    /// emitting through `writer`.
    pub fn new(
        writer: &'a mut dyn CodeWriter,
        instructions: &'a [Instruction],
        rip: u64,
    ) -> Self {
        Self {
            writer,
            instructions,
            rip,
            relocations: None,
            new_offsets: None,
            constant_offsets: None,
        }
    }

    /// Collect relocation records for the block's pointer-slot data area.
    #[must_use]
    pub fn with_relocations(mut self, out: &'a mut Vec<RelocationEntry>) -> Self {
        self.relocations = Some(out);
        self
    }

    /// Record, per instruction, the byte offset from the block base at which
    /// it landed — `None` when the instruction was substituted.
    ///
    /// # Panics
    ///
    /// Panics if `out.len()` differs from the instruction count.
    #[must_use]
    pub fn with_new_offsets(mut self, out: &'a mut [Option<u64>]) -> Self {
        assert_eq!(
            out.len(),
            self.instructions.len(),
            "new-offset output length {} does not match instruction count {}",
            out.len(),
            self.instructions.len()
        );
        self.new_offsets = Some(out);
        self
    }

    /// Record, per instruction, the positions of embedded displacement and
    /// immediate fields within its emitted bytes.
    ///
    /// # Panics
    ///
    /// Panics if `out.len()` differs from the instruction count.
    #[must_use]
    pub fn with_constant_offsets(mut self, out: &'a mut [ConstantOffsets]) -> Self {
        assert_eq!(
            out.len(),
            self.instructions.len(),
            "constant-offset output length {} does not match instruction count {}",
            out.len(),
            self.instructions.len()
        );
        self.constant_offsets = Some(out);
        self
    }
}

// ─── BlockData: trailing pointer-slot area ─────────────────

/// A block's trailing constant-data area: 8-byte pointer slots for branch
/// targets that no direct encoding can reach.
#[derive(Debug, Default)]
pub(crate) struct BlockData {
    slots: Vec<u64>,
    base: u64,
    fill: u32,
    finalized: bool,
}

impl BlockData {
    /// Claim a pointer slot; its target is set during emission.
    pub fn alloc_slot(&mut self) -> usize {
        assert!(!self.finalized, "internal: slot allocated after finalize");
        self.slots.push(0);
        self.slots.len() - 1
    }

    pub fn set_slot_target(&mut self, slot: usize, target: u64) {
        self.slots[slot] = target;
    }

    /// Absolute address of a slot. Valid only after [`BlockData::finalize`].
    pub fn slot_address(&self, slot: usize) -> u64 {
        assert!(self.finalized, "internal: slot address before finalize");
        self.base + 8 * slot as u64
    }

    /// Lay the area out after the block's code end address is final.
    fn finalize(&mut self, code_end: u64) {
        if self.slots.is_empty() {
            self.base = code_end;
            self.fill = 0;
        } else {
            self.base = code_end.div_ceil(8) * 8;
            self.fill = (self.base - code_end) as u32;
        }
        self.finalized = true;
    }

    /// Write alignment fill and slot values, collecting one relocation per
    /// slot. INT3 padding keeps the gap harmless if it is ever executed.
    fn write(&self, out: &mut dyn CodeWriter, mut relocs: Option<&mut Vec<RelocationEntry>>) {
        for _ in 0..self.fill {
            out.write_u8(0xCC);
        }
        for (i, &target) in self.slots.iter().enumerate() {
            if let Some(list) = relocs.as_deref_mut() {
                list.push(RelocationEntry {
                    kind: RelocKind::Offset64,
                    address: self.slot_address(i),
                });
            }
            out.write_slice(&target.to_le_bytes());
        }
    }
}

// ─── Target resolution ─────────────────────────────────────

/// Read-only view units use to resolve targets and query current addresses.
pub(crate) struct LayoutCtx<'a> {
    addrs: &'a [u64],
    index: &'a BTreeMap<u64, usize>,
}

impl LayoutCtx<'_> {
    /// Resolve a raw address: the owning unit when it exists in this
    /// encoding set, otherwise an externally fixed address.
    pub fn resolve(&self, address: u64) -> Target {
        match self.index.get(&address) {
            Some(&handle) => Target::Unit(handle),
            None => Target::Address(address),
        }
    }

    /// Current address of a target: the owning unit's address as stamped
    /// this pass, or the fixed external address.
    pub fn target_address(&self, target: Target) -> u64 {
        match target {
            Target::Unit(handle) => self.addrs[handle],
            Target::Address(a) | Target::Unresolved(a) => a,
        }
    }
}

// ─── BlockEncoder ──────────────────────────────────────────

/// Internal per-block working state.
struct Block {
    /// Index into the caller's block slice (outputs map back by this).
    caller: usize,
    rip: u64,
    units: Range<usize>,
    data: BlockData,
}

/// Re-encodes blocks of instructions at new base addresses.
pub struct BlockEncoder {
    bitness: Bitness,
    units: Vec<Unit>,
    addrs: Vec<u64>,
    index: BTreeMap<u64, usize>,
    blocks: Vec<Block>,
}

impl BlockEncoder {
    /// Re-encode all `blocks` for their new base addresses.
    ///
    /// On success the caller's output slices and relocation lists are
    /// populated. On error nothing useful was produced: bytes already
    /// written to the sinks must be discarded.
    ///
    /// # Panics
    ///
    /// Panics on malformed input, before any encoding work: duplicate
    /// non-zero original addresses across all blocks, or an IP-relative
    /// memory instruction outside 64-bit mode.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] when an instruction cannot be legally
    /// re-encoded at its new address.
    pub fn encode(
        bitness: Bitness,
        blocks: &mut [InstrBlock<'_>],
        options: BlockEncoderOptions,
    ) -> Result<(), EncodeError> {
        let mut this = Self::build(bitness, blocks, options);
        this.initialize();
        this.converge();
        this.finalize_data();
        this.emit(blocks)
    }

    // ── build ──────────────────────────────────────────────

    fn build(
        bitness: Bitness,
        caller_blocks: &[InstrBlock<'_>],
        options: BlockEncoderOptions,
    ) -> Self {
        let mut units = Vec::new();
        let mut blocks = Vec::with_capacity(caller_blocks.len());
        for (caller, cb) in caller_blocks.iter().enumerate() {
            let start = units.len();
            for instr in cb.instructions {
                units.push(Unit::from_instruction(instr, bitness, options.fix_branches));
            }
            blocks.push(Block {
                caller,
                rip: cb.rip,
                units: start..units.len(),
                data: BlockData::default(),
            });
        }

        // Low-to-high processing order; required only for deterministic
        // iteration, not correctness.
        blocks.sort_by_key(|b| b.rip);

        // Original address → unit handle. Address zero means "unknown":
        // any number of those is fine, they are simply not indexed.
        let mut index = BTreeMap::new();
        for (handle, unit) in units.iter().enumerate() {
            let ip = unit.orig_ip();
            if ip == 0 {
                continue;
            }
            if index.insert(ip, handle).is_some() {
                panic!("duplicate non-zero original address 0x{ip:X}");
            }
        }

        let addrs = vec![0; units.len()];
        Self {
            bitness,
            units,
            addrs,
            index,
            blocks,
        }
    }

    /// Stamp every unit's current address sequentially from its block base.
    fn stamp_addresses(&mut self) {
        for block in &self.blocks {
            let mut addr = block.rip;
            for i in block.units.clone() {
                self.addrs[i] = addr;
                addr = addr.wrapping_add(u64::from(self.units[i].size()));
            }
        }
    }

    // ── initialize ─────────────────────────────────────────

    fn initialize(&mut self) {
        self.stamp_addresses();
        let ctx = LayoutCtx {
            addrs: &self.addrs,
            index: &self.index,
        };
        for block in &mut self.blocks {
            for i in block.units.clone() {
                let before = self.units[i].size();
                self.units[i].initialize(&ctx, self.addrs[i], &mut block.data);
                assert!(
                    self.units[i].size() <= before,
                    "internal: unit at 0x{:X} grew during initialization",
                    self.units[i].orig_ip()
                );
            }
        }
    }

    // ── converge ───────────────────────────────────────────

    fn converge(&mut self) {
        for _pass in 0..MAX_CONVERGE_PASSES {
            self.stamp_addresses();
            let ctx = LayoutCtx {
                addrs: &self.addrs,
                index: &self.index,
            };
            let mut changed = false;
            for block in &mut self.blocks {
                for i in block.units.clone() {
                    let before = self.units[i].size();
                    let shrank = self.units[i].optimize(&ctx, self.addrs[i], &mut block.data);
                    let after = self.units[i].size();
                    assert!(
                        after <= before,
                        "internal: unit at 0x{:X} grew during convergence",
                        self.units[i].orig_ip()
                    );
                    if shrank {
                        assert!(
                            after < before,
                            "internal: unit at 0x{:X} reported a shrink without shrinking",
                            self.units[i].orig_ip()
                        );
                        changed = true;
                    }
                }
            }
            if !changed {
                return;
            }
        }
        // Cap reached without a fixed point: continue with current sizes.
    }

    // ── data-finalize ──────────────────────────────────────

    fn finalize_data(&mut self) {
        self.stamp_addresses();
        for block in &mut self.blocks {
            let code_end = match block.units.clone().last() {
                Some(last) => self.addrs[last].wrapping_add(u64::from(self.units[last].size())),
                None => block.rip,
            };
            block.data.finalize(code_end);
        }
    }

    // ── emit ───────────────────────────────────────────────

    fn emit(&mut self, caller_blocks: &mut [InstrBlock<'_>]) -> Result<(), EncodeError> {
        self.stamp_addresses();
        let ctx = LayoutCtx {
            addrs: &self.addrs,
            index: &self.index,
        };
        for block in &mut self.blocks {
            let cb = &mut caller_blocks[block.caller];
            let mut enc = Encoder::new(self.bitness, &mut *cb.writer);
            for (pos, i) in block.units.clone().enumerate() {
                let before = enc.bytes_written();
                let info = self.units[i].emit(&mut enc, self.addrs[i], &ctx, &mut block.data)?;
                let written = enc.bytes_written() - before;
                assert!(
                    written == u64::from(self.units[i].size()),
                    "internal: unit at 0x{:X} emitted {} bytes, committed {}",
                    self.units[i].orig_ip(),
                    written,
                    self.units[i].size()
                );
                if let Some(out) = cb.new_offsets.as_deref_mut() {
                    out[pos] = if info.is_original {
                        Some(self.addrs[i] - block.rip)
                    } else {
                        None
                    };
                }
                if let Some(out) = cb.constant_offsets.as_deref_mut() {
                    out[pos] = info.offsets;
                }
            }
            drop(enc);
            block.data.write(&mut *cb.writer, cb.relocations.as_deref_mut());
        }
        Ok(())
    }
}
