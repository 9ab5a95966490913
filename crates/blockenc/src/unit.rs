//! Working units: the per-instruction state driven through the layout phases.
//!
//! Each source instruction becomes one [`Unit`]. A unit owns its committed
//! size (monotonically non-increasing once initialized) and its addressing
//! decision; the orchestrator re-stamps addresses between phases and drives
//! the `initialize` / `optimize` / `emit` contract in strict order.
//!
//! Three variants exist:
//!
//! - [`PlainUnit`] — fixed size, copied verbatim.
//! - [`IpRelMemUnit`] — an IP-relative memory operand that picks the smallest
//!   legal addressing form (`Rip` → `Eip` → unencodable).
//! - [`BranchUnit`] — a near branch that shrinks from its pessimistic form
//!   toward `rel8` as the converging layout pulls the target into range, or
//!   is substituted with a jump through an 8-byte pointer slot when the
//!   target stays out of ±2 GiB reach.

use crate::encoder::{branch_len, probe_len, ConstantOffsets, EncodedInstr, Encoder};
use crate::error::EncodeError;
use crate::ir::{AddrForm, BranchForm, BranchKind, BranchOp, Instruction, InstrKind};
use crate::layout::{BlockData, LayoutCtx};
use crate::Bitness;

/// Resolved destination of a branch or memory reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    /// Another unit in the encoding set, by arena handle. Its address is
    /// still moving while the layout converges.
    Unit(usize),
    /// An address outside the encoding set, treated as externally fixed.
    Address(u64),
    /// Not yet resolved (before initialization).
    Unresolved(u64),
}

impl Target {
    fn raw(self) -> u64 {
        match self {
            Target::Unit(_) => unreachable!("raw address queried after resolution"),
            Target::Address(a) | Target::Unresolved(a) => a,
        }
    }
}

/// What a unit reports after final emission.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EmitInfo {
    /// Whether the emitted bytes still represent the semantically-original
    /// instruction (as opposed to a substituted encoding such as a
    /// pointer-slot thunk).
    pub is_original: bool,
    /// Positions of embedded displacement/immediate fields, when meaningful.
    pub offsets: ConstantOffsets,
}

// ─── Unit: tagged union over the variants ──────────────────

#[derive(Debug)]
pub(crate) enum Unit {
    Plain(PlainUnit),
    IpRelMem(IpRelMemUnit),
    Branch(BranchUnit),
}

impl Unit {
    /// Factory: dispatch on the source instruction's operand shape.
    ///
    /// Panics on an IP-relative memory shape outside 64-bit mode — that is a
    /// caller error, RIP-relative addressing does not exist there.
    pub fn from_instruction(instr: &Instruction, bitness: Bitness, fix_branches: bool) -> Self {
        match &instr.kind {
            InstrKind::Plain(bytes) => Unit::Plain(PlainUnit {
                instr: instr.clone(),
                orig_ip: instr.ip,
                size: bytes.len() as u32,
            }),
            InstrKind::IpRelMem(_) => {
                assert!(
                    bitness.is_64(),
                    "IP-relative memory operands require 64-bit mode"
                );
                Unit::IpRelMem(IpRelMemUnit::new(instr, bitness))
            }
            InstrKind::Branch(_) => Unit::Branch(BranchUnit::new(instr, bitness, fix_branches)),
        }
    }

    /// Original address of the source instruction (stable lookup key).
    pub fn orig_ip(&self) -> u64 {
        match self {
            Unit::Plain(u) => u.orig_ip,
            Unit::IpRelMem(u) => u.orig_ip,
            Unit::Branch(u) => u.orig_ip,
        }
    }

    /// Currently committed size in bytes.
    pub fn size(&self) -> u32 {
        match self {
            Unit::Plain(u) => u.size,
            Unit::IpRelMem(u) => u.size,
            Unit::Branch(u) => u.size,
        }
    }

    /// One-time initialization: resolve the target and commit the first real
    /// size estimate. Must never grow the unit.
    pub fn initialize(&mut self, ctx: &LayoutCtx<'_>, addr: u64, data: &mut BlockData) {
        match self {
            Unit::Plain(_) => {}
            Unit::IpRelMem(u) => {
                u.target = ctx.resolve(u.target.raw());
                u.evaluate(ctx, addr);
            }
            Unit::Branch(u) => {
                u.target = ctx.resolve(u.target.raw());
                u.try_shrink(ctx, addr, data);
            }
        }
    }

    /// One try-shrink step. Returns `true` only when the unit's size became
    /// strictly smaller this call.
    pub fn optimize(&mut self, ctx: &LayoutCtx<'_>, addr: u64, data: &mut BlockData) -> bool {
        match self {
            Unit::Plain(_) => false,
            Unit::IpRelMem(u) => u.evaluate(ctx, addr),
            Unit::Branch(u) => u.try_shrink(ctx, addr, data),
        }
    }

    /// Final emission through the real encoder.
    pub fn emit(
        &self,
        enc: &mut Encoder<'_>,
        addr: u64,
        ctx: &LayoutCtx<'_>,
        data: &mut BlockData,
    ) -> Result<EmitInfo, EncodeError> {
        match self {
            Unit::Plain(u) => {
                let encoded = enc.encode(&u.instr, addr);
                Ok(EmitInfo {
                    is_original: true,
                    offsets: encoded.offsets,
                })
            }
            Unit::IpRelMem(u) => u.emit(enc, addr, ctx),
            Unit::Branch(u) => u.emit(enc, addr, ctx, data),
        }
    }
}

// ─── PlainUnit ─────────────────────────────────────────────

/// Position-independent instruction: nothing to decide, nothing to shrink.
#[derive(Debug)]
pub(crate) struct PlainUnit {
    instr: Instruction,
    orig_ip: u64,
    size: u32,
}

// ─── IpRelMemUnit ──────────────────────────────────────────

/// Addressing decision of an [`IpRelMemUnit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IpRelState {
    /// Target not yet resolved.
    Uninitialized,
    /// Defensive fallback: emit with whatever form is already set on the
    /// instruction. Not produced by the normal decision flow.
    Unchanged,
    /// `[RIP + disp32]` — the short form.
    Rip,
    /// `[EIP + disp32]` — wide form, target must fit in an unsigned 32 bits.
    Eip,
    /// No legal form; emission always fails.
    Long,
}

/// One instruction whose memory operand is encoded relative to the
/// instruction pointer.
#[derive(Debug)]
pub(crate) struct IpRelMemUnit {
    instr: Instruction,
    orig_ip: u64,
    size: u32,
    rip_size: u32,
    eip_size: u32,
    state: IpRelState,
    target: Target,
}

impl IpRelMemUnit {
    fn new(instr: &Instruction, bitness: Bitness) -> Self {
        let raw_target = match &instr.kind {
            InstrKind::IpRelMem(op) => op.target,
            _ => unreachable!(),
        };
        // Probe both hypothetical forms through a discard sink; no bytes are
        // committed and the final target is not yet resolvable.
        let rip_size = probe_len(bitness, &with_form(instr, AddrForm::RipRel));
        let eip_size = probe_len(bitness, &with_form(instr, AddrForm::EipRel));
        assert!(
            eip_size >= rip_size,
            "internal: wide form ({eip_size}) shorter than IP-relative form ({rip_size})"
        );
        Self {
            instr: instr.clone(),
            orig_ip: instr.ip,
            // The wide form is the safe upper bound until the target resolves.
            size: eip_size,
            rip_size,
            eip_size,
            state: IpRelState::Uninitialized,
            target: Target::Unresolved(raw_target),
        }
    }

    /// First evaluation locks the addressing mode; later calls are no-ops.
    fn evaluate(&mut self, ctx: &LayoutCtx<'_>, addr: u64) -> bool {
        match self.state {
            IpRelState::Uninitialized => {
                let target_addr = ctx.target_address(self.target);
                // A target owned by a unit in this encoding set is assumed
                // reachable with a 32-bit displacement (heuristic, not a
                // proven bound); external targets get an exact distance check
                // against the candidate rip-form end address.
                let same_set = matches!(self.target, Target::Unit(_));
                let next = addr.wrapping_add(u64::from(self.rip_size));
                let disp = target_addr.wrapping_sub(next) as i64;
                if same_set || i32::try_from(disp).is_ok() {
                    self.state = IpRelState::Rip;
                    let shrank = self.rip_size < self.size;
                    self.size = self.rip_size;
                    shrank
                } else if target_addr <= u64::from(u32::MAX) {
                    self.state = IpRelState::Eip;
                    false
                } else {
                    self.state = IpRelState::Long;
                    false
                }
            }
            // Locked (or permanently unencodable): nothing further to do.
            _ => false,
        }
    }

    fn emit(
        &self,
        enc: &mut Encoder<'_>,
        addr: u64,
        ctx: &LayoutCtx<'_>,
    ) -> Result<EmitInfo, EncodeError> {
        let target_addr = ctx.target_address(self.target);
        let form = match self.state {
            IpRelState::Uninitialized => {
                unreachable!("internal: emit before initialization")
            }
            IpRelState::Long => {
                return Err(EncodeError::TargetTooFar {
                    ip: self.orig_ip,
                    target: target_addr,
                })
            }
            IpRelState::Rip => Some(AddrForm::RipRel),
            IpRelState::Eip => Some(AddrForm::EipRel),
            IpRelState::Unchanged => None,
        };
        let mut copy = match form {
            Some(f) => with_form(&self.instr, f),
            None => self.instr.clone(),
        };
        if let InstrKind::IpRelMem(op) = &mut copy.kind {
            op.target = target_addr;
        }
        let encoded = enc.encode(&copy, addr);
        check_round_trip(self.orig_ip, target_addr, &encoded)?;
        Ok(EmitInfo {
            is_original: true,
            offsets: encoded.offsets,
        })
    }
}

/// Copy of an IP-relative memory instruction with the given addressing form.
fn with_form(instr: &Instruction, form: AddrForm) -> Instruction {
    let mut copy = instr.clone();
    if let InstrKind::IpRelMem(op) = &mut copy.kind {
        op.form = form;
    }
    copy
}

/// The emitted bytes must expose exactly the resolved target at runtime.
fn check_round_trip(ip: u64, expected: u64, encoded: &EncodedInstr) -> Result<(), EncodeError> {
    match encoded.exposed_address {
        Some(actual) if actual == expected => Ok(()),
        Some(actual) => Err(EncodeError::AddressRoundTrip {
            ip,
            expected,
            actual,
        }),
        None => Ok(()),
    }
}

// ─── BranchUnit ────────────────────────────────────────────

/// Encoding currently committed for a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchEmitForm {
    Short,
    Near,
    /// Substituted: jump/call through an 8-byte pointer slot in the block
    /// data area (`FF 25` / `FF 15`, with an inverted-condition skip for Jcc).
    Thunk,
}

/// A near branch whose encoding shrinks as the layout converges.
#[derive(Debug)]
pub(crate) struct BranchUnit {
    orig_ip: u64,
    kind: BranchKind,
    size: u32,
    short_size: u32,
    near_size: u32,
    form: BranchEmitForm,
    target: Target,
    pointer_slot: Option<usize>,
    fix_branches: bool,
    bitness: Bitness,
    done: bool,
}

impl BranchUnit {
    fn new(instr: &Instruction, bitness: Bitness, fix_branches: bool) -> Self {
        let op = match &instr.kind {
            InstrKind::Branch(op) => op,
            _ => unreachable!(),
        };
        let has_short = !matches!(op.kind, BranchKind::Call);
        let short_size = if has_short {
            branch_len(bitness, op.kind, BranchForm::Short)
        } else {
            0
        };
        let near_size = branch_len(bitness, op.kind, BranchForm::Near);
        // Pessimistic upper bound: in 64-bit mode with fix-up enabled the
        // target may end up beyond ±2 GiB, requiring the pointer-slot thunk.
        let (size, form) = if fix_branches && bitness.is_64() {
            (thunk_size(op.kind), BranchEmitForm::Thunk)
        } else {
            (near_size, BranchEmitForm::Near)
        };
        Self {
            orig_ip: instr.ip,
            kind: op.kind,
            size,
            short_size,
            near_size,
            form,
            target: Target::Unresolved(op.target),
            pointer_slot: None,
            fix_branches,
            bitness,
            done: !fix_branches,
        }
    }

    fn try_shrink(&mut self, ctx: &LayoutCtx<'_>, addr: u64, data: &mut BlockData) -> bool {
        if self.done {
            return false;
        }
        let target_addr = ctx.target_address(self.target);

        // rel8: the smallest form; once it fits it keeps fitting, since all
        // sizes (and therefore all distances) only ever shrink.
        if self.short_size != 0 {
            let next = addr.wrapping_add(u64::from(self.short_size));
            let disp = target_addr.wrapping_sub(next) as i64;
            if i8::try_from(disp).is_ok() {
                assert!(self.short_size <= self.size, "internal: branch size grew");
                let shrank = self.short_size < self.size;
                self.size = self.short_size;
                self.form = BranchEmitForm::Short;
                self.done = true;
                return shrank;
            }
        }

        // rel32 (rel16 in 16-bit mode): outside 64-bit mode displacement
        // arithmetic wraps at the address width, so the near form always
        // reaches.
        let next = addr.wrapping_add(u64::from(self.near_size));
        let disp = target_addr.wrapping_sub(next) as i64;
        if !self.bitness.is_64() || i32::try_from(disp).is_ok() {
            assert!(self.near_size <= self.size, "internal: branch size grew");
            let shrank = self.near_size < self.size;
            self.size = self.near_size;
            self.form = BranchEmitForm::Near;
            return shrank;
        }

        // Out of reach: keep the thunk form and claim a pointer slot.
        if self.pointer_slot.is_none() {
            self.pointer_slot = Some(data.alloc_slot());
        }
        false
    }

    fn emit(
        &self,
        enc: &mut Encoder<'_>,
        addr: u64,
        ctx: &LayoutCtx<'_>,
        data: &mut BlockData,
    ) -> Result<EmitInfo, EncodeError> {
        let target_addr = ctx.target_address(self.target);
        match self.form {
            BranchEmitForm::Short => {
                let encoded = enc.encode(&self.branch_instr(BranchForm::Short, target_addr), addr);
                check_round_trip(self.orig_ip, target_addr, &encoded)?;
                Ok(EmitInfo {
                    is_original: true,
                    offsets: encoded.offsets,
                })
            }
            BranchEmitForm::Near => {
                if self.bitness.is_64() {
                    let next = addr.wrapping_add(u64::from(self.near_size));
                    let disp = target_addr.wrapping_sub(next) as i64;
                    if i32::try_from(disp).is_err() {
                        // Only reachable with fix-up disabled; with fix-up on,
                        // the layout phase would have substituted the thunk.
                        return Err(EncodeError::BranchOutOfRange {
                            ip: self.orig_ip,
                            target: target_addr,
                            disp,
                            max: i64::from(i32::MAX),
                        });
                    }
                }
                let encoded = enc.encode(&self.branch_instr(BranchForm::Near, target_addr), addr);
                check_round_trip(self.orig_ip, target_addr, &encoded)?;
                Ok(EmitInfo {
                    is_original: true,
                    offsets: encoded.offsets,
                })
            }
            BranchEmitForm::Thunk => {
                let slot = self
                    .pointer_slot
                    .expect("internal: thunk emission without a pointer slot");
                data.set_slot_target(slot, target_addr);
                let slot_addr = data.slot_address(slot);
                let mut thunk_addr = addr;
                if let BranchKind::Jcc(cond) = self.kind {
                    // Inverted condition skips the thunk when not taken.
                    let skip = Instruction {
                        ip: self.orig_ip,
                        kind: InstrKind::Branch(BranchOp {
                            kind: BranchKind::Jcc(cond ^ 1),
                            target: addr.wrapping_add(u64::from(self.size)),
                            form: BranchForm::Short,
                        }),
                    };
                    let encoded = enc.encode(&skip, addr);
                    check_round_trip(
                        self.orig_ip,
                        addr.wrapping_add(u64::from(self.size)),
                        &encoded,
                    )?;
                    thunk_addr = addr.wrapping_add(2);
                }
                let reg = match self.kind {
                    BranchKind::Call => 2, // FF /2: call [rip+disp32]
                    _ => 4,                // FF /4: jmp [rip+disp32]
                };
                let thunk = Instruction::ip_rel_mem(self.orig_ip, &[0xFF], reg, slot_addr);
                let encoded = enc.encode(&thunk, thunk_addr);
                check_round_trip(self.orig_ip, slot_addr, &encoded)?;
                Ok(EmitInfo {
                    is_original: false,
                    offsets: ConstantOffsets::default(),
                })
            }
        }
    }

    fn branch_instr(&self, form: BranchForm, target: u64) -> Instruction {
        Instruction {
            ip: self.orig_ip,
            kind: InstrKind::Branch(BranchOp {
                kind: self.kind,
                target,
                form,
            }),
        }
    }
}

/// Size of the pointer-slot substitute for a branch kind.
fn thunk_size(kind: BranchKind) -> u32 {
    match kind {
        // FF 25/15 + disp32
        BranchKind::Jmp | BranchKind::Call => 6,
        // inverted Jcc rel8 skip + FF 25 thunk
        BranchKind::Jcc(_) => 8,
    }
}
