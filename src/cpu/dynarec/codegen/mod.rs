//! Code generation backends for the recompiler
//!
//! The block compiler and register allocator write host-neutral operations
//! into an [`Emitter`]. A [`Backend`] then turns the finished op list into
//! something callable:
//! - Interpreter over the op list (default, always available)
//! - dynasm-rs (native x86_64, feature-gated)

use crate::cpu::CpuState;
use crate::memory::Bus;
use thiserror::Error;

pub mod interp;

#[cfg(all(feature = "jit-dynasm", target_arch = "x86_64"))]
pub mod dynasm;

/// Number of host registers the allocator may hand out
pub const ALLOCATEABLE_REG_COUNT: usize = 6;

/// Upper bound on ops in one block; 30 guest instructions never get close
pub const MAX_BLOCK_OPS: usize = 1024;

/// Host register slot (0..ALLOCATEABLE_REG_COUNT)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HostReg(pub u8);

impl HostReg {
    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Slot reserved for the guest state base pointer
pub const CONTEXT_POINTER: HostReg = HostReg(5);

/// Source operand: a host register or an immediate folded in at compile time
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Reg(HostReg),
    Imm(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Nor,
    Slt,
    Sltu,
    Sll,
    Srl,
    Sra,
}

impl AluOp {
    /// Evaluate with guest semantics (shift amounts use the low 5 bits)
    #[inline(always)]
    pub fn eval(self, a: u32, b: u32) -> u32 {
        match self {
            AluOp::Add => a.wrapping_add(b),
            AluOp::Sub => a.wrapping_sub(b),
            AluOp::And => a & b,
            AluOp::Or => a | b,
            AluOp::Xor => a ^ b,
            AluOp::Nor => !(a | b),
            AluOp::Slt => ((a as i32) < (b as i32)) as u32,
            AluOp::Sltu => (a < b) as u32,
            AluOp::Sll => a << (b & 0x1F),
            AluOp::Srl => a >> (b & 0x1F),
            AluOp::Sra => ((a as i32) >> (b & 0x1F)) as u32,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadKind {
    Byte,
    ByteUnsigned,
    Half,
    HalfUnsigned,
    Word,
}

impl LoadKind {
    /// Perform the access and extend the result to 32 bits
    #[inline(always)]
    pub fn load<B: Bus + ?Sized>(self, bus: &mut B, addr: u32) -> u32 {
        match self {
            LoadKind::Byte => bus.read8(addr) as i8 as i32 as u32,
            LoadKind::ByteUnsigned => bus.read8(addr) as u32,
            LoadKind::Half => bus.read16(addr) as i16 as i32 as u32,
            LoadKind::HalfUnsigned => bus.read16(addr) as u32,
            LoadKind::Word => bus.read32(addr),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreWidth {
    Byte,
    Half,
    Word,
}

impl StoreWidth {
    #[inline(always)]
    pub fn store<B: Bus + ?Sized>(self, bus: &mut B, addr: u32, value: u32) {
        match self {
            StoreWidth::Byte => bus.write8(addr, value as u8),
            StoreWidth::Half => bus.write16(addr, value as u16),
            StoreWidth::Word => bus.write32(addr, value),
        }
    }
}

/// Signed comparison used by conditional branches
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cond {
    #[inline(always)]
    pub fn eval(self, a: u32, b: u32) -> bool {
        let (sa, sb) = (a as i32, b as i32);
        match self {
            Cond::Eq => a == b,
            Cond::Ne => a != b,
            Cond::Lt => sa < sb,
            Cond::Le => sa <= sb,
            Cond::Gt => sa > sb,
            Cond::Ge => sa >= sb,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MulDivOp {
    Mult,
    Multu,
    Div,
    Divu,
}

impl MulDivOp {
    /// Compute (hi, lo), including the R3000A results for division by zero
    /// and for i32::MIN / -1
    pub fn eval(self, a: u32, b: u32) -> (u32, u32) {
        match self {
            MulDivOp::Mult => {
                let r = (a as i32 as i64).wrapping_mul(b as i32 as i64) as u64;
                ((r >> 32) as u32, r as u32)
            }
            MulDivOp::Multu => {
                let r = (a as u64) * (b as u64);
                ((r >> 32) as u32, r as u32)
            }
            MulDivOp::Div => {
                let (n, d) = (a as i32, b as i32);
                if d == 0 {
                    (a, if n >= 0 { 0xFFFF_FFFF } else { 1 })
                } else if n == i32::MIN && d == -1 {
                    (0, i32::MIN as u32)
                } else {
                    ((n % d) as u32, (n / d) as u32)
                }
            }
            MulDivOp::Divu => {
                if b == 0 {
                    (a, 0xFFFF_FFFF)
                } else {
                    (a % b, a / b)
                }
            }
        }
    }

    pub(crate) fn from_u32(raw: u32) -> MulDivOp {
        match raw {
            0 => MulDivOp::Mult,
            1 => MulDivOp::Multu,
            2 => MulDivOp::Div,
            _ => MulDivOp::Divu,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HiLo {
    Hi,
    Lo,
}

/// Host-neutral operation recorded by the compiler
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostOp {
    /// dst = gpr[reg]
    LoadGuest { dst: HostReg, reg: u8 },
    /// gpr[reg] = src
    StoreGuest { src: HostReg, reg: u8 },
    /// gpr[reg] = value
    StoreGuestImm { reg: u8, value: u32 },
    MovImm { dst: HostReg, value: u32 },
    Alu { op: AluOp, dst: HostReg, lhs: Operand, rhs: Operand },
    /// delayed_load_value[slot] = mem[base + offset]
    LoadMem { kind: LoadKind, base: Operand, offset: i16, slot: u8 },
    StoreMem { width: StoreWidth, base: Operand, offset: i16, src: Operand },
    /// dst = delayed_load_value[slot]
    CommitDelayedLoad { dst: HostReg, slot: u8 },
    /// Hand a load still in flight to whoever runs the next instruction
    DeferDelayedLoad { reg: u8, slot: u8 },
    LoadHiLo { dst: HostReg, which: HiLo },
    StoreHiLo { src: Operand, which: HiLo },
    MulDiv { op: MulDivOp, lhs: Operand, rhs: Operand },
    SetPc(Operand),
    /// pc = if cond(lhs, rhs) { taken } else { not_taken }
    BranchPc { cond: Cond, lhs: Operand, rhs: Operand, taken: u32, not_taken: u32 },
    /// Return to the dispatcher
    Exit { cycles: u32, fallback: bool },
}

/// Op buffer shared by the block compiler and the register allocator
#[derive(Default)]
pub struct Emitter {
    ops: Vec<HostOp>,
}

impl Emitter {
    pub fn new() -> Self {
        Emitter { ops: Vec::with_capacity(256) }
    }

    #[inline(always)]
    pub fn push(&mut self, op: HostOp) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[HostOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }
}

/// Value returned by a compiled block
///
/// Bits 0..30 hold the number of guest instructions retired, bit 31 asks the
/// dispatcher to single-step the interpreter before the next lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockOutcome(pub u32);

impl BlockOutcome {
    pub const FALLBACK: u32 = 1 << 31;

    #[inline(always)]
    pub fn new(cycles: u32, fallback: bool) -> Self {
        let bit = if fallback { Self::FALLBACK } else { 0 };
        BlockOutcome((cycles & !Self::FALLBACK) | bit)
    }

    #[inline(always)]
    pub fn cycles(self) -> u32 {
        self.0 & !Self::FALLBACK
    }

    #[inline(always)]
    pub fn needs_fallback(self) -> bool {
        self.0 & Self::FALLBACK != 0
    }
}

/// Backend-specific executable form of a block
pub enum BlockCode {
    Interp(Box<[HostOp]>),
    #[cfg(all(feature = "jit-dynasm", target_arch = "x86_64"))]
    Native(dynasm::NativeBlock),
}

/// A compiled block and the guest range it was built from
pub struct CompiledBlock {
    /// Guest address of the first instruction
    pub start: u32,
    /// Number of guest instruction words covered
    pub len: u32,
    pub code: BlockCode,
}

impl CompiledBlock {
    /// Run the block against the guest state
    #[inline(always)]
    pub fn invoke<B: Bus>(&self, cpu: &mut CpuState, bus: &mut B) -> BlockOutcome {
        match &self.code {
            BlockCode::Interp(ops) => interp::run(ops, cpu, bus),
            #[cfg(all(feature = "jit-dynasm", target_arch = "x86_64"))]
            BlockCode::Native(block) => block.execute(cpu, bus),
        }
    }
}

/// Error during code generation
#[derive(Debug, Error)]
pub enum CodegenError {
    /// Block too complex to compile
    #[error("Block too complex to compile")]
    TooComplex,
    /// Backend-specific error
    #[error("Backend error: {0}")]
    BackendError(String),
}

/// Turns op lists into executable blocks
pub trait Backend {
    fn name(&self) -> &'static str;

    /// Can this backend produce code right now?
    fn is_ready(&self) -> bool;

    fn assemble(&mut self, ops: &[HostOp]) -> Result<BlockCode, CodegenError>;
}

/// Shape checks every backend applies before lowering
pub(crate) fn validate(ops: &[HostOp]) -> Result<(), CodegenError> {
    if ops.len() > MAX_BLOCK_OPS {
        return Err(CodegenError::TooComplex);
    }
    match ops.last() {
        Some(HostOp::Exit { .. }) => Ok(()),
        _ => Err(CodegenError::BackendError("block does not end with an exit".into())),
    }
}

pub use interp::InterpCodegen as DefaultCodegen;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_packing() {
        let outcome = BlockOutcome::new(30, true);
        assert_eq!(outcome.cycles(), 30);
        assert!(outcome.needs_fallback());
        assert_eq!(outcome.0, 0x8000_001E);
        assert!(!BlockOutcome::new(5, false).needs_fallback());
    }

    #[test]
    fn test_division_edge_cases() {
        assert_eq!(MulDivOp::Div.eval(7, 0), (7, 0xFFFF_FFFF));
        assert_eq!(MulDivOp::Div.eval(-7i32 as u32, 0), (-7i32 as u32, 1));
        assert_eq!(MulDivOp::Div.eval(0x8000_0000, 0xFFFF_FFFF), (0, 0x8000_0000));
        assert_eq!(MulDivOp::Divu.eval(9, 0), (9, 0xFFFF_FFFF));
        assert_eq!(MulDivOp::Div.eval(-7i32 as u32, 2), (-1i32 as u32, -3i32 as u32));
    }

    #[test]
    fn test_multiply_splits_hi_lo() {
        assert_eq!(MulDivOp::Mult.eval(-2i32 as u32, 3), (0xFFFF_FFFF, -6i32 as u32));
        assert_eq!(MulDivOp::Multu.eval(0xFFFF_FFFF, 2), (1, 0xFFFF_FFFE));
    }

    #[test]
    fn test_alu_shift_masks_amount() {
        assert_eq!(AluOp::Sll.eval(1, 33), 2);
        assert_eq!(AluOp::Sra.eval(0x8000_0000, 31), 0xFFFF_FFFF);
        assert_eq!(AluOp::Slt.eval(-1i32 as u32, 0), 1);
        assert_eq!(AluOp::Sltu.eval(-1i32 as u32, 0), 0);
    }

    #[test]
    fn test_validate_requires_exit() {
        assert!(validate(&[HostOp::SetPc(Operand::Imm(0))]).is_err());
        assert!(validate(&[HostOp::Exit { cycles: 0, fallback: true }]).is_ok());
    }
}
