//! Interpreter codegen backend
//!
//! Keeps the op list as the block body and walks it on every invocation.
//! Always available on all platforms.

use super::{
    validate, Backend, BlockCode, BlockOutcome, CodegenError, HiLo, HostOp, Operand,
    ALLOCATEABLE_REG_COUNT,
};
use crate::cpu::CpuState;
use crate::memory::Bus;

/// Interpreter codegen backend (fallback)
pub struct InterpCodegen;

impl InterpCodegen {
    pub fn new() -> Self {
        InterpCodegen
    }
}

impl Default for InterpCodegen {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for InterpCodegen {
    fn name(&self) -> &'static str {
        "interp"
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn assemble(&mut self, ops: &[HostOp]) -> Result<BlockCode, CodegenError> {
        validate(ops)?;
        Ok(BlockCode::Interp(ops.into()))
    }
}

/// Execute an op list
pub fn run<B: Bus + ?Sized>(ops: &[HostOp], cpu: &mut CpuState, bus: &mut B) -> BlockOutcome {
    let mut regs = [0u32; ALLOCATEABLE_REG_COUNT];

    #[inline(always)]
    fn value(regs: &[u32; ALLOCATEABLE_REG_COUNT], operand: Operand) -> u32 {
        match operand {
            Operand::Reg(r) => regs[r.index()],
            Operand::Imm(v) => v,
        }
    }

    for op in ops {
        match *op {
            HostOp::LoadGuest { dst, reg } => regs[dst.index()] = cpu.gpr[reg as usize],
            HostOp::StoreGuest { src, reg } => cpu.gpr[reg as usize] = regs[src.index()],
            HostOp::StoreGuestImm { reg, value } => cpu.gpr[reg as usize] = value,
            HostOp::MovImm { dst, value } => regs[dst.index()] = value,
            HostOp::Alu { op, dst, lhs, rhs } => {
                regs[dst.index()] = op.eval(value(&regs, lhs), value(&regs, rhs));
            }
            HostOp::LoadMem { kind, base, offset, slot } => {
                let addr = value(&regs, base).wrapping_add(offset as i32 as u32);
                cpu.delayed_load_value[slot as usize] = kind.load(bus, addr);
            }
            HostOp::StoreMem { width, base, offset, src } => {
                let addr = value(&regs, base).wrapping_add(offset as i32 as u32);
                width.store(bus, addr, value(&regs, src));
            }
            HostOp::CommitDelayedLoad { dst, slot } => {
                regs[dst.index()] = cpu.delayed_load_value[slot as usize];
            }
            HostOp::DeferDelayedLoad { reg, slot } => {
                cpu.pending_load_reg = reg as u32;
                cpu.pending_load_value = cpu.delayed_load_value[slot as usize];
            }
            HostOp::LoadHiLo { dst, which } => {
                regs[dst.index()] = match which {
                    HiLo::Hi => cpu.hi,
                    HiLo::Lo => cpu.lo,
                };
            }
            HostOp::StoreHiLo { src, which } => {
                let v = value(&regs, src);
                match which {
                    HiLo::Hi => cpu.hi = v,
                    HiLo::Lo => cpu.lo = v,
                }
            }
            HostOp::MulDiv { op, lhs, rhs } => {
                let (hi, lo) = op.eval(value(&regs, lhs), value(&regs, rhs));
                cpu.hi = hi;
                cpu.lo = lo;
            }
            HostOp::SetPc(target) => cpu.pc = value(&regs, target),
            HostOp::BranchPc { cond, lhs, rhs, taken, not_taken } => {
                cpu.pc = if cond.eval(value(&regs, lhs), value(&regs, rhs)) {
                    taken
                } else {
                    not_taken
                };
            }
            HostOp::Exit { cycles, fallback } => return BlockOutcome::new(cycles, fallback),
        }
    }

    // assemble() rejects op lists without a trailing exit
    BlockOutcome::new(0, true)
}
