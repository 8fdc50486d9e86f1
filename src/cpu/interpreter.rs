//! Reference interpreter
//!
//! Executes instructions the recompiler hands back (unknown opcodes, delay
//! slots that cannot be compiled, the instruction after a load that crossed a
//! block boundary). A control transfer and its delay slot run as one step.
//!
//! Load delay: a load's value becomes visible after the following
//! instruction. If that instruction writes the same register, or loads into
//! it again, the older value is dropped.

use thiserror::Error;

use super::decode::*;
use super::CpuState;
use crate::cpu::dynarec::codegen::{AluOp, LoadKind, MulDivOp, StoreWidth};
use crate::memory::Bus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Exception {
    #[error("syscall")]
    Syscall,
    #[error("break")]
    Break,
    #[error("reserved instruction {0:#010x}")]
    ReservedInstruction(u32),
}

/// Side effects of one instruction that interact with the load delay
#[derive(Default)]
struct Effects {
    /// Register written directly
    write: Option<u8>,
    /// Load issued, retires after the next instruction
    load: Option<(u8, u32)>,
    /// Control transfer target; `None` on a not-taken branch
    jump: Option<u32>,
}

/// Execute one instruction (or a control transfer with its delay slot)
pub fn step<B: Bus + ?Sized>(cpu: &mut CpuState, bus: &mut B) -> Result<(), Exception> {
    let pc = cpu.pc;
    let inst = Instruction::new(bus.read32(pc));

    if !inst.is_control_transfer() {
        let fx = retire(cpu, bus, inst)?;
        cpu.pc = pc.wrapping_add(4);
        cpu.cycle += 1;
        debug_assert!(fx.jump.is_none());
        return Ok(());
    }

    // A faulting delay slot is reported against the branch, before either runs
    let slot_pc = pc.wrapping_add(4);
    let slot = Instruction::new(bus.read32(slot_pc));
    if let Some(exception) = raises(slot) {
        return Err(exception);
    }

    let fx = retire(cpu, bus, inst)?;
    let target = fx.jump.unwrap_or(pc.wrapping_add(8));
    cpu.pc = slot_pc;
    // branch in a delay slot: the second transfer is ignored
    retire(cpu, bus, slot)?;
    cpu.pc = target;
    cpu.cycle += 2;
    Ok(())
}

/// Exception a lone instruction raises regardless of operands
fn raises(inst: Instruction) -> Option<Exception> {
    match inst.opcode() {
        OP_SPECIAL => match inst.funct() {
            FUNCT_SYSCALL => Some(Exception::Syscall),
            FUNCT_BREAK => Some(Exception::Break),
            _ => None,
        },
        _ => None,
    }
}

/// Run `inst` and then settle the load delay
fn retire<B: Bus + ?Sized>(cpu: &mut CpuState, bus: &mut B, inst: Instruction) -> Result<Effects, Exception> {
    let prior = match cpu.pending_load_reg {
        0 => None,
        reg => Some((reg as u8, cpu.pending_load_value)),
    };

    let fx = execute(cpu, bus, inst, prior)?;

    cpu.pending_load_reg = 0;
    cpu.pending_load_value = 0;
    if let Some((reg, value)) = prior {
        let superseded = fx.write == Some(reg) || fx.load.is_some_and(|(r, _)| r == reg);
        if !superseded {
            cpu.write_reg(reg, value);
        }
    }
    if let Some((reg, value)) = fx.load {
        if reg != 0 {
            cpu.pending_load_reg = reg as u32;
            cpu.pending_load_value = value;
        }
    }
    Ok(fx)
}

fn write(cpu: &mut CpuState, fx: &mut Effects, reg: u8, value: u32) {
    cpu.write_reg(reg, value);
    if reg != 0 {
        fx.write = Some(reg);
    }
}

fn execute<B: Bus + ?Sized>(
    cpu: &mut CpuState,
    bus: &mut B,
    inst: Instruction,
    prior: Option<(u8, u32)>,
) -> Result<Effects, Exception> {
    let mut fx = Effects::default();
    let pc = cpu.pc;
    let rs = cpu.read_reg(inst.rs());
    let rt = cpu.read_reg(inst.rt());
    let addr = rs.wrapping_add(inst.imm_se());

    match inst.opcode() {
        OP_SPECIAL => {
            let rd = inst.rd();
            let sa = inst.shamt();
            match inst.funct() {
                FUNCT_SLL => write(cpu, &mut fx, rd, AluOp::Sll.eval(rt, sa)),
                FUNCT_SRL => write(cpu, &mut fx, rd, AluOp::Srl.eval(rt, sa)),
                FUNCT_SRA => write(cpu, &mut fx, rd, AluOp::Sra.eval(rt, sa)),
                FUNCT_SLLV => write(cpu, &mut fx, rd, AluOp::Sll.eval(rt, rs)),
                FUNCT_SRLV => write(cpu, &mut fx, rd, AluOp::Srl.eval(rt, rs)),
                FUNCT_SRAV => write(cpu, &mut fx, rd, AluOp::Sra.eval(rt, rs)),
                FUNCT_JR => fx.jump = Some(rs),
                FUNCT_JALR => {
                    fx.jump = Some(rs);
                    write(cpu, &mut fx, rd, pc.wrapping_add(8));
                }
                FUNCT_SYSCALL => return Err(Exception::Syscall),
                FUNCT_BREAK => return Err(Exception::Break),
                FUNCT_MFHI => {
                    let hi = cpu.hi;
                    write(cpu, &mut fx, rd, hi);
                }
                FUNCT_MFLO => {
                    let lo = cpu.lo;
                    write(cpu, &mut fx, rd, lo);
                }
                FUNCT_MTHI => cpu.hi = rs,
                FUNCT_MTLO => cpu.lo = rs,
                f @ (FUNCT_MULT | FUNCT_MULTU | FUNCT_DIV | FUNCT_DIVU) => {
                    let (hi, lo) = MulDivOp::from_u32(f & 3).eval(rs, rt);
                    cpu.hi = hi;
                    cpu.lo = lo;
                }
                // no overflow trap, same as compiled code
                FUNCT_ADD | FUNCT_ADDU => write(cpu, &mut fx, rd, AluOp::Add.eval(rs, rt)),
                FUNCT_SUB | FUNCT_SUBU => write(cpu, &mut fx, rd, AluOp::Sub.eval(rs, rt)),
                FUNCT_AND => write(cpu, &mut fx, rd, AluOp::And.eval(rs, rt)),
                FUNCT_OR => write(cpu, &mut fx, rd, AluOp::Or.eval(rs, rt)),
                FUNCT_XOR => write(cpu, &mut fx, rd, AluOp::Xor.eval(rs, rt)),
                FUNCT_NOR => write(cpu, &mut fx, rd, AluOp::Nor.eval(rs, rt)),
                FUNCT_SLT => write(cpu, &mut fx, rd, AluOp::Slt.eval(rs, rt)),
                FUNCT_SLTU => write(cpu, &mut fx, rd, AluOp::Sltu.eval(rs, rt)),
                _ => return Err(Exception::ReservedInstruction(inst.raw)),
            }
        }
        OP_REGIMM => {
            let rt_field = inst.rt();
            let taken = match rt_field {
                REGIMM_BLTZ | REGIMM_BLTZAL => (rs as i32) < 0,
                REGIMM_BGEZ | REGIMM_BGEZAL => (rs as i32) >= 0,
                _ => return Err(Exception::ReservedInstruction(inst.raw)),
            };
            if taken {
                fx.jump = Some(inst.branch_target(pc));
            }
            if rt_field & 0x10 != 0 {
                write(cpu, &mut fx, REG_RA, pc.wrapping_add(8));
            }
        }
        OP_J => fx.jump = Some(inst.jump_target(pc)),
        OP_JAL => {
            fx.jump = Some(inst.jump_target(pc));
            write(cpu, &mut fx, REG_RA, pc.wrapping_add(8));
        }
        op @ (OP_BEQ | OP_BNE | OP_BLEZ | OP_BGTZ) => {
            let taken = match op {
                OP_BEQ => rs == rt,
                OP_BNE => rs != rt,
                OP_BLEZ => (rs as i32) <= 0,
                _ => (rs as i32) > 0,
            };
            if taken {
                fx.jump = Some(inst.branch_target(pc));
            }
        }
        OP_ADDI | OP_ADDIU => write(cpu, &mut fx, inst.rt(), AluOp::Add.eval(rs, inst.imm_se())),
        OP_SLTI => write(cpu, &mut fx, inst.rt(), AluOp::Slt.eval(rs, inst.imm_se())),
        OP_SLTIU => write(cpu, &mut fx, inst.rt(), AluOp::Sltu.eval(rs, inst.imm_se())),
        OP_ANDI => write(cpu, &mut fx, inst.rt(), rs & inst.imm()),
        OP_ORI => write(cpu, &mut fx, inst.rt(), rs | inst.imm()),
        OP_XORI => write(cpu, &mut fx, inst.rt(), rs ^ inst.imm()),
        OP_LUI => write(cpu, &mut fx, inst.rt(), inst.imm() << 16),
        OP_COP0 => match inst.rs() {
            // MFC0: no system control state is modelled here
            0x00 => fx.load = Some((inst.rt(), 0)),
            // MTC0, RFE
            0x04 | 0x10 => tracing::trace!("cop0 write ignored at {:#010x}", pc),
            _ => return Err(Exception::ReservedInstruction(inst.raw)),
        },
        OP_LB => fx.load = Some((inst.rt(), LoadKind::Byte.load(bus, addr))),
        OP_LBU => fx.load = Some((inst.rt(), LoadKind::ByteUnsigned.load(bus, addr))),
        OP_LH => fx.load = Some((inst.rt(), LoadKind::Half.load(bus, addr))),
        OP_LHU => fx.load = Some((inst.rt(), LoadKind::HalfUnsigned.load(bus, addr))),
        OP_LW => fx.load = Some((inst.rt(), LoadKind::Word.load(bus, addr))),
        op @ (OP_LWL | OP_LWR) => {
            // Merges with an in-flight load into the same register
            let current = match prior {
                Some((reg, value)) if reg == inst.rt() => value,
                _ => rt,
            };
            let word = bus.read32(addr & !3);
            let shift = (addr & 3) * 8;
            let merged = if op == OP_LWL {
                let keep = 0x00FF_FFFFu32.checked_shr(shift).unwrap_or(0);
                (current & keep) | (word << (24 - shift))
            } else {
                let keep = 0xFFFF_FF00u32.checked_shl(24 - shift).unwrap_or(0);
                (current & keep) | (word >> shift)
            };
            fx.load = Some((inst.rt(), merged));
        }
        OP_SB => StoreWidth::Byte.store(bus, addr, rt),
        OP_SH => StoreWidth::Half.store(bus, addr, rt),
        OP_SW => StoreWidth::Word.store(bus, addr, rt),
        op @ (OP_SWL | OP_SWR) => {
            let aligned = addr & !3;
            let word = bus.read32(aligned);
            let shift = (addr & 3) * 8;
            let merged = if op == OP_SWL {
                let keep = 0xFFFF_FF00u32.checked_shl(shift).unwrap_or(0);
                (word & keep) | (rt >> (24 - shift))
            } else {
                let keep = 0x00FF_FFFFu32.checked_shr(24 - shift).unwrap_or(0);
                (word & keep) | (rt << shift)
            };
            bus.write32(aligned, merged);
        }
        _ => return Err(Exception::ReservedInstruction(inst.raw)),
    }

    Ok(fx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::asm::*;
    use crate::memory::{Memory, RAM_SIZE_2MB};

    const BASE: u32 = 0x8000_0100;

    fn setup(program: &[u32]) -> (CpuState, Memory) {
        let mut mem = Memory::new(RAM_SIZE_2MB);
        mem.load_binary(&to_bytes(program), BASE).unwrap();
        let mut cpu = CpuState::new();
        cpu.pc = BASE;
        (cpu, mem)
    }

    #[test]
    fn test_load_delay_hides_value_for_one_instruction() {
        let (mut cpu, mut mem) = setup(&[lw(2, 0, 4), addu(3, 2, 0), addu(5, 2, 0)]);
        mem.write32(0x8000_0800, 0xCAFE);
        cpu.gpr[4] = 0x8000_0800;
        cpu.gpr[2] = 7;

        step(&mut cpu, &mut mem).unwrap();
        assert_eq!(cpu.gpr[2], 7);
        assert!(cpu.has_pending_load());
        step(&mut cpu, &mut mem).unwrap();
        assert_eq!(cpu.gpr[3], 7);
        assert_eq!(cpu.gpr[2], 0xCAFE);
        step(&mut cpu, &mut mem).unwrap();
        assert_eq!(cpu.gpr[5], 0xCAFE);
        assert_eq!(cpu.cycle, 3);
    }

    #[test]
    fn test_write_in_delay_slot_cancels_load() {
        let (mut cpu, mut mem) = setup(&[lw(2, 0, 4), addiu(2, 0, 1)]);
        mem.write32(0x8000_0800, 0xCAFE);
        cpu.gpr[4] = 0x8000_0800;

        step(&mut cpu, &mut mem).unwrap();
        step(&mut cpu, &mut mem).unwrap();
        assert_eq!(cpu.gpr[2], 1);
        assert!(!cpu.has_pending_load());
    }

    #[test]
    fn test_back_to_back_loads_same_register() {
        let (mut cpu, mut mem) = setup(&[lw(2, 0, 4), lw(2, 4, 4), NOP]);
        mem.write32(0x8000_0800, 0x11);
        mem.write32(0x8000_0804, 0x22);
        cpu.gpr[4] = 0x8000_0800;

        step(&mut cpu, &mut mem).unwrap();
        step(&mut cpu, &mut mem).unwrap();
        assert_eq!(cpu.gpr[2], 0);
        step(&mut cpu, &mut mem).unwrap();
        assert_eq!(cpu.gpr[2], 0x22);
    }

    #[test]
    fn test_branch_runs_with_delay_slot() {
        // beq $0, $0, +2 ; addiu $3, $0, 5 ; (skipped) ; target
        let target = BASE + 12;
        let (mut cpu, mut mem) = setup(&[beq(0, 0, branch_offset(BASE, target)), addiu(3, 0, 5), addiu(3, 0, 9)]);
        step(&mut cpu, &mut mem).unwrap();
        assert_eq!(cpu.pc, target);
        assert_eq!(cpu.gpr[3], 5);
        assert_eq!(cpu.cycle, 2);
    }

    #[test]
    fn test_jal_links_before_delay_slot() {
        let (mut cpu, mut mem) = setup(&[jal(0x8000_0400), addu(4, 31, 0)]);
        step(&mut cpu, &mut mem).unwrap();
        assert_eq!(cpu.pc, 0x8000_0400);
        assert_eq!(cpu.gpr[31], BASE + 8);
        assert_eq!(cpu.gpr[4], BASE + 8);
    }

    #[test]
    fn test_bltzal_links_when_not_taken() {
        let (mut cpu, mut mem) = setup(&[bltzal(0, 4), NOP]);
        step(&mut cpu, &mut mem).unwrap();
        assert_eq!(cpu.pc, BASE + 8);
        assert_eq!(cpu.gpr[31], BASE + 8);
    }

    #[test]
    fn test_exceptions_leave_pc_alone() {
        let (mut cpu, mut mem) = setup(&[syscall(), brk()]);
        assert_eq!(step(&mut cpu, &mut mem), Err(Exception::Syscall));
        assert_eq!(cpu.pc, BASE);
        cpu.pc += 4;
        assert_eq!(step(&mut cpu, &mut mem), Err(Exception::Break));

        let (mut cpu, mut mem) = setup(&[jr(31), syscall()]);
        assert_eq!(step(&mut cpu, &mut mem), Err(Exception::Syscall));
        assert_eq!(cpu.pc, BASE);
    }

    #[test]
    fn test_unaligned_word_access() {
        // lwl $2, 3($4) ; lwr $2, 0($4) ; nop
        let lwl = (OP_LWL << 26) | (4 << 21) | (2 << 16) | 3;
        let lwr = (OP_LWR << 26) | (4 << 21) | (2 << 16);
        let (mut cpu, mut mem) = setup(&[lwl, lwr, NOP]);
        mem.write32(0x8000_0800, 0x4433_2211);
        cpu.gpr[4] = 0x8000_0800;

        for _ in 0..3 {
            step(&mut cpu, &mut mem).unwrap();
        }
        assert_eq!(cpu.gpr[2], 0x4433_2211);
    }

    #[test]
    fn test_division_by_zero() {
        let (mut cpu, mut mem) = setup(&[div(4, 0)]);
        cpu.gpr[4] = 5;
        step(&mut cpu, &mut mem).unwrap();
        assert_eq!(cpu.lo, 0xFFFF_FFFF);
        assert_eq!(cpu.hi, 5);
    }
}
