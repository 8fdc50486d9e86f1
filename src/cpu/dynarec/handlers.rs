//! Per-opcode lowering handlers
//!
//! `BSC` is indexed by the primary opcode (bits 31..26), `SPECIAL` by the
//! function field (bits 5..0). REGIMM branches are told apart by rt in
//! `lookup`. Whatever is not listed here is routed to the interpreter.

use super::codegen::{AluOp, Cond, HiLo, HostOp, LoadKind, MulDivOp, Operand, StoreWidth};
use super::compiler::BlockCompiler;
use crate::cpu::decode::*;

pub type Handler = fn(&mut BlockCompiler, Instruction);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    /// No handler; the interpreter runs it
    Unknown,
    Plain,
    /// Control transfer with a delay slot
    Branch,
}

#[derive(Clone, Copy)]
pub struct OpEntry {
    pub handler: Handler,
    pub kind: OpKind,
}

const UNKNOWN: OpEntry = OpEntry { handler: rec_unknown, kind: OpKind::Unknown };

const fn plain(handler: Handler) -> OpEntry {
    OpEntry { handler, kind: OpKind::Plain }
}

const fn branch(handler: Handler) -> OpEntry {
    OpEntry { handler, kind: OpKind::Branch }
}

pub static BSC: [OpEntry; 64] = build_bsc();
pub static SPECIAL: [OpEntry; 64] = build_special();

const fn build_bsc() -> [OpEntry; 64] {
    let mut t = [UNKNOWN; 64];
    t[OP_J as usize] = branch(rec_j);
    t[OP_JAL as usize] = branch(rec_jal);
    t[OP_BEQ as usize] = branch(rec_beq);
    t[OP_BNE as usize] = branch(rec_bne);
    t[OP_BLEZ as usize] = branch(rec_blez);
    t[OP_BGTZ as usize] = branch(rec_bgtz);
    t[OP_ADDI as usize] = plain(rec_addiu);
    t[OP_ADDIU as usize] = plain(rec_addiu);
    t[OP_SLTI as usize] = plain(rec_slti);
    t[OP_SLTIU as usize] = plain(rec_sltiu);
    t[OP_ANDI as usize] = plain(rec_andi);
    t[OP_ORI as usize] = plain(rec_ori);
    t[OP_XORI as usize] = plain(rec_xori);
    t[OP_LUI as usize] = plain(rec_lui);
    t[OP_LB as usize] = plain(rec_lb);
    t[OP_LH as usize] = plain(rec_lh);
    t[OP_LW as usize] = plain(rec_lw);
    t[OP_LBU as usize] = plain(rec_lbu);
    t[OP_LHU as usize] = plain(rec_lhu);
    t[OP_SB as usize] = plain(rec_sb);
    t[OP_SH as usize] = plain(rec_sh);
    t[OP_SW as usize] = plain(rec_sw);
    t
}

const fn build_special() -> [OpEntry; 64] {
    let mut t = [UNKNOWN; 64];
    t[FUNCT_SLL as usize] = plain(rec_sll);
    t[FUNCT_SRL as usize] = plain(rec_srl);
    t[FUNCT_SRA as usize] = plain(rec_sra);
    t[FUNCT_SLLV as usize] = plain(rec_sllv);
    t[FUNCT_SRLV as usize] = plain(rec_srlv);
    t[FUNCT_SRAV as usize] = plain(rec_srav);
    t[FUNCT_JR as usize] = branch(rec_jr);
    t[FUNCT_JALR as usize] = branch(rec_jalr);
    t[FUNCT_MFHI as usize] = plain(rec_mfhi);
    t[FUNCT_MTHI as usize] = plain(rec_mthi);
    t[FUNCT_MFLO as usize] = plain(rec_mflo);
    t[FUNCT_MTLO as usize] = plain(rec_mtlo);
    t[FUNCT_MULT as usize] = plain(rec_mult);
    t[FUNCT_MULTU as usize] = plain(rec_multu);
    t[FUNCT_DIV as usize] = plain(rec_div);
    t[FUNCT_DIVU as usize] = plain(rec_divu);
    t[FUNCT_ADD as usize] = plain(rec_addu);
    t[FUNCT_ADDU as usize] = plain(rec_addu);
    t[FUNCT_SUB as usize] = plain(rec_subu);
    t[FUNCT_SUBU as usize] = plain(rec_subu);
    t[FUNCT_AND as usize] = plain(rec_and);
    t[FUNCT_OR as usize] = plain(rec_or);
    t[FUNCT_XOR as usize] = plain(rec_xor);
    t[FUNCT_NOR as usize] = plain(rec_nor);
    t[FUNCT_SLT as usize] = plain(rec_slt);
    t[FUNCT_SLTU as usize] = plain(rec_sltu);
    t
}

/// Handler entry for an instruction word
#[inline]
pub fn lookup(inst: Instruction) -> OpEntry {
    match inst.opcode() {
        OP_SPECIAL => SPECIAL[inst.funct() as usize],
        OP_REGIMM => match inst.rt() {
            REGIMM_BLTZ | REGIMM_BGEZ | REGIMM_BLTZAL | REGIMM_BGEZAL => branch(rec_regimm),
            _ => UNKNOWN,
        },
        op => BSC[op as usize],
    }
}

/// Stub for instructions the recompiler does not handle: hand the current pc
/// to the interpreter
pub fn rec_unknown(c: &mut BlockCompiler, inst: Instruction) {
    tracing::warn!(
        "unknown instruction {:#010x} at {:#010x}, deferring to the interpreter",
        inst.raw,
        c.pc
    );
    c.emit(HostOp::SetPc(Operand::Imm(c.pc)));
    c.emit(HostOp::Exit { cycles: 0, fallback: true });
}

// ALU, immediate forms. ADDI/SUB/ADD share the non-trapping paths.

fn alu_imm(c: &mut BlockCompiler, inst: Instruction, op: AluOp, imm: u32) {
    let (rs, rt) = (inst.rs(), inst.rt());
    if rt == 0 {
        return;
    }
    if let Some(value) = c.regs.constant(rs) {
        c.set_const(rt, op.eval(value, imm));
        return;
    }
    let (src, dst) = c.operand_with_dest(rs, rt);
    c.emit(HostOp::Alu { op, dst, lhs: src, rhs: Operand::Imm(imm) });
}

fn rec_addiu(c: &mut BlockCompiler, inst: Instruction) {
    alu_imm(c, inst, AluOp::Add, inst.imm_se());
}

fn rec_slti(c: &mut BlockCompiler, inst: Instruction) {
    alu_imm(c, inst, AluOp::Slt, inst.imm_se());
}

fn rec_sltiu(c: &mut BlockCompiler, inst: Instruction) {
    alu_imm(c, inst, AluOp::Sltu, inst.imm_se());
}

fn rec_andi(c: &mut BlockCompiler, inst: Instruction) {
    alu_imm(c, inst, AluOp::And, inst.imm());
}

fn rec_ori(c: &mut BlockCompiler, inst: Instruction) {
    alu_imm(c, inst, AluOp::Or, inst.imm());
}

fn rec_xori(c: &mut BlockCompiler, inst: Instruction) {
    alu_imm(c, inst, AluOp::Xor, inst.imm());
}

fn rec_lui(c: &mut BlockCompiler, inst: Instruction) {
    c.set_const(inst.rt(), inst.imm() << 16);
}

// ALU, register forms

/// rd = lhs op rhs
fn alu_reg(c: &mut BlockCompiler, rd: u8, lhs: u8, rhs: u8, op: AluOp) {
    if rd == 0 {
        return;
    }
    if let (Some(a), Some(b)) = (c.regs.constant(lhs), c.regs.constant(rhs)) {
        c.set_const(rd, op.eval(a, b));
        return;
    }
    let (a, b, dst) = c.operand_pair_with_dest(lhs, rhs, rd);
    c.emit(HostOp::Alu { op, dst, lhs: a, rhs: b });
}

fn rec_addu(c: &mut BlockCompiler, inst: Instruction) {
    alu_reg(c, inst.rd(), inst.rs(), inst.rt(), AluOp::Add);
}

fn rec_subu(c: &mut BlockCompiler, inst: Instruction) {
    alu_reg(c, inst.rd(), inst.rs(), inst.rt(), AluOp::Sub);
}

fn rec_and(c: &mut BlockCompiler, inst: Instruction) {
    alu_reg(c, inst.rd(), inst.rs(), inst.rt(), AluOp::And);
}

fn rec_or(c: &mut BlockCompiler, inst: Instruction) {
    alu_reg(c, inst.rd(), inst.rs(), inst.rt(), AluOp::Or);
}

fn rec_xor(c: &mut BlockCompiler, inst: Instruction) {
    alu_reg(c, inst.rd(), inst.rs(), inst.rt(), AluOp::Xor);
}

fn rec_nor(c: &mut BlockCompiler, inst: Instruction) {
    alu_reg(c, inst.rd(), inst.rs(), inst.rt(), AluOp::Nor);
}

fn rec_slt(c: &mut BlockCompiler, inst: Instruction) {
    alu_reg(c, inst.rd(), inst.rs(), inst.rt(), AluOp::Slt);
}

fn rec_sltu(c: &mut BlockCompiler, inst: Instruction) {
    alu_reg(c, inst.rd(), inst.rs(), inst.rt(), AluOp::Sltu);
}

// Shifts

fn shift_imm(c: &mut BlockCompiler, inst: Instruction, op: AluOp) {
    let (rd, rt, sa) = (inst.rd(), inst.rt(), inst.shamt());
    if rd == 0 {
        return;
    }
    if let Some(value) = c.regs.constant(rt) {
        c.set_const(rd, op.eval(value, sa));
        return;
    }
    let (src, dst) = c.operand_with_dest(rt, rd);
    c.emit(HostOp::Alu { op, dst, lhs: src, rhs: Operand::Imm(sa) });
}

fn rec_sll(c: &mut BlockCompiler, inst: Instruction) {
    shift_imm(c, inst, AluOp::Sll);
}

fn rec_srl(c: &mut BlockCompiler, inst: Instruction) {
    shift_imm(c, inst, AluOp::Srl);
}

fn rec_sra(c: &mut BlockCompiler, inst: Instruction) {
    shift_imm(c, inst, AluOp::Sra);
}

fn rec_sllv(c: &mut BlockCompiler, inst: Instruction) {
    alu_reg(c, inst.rd(), inst.rt(), inst.rs(), AluOp::Sll);
}

fn rec_srlv(c: &mut BlockCompiler, inst: Instruction) {
    alu_reg(c, inst.rd(), inst.rt(), inst.rs(), AluOp::Srl);
}

fn rec_srav(c: &mut BlockCompiler, inst: Instruction) {
    alu_reg(c, inst.rd(), inst.rt(), inst.rs(), AluOp::Sra);
}

// HI/LO

fn move_from(c: &mut BlockCompiler, inst: Instruction, which: HiLo) {
    let rd = inst.rd();
    if rd == 0 {
        return;
    }
    let dst = c.dest(rd);
    c.emit(HostOp::LoadHiLo { dst, which });
}

fn move_to(c: &mut BlockCompiler, inst: Instruction, which: HiLo) {
    let src = c.operand(inst.rs());
    c.emit(HostOp::StoreHiLo { src, which });
}

fn rec_mfhi(c: &mut BlockCompiler, inst: Instruction) {
    move_from(c, inst, HiLo::Hi);
}

fn rec_mflo(c: &mut BlockCompiler, inst: Instruction) {
    move_from(c, inst, HiLo::Lo);
}

fn rec_mthi(c: &mut BlockCompiler, inst: Instruction) {
    move_to(c, inst, HiLo::Hi);
}

fn rec_mtlo(c: &mut BlockCompiler, inst: Instruction) {
    move_to(c, inst, HiLo::Lo);
}

fn mul_div(c: &mut BlockCompiler, inst: Instruction, op: MulDivOp) {
    match c.operand_pair(inst.rs(), inst.rt()) {
        (Operand::Imm(a), Operand::Imm(b)) => {
            let (hi, lo) = op.eval(a, b);
            c.emit(HostOp::StoreHiLo { src: Operand::Imm(hi), which: HiLo::Hi });
            c.emit(HostOp::StoreHiLo { src: Operand::Imm(lo), which: HiLo::Lo });
        }
        (lhs, rhs) => c.emit(HostOp::MulDiv { op, lhs, rhs }),
    }
}

fn rec_mult(c: &mut BlockCompiler, inst: Instruction) {
    mul_div(c, inst, MulDivOp::Mult);
}

fn rec_multu(c: &mut BlockCompiler, inst: Instruction) {
    mul_div(c, inst, MulDivOp::Multu);
}

fn rec_div(c: &mut BlockCompiler, inst: Instruction) {
    mul_div(c, inst, MulDivOp::Div);
}

fn rec_divu(c: &mut BlockCompiler, inst: Instruction) {
    mul_div(c, inst, MulDivOp::Divu);
}

// Loads land in a delayed slot; stores go straight to the bus

fn load(c: &mut BlockCompiler, inst: Instruction, kind: LoadKind) {
    let base = c.operand(inst.rs());
    let slot = c.arm_delayed_load(inst.rt());
    c.emit(HostOp::LoadMem { kind, base, offset: inst.imm() as u16 as i16, slot });
}

fn rec_lb(c: &mut BlockCompiler, inst: Instruction) {
    load(c, inst, LoadKind::Byte);
}

fn rec_lbu(c: &mut BlockCompiler, inst: Instruction) {
    load(c, inst, LoadKind::ByteUnsigned);
}

fn rec_lh(c: &mut BlockCompiler, inst: Instruction) {
    load(c, inst, LoadKind::Half);
}

fn rec_lhu(c: &mut BlockCompiler, inst: Instruction) {
    load(c, inst, LoadKind::HalfUnsigned);
}

fn rec_lw(c: &mut BlockCompiler, inst: Instruction) {
    load(c, inst, LoadKind::Word);
}

fn store(c: &mut BlockCompiler, inst: Instruction, width: StoreWidth) {
    let (base, src) = c.operand_pair(inst.rs(), inst.rt());
    c.emit(HostOp::StoreMem { width, base, offset: inst.imm() as u16 as i16, src });
}

fn rec_sb(c: &mut BlockCompiler, inst: Instruction) {
    store(c, inst, StoreWidth::Byte);
}

fn rec_sh(c: &mut BlockCompiler, inst: Instruction) {
    store(c, inst, StoreWidth::Half);
}

fn rec_sw(c: &mut BlockCompiler, inst: Instruction) {
    store(c, inst, StoreWidth::Word);
}

// Control transfer. The next pc is stored here, before the delay slot can
// change any operand; the link value is a compile-time constant.

fn link(c: &mut BlockCompiler, reg: u8) {
    let ret = c.pc.wrapping_add(8);
    c.set_const(reg, ret);
}

fn jump_to(c: &mut BlockCompiler, target: Operand) {
    c.emit(HostOp::SetPc(target));
    c.pc_written = true;
}

fn rec_j(c: &mut BlockCompiler, inst: Instruction) {
    let target = inst.jump_target(c.pc);
    jump_to(c, Operand::Imm(target));
}

fn rec_jal(c: &mut BlockCompiler, inst: Instruction) {
    rec_j(c, inst);
    link(c, REG_RA);
}

fn rec_jr(c: &mut BlockCompiler, inst: Instruction) {
    let target = c.operand(inst.rs());
    jump_to(c, target);
}

fn rec_jalr(c: &mut BlockCompiler, inst: Instruction) {
    rec_jr(c, inst);
    link(c, inst.rd());
}

fn conditional(c: &mut BlockCompiler, inst: Instruction, cond: Cond, rhs: Option<u8>) {
    let taken = inst.branch_target(c.pc);
    let not_taken = c.pc.wrapping_add(8);
    let (lhs, rhs) = match rhs {
        Some(rt) => c.operand_pair(inst.rs(), rt),
        None => (c.operand(inst.rs()), Operand::Imm(0)),
    };
    match (lhs, rhs) {
        (Operand::Imm(a), Operand::Imm(b)) => {
            let target = if cond.eval(a, b) { taken } else { not_taken };
            jump_to(c, Operand::Imm(target));
        }
        _ => {
            c.emit(HostOp::BranchPc { cond, lhs, rhs, taken, not_taken });
            c.pc_written = true;
        }
    }
}

fn rec_beq(c: &mut BlockCompiler, inst: Instruction) {
    conditional(c, inst, Cond::Eq, Some(inst.rt()));
}

fn rec_bne(c: &mut BlockCompiler, inst: Instruction) {
    conditional(c, inst, Cond::Ne, Some(inst.rt()));
}

fn rec_blez(c: &mut BlockCompiler, inst: Instruction) {
    conditional(c, inst, Cond::Le, None);
}

fn rec_bgtz(c: &mut BlockCompiler, inst: Instruction) {
    conditional(c, inst, Cond::Gt, None);
}

/// BLTZ, BGEZ and the linking forms; the link happens whether or not the
/// branch is taken
fn rec_regimm(c: &mut BlockCompiler, inst: Instruction) {
    let rt = inst.rt();
    let cond = if rt & 1 == 0 { Cond::Lt } else { Cond::Ge };
    conditional(c, inst, cond, None);
    if rt & 0x10 != 0 {
        link(c, REG_RA);
    }
}
