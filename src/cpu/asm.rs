//! Instruction encoders
//!
//! Tiny R3000A assembler used to build stubs and test programs without an
//! external toolchain. Register arguments are architectural indices (0..31).

use super::decode::*;

#[inline]
fn i_type(op: u32, rs: u8, rt: u8, imm: u16) -> u32 {
    (op << 26) | ((rs as u32) << 21) | ((rt as u32) << 16) | imm as u32
}

#[inline]
fn r_type(rs: u8, rt: u8, rd: u8, shamt: u32, funct: u32) -> u32 {
    ((rs as u32) << 21) | ((rt as u32) << 16) | ((rd as u32) << 11) | ((shamt & 0x1F) << 6) | funct
}

/// Encode a relative branch offset from `pc` to `target` (both word aligned)
#[inline]
pub fn branch_offset(pc: u32, target: u32) -> u16 {
    (target.wrapping_sub(pc.wrapping_add(4)) as i32 >> 2) as u16
}

pub const NOP: u32 = 0;

pub fn lui(rt: u8, imm: u16) -> u32 { i_type(OP_LUI, 0, rt, imm) }
pub fn ori(rt: u8, rs: u8, imm: u16) -> u32 { i_type(OP_ORI, rs, rt, imm) }
pub fn andi(rt: u8, rs: u8, imm: u16) -> u32 { i_type(OP_ANDI, rs, rt, imm) }
pub fn xori(rt: u8, rs: u8, imm: u16) -> u32 { i_type(OP_XORI, rs, rt, imm) }
pub fn addi(rt: u8, rs: u8, imm: i16) -> u32 { i_type(OP_ADDI, rs, rt, imm as u16) }
pub fn addiu(rt: u8, rs: u8, imm: i16) -> u32 { i_type(OP_ADDIU, rs, rt, imm as u16) }
pub fn slti(rt: u8, rs: u8, imm: i16) -> u32 { i_type(OP_SLTI, rs, rt, imm as u16) }
pub fn sltiu(rt: u8, rs: u8, imm: i16) -> u32 { i_type(OP_SLTIU, rs, rt, imm as u16) }

pub fn addu(rd: u8, rs: u8, rt: u8) -> u32 { r_type(rs, rt, rd, 0, FUNCT_ADDU) }
pub fn subu(rd: u8, rs: u8, rt: u8) -> u32 { r_type(rs, rt, rd, 0, FUNCT_SUBU) }
pub fn and(rd: u8, rs: u8, rt: u8) -> u32 { r_type(rs, rt, rd, 0, FUNCT_AND) }
pub fn or(rd: u8, rs: u8, rt: u8) -> u32 { r_type(rs, rt, rd, 0, FUNCT_OR) }
pub fn xor(rd: u8, rs: u8, rt: u8) -> u32 { r_type(rs, rt, rd, 0, FUNCT_XOR) }
pub fn nor(rd: u8, rs: u8, rt: u8) -> u32 { r_type(rs, rt, rd, 0, FUNCT_NOR) }
pub fn slt(rd: u8, rs: u8, rt: u8) -> u32 { r_type(rs, rt, rd, 0, FUNCT_SLT) }
pub fn sltu(rd: u8, rs: u8, rt: u8) -> u32 { r_type(rs, rt, rd, 0, FUNCT_SLTU) }
pub fn sll(rd: u8, rt: u8, sa: u32) -> u32 { r_type(0, rt, rd, sa, FUNCT_SLL) }
pub fn srl(rd: u8, rt: u8, sa: u32) -> u32 { r_type(0, rt, rd, sa, FUNCT_SRL) }
pub fn sra(rd: u8, rt: u8, sa: u32) -> u32 { r_type(0, rt, rd, sa, FUNCT_SRA) }
pub fn sllv(rd: u8, rt: u8, rs: u8) -> u32 { r_type(rs, rt, rd, 0, FUNCT_SLLV) }
pub fn srlv(rd: u8, rt: u8, rs: u8) -> u32 { r_type(rs, rt, rd, 0, FUNCT_SRLV) }
pub fn srav(rd: u8, rt: u8, rs: u8) -> u32 { r_type(rs, rt, rd, 0, FUNCT_SRAV) }

pub fn mult(rs: u8, rt: u8) -> u32 { r_type(rs, rt, 0, 0, FUNCT_MULT) }
pub fn multu(rs: u8, rt: u8) -> u32 { r_type(rs, rt, 0, 0, FUNCT_MULTU) }
pub fn div(rs: u8, rt: u8) -> u32 { r_type(rs, rt, 0, 0, FUNCT_DIV) }
pub fn divu(rs: u8, rt: u8) -> u32 { r_type(rs, rt, 0, 0, FUNCT_DIVU) }
pub fn mfhi(rd: u8) -> u32 { r_type(0, 0, rd, 0, FUNCT_MFHI) }
pub fn mflo(rd: u8) -> u32 { r_type(0, 0, rd, 0, FUNCT_MFLO) }
pub fn mthi(rs: u8) -> u32 { r_type(rs, 0, 0, 0, FUNCT_MTHI) }
pub fn mtlo(rs: u8) -> u32 { r_type(rs, 0, 0, 0, FUNCT_MTLO) }

pub fn lb(rt: u8, offset: i16, base: u8) -> u32 { i_type(OP_LB, base, rt, offset as u16) }
pub fn lbu(rt: u8, offset: i16, base: u8) -> u32 { i_type(OP_LBU, base, rt, offset as u16) }
pub fn lh(rt: u8, offset: i16, base: u8) -> u32 { i_type(OP_LH, base, rt, offset as u16) }
pub fn lhu(rt: u8, offset: i16, base: u8) -> u32 { i_type(OP_LHU, base, rt, offset as u16) }
pub fn lw(rt: u8, offset: i16, base: u8) -> u32 { i_type(OP_LW, base, rt, offset as u16) }
pub fn sb(rt: u8, offset: i16, base: u8) -> u32 { i_type(OP_SB, base, rt, offset as u16) }
pub fn sh(rt: u8, offset: i16, base: u8) -> u32 { i_type(OP_SH, base, rt, offset as u16) }
pub fn sw(rt: u8, offset: i16, base: u8) -> u32 { i_type(OP_SW, base, rt, offset as u16) }

pub fn j(target: u32) -> u32 { (OP_J << 26) | ((target >> 2) & 0x03FF_FFFF) }
pub fn jal(target: u32) -> u32 { (OP_JAL << 26) | ((target >> 2) & 0x03FF_FFFF) }
pub fn jr(rs: u8) -> u32 { r_type(rs, 0, 0, 0, FUNCT_JR) }
pub fn jalr(rd: u8, rs: u8) -> u32 { r_type(rs, 0, rd, 0, FUNCT_JALR) }
pub fn beq(rs: u8, rt: u8, offset: u16) -> u32 { i_type(OP_BEQ, rs, rt, offset) }
pub fn bne(rs: u8, rt: u8, offset: u16) -> u32 { i_type(OP_BNE, rs, rt, offset) }
pub fn blez(rs: u8, offset: u16) -> u32 { i_type(OP_BLEZ, rs, 0, offset) }
pub fn bgtz(rs: u8, offset: u16) -> u32 { i_type(OP_BGTZ, rs, 0, offset) }
pub fn bltz(rs: u8, offset: u16) -> u32 { i_type(OP_REGIMM, rs, REGIMM_BLTZ, offset) }
pub fn bgez(rs: u8, offset: u16) -> u32 { i_type(OP_REGIMM, rs, REGIMM_BGEZ, offset) }
pub fn bltzal(rs: u8, offset: u16) -> u32 { i_type(OP_REGIMM, rs, REGIMM_BLTZAL, offset) }
pub fn bgezal(rs: u8, offset: u16) -> u32 { i_type(OP_REGIMM, rs, REGIMM_BGEZAL, offset) }

pub fn syscall() -> u32 { FUNCT_SYSCALL }
pub fn brk() -> u32 { FUNCT_BREAK }

/// Serialize a program to little-endian bytes, ready for `Memory::load_binary`
pub fn to_bytes(program: &[u32]) -> Vec<u8> {
    program.iter().flat_map(|word| word.to_le_bytes()).collect()
}
