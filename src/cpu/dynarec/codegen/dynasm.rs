//! Dynasm-rs native JIT backend for x86_64
//!
//! Lowers op lists straight to x86_64 machine code.
//! Only available on native builds with the `jit-dynasm` feature.
//!
//! Register assignment (SysV):
//!   slot 0..4 -> rbx, rbp, r12, r13, r14 (callee-saved, survive bus calls)
//!   slot 5    -> r15, the `CpuState` pointer (CONTEXT_POINTER)
//!   eax, ecx, edx, esi, edi are scratch
//!   [rsp] holds the `MemoryHooks` pointer for the duration of the block

use dynasm::dynasm;
use dynasmrt::{x64::Assembler, DynasmApi, ExecutableBuffer};
use std::ffi::c_void;
use std::mem::{self, offset_of};

use super::{
    validate, AluOp, Backend, BlockCode, BlockOutcome, CodegenError, Cond, HiLo, HostOp, HostReg,
    LoadKind, MulDivOp, Operand, StoreWidth, CONTEXT_POINTER,
};
use crate::cpu::CpuState;
use crate::memory::Bus;

/// x86_64 register numbers for each allocatable slot
const SLOT_REGS: [u8; 6] = [3, 5, 12, 13, 14, 15];

const EAX: u8 = 0;
const ECX: u8 = 1;
const EDX: u8 = 2;
const ESI: u8 = 6;

type ReadFn = unsafe extern "sysv64" fn(*mut c_void, u32) -> u32;
type WriteFn = unsafe extern "sysv64" fn(*mut c_void, u32, u32);
type BlockFn = unsafe extern "sysv64" fn(*mut CpuState, *const MemoryHooks) -> u32;

/// Bus entry points handed to native code, monomorphized per bus type
#[repr(C)]
pub struct MemoryHooks {
    ctx: *mut c_void,
    read8: ReadFn,
    read16: ReadFn,
    read32: ReadFn,
    write8: WriteFn,
    write16: WriteFn,
    write32: WriteFn,
}

impl MemoryHooks {
    fn new<B: Bus>(bus: &mut B) -> Self {
        MemoryHooks {
            ctx: bus as *mut B as *mut c_void,
            read8: read8_hook::<B>,
            read16: read16_hook::<B>,
            read32: read32_hook::<B>,
            write8: write8_hook::<B>,
            write16: write16_hook::<B>,
            write32: write32_hook::<B>,
        }
    }
}

unsafe extern "sysv64" fn read8_hook<B: Bus>(ctx: *mut c_void, addr: u32) -> u32 {
    (*(ctx as *mut B)).read8(addr) as u32
}

unsafe extern "sysv64" fn read16_hook<B: Bus>(ctx: *mut c_void, addr: u32) -> u32 {
    (*(ctx as *mut B)).read16(addr) as u32
}

unsafe extern "sysv64" fn read32_hook<B: Bus>(ctx: *mut c_void, addr: u32) -> u32 {
    (*(ctx as *mut B)).read32(addr)
}

unsafe extern "sysv64" fn write8_hook<B: Bus>(ctx: *mut c_void, addr: u32, value: u32) {
    (*(ctx as *mut B)).write8(addr, value as u8)
}

unsafe extern "sysv64" fn write16_hook<B: Bus>(ctx: *mut c_void, addr: u32, value: u32) {
    (*(ctx as *mut B)).write16(addr, value as u16)
}

unsafe extern "sysv64" fn write32_hook<B: Bus>(ctx: *mut c_void, addr: u32, value: u32) {
    (*(ctx as *mut B)).write32(addr, value)
}

unsafe extern "sysv64" fn muldiv_helper(cpu: *mut CpuState, op: u32, a: u32, b: u32) {
    let (hi, lo) = MulDivOp::from_u32(op).eval(a, b);
    (*cpu).hi = hi;
    (*cpu).lo = lo;
}

/// Compiled native code block
pub struct NativeBlock {
    /// Executable buffer containing x86_64 code
    code: ExecutableBuffer,
    /// Entry point inside `code`
    func: BlockFn,
}

impl NativeBlock {
    /// Execute the compiled block against the guest state
    pub fn execute<B: Bus>(&self, cpu: &mut CpuState, bus: &mut B) -> BlockOutcome {
        let hooks = MemoryHooks::new(bus);
        // The block only touches `cpu` through the offsets in CpuState and
        // `bus` through the hooks, both of which outlive the call.
        BlockOutcome(unsafe { (self.func)(cpu, &hooks) })
    }

    /// Size of the generated code in bytes
    pub fn code_size(&self) -> usize {
        self.code.len()
    }
}

/// Native x86_64 backend
pub struct DynasmCodegen;

impl DynasmCodegen {
    pub fn new() -> Self {
        DynasmCodegen
    }
}

impl Default for DynasmCodegen {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for DynasmCodegen {
    fn name(&self) -> &'static str {
        "dynasm"
    }

    fn is_ready(&self) -> bool {
        Assembler::new().is_ok()
    }

    fn assemble(&mut self, ops: &[HostOp]) -> Result<BlockCode, CodegenError> {
        validate(ops)?;
        compile_block(ops).map(BlockCode::Native)
    }
}

/// Map a slot to its x86_64 register, refusing the context pointer
fn host(reg: HostReg) -> Result<u8, CodegenError> {
    if reg == CONTEXT_POINTER || reg.index() >= SLOT_REGS.len() {
        return Err(CodegenError::BackendError(format!("slot {} is not allocatable", reg.0)));
    }
    Ok(SLOT_REGS[reg.index()])
}

fn gpr_off(reg: u8) -> i32 {
    CpuState::gpr_offset(reg & 0x1F) as i32
}

fn hilo_off(which: HiLo) -> i32 {
    match which {
        HiLo::Hi => CpuState::hi_offset() as i32,
        HiLo::Lo => CpuState::lo_offset() as i32,
    }
}

/// Compile an op list to native x86_64 code
pub fn compile_block(list: &[HostOp]) -> Result<NativeBlock, CodegenError> {
    let mut ops = Assembler::new().map_err(|e| CodegenError::BackendError(e.to_string()))?;
    let entry = ops.offset();

    dynasm!(ops
        ; push rbx
        ; push rbp
        ; push r12
        ; push r13
        ; push r14
        ; push r15
        ; sub rsp, 8
        ; mov r15, rdi
        ; mov [rsp], rsi
    );

    for op in list {
        emit_op(&mut ops, op)?;
    }

    let code = ops
        .finalize()
        .map_err(|_| CodegenError::BackendError("failed to finalize executable buffer".into()))?;
    let func: BlockFn = unsafe { mem::transmute(code.ptr(entry)) };

    Ok(NativeBlock { code, func })
}

fn load_operand(ops: &mut Assembler, scratch: u8, operand: Operand) -> Result<(), CodegenError> {
    match operand {
        Operand::Reg(r) => {
            let r = host(r)?;
            dynasm!(ops ; mov Rd(scratch), Rd(r));
        }
        Operand::Imm(v) => {
            dynasm!(ops ; mov Rd(scratch), v as i32);
        }
    }
    Ok(())
}

/// Call a hook from the `MemoryHooks` table; arguments are already in esi/edx
fn call_hook(ops: &mut Assembler, hook_off: i32) {
    dynasm!(ops
        ; mov rax, QWORD [rsp]
        ; mov rdi, QWORD [rax]
        ; call QWORD [rax + hook_off]
    );
}

fn emit_op(ops: &mut Assembler, op: &HostOp) -> Result<(), CodegenError> {
    match *op {
        HostOp::LoadGuest { dst, reg } => {
            let d = host(dst)?;
            let off = gpr_off(reg);
            dynasm!(ops ; mov Rd(d), DWORD [r15 + off]);
        }
        HostOp::StoreGuest { src, reg } => {
            let s = host(src)?;
            let off = gpr_off(reg);
            dynasm!(ops ; mov DWORD [r15 + off], Rd(s));
        }
        HostOp::StoreGuestImm { reg, value } => {
            let off = gpr_off(reg);
            dynasm!(ops ; mov DWORD [r15 + off], value as i32);
        }
        HostOp::MovImm { dst, value } => {
            let d = host(dst)?;
            dynasm!(ops ; mov Rd(d), value as i32);
        }
        HostOp::Alu { op, dst, lhs, rhs } => {
            let d = host(dst)?;
            load_operand(ops, EAX, lhs)?;
            load_operand(ops, ECX, rhs)?;
            match op {
                AluOp::Add => dynasm!(ops ; add eax, ecx),
                AluOp::Sub => dynasm!(ops ; sub eax, ecx),
                AluOp::And => dynasm!(ops ; and eax, ecx),
                AluOp::Or => dynasm!(ops ; or eax, ecx),
                AluOp::Xor => dynasm!(ops ; xor eax, ecx),
                AluOp::Nor => dynasm!(ops ; or eax, ecx ; not eax),
                AluOp::Slt => dynasm!(ops ; cmp eax, ecx ; setl al ; movzx eax, al),
                AluOp::Sltu => dynasm!(ops ; cmp eax, ecx ; setb al ; movzx eax, al),
                AluOp::Sll => dynasm!(ops ; shl eax, cl),
                AluOp::Srl => dynasm!(ops ; shr eax, cl),
                AluOp::Sra => dynasm!(ops ; sar eax, cl),
            }
            dynasm!(ops ; mov Rd(d), eax);
        }
        HostOp::LoadMem { kind, base, offset, slot } => {
            load_operand(ops, ESI, base)?;
            let offset = offset as i32;
            dynasm!(ops ; add esi, offset);
            let hook = match kind {
                LoadKind::Byte | LoadKind::ByteUnsigned => offset_of!(MemoryHooks, read8),
                LoadKind::Half | LoadKind::HalfUnsigned => offset_of!(MemoryHooks, read16),
                LoadKind::Word => offset_of!(MemoryHooks, read32),
            };
            call_hook(ops, hook as i32);
            match kind {
                LoadKind::Byte => dynasm!(ops ; movsx eax, al),
                LoadKind::Half => dynasm!(ops ; movsx eax, ax),
                _ => {}
            }
            let off = CpuState::delayed_load_offset(slot & 1) as i32;
            dynasm!(ops ; mov DWORD [r15 + off], eax);
        }
        HostOp::StoreMem { width, base, offset, src } => {
            load_operand(ops, EDX, src)?;
            load_operand(ops, ESI, base)?;
            let offset = offset as i32;
            dynasm!(ops ; add esi, offset);
            let hook = match width {
                StoreWidth::Byte => offset_of!(MemoryHooks, write8),
                StoreWidth::Half => offset_of!(MemoryHooks, write16),
                StoreWidth::Word => offset_of!(MemoryHooks, write32),
            };
            call_hook(ops, hook as i32);
        }
        HostOp::CommitDelayedLoad { dst, slot } => {
            let d = host(dst)?;
            let off = CpuState::delayed_load_offset(slot & 1) as i32;
            dynasm!(ops ; mov Rd(d), DWORD [r15 + off]);
        }
        HostOp::DeferDelayedLoad { reg, slot } => {
            let src = CpuState::delayed_load_offset(slot & 1) as i32;
            let value = CpuState::pending_load_value_offset() as i32;
            let target = CpuState::pending_load_reg_offset() as i32;
            dynasm!(ops
                ; mov eax, DWORD [r15 + src]
                ; mov DWORD [r15 + value], eax
                ; mov DWORD [r15 + target], reg as i32
            );
        }
        HostOp::LoadHiLo { dst, which } => {
            let d = host(dst)?;
            let off = hilo_off(which);
            dynasm!(ops ; mov Rd(d), DWORD [r15 + off]);
        }
        HostOp::StoreHiLo { src, which } => {
            load_operand(ops, EAX, src)?;
            let off = hilo_off(which);
            dynasm!(ops ; mov DWORD [r15 + off], eax);
        }
        HostOp::MulDiv { op, lhs, rhs } => {
            load_operand(ops, EDX, lhs)?;
            load_operand(ops, ECX, rhs)?;
            let helper = muldiv_helper as unsafe extern "sysv64" fn(*mut CpuState, u32, u32, u32);
            dynasm!(ops
                ; mov esi, op as i32
                ; mov rdi, r15
                ; mov rax, QWORD helper as usize as i64
                ; call rax
            );
        }
        HostOp::SetPc(target) => {
            load_operand(ops, EAX, target)?;
            let off = CpuState::pc_offset() as i32;
            dynasm!(ops ; mov DWORD [r15 + off], eax);
        }
        HostOp::BranchPc { cond, lhs, rhs, taken, not_taken } => {
            load_operand(ops, EAX, lhs)?;
            load_operand(ops, ECX, rhs)?;
            dynasm!(ops
                ; cmp eax, ecx
                ; mov eax, not_taken as i32
                ; mov edx, taken as i32
            );
            match cond {
                Cond::Eq => dynasm!(ops ; cmove eax, edx),
                Cond::Ne => dynasm!(ops ; cmovne eax, edx),
                Cond::Lt => dynasm!(ops ; cmovl eax, edx),
                Cond::Le => dynasm!(ops ; cmovle eax, edx),
                Cond::Gt => dynasm!(ops ; cmovg eax, edx),
                Cond::Ge => dynasm!(ops ; cmovge eax, edx),
            }
            let off = CpuState::pc_offset() as i32;
            dynasm!(ops ; mov DWORD [r15 + off], eax);
        }
        HostOp::Exit { cycles, fallback } => {
            let outcome = BlockOutcome::new(cycles, fallback).0 as i32;
            dynasm!(ops
                ; mov eax, outcome
                ; add rsp, 8
                ; pop r15
                ; pop r14
                ; pop r13
                ; pop r12
                ; pop rbp
                ; pop rbx
                ; ret
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Memory, RAM_SIZE_2MB};

    #[test]
    fn test_native_alu_block() {
        let ops = [
            HostOp::LoadGuest { dst: HostReg(0), reg: 4 },
            HostOp::Alu { op: AluOp::Sll, dst: HostReg(1), lhs: Operand::Reg(HostReg(0)), rhs: Operand::Imm(4) },
            HostOp::StoreGuest { src: HostReg(1), reg: 2 },
            HostOp::SetPc(Operand::Imm(0x8000_0040)),
            HostOp::Exit { cycles: 2, fallback: false },
        ];
        let block = compile_block(&ops).unwrap();
        assert!(block.code_size() > 0);
        let mut cpu = CpuState::new();
        let mut mem = Memory::new(RAM_SIZE_2MB);
        cpu.gpr[4] = 3;

        let outcome = block.execute(&mut cpu, &mut mem);
        assert_eq!(cpu.gpr[2], 48);
        assert_eq!(cpu.pc, 0x8000_0040);
        assert_eq!(outcome.cycles(), 2);
    }

    #[test]
    fn test_native_memory_hooks() {
        let ops = [
            HostOp::MovImm { dst: HostReg(2), value: 0x8000_1000 },
            HostOp::StoreMem { width: StoreWidth::Word, base: Operand::Reg(HostReg(2)), offset: 4, src: Operand::Imm(0xFFFF_FFF0) },
            HostOp::LoadMem { kind: LoadKind::Half, base: Operand::Reg(HostReg(2)), offset: 4, slot: 0 },
            HostOp::MulDiv { op: MulDivOp::Divu, lhs: Operand::Imm(7), rhs: Operand::Imm(2) },
            HostOp::Exit { cycles: 3, fallback: true },
        ];
        let block = compile_block(&ops).unwrap();
        let mut cpu = CpuState::new();
        let mut mem = Memory::new(RAM_SIZE_2MB);

        let outcome = block.execute(&mut cpu, &mut mem);
        assert_eq!(mem.read32(0x8000_1004), 0xFFFF_FFF0);
        assert_eq!(cpu.delayed_load_value[0], 0xFFFF_FFF0);
        assert_eq!((cpu.hi, cpu.lo), (1, 3));
        assert!(outcome.needs_fallback());
    }

    #[test]
    fn test_context_pointer_is_not_allocatable() {
        let ops = [
            HostOp::MovImm { dst: CONTEXT_POINTER, value: 0 },
            HostOp::Exit { cycles: 0, fallback: false },
        ];
        assert!(compile_block(&ops).is_err());
    }
}
