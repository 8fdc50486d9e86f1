//! Block compiler
//!
//! Walks guest code from a start address, hands each instruction to its
//! handler and finalizes the block when a control transfer and its delay slot
//! have been compiled, when the next instruction cannot be compiled, or when
//! the block reaches `MAX_BLOCK_SIZE` instructions.
//!
//! Load delay slots are tracked with a pair of slots that alternate every
//! instruction. A load arms the current slot; the next instruction may cancel
//! it by writing the same register; after that instruction retires the value
//! is committed.

use super::codegen::{Emitter, HostOp, HostReg, Operand, CONTEXT_POINTER};
use super::handlers::{lookup, rec_unknown, OpKind};
use super::regalloc::RegAlloc;
use crate::cpu::decode::Instruction;
use crate::memory::Bus;

/// Most guest instructions in one block
pub const MAX_BLOCK_SIZE: u32 = 30;

/// One half of the delayed-load pair
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DelayedLoad {
    /// Target guest register
    pub index: u8,
    pub active: bool,
}

/// Why a block stopped growing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockEnd {
    /// Control transfer plus delay slot
    Branch,
    /// Hit `MAX_BLOCK_SIZE` or the end of the region
    SizeLimit,
    /// Next instruction has to be interpreted
    Unknown,
}

/// Result of compiling one block
pub struct BlockBuild {
    pub start: u32,
    /// Guest instruction words covered
    pub len: u32,
    pub end: BlockEnd,
    pub ops: Vec<HostOp>,
}

pub struct BlockCompiler {
    pub(crate) emitter: Emitter,
    pub(crate) regs: RegAlloc,
    delayed_loads: [DelayedLoad; 2],
    current_delayed_load: usize,
    /// Address of the instruction being compiled
    pub(crate) pc: u32,
    /// A control transfer already stored the next pc
    pub(crate) pc_written: bool,
}

impl Default for BlockCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockCompiler {
    pub fn new() -> Self {
        BlockCompiler {
            emitter: Emitter::new(),
            regs: RegAlloc::new(),
            delayed_loads: [DelayedLoad::default(); 2],
            current_delayed_load: 0,
            pc: 0,
            pc_written: false,
        }
    }

    fn begin(&mut self, start: u32) {
        self.emitter.clear();
        self.regs.reset();
        self.regs.reserve(&mut self.emitter, CONTEXT_POINTER);
        self.delayed_loads = [DelayedLoad::default(); 2];
        self.current_delayed_load = 0;
        self.pc = start;
        self.pc_written = false;
    }

    /// Compile the block starting at `start`, at most `limit` instructions long
    pub fn compile<B: Bus + ?Sized>(&mut self, bus: &mut B, start: u32, limit: u32) -> BlockBuild {
        self.begin(start);
        let limit = limit.clamp(1, MAX_BLOCK_SIZE);
        let mut count = 0u32;

        let end = loop {
            if count >= limit {
                break BlockEnd::SizeLimit;
            }
            let inst = Instruction::new(bus.read32(self.pc));
            let entry = lookup(inst);

            match entry.kind {
                OpKind::Unknown => break BlockEnd::Unknown,
                OpKind::Plain => {
                    (entry.handler)(self, inst);
                    self.end_instruction();
                    count += 1;
                }
                OpKind::Branch => {
                    if count + 2 > limit {
                        break BlockEnd::SizeLimit;
                    }
                    let slot = Instruction::new(bus.read32(self.pc.wrapping_add(4)));
                    let slot_entry = lookup(slot);
                    if slot_entry.kind != OpKind::Plain {
                        tracing::trace!(
                            "delay slot {:#010x} at {:#010x} needs the interpreter",
                            slot.raw,
                            self.pc.wrapping_add(4)
                        );
                        break BlockEnd::Unknown;
                    }
                    (entry.handler)(self, inst);
                    self.end_instruction();
                    (slot_entry.handler)(self, slot);
                    self.end_instruction();
                    count += 2;
                    break BlockEnd::Branch;
                }
            }
        };

        if count == 0 {
            return self.fallback_stub(bus, start);
        }
        if end == BlockEnd::Unknown {
            tracing::trace!("block {:#010x} stops before {:#010x}", start, self.pc);
        }
        self.finalize(count, end == BlockEnd::Unknown);

        BlockBuild {
            start,
            len: count,
            end,
            ops: self.emitter.ops().to_vec(),
        }
    }

    /// Block for an address whose first instruction has to be interpreted
    fn fallback_stub<B: Bus + ?Sized>(&mut self, bus: &mut B, start: u32) -> BlockBuild {
        let inst = Instruction::new(bus.read32(start));
        self.emitter.clear();
        self.pc = start;
        rec_unknown(self, inst);

        BlockBuild {
            start,
            // a branch stub also depends on its delay slot
            len: if inst.is_control_transfer() { 2 } else { 1 },
            end: BlockEnd::Unknown,
            ops: self.emitter.ops().to_vec(),
        }
    }

    /// Retire one instruction: commit the previous load, advance the pair
    fn end_instruction(&mut self) {
        let other = self.current_delayed_load ^ 1;
        let pending = self.delayed_loads[other];
        if pending.active {
            let (_, dst) = self.regs.allocate_with_dest(&mut self.emitter, [], pending.index);
            self.emitter.push(HostOp::CommitDelayedLoad { dst, slot: other as u8 });
            self.delayed_loads[other].active = false;
        }
        self.current_delayed_load = other;
        self.pc = self.pc.wrapping_add(4);
    }

    fn finalize(&mut self, count: u32, fallback: bool) {
        // A load issued by the last instruction is still in flight
        for slot in 0..2 {
            let load = self.delayed_loads[slot];
            if load.active {
                self.emitter.push(HostOp::DeferDelayedLoad { reg: load.index, slot: slot as u8 });
                self.delayed_loads[slot].active = false;
            }
        }
        self.regs.flush_all(&mut self.emitter);
        if !self.pc_written {
            self.emitter.push(HostOp::SetPc(Operand::Imm(self.pc)));
        }
        self.emitter.push(HostOp::Exit { cycles: count, fallback });
    }

    /// Arm the current slot for a load into `index`
    pub(crate) fn arm_delayed_load(&mut self, index: u8) -> u8 {
        let slot = self.current_delayed_load;
        if index != 0 {
            self.maybe_cancel_delayed_load(index);
            self.delayed_loads[slot] = DelayedLoad { index, active: true };
        }
        slot as u8
    }

    /// A write to `index` supersedes a load into it still waiting in the other slot
    pub(crate) fn maybe_cancel_delayed_load(&mut self, index: u8) {
        let other = self.current_delayed_load ^ 1;
        if self.delayed_loads[other].active && self.delayed_loads[other].index == index {
            self.delayed_loads[other].active = false;
        }
    }

    // Operand helpers shared by the handlers. Constants become immediates;
    // everything else is allocated jointly.

    pub(crate) fn operand(&mut self, reg: u8) -> Operand {
        match self.regs.constant(reg) {
            Some(value) => Operand::Imm(value),
            None => {
                let [h] = self.regs.allocate(&mut self.emitter, [reg]);
                Operand::Reg(h)
            }
        }
    }

    pub(crate) fn operand_pair(&mut self, a: u8, b: u8) -> (Operand, Operand) {
        match (self.regs.constant(a), self.regs.constant(b)) {
            (Some(x), Some(y)) => (Operand::Imm(x), Operand::Imm(y)),
            (Some(x), None) => (Operand::Imm(x), self.operand(b)),
            (None, Some(y)) => (self.operand(a), Operand::Imm(y)),
            (None, None) => {
                let [ha, hb] = self.regs.allocate(&mut self.emitter, [a, b]);
                (Operand::Reg(ha), Operand::Reg(hb))
            }
        }
    }

    /// Source operand plus a host register for the written `dst`
    pub(crate) fn operand_with_dest(&mut self, src: u8, dst: u8) -> (Operand, HostReg) {
        self.maybe_cancel_delayed_load(dst);
        match self.regs.constant(src) {
            Some(value) => {
                let (_, d) = self.regs.allocate_with_dest(&mut self.emitter, [], dst);
                (Operand::Imm(value), d)
            }
            None => {
                let ([s], d) = self.regs.allocate_with_dest(&mut self.emitter, [src], dst);
                (Operand::Reg(s), d)
            }
        }
    }

    pub(crate) fn operand_pair_with_dest(&mut self, a: u8, b: u8, dst: u8) -> (Operand, Operand, HostReg) {
        self.maybe_cancel_delayed_load(dst);
        let e = &mut self.emitter;
        match (self.regs.constant(a), self.regs.constant(b)) {
            (Some(x), Some(y)) => {
                let (_, d) = self.regs.allocate_with_dest(e, [], dst);
                (Operand::Imm(x), Operand::Imm(y), d)
            }
            (Some(x), None) => {
                let ([hb], d) = self.regs.allocate_with_dest(e, [b], dst);
                (Operand::Imm(x), Operand::Reg(hb), d)
            }
            (None, Some(y)) => {
                let ([ha], d) = self.regs.allocate_with_dest(e, [a], dst);
                (Operand::Reg(ha), Operand::Imm(y), d)
            }
            (None, None) => {
                let ([ha, hb], d) = self.regs.allocate_with_dest(e, [a, b], dst);
                (Operand::Reg(ha), Operand::Reg(hb), d)
            }
        }
    }

    /// Host register for a `dst` that is written without being read
    pub(crate) fn dest(&mut self, dst: u8) -> HostReg {
        self.maybe_cancel_delayed_load(dst);
        let (_, d) = self.regs.allocate_with_dest(&mut self.emitter, [], dst);
        d
    }

    /// Record a compile-time result for `dst`
    pub(crate) fn set_const(&mut self, dst: u8, value: u32) {
        if dst == 0 {
            return;
        }
        self.maybe_cancel_delayed_load(dst);
        self.regs.mark_const(dst, value);
    }

    pub(crate) fn emit(&mut self, op: HostOp) {
        self.emitter.push(op);
    }
}
