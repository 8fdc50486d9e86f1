//! Register allocator
//!
//! Maps the 32 guest registers onto `ALLOCATEABLE_REG_COUNT` host slots for
//! the duration of one block. Registers whose value is known at compile time
//! stay unbound as constants and are only materialized when an operation needs
//! them in a register. Bound registers are written back lazily: on eviction or
//! at `flush_all`.

use super::codegen::{Emitter, HostOp, HostReg, ALLOCATEABLE_REG_COUNT};

/// Most registers a single allocation request may name
pub const MAX_JOINT_REQUEST: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegState {
    Unknown,
    Constant,
}

/// Compile-time view of one guest register
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Register {
    /// Known value when `state == Constant`
    pub val: u32,
    pub state: RegState,
    /// Host slot holding the register, if bound
    pub allocated: Option<HostReg>,
    /// Host copy differs from the guest register file
    pub writeback: bool,
}

impl Register {
    const UNKNOWN: Register = Register {
        val: 0,
        state: RegState::Unknown,
        allocated: None,
        writeback: false,
    };

    const ZERO: Register = Register {
        val: 0,
        state: RegState::Constant,
        allocated: None,
        writeback: false,
    };

    #[inline(always)]
    pub fn is_const(&self) -> bool {
        self.state == RegState::Constant
    }
}

pub struct RegAlloc {
    registers: [Register; 32],
    /// Slot -> guest register index
    host_mappings: [Option<u8>; ALLOCATEABLE_REG_COUNT],
    reserved: [bool; ALLOCATEABLE_REG_COUNT],
    /// Allocation stamp per slot, for least-recently-allocated eviction
    stamps: [u64; ALLOCATEABLE_REG_COUNT],
    clock: u64,
}

impl Default for RegAlloc {
    fn default() -> Self {
        Self::new()
    }
}

impl RegAlloc {
    pub fn new() -> Self {
        let mut alloc = RegAlloc {
            registers: [Register::UNKNOWN; 32],
            host_mappings: [None; ALLOCATEABLE_REG_COUNT],
            reserved: [false; ALLOCATEABLE_REG_COUNT],
            stamps: [0; ALLOCATEABLE_REG_COUNT],
            clock: 0,
        };
        alloc.reset();
        alloc
    }

    /// Forget everything; called at the start of every block
    pub fn reset(&mut self) {
        self.registers = [Register::UNKNOWN; 32];
        self.registers[0] = Register::ZERO;
        self.host_mappings = [None; ALLOCATEABLE_REG_COUNT];
        self.reserved = [false; ALLOCATEABLE_REG_COUNT];
        self.stamps = [0; ALLOCATEABLE_REG_COUNT];
        self.clock = 0;
    }

    #[inline(always)]
    pub fn register(&self, index: u8) -> &Register {
        &self.registers[index as usize & 0x1F]
    }

    /// Known value of a constant register
    #[inline(always)]
    pub fn constant(&self, index: u8) -> Option<u32> {
        let reg = self.register(index);
        reg.is_const().then_some(reg.val)
    }

    pub fn host_mapping(&self, slot: HostReg) -> Option<u8> {
        self.host_mappings[slot.index()]
    }

    pub fn is_reserved(&self, slot: HostReg) -> bool {
        self.reserved[slot.index()]
    }

    /// Bind every requested register to a host slot
    ///
    /// The request is joint: no register named in `regs` is evicted to make
    /// room for another one. Duplicates resolve to the same slot.
    pub fn allocate<const N: usize>(&mut self, e: &mut Emitter, regs: [u8; N]) -> [HostReg; N] {
        let mut pinned = self.pin(&regs, None);
        let out = self.bind_sources(e, &regs, &mut pinned);
        self.check();
        out
    }

    /// Joint request where `dst` is written rather than read
    ///
    /// `dst` is only loaded if it is also one of `srcs`. On return it is
    /// Unknown and dirty.
    pub fn allocate_with_dest<const N: usize>(
        &mut self,
        e: &mut Emitter,
        srcs: [u8; N],
        dst: u8,
    ) -> ([HostReg; N], HostReg) {
        debug_assert!(dst != 0, "$zero is never a destination");
        let mut pinned = self.pin(&srcs, Some(dst));
        let out = self.bind_sources(e, &srcs, &mut pinned);

        let d = dst as usize & 0x1F;
        let slot = match self.registers[d].allocated {
            Some(slot) => slot,
            None => {
                let slot = self.pick_slot(e, &pinned);
                self.bind(dst, slot);
                slot
            }
        };
        self.touch(slot);
        let reg = &mut self.registers[d];
        reg.state = RegState::Unknown;
        reg.writeback = true;

        self.check();
        (out, slot)
    }

    /// Pin a host slot for a fixed role, spilling whatever it held
    pub fn reserve(&mut self, e: &mut Emitter, slot: HostReg) {
        self.evict(e, slot);
        self.reserved[slot.index()] = true;
        debug_assert!(
            self.reserved.iter().filter(|r| !**r).count() >= MAX_JOINT_REQUEST + 1,
            "too many reserved host registers"
        );
        self.check();
    }

    /// Record a known value; any host copy is dropped without writeback
    pub fn mark_const(&mut self, index: u8, value: u32) {
        if index == 0 {
            return;
        }
        self.unbind(index);
        let reg = &mut self.registers[index as usize & 0x1F];
        reg.state = RegState::Constant;
        reg.val = value;
        reg.writeback = false;
        self.check();
    }

    /// Drop the constant tag, storing the value to the guest register file
    /// first; later uses load it into a host register
    pub fn mark_unknown(&mut self, e: &mut Emitter, index: u8) {
        if index == 0 {
            return;
        }
        let reg = &mut self.registers[index as usize & 0x1F];
        if reg.is_const() {
            e.push(HostOp::StoreGuestImm { reg: index, value: reg.val });
            reg.state = RegState::Unknown;
        }
        self.check();
    }

    pub fn set_writeback(&mut self, index: u8, writeback: bool) {
        let reg = &mut self.registers[index as usize & 0x1F];
        reg.writeback = writeback && reg.allocated.is_some() && index != 0;
    }

    /// Store every constant and dirty register, then clear all bindings
    pub fn flush_all(&mut self, e: &mut Emitter) {
        for index in 1..32u8 {
            let reg = self.registers[index as usize];
            match (reg.state, reg.allocated) {
                (RegState::Constant, _) => e.push(HostOp::StoreGuestImm { reg: index, value: reg.val }),
                (RegState::Unknown, Some(src)) if reg.writeback => {
                    e.push(HostOp::StoreGuest { src, reg: index })
                }
                _ => {}
            }
            self.registers[index as usize] = Register::UNKNOWN;
        }
        self.registers[0] = Register::ZERO;
        self.host_mappings = [None; ALLOCATEABLE_REG_COUNT];
        self.check();
    }

    /// Is any register still waiting for writeback?
    pub fn has_dirty(&self) -> bool {
        self.registers.iter().any(|r| r.writeback)
    }

    /// Cross-check the binding table against the register array
    pub fn is_consistent(&self) -> bool {
        for (slot, mapping) in self.host_mappings.iter().enumerate() {
            if let Some(index) = *mapping {
                if self.reserved[slot] {
                    return false;
                }
                if self.registers[index as usize].allocated != Some(HostReg(slot as u8)) {
                    return false;
                }
            }
        }
        let registers_ok = self.registers.iter().enumerate().all(|(index, reg)| {
            let binding_ok = match reg.allocated {
                Some(slot) => self.host_mappings[slot.index()] == Some(index as u8),
                None => !reg.writeback,
            };
            let const_ok = !(reg.is_const() && reg.allocated.is_some());
            binding_ok && const_ok
        });
        // $zero is either the constant 0 or a clean materialized copy of it
        let zero = &self.registers[0];
        let zero_ok = !zero.writeback && (!zero.is_const() || zero.val == 0);
        registers_ok && zero_ok
    }

    #[inline(always)]
    fn check(&self) {
        debug_assert!(self.is_consistent(), "register allocator state out of sync");
    }

    /// Slots already holding requested registers must not be evicted
    fn pin(&self, regs: &[u8], extra: Option<u8>) -> [bool; ALLOCATEABLE_REG_COUNT] {
        debug_assert!(regs.len() <= MAX_JOINT_REQUEST);
        let mut pinned = [false; ALLOCATEABLE_REG_COUNT];
        for &index in regs.iter().chain(extra.iter()) {
            if let Some(slot) = self.register(index).allocated {
                pinned[slot.index()] = true;
            }
        }
        pinned
    }

    fn bind_sources<const N: usize>(
        &mut self,
        e: &mut Emitter,
        regs: &[u8; N],
        pinned: &mut [bool; ALLOCATEABLE_REG_COUNT],
    ) -> [HostReg; N] {
        let mut out = [HostReg(0); N];
        for (i, &index) in regs.iter().enumerate() {
            let slot = match self.register(index).allocated {
                Some(slot) => slot,
                None => {
                    let slot = self.pick_slot(e, pinned);
                    self.bind(index, slot);
                    let reg = &mut self.registers[index as usize & 0x1F];
                    if reg.is_const() {
                        e.push(HostOp::MovImm { dst: slot, value: reg.val });
                        reg.state = RegState::Unknown;
                        // The guest file may not hold the constant yet
                        reg.writeback = index != 0;
                    } else {
                        e.push(HostOp::LoadGuest { dst: slot, reg: index });
                    }
                    slot
                }
            };
            pinned[slot.index()] = true;
            self.touch(slot);
            out[i] = slot;
        }
        out
    }

    /// Free slot with the lowest index, else the least recently allocated one
    fn pick_slot(&mut self, e: &mut Emitter, pinned: &[bool; ALLOCATEABLE_REG_COUNT]) -> HostReg {
        let usable = |slot: usize| !pinned[slot] && !self.reserved[slot];
        if let Some(slot) = (0..ALLOCATEABLE_REG_COUNT).find(|&s| usable(s) && self.host_mappings[s].is_none()) {
            return HostReg(slot as u8);
        }
        let victim = (0..ALLOCATEABLE_REG_COUNT)
            .filter(|&s| usable(s))
            .min_by_key(|&s| self.stamps[s]);
        debug_assert!(victim.is_some(), "joint request larger than the unreserved host register pool");
        let victim = HostReg(victim.unwrap_or(0) as u8);
        self.evict(e, victim);
        victim
    }

    /// Spill the occupant of a slot, if any
    fn evict(&mut self, e: &mut Emitter, slot: HostReg) {
        if let Some(index) = self.host_mappings[slot.index()] {
            let reg = &mut self.registers[index as usize];
            if reg.writeback {
                e.push(HostOp::StoreGuest { src: slot, reg: index });
            }
            reg.allocated = None;
            reg.writeback = false;
            self.host_mappings[slot.index()] = None;
        }
    }

    fn bind(&mut self, index: u8, slot: HostReg) {
        debug_assert!(self.host_mappings[slot.index()].is_none());
        self.host_mappings[slot.index()] = Some(index & 0x1F);
        self.registers[index as usize & 0x1F].allocated = Some(slot);
    }

    fn unbind(&mut self, index: u8) {
        let reg = &mut self.registers[index as usize & 0x1F];
        if let Some(slot) = reg.allocated.take() {
            self.host_mappings[slot.index()] = None;
        }
        reg.writeback = false;
    }

    fn touch(&mut self, slot: HostReg) {
        self.clock += 1;
        self.stamps[slot.index()] = self.clock;
    }
}
