//! R3000A CPU module
//!
//! Architectural state shared by the interpreter and the recompiler. Compiled
//! blocks access this structure directly through byte offsets, so its layout
//! is fixed with `#[repr(C)]`.

pub mod asm;
pub mod decode;
pub mod dynarec;
pub mod interpreter;

use serde::{Serialize, Deserialize};
use std::mem::offset_of;

/// Reset vector (BIOS entry point in KSEG1)
pub const RESET_VECTOR: u32 = 0xBFC0_0000;

/// CPU state
#[repr(C)]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuState {
    /// General purpose registers ($zero..$ra)
    pub gpr: [u32; 32],
    /// Multiply/divide result registers
    pub hi: u32,
    pub lo: u32,
    /// Program counter of the next instruction to run
    pub pc: u32,
    /// Landing slots for loads issued by compiled code whose delay slot is
    /// still being compiled (indexed by the compiler's delayed-load slot)
    pub delayed_load_value: [u32; 2],
    /// Register targeted by a load whose delay slot has not executed yet (0 = none)
    pub pending_load_reg: u32,
    /// Value that load will deliver
    pub pending_load_value: u32,
    /// Guest instructions retired
    pub cycle: u64,
}

impl CpuState {
    pub fn new() -> Self {
        CpuState {
            gpr: [0u32; 32],
            hi: 0,
            lo: 0,
            pc: RESET_VECTOR,
            delayed_load_value: [0; 2],
            pending_load_reg: 0,
            pending_load_value: 0,
            cycle: 0,
        }
    }

    /// Read register ($zero always returns 0)
    #[inline(always)]
    pub fn read_reg(&self, reg: u8) -> u32 {
        if reg == 0 {
            0
        } else {
            self.gpr[reg as usize & 0x1F]
        }
    }

    /// Write register ($zero writes are ignored)
    #[inline(always)]
    pub fn write_reg(&mut self, reg: u8, value: u32) {
        if reg != 0 {
            self.gpr[reg as usize & 0x1F] = value;
        }
    }

    /// Is a load still waiting for its delay slot to execute?
    #[inline(always)]
    pub fn has_pending_load(&self) -> bool {
        self.pending_load_reg != 0
    }

    /// Reset CPU state
    pub fn reset(&mut self) {
        *self = CpuState::new();
    }

    // Byte offsets used by the code emitter

    pub const fn gpr_offset(reg: u8) -> usize {
        offset_of!(CpuState, gpr) + (reg as usize) * 4
    }

    pub const fn hi_offset() -> usize {
        offset_of!(CpuState, hi)
    }

    pub const fn lo_offset() -> usize {
        offset_of!(CpuState, lo)
    }

    pub const fn pc_offset() -> usize {
        offset_of!(CpuState, pc)
    }

    pub const fn delayed_load_offset(slot: u8) -> usize {
        offset_of!(CpuState, delayed_load_value) + (slot as usize) * 4
    }

    pub const fn pending_load_reg_offset() -> usize {
        offset_of!(CpuState, pending_load_reg)
    }

    pub const fn pending_load_value_offset() -> usize {
        offset_of!(CpuState, pending_load_value)
    }
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}
