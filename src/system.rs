//! System orchestrator
//!
//! Brings together the CPU state, memory and the recompiler

use crate::config::DynarecConfig;
use crate::cpu::dynarec::{Dynarec, DynarecError, Machine};
use crate::cpu::interpreter::Exception;
use crate::cpu::CpuState;
use crate::memory::{Bus, Memory, MemoryError};
use crate::snapshot::{Snapshot, SnapshotError};

/// Why `run` returned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunExit {
    /// The cycle budget is used up
    CycleBudget,
    /// A block boundary landed on the requested pc
    HaltPc(u32),
    /// The interpreter raised an exception; pc still points at the instruction
    Exception { pc: u32, exception: Exception },
}

pub struct System {
    pub cpu: CpuState,
    memory: Memory,
    dynarec: Dynarec,
}

impl System {
    /// Create a system with empty RAM and BIOS and an initialized recompiler
    pub fn new(config: DynarecConfig) -> Result<Self, DynarecError> {
        let memory = Memory::new(config.ram_size());
        let mut dynarec = Dynarec::new(config);
        dynarec.init()?;
        Ok(System {
            cpu: CpuState::new(),
            memory,
            dynarec,
        })
    }

    pub fn config(&self) -> &DynarecConfig {
        self.dynarec.config()
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn dynarec(&self) -> &Dynarec {
        &self.dynarec
    }

    /// Install a BIOS image; all compiled code is dropped
    pub fn load_bios(&mut self, image: &[u8]) -> Result<(), MemoryError> {
        self.memory.load_bios(image)?;
        self.dynarec.invalidate_all();
        Ok(())
    }

    /// Load a binary into memory at `addr`
    pub fn load_binary(&mut self, data: &[u8], addr: u32) -> Result<(), MemoryError> {
        self.memory.load_binary(data, addr)?;
        self.dynarec.clear(addr, data.len() as u32);
        tracing::debug!("loaded {} bytes at {:#010x}", data.len(), addr);
        Ok(())
    }

    /// Reset the CPU and throw away every compiled block
    pub fn reset(&mut self) -> Result<(), DynarecError> {
        self.dynarec.reset(&mut self.cpu)
    }

    /// Run for at most `max_cycles` guest instructions
    pub fn run(&mut self, max_cycles: u64) -> Result<RunExit, DynarecError> {
        self.run_inner(max_cycles, None)
    }

    /// Run until a block starts at `pc`, or the budget runs out
    pub fn run_until(&mut self, pc: u32, max_cycles: u64) -> Result<RunExit, DynarecError> {
        self.run_inner(max_cycles, Some(pc))
    }

    fn run_inner(&mut self, max_cycles: u64, halt_pc: Option<u32>) -> Result<RunExit, DynarecError> {
        let mut ctx = RunContext {
            memory: &mut self.memory,
            until_cycle: self.cpu.cycle.saturating_add(max_cycles),
            halt_pc,
            exception: None,
        };
        self.dynarec.execute(&mut self.cpu, &mut ctx)?;

        if let Some((pc, exception)) = ctx.exception {
            return Ok(RunExit::Exception { pc, exception });
        }
        match halt_pc {
            Some(pc) if self.cpu.pc == pc => Ok(RunExit::HaltPc(pc)),
            _ => Ok(RunExit::CycleBudget),
        }
    }

    pub fn save_state(&self) -> Snapshot {
        Snapshot::capture(self.dynarec.config(), &self.cpu, &self.memory)
    }

    /// Restore from a snapshot taken with the same RAM configuration
    pub fn load_state(&mut self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        snapshot.check_compatible(self.dynarec.config())?;
        self.memory.restore_ram(&snapshot.ram).map_err(|_| SnapshotError::RamSize {
            expected: self.memory.ram_size(),
            actual: snapshot.ram.len(),
        })?;
        self.cpu = snapshot.cpu.clone();
        self.dynarec.invalidate_all();
        tracing::debug!("state restored at pc {:#010x}", self.cpu.pc);
        Ok(())
    }
}

/// Machine view handed to the dispatcher for one `run` call
struct RunContext<'a> {
    memory: &'a mut Memory,
    until_cycle: u64,
    halt_pc: Option<u32>,
    exception: Option<(u32, Exception)>,
}

impl<'a> Bus for RunContext<'a> {
    #[inline]
    fn read8(&mut self, addr: u32) -> u8 {
        self.memory.read8(addr)
    }

    #[inline]
    fn write8(&mut self, addr: u32, value: u8) {
        self.memory.write8(addr, value)
    }

    #[inline]
    fn read16(&mut self, addr: u32) -> u16 {
        self.memory.read16(addr)
    }

    #[inline]
    fn write16(&mut self, addr: u32, value: u16) {
        self.memory.write16(addr, value)
    }

    #[inline]
    fn read32(&mut self, addr: u32) -> u32 {
        self.memory.read32(addr)
    }

    #[inline]
    fn write32(&mut self, addr: u32, value: u32) {
        self.memory.write32(addr, value)
    }

    fn drain_code_writes(&mut self, sink: &mut dyn FnMut(u32, u32)) {
        self.memory.drain_code_writes(sink)
    }
}

impl<'a> Machine for RunContext<'a> {
    fn has_to_run(&self, cpu: &CpuState) -> bool {
        self.exception.is_none() && cpu.cycle < self.until_cycle && self.halt_pc != Some(cpu.pc)
    }

    fn on_exception(&mut self, cpu: &mut CpuState, exception: Exception) {
        tracing::debug!("{} at {:#010x}, stopping", exception, cpu.pc);
        self.exception = Some((cpu.pc, exception));
    }
}
