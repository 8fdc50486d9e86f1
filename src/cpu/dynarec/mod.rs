//! Dynamic recompiler
//!
//! Guest code is compiled block by block on first execution and cached in
//! per-region block pointer arrays reached through a page-granular dispatch
//! LUT. The dispatcher resolves the guest pc, compiles on a miss and invokes
//! the block, which stores the next pc itself.

pub mod codegen;
pub mod compiler;
pub mod handlers;
pub mod lut;
pub mod regalloc;

use thiserror::Error;

use crate::config::{BackendKind, DynarecConfig};
use crate::cpu::{interpreter, CpuState};
use crate::memory::Bus;
use codegen::{Backend, CodegenError, CompiledBlock};
use compiler::{BlockCompiler, MAX_BLOCK_SIZE};
use lut::CodeCache;

pub use lut::BlockId;

#[derive(Debug, Error)]
pub enum DynarecError {
    #[error("failed to allocate {what}")]
    Allocation { what: &'static str },
    #[error("code emitter is not available")]
    EmitterUnavailable,
    #[error("recompiler is not initialized")]
    NotInitialized,
    #[error("attempted to execute from unmapped address {0:#010x}")]
    InvalidPc(u32),
    #[error("misaligned pc {0:#010x}")]
    MisalignedPc(u32),
    #[error(transparent)]
    Codegen(#[from] CodegenError),
}

/// What the dispatcher needs from the machine it runs on
pub trait Machine: Bus {
    /// Checked once per block
    fn has_to_run(&self, cpu: &CpuState) -> bool;

    /// Execute one instruction (a control transfer together with its delay slot)
    fn interpret(&mut self, cpu: &mut CpuState) {
        if let Err(exception) = interpreter::step(cpu, self) {
            self.on_exception(cpu, exception);
        }
    }

    /// Guest exception raised by the interpreter; by default the faulting
    /// instruction is skipped
    fn on_exception(&mut self, cpu: &mut CpuState, exception: interpreter::Exception) {
        tracing::warn!("{} at {:#010x}, skipping", exception, cpu.pc);
        cpu.pc = cpu.pc.wrapping_add(4);
    }
}

/// Counters for the current session
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DynarecStats {
    pub compiled: u64,
    pub dispatched: u64,
    pub interpreted: u64,
    pub invalidated: u64,
}

pub struct Dynarec {
    config: DynarecConfig,
    cache: Option<CodeCache>,
    backend: Option<Box<dyn Backend>>,
    compiler: BlockCompiler,
    stats: DynarecStats,
}

fn make_backend(kind: BackendKind) -> Result<Box<dyn Backend>, DynarecError> {
    match kind {
        BackendKind::Interp => Ok(Box::new(codegen::DefaultCodegen::new())),
        #[cfg(all(feature = "jit-dynasm", target_arch = "x86_64"))]
        BackendKind::Native => Ok(Box::new(codegen::dynasm::DynasmCodegen::new())),
        #[cfg(not(all(feature = "jit-dynasm", target_arch = "x86_64")))]
        BackendKind::Native => Err(DynarecError::EmitterUnavailable),
    }
}

impl Dynarec {
    pub fn new(config: DynarecConfig) -> Self {
        Dynarec {
            config,
            cache: None,
            backend: None,
            compiler: BlockCompiler::new(),
            stats: DynarecStats::default(),
        }
    }

    pub fn config(&self) -> &DynarecConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.cache.is_some()
    }

    /// Allocate the LUT and block pointer arrays and bring up the backend
    pub fn init(&mut self) -> Result<(), DynarecError> {
        let backend = make_backend(self.config.backend)?;
        if !backend.is_ready() {
            tracing::error!("{} backend is not ready", backend.name());
            return Err(DynarecError::EmitterUnavailable);
        }
        let cache = CodeCache::new(self.config.ram_size()).map_err(|e| {
            tracing::error!("recompiler init failed: {}", e);
            e
        })?;

        tracing::debug!(
            "recompiler ready: {} backend, {} RAM slots, {} BIOS slots",
            backend.name(),
            cache.ram_slot_count(),
            cache.bios_slot_count()
        );
        self.cache = Some(cache);
        self.backend = Some(backend);
        self.stats = DynarecStats::default();
        Ok(())
    }

    /// Reset the guest registers, then tear down and reallocate everything
    pub fn reset(&mut self, cpu: &mut CpuState) -> Result<(), DynarecError> {
        cpu.reset();
        self.shutdown();
        self.init()
    }

    /// Release the LUT, the block arrays and every compiled block
    pub fn shutdown(&mut self) {
        if self.cache.take().is_some() {
            tracing::debug!("recompiler shut down");
        }
        self.backend = None;
    }

    /// Run until the machine says stop
    pub fn execute<M: Machine>(&mut self, cpu: &mut CpuState, machine: &mut M) -> Result<(), DynarecError> {
        if !self.is_initialized() {
            return Err(DynarecError::NotInitialized);
        }
        while machine.has_to_run(cpu) {
            self.step(cpu, machine)?;
        }
        Ok(())
    }

    /// Dispatch one block (or one interpreted instruction)
    pub fn step<M: Machine>(&mut self, cpu: &mut CpuState, machine: &mut M) -> Result<(), DynarecError> {
        if self.cache.is_none() {
            return Err(DynarecError::NotInitialized);
        }

        if cpu.has_pending_load() {
            // The next instruction must see the load retire after it
            machine.interpret(cpu);
            self.stats.interpreted += 1;
            self.sync_code_writes(machine);
            return Ok(());
        }

        let pc = cpu.pc;
        if pc & 3 != 0 {
            tracing::error!("fatal: misaligned pc {:#010x}", pc);
            return Err(DynarecError::MisalignedPc(pc));
        }

        let id = match self.lookup_id(pc) {
            Ok(Some(id)) => id,
            Ok(None) => self.compile(pc, machine)?,
            Err(e) => {
                tracing::error!("fatal: {}", e);
                return Err(e);
            }
        };

        let Some(block) = self.cache.as_ref().and_then(|cache| cache.block(id)) else {
            return Err(DynarecError::NotInitialized);
        };
        let outcome = block.invoke(cpu, machine);
        cpu.cycle += outcome.cycles() as u64;
        self.stats.dispatched += 1;

        if outcome.needs_fallback() {
            machine.interpret(cpu);
            self.stats.interpreted += 1;
        }

        self.sync_code_writes(machine);
        Ok(())
    }

    fn lookup_id(&self, pc: u32) -> Result<Option<BlockId>, DynarecError> {
        self.cache
            .as_ref()
            .ok_or(DynarecError::NotInitialized)?
            .resolve(pc)
    }

    fn compile<B: Bus>(&mut self, pc: u32, bus: &mut B) -> Result<BlockId, DynarecError> {
        let (Some(cache), Some(backend)) = (self.cache.as_mut(), self.backend.as_mut()) else {
            return Err(DynarecError::NotInitialized);
        };

        let limit = cache.words_remaining(pc)?.min(MAX_BLOCK_SIZE);
        let build = self.compiler.compile(bus, pc, limit);
        let code = backend.assemble(&build.ops)?;
        tracing::trace!(
            "compiled {:#010x}: {} instructions, {} ops, {:?}",
            pc,
            build.len,
            build.ops.len(),
            build.end
        );

        let id = cache.install(pc, CompiledBlock { start: build.start, len: build.len, code })?;
        self.stats.compiled += 1;
        Ok(id)
    }

    /// Invalidate blocks touched by guest stores since the last block
    fn sync_code_writes<B: Bus>(&mut self, bus: &mut B) {
        let Some(cache) = self.cache.as_mut() else {
            return;
        };
        let mut freed = 0;
        bus.drain_code_writes(&mut |addr, size| freed += cache.invalidate(addr, size));
        if freed > 0 {
            tracing::trace!("self-modifying code: dropped {} blocks", freed);
            self.stats.invalidated += freed as u64;
        }
    }

    /// Drop compiled code covering `[addr, addr + size)`
    pub fn clear(&mut self, addr: u32, size: u32) {
        if let Some(cache) = self.cache.as_mut() {
            let freed = cache.invalidate(addr, size);
            self.stats.invalidated += freed as u64;
        }
    }

    pub fn invalidate_all(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            cache.invalidate_all();
        }
    }

    pub fn is_pc_valid(&self, addr: u32) -> bool {
        self.cache.as_ref().is_some_and(|cache| cache.is_pc_valid(addr))
    }

    /// Compiled block for `addr`, if any
    pub fn lookup(&self, addr: u32) -> Option<&CompiledBlock> {
        let cache = self.cache.as_ref()?;
        let id = cache.resolve(addr).ok()??;
        cache.block(id)
    }

    pub fn cache(&self) -> Option<&CodeCache> {
        self.cache.as_ref()
    }

    pub fn stats(&self) -> DynarecStats {
        self.stats
    }
}
