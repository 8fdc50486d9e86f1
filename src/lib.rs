//! PlayStation R3000A dynamic recompiler
//!
//! Guest code is translated block by block into host ops, cached in a
//! page-granular dispatch table and executed by a dispatcher that falls back
//! to an interpreter for anything it cannot compile.

pub mod config;
pub mod cpu;
pub mod memory;
pub mod snapshot;
mod system;

pub use config::{BackendKind, DynarecConfig};
pub use cpu::dynarec::{Dynarec, DynarecError, DynarecStats, Machine};
pub use cpu::CpuState;
pub use memory::{Bus, Memory};
pub use system::{RunExit, System};
