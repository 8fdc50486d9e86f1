//! Recompiler settings

use serde::{Deserialize, Serialize};

use crate::memory::{RAM_SIZE_2MB, RAM_SIZE_8MB};

/// Which backend turns host ops into something runnable
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    /// Portable host-op interpreter
    #[default]
    Interp,
    /// x86-64 machine code (needs the `jit-dynasm` feature)
    Native,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynarecConfig {
    /// 8MB of main RAM instead of 2MB (development units)
    #[serde(default)]
    pub ram_expansion: bool,
    #[serde(default)]
    pub backend: BackendKind,
}

impl DynarecConfig {
    pub fn ram_size(&self) -> u32 {
        if self.ram_expansion {
            RAM_SIZE_8MB
        } else {
            RAM_SIZE_2MB
        }
    }
}
