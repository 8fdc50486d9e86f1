//! Save states
//!
//! CPU registers, main RAM and the recompiler settings, serialized with
//! bincode and compressed with zstd. Compiled code is never saved; it is
//! rebuilt lazily after a restore.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DynarecConfig;
use crate::cpu::CpuState;
use crate::memory::Memory;

/// Bumped whenever the layout below changes
pub const SNAPSHOT_VERSION: u32 = 1;

/// zstd level used for saving
const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to encode snapshot: {0}")]
    Encode(String),
    #[error("failed to decode snapshot: {0}")]
    Decode(String),
    #[error("unsupported snapshot version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },
    #[error("snapshot RAM is {actual} bytes, machine has {expected}")]
    RamSize { expected: usize, actual: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub config: DynarecConfig,
    pub cpu: CpuState,
    pub ram: Vec<u8>,
}

impl Snapshot {
    pub fn capture(config: &DynarecConfig, cpu: &CpuState, memory: &Memory) -> Self {
        Snapshot {
            version: SNAPSHOT_VERSION,
            config: config.clone(),
            cpu: cpu.clone(),
            ram: memory.ram().to_vec(),
        }
    }

    /// Can this snapshot be loaded into a machine configured with `config`?
    pub fn check_compatible(&self, config: &DynarecConfig) -> Result<(), SnapshotError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version {
                found: self.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        let expected = config.ram_size() as usize;
        if self.ram.len() != expected {
            return Err(SnapshotError::RamSize {
                expected,
                actual: self.ram.len(),
            });
        }
        Ok(())
    }

    /// Serialize to bytes (compressed with zstd)
    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        let serialized = bincode::serialize(self).map_err(|e| SnapshotError::Encode(e.to_string()))?;
        zstd::stream::encode_all(&serialized[..], COMPRESSION_LEVEL).map_err(|e| SnapshotError::Encode(e.to_string()))
    }

    /// Deserialize from bytes (compressed with zstd)
    pub fn from_bytes(data: &[u8]) -> Result<Self, SnapshotError> {
        let decompressed = zstd::stream::decode_all(data).map_err(|e| SnapshotError::Decode(e.to_string()))?;
        let snapshot: Snapshot =
            bincode::deserialize(&decompressed).map_err(|e| SnapshotError::Decode(e.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        Ok(snapshot)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SnapshotError> {
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        Self::from_bytes(&fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RAM_SIZE_2MB;

    fn sample() -> Snapshot {
        let mut cpu = CpuState::new();
        cpu.gpr[8] = 0x1234_5678;
        cpu.pc = 0x8001_0000;
        cpu.pending_load_reg = 4;
        cpu.pending_load_value = 9;
        Snapshot::capture(&DynarecConfig::default(), &cpu, &Memory::new(RAM_SIZE_2MB))
    }

    #[test]
    fn test_bytes_round_trip() {
        let snapshot = sample();
        let bytes = snapshot.to_bytes().unwrap();
        // 2MB of zeros compresses to almost nothing
        assert!(bytes.len() < 64 * 1024);

        let decoded = Snapshot::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.cpu, snapshot.cpu);
        assert_eq!(decoded.config, snapshot.config);
        assert_eq!(decoded.ram.len(), RAM_SIZE_2MB as usize);
    }

    #[test]
    fn test_rejects_other_version() {
        let mut snapshot = sample();
        snapshot.version = SNAPSHOT_VERSION + 1;
        let bytes = snapshot.to_bytes().unwrap();
        assert!(matches!(Snapshot::from_bytes(&bytes), Err(SnapshotError::Version { .. })));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(Snapshot::from_bytes(b"not a snapshot"), Err(SnapshotError::Decode(_))));
    }

    #[test]
    fn test_ram_size_mismatch() {
        let snapshot = sample();
        let expanded = DynarecConfig { ram_expansion: true, ..DynarecConfig::default() };
        assert!(matches!(snapshot.check_compatible(&expanded), Err(SnapshotError::RamSize { .. })));
    }
}
