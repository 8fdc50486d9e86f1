//! Guest memory subsystem
//!
//! Physical memory layout (R3000A as wired in the PlayStation):
//! 0x00000000 - 0x001FFFFF: Main RAM (2MB retail, 8MB on dev units)
//! 0x1F800000 - 0x1F8003FF: Scratchpad (data only, never executed)
//! 0x1FC00000 - 0x1FC7FFFF: BIOS ROM (512KB)
//!
//! Virtual addresses reach physical memory through three windows: KUSEG
//! (0x00000000), KSEG0 (0x80000000, cached) and KSEG1 (0xA0000000, uncached).
//! Hardware registers are not modelled: reads return 0 and writes are dropped.

use std::io::Read;
use thiserror::Error;

pub const RAM_SIZE_2MB: u32 = 0x0020_0000;
pub const RAM_SIZE_8MB: u32 = 0x0080_0000;

pub const SCRATCHPAD_BASE: u32 = 0x1F80_0000;
pub const SCRATCHPAD_SIZE: u32 = 0x400;

pub const BIOS_BASE: u32 = 0x1FC0_0000;
pub const BIOS_SIZE: u32 = 0x8_0000;

/// Bus interface for CPU memory access
///
/// Addresses are virtual; implementations reduce them to physical addresses.
pub trait Bus {
    fn read8(&mut self, addr: u32) -> u8;
    fn write8(&mut self, addr: u32, value: u8);
    fn read16(&mut self, addr: u32) -> u16;
    fn write16(&mut self, addr: u32, value: u16);
    fn read32(&mut self, addr: u32) -> u32;
    fn write32(&mut self, addr: u32, value: u32);

    /// Hand every write to executable memory since the last call to `sink`
    /// as `(physical address, size)` and forget them.
    fn drain_code_writes(&mut self, _sink: &mut dyn FnMut(u32, u32)) {}
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("image of {size:#x} bytes does not fit at {addr:#010x}")]
    OutOfRange { addr: u32, size: usize },
    #[error("BIOS image must be {expected:#x} bytes, got {actual:#x}")]
    BiosSize { expected: usize, actual: usize },
    #[error("gzip decompression failed: {0}")]
    Decompress(#[from] std::io::Error),
}

/// Strip the segment bits off a virtual address
#[inline(always)]
pub fn physical(addr: u32) -> u32 {
    match addr >> 29 {
        0b100 => addr & 0x7FFF_FFFF, // KSEG0
        0b101 => addr & 0x1FFF_FFFF, // KSEG1
        _ => addr,
    }
}

enum Target {
    Ram(usize),
    Scratchpad(usize),
    Bios(usize),
    Unmapped,
}

/// RAM, scratchpad and BIOS storage
pub struct Memory {
    ram: Vec<u8>,
    scratchpad: Vec<u8>,
    bios: Vec<u8>,
    /// RAM writes not yet reported to the recompiler
    code_writes: Vec<(u32, u32)>,
}

impl Memory {
    pub fn new(ram_size: u32) -> Self {
        Memory {
            ram: vec![0u8; ram_size as usize],
            scratchpad: vec![0u8; SCRATCHPAD_SIZE as usize],
            bios: vec![0u8; BIOS_SIZE as usize],
            code_writes: Vec::with_capacity(64),
        }
    }

    /// Get RAM size in bytes
    pub fn ram_size(&self) -> usize {
        self.ram.len()
    }

    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    /// Replace RAM contents wholesale (snapshot restore)
    pub fn restore_ram(&mut self, data: &[u8]) -> Result<(), MemoryError> {
        if data.len() != self.ram.len() {
            return Err(MemoryError::OutOfRange { addr: 0, size: data.len() });
        }
        self.ram.copy_from_slice(data);
        self.code_writes.clear();
        Ok(())
    }

    /// Install a BIOS image (must be exactly 512KB)
    pub fn load_bios(&mut self, image: &[u8]) -> Result<(), MemoryError> {
        if image.len() != BIOS_SIZE as usize {
            return Err(MemoryError::BiosSize {
                expected: BIOS_SIZE as usize,
                actual: image.len(),
            });
        }
        self.bios.copy_from_slice(image);
        Ok(())
    }

    /// Copy a binary into RAM or BIOS at a virtual address
    pub fn load_binary(&mut self, data: &[u8], addr: u32) -> Result<(), MemoryError> {
        let phys = physical(addr);
        let out_of_range = MemoryError::OutOfRange { addr, size: data.len() };
        let (region, offset) = match self.decode(phys) {
            Target::Ram(offset) => (&mut self.ram, offset),
            Target::Bios(offset) => (&mut self.bios, offset),
            Target::Scratchpad(offset) => (&mut self.scratchpad, offset),
            Target::Unmapped => return Err(out_of_range),
        };
        let end = offset.checked_add(data.len()).ok_or(MemoryError::OutOfRange { addr, size: data.len() })?;
        if end > region.len() {
            return Err(out_of_range);
        }
        region[offset..end].copy_from_slice(data);
        Ok(())
    }

    #[inline(always)]
    fn decode(&self, phys: u32) -> Target {
        if (phys as usize) < self.ram.len() {
            Target::Ram(phys as usize)
        } else if (SCRATCHPAD_BASE..SCRATCHPAD_BASE + SCRATCHPAD_SIZE).contains(&phys) {
            Target::Scratchpad((phys - SCRATCHPAD_BASE) as usize)
        } else if (BIOS_BASE..BIOS_BASE + BIOS_SIZE).contains(&phys) {
            Target::Bios((phys - BIOS_BASE) as usize)
        } else {
            Target::Unmapped
        }
    }

    #[inline(always)]
    fn read_bytes<const N: usize>(&self, addr: u32) -> [u8; N] {
        let mut out = [0u8; N];
        let (region, offset) = match self.decode(physical(addr)) {
            Target::Ram(offset) => (&self.ram, offset),
            Target::Scratchpad(offset) => (&self.scratchpad, offset),
            Target::Bios(offset) => (&self.bios, offset),
            Target::Unmapped => {
                tracing::trace!("unmapped read{} at {:#010x}", N * 8, addr);
                return out;
            }
        };
        if let Some(bytes) = region.get(offset..offset + N) {
            out.copy_from_slice(bytes);
        }
        out
    }

    #[inline(always)]
    fn write_bytes<const N: usize>(&mut self, addr: u32, bytes: [u8; N]) {
        let phys = physical(addr);
        match self.decode(phys) {
            Target::Ram(offset) => {
                if let Some(dst) = self.ram.get_mut(offset..offset + N) {
                    dst.copy_from_slice(&bytes);
                    self.code_writes.push((phys, N as u32));
                }
            }
            Target::Scratchpad(offset) => {
                if let Some(dst) = self.scratchpad.get_mut(offset..offset + N) {
                    dst.copy_from_slice(&bytes);
                }
            }
            Target::Bios(_) => {
                tracing::trace!("ignored write{} to BIOS at {:#010x}", N * 8, addr);
            }
            Target::Unmapped => {
                tracing::trace!("unmapped write{} at {:#010x}", N * 8, addr);
            }
        }
    }
}

impl Bus for Memory {
    fn read8(&mut self, addr: u32) -> u8 {
        self.read_bytes::<1>(addr)[0]
    }

    fn write8(&mut self, addr: u32, value: u8) {
        self.write_bytes(addr, [value])
    }

    fn read16(&mut self, addr: u32) -> u16 {
        u16::from_le_bytes(self.read_bytes(addr))
    }

    fn write16(&mut self, addr: u32, value: u16) {
        self.write_bytes(addr, value.to_le_bytes())
    }

    fn read32(&mut self, addr: u32) -> u32 {
        u32::from_le_bytes(self.read_bytes(addr))
    }

    fn write32(&mut self, addr: u32, value: u32) {
        self.write_bytes(addr, value.to_le_bytes())
    }

    fn drain_code_writes(&mut self, sink: &mut dyn FnMut(u32, u32)) {
        for &(addr, size) in &self.code_writes {
            sink(addr, size);
        }
        self.code_writes.clear();
    }
}

/// Decompress gzip-compressed images, pass everything else through
pub fn decompress_image(data: Vec<u8>) -> Result<Vec<u8>, MemoryError> {
    const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
    if !data.starts_with(&GZIP_MAGIC) {
        return Ok(data);
    }

    let mut decoder = flate2::read::GzDecoder::new(&data[..]);
    let mut result = Vec::new();
    decoder.read_to_end(&mut result)?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_alias_physical_memory() {
        let mut mem = Memory::new(RAM_SIZE_2MB);
        mem.write32(0x8000_1000, 0xCAFE_BABE);
        assert_eq!(mem.read32(0x0000_1000), 0xCAFE_BABE);
        assert_eq!(mem.read32(0xA000_1000), 0xCAFE_BABE);
        assert_eq!(mem.read16(0x8000_1002), 0xCAFE);
        assert_eq!(mem.read8(0x8000_1000), 0xBE);
    }

    #[test]
    fn test_bios_is_read_only() {
        let mut mem = Memory::new(RAM_SIZE_2MB);
        let mut image = vec![0u8; BIOS_SIZE as usize];
        image[0..4].copy_from_slice(&0x3C08_0013u32.to_le_bytes());
        mem.load_bios(&image).unwrap();

        assert_eq!(mem.read32(0xBFC0_0000), 0x3C08_0013);
        mem.write32(0xBFC0_0000, 0);
        assert_eq!(mem.read32(0x9FC0_0000), 0x3C08_0013);
    }

    #[test]
    fn test_ram_writes_are_reported_once() {
        let mut mem = Memory::new(RAM_SIZE_2MB);
        mem.write32(0x8000_0010, 1);
        mem.write8(0xA000_0020, 2);
        mem.write32(SCRATCHPAD_BASE, 3);

        let mut seen = Vec::new();
        mem.drain_code_writes(&mut |addr, size| seen.push((addr, size)));
        assert_eq!(seen, vec![(0x10, 4), (0x20, 1)]);

        seen.clear();
        mem.drain_code_writes(&mut |addr, size| seen.push((addr, size)));
        assert!(seen.is_empty());
    }

    #[test]
    fn test_ram_size_limits_mapping() {
        let mut small = Memory::new(RAM_SIZE_2MB);
        small.write32(0x0030_0000, 7);
        assert_eq!(small.read32(0x0030_0000), 0);

        let mut large = Memory::new(RAM_SIZE_8MB);
        large.write32(0x0030_0000, 7);
        assert_eq!(large.read32(0x0030_0000), 7);
    }

    #[test]
    fn test_load_binary_rejects_overflow() {
        let mut mem = Memory::new(RAM_SIZE_2MB);
        let data = vec![0u8; 16];
        assert!(mem.load_binary(&data, 0x801F_FFF8).is_err());
        assert!(mem.load_binary(&data, 0x8001_0000).is_ok());
    }

    #[test]
    fn test_plain_images_pass_through_decompression() {
        let data = vec![1u8, 2, 3, 4];
        assert_eq!(decompress_image(data.clone()).unwrap(), data);
    }
}
