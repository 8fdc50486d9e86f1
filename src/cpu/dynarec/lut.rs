//! Dispatch LUT and block pointer arrays
//!
//! Every 64KB page of the guest address space has one LUT entry. Executable
//! pages (RAM and BIOS, in all three segment windows) point at a run of slots
//! in their region's block pointer array; one slot per instruction word. All
//! windows of a page share the same slots, so compiling or invalidating through
//! one window is visible through the others.

use super::codegen::CompiledBlock;
use super::compiler::MAX_BLOCK_SIZE;
use super::DynarecError;
use crate::memory::BIOS_SIZE;

pub const LUT_ENTRIES: usize = 0x10000;
pub const PAGE_SHIFT: u32 = 16;
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;
/// Block pointer slots per 64KB page
pub const SLOTS_PER_PAGE: u32 = PAGE_SIZE >> 2;

/// KUSEG, KSEG0, KSEG1
const RAM_WINDOWS: [u32; 3] = [0x0000, 0x8000, 0xA000];
const BIOS_WINDOWS: [u32; 3] = [0x1FC0, 0x9FC0, 0xBFC0];

/// Handle into the compiled block arena
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockId(u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    Ram,
    Bios,
}

/// Where a page's slots live
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageMapping {
    pub region: Region,
    /// Index of the page's first slot in the region array
    pub base_slot: u32,
}

/// Dispatch LUT, block pointer arrays and the block arena
pub struct CodeCache {
    lut: Box<[Option<PageMapping>]>,
    ram_blocks: Box<[Option<BlockId>]>,
    bios_blocks: Box<[Option<BlockId>]>,
    blocks: Vec<Option<CompiledBlock>>,
    free: Vec<BlockId>,
}

fn alloc_table<T: Clone>(len: usize, fill: T, what: &'static str) -> Result<Box<[T]>, DynarecError> {
    let mut table = Vec::new();
    table
        .try_reserve_exact(len)
        .map_err(|_| DynarecError::Allocation { what })?;
    table.resize(len, fill);
    Ok(table.into_boxed_slice())
}

impl CodeCache {
    /// Allocate the LUT and region arrays and map the aliasing windows
    pub fn new(ram_size: u32) -> Result<Self, DynarecError> {
        let mut lut = alloc_table(LUT_ENTRIES, None, "dispatch LUT")?;
        let ram_blocks = alloc_table((ram_size >> 2) as usize, None, "RAM block pointers")?;
        let bios_blocks = alloc_table((BIOS_SIZE >> 2) as usize, None, "BIOS block pointers")?;

        for page in 0..(ram_size >> PAGE_SHIFT) {
            let mapping = PageMapping { region: Region::Ram, base_slot: page * SLOTS_PER_PAGE };
            for window in RAM_WINDOWS {
                lut[(window + page) as usize] = Some(mapping);
            }
        }
        for page in 0..(BIOS_SIZE >> PAGE_SHIFT) {
            let mapping = PageMapping { region: Region::Bios, base_slot: page * SLOTS_PER_PAGE };
            for window in BIOS_WINDOWS {
                lut[(window + page) as usize] = Some(mapping);
            }
        }

        Ok(CodeCache {
            lut,
            ram_blocks,
            bios_blocks,
            blocks: Vec::with_capacity(4096),
            free: Vec::new(),
        })
    }

    /// Is `addr` inside a recompilable page? Independent of what has been compiled.
    #[inline(always)]
    pub fn is_pc_valid(&self, addr: u32) -> bool {
        self.lut[(addr >> PAGE_SHIFT) as usize].is_some()
    }

    #[inline(always)]
    pub fn mapping(&self, addr: u32) -> Option<PageMapping> {
        self.lut[(addr >> PAGE_SHIFT) as usize]
    }

    #[inline(always)]
    fn slot_of(&self, addr: u32) -> Result<(Region, usize), DynarecError> {
        let mapping = self.mapping(addr).ok_or(DynarecError::InvalidPc(addr))?;
        let slot = mapping.base_slot + ((addr & (PAGE_SIZE - 1)) >> 2);
        Ok((mapping.region, slot as usize))
    }

    fn slots(&self, region: Region) -> &[Option<BlockId>] {
        match region {
            Region::Ram => &self.ram_blocks,
            Region::Bios => &self.bios_blocks,
        }
    }

    fn slots_mut(&mut self, region: Region) -> &mut [Option<BlockId>] {
        match region {
            Region::Ram => &mut self.ram_blocks,
            Region::Bios => &mut self.bios_blocks,
        }
    }

    /// Block compiled at `addr`, `None` if not compiled yet
    #[inline(always)]
    pub fn resolve(&self, addr: u32) -> Result<Option<BlockId>, DynarecError> {
        let (region, slot) = self.slot_of(addr)?;
        Ok(self.slots(region)[slot])
    }

    /// The slot for `addr` itself
    pub fn block_pointer_mut(&mut self, addr: u32) -> Result<&mut Option<BlockId>, DynarecError> {
        let (region, slot) = self.slot_of(addr)?;
        Ok(&mut self.slots_mut(region)[slot])
    }

    /// Instruction words between `addr` and the end of its region
    pub fn words_remaining(&self, addr: u32) -> Result<u32, DynarecError> {
        let (region, slot) = self.slot_of(addr)?;
        Ok((self.slots(region).len() - slot) as u32)
    }

    #[inline(always)]
    pub fn block(&self, id: BlockId) -> Option<&CompiledBlock> {
        self.blocks.get(id.index()).and_then(Option::as_ref)
    }

    /// Store a block in the arena and point `addr`'s slot at it
    pub fn install(&mut self, addr: u32, block: CompiledBlock) -> Result<BlockId, DynarecError> {
        self.slot_of(addr)?;
        let id = match self.free.pop() {
            Some(id) => {
                self.blocks[id.index()] = Some(block);
                id
            }
            None => {
                let id = BlockId(self.blocks.len() as u32);
                self.blocks.push(Some(block));
                id
            }
        };
        if let Some(old) = self.block_pointer_mut(addr)?.replace(id) {
            self.release(old);
        }
        Ok(id)
    }

    fn release(&mut self, id: BlockId) {
        if let Some(entry) = self.blocks.get_mut(id.index()) {
            if entry.take().is_some() {
                self.free.push(id);
            }
        }
    }

    /// Drop every block overlapping `[addr, addr + size)`; returns how many
    ///
    /// Unmapped parts of the range are ignored. A block can start up to
    /// `MAX_BLOCK_SIZE - 1` words before the range and still cover it.
    pub fn invalidate(&mut self, addr: u32, size: u32) -> usize {
        if size == 0 {
            return 0;
        }
        let end = addr as u64 + size as u64;
        let mut cursor = addr as u64;
        let mut freed = 0;

        while cursor < end {
            let page_end = ((cursor >> PAGE_SHIFT) + 1) << PAGE_SHIFT;
            let chunk_end = end.min(page_end);
            let chunk_addr = cursor as u32;

            if let Some(mapping) = self.mapping(chunk_addr) {
                let in_page = (chunk_addr & (PAGE_SIZE - 1)) >> 2;
                let first = (mapping.base_slot + in_page) as usize;
                let last = first + ((chunk_end - 1 - (cursor & !3)) >> 2) as usize;
                let lookback = first.saturating_sub(MAX_BLOCK_SIZE as usize - 1);

                for slot in lookback..=last.min(self.slots(mapping.region).len() - 1) {
                    let Some(id) = self.slots(mapping.region)[slot] else {
                        continue;
                    };
                    let len = self.block(id).map_or(1, |b| b.len.max(1)) as usize;
                    if slot + len > first {
                        self.slots_mut(mapping.region)[slot] = None;
                        self.release(id);
                        freed += 1;
                    }
                }
            }
            cursor = chunk_end;
        }
        freed
    }

    /// Drop every compiled block; the LUT is left as is
    pub fn invalidate_all(&mut self) {
        self.ram_blocks.fill(None);
        self.bios_blocks.fill(None);
        self.blocks.clear();
        self.free.clear();
    }

    pub fn ram_slot_count(&self) -> usize {
        self.ram_blocks.len()
    }

    pub fn bios_slot_count(&self) -> usize {
        self.bios_blocks.len()
    }

    /// Number of live blocks in the arena
    pub fn block_count(&self) -> usize {
        self.blocks.len() - self.free.len()
    }

    /// Are all RAM and BIOS slots empty?
    pub fn is_empty(&self) -> bool {
        self.ram_blocks.iter().chain(self.bios_blocks.iter()).all(Option::is_none)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::dynarec::codegen::{BlockCode, HostOp};
    use crate::memory::{RAM_SIZE_2MB, RAM_SIZE_8MB};

    fn block(start: u32, len: u32) -> CompiledBlock {
        let ops = vec![HostOp::Exit { cycles: len, fallback: false }];
        CompiledBlock { start, len, code: BlockCode::Interp(ops.into_boxed_slice()) }
    }

    #[test]
    fn test_ram_slot_counts() {
        let small = CodeCache::new(RAM_SIZE_2MB).unwrap();
        assert_eq!(small.ram_slot_count(), 0x200000 / 4);
        assert_eq!(small.bios_slot_count(), 0x80000 / 4);
        assert!(small.is_empty());

        let large = CodeCache::new(RAM_SIZE_8MB).unwrap();
        assert_eq!(large.ram_slot_count(), 0x800000 / 4);
        assert!(large.is_empty());
    }

    #[test]
    fn test_windows_share_slots() {
        let mut cache = CodeCache::new(RAM_SIZE_2MB).unwrap();
        let id = cache.install(0x8000_0000, block(0x8000_0000, 4)).unwrap();
        assert_eq!(cache.resolve(0x0000_0000).unwrap(), Some(id));
        assert_eq!(cache.resolve(0xA000_0000).unwrap(), Some(id));

        let id = cache.install(0xBFC0_0180, block(0xBFC0_0180, 1)).unwrap();
        assert_eq!(cache.resolve(0x1FC0_0180).unwrap(), Some(id));
        assert_eq!(cache.resolve(0x9FC0_0180).unwrap(), Some(id));
    }

    #[test]
    fn test_validity_follows_the_lut_only() {
        let cache = CodeCache::new(RAM_SIZE_2MB).unwrap();
        assert!(cache.is_pc_valid(0x8001_0000));
        assert_eq!(cache.resolve(0x8001_0000).unwrap(), None);
        assert!(cache.is_pc_valid(0xBFC7_FFFC));

        for addr in [0x0020_0000, 0x1F80_0000, 0x1FC8_0000, 0xC000_0000, 0xFFFF_FFFC] {
            assert!(!cache.is_pc_valid(addr));
            assert!(matches!(cache.resolve(addr), Err(DynarecError::InvalidPc(a)) if a == addr));
        }
    }

    #[test]
    fn test_large_ram_maps_upper_pages() {
        let small = CodeCache::new(RAM_SIZE_2MB).unwrap();
        let large = CodeCache::new(RAM_SIZE_8MB).unwrap();
        assert!(!small.is_pc_valid(0x8070_0000));
        assert!(large.is_pc_valid(0x8070_0000));
    }

    #[test]
    fn test_invalidate_hits_covering_blocks_only() {
        let mut cache = CodeCache::new(RAM_SIZE_2MB).unwrap();
        cache.install(0x8000_1000, block(0x8000_1000, 8)).unwrap();
        cache.install(0x8000_1040, block(0x8000_1040, 2)).unwrap();

        // word 5 of the first block, through the uncached window
        assert_eq!(cache.invalidate(0xA000_1014, 4), 1);
        assert_eq!(cache.resolve(0x8000_1000).unwrap(), None);
        assert!(cache.resolve(0x8000_1040).unwrap().is_some());

        // a write just past the end of a block leaves it alone
        assert_eq!(cache.invalidate(0x0000_1048, 4), 0);
        assert_eq!(cache.block_count(), 1);
    }

    #[test]
    fn test_empty_range_invalidates_nothing() {
        let mut cache = CodeCache::new(RAM_SIZE_2MB).unwrap();
        cache.install(0x8000_2000, block(0x8000_2000, 4)).unwrap();
        assert_eq!(cache.invalidate(0x8000_2000, 0), 0);
        assert_eq!(cache.invalidate(0x8000_2004, 0), 0);
        assert!(cache.resolve(0x8000_2000).unwrap().is_some());
    }

    #[test]
    fn test_freed_ids_are_reused() {
        let mut cache = CodeCache::new(RAM_SIZE_2MB).unwrap();
        let first = cache.install(0x8000_0000, block(0x8000_0000, 1)).unwrap();
        cache.invalidate(0x0, 4);
        let second = cache.install(0x8000_0100, block(0x8000_0100, 1)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_invalidate_all_keeps_lut() {
        let mut cache = CodeCache::new(RAM_SIZE_2MB).unwrap();
        cache.install(0x8000_0000, block(0x8000_0000, 1)).unwrap();
        cache.invalidate_all();
        assert!(cache.is_empty());
        assert!(cache.is_pc_valid(0x8000_0000));
    }
}
