//! The fixed-size block allocator
//!
//! Manages a pool of 4 KiB blocks through an index array that doubles
//! as an intrusive singly-linked free list: the slot for a free block
//! holds the index of the next free block, terminated by a sentinel
//! distinct from the "used" sentinel so a freed/allocated slot can
//! never be mistaken for the other. Push and pop are both O(1); this is
//! the only layer that hands out whole blocks.

use itertools::Itertools;

use super::flat::FlatMemory;
use super::MemoryError;
use crate::types::Addr;

/// Power of two of the block size
pub const BLOCK_PO2: u8 = 12;
/// A block is 4 KiB, the largest atomically allocatable unit
pub const BLOCK_SIZE: u32 = 1 << BLOCK_PO2;

/// Tag bit marking an index-array slot as used; low bits carry the
/// owner's arena id for postmortem dumps
pub const BLOCK_USED: u16 = 0x8000;
/// Terminal sentinel of the free list
pub const BLOCK_FREE: u16 = 0xE4EE;
/// Out-of-blocks: the in-band exhaustion signal
pub const BLOCK_OOB: u16 = 0xFFFF;

/// Index of a block within the pool
pub type BlockIdx = u16;

/// The block allocator header as laid out in flat memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MBlockAllocator {
    pub free_root: BlockIdx,
    pub blocks_addr: Addr,
    pub pool_addr: Addr,
}

impl MBlockAllocator {
    pub const SIZE: u32 = 12;

    pub fn load(mem: &FlatMemory, addr: Addr) -> Result<Self, MemoryError> {
        Ok(MBlockAllocator {
            free_root: mem.read(addr)?,
            blocks_addr: mem.read(addr + 4)?,
            pool_addr: mem.read(addr + 8)?,
        })
    }

    pub fn store(&self, mem: &mut FlatMemory, addr: Addr) -> Result<(), MemoryError> {
        mem.write(addr, self.free_root)?;
        mem.write(addr + 4, self.blocks_addr)?;
        mem.write(addr + 8, self.pool_addr)
    }
}

/// Handle over a block allocator header resident in flat memory.
///
/// The pool and index-array addresses never change after construction
/// and are cached; the free-list root always lives in the header so the
/// byte image of the region stays authoritative. The free count is
/// host-side bookkeeping used purely for consistency checks.
#[derive(Debug, Clone)]
pub struct BlockAllocator {
    hdr: Addr,
    pool: Addr,
    blocks: Addr,
    total: u16,
    free: u16,
}

impl BlockAllocator {
    /// Initialise a pool of `total` blocks at `pool` with its index
    /// array at `blocks`, all linked into one free list
    pub fn new(
        mem: &mut FlatMemory,
        hdr: Addr,
        pool: Addr,
        blocks: Addr,
        total: u16,
    ) -> Result<Self, MemoryError> {
        MBlockAllocator {
            free_root: if total == 0 { BLOCK_FREE } else { 0 },
            blocks_addr: blocks,
            pool_addr: pool,
        }
        .store(mem, hdr)?;
        let mut ba = BlockAllocator {
            hdr,
            pool,
            blocks,
            total,
            free: total,
        };
        // an empty pool is born drained, with no list to link
        if total > 0 {
            for i in 0..total - 1 {
                ba.set_index(mem, i, i + 1)?;
            }
            ba.set_index(mem, total - 1, BLOCK_FREE)?;
        }
        Ok(ba)
    }

    pub fn hdr_addr(&self) -> Addr {
        self.hdr
    }

    pub fn pool_addr(&self) -> Addr {
        self.pool
    }

    pub fn pool_end(&self) -> Addr {
        self.pool + u32::from(self.total) * BLOCK_SIZE
    }

    pub fn blocks_total(&self) -> u16 {
        self.total
    }

    pub fn blocks_free(&self) -> u16 {
        self.free
    }

    pub fn blocks_allocated(&self) -> u16 {
        self.total - self.free
    }

    fn free_root(&self, mem: &FlatMemory) -> Result<BlockIdx, MemoryError> {
        mem.read(self.hdr)
    }

    fn set_free_root(&self, mem: &mut FlatMemory, i: BlockIdx) -> Result<(), MemoryError> {
        mem.write(self.hdr, i)
    }

    /// Pop the free-list head, or [`BLOCK_OOB`] when the pool is
    /// drained. A drained list with a nonzero free count is corruption.
    pub fn alloc_block(&mut self, mem: &mut FlatMemory) -> Result<BlockIdx, MemoryError> {
        let head = self.free_root(mem)?;
        if head == BLOCK_FREE {
            if self.free != 0 {
                return Err(MemoryError::CorruptFreeList {
                    detail: format!(
                        "free list drained but {} of {} blocks still counted free",
                        self.free, self.total
                    ),
                });
            }
            return Ok(BLOCK_OOB);
        }
        let next = self.get_index(mem, head)?;
        self.set_free_root(mem, next)?;
        self.free -= 1;
        Ok(head)
    }

    /// Push a block back onto the free list
    pub fn free_block(&mut self, mem: &mut FlatMemory, i: BlockIdx) -> Result<(), MemoryError> {
        if self.free >= self.total {
            return Err(MemoryError::InvalidFree {
                reason: format!("block {i} freed while every block is already free"),
                free: self.free,
                total: self.total,
            });
        }
        self.check_addr(self.block_to_addr_unchecked(i))?;
        let head = self.free_root(mem)?;
        self.set_index(mem, i, head)?;
        self.set_free_root(mem, i)?;
        self.free += 1;
        Ok(())
    }

    /// Validate a pool address: in range and block-aligned
    fn check_addr(&self, addr: Addr) -> Result<(), MemoryError> {
        if addr < self.pool || addr >= self.pool_end() {
            return Err(MemoryError::OutOfRange {
                addr,
                size: BLOCK_SIZE,
                limit: self.pool_end(),
            });
        }
        if (addr - self.pool) % BLOCK_SIZE != 0 {
            return Err(MemoryError::Misaligned {
                value: addr,
                align: BLOCK_SIZE,
            });
        }
        Ok(())
    }

    fn block_to_addr_unchecked(&self, i: BlockIdx) -> Addr {
        self.pool + u32::from(i) * BLOCK_SIZE
    }

    /// Absolute address of a block; [`BLOCK_OOB`] maps to the null
    /// address so exhaustion propagates in-band
    pub fn block_to_addr(&self, i: BlockIdx) -> Result<Addr, MemoryError> {
        if i == BLOCK_OOB {
            return Ok(0);
        }
        let addr = self.block_to_addr_unchecked(i);
        self.check_addr(addr)?;
        Ok(addr)
    }

    pub fn addr_to_block(&self, addr: Addr) -> Result<BlockIdx, MemoryError> {
        self.check_addr(addr)?;
        Ok(((addr - self.pool) / BLOCK_SIZE) as BlockIdx)
    }

    /// Raw read of the index array
    pub fn get_index(&self, mem: &FlatMemory, i: BlockIdx) -> Result<u16, MemoryError> {
        mem.read(self.blocks + u32::from(i) * 2)
    }

    /// Raw write of the index array. A slot pointing at itself would
    /// loop the free list, so it is rejected as corruption.
    pub fn set_index(
        &mut self,
        mem: &mut FlatMemory,
        i: BlockIdx,
        value: u16,
    ) -> Result<(), MemoryError> {
        if i == value {
            return Err(MemoryError::CorruptFreeList {
                detail: format!("block {i} linked to itself"),
            });
        }
        mem.write(self.blocks + u32::from(i) * 2, value)
    }

    /// Snapshot of the whole index array, for dumps and tests
    pub fn block_indexes(&self, mem: &FlatMemory) -> Result<Vec<u16>, MemoryError> {
        mem.read_array(self.blocks, u32::from(self.total))
    }

    /// One-line rendering of the index array for postmortems; used
    /// slots show their owner tag, free slots the next free index
    pub fn dump_indexes(&self, mem: &FlatMemory) -> Result<String, MemoryError> {
        Ok(self
            .block_indexes(mem)?
            .iter()
            .map(|i| format!("{i:#06x}"))
            .join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POOL: Addr = 4096;

    fn fixture(total: u16) -> (FlatMemory, BlockAllocator) {
        let size = POOL + u32::from(total) * BLOCK_SIZE + 64;
        let mut mem = FlatMemory::new(size);
        let blocks = POOL + u32::from(total) * BLOCK_SIZE;
        let ba = BlockAllocator::new(&mut mem, blocks + 32, POOL, blocks, total).unwrap();
        (mem, ba)
    }

    #[test]
    fn test_fresh_free_list() {
        let (mem, ba) = fixture(4);
        assert_eq!(ba.block_indexes(&mem).unwrap(), vec![1, 2, 3, BLOCK_FREE]);
        assert_eq!(ba.blocks_free(), 4);
        assert_eq!(ba.blocks_allocated(), 0);
    }

    #[test]
    fn test_empty_pool() {
        let (mut mem, mut ba) = fixture(0);
        assert_eq!(ba.blocks_free(), 0);
        assert_eq!(ba.alloc_block(&mut mem).unwrap(), BLOCK_OOB);
        assert!(matches!(
            ba.free_block(&mut mem, 0),
            Err(MemoryError::InvalidFree { .. })
        ));
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let (mut mem, mut ba) = fixture(4);
        let mut addrs = Vec::new();
        for _ in 0..4 {
            let i = ba.alloc_block(&mut mem).unwrap();
            assert_ne!(i, BLOCK_OOB);
            let addr = ba.block_to_addr(i).unwrap();
            assert_eq!((addr - POOL) % BLOCK_SIZE, 0);
            addrs.push(addr);
        }
        addrs.sort_unstable();
        addrs.dedup();
        assert_eq!(addrs.len(), 4);

        // drained pool signals in-band, not as an error
        assert_eq!(ba.alloc_block(&mut mem).unwrap(), BLOCK_OOB);
        assert_eq!(ba.block_to_addr(BLOCK_OOB).unwrap(), 0);

        ba.free_block(&mut mem, 2).unwrap();
        assert_eq!(ba.alloc_block(&mut mem).unwrap(), 2);
    }

    #[test]
    fn test_free_at_capacity_is_invalid() {
        let (mut mem, mut ba) = fixture(2);
        let e = ba.free_block(&mut mem, 0).unwrap_err();
        assert!(matches!(e, MemoryError::InvalidFree { free: 2, total: 2, .. }));
    }

    #[test]
    fn test_addr_validation() {
        let (_, ba) = fixture(2);
        assert_eq!(ba.addr_to_block(POOL + BLOCK_SIZE).unwrap(), 1);
        assert!(matches!(
            ba.addr_to_block(POOL + 17),
            Err(MemoryError::Misaligned { .. })
        ));
        assert!(matches!(
            ba.addr_to_block(POOL + 2 * BLOCK_SIZE),
            Err(MemoryError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_self_link_rejected() {
        let (mut mem, mut ba) = fixture(2);
        let e = ba.set_index(&mut mem, 1, 1).unwrap_err();
        assert!(matches!(e, MemoryError::CorruptFreeList { .. }));
    }

    #[test]
    fn test_dump_format() {
        let (mem, ba) = fixture(2);
        assert_eq!(ba.dump_indexes(&mem).unwrap(), "0x0001 0xe4ee");
    }
}
