//! The buddy-style arena allocator
//!
//! Serves power-of-two allocations from 8 bytes up to one block,
//! layered on the block allocator. Each size class keeps an intrusive
//! free list threaded through the free payload memory itself (the first
//! word of a free region holds the address of the next), so an arena's
//! bookkeeping is one small control struct no matter how much it owns.
//!
//! Every whole block an arena acquires is also linked into an
//! owned-block list inside the block allocator's index array, which is
//! what makes dropping a whole arena a bulk operation.
//!
//! Merging on free is opportunistic: only the current free-list head of
//! a class is tested for adjacency. That can leave adjacent free
//! regions unmerged; they remain valid free memory, just more
//! fragmented than a full coalescing scan would leave them. The exact
//! free-list bytes after a given operation sequence are part of the
//! layout contract, so the head-only behavior is load-bearing.

use super::blocks::{BlockAllocator, BlockIdx, BLOCK_FREE, BLOCK_OOB, BLOCK_PO2, BLOCK_USED};
use super::flat::FlatMemory;
use super::MemoryError;
use crate::types::Addr;

/// Smallest size class: 2^3 = 8 bytes
pub const ARENA_PO2_MIN: u8 = 3;
/// Number of per-class free-list roots (classes 2^3 .. 2^11; one block
/// is served by the block allocator directly)
pub const ARENA_PO2_ROOTS: usize = (BLOCK_PO2 - ARENA_PO2_MIN) as usize;
/// Size class of an arena's own control struct
pub const ARENA_STRUCT_PO2: u8 = 6;

/// The arena header as laid out in flat memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MArena {
    pub ba_addr: Addr,
    pub block_root: u16,
    pub po2_roots: [Addr; ARENA_PO2_ROOTS],
}

impl MArena {
    pub const SIZE: u32 = 8 + 4 * ARENA_PO2_ROOTS as u32;

    pub fn store(&self, mem: &mut FlatMemory, addr: Addr) -> Result<(), MemoryError> {
        mem.write(addr, self.ba_addr)?;
        mem.write(addr + 4, self.block_root)?;
        mem.write(addr + 6, 0u16)?;
        mem.write_array(addr + 8, &self.po2_roots)
    }

    pub fn load(mem: &FlatMemory, addr: Addr) -> Result<Self, MemoryError> {
        let roots = mem.read_array::<u32>(addr + 8, ARENA_PO2_ROOTS as u32)?;
        Ok(MArena {
            ba_addr: mem.read(addr)?,
            block_root: mem.read(addr + 4)?,
            po2_roots: roots.try_into().expect("root count"),
        })
    }
}

/// If two regions of `size` bytes are exactly adjacent, return the
/// lower address of the joined region; otherwise return the null
/// address. Argument order does not matter.
pub fn join_mem(ptr1: Addr, ptr2: Addr, size: u32) -> Addr {
    if ptr1 == 0 || ptr2 == 0 {
        return 0;
    }
    let (lo, hi) = if ptr2 < ptr1 {
        (ptr2, ptr1)
    } else {
        (ptr1, ptr2)
    };
    if lo + size == hi {
        lo
    } else {
        0
    }
}

/// Handle over an arena header resident in flat memory.
///
/// Arenas form a tree: a child's header is allocated out of its parent,
/// and all arenas over one block allocator share its pool. The small
/// `id` is baked into the owned-block list's terminal marker so block
/// ownership is readable in an index-array dump.
#[derive(Debug, Clone)]
pub struct Arena {
    hdr: Addr,
    id: u8,
}

impl Arena {
    /// Write a fresh arena header at `hdr`
    pub fn new(
        mem: &mut FlatMemory,
        hdr: Addr,
        ba: &BlockAllocator,
        id: u8,
    ) -> Result<Self, MemoryError> {
        MArena {
            ba_addr: ba.hdr_addr(),
            block_root: BLOCK_USED | u16::from(id),
            po2_roots: [0; ARENA_PO2_ROOTS],
        }
        .store(mem, hdr)?;
        Ok(Arena { hdr, id })
    }

    /// Allocate a child arena whose control struct lives inside the
    /// parent. `None` when the parent cannot supply the space.
    pub fn new_child(
        mem: &mut FlatMemory,
        ba: &mut BlockAllocator,
        parent: &Arena,
        id: u8,
    ) -> Result<Option<Self>, MemoryError> {
        let hdr = parent.alloc(mem, ba, ARENA_STRUCT_PO2)?;
        if hdr == 0 {
            return Ok(None);
        }
        Ok(Some(Arena::new(mem, hdr, ba, id)?))
    }

    pub fn hdr_addr(&self) -> Addr {
        self.hdr
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    fn real_po2(po2: u8) -> u8 {
        po2.max(ARENA_PO2_MIN)
    }

    fn root_addr(&self, po2: u8) -> Addr {
        self.hdr + 8 + 4 * u32::from(po2 - ARENA_PO2_MIN)
    }

    /// Free-list root of a size class below the block class
    pub fn po2_root(&self, mem: &FlatMemory, po2: u8) -> Result<Addr, MemoryError> {
        mem.read(self.root_addr(po2))
    }

    fn set_po2_root(&self, mem: &mut FlatMemory, po2: u8, addr: Addr) -> Result<(), MemoryError> {
        mem.write(self.root_addr(po2), addr)
    }

    fn block_root(&self, mem: &FlatMemory) -> Result<u16, MemoryError> {
        mem.read(self.hdr + 4)
    }

    fn set_block_root(&self, mem: &mut FlatMemory, value: u16) -> Result<(), MemoryError> {
        mem.write(self.hdr + 4, value)
    }

    /// Acquire a whole fresh block, linking it into the owned-block
    /// list. Null address when the pool is drained.
    fn alloc_whole_block(
        &self,
        mem: &mut FlatMemory,
        ba: &mut BlockAllocator,
    ) -> Result<Addr, MemoryError> {
        let bi = ba.alloc_block(mem)?;
        if bi == BLOCK_OOB {
            return Ok(0);
        }
        let root = self.block_root(mem)?;
        ba.set_index(mem, bi, root)?;
        self.set_block_root(mem, bi)?;
        ba.block_to_addr(bi)
    }

    /// Return a whole block to the block allocator, unlinking it from
    /// the owned-block list first. The unlink is a linear scan of that
    /// list, the one non-O(1) path in this allocator.
    fn free_whole_block(
        &self,
        mem: &mut FlatMemory,
        ba: &mut BlockAllocator,
        ptr: Addr,
    ) -> Result<(), MemoryError> {
        let bindex = ba.addr_to_block(ptr)?;
        let root = self.block_root(mem)?;
        if bindex == root {
            let next = ba.get_index(mem, bindex)?;
            self.set_block_root(mem, next)?;
        } else {
            let mut w = root;
            loop {
                if w & BLOCK_USED == BLOCK_USED {
                    return Err(MemoryError::InvalidFree {
                        reason: format!(
                            "block {bindex} at {ptr:#x} is not owned by arena {}",
                            self.id
                        ),
                        free: ba.blocks_free(),
                        total: ba.blocks_total(),
                    });
                }
                let points_to = ba.get_index(mem, w)?;
                if points_to == bindex {
                    break;
                }
                w = points_to;
            }
            let next = ba.get_index(mem, bindex)?;
            ba.set_index(mem, w, next)?;
        }
        ba.free_block(mem, bindex)
    }

    fn push_free(&self, mem: &mut FlatMemory, po2: u8, ptr: Addr) -> Result<(), MemoryError> {
        let old_root = self.po2_root(mem, po2)?;
        mem.write(ptr, old_root)?;
        self.set_po2_root(mem, po2, ptr)
    }

    fn pop_free(
        &self,
        mem: &mut FlatMemory,
        ba: &mut BlockAllocator,
        po2: u8,
    ) -> Result<Addr, MemoryError> {
        if po2 == BLOCK_PO2 {
            return self.alloc_whole_block(mem, ba);
        }
        let head = self.po2_root(mem, po2)?;
        if head != 0 {
            let next = mem.read(head)?;
            self.set_po2_root(mem, po2, next)?;
        }
        Ok(head)
    }

    /// Allocate one region of class `2^want_po2`, clamped up to the
    /// minimum class. Returns the null address when no memory can be
    /// found; callers own the exhaustion policy.
    pub fn alloc(
        &self,
        mem: &mut FlatMemory,
        ba: &mut BlockAllocator,
        want_po2: u8,
    ) -> Result<Addr, MemoryError> {
        if want_po2 > BLOCK_PO2 {
            return Err(MemoryError::BadSizeClass {
                po2: want_po2,
                max: BLOCK_PO2,
            });
        }
        let want_po2 = Self::real_po2(want_po2);

        // walk upward to the first class with a free region
        let mut po2 = want_po2;
        let mut free_mem;
        loop {
            free_mem = self.pop_free(mem, ba, po2)?;
            if free_mem != 0 || po2 == BLOCK_PO2 {
                break;
            }
            po2 += 1;
        }
        if free_mem == 0 {
            return Ok(0);
        }

        // split down, banking the upper halves
        while po2 > want_po2 {
            po2 -= 1;
            let extra = free_mem + (1u32 << po2);
            self.push_free(mem, po2, extra)?;
        }
        Ok(free_mem)
    }

    /// Free one region of class `2^po2` (clamped up as in alloc).
    /// Adjacent to the class's current free-list head, the two merge
    /// and the merge retries one class higher; otherwise the region is
    /// pushed as-is.
    pub fn free(
        &self,
        mem: &mut FlatMemory,
        ba: &mut BlockAllocator,
        po2: u8,
        ptr: Addr,
    ) -> Result<(), MemoryError> {
        if po2 > BLOCK_PO2 {
            return Err(MemoryError::BadSizeClass {
                po2,
                max: BLOCK_PO2,
            });
        }
        let mut po2 = Self::real_po2(po2);
        let mut ptr = ptr;
        loop {
            if po2 == BLOCK_PO2 {
                return self.free_whole_block(mem, ba, ptr);
            }
            let root = self.po2_root(mem, po2)?;
            let joined = join_mem(ptr, root, 1u32 << po2);
            if joined == 0 {
                return self.push_free(mem, po2, ptr);
            }
            // the head participates in the join; remove it and retry
            // one class up with the coalesced region
            self.pop_free(mem, ba, po2)?;
            ptr = joined;
            po2 += 1;
        }
    }

    /// Indexes of every block this arena currently owns
    pub fn owned_blocks(
        &self,
        mem: &FlatMemory,
        ba: &BlockAllocator,
    ) -> Result<Vec<BlockIdx>, MemoryError> {
        let mut owned = Vec::new();
        let mut idx = self.block_root(mem)?;
        while idx & BLOCK_USED != BLOCK_USED {
            if idx == BLOCK_FREE || owned.len() > ba.blocks_total() as usize {
                return Err(MemoryError::CorruptFreeList {
                    detail: format!("owned-block list of arena {} does not terminate", self.id),
                });
            }
            owned.push(idx);
            idx = ba.get_index(mem, idx)?;
        }
        Ok(owned)
    }

    /// Bulk release: return every owned block to the block allocator
    /// without walking individual allocations, resetting the arena to
    /// its freshly-created state.
    pub fn release(
        &self,
        mem: &mut FlatMemory,
        ba: &mut BlockAllocator,
    ) -> Result<(), MemoryError> {
        let mut idx = self.block_root(mem)?;
        let mut steps = 0u16;
        while idx & BLOCK_USED != BLOCK_USED {
            if idx == BLOCK_FREE || steps > ba.blocks_total() {
                return Err(MemoryError::CorruptFreeList {
                    detail: format!("owned-block list of arena {} does not terminate", self.id),
                });
            }
            let next = ba.get_index(mem, idx)?;
            ba.free_block(mem, idx)?;
            idx = next;
            steps += 1;
        }
        self.set_block_root(mem, BLOCK_USED | u16::from(self.id))?;
        for po2 in ARENA_PO2_MIN..BLOCK_PO2 {
            self.set_po2_root(mem, po2, 0)?;
        }
        Ok(())
    }
}
