//! The bump-pointer heap
//!
//! A heap is a `{start, end, cursor}` header resident in flat memory
//! plus a host-side registry of named globals. Growth advances the
//! cursor (word-aligned by default) and never moves earlier
//! allocations; the allocators' own control structures and all global
//! variables live here.

use super::flat::FlatMemory;
use super::MemoryError;
use crate::error::RuntimeError;
use crate::types::{need_align, Addr, Ty, Value, WORD_SIZE};

/// The heap header as laid out in flat memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MHeap {
    pub start: Addr,
    pub end: Addr,
    pub cursor: Addr,
}

impl MHeap {
    pub const SIZE: u32 = 3 * WORD_SIZE;

    pub fn load(mem: &FlatMemory, addr: Addr) -> Result<Self, MemoryError> {
        Ok(MHeap {
            start: mem.read(addr)?,
            end: mem.read(addr + WORD_SIZE)?,
            cursor: mem.read(addr + 2 * WORD_SIZE)?,
        })
    }

    pub fn store(&self, mem: &mut FlatMemory, addr: Addr) -> Result<(), MemoryError> {
        mem.write(addr, self.start)?;
        mem.write(addr + WORD_SIZE, self.end)?;
        mem.write(addr + 2 * WORD_SIZE, self.cursor)
    }
}

/// A named global variable record
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalVar {
    pub index: usize,
    pub name: String,
    pub ty: Ty,
    pub addr: Addr,
}

/// Handle over a heap header resident in flat memory
#[derive(Debug, Clone)]
pub struct Heap {
    hdr: Addr,
    globals: Vec<GlobalVar>,
}

impl Heap {
    /// Write a fresh header at `hdr` governing `[start, end)`
    pub fn new(
        mem: &mut FlatMemory,
        hdr: Addr,
        start: Addr,
        end: Addr,
    ) -> Result<Self, MemoryError> {
        MHeap {
            start,
            end,
            cursor: start,
        }
        .store(mem, hdr)?;
        Ok(Heap {
            hdr,
            globals: Vec::new(),
        })
    }

    /// Bootstrap a heap whose own header is its first allocation: the
    /// header is written at `cursor` and the heap immediately grows
    /// over it, so the header accounts for itself.
    pub fn bootstrap(
        mem: &mut FlatMemory,
        start: Addr,
        end: Addr,
        cursor: Addr,
    ) -> Result<Self, MemoryError> {
        MHeap { start, end, cursor }.store(mem, cursor)?;
        let heap = Heap {
            hdr: cursor,
            globals: Vec::new(),
        };
        let own = heap.grow(mem, MHeap::SIZE, true)?;
        debug_assert_eq!(own, heap.hdr);
        Ok(heap)
    }

    /// Address of this heap's header within flat memory
    pub fn hdr_addr(&self) -> Addr {
        self.hdr
    }

    pub fn start(&self, mem: &FlatMemory) -> Result<Addr, MemoryError> {
        Ok(MHeap::load(mem, self.hdr)?.start)
    }

    pub fn end(&self, mem: &FlatMemory) -> Result<Addr, MemoryError> {
        Ok(MHeap::load(mem, self.hdr)?.end)
    }

    pub fn cursor(&self, mem: &FlatMemory) -> Result<Addr, MemoryError> {
        Ok(MHeap::load(mem, self.hdr)?.cursor)
    }

    fn check_range(m: &MHeap, ptr: Addr, size: u32) -> Result<(), MemoryError> {
        // widened so a huge size reports OutOfRange instead of wrapping
        if ptr < m.start || u64::from(ptr) + u64::from(size) > u64::from(m.end) {
            return Err(MemoryError::OutOfRange {
                addr: ptr,
                size,
                limit: m.end,
            });
        }
        Ok(())
    }

    /// Advance the cursor by `size` (word-padded if `align`), returning
    /// the start of the grown region
    pub fn grow(&self, mem: &mut FlatMemory, size: u32, align: bool) -> Result<Addr, MemoryError> {
        let size = if align {
            size.saturating_add(need_align(size))
        } else {
            size
        };
        let mut m = MHeap::load(mem, self.hdr)?;
        Self::check_range(&m, m.cursor, size)?;
        let out = m.cursor;
        m.cursor += size;
        m.store(mem, self.hdr)?;
        Ok(out)
    }

    /// Retreat the cursor by `size` (word-padded if `align`)
    pub fn shrink(&self, mem: &mut FlatMemory, size: u32, align: bool) -> Result<(), MemoryError> {
        let size = if align {
            size.saturating_add(need_align(size))
        } else {
            size
        };
        let mut m = MHeap::load(mem, self.hdr)?;
        let new_cursor = m.cursor.checked_sub(size).ok_or(MemoryError::OutOfRange {
            addr: m.cursor,
            size,
            limit: m.start,
        })?;
        Self::check_range(&m, new_cursor, size)?;
        m.cursor = new_cursor;
        m.store(mem, self.hdr)?;
        Ok(())
    }

    /// Grow then write, returning the address of the written value
    pub fn push_value(
        &self,
        mem: &mut FlatMemory,
        value: &Value,
        align: bool,
    ) -> Result<Addr, MemoryError> {
        let addr = self.grow(mem, value.size(), align)?;
        mem.write_value(addr, value)?;
        Ok(addr)
    }

    /// As [`Heap::push_value`], additionally recording a named global.
    /// The returned index is positional and stable for the heap's life.
    pub fn push_global(
        &mut self,
        mem: &mut FlatMemory,
        value: &Value,
        name: &str,
    ) -> Result<usize, MemoryError> {
        let addr = self.push_value(mem, value, true)?;
        let index = self.globals.len();
        self.globals.push(GlobalVar {
            index,
            name: name.to_string(),
            ty: value.ty(),
            addr,
        });
        Ok(index)
    }

    pub fn get_global(&self, mem: &FlatMemory, index: usize) -> Result<Value, RuntimeError> {
        let gl = self.global(index)?;
        Ok(mem.read_value(gl.addr, &gl.ty)?)
    }

    /// Typed global assignment. The stored type must match the value's
    /// exactly unless `only_check_size` is set, in which case any value
    /// of identical size is accepted (the escape hatch for records
    /// whose nominal type evolves while their footprint does not).
    pub fn set_global(
        &self,
        mem: &mut FlatMemory,
        index: usize,
        value: &Value,
        only_check_size: bool,
    ) -> Result<(), RuntimeError> {
        let gl = self.global(index)?;
        if only_check_size {
            if value.size() != gl.ty.size() {
                return Err(RuntimeError::TypeMismatch {
                    expected: format!("{} ({} bytes)", gl.ty, gl.ty.size()),
                    found: format!("{} ({} bytes)", value.ty(), value.size()),
                });
            }
        } else if value.ty() != gl.ty {
            return Err(RuntimeError::TypeMismatch {
                expected: gl.ty.to_string(),
                found: value.ty().to_string(),
            });
        }
        mem.write_value(gl.addr, value)?;
        Ok(())
    }

    fn global(&self, index: usize) -> Result<&GlobalVar, RuntimeError> {
        self.globals.get(index).ok_or(RuntimeError::BadGlobalIndex {
            index,
            count: self.globals.len(),
        })
    }

    pub fn globals(&self) -> &[GlobalVar] {
        &self.globals
    }

    pub fn global_named(&self, name: &str) -> Option<&GlobalVar> {
        self.globals.iter().find(|g| g.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrimTy;

    fn fixture() -> (FlatMemory, Heap) {
        let mut mem = FlatMemory::new(256);
        let heap = Heap::new(&mut mem, 4, 16, 256).unwrap();
        (mem, heap)
    }

    #[test]
    fn test_grow_shrink() {
        let (mut mem, heap) = fixture();
        assert_eq!(heap.grow(&mut mem, 8, true).unwrap(), 16);
        assert_eq!(heap.grow(&mut mem, 3, true).unwrap(), 24);
        // 3 padded up to a word
        assert_eq!(heap.cursor(&mem).unwrap(), 28);
        assert_eq!(heap.grow(&mut mem, 3, false).unwrap(), 28);
        assert_eq!(heap.cursor(&mem).unwrap(), 31);

        heap.shrink(&mut mem, 3, false).unwrap();
        heap.shrink(&mut mem, 3, true).unwrap();
        heap.shrink(&mut mem, 8, true).unwrap();
        assert_eq!(heap.cursor(&mem).unwrap(), 16);
        assert!(heap.shrink(&mut mem, 4, true).is_err());
    }

    #[test]
    fn test_grow_exhaustion() {
        let (mut mem, heap) = fixture();
        assert!(heap.grow(&mut mem, 240, true).is_ok());
        assert_eq!(heap.cursor(&mem).unwrap(), 256);
        assert!(matches!(
            heap.grow(&mut mem, 4, true),
            Err(MemoryError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_grow_huge_size_is_out_of_range() {
        let (mut mem, heap) = fixture();
        assert!(matches!(
            heap.grow(&mut mem, u32::MAX - 8, false),
            Err(MemoryError::OutOfRange { .. })
        ));
        assert!(matches!(
            heap.grow(&mut mem, u32::MAX - 1, true),
            Err(MemoryError::OutOfRange { .. })
        ));
        assert!(matches!(
            heap.shrink(&mut mem, u32::MAX - 1, true),
            Err(MemoryError::OutOfRange { .. })
        ));
        // cursor untouched by the refused operations
        assert_eq!(heap.cursor(&mem).unwrap(), 16);
    }

    #[test]
    fn test_bootstrap_self_accounts() {
        let mut mem = FlatMemory::new(256);
        let heap = Heap::bootstrap(&mut mem, 4, 256, 32).unwrap();
        assert_eq!(heap.hdr_addr(), 32);
        assert_eq!(heap.cursor(&mem).unwrap(), 32 + MHeap::SIZE);
        assert_eq!(heap.start(&mem).unwrap(), 4);
    }

    #[test]
    fn test_push_value_live_at_address() {
        let (mut mem, heap) = fixture();
        let addr = heap.push_value(&mut mem, &Value::U32(7), true).unwrap();
        assert_eq!(mem.read::<u32>(addr).unwrap(), 7);
    }

    #[test]
    fn test_globals() {
        let (mut mem, mut heap) = fixture();
        let a = heap.push_global(&mut mem, &Value::U32(1), "a").unwrap();
        let b = heap.push_global(&mut mem, &Value::U16(2), "b").unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(heap.get_global(&mem, 0).unwrap(), Value::U32(1));
        assert_eq!(heap.global_named("b").unwrap().index, 1);

        heap.set_global(&mut mem, 0, &Value::U32(9), false).unwrap();
        assert_eq!(heap.get_global(&mem, 0).unwrap(), Value::U32(9));

        // exact type check by default
        let e = heap
            .set_global(&mut mem, 0, &Value::I32(-1), false)
            .unwrap_err();
        assert!(matches!(e, RuntimeError::TypeMismatch { .. }));

        // size-only mode admits same-width values of a different type
        heap.set_global(&mut mem, 0, &Value::I32(-1), true).unwrap();
        let e = heap
            .set_global(&mut mem, 0, &Value::U64(0), true)
            .unwrap_err();
        assert!(matches!(e, RuntimeError::TypeMismatch { .. }));

        let e = heap.get_global(&mem, 5).unwrap_err();
        assert!(matches!(e, RuntimeError::BadGlobalIndex { index: 5, .. }));
    }
}
