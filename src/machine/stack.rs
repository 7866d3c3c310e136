//! Downward-growing typed stacks
//!
//! A [`Stack`] keeps its live bytes in flat memory between `start` and
//! `end`, growing from `end` toward `start` so the stack pointer always
//! names the current top. Alongside the bytes it keeps a shadow list of
//! types, one entry per pushed value or grown frame. The shadow list is
//! native bookkeeping only; nothing in flat memory depends on it, and
//! it exists so every pop can be checked against what was actually
//! pushed.
//!
//! Stack slots are word-granular: a value occupies one or two words,
//! never a partial word.

use std::fmt;
use std::rc::Rc;

use crate::error::RuntimeError;
use crate::layout::FnStructTy;
use crate::memory::{FlatMemory, MemoryError};
use crate::types::{need_align, Addr, Ty, Value, WORD_SIZE};

/// The stack header as laid out in flat memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MStack {
    pub start: Addr,
    pub end: Addr,
    pub sp: Addr,
}

impl MStack {
    pub const SIZE: u32 = 12;

    pub fn store(&self, mem: &mut FlatMemory, addr: Addr) -> Result<(), MemoryError> {
        mem.write(addr, self.start)?;
        mem.write(addr + 4, self.end)?;
        mem.write(addr + 8, self.sp)
    }

    pub fn load(mem: &FlatMemory, addr: Addr) -> Result<Self, MemoryError> {
        Ok(MStack {
            start: mem.read(addr)?,
            end: mem.read(addr + 4)?,
            sp: mem.read(addr + 8)?,
        })
    }
}

/// One shadow entry: either a plain pushed value or a function frame
#[derive(Debug, Clone)]
pub enum ShadowTy {
    Value(Ty),
    Frame(Rc<FnStructTy>),
}

impl ShadowTy {
    fn describe(&self) -> String {
        match self {
            ShadowTy::Value(ty) => ty.to_string(),
            ShadowTy::Frame(f) => format!("frame[{} bytes]", f.size()),
        }
    }
}

/// Handle over a stack header resident in flat memory
#[derive(Debug, Clone)]
pub struct Stack {
    hdr: Addr,
    start: Addr,
    end: Addr,
    tys: Vec<ShadowTy>,
}

impl Stack {
    /// Write a fresh, empty header at `hdr` for the region
    /// `[start, end)`
    pub fn new(
        mem: &mut FlatMemory,
        hdr: Addr,
        start: Addr,
        end: Addr,
    ) -> Result<Self, MemoryError> {
        MStack {
            start,
            end,
            sp: end,
        }
        .store(mem, hdr)?;
        Ok(Stack {
            hdr,
            start,
            end,
            tys: Vec::new(),
        })
    }

    pub fn hdr_addr(&self) -> Addr {
        self.hdr
    }

    pub fn start(&self) -> Addr {
        self.start
    }

    pub fn end(&self) -> Addr {
        self.end
    }

    pub fn sp(&self, mem: &FlatMemory) -> Result<Addr, MemoryError> {
        mem.read(self.hdr + 8)
    }

    fn set_sp(&self, mem: &mut FlatMemory, sp: Addr) -> Result<(), MemoryError> {
        mem.write(self.hdr + 8, sp)
    }

    /// Live bytes currently on the stack
    pub fn len(&self, mem: &FlatMemory) -> Result<u32, MemoryError> {
        Ok(self.end - self.sp(mem)?)
    }

    pub fn is_empty(&self) -> bool {
        self.tys.is_empty()
    }

    /// Shadow types from the top of stack down
    pub fn shadow(&self) -> &[ShadowTy] {
        &self.tys
    }

    fn slot_size(size: u32) -> Result<u32, RuntimeError> {
        if size != WORD_SIZE && size != 2 * WORD_SIZE {
            return Err(MemoryError::Misaligned {
                value: size,
                align: WORD_SIZE,
            }
            .into());
        }
        Ok(size)
    }

    /// Push one value, one or two words wide
    pub fn push(&mut self, mem: &mut FlatMemory, value: &Value) -> Result<(), RuntimeError> {
        let size = Self::slot_size(value.size() + need_align(value.size()))?;
        let sp = self.sp(mem)?;
        if sp - self.start < size {
            return Err(MemoryError::OutOfRange {
                addr: sp.wrapping_sub(size),
                size,
                limit: self.end,
            }
            .into());
        }
        let sp = sp - size;
        mem.write_value(sp, value)?;
        self.set_sp(mem, sp)?;
        self.tys.push(ShadowTy::Value(value.ty()));
        Ok(())
    }

    /// Pop the top value, checking it against the expected type's size
    /// class and the shadow list
    pub fn pop(&mut self, mem: &mut FlatMemory, ty: &Ty) -> Result<Value, RuntimeError> {
        let want = Self::slot_size(ty.size() + need_align(ty.size()))?;
        let shadow = match self.tys.last() {
            Some(s) => s,
            None => {
                return Err(RuntimeError::StackUnderflow {
                    needed: want,
                    len: self.len(mem)?,
                })
            }
        };
        let have = match shadow {
            ShadowTy::Value(t) => t.size() + need_align(t.size()),
            ShadowTy::Frame(_) => {
                return Err(RuntimeError::TypeMismatch {
                    expected: ty.to_string(),
                    found: shadow.describe(),
                })
            }
        };
        if have != want {
            return Err(RuntimeError::TypeMismatch {
                expected: ty.to_string(),
                found: shadow.describe(),
            });
        }
        let sp = self.sp(mem)?;
        let value = mem.read_value(sp, ty)?;
        self.set_sp(mem, sp + want)?;
        self.tys.pop();
        Ok(value)
    }

    /// Read a value at a byte offset from the top of stack without
    /// moving the stack pointer
    pub fn get(&self, mem: &FlatMemory, offset: u32, ty: &Ty) -> Result<Value, RuntimeError> {
        let addr = self.index_addr(mem, offset, ty.size())?;
        Ok(mem.read_value(addr, ty)?)
    }

    /// Overwrite a value at a byte offset from the top of stack
    pub fn set(&self, mem: &mut FlatMemory, offset: u32, value: &Value) -> Result<(), RuntimeError> {
        let addr = self.index_addr(mem, offset, value.size())?;
        Ok(mem.write_value(addr, value)?)
    }

    fn index_addr(&self, mem: &FlatMemory, offset: u32, size: u32) -> Result<Addr, RuntimeError> {
        let sp = self.sp(mem)?;
        // widened so a huge offset underflows instead of wrapping
        let addr = u64::from(sp) + u64::from(offset);
        if addr + u64::from(size) > u64::from(self.end) {
            return Err(RuntimeError::StackUnderflow {
                needed: offset.saturating_add(size),
                len: self.end - sp,
            });
        }
        Ok(addr as Addr)
    }

    /// Reserve a function's frame on the stack, returning the frame's
    /// base address (the new stack pointer)
    pub fn grow(
        &mut self,
        mem: &mut FlatMemory,
        frame: &Rc<FnStructTy>,
    ) -> Result<Addr, RuntimeError> {
        let size = frame.size() + need_align(frame.size());
        let sp = self.sp(mem)?;
        if sp - self.start < size {
            return Err(MemoryError::OutOfRange {
                addr: sp.wrapping_sub(size),
                size,
                limit: self.end,
            }
            .into());
        }
        let sp = sp - size;
        self.set_sp(mem, sp)?;
        self.tys.push(ShadowTy::Frame(Rc::clone(frame)));
        Ok(sp)
    }

    /// Drop a frame previously reserved with [`Stack::grow`]. The
    /// frame descriptor must be the very one that grew the stack.
    pub fn shrink(
        &mut self,
        mem: &mut FlatMemory,
        frame: &Rc<FnStructTy>,
    ) -> Result<(), RuntimeError> {
        let size = frame.size() + need_align(frame.size());
        let shadow = match self.tys.last() {
            Some(s) => s,
            None => {
                return Err(RuntimeError::StackUnderflow {
                    needed: size,
                    len: self.len(mem)?,
                })
            }
        };
        match shadow {
            ShadowTy::Frame(top) if Rc::ptr_eq(top, frame) => {}
            other => {
                return Err(RuntimeError::FrameMismatch {
                    frame: other.describe(),
                });
            }
        }
        let sp = self.sp(mem)?;
        if sp + size > self.end {
            return Err(RuntimeError::StackUnderflow {
                needed: size,
                len: self.end - sp,
            });
        }
        self.set_sp(mem, sp + size)?;
        self.tys.pop();
        Ok(())
    }

    /// Forget everything on the stack
    pub fn clear(&mut self, mem: &mut FlatMemory) -> Result<(), MemoryError> {
        self.tys.clear();
        MStack {
            start: self.start,
            end: self.end,
            sp: self.end,
        }
        .store(mem, self.hdr)
    }

    /// One-line rendering for debug output
    pub fn render(&self, mem: &FlatMemory) -> Result<String, MemoryError> {
        Ok(format!(
            "STACK<{}/{}>",
            self.len(mem)?,
            self.end - self.start
        ))
    }
}

impl fmt::Display for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "STACK[{:#x}..{:#x}]", self.start, self.end)
    }
}
