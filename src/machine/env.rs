//! The machine environment
//!
//! [`Env`] owns the flat memory and wires the resident control structs
//! together: the global heap (whose header is its own first
//! allocation), the code heap, the block allocator, the root arena and
//! the return stack. The memory map is fixed at construction:
//!
//! ```text
//! 0                word 0, poisoned
//! 4      .. 8192   code heap
//! 8192   .. 49152  block pool (10 blocks of 4 KiB)
//! 49152  .. 49172  block index array
//! 49172  ..        global heap cursor (headers first, then globals)
//! 63488  .. 65536  return stack
//! ```
//!
//! The data stack lives in its own small [`FlatMemory`], outside the
//! map above, so stray heap writes cannot corrupt working values.
//!
//! Header addresses are deterministic: the construction order above is
//! a contract, and `test_memory_layout` pins every address.

use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::RuntimeError;
use crate::layout::{FnStructTy, StructTy};
use crate::machine::stack::{MStack, Stack};
use crate::memory::arena::{Arena, MArena};
use crate::memory::blocks::{BlockAllocator, BLOCK_SIZE};
use crate::memory::heap::{Heap, MHeap};
use crate::memory::{FlatMemory, MemoryError};
use crate::types::{Addr, PrimTy, Ty, Value, WORD_SIZE};

/// Total flat memory
pub const MEMORY_SIZE: u32 = 0x1_0000;
/// Region reserved for the return stack at the top of memory
pub const RETURN_STACK_SIZE: u32 = 0x800;
/// Code heap occupies low memory up to this address
pub const CODE_HEAP_SIZE: u32 = 0x2000;
/// Bytes given to the block pool
pub const BLOCKS_ALLOCATOR_SIZE: u32 = 0xA000;
/// Blocks in the pool
pub const BLOCKS_TOTAL: u16 = (BLOCKS_ALLOCATOR_SIZE / BLOCK_SIZE) as u16;
/// Bytes of the block index array
pub const BLOCKS_INDEXES_SIZE: u32 = BLOCKS_TOTAL as u32 * 2;
/// Start of the block index array
pub const BLOCKS_INDEXES: Addr = RESERVED - BLOCKS_INDEXES_SIZE;
/// Global heap cursor starts here; everything below is mapped
pub const RESERVED: Addr = 0xC014;

/// Bytes of working room on the data stack
pub const DATA_STACK_SIZE: u32 = 0x100;

/// A registered function: a call-frame shape plus opaque code.
///
/// Code words are not interpreted here; execution is a separate
/// concern. The frame is what the machine needs to reserve and address
/// the function's return slot, arguments and locals.
#[derive(Debug, Clone)]
pub struct Fn {
    name: Option<String>,
    frame: Rc<FnStructTy>,
    code: Vec<u32>,
    addr: Option<Addr>,
}

impl Fn {
    pub fn new(name: Option<String>, frame: Rc<FnStructTy>, code: Vec<u32>) -> Self {
        Fn {
            name,
            frame,
            code,
            addr: None,
        }
    }

    /// Build a function from a flat signature. At most one output is
    /// allowed; it becomes the frame's reference-typed return slot.
    pub fn from_signature(
        name: &str,
        inputs: &[(&str, Ty)],
        outputs: &[Ty],
        locals: &[(&str, Ty)],
        code: Vec<u32>,
    ) -> Result<Self, RuntimeError> {
        let ret = match outputs {
            [] => Ty::Struct(StructTy::void()),
            [one] => Ty::Ref(Rc::new(one.clone())),
            more => {
                return Err(crate::layout::LayoutError::InvalidReturnShape {
                    found: format!("{} outputs", more.len()),
                }
                .into())
            }
        };
        let inp = StructTy::new(&format!("{name}.inp"), inputs)?;
        let locals = StructTy::new(&format!("{name}.locals"), locals)?;
        let frame = FnStructTy::new(ret, inp, locals)?;
        Ok(Fn::new(Some(name.to_string()), frame, code))
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn frame(&self) -> &Rc<FnStructTy> {
        &self.frame
    }

    pub fn code(&self) -> &[u32] {
        &self.code
    }

    /// Where the code words were placed in the code heap, once loaded
    pub fn addr(&self) -> Option<Addr> {
        self.addr
    }
}

/// Everything the abstract machine runs against
#[derive(Debug, Clone)]
pub struct Env {
    pub memory: FlatMemory,
    pub ds_mem: FlatMemory,
    pub ds: Stack,
    pub return_stack: Stack,
    pub heap: Heap,
    pub code_heap: Heap,
    pub blocks: BlockAllocator,
    pub arena: Arena,
    fns: Vec<Fn>,
    fn_indexes: IndexMap<String, usize>,
    tys: IndexMap<String, Ty>,
    refs: IndexMap<String, Ty>,
}

type Residents = (
    FlatMemory,
    FlatMemory,
    Stack,
    Stack,
    Heap,
    Heap,
    BlockAllocator,
    Arena,
);

impl Env {
    fn build() -> Result<Residents, MemoryError> {
        let mut memory = FlatMemory::new(MEMORY_SIZE);

        // the global heap header is the heap's own first allocation
        let heap = Heap::bootstrap(
            &mut memory,
            0,
            MEMORY_SIZE - RETURN_STACK_SIZE,
            RESERVED,
        )?;

        // remaining headers are grown from it, in map order
        let hdr = heap.grow(&mut memory, MHeap::SIZE, true)?;
        let code_heap = Heap::new(&mut memory, hdr, WORD_SIZE, CODE_HEAP_SIZE)?;

        let hdr = heap.grow(&mut memory, crate::memory::blocks::MBlockAllocator::SIZE, true)?;
        let blocks = BlockAllocator::new(
            &mut memory,
            hdr,
            CODE_HEAP_SIZE,
            BLOCKS_INDEXES,
            BLOCKS_TOTAL,
        )?;

        let hdr = heap.grow(&mut memory, MStack::SIZE, true)?;
        let return_stack = Stack::new(
            &mut memory,
            hdr,
            MEMORY_SIZE - RETURN_STACK_SIZE,
            MEMORY_SIZE,
        )?;

        let hdr = heap.grow(&mut memory, MArena::SIZE, true)?;
        let arena = Arena::new(&mut memory, hdr, &blocks, 0)?;

        // the data stack gets its own memory, with its header at the top
        let ds_hdr = WORD_SIZE + DATA_STACK_SIZE;
        let mut ds_mem = FlatMemory::new(ds_hdr + MStack::SIZE);
        let ds = Stack::new(&mut ds_mem, ds_hdr, WORD_SIZE, ds_hdr)?;

        Ok((
            memory,
            ds_mem,
            ds,
            return_stack,
            heap,
            code_heap,
            blocks,
            arena,
        ))
    }

    pub fn new() -> Result<Self, MemoryError> {
        let (memory, ds_mem, ds, return_stack, heap, code_heap, blocks, arena) = Self::build()?;
        let mut tys = IndexMap::new();
        for p in [
            PrimTy::U8,
            PrimTy::U16,
            PrimTy::U32,
            PrimTy::U64,
            PrimTy::I8,
            PrimTy::I16,
            PrimTy::I32,
            PrimTy::I64,
        ] {
            tys.insert(p.name().to_string(), Ty::Prim(p));
        }
        tys.insert("Ptr".to_string(), Ty::Prim(PrimTy::U32));
        Ok(Env {
            memory,
            ds_mem,
            ds,
            return_stack,
            heap,
            code_heap,
            blocks,
            arena,
            fns: Vec::new(),
            fn_indexes: IndexMap::new(),
            tys,
            refs: IndexMap::new(),
        })
    }

    /// Reset every resident struct and both memories to their
    /// freshly-built state. Registered functions and types survive;
    /// globals do not, their bytes are gone.
    pub fn clear_memory(&mut self) -> Result<(), MemoryError> {
        let (memory, ds_mem, ds, return_stack, heap, code_heap, blocks, arena) = Self::build()?;
        self.memory = memory;
        self.ds_mem = ds_mem;
        self.ds = ds;
        self.return_stack = return_stack;
        self.heap = heap;
        self.code_heap = code_heap;
        self.blocks = blocks;
        self.arena = arena;
        Ok(())
    }

    /// An isolated deep copy: handles hold addresses, not pointers, so
    /// a cloned environment re-resolves everything against its own
    /// memory and the two diverge freely.
    pub fn snapshot(&self) -> Env {
        self.clone()
    }

    // data stack conveniences; the stack and its memory are separate
    // fields so these borrow cleanly

    pub fn push(&mut self, value: &Value) -> Result<(), RuntimeError> {
        self.ds.push(&mut self.ds_mem, value)
    }

    pub fn pop(&mut self, ty: &Ty) -> Result<Value, RuntimeError> {
        self.ds.pop(&mut self.ds_mem, ty)
    }

    /// Arena allocation against this environment's memory
    pub fn alloc(&mut self, po2: u8) -> Result<Addr, MemoryError> {
        self.arena.alloc(&mut self.memory, &mut self.blocks, po2)
    }

    pub fn free(&mut self, po2: u8, ptr: Addr) -> Result<(), MemoryError> {
        self.arena.free(&mut self.memory, &mut self.blocks, po2, ptr)
    }

    pub fn register_fn(&mut self, f: Fn) -> usize {
        self.fns.push(f);
        self.fns.len() - 1
    }

    /// Copy a registered function's code words into the code heap and
    /// record their address on the record. Idempotent per function.
    pub fn load_fn_code(&mut self, index: usize) -> Result<Addr, RuntimeError> {
        let count = self.fns.len();
        let f = self
            .fns
            .get_mut(index)
            .ok_or(RuntimeError::BadFnIndex { index, count })?;
        if let Some(addr) = f.addr {
            return Ok(addr);
        }
        let size = f.code.len() as u32 * WORD_SIZE;
        let addr = self.code_heap.grow(&mut self.memory, size, true)?;
        self.memory.write_array(addr, &f.code)?;
        f.addr = Some(addr);
        Ok(addr)
    }

    /// Rebuild the name index over registered functions
    pub fn index_fns(&mut self) -> Result<(), RuntimeError> {
        self.fn_indexes.clear();
        for (i, f) in self.fns.iter().enumerate() {
            if let Some(name) = f.name() {
                if self.fn_indexes.insert(name.to_string(), i).is_some() {
                    return Err(RuntimeError::DuplicateFunction(name.to_string()));
                }
            }
        }
        Ok(())
    }

    pub fn fns(&self) -> &[Fn] {
        &self.fns
    }

    pub fn fn_named(&self, name: &str) -> Option<&Fn> {
        self.fn_indexes.get(name).map(|i| &self.fns[*i])
    }

    pub fn register_ty(&mut self, name: &str, ty: Ty) {
        self.tys.insert(name.to_string(), ty);
    }

    pub fn ty(&self, name: &str) -> Result<&Ty, RuntimeError> {
        self.tys
            .get(name)
            .ok_or_else(|| RuntimeError::UnknownType(name.to_string()))
    }

    /// Reference to a named type, cached so repeated lookups share one
    /// descriptor
    pub fn ref_ty(&mut self, name: &str) -> Result<&Ty, RuntimeError> {
        if !self.refs.contains_key(name) {
            let inner = self.ty(name)?.clone();
            self.refs
                .insert(name.to_string(), Ty::Ref(Rc::new(inner)));
        }
        Ok(&self.refs[name])
    }
}
