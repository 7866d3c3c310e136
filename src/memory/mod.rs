//! Memory management: the flat region and the allocators carved from it
//!
//! Layered bottom-up: [`flat::FlatMemory`] is the bounds-checked
//! substrate, [`heap::Heap`] bump-allocates within it, [`blocks`] hands
//! out fixed 4 KiB blocks and [`arena`] serves power-of-two requests on
//! top of the blocks. Every allocator keeps its control structure inside
//! the flat region itself so that the byte layout of a whole context is
//! reproducible.

pub mod arena;
pub mod blocks;
pub mod flat;
pub mod heap;

use thiserror::Error;

use crate::types::Addr;

pub use arena::Arena;
pub use blocks::BlockAllocator;
pub use flat::FlatMemory;
pub use heap::Heap;

/// Errors raised by the memory substrate and allocators.
///
/// Exhaustion is not among them: running out of blocks or arena memory
/// is reported in-band (a null address or the out-of-blocks sentinel)
/// since it is an expected outcome for callers to handle. `Err` means a
/// bounds violation, a misuse or corrupted allocator state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("address range out of bounds: addr={addr:#x} size={size} limit={limit:#x}")]
    OutOfRange { addr: Addr, size: u32, limit: Addr },
    #[error("misaligned: value {value:#x} is not a multiple of {align}")]
    Misaligned { value: u32, align: u32 },
    #[error("invalid free: {reason} (free={free}, total={total})")]
    InvalidFree { reason: String, free: u16, total: u16 },
    #[error("corrupt free list: {detail}")]
    CorruptFreeList { detail: String },
    #[error("bad size class 2^{po2}: largest allocatable class is 2^{max}")]
    BadSizeClass { po2: u8, max: u8 },
    #[error("value size mismatch: {ty} is {expected} bytes but the value carries {found}")]
    ValueSizeMismatch { ty: String, expected: u32, found: u32 },
}
