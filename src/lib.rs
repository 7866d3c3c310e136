//! ironbark - a flat-memory runtime model for a small stack machine
//!
//! Everything the machine touches lives in one contiguous byte buffer
//! addressed by 32-bit offsets, so the full runtime state can be
//! inspected, snapshotted and diffed as bytes. On top of the buffer
//! sit resident control structs: bump heaps, a fixed-block allocator,
//! buddy-style arenas and downward-growing typed stacks, all of whose
//! headers are themselves bytes in the buffer. The layout engine
//! computes C-like struct offsets, and [`machine::Env`] wires the
//! whole map together.

pub mod error;
pub mod layout;
pub mod machine;
pub mod memory;
pub mod types;
