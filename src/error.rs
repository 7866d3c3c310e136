//! Top-level runtime errors
//!
//! Faults from the memory subsystem and the layout engine convert
//! upward into [`RuntimeError`] via `From`, so machine-level code can
//! use `?` throughout and callers see one error surface.

use thiserror::Error;

use crate::layout::LayoutError;
use crate::memory::MemoryError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("stack underflow: needed {needed} bytes but only {len} are live")]
    StackUnderflow { needed: u32, len: u32 },

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("stack frame mismatch: top frame is {frame}")]
    FrameMismatch { frame: String },

    #[error("function {0} registered more than once")]
    DuplicateFunction(String),

    #[error("function index {index} out of range ({count} functions)")]
    BadFnIndex { index: usize, count: usize },

    #[error("global index {index} out of range ({count} globals)")]
    BadGlobalIndex { index: usize, count: usize },

    #[error("unknown type {0}")]
    UnknownType(String),
}
