//! The abstract machine: typed stacks over flat memory and the
//! environment that wires memory, allocators, and registries together.

pub mod env;
pub mod stack;

pub use self::env::{Env, Fn};
pub use self::stack::{ShadowTy, Stack};
