//! The word model and runtime type tags
//!
//! Addresses are plain `u32` offsets into a flat memory region; the
//! machine word is four bytes on every host so that identical operation
//! sequences produce identical addresses everywhere, including on the
//! eventual embedded targets.

use std::fmt;
use std::rc::Rc;

use crate::layout::StructTy;

/// An offset into a [`crate::memory::FlatMemory`] buffer. Address 0 is
/// never valid; it is poisoned at initialisation so stray null reads are
/// detectable.
pub type Addr = u32;

/// Machine word size in bytes
pub const WORD_SIZE: u32 = 4;

/// Padding required to bring `size` up to the next word boundary.
///
/// Always less than [`WORD_SIZE`].
pub fn need_align(size: u32) -> u32 {
    (WORD_SIZE - size % WORD_SIZE) % WORD_SIZE
}

/// The smallest power-of-two exponent `p` such that `2^p >= size`
pub fn po2_class(size: u32) -> u8 {
    debug_assert!(size > 0);
    size.next_power_of_two().trailing_zeros() as u8
}

/// Tag for a fixed-width primitive type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimTy {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
}

impl PrimTy {
    pub fn size(&self) -> u32 {
        match self {
            PrimTy::U8 | PrimTy::I8 => 1,
            PrimTy::U16 | PrimTy::I16 => 2,
            PrimTy::U32 | PrimTy::I32 => 4,
            PrimTy::U64 | PrimTy::I64 => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PrimTy::U8 => "U8",
            PrimTy::U16 => "U16",
            PrimTy::U32 => "U32",
            PrimTy::U64 => "U64",
            PrimTy::I8 => "I8",
            PrimTy::I16 => "I16",
            PrimTy::I32 => "I32",
            PrimTy::I64 => "I64",
        }
    }
}

impl fmt::Display for PrimTy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A runtime type: the closed set of tags the layout engine and stacks
/// understand. References are pointer-sized regardless of pointee.
#[derive(Debug, Clone, PartialEq)]
pub enum Ty {
    Prim(PrimTy),
    Struct(Rc<StructTy>),
    Ref(Rc<Ty>),
}

impl Ty {
    pub fn size(&self) -> u32 {
        match self {
            Ty::Prim(p) => p.size(),
            Ty::Struct(st) => st.size(),
            Ty::Ref(_) => WORD_SIZE,
        }
    }

    /// True for the empty struct used as the "no return value" shape
    pub fn is_void(&self) -> bool {
        matches!(self, Ty::Struct(st) if st.is_void())
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Prim(p) => write!(f, "{p}"),
            Ty::Struct(st) => write!(f, "{}", st.name()),
            Ty::Ref(ty) => write!(f, "&{ty}"),
        }
    }
}

/// A typed runtime value as passed through heap globals and stack slots
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    /// A struct-typed value carried as raw bytes alongside its shape
    Struct { ty: Rc<StructTy>, bytes: Vec<u8> },
}

impl Value {
    pub fn ty(&self) -> Ty {
        match self {
            Value::U8(_) => Ty::Prim(PrimTy::U8),
            Value::U16(_) => Ty::Prim(PrimTy::U16),
            Value::U32(_) => Ty::Prim(PrimTy::U32),
            Value::U64(_) => Ty::Prim(PrimTy::U64),
            Value::I8(_) => Ty::Prim(PrimTy::I8),
            Value::I16(_) => Ty::Prim(PrimTy::I16),
            Value::I32(_) => Ty::Prim(PrimTy::I32),
            Value::I64(_) => Ty::Prim(PrimTy::I64),
            Value::Struct { ty, .. } => Ty::Struct(Rc::clone(ty)),
        }
    }

    pub fn size(&self) -> u32 {
        self.ty().size()
    }

    /// Little-endian byte rendering, the layout contract for all stored
    /// values
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::U8(v) => v.to_le_bytes().to_vec(),
            Value::U16(v) => v.to_le_bytes().to_vec(),
            Value::U32(v) => v.to_le_bytes().to_vec(),
            Value::U64(v) => v.to_le_bytes().to_vec(),
            Value::I8(v) => v.to_le_bytes().to_vec(),
            Value::I16(v) => v.to_le_bytes().to_vec(),
            Value::I32(v) => v.to_le_bytes().to_vec(),
            Value::I64(v) => v.to_le_bytes().to_vec(),
            Value::Struct { bytes, .. } => bytes.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::U8(v) => write!(f, "{v}u8"),
            Value::U16(v) => write!(f, "{v}u16"),
            Value::U32(v) => write!(f, "{v}u32"),
            Value::U64(v) => write!(f, "{v}u64"),
            Value::I8(v) => write!(f, "{v}i8"),
            Value::I16(v) => write!(f, "{v}i16"),
            Value::I32(v) => write!(f, "{v}i32"),
            Value::I64(v) => write!(f, "{v}i64"),
            Value::Struct { ty, .. } => write!(f, "{}{{..}}", ty.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_need_align() {
        assert_eq!(need_align(0), 0);
        assert_eq!(need_align(1), 3);
        assert_eq!(need_align(2), 2);
        assert_eq!(need_align(3), 1);
        assert_eq!(need_align(4), 0);
        assert_eq!(need_align(5), 3);
        for s in 0..64 {
            let p = need_align(s);
            assert!(p < WORD_SIZE);
            assert_eq!((s + p) % WORD_SIZE, 0);
        }
    }

    #[test]
    fn test_po2_class() {
        assert_eq!(po2_class(1), 0);
        assert_eq!(po2_class(2), 1);
        assert_eq!(po2_class(3), 2);
        assert_eq!(po2_class(8), 3);
        assert_eq!(po2_class(9), 4);
        assert_eq!(po2_class(4096), 12);
    }

    #[test]
    fn test_prim_sizes() {
        assert_eq!(PrimTy::U8.size(), 1);
        assert_eq!(PrimTy::I16.size(), 2);
        assert_eq!(PrimTy::U32.size(), 4);
        assert_eq!(PrimTy::I64.size(), 8);
    }

    #[test]
    fn test_value_bytes_little_endian() {
        assert_eq!(Value::U32(0xDEAD_BEEF).to_bytes(), vec![0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(Value::U16(0x8000).to_bytes(), vec![0x00, 0x80]);
        assert_eq!(Value::I8(-1).to_bytes(), vec![0xFF]);
    }
}
