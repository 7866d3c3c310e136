//! The flat addressable memory region
//!
//! A contiguous byte buffer indexed by plain integer addresses. All
//! reads and writes pass through bounds checks; address 0 is reserved
//! and poisoned so a stray null dereference reads a recognisable
//! pattern instead of silently succeeding.

use pretty_hex::pretty_hex;

use super::MemoryError;
use crate::types::{Addr, Ty, Value};

/// Sentinel bytes written at address 0
pub const NULL_POISON: [u8; 2] = [0xDE, 0xAD];

/// A fixed-width scalar that can be stored in flat memory.
///
/// Little-endian byte order throughout; this is the layout contract for
/// every value, header field and free-list link in the region.
pub trait Scalar: Copy {
    const SIZE: u32;
    fn load(bytes: &[u8]) -> Self;
    fn store(self, bytes: &mut [u8]);
}

macro_rules! scalar_impl {
    ($($t:ty),*) => {
        $(impl Scalar for $t {
            const SIZE: u32 = std::mem::size_of::<$t>() as u32;

            fn load(bytes: &[u8]) -> Self {
                <$t>::from_le_bytes(bytes.try_into().expect("scalar width"))
            }

            fn store(self, bytes: &mut [u8]) {
                bytes.copy_from_slice(&self.to_le_bytes());
            }
        })*
    };
}

scalar_impl!(u8, u16, u32, u64, i8, i16, i32, i64);

/// The byte buffer underlying one execution context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatMemory {
    data: Vec<u8>,
}

impl FlatMemory {
    pub fn new(size: u32) -> Self {
        let mut data = vec![0u8; size as usize];
        data[..NULL_POISON.len()].copy_from_slice(&NULL_POISON);
        FlatMemory { data }
    }

    pub fn capacity(&self) -> u32 {
        self.data.len() as u32
    }

    /// Every access must satisfy `0 < addr` and `addr + size <= capacity`
    fn check_range(&self, addr: Addr, size: u32) -> Result<(), MemoryError> {
        let limit = self.capacity();
        if addr == 0 || u64::from(addr) + u64::from(size) > u64::from(limit) {
            return Err(MemoryError::OutOfRange { addr, size, limit });
        }
        Ok(())
    }

    /// Read a detached scalar copy, safe to retain across later writes
    pub fn read<T: Scalar>(&self, addr: Addr) -> Result<T, MemoryError> {
        self.check_range(addr, T::SIZE)?;
        let a = addr as usize;
        Ok(T::load(&self.data[a..a + T::SIZE as usize]))
    }

    pub fn write<T: Scalar>(&mut self, addr: Addr, value: T) -> Result<(), MemoryError> {
        self.check_range(addr, T::SIZE)?;
        let a = addr as usize;
        value.store(&mut self.data[a..a + T::SIZE as usize]);
        Ok(())
    }

    pub fn read_array<T: Scalar>(&self, addr: Addr, len: u32) -> Result<Vec<T>, MemoryError> {
        self.check_range(addr, T::SIZE * len)?;
        (0..len).map(|i| self.read(addr + i * T::SIZE)).collect()
    }

    pub fn write_array<T: Scalar>(&mut self, addr: Addr, values: &[T]) -> Result<(), MemoryError> {
        self.check_range(addr, T::SIZE * values.len() as u32)?;
        for (i, v) in values.iter().enumerate() {
            self.write(addr + i as u32 * T::SIZE, *v)?;
        }
        Ok(())
    }

    /// Borrow a byte range aliased to the buffer. The aliased view is
    /// for in-place inspection; use [`FlatMemory::read`] or
    /// [`FlatMemory::read_value`] for a copy that outlives later writes.
    pub fn bytes(&self, addr: Addr, len: u32) -> Result<&[u8], MemoryError> {
        self.check_range(addr, len)?;
        let a = addr as usize;
        Ok(&self.data[a..a + len as usize])
    }

    /// Mutably borrow a byte range for in-place mutation
    pub fn bytes_mut(&mut self, addr: Addr, len: u32) -> Result<&mut [u8], MemoryError> {
        self.check_range(addr, len)?;
        let a = addr as usize;
        Ok(&mut self.data[a..a + len as usize])
    }

    /// Read a detached [`Value`] of the given type. References read as
    /// their pointer word.
    pub fn read_value(&self, addr: Addr, ty: &Ty) -> Result<Value, MemoryError> {
        use crate::types::PrimTy::*;
        match ty {
            Ty::Prim(p) => Ok(match p {
                U8 => Value::U8(self.read(addr)?),
                U16 => Value::U16(self.read(addr)?),
                U32 => Value::U32(self.read(addr)?),
                U64 => Value::U64(self.read(addr)?),
                I8 => Value::I8(self.read(addr)?),
                I16 => Value::I16(self.read(addr)?),
                I32 => Value::I32(self.read(addr)?),
                I64 => Value::I64(self.read(addr)?),
            }),
            Ty::Ref(_) => Ok(Value::U32(self.read(addr)?)),
            Ty::Struct(st) => Ok(Value::Struct {
                ty: std::rc::Rc::clone(st),
                bytes: self.bytes(addr, st.size())?.to_vec(),
            }),
        }
    }

    /// Write a [`Value`] at `addr`. A struct value whose byte payload
    /// disagrees with its type's size is rejected before anything is
    /// written, since every layer above accounts space by the type.
    pub fn write_value(&mut self, addr: Addr, value: &Value) -> Result<(), MemoryError> {
        let bytes = value.to_bytes();
        if bytes.len() as u32 != value.size() {
            return Err(MemoryError::ValueSizeMismatch {
                ty: value.ty().to_string(),
                expected: value.size(),
                found: bytes.len() as u32,
            });
        }
        self.check_range(addr, bytes.len() as u32)?;
        let a = addr as usize;
        self.data[a..a + bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }

    /// Zero the buffer and re-poison address 0
    pub fn clear(&mut self) {
        self.data.fill(0);
        self.data[..NULL_POISON.len()].copy_from_slice(&NULL_POISON);
    }

    /// Hex dump of a range, for postmortems
    pub fn dump(&self, addr: Addr, len: u32) -> Result<String, MemoryError> {
        Ok(pretty_hex(&self.bytes(addr, len)?))
    }
}
