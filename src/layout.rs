//! Struct layout: field offsets, alignment and sizes
//!
//! A pure computation layer, independent of any allocator. The same
//! engine lays out in-memory structs and the call-frame shapes pushed
//! on the return stack, so its output is part of the byte-layout
//! contract: a reimplementation must produce identical offsets for
//! identical field lists.

use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use crate::types::{Ty, WORD_SIZE};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("unknown field '{segment}' in path '{path}'")]
    UnknownField { path: String, segment: String },
    #[error("invalid return shape: expected Void or a single reference, found {found}")]
    InvalidReturnShape { found: String },
    #[error("field '{field}' of size {size} cannot live in a stack-shaped struct")]
    NotStackSized { field: String, size: u32 },
    #[error("stack-shaped struct '{field}' cannot be nested inside a plain struct")]
    NestedStackStruct { field: String },
}

/// Required alignment for a value of the given size.
///
/// Nothing aligns beyond the machine word: one- and two-byte values
/// align to their own size, everything else to the word.
pub fn alignment_of(size: u32) -> u32 {
    match size {
        0 | 1 => 1,
        2 => 2,
        _ => WORD_SIZE,
    }
}

/// Round `offset` up so a value of `size` bytes is correctly aligned
pub fn align_offset(offset: u32, size: u32) -> u32 {
    if size == 0 {
        return offset;
    }
    let align = alignment_of(size);
    let rem = offset % align;
    if rem == 0 {
        offset
    } else {
        offset + (align - rem)
    }
}

/// One named, positioned field within a struct
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub ty: Ty,
    pub index: usize,
    pub offset: u32,
}

/// An ordered collection of typed fields with computed offsets.
///
/// Offsets are non-decreasing, each a multiple of the field's own
/// alignment; the total size is the end of the last field rounded up to
/// the struct's own alignment so nesting keeps every inner field
/// aligned.
#[derive(Debug, Clone, PartialEq)]
pub struct StructTy {
    name: String,
    fields: Vec<Field>,
    size: u32,
    is_stk: bool,
}

impl StructTy {
    /// Lay out a plain struct
    pub fn new(name: &str, fields: &[(&str, Ty)]) -> Result<Rc<Self>, LayoutError> {
        Ok(Rc::new(Self::build(name, fields, false)?))
    }

    /// Lay out a stack-shaped struct: every field must be exactly one or
    /// two machine words (the shape of values resident on a stack)
    pub fn new_stk(name: &str, fields: &[(&str, Ty)]) -> Result<Rc<Self>, LayoutError> {
        Ok(Rc::new(Self::build(name, fields, true)?))
    }

    /// The empty struct, used as the "no value" return shape
    pub fn void() -> Rc<Self> {
        Rc::new(StructTy {
            name: "Void".to_string(),
            fields: Vec::new(),
            size: 0,
            is_stk: false,
        })
    }

    pub(crate) fn build(
        name: &str,
        fields: &[(&str, Ty)],
        is_stk: bool,
    ) -> Result<Self, LayoutError> {
        let mut laid = Vec::with_capacity(fields.len());
        let mut offset = 0u32;
        for (index, (fname, ty)) in fields.iter().enumerate() {
            let size = ty.size();
            if is_stk && size != WORD_SIZE && size != 2 * WORD_SIZE {
                return Err(LayoutError::NotStackSized {
                    field: fname.to_string(),
                    size,
                });
            }
            if !is_stk {
                if let Ty::Struct(st) = ty {
                    if st.is_stk() {
                        return Err(LayoutError::NestedStackStruct {
                            field: fname.to_string(),
                        });
                    }
                }
            }
            offset = align_offset(offset, size);
            laid.push(Field {
                name: fname.to_string(),
                ty: ty.clone(),
                index,
                offset,
            });
            offset += size;
        }
        let size = align_offset(offset, offset);
        Ok(StructTy {
            name: name.to_string(),
            fields: laid,
            size,
            is_stk,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn alignment(&self) -> u32 {
        alignment_of(self.size)
    }

    pub fn is_stk(&self) -> bool {
        self.is_stk
    }

    pub fn is_void(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Resolve one path segment: a field name or a decimal field index
    fn segment(&self, path: &str, segment: &str) -> Result<&Field, LayoutError> {
        let segment = segment.trim();
        let found = match segment.parse::<usize>() {
            Ok(i) => self.fields.get(i),
            Err(_) => self.fields.iter().find(|f| f.name == segment),
        };
        found.ok_or_else(|| LayoutError::UnknownField {
            path: path.to_string(),
            segment: segment.to_string(),
        })
    }

    /// Resolve a dotted path (`"a.b.c"`) through nested structs to the
    /// innermost field
    pub fn field(&self, path: &str) -> Result<&Field, LayoutError> {
        let mut st = self;
        let mut found: Option<&Field> = None;
        for seg in path.split('.') {
            let next_st = match found {
                None => st,
                Some(f) => match &f.ty {
                    Ty::Struct(inner) => inner.as_ref(),
                    _ => {
                        return Err(LayoutError::UnknownField {
                            path: path.to_string(),
                            segment: seg.trim().to_string(),
                        })
                    }
                },
            };
            st = next_st;
            found = Some(st.segment(path, seg)?);
        }
        found.ok_or_else(|| LayoutError::UnknownField {
            path: path.to_string(),
            segment: String::new(),
        })
    }

    /// Offset of a dotted path relative to this struct's base
    pub fn offset(&self, path: &str) -> Result<u32, LayoutError> {
        let mut st = self;
        let mut offset = 0u32;
        let mut last: Option<&Field> = None;
        for seg in path.split('.') {
            let next_st = match last {
                None => st,
                Some(f) => match &f.ty {
                    Ty::Struct(inner) => inner.as_ref(),
                    _ => {
                        return Err(LayoutError::UnknownField {
                            path: path.to_string(),
                            segment: seg.trim().to_string(),
                        })
                    }
                },
            };
            st = next_st;
            let f = st.segment(path, seg)?;
            offset += f.offset;
            last = Some(f);
        }
        Ok(offset)
    }

    /// Type of the field at a dotted path
    pub fn ty(&self, path: &str) -> Result<&Ty, LayoutError> {
        Ok(&self.field(path)?.ty)
    }
}

impl fmt::Display for StructTy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<{}B>", self.name, self.size)
    }
}

/// The call-frame shape pushed on the return stack for one invocation:
/// the function's return slot, arguments and local variables.
///
/// Field order is fixed (`ret`, `inp`, `locals`) and the return slot is
/// constrained at construction: either Void or a single reference.
#[derive(Debug, PartialEq)]
pub struct FnStructTy {
    layout: StructTy,
    ret: Ty,
    inp: Rc<StructTy>,
    locals: Rc<StructTy>,
}

impl FnStructTy {
    pub fn new(
        ret: Ty,
        inp: Rc<StructTy>,
        locals: Rc<StructTy>,
    ) -> Result<Rc<Self>, LayoutError> {
        match &ret {
            Ty::Ref(_) => {}
            t if t.is_void() => {}
            other => {
                return Err(LayoutError::InvalidReturnShape {
                    found: other.to_string(),
                })
            }
        }
        let layout = StructTy::build(
            "Fn",
            &[
                ("ret", ret.clone()),
                ("inp", Ty::Struct(Rc::clone(&inp))),
                ("locals", Ty::Struct(Rc::clone(&locals))),
            ],
            false,
        )?;
        Ok(Rc::new(FnStructTy {
            layout,
            ret,
            inp,
            locals,
        }))
    }

    /// A frame with no return value, arguments or locals
    pub fn empty() -> Rc<Self> {
        Self::new(
            Ty::Struct(StructTy::void()),
            StructTy::void(),
            StructTy::void(),
        )
        .expect("empty frame is always well-shaped")
    }

    pub fn layout(&self) -> &StructTy {
        &self.layout
    }

    pub fn ret_ty(&self) -> &Ty {
        &self.ret
    }

    pub fn inp(&self) -> &Rc<StructTy> {
        &self.inp
    }

    pub fn locals(&self) -> &Rc<StructTy> {
        &self.locals
    }

    pub fn size(&self) -> u32 {
        self.layout.size()
    }

    pub fn offset(&self, path: &str) -> Result<u32, LayoutError> {
        self.layout.offset(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrimTy;

    fn prim(p: PrimTy) -> Ty {
        Ty::Prim(p)
    }

    #[test]
    fn test_alignment_rule() {
        assert_eq!(alignment_of(0), 1);
        assert_eq!(alignment_of(1), 1);
        assert_eq!(alignment_of(2), 2);
        assert_eq!(alignment_of(3), 4);
        assert_eq!(alignment_of(4), 4);
        assert_eq!(alignment_of(21), 4);
        assert_eq!(align_offset(3, 4), 4);
        assert_eq!(align_offset(2, 4), 4);
        assert_eq!(align_offset(1, 1), 1);
        assert_eq!(align_offset(7, 0), 7);
    }

    #[test]
    fn test_struct_offsets() {
        let a = StructTy::new(
            "A",
            &[
                ("a1", prim(PrimTy::U32)),
                ("a2", prim(PrimTy::U8)),
                ("a3", prim(PrimTy::U16)),
                ("a4", prim(PrimTy::U16)),
                ("a5", prim(PrimTy::U64)),
                ("a6", prim(PrimTy::U8)),
            ],
        )
        .unwrap();
        assert_eq!(a.field("a1").unwrap().offset, 0);
        assert_eq!(a.field("a2").unwrap().offset, 4);
        assert_eq!(a.field("a3").unwrap().offset, 6);
        assert_eq!(a.field("a4").unwrap().offset, 8);
        assert_eq!(a.field("a5").unwrap().offset, 12);
        assert_eq!(a.field("a6").unwrap().offset, 20);
        // end offset 21, rounded up to the struct's word alignment
        assert_eq!(a.size(), 24);
    }

    #[test]
    fn test_nested_struct_offsets() {
        let a = StructTy::new(
            "A",
            &[
                ("a1", prim(PrimTy::U32)),
                ("a2", prim(PrimTy::U8)),
                ("a3", prim(PrimTy::U16)),
                ("a4", prim(PrimTy::U16)),
                ("a5", prim(PrimTy::U64)),
                ("a6", prim(PrimTy::U8)),
            ],
        )
        .unwrap();
        let b = StructTy::new(
            "B",
            &[
                ("u8", prim(PrimTy::U8)),
                ("a", Ty::Struct(Rc::clone(&a))),
                ("u32", prim(PrimTy::U32)),
            ],
        )
        .unwrap();
        assert_eq!(b.field("u8").unwrap().offset, 0);
        assert_eq!(b.field("a").unwrap().offset, 4);
        // nesting preserves inner offsets, shifted by the field's own
        assert_eq!(b.offset("a.a1").unwrap(), 4);
        assert_eq!(b.offset("a.a2").unwrap(), 8);
        assert_eq!(b.offset("a.a5").unwrap(), 16);
        assert_eq!(b.field("u32").unwrap().offset, 28);
        assert_eq!(b.size(), 32);
    }

    #[test]
    fn test_field_by_index_segment() {
        let a = StructTy::new(
            "A",
            &[("x", prim(PrimTy::U32)), ("y", prim(PrimTy::U16))],
        )
        .unwrap();
        assert_eq!(a.field("1").unwrap().name, "y");
        assert_eq!(a.field("0").unwrap().offset, 0);
    }

    #[test]
    fn test_unknown_field() {
        let a = StructTy::new("A", &[("x", prim(PrimTy::U32))]).unwrap();
        let e = a.field("x.y").unwrap_err();
        assert!(matches!(e, LayoutError::UnknownField { .. }));
        let e = a.offset("nope").unwrap_err();
        assert!(matches!(
            e,
            LayoutError::UnknownField { segment, .. } if segment == "nope"
        ));
    }

    #[test]
    fn test_stk_struct_rules() {
        // word and double-word fields are the only stack shapes
        assert!(StructTy::new_stk(
            "S",
            &[("a", prim(PrimTy::U32)), ("b", prim(PrimTy::U64))]
        )
        .is_ok());
        let e = StructTy::new_stk("S", &[("a", prim(PrimTy::U8))]).unwrap_err();
        assert!(matches!(e, LayoutError::NotStackSized { size: 1, .. }));

        let stk = StructTy::new_stk("S", &[("a", prim(PrimTy::U32))]).unwrap();
        let e = StructTy::new("P", &[("s", Ty::Struct(stk))]).unwrap_err();
        assert!(matches!(e, LayoutError::NestedStackStruct { .. }));
    }

    #[test]
    fn test_fn_struct_shapes() {
        let inp = StructTy::new("inp", &[("a", prim(PrimTy::U32))]).unwrap();
        let locals = StructTy::new("locals", &[("l", prim(PrimTy::U64))]).unwrap();

        // Void return is fine
        let f = FnStructTy::new(
            Ty::Struct(StructTy::void()),
            Rc::clone(&inp),
            Rc::clone(&locals),
        )
        .unwrap();
        assert_eq!(f.offset("inp.a").unwrap(), 0);
        assert_eq!(f.offset("locals.l").unwrap(), 4);

        // a single reference return is fine
        let r = Ty::Ref(Rc::new(prim(PrimTy::U32)));
        let f = FnStructTy::new(r, Rc::clone(&inp), Rc::clone(&locals)).unwrap();
        assert_eq!(f.offset("ret").unwrap(), 0);
        assert_eq!(f.offset("inp.a").unwrap(), 4);

        // anything else is rejected at construction time
        let e = FnStructTy::new(prim(PrimTy::U32), inp, locals).unwrap_err();
        assert!(matches!(e, LayoutError::InvalidReturnShape { .. }));
    }
}
