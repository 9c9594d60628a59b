///
/// Generic Values
///
/// A `GenericValue` is the boxed form of one native scalar: the variant is
/// the tag, the payload is the value. Hosts build them for arguments and get
/// one back from every call; `Void` is the result of a void function.
///

use std::ffi::c_void;
use std::fmt;

use crate::ir::{Constant, Type};

#[derive(Clone, Copy, PartialEq)]
pub enum GenericValue {
    Void,
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Ptr(*mut c_void),
}

impl GenericValue {
    pub fn ty(&self) -> Type {
        match self {
            GenericValue::Void => Type::Void,
            GenericValue::Bool(_) => Type::Bool,
            GenericValue::I8(_) => Type::I8,
            GenericValue::U8(_) => Type::U8,
            GenericValue::I16(_) => Type::I16,
            GenericValue::U16(_) => Type::U16,
            GenericValue::I32(_) => Type::I32,
            GenericValue::U32(_) => Type::U32,
            GenericValue::I64(_) => Type::I64,
            GenericValue::U64(_) => Type::U64,
            GenericValue::F32(_) => Type::F32,
            GenericValue::F64(_) => Type::F64,
            GenericValue::Ptr(_) => Type::Ptr,
        }
    }

    pub fn ptr<T>(p: *const T) -> Self {
        GenericValue::Ptr(p as *mut c_void)
    }

    pub fn as_i32(&self) -> Option<i32> {
        match *self {
            GenericValue::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            GenericValue::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            GenericValue::F64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ptr(&self) -> Option<*mut c_void> {
        match *self {
            GenericValue::Ptr(p) => Some(p),
            _ => None,
        }
    }

    /// The integer payload widened to 32 bits, for the `int` slot of the
    /// entry-point fast path.
    pub(crate) fn entry_int(&self) -> Option<i32> {
        match *self {
            GenericValue::I32(v) => Some(v),
            GenericValue::U32(v) => Some(v as i32),
            _ => None,
        }
    }

    /// The compile-time constant a synthesized stub passes for this value.
    /// Pointers become pointer-width integers; the caller casts them back.
    pub fn to_constant(&self) -> Option<Constant> {
        let c = match *self {
            GenericValue::Void => return None,
            GenericValue::Bool(v) => Constant::int(Type::Bool, v as i64),
            GenericValue::I8(v) => Constant::int(Type::I8, v as i64),
            GenericValue::U8(v) => Constant::int(Type::U8, v as i64),
            GenericValue::I16(v) => Constant::int(Type::I16, v as i64),
            GenericValue::U16(v) => Constant::int(Type::U16, v as i64),
            GenericValue::I32(v) => Constant::int(Type::I32, v as i64),
            GenericValue::U32(v) => Constant::int(Type::U32, v as i64),
            GenericValue::I64(v) => Constant::int(Type::I64, v),
            GenericValue::U64(v) => Constant::Int {
                ty: Type::U64,
                bits: v,
            },
            GenericValue::F32(v) => Constant::F32(v),
            GenericValue::F64(v) => Constant::F64(v),
            GenericValue::Ptr(p) => Constant::Int {
                ty: Type::pointer_sized_int(),
                bits: p as usize as u64,
            },
        };
        Some(c)
    }
}

impl fmt::Debug for GenericValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenericValue::Void => f.write_str("void"),
            GenericValue::Bool(v) => write!(f, "bool {}", v),
            GenericValue::I8(v) => write!(f, "i8 {}", v),
            GenericValue::U8(v) => write!(f, "u8 {}", v),
            GenericValue::I16(v) => write!(f, "i16 {}", v),
            GenericValue::U16(v) => write!(f, "u16 {}", v),
            GenericValue::I32(v) => write!(f, "i32 {}", v),
            GenericValue::U32(v) => write!(f, "u32 {}", v),
            GenericValue::I64(v) => write!(f, "i64 {}", v),
            GenericValue::U64(v) => write!(f, "u64 {}", v),
            GenericValue::F32(v) => write!(f, "f32 {:?}", v),
            GenericValue::F64(v) => write!(f, "f64 {:?}", v),
            GenericValue::Ptr(p) => write!(f, "ptr {:p}", *p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_match_types() {
        assert_eq!(GenericValue::I32(5).ty(), Type::I32);
        assert_eq!(GenericValue::U64(5).ty(), Type::U64);
        assert_eq!(GenericValue::Void.ty(), Type::Void);
        assert_eq!(GenericValue::ptr(std::ptr::null::<u8>()).ty(), Type::Ptr);
    }

    #[test]
    fn test_debug_shows_pointer_value() {
        let value = GenericValue::ptr(0x1000 as *const u8);
        assert_eq!(format!("{:?}", value), "ptr 0x1000");
        assert_eq!(format!("{:?}", GenericValue::I32(-4)), "i32 -4");
    }

    #[test]
    fn test_entry_int_accepts_both_signedness() {
        assert_eq!(GenericValue::I32(-4).entry_int(), Some(-4));
        assert_eq!(GenericValue::U32(u32::MAX).entry_int(), Some(-1));
        assert_eq!(GenericValue::I64(1).entry_int(), None);
    }

    #[test]
    fn test_constants_keep_width() {
        assert_eq!(
            GenericValue::I8(-1).to_constant(),
            Some(Constant::Int {
                ty: Type::I8,
                bits: u64::MAX,
            })
        );
        assert_eq!(GenericValue::F64(1.5).to_constant(), Some(Constant::F64(1.5)));
        assert_eq!(GenericValue::Void.to_constant(), None);

        let p = GenericValue::ptr(0x1000 as *const u8).to_constant().unwrap();
        assert_eq!(p.ty(), Type::pointer_sized_int());
        assert!(matches!(p, Constant::Int { bits: 0x1000, .. }));
    }
}
