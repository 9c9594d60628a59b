//!
//! Type Mappings (program -> Cranelift)
//!
//! - bool, i8, u8 -> I8
//! - i16, u16 -> I16
//! - i32, u32 -> I32
//! - i64, u64 -> I64
//! - f32 -> F32, f64 -> F64
//! - ptr -> target pointer type
//! - void -> no value
//!

use cranelift::prelude::types;
use cranelift::prelude::{AbiParam, Signature as ClifSignature, Type as ClifType};
use cranelift_jit::JITModule;
use cranelift_module::Module as _;

use crate::error::{JitError, Result};
use crate::ir::{Signature, Type};

pub fn clif_type(ty: Type, pointer_type: ClifType) -> Option<ClifType> {
    match ty {
        Type::Void => None,
        Type::Bool | Type::I8 | Type::U8 => Some(types::I8),
        Type::I16 | Type::U16 => Some(types::I16),
        Type::I32 | Type::U32 => Some(types::I32),
        Type::I64 | Type::U64 => Some(types::I64),
        Type::F32 => Some(types::F32),
        Type::F64 => Some(types::F64),
        Type::Ptr => Some(pointer_type),
    }
}

/// A value-carrying type; `void` is rejected.
pub fn value_type(ty: Type, pointer_type: ClifType, context: &str) -> Result<ClifType> {
    clif_type(ty, pointer_type).ok_or_else(|| JitError::UnsupportedType {
        ty,
        context: context.to_string(),
    })
}

pub fn signature(jit: &JITModule, sig: &Signature) -> Result<ClifSignature> {
    let pointer_type = jit.target_config().pointer_type();
    let mut clif_sig = jit.make_signature();
    for &param in &sig.params {
        let ty = value_type(param, pointer_type, "parameter list")?;
        clif_sig.params.push(AbiParam::new(ty));
    }
    if let Some(ret) = clif_type(sig.ret, pointer_type) {
        clif_sig.returns.push(AbiParam::new(ret));
    }
    Ok(clif_sig)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_types() {
        assert_eq!(clif_type(Type::I32, types::I64), Some(types::I32));
        assert_eq!(clif_type(Type::U32, types::I64), Some(types::I32));
        assert_eq!(clif_type(Type::F64, types::I64), Some(types::F64));
        assert_eq!(clif_type(Type::Bool, types::I64), Some(types::I8));
        assert_eq!(clif_type(Type::Ptr, types::I32), Some(types::I32));
        assert_eq!(clif_type(Type::Void, types::I64), None);
    }

    #[test]
    fn test_void_is_not_a_value() {
        let err = value_type(Type::Void, types::I64, "load").unwrap_err();
        assert!(matches!(err, JitError::UnsupportedType { ty: Type::Void, .. }));
    }
}
