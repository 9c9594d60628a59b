//!
//! Generic Invocation
//!
//! `invoke` calls a compiled function with boxed arguments. Three ways in:
//!
//! - entry-point signatures (`int`, `int, ptr`, `int, ptr, ptr` or no
//!   parameters, returning `void`, `i32` or `u32`) are called directly
//!   through a typed function pointer;
//! - other nullary functions are called through a pointer typed by their
//!   return type;
//! - everything else goes through a synthesized nullary stub that calls the
//!   target with the arguments baked in as constants.
//!

use std::ffi::c_void;
use std::mem::transmute;

use crate::cache::Address;
use crate::engine::{EngineCore, StubBuilder};
use crate::error::{JitError, Result};
use crate::ir::{Entity, FunctionId, Signature, Type};
use crate::value::GenericValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryShape {
    Nullary,
    Int,
    IntPtr,
    IntPtrPtr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryReturn {
    Void,
    I32,
    U32,
}

/// A signature the fast path can call without a stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint {
    pub shape: EntryShape,
    pub ret: EntryReturn,
}

impl EntryPoint {
    pub fn classify(signature: &Signature) -> Option<Self> {
        let ret = match signature.ret {
            Type::Void => EntryReturn::Void,
            Type::I32 => EntryReturn::I32,
            Type::U32 => EntryReturn::U32,
            _ => return None,
        };
        let is_int = |ty: Type| matches!(ty, Type::I32 | Type::U32);
        let shape = match signature.params.as_slice() {
            [] => EntryShape::Nullary,
            [a] if is_int(*a) => EntryShape::Int,
            [a, Type::Ptr] if is_int(*a) => EntryShape::IntPtr,
            [a, Type::Ptr, Type::Ptr] if is_int(*a) => EntryShape::IntPtrPtr,
            _ => return None,
        };
        Some(Self { shape, ret })
    }

    /// # Safety
    /// `code` must be a function with the classified signature and `args`
    /// must have been checked against it.
    unsafe fn call(self, code: Address, args: &[GenericValue]) -> GenericValue {
        let code = code.as_ptr();
        let int = || args.first().and_then(GenericValue::entry_int).unwrap_or(0);
        let ptr = |i: usize| {
            args.get(i)
                .and_then(GenericValue::as_ptr)
                .unwrap_or(std::ptr::null_mut())
        };

        macro_rules! entry_call {
            (($($ty:ty),*) -> $ret:ty, ($($arg:expr),*)) => {{
                let f: extern "C" fn($($ty),*) -> $ret = unsafe { transmute(code) };
                f($($arg),*)
            }};
        }

        let raw = match (self.ret, self.shape) {
            (EntryReturn::Void, EntryShape::Nullary) => {
                entry_call!(() -> (), ());
                None
            }
            (EntryReturn::Void, EntryShape::Int) => {
                entry_call!((i32) -> (), (int()));
                None
            }
            (EntryReturn::Void, EntryShape::IntPtr) => {
                entry_call!((i32, *mut c_void) -> (), (int(), ptr(1)));
                None
            }
            (EntryReturn::Void, EntryShape::IntPtrPtr) => {
                entry_call!((i32, *mut c_void, *mut c_void) -> (), (int(), ptr(1), ptr(2)));
                None
            }
            (_, EntryShape::Nullary) => Some(entry_call!(() -> i32, ())),
            (_, EntryShape::Int) => Some(entry_call!((i32) -> i32, (int()))),
            (_, EntryShape::IntPtr) => {
                Some(entry_call!((i32, *mut c_void) -> i32, (int(), ptr(1))))
            }
            (_, EntryShape::IntPtrPtr) => Some(entry_call!(
                (i32, *mut c_void, *mut c_void) -> i32,
                (int(), ptr(1), ptr(2))
            )),
        };

        match (self.ret, raw) {
            (EntryReturn::I32, Some(v)) => GenericValue::I32(v),
            (EntryReturn::U32, Some(v)) => GenericValue::U32(v as u32),
            _ => GenericValue::Void,
        }
    }
}

/// Calls a function without parameters and boxes its result.
///
/// # Safety
/// `code` must be a nullary function returning `ret`.
unsafe fn call_nullary(code: Address, ret: Type) -> GenericValue {
    let code = code.as_ptr();

    macro_rules! nullary {
        ($ty:ty) => {{
            let f: extern "C" fn() -> $ty = unsafe { transmute(code) };
            f()
        }};
    }

    match ret {
        Type::Void => {
            nullary!(());
            GenericValue::Void
        }
        Type::Bool => GenericValue::Bool(nullary!(u8) != 0),
        Type::I8 => GenericValue::I8(nullary!(i8)),
        Type::U8 => GenericValue::U8(nullary!(u8)),
        Type::I16 => GenericValue::I16(nullary!(i16)),
        Type::U16 => GenericValue::U16(nullary!(u16)),
        Type::I32 => GenericValue::I32(nullary!(i32)),
        Type::U32 => GenericValue::U32(nullary!(u32)),
        Type::I64 => GenericValue::I64(nullary!(i64)),
        Type::U64 => GenericValue::U64(nullary!(u64)),
        Type::F32 => GenericValue::F32(nullary!(f32)),
        Type::F64 => GenericValue::F64(nullary!(f64)),
        Type::Ptr => GenericValue::Ptr(nullary!(*mut c_void)),
    }
}

fn check_arguments(name: &str, signature: &Signature, args: &[GenericValue]) -> Result<()> {
    if args.len() != signature.params.len() {
        return Err(JitError::ArgumentCount {
            function: name.to_string(),
            expected: signature.params.len(),
            found: args.len(),
        });
    }
    for (index, (arg, &param)) in args.iter().zip(&signature.params).enumerate() {
        if param == Type::Void {
            return Err(JitError::UnsupportedType {
                ty: param,
                context: format!("parameter {} of '{}'", index, name),
            });
        }
        if arg.ty() != param {
            return Err(JitError::ArgumentType {
                function: name.to_string(),
                index,
                expected: param,
                found: arg.ty(),
            });
        }
    }
    Ok(())
}

impl EngineCore {
    pub(crate) fn invoke(
        &self,
        function: FunctionId,
        args: &[GenericValue],
    ) -> Result<GenericValue> {
        let (name, signature) = {
            let module = self.module.borrow();
            let def = module.function(function)?;
            (def.name.clone(), def.signature.clone())
        };
        check_arguments(&name, &signature, args)?;

        let address = self.ensure_compiled(function)?;

        if self.config.fast_path {
            if let Some(entry) = EntryPoint::classify(&signature) {
                tracing::trace!(function = %name, ?entry, "direct entry call");
                return Ok(unsafe { entry.call(address, args) });
            }
        }

        if args.is_empty() {
            return Ok(unsafe { call_nullary(address, signature.ret) });
        }

        self.invoke_through_stub(function, &name, &signature, args)
    }

    fn invoke_through_stub(
        &self,
        function: FunctionId,
        name: &str,
        signature: &Signature,
        args: &[GenericValue],
    ) -> Result<GenericValue> {
        let body = StubBuilder::new(function, signature).build(args)?;
        let counter = self.stub_counter.get();
        self.stub_counter.set(counter + 1);

        let stub = self.module.borrow_mut().define_function(
            format!("__gv_stub.{}", counter),
            Signature::new(&[], signature.ret),
            body,
        );
        if tracing::enabled!(tracing::Level::DEBUG) {
            let module = self.module.borrow();
            if let Ok(rendered) = module.display_function(stub) {
                tracing::debug!(target_fn = %name, stub = %rendered, "synthesized call stub");
            }
        }

        let result = self.invoke(stub, &[]);

        if self.config.discard_stubs {
            self.state
                .borrow_mut()
                .cache
                .invalidate(Entity::Function(stub));
            self.module.borrow_mut().remove_function(stub);
        }
        result
    }
}
