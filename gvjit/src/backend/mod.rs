//!
//! Emission Backends
//!
//! A backend turns one materialized function into native code and hands
//! back its entry point. While compiling it talks to the engine only through
//! the `EmitContext` it is given: cached addresses, external symbols, global
//! storage and the lazy-compilation resolver.
//!

pub mod cranelift;
mod storage;

use std::ffi::c_void;

pub use self::cranelift::CraneliftBackend;
pub use storage::GlobalArena;

use crate::engine::EmitContext;
use crate::error::Result;
use crate::ir::{FunctionId, Module, Type};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageLayout {
    pub size: usize,
    pub align: usize,
}

impl StorageLayout {
    pub fn of(ty: Type) -> Self {
        Self {
            size: ty.size(),
            align: ty.align(),
        }
    }
}

/// Callback that lazy stubs call with `(context, function index)` to get the
/// address of the compiled function.
pub type LazyCallback = extern "C" fn(*const c_void, u32) -> *const u8;

#[derive(Debug, Clone, Copy)]
pub struct LazyResolver {
    pub context: *const c_void,
    pub callback: LazyCallback,
}

pub trait EmissionBackend {
    /// Compiles `function` and returns its entry point. The function's body
    /// is materialized before this is called.
    fn compile_function(
        &mut self,
        module: &Module,
        function: FunctionId,
        cx: &mut EmitContext<'_>,
    ) -> Result<*const u8>;

    /// Zeroed storage for a global. Must stay valid for the backend's lifetime.
    fn allocate_global_storage(&mut self, layout: StorageLayout) -> Result<*const u8>;

    /// A callable stub that compiles `function` on its first call, if the
    /// backend supports lazy compilation.
    fn lazy_stub(
        &mut self,
        _module: &Module,
        _function: FunctionId,
        _resolver: LazyResolver,
    ) -> Result<Option<*const u8>> {
        Ok(None)
    }
}
