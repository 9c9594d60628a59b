use crate::backend::{LazyResolver, StorageLayout};
use crate::cache::Address;
use crate::engine::EngineCore;
use crate::error::Result;
use crate::ir::{Entity, FunctionId, GlobalId};

/// The engine as seen by a backend while it compiles one function.
///
/// A compilation is in progress for as long as a context exists, so
/// `ensure_compiled` on anything that is neither cached nor external fails
/// with `RecursiveCompilation`. Backends reach uncompiled callees through
/// `lazy_resolver` instead.
pub struct EmitContext<'e> {
    core: &'e EngineCore,
}

impl<'e> EmitContext<'e> {
    pub(crate) fn new(core: &'e EngineCore) -> Self {
        Self { core }
    }

    pub fn lookup_function(&self, function: FunctionId) -> Option<Address> {
        self.core.lookup(Entity::Function(function))
    }

    pub fn lookup_global(&self, global: GlobalId) -> Option<Address> {
        self.core.lookup(Entity::Global(global))
    }

    pub fn ensure_compiled(&mut self, function: FunctionId) -> Result<*const u8> {
        self.core.ensure_compiled(function).map(Address::as_ptr)
    }

    /// Address of an external declaration, from the symbol resolver.
    pub fn external_function(&mut self, function: FunctionId) -> Result<*const u8> {
        self.core.resolve_external(function).map(Address::as_ptr)
    }

    /// Storage for a global. New storage comes from `allocate`; its
    /// initializer is written after the current compilation finishes.
    pub fn global_address(
        &mut self,
        global: GlobalId,
        allocate: &mut dyn FnMut(StorageLayout) -> Result<*const u8>,
    ) -> Result<*const u8> {
        self.core
            .get_or_emit_global(global, allocate)
            .map(Address::as_ptr)
    }

    pub fn lazy_resolver(&self) -> Option<LazyResolver> {
        self.core.lazy_resolver()
    }

    /// The function currently being compiled.
    pub fn current_function(&self) -> Option<FunctionId> {
        self.core.compiling.get()
    }
}
