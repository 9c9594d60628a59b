//!
//! JIT Execution Engine
//!
//! `JitEngine` owns a program `Module`, an emission backend, a symbol
//! resolver and a code patcher, and turns function handles into callable
//! native code on demand.
//!
//! ## Resolution
//!
//! Every function and global resolves to one address, recorded in the
//! engine's `AddressCache`. Functions are compiled the first time their
//! address is needed; external declarations come from the symbol resolver.
//!
//! ## Compilation
//!
//! One function compiles at a time. While a compilation is running the
//! engine refuses to start another one; the backend sees other functions
//! only through cached addresses, external symbols or lazy stubs. Globals
//! first referenced during a compilation get zeroed storage immediately and
//! their initializers are written once the compilation has finished.
//!
//! ## Re-entrancy
//!
//! No engine state is borrowed across a native call, so compiled code may
//! call lazy stubs that re-enter the engine to compile their target.
//!

mod emit;
mod invoke;
mod recompile;
mod stub;

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::ffi::c_void;

pub use emit::EmitContext;
pub use invoke::{EntryPoint, EntryReturn, EntryShape};
pub use stub::StubBuilder;

use crate::backend::{CraneliftBackend, EmissionBackend, LazyResolver, StorageLayout};
use crate::cache::{Address, AddressCache, DeferredGlobals};
use crate::config::EngineConfig;
use crate::error::{JitError, Result};
use crate::ir::{Constant, Entity, FunctionId, GlobalId, Module, Type, truncate_bits};
use crate::patch::{CodePatcher, NativePatcher};
use crate::symbols::{HostSymbols, SymbolResolver};
use crate::value::GenericValue;

pub struct JitEngine {
    // Boxed so lazy stubs can hold a stable pointer to it.
    core: Box<EngineCore>,
}

pub(crate) struct EngineCore {
    config: EngineConfig,
    module: RefCell<Module>,
    backend: RefCell<Box<dyn EmissionBackend>>,
    symbols: Box<dyn SymbolResolver>,
    patcher: RefCell<Box<dyn CodePatcher>>,
    state: RefCell<EngineState>,
    compiling: Cell<Option<FunctionId>>,
    stub_counter: Cell<u32>,
}

#[derive(Default)]
struct EngineState {
    cache: AddressCache,
    deferred: DeferredGlobals,
}

pub struct EngineBuilder {
    module: Module,
    config: EngineConfig,
    backend: Option<Box<dyn EmissionBackend>>,
    symbols: Option<Box<dyn SymbolResolver>>,
    patcher: Option<Box<dyn CodePatcher>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn backend(mut self, backend: impl EmissionBackend + 'static) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    pub fn symbols(mut self, symbols: impl SymbolResolver + 'static) -> Self {
        self.symbols = Some(Box::new(symbols));
        self
    }

    pub fn patcher(mut self, patcher: impl CodePatcher + 'static) -> Self {
        self.patcher = Some(Box::new(patcher));
        self
    }

    /// Fails if no backend was supplied and the host has no Cranelift ISA.
    pub fn build(self) -> Result<JitEngine> {
        let backend = match self.backend {
            Some(backend) => backend,
            None => Box::new(CraneliftBackend::new(&self.config)?),
        };
        let symbols = self
            .symbols
            .unwrap_or_else(|| Box::new(HostSymbols::new()));
        let patcher = self
            .patcher
            .unwrap_or_else(|| Box::new(NativePatcher::new()));

        tracing::debug!(module = %self.module.name(), config = ?self.config, "engine created");

        Ok(JitEngine {
            core: Box::new(EngineCore {
                config: self.config,
                module: RefCell::new(self.module),
                backend: RefCell::new(backend),
                symbols,
                patcher: RefCell::new(patcher),
                state: RefCell::new(EngineState::default()),
                compiling: Cell::new(None),
                stub_counter: Cell::new(0),
            }),
        })
    }
}

impl JitEngine {
    /// An engine with the Cranelift backend, host symbols and the native
    /// patcher.
    pub fn new(module: Module, config: EngineConfig) -> Result<Self> {
        Self::builder(module).config(config).build()
    }

    pub fn builder(module: Module) -> EngineBuilder {
        EngineBuilder {
            module,
            config: EngineConfig::default(),
            backend: None,
            symbols: None,
            patcher: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    pub fn module(&self) -> Ref<'_, Module> {
        self.core.module.borrow()
    }

    /// Mutable access to the program, e.g. to replace a body before
    /// `recompile`. The borrow must be released before calling back into
    /// the engine.
    pub fn module_mut(&self) -> RefMut<'_, Module> {
        self.core.module.borrow_mut()
    }

    pub fn lookup(&self, entity: Entity) -> Option<Address> {
        self.core.lookup(entity)
    }

    pub fn is_compiling(&self) -> bool {
        self.core.compiling.get().is_some()
    }

    /// Globals allocated but not yet initialized.
    pub fn pending_globals(&self) -> usize {
        self.core.state.borrow().deferred.len()
    }

    pub fn invoke(&self, function: FunctionId, args: &[GenericValue]) -> Result<GenericValue> {
        self.core.invoke(function, args)
    }

    /// The function's native address, compiling it if needed.
    pub fn ensure_compiled(&self, function: FunctionId) -> Result<Address> {
        self.core.ensure_compiled(function)
    }

    pub fn pointer_to_function(&self, function: FunctionId) -> Result<Address> {
        self.core.ensure_compiled(function)
    }

    /// The function's address if compiled, otherwise a lazy stub (when
    /// enabled) that compiles it on its first call.
    pub fn pointer_to_function_or_stub(&self, function: FunctionId) -> Result<Address> {
        self.core.pointer_to_function_or_stub(function)
    }

    /// The global's storage, allocating and initializing it if needed.
    pub fn pointer_to_global(&self, global: GlobalId) -> Result<Address> {
        self.core.pointer_to_global(global)
    }

    pub fn recompile(&self, function: FunctionId) -> Result<Address> {
        self.core.recompile(function)
    }

    pub fn recompile_and_relink(&self, function: FunctionId) -> Result<Address> {
        self.core.recompile(function)
    }
}

/// Marks a compilation as running for as long as it is alive.
struct CompilationGuard<'a> {
    flag: &'a Cell<Option<FunctionId>>,
}

impl<'a> CompilationGuard<'a> {
    fn acquire(flag: &'a Cell<Option<FunctionId>>, function: FunctionId) -> Self {
        flag.set(Some(function));
        Self { flag }
    }
}

impl Drop for CompilationGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(None);
    }
}

impl EngineCore {
    fn lookup(&self, entity: Entity) -> Option<Address> {
        self.state.borrow().cache.lookup(entity)
    }

    fn function_name(&self, function: FunctionId) -> String {
        self.module.borrow().function_name(function)
    }

    fn recursion_error(&self, function: FunctionId, active: FunctionId) -> JitError {
        JitError::RecursiveCompilation {
            function: self.function_name(function),
            active: self.function_name(active),
        }
    }

    pub(crate) fn ensure_compiled(&self, function: FunctionId) -> Result<Address> {
        if let Some(address) = self.lookup(Entity::Function(function)) {
            tracing::trace!(function = function.index(), ?address, "cache hit");
            return Ok(address);
        }

        if self.module.borrow().function(function)?.is_declaration() {
            return self.resolve_external(function);
        }

        if let Some(active) = self.compiling.get() {
            return Err(self.recursion_error(function, active));
        }

        self.module.borrow_mut().materialize(function)?;
        self.run_jit_on_function(function)
    }

    fn resolve_external(&self, function: FunctionId) -> Result<Address> {
        let entity = Entity::Function(function);
        if let Some(address) = self.lookup(entity) {
            return Ok(address);
        }
        let name = self.module.borrow().function(function)?.name.clone();
        let ptr = self
            .symbols
            .resolve(&name)
            .ok_or_else(|| JitError::UnresolvedSymbol { name: name.clone() })?;
        let address = self.state.borrow_mut().cache.install(entity, ptr)?;
        tracing::debug!(function = %name, ?address, "resolved external function");
        Ok(address)
    }

    /// Compiles a materialized function, then writes the initializers of
    /// every global its compilation allocated.
    ///
    /// If an initializer fails, the new code refers to storage that was
    /// rolled back, so its mapping is dropped as well. The next request
    /// compiles the function again and reports the same failure.
    fn run_jit_on_function(&self, function: FunctionId) -> Result<Address> {
        let compiled = self.compile_guarded(function);
        let drained = self.drain_pending();
        let address = compiled?;
        if let Err(e) = drained {
            self.state
                .borrow_mut()
                .cache
                .invalidate(Entity::Function(function));
            tracing::debug!(
                function = %self.function_name(function),
                ?address,
                "discarded code after failed global initialization"
            );
            return Err(e);
        }
        Ok(address)
    }

    fn compile_guarded(&self, function: FunctionId) -> Result<Address> {
        let _guard = CompilationGuard::acquire(&self.compiling, function);
        let name = self.function_name(function);
        tracing::debug!(function = %name, "compiling");

        let ptr = {
            let module = self.module.borrow();
            let mut backend = self.backend.borrow_mut();
            let mut cx = EmitContext::new(self);
            backend.compile_function(&module, function, &mut cx)
        };
        let ptr = ptr.inspect_err(|e| {
            tracing::debug!(function = %name, error = %e, "compilation failed");
        })?;

        let address = self
            .state
            .borrow_mut()
            .cache
            .install(Entity::Function(function), ptr)?;
        tracing::debug!(function = %name, ?address, "compiled");
        Ok(address)
    }

    pub(crate) fn pointer_to_function_or_stub(&self, function: FunctionId) -> Result<Address> {
        if let Some(address) = self.lookup(Entity::Function(function)) {
            return Ok(address);
        }

        if let Some(resolver) = self.lazy_resolver() {
            let stub = {
                let module = self.module.borrow();
                if module.function(function)?.is_declaration() {
                    None
                } else {
                    self.backend
                        .borrow_mut()
                        .lazy_stub(&module, function, resolver)?
                }
            };
            if let Some(stub) = stub {
                return Address::new(stub).ok_or_else(|| JitError::NullAddress {
                    entity: Entity::Function(function).to_string(),
                });
            }
        }

        self.ensure_compiled(function)
    }

    pub(crate) fn lazy_resolver(&self) -> Option<LazyResolver> {
        self.config.lazy_stubs.then(|| LazyResolver {
            context: self as *const EngineCore as *const c_void,
            callback: resolve_lazy,
        })
    }

    pub(crate) fn pointer_to_global(&self, global: GlobalId) -> Result<Address> {
        let address = self.get_or_emit_global(global, &mut |layout: StorageLayout| {
            self.backend.borrow_mut().allocate_global_storage(layout)
        })?;
        if self.compiling.get().is_none() {
            self.drain_pending()?;
        }
        Ok(address)
    }

    /// Resolves a global to its storage. External globals come from the
    /// symbol resolver; others get fresh zeroed storage from `allocate` and
    /// are queued for initialization.
    pub(crate) fn get_or_emit_global(
        &self,
        global: GlobalId,
        allocate: &mut dyn FnMut(StorageLayout) -> Result<*const u8>,
    ) -> Result<Address> {
        let entity = Entity::Global(global);
        if let Some(address) = self.lookup(entity) {
            return Ok(address);
        }

        let (name, ty, external) = {
            let module = self.module.borrow();
            let def = module.global(global)?;
            (def.name.clone(), def.ty, def.external)
        };

        if external {
            let ptr = self
                .symbols
                .resolve(&name)
                .ok_or_else(|| JitError::UnresolvedSymbol { name: name.clone() })?;
            let address = self.state.borrow_mut().cache.install(entity, ptr)?;
            tracing::debug!(global = %name, ?address, "resolved external global");
            return Ok(address);
        }

        if ty == Type::Void {
            return Err(JitError::UnsupportedType {
                ty,
                context: format!("global '{}'", name),
            });
        }

        let ptr = allocate(StorageLayout::of(ty))?;
        let mut state = self.state.borrow_mut();
        let address = state.cache.install(entity, ptr)?;
        state.deferred.push(global);
        tracing::trace!(global = %name, ?address, "allocated global storage");
        Ok(address)
    }

    /// Writes every pending initializer, most recently deferred first.
    ///
    /// Keeps going after a failure and reports the first one. On failure
    /// every global drained here loses its mapping, so no storage stays
    /// reachable without its initializer.
    fn drain_pending(&self) -> Result<()> {
        let mut drained = Vec::new();
        let mut first_error = None;
        loop {
            let next = self.state.borrow_mut().deferred.pop();
            let Some(global) = next else {
                break;
            };
            drained.push(global);
            if let Err(e) = self.emit_global(global) {
                tracing::warn!(global = global.index(), error = %e, "global initialization failed");
                first_error.get_or_insert(e);
            }
        }

        let Some(e) = first_error else {
            return Ok(());
        };
        let mut state = self.state.borrow_mut();
        for global in &drained {
            state.cache.invalidate(Entity::Global(*global));
        }
        tracing::debug!(globals = drained.len(), "rolled back global storage");
        Err(e)
    }

    fn emit_global(&self, global: GlobalId) -> Result<()> {
        let (name, ty, initializer) = {
            let module = self.module.borrow();
            let def = module.global(global)?;
            (def.name.clone(), def.ty, def.initializer.clone())
        };
        let address = self
            .lookup(Entity::Global(global))
            .ok_or(JitError::UnknownGlobal(global.index()))?;

        let Some(initializer) = initializer else {
            return Ok(());
        };
        if initializer.ty() != ty {
            return Err(JitError::UnsupportedType {
                ty: initializer.ty(),
                context: format!("initializer of {} global '{}'", ty, name),
            });
        }

        let bits = match initializer {
            Constant::Int { ty, bits } => truncate_bits(ty, bits),
            Constant::F32(v) => v.to_bits() as u64,
            Constant::F64(v) => v.to_bits(),
            Constant::Null => 0,
            Constant::GlobalAddr(target) => {
                let target = self.get_or_emit_global(target, &mut |layout: StorageLayout| {
                    self.backend.borrow_mut().allocate_global_storage(layout)
                })?;
                target.addr() as u64
            }
            Constant::FuncAddr(target) => self.pointer_to_function_or_stub(target)?.addr() as u64,
        };

        unsafe { write_scalar(address, ty.size(), bits) };
        tracing::trace!(global = %name, ?address, bits, "initialized global");
        Ok(())
    }
}

/// Stores the low `size` bytes of `bits` at `address` in native byte order.
unsafe fn write_scalar(address: Address, size: usize, bits: u64) {
    let p = address.as_mut_ptr();
    unsafe {
        match size {
            1 => std::ptr::write_unaligned(p, bits as u8),
            2 => std::ptr::write_unaligned(p as *mut u16, bits as u16),
            4 => std::ptr::write_unaligned(p as *mut u32, bits as u32),
            8 => std::ptr::write_unaligned(p as *mut u64, bits),
            _ => {}
        }
    }
}

/// Entry point of lazy stubs. Runs with native frames on the stack, so a
/// failure cannot be returned and aborts the process.
extern "C" fn resolve_lazy(context: *const c_void, index: u32) -> *const u8 {
    let core = unsafe { &*(context as *const EngineCore) };
    let function = FunctionId::from_index(index);
    match core.ensure_compiled(function) {
        Ok(address) => address.as_ptr(),
        Err(e) => {
            tracing::error!(
                function = %core.function_name(function),
                error = %e,
                "lazy compilation failed"
            );
            std::process::abort()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_releases_on_drop() {
        let flag = Cell::new(None);
        {
            let _guard = CompilationGuard::acquire(&flag, FunctionId::from_index(3));
            assert_eq!(flag.get(), Some(FunctionId::from_index(3)));
        }
        assert_eq!(flag.get(), None);
    }

    #[test]
    fn test_guard_releases_on_early_return() {
        fn failing(flag: &Cell<Option<FunctionId>>) -> Result<()> {
            let _guard = CompilationGuard::acquire(flag, FunctionId::from_index(0));
            Err(JitError::Backend("boom".to_string()))
        }
        let flag = Cell::new(None);
        assert!(failing(&flag).is_err());
        assert_eq!(flag.get(), None);
    }

    #[test]
    fn test_write_scalar_widths() {
        let mut slot = [0xAAu8; 8];
        let address = Address::new(slot.as_mut_ptr()).unwrap();
        unsafe { write_scalar(address, 2, 0x1234_5678) };
        assert_eq!(u16::from_ne_bytes([slot[0], slot[1]]), 0x5678);
        assert_eq!(slot[2], 0xAA);
    }
}
