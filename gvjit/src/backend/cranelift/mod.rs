//!
//! Cranelift Emission Backend
//!
//! Compiles one function at a time into a long-lived `JITModule`. Every
//! compilation declares a fresh local symbol (`name#generation`), so a
//! recompiled function gets new code while the old code stays mapped and
//! can be redirected.
//!
//! Calls to other functions are emitted as `call_indirect` through the
//! callee's current address, an external symbol, or a lazy trampoline that
//! compiles the callee on first use.
//!

mod errors;
mod lower;
mod trampoline;
mod types;

use std::mem::ManuallyDrop;
use std::panic;

use cranelift::prelude::*;
use cranelift_codegen::ir::UserFuncName;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module as _};

use crate::backend::{EmissionBackend, GlobalArena, LazyResolver, StorageLayout};
use crate::config::EngineConfig;
use crate::engine::EmitContext;
use crate::error::{JitError, Result};
use crate::ir::{FunctionId, Module};

use errors::{convert_cranelift_error, panic_message};
use lower::FunctionLowering;
use trampoline::Trampolines;

pub struct CraneliftBackend {
    module: ManuallyDrop<JITModule>,
    ctx: codegen::Context,
    trampolines: Trampolines,
    storage: GlobalArena,
    generation: u32,
}

impl CraneliftBackend {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let mut flag_builder = settings::builder();
        let flags = [
            ("use_colocated_libcalls", "false"),
            ("is_pic", "false"),
            ("preserve_frame_pointers", "true"),
            ("opt_level", config.opt_level.as_flag()),
            ("enable_verifier", if config.verify { "true" } else { "false" }),
        ];
        for (name, value) in flags {
            flag_builder.set(name, value).map_err(|e| {
                JitError::Backend(format!("Failed to set flag {}={}: {}", name, value, e))
            })?;
        }

        let isa_builder = cranelift_native::builder()
            .map_err(|e| JitError::Backend(format!("Failed to create ISA builder: {}", e)))?;

        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| JitError::Backend(format!("Failed to create ISA: {}", e)))?;

        tracing::debug!(
            triple = %isa.triple(),
            opt_level = config.opt_level.as_flag(),
            "cranelift isa ready"
        );

        let builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        let module = JITModule::new(builder);
        let ctx = module.make_context();
        let trampolines = Trampolines::new(&module);

        Ok(Self {
            module: ManuallyDrop::new(module),
            ctx,
            trampolines,
            storage: GlobalArena::new(),
            generation: 0,
        })
    }

    /// Number of lazy trampolines built so far.
    pub fn trampoline_count(&self) -> usize {
        self.trampolines.len()
    }
}

impl EmissionBackend for CraneliftBackend {
    fn compile_function(
        &mut self,
        program: &Module,
        function: FunctionId,
        cx: &mut EmitContext<'_>,
    ) -> Result<*const u8> {
        let def = program.function(function)?;
        let body = def.statements().ok_or_else(|| {
            JitError::compile(&def.name, "function has no materialized body")
        })?;

        self.generation += 1;
        let symbol = format!("{}#{}", def.name, self.generation);
        let sig = types::signature(&self.module, &def.signature)?;
        let func_id = self
            .module
            .declare_function(&symbol, Linkage::Local, &sig)
            .map_err(|e| {
                JitError::Backend(format!("Failed to declare function '{}': {}", symbol, e))
            })?;

        self.ctx.func.signature = sig;
        self.ctx.func.name = UserFuncName::user(0, func_id.as_u32());

        let pointer_type = self.module.target_config().pointer_type();
        let mut builder_ctx = FunctionBuilderContext::new();
        let lowering = FunctionLowering::new(
            FunctionBuilder::new(&mut self.ctx.func, &mut builder_ctx),
            &mut self.module,
            &mut self.trampolines,
            &mut self.storage,
            program,
            function,
            def,
            func_id,
            cx,
            pointer_type,
        );
        if let Err(e) = lowering.lower(body) {
            self.module.clear_context(&mut self.ctx);
            return Err(e);
        }

        define_checked(&mut self.module, &mut self.ctx, func_id, &def.name)?;

        self.module
            .finalize_definitions()
            .map_err(|e| JitError::Backend(format!("Failed to finalize: {}", e)))?;

        Ok(self.module.get_finalized_function(func_id))
    }

    fn allocate_global_storage(&mut self, layout: StorageLayout) -> Result<*const u8> {
        self.storage.allocate(layout)
    }

    fn lazy_stub(
        &mut self,
        program: &Module,
        function: FunctionId,
        resolver: LazyResolver,
    ) -> Result<Option<*const u8>> {
        self.trampolines
            .get_or_build(&mut self.module, program, function, resolver)
            .map(Some)
    }
}

impl Drop for CraneliftBackend {
    fn drop(&mut self) {
        let module = unsafe { ManuallyDrop::take(&mut self.module) };
        unsafe { module.free_memory() };
    }
}

/// Defines the function held in `ctx`, converting code generator panics into
/// errors. The context is cleared either way.
fn define_checked(
    jit: &mut JITModule,
    ctx: &mut codegen::Context,
    func_id: FuncId,
    name: &str,
) -> Result<()> {
    let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        jit.define_function(func_id, ctx)
    }));
    jit.clear_context(ctx);

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(JitError::compile(
            name,
            format!("Failed to define function: {}", e),
        )),
        Err(panic_info) => Err(convert_cranelift_error(&panic_message(panic_info.as_ref()), name)),
    }
}
