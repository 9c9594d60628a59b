use std::collections::HashMap;

use cranelift::prelude::*;
use cranelift_codegen::ir::UserFuncName;
use cranelift_jit::JITModule;
use cranelift_module::{Linkage, Module as _};

use crate::backend::LazyResolver;
use crate::backend::cranelift::define_checked;
use crate::backend::cranelift::types;
use crate::error::{JitError, Result};
use crate::ir::{FunctionId, Module};

/// Lazy compilation stubs, one per callee.
///
/// A stub has the callee's signature. Each call asks the engine for the
/// callee's current address (compiling it the first time) and forwards the
/// arguments to it, so the stub stays valid across recompilation.
pub struct Trampolines {
    stubs: HashMap<FunctionId, *const u8>,
    ctx: codegen::Context,
    counter: u32,
}

impl Trampolines {
    pub fn new(jit: &JITModule) -> Self {
        Self {
            stubs: HashMap::new(),
            ctx: jit.make_context(),
            counter: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    pub fn get_or_build(
        &mut self,
        jit: &mut JITModule,
        program: &Module,
        function: FunctionId,
        resolver: LazyResolver,
    ) -> Result<*const u8> {
        if let Some(&stub) = self.stubs.get(&function) {
            return Ok(stub);
        }
        let stub = self.build(jit, program, function, resolver)?;
        self.stubs.insert(function, stub);
        Ok(stub)
    }

    fn build(
        &mut self,
        jit: &mut JITModule,
        program: &Module,
        function: FunctionId,
        resolver: LazyResolver,
    ) -> Result<*const u8> {
        let def = program.function(function)?;
        let pointer_type = jit.target_config().pointer_type();
        let target_sig = types::signature(jit, &def.signature)?;

        self.counter += 1;
        let symbol = format!("{}#lazy{}", def.name, self.counter);
        let func_id = jit
            .declare_function(&symbol, Linkage::Local, &target_sig)
            .map_err(|e| {
                JitError::Backend(format!("Failed to declare trampoline '{}': {}", symbol, e))
            })?;

        let mut resolve_sig = jit.make_signature();
        resolve_sig.params.push(AbiParam::new(pointer_type));
        resolve_sig.params.push(AbiParam::new(cranelift::prelude::types::I32));
        resolve_sig.returns.push(AbiParam::new(pointer_type));

        self.ctx.func.signature = target_sig.clone();
        self.ctx.func.name = UserFuncName::user(0, func_id.as_u32());

        let mut builder_ctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(&mut self.ctx.func, &mut builder_ctx);

        let entry_block = builder.create_block();
        builder.append_block_params_for_function_params(entry_block);
        builder.switch_to_block(entry_block);
        builder.seal_block(entry_block);
        let params = builder.block_params(entry_block).to_vec();

        let context = builder
            .ins()
            .iconst(pointer_type, resolver.context as usize as i64);
        let index = builder.ins().iconst(
            cranelift::prelude::types::I32,
            function.index() as i64,
        );
        let callback = builder
            .ins()
            .iconst(pointer_type, resolver.callback as usize as i64);
        let resolve_ref = builder.import_signature(resolve_sig);
        let resolve_call = builder
            .ins()
            .call_indirect(resolve_ref, callback, &[context, index]);
        let target = builder.inst_results(resolve_call)[0];

        let target_ref = builder.import_signature(target_sig);
        let forward = builder.ins().call_indirect(target_ref, target, &params);
        let results = builder.inst_results(forward).to_vec();
        builder.ins().return_(&results);
        builder.finalize();

        define_checked(jit, &mut self.ctx, func_id, &symbol)?;
        jit.finalize_definitions()
            .map_err(|e| JitError::Backend(format!("Failed to finalize: {}", e)))?;

        tracing::trace!(function = %def.name, symbol = %symbol, "built lazy trampoline");
        Ok(jit.get_finalized_function(func_id))
    }
}
