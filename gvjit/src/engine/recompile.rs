use crate::cache::Address;
use crate::engine::EngineCore;
use crate::error::Result;
use crate::ir::{Entity, FunctionId};

impl EngineCore {
    /// Compiles `function` again from its current body and redirects the old
    /// entry point to the new code.
    ///
    /// A function that was never compiled is simply compiled. If the new
    /// compilation fails, or a global it allocated cannot be initialized,
    /// the old address is put back and nothing is redirected. The cache and
    /// the old entry point then agree on the old body.
    pub(crate) fn recompile(&self, function: FunctionId) -> Result<Address> {
        let entity = Entity::Function(function);
        let Some(old) = self.lookup(entity) else {
            return self.ensure_compiled(function);
        };

        if let Some(active) = self.compiling.get() {
            return Err(self.recursion_error(function, active));
        }
        if self.module.borrow().function(function)?.is_declaration() {
            return Ok(old);
        }

        let name = self.function_name(function);
        tracing::debug!(function = %name, ?old, "recompiling");

        self.module.borrow_mut().materialize(function)?;
        self.state.borrow_mut().cache.invalidate(entity);

        let new = match self.run_jit_on_function(function) {
            Ok(new) => new,
            Err(e) => {
                let mut state = self.state.borrow_mut();
                if state.cache.lookup(entity).is_none() {
                    state.cache.install(entity, old.as_ptr())?;
                }
                return Err(e);
            }
        };

        self.patcher.borrow_mut().redirect(old, new)?;
        tracing::debug!(function = %name, ?old, ?new, "redirected old entry point");
        Ok(new)
    }
}
