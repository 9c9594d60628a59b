//!
//! Body Lowering
//!
//! Translates a materialized function body into Cranelift IR. Bodies are
//! straight-line: every statement lands in the entry block and the body
//! ends at its first `return`. Operand types must agree exactly; `cast` is
//! the only conversion.
//!

use cranelift::prelude::*;
use cranelift_jit::JITModule;
use cranelift_module::{FuncId, Module as _};
use smallvec::SmallVec;

use crate::backend::cranelift::trampoline::Trampolines;
use crate::backend::cranelift::types::{signature, value_type};
use crate::backend::{GlobalArena, StorageLayout};
use crate::engine::EmitContext;
use crate::error::{JitError, Result};
use crate::ir::{
    BinOp, Constant, Expr, FunctionDef, FunctionId, GlobalId, Module, Signature as IrSignature,
    Stmt, Type as IrType, truncate_bits,
};

type Args = SmallVec<[Value; 4]>;

pub struct FunctionLowering<'a, 'e> {
    builder: FunctionBuilder<'a>,
    jit: &'a mut JITModule,
    trampolines: &'a mut Trampolines,
    storage: &'a mut GlobalArena,
    program: &'a Module,
    function: FunctionId,
    func_id: FuncId,
    signature: &'a IrSignature,
    name: &'a str,
    cx: &'a mut EmitContext<'e>,
    pointer_type: Type,
    params: Vec<Value>,
}

impl<'a, 'e> FunctionLowering<'a, 'e> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        builder: FunctionBuilder<'a>,
        jit: &'a mut JITModule,
        trampolines: &'a mut Trampolines,
        storage: &'a mut GlobalArena,
        program: &'a Module,
        function: FunctionId,
        def: &'a FunctionDef,
        func_id: FuncId,
        cx: &'a mut EmitContext<'e>,
        pointer_type: Type,
    ) -> Self {
        Self {
            builder,
            jit,
            trampolines,
            storage,
            program,
            function,
            func_id,
            signature: &def.signature,
            name: &def.name,
            cx,
            pointer_type,
            params: Vec::new(),
        }
    }

    pub fn lower(mut self, body: &[Stmt]) -> Result<()> {
        let entry_block = self.builder.create_block();
        self.builder
            .append_block_params_for_function_params(entry_block);
        self.builder.switch_to_block(entry_block);
        self.builder.seal_block(entry_block);
        self.params = self.builder.block_params(entry_block).to_vec();

        let mut returned = false;
        for stmt in body {
            if returned {
                return Err(self.error("statement after return is unreachable"));
            }
            returned = self.lower_stmt(stmt)?;
        }

        if !returned {
            if self.signature.ret != IrType::Void {
                return Err(self.error(format!(
                    "missing return of type {}",
                    self.signature.ret
                )));
            }
            self.builder.ins().return_(&[]);
        }

        self.builder.finalize();
        Ok(())
    }

    /// Returns true if the statement terminated the body.
    fn lower_stmt(&mut self, stmt: &Stmt) -> Result<bool> {
        match stmt {
            Stmt::Return(None) => {
                if self.signature.ret != IrType::Void {
                    return Err(self.error(format!(
                        "bare return in function returning {}",
                        self.signature.ret
                    )));
                }
                self.builder.ins().return_(&[]);
                Ok(true)
            }
            Stmt::Return(Some(expr)) => {
                let (value, ty) = self.lower_value(expr)?;
                if ty != self.signature.ret {
                    return Err(self.error(format!(
                        "return of {} in function returning {}",
                        ty, self.signature.ret
                    )));
                }
                self.builder.ins().return_(&[value]);
                Ok(true)
            }
            Stmt::Store { addr, value } => {
                let addr = self.lower_pointer(addr, "store")?;
                let (value, _) = self.lower_value(value)?;
                self.builder.ins().store(MemFlags::new(), value, addr, 0);
                Ok(false)
            }
            Stmt::Eval(expr) => {
                self.lower_expr(expr)?;
                Ok(false)
            }
        }
    }

    fn lower_value(&mut self, expr: &Expr) -> Result<(Value, IrType)> {
        match self.lower_expr(expr)? {
            (Some(value), ty) => Ok((value, ty)),
            (None, _) => Err(self.error("void expression used as a value")),
        }
    }

    fn lower_pointer(&mut self, expr: &Expr, context: &str) -> Result<Value> {
        let (value, ty) = self.lower_value(expr)?;
        if ty != IrType::Ptr {
            return Err(self.error(format!("{} address has type {}, expected ptr", context, ty)));
        }
        Ok(value)
    }

    fn lower_expr(&mut self, expr: &Expr) -> Result<(Option<Value>, IrType)> {
        match expr {
            Expr::Param(index) => {
                let ty = self
                    .signature
                    .params
                    .get(*index as usize)
                    .copied()
                    .ok_or_else(|| self.error(format!("parameter %{} out of range", index)))?;
                Ok((Some(self.params[*index as usize]), ty))
            }
            Expr::Const(constant) => {
                let (value, ty) = self.lower_constant(constant)?;
                Ok((Some(value), ty))
            }
            Expr::Binary { op, lhs, rhs } => {
                let (lhs, lty) = self.lower_value(lhs)?;
                let (rhs, rty) = self.lower_value(rhs)?;
                if lty != rty {
                    return Err(self.error(format!(
                        "operands of {:?} differ: {} and {}",
                        op, lty, rty
                    )));
                }
                let ins = self.builder.ins();
                let value = if lty.is_float() {
                    match op {
                        BinOp::Add => ins.fadd(lhs, rhs),
                        BinOp::Sub => ins.fsub(lhs, rhs),
                        BinOp::Mul => ins.fmul(lhs, rhs),
                    }
                } else {
                    match op {
                        BinOp::Add => ins.iadd(lhs, rhs),
                        BinOp::Sub => ins.isub(lhs, rhs),
                        BinOp::Mul => ins.imul(lhs, rhs),
                    }
                };
                Ok((Some(value), lty))
            }
            Expr::Call { callee, args } => self.lower_call(*callee, args),
            Expr::Load { ty, addr } => {
                let addr = self.lower_pointer(addr, "load")?;
                let clif_ty = value_type(*ty, self.pointer_type, "load")?;
                let value = self.builder.ins().load(clif_ty, MemFlags::new(), addr, 0);
                Ok((Some(value), *ty))
            }
            Expr::GlobalAddr(global) => {
                let value = self.global_address(*global)?;
                Ok((Some(value), IrType::Ptr))
            }
            Expr::FuncAddr(function) => {
                let value = self.function_address(*function)?;
                Ok((Some(value), IrType::Ptr))
            }
            Expr::Cast { ty, value } => {
                let (value, from) = self.lower_value(value)?;
                let value = self.cast(value, from, *ty)?;
                Ok((Some(value), *ty))
            }
        }
    }

    fn lower_constant(&mut self, constant: &Constant) -> Result<(Value, IrType)> {
        match constant {
            Constant::Int { ty, bits } => {
                let clif_ty = value_type(*ty, self.pointer_type, "integer constant")?;
                if ty.is_float() {
                    return Err(self.error(format!("integer constant of type {}", ty)));
                }
                let value = self
                    .builder
                    .ins()
                    .iconst(clif_ty, truncate_bits(*ty, *bits) as i64);
                Ok((value, *ty))
            }
            Constant::F32(v) => Ok((self.builder.ins().f32const(*v), IrType::F32)),
            Constant::F64(v) => Ok((self.builder.ins().f64const(*v), IrType::F64)),
            Constant::Null => Ok((self.builder.ins().iconst(self.pointer_type, 0), IrType::Ptr)),
            Constant::GlobalAddr(global) => Ok((self.global_address(*global)?, IrType::Ptr)),
            Constant::FuncAddr(function) => Ok((self.function_address(*function)?, IrType::Ptr)),
        }
    }

    fn lower_call(&mut self, callee: FunctionId, args: &[Expr]) -> Result<(Option<Value>, IrType)> {
        let program = self.program;
        let def = program.function(callee)?;
        if args.len() != def.signature.params.len() {
            return Err(self.error(format!(
                "call to {} passes {} arguments, expected {}",
                def.name,
                args.len(),
                def.signature.params.len()
            )));
        }

        let mut values = Args::new();
        for (index, (arg, &expected)) in args.iter().zip(&def.signature.params).enumerate() {
            let (value, ty) = self.lower_value(arg)?;
            if ty != expected {
                return Err(self.error(format!(
                    "argument {} of call to {} has type {}, expected {}",
                    index, def.name, ty, expected
                )));
            }
            values.push(value);
        }

        let call = if callee == self.function {
            let func_ref = self
                .jit
                .declare_func_in_func(self.func_id, self.builder.func);
            self.builder.ins().call(func_ref, &values)
        } else {
            let target = self.callee_address(callee)?;
            let sig = signature(self.jit, &def.signature)?;
            let sig_ref = self.builder.import_signature(sig);
            let target = self.address_const(target);
            self.builder.ins().call_indirect(sig_ref, target, &values)
        };

        let result = self.builder.inst_results(call).first().copied();
        Ok((result, def.signature.ret))
    }

    /// Address a call to `function` should jump to right now.
    fn callee_address(&mut self, function: FunctionId) -> Result<*const u8> {
        if let Some(address) = self.cx.lookup_function(function) {
            return Ok(address.as_ptr());
        }
        if self.program.function(function)?.is_declaration() {
            return self.cx.external_function(function);
        }
        match self.cx.lazy_resolver() {
            Some(resolver) => {
                self.trampolines
                    .get_or_build(self.jit, self.program, function, resolver)
            }
            None => self.cx.ensure_compiled(function),
        }
    }

    fn function_address(&mut self, function: FunctionId) -> Result<Value> {
        if function == self.function {
            let func_ref = self
                .jit
                .declare_func_in_func(self.func_id, self.builder.func);
            return Ok(self.builder.ins().func_addr(self.pointer_type, func_ref));
        }
        let target = self.callee_address(function)?;
        Ok(self.address_const(target))
    }

    fn global_address(&mut self, global: GlobalId) -> Result<Value> {
        let storage = &mut *self.storage;
        let address = self
            .cx
            .global_address(global, &mut |layout: StorageLayout| storage.allocate(layout))?;
        Ok(self.address_const(address))
    }

    fn address_const(&mut self, address: *const u8) -> Value {
        self.builder
            .ins()
            .iconst(self.pointer_type, address as usize as i64)
    }

    fn cast(&mut self, value: Value, from: IrType, to: IrType) -> Result<Value> {
        let from_clif = value_type(from, self.pointer_type, "cast")?;
        let to_clif = value_type(to, self.pointer_type, "cast")?;
        let int_like = |ty: IrType| ty.is_integer() || ty == IrType::Ptr;
        if to == IrType::Ptr && from.is_float() {
            return Err(self.error(format!("cannot cast {} to ptr", from)));
        }
        let ins = self.builder.ins();

        let value = match (int_like(from), int_like(to)) {
            _ if to == IrType::Bool && int_like(from) => {
                if from == IrType::Bool {
                    value
                } else {
                    ins.icmp_imm(IntCC::NotEqual, value, 0)
                }
            }
            (true, true) => {
                if from_clif == to_clif {
                    value
                } else if from.size() < to.size() {
                    if from.is_signed() {
                        ins.sextend(to_clif, value)
                    } else {
                        ins.uextend(to_clif, value)
                    }
                } else {
                    ins.ireduce(to_clif, value)
                }
            }
            (true, false) => {
                let wide = if from.size() < 4 {
                    if from.is_signed() {
                        ins.sextend(types::I32, value)
                    } else {
                        ins.uextend(types::I32, value)
                    }
                } else {
                    value
                };
                let ins = self.builder.ins();
                if from.is_signed() {
                    ins.fcvt_from_sint(to_clif, wide)
                } else {
                    ins.fcvt_from_uint(to_clif, wide)
                }
            }
            (false, true) => {
                let wide_ty = if to.size() < 4 { types::I32 } else { to_clif };
                let converted = if to.is_signed() {
                    ins.fcvt_to_sint_sat(wide_ty, value)
                } else {
                    ins.fcvt_to_uint_sat(wide_ty, value)
                };
                if wide_ty == to_clif {
                    converted
                } else {
                    self.builder.ins().ireduce(to_clif, converted)
                }
            }
            (false, false) => match (from, to) {
                (IrType::F32, IrType::F64) => ins.fpromote(types::F64, value),
                (IrType::F64, IrType::F32) => ins.fdemote(types::F32, value),
                _ => value,
            },
        };
        Ok(value)
    }

    fn error(&self, message: impl std::fmt::Display) -> JitError {
        JitError::compile(self.name, message)
    }
}
