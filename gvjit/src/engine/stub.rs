use crate::error::{JitError, Result};
use crate::ir::{Expr, FunctionId, Signature, Stmt, Type};
use crate::value::GenericValue;

/// Builds the body of a nullary stub that calls `target` with fixed
/// arguments and returns whatever it returns.
pub struct StubBuilder<'a> {
    target: FunctionId,
    signature: &'a Signature,
}

impl<'a> StubBuilder<'a> {
    pub fn new(target: FunctionId, signature: &'a Signature) -> Self {
        Self { target, signature }
    }

    pub fn build(&self, args: &[GenericValue]) -> Result<Vec<Stmt>> {
        let mut operands = Vec::with_capacity(args.len());
        for (index, (arg, &param)) in args.iter().zip(&self.signature.params).enumerate() {
            let constant = arg.to_constant().ok_or_else(|| JitError::UnsupportedType {
                ty: arg.ty(),
                context: format!("argument {} of a call stub", index),
            })?;
            // Pointers travel as pointer-width integers.
            let operand = if param == Type::Ptr {
                Expr::cast(Type::Ptr, Expr::Const(constant))
            } else {
                Expr::Const(constant)
            };
            operands.push(operand);
        }

        let call = Expr::call(self.target, operands);
        let body = if self.signature.ret == Type::Void {
            vec![Stmt::Eval(call), Stmt::Return(None)]
        } else {
            vec![Stmt::Return(Some(call))]
        };
        Ok(body)
    }
}
