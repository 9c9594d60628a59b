//!
//! Textual rendering of functions, for trace logs and tests.
//!
//! ```text
//! fn add(i32, i32) -> i32 {
//!     return add(%0, %1)
//! }
//! ```
//!

use std::fmt::{self, Write};

use crate::ir::{
    BinOp, Body, Constant, Expr, FunctionDef, Module, Stmt, sign_extend_bits, truncate_bits,
};

pub struct FunctionDisplay<'a> {
    module: &'a Module,
    def: &'a FunctionDef,
}

impl<'a> FunctionDisplay<'a> {
    pub(crate) fn new(module: &'a Module, def: &'a FunctionDef) -> Self {
        Self { module, def }
    }

    fn constant(&self, f: &mut fmt::Formatter<'_>, c: &Constant) -> fmt::Result {
        match c {
            Constant::Int { ty, bits } if ty.is_signed() => {
                write!(f, "{} {}", ty, sign_extend_bits(*ty, *bits))
            }
            Constant::Int { ty, bits } => write!(f, "{} {}", ty, truncate_bits(*ty, *bits)),
            Constant::F32(v) => write!(f, "f32 {:?}", v),
            Constant::F64(v) => write!(f, "f64 {:?}", v),
            Constant::Null => f.write_str("null"),
            Constant::GlobalAddr(id) => self.global_ref(f, id.index()),
            Constant::FuncAddr(id) => write!(f, "&{}", self.module.function_name(*id)),
        }
    }

    fn global_ref(&self, f: &mut fmt::Formatter<'_>, index: u32) -> fmt::Result {
        match self.module.globals.get(index as usize) {
            Some(g) => write!(f, "@{}", g.name),
            None => write!(f, "@#{}", index),
        }
    }

    fn expr(&self, f: &mut fmt::Formatter<'_>, e: &Expr) -> fmt::Result {
        match e {
            Expr::Param(i) => write!(f, "%{}", i),
            Expr::Const(c) => self.constant(f, c),
            Expr::Binary { op, lhs, rhs } => {
                let name = match op {
                    BinOp::Add => "add",
                    BinOp::Sub => "sub",
                    BinOp::Mul => "mul",
                };
                write!(f, "{}(", name)?;
                self.expr(f, lhs)?;
                f.write_str(", ")?;
                self.expr(f, rhs)?;
                f.write_char(')')
            }
            Expr::Call { callee, args } => {
                write!(f, "call {}(", self.module.function_name(*callee))?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    self.expr(f, arg)?;
                }
                f.write_char(')')
            }
            Expr::Load { ty, addr } => {
                write!(f, "load {} ", ty)?;
                self.expr(f, addr)
            }
            Expr::GlobalAddr(id) => self.global_ref(f, id.index()),
            Expr::FuncAddr(id) => write!(f, "&{}", self.module.function_name(*id)),
            Expr::Cast { ty, value } => {
                write!(f, "cast {} ", ty)?;
                self.expr(f, value)
            }
        }
    }

    fn stmt(&self, f: &mut fmt::Formatter<'_>, s: &Stmt) -> fmt::Result {
        f.write_str("    ")?;
        match s {
            Stmt::Return(None) => f.write_str("return")?,
            Stmt::Return(Some(e)) => {
                f.write_str("return ")?;
                self.expr(f, e)?;
            }
            Stmt::Store { addr, value } => {
                f.write_str("store ")?;
                self.expr(f, addr)?;
                f.write_str(", ")?;
                self.expr(f, value)?;
            }
            Stmt::Eval(e) => {
                f.write_str("eval ")?;
                self.expr(f, e)?;
            }
        }
        f.write_char('\n')
    }
}

impl fmt::Display for FunctionDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let def = self.def;
        if def.is_declaration() {
            f.write_str("declare ")?;
        }
        write!(f, "fn {}(", def.name)?;
        for (i, p) in def.signature.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", p)?;
        }
        write!(f, ") -> {}", def.signature.ret)?;

        match &def.body {
            None => Ok(()),
            Some(Body::Deferred) => f.write_str(" <deferred>"),
            Some(Body::Ready(stmts)) => {
                f.write_str(" {\n")?;
                for s in stmts {
                    self.stmt(f, s)?;
                }
                f.write_char('}')
            }
        }
    }
}
