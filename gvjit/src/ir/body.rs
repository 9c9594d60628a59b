use crate::ir::{FunctionId, GlobalId, Type};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
}

/// Compile-time constants, used as operands and as global initializers.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// Two's complement bits, truncated to the width of `ty` when emitted.
    Int { ty: Type, bits: u64 },
    F32(f32),
    F64(f64),
    Null,
    GlobalAddr(GlobalId),
    FuncAddr(FunctionId),
}

impl Constant {
    pub fn int(ty: Type, value: i64) -> Self {
        Constant::Int {
            ty,
            bits: value as u64,
        }
    }

    pub fn ty(&self) -> Type {
        match self {
            Constant::Int { ty, .. } => *ty,
            Constant::F32(_) => Type::F32,
            Constant::F64(_) => Type::F64,
            Constant::Null | Constant::GlobalAddr(_) | Constant::FuncAddr(_) => Type::Ptr,
        }
    }
}

/// Keeps only the low `ty.size()` bytes of `bits`.
pub(crate) fn truncate_bits(ty: Type, bits: u64) -> u64 {
    match ty.size() {
        0 => 0,
        n if n >= 8 => bits,
        n => bits & ((1u64 << (n * 8)) - 1),
    }
}

/// Interprets the low `ty.size()` bytes of `bits` as a signed integer.
pub(crate) fn sign_extend_bits(ty: Type, bits: u64) -> i64 {
    match ty.size() {
        0 => 0,
        n if n >= 8 => bits as i64,
        n => {
            let shift = 64 - n * 8;
            ((bits << shift) as i64) >> shift
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Param(u32),
    Const(Constant),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        callee: FunctionId,
        args: Vec<Expr>,
    },
    Load {
        ty: Type,
        addr: Box<Expr>,
    },
    GlobalAddr(GlobalId),
    FuncAddr(FunctionId),
    Cast {
        ty: Type,
        value: Box<Expr>,
    },
}

impl Expr {
    pub fn param(index: u32) -> Self {
        Expr::Param(index)
    }

    pub fn int(ty: Type, value: i64) -> Self {
        Expr::Const(Constant::int(ty, value))
    }

    pub fn i32(value: i32) -> Self {
        Expr::int(Type::I32, value as i64)
    }

    pub fn i64(value: i64) -> Self {
        Expr::int(Type::I64, value)
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn add(lhs: Expr, rhs: Expr) -> Self {
        Expr::binary(BinOp::Add, lhs, rhs)
    }

    pub fn sub(lhs: Expr, rhs: Expr) -> Self {
        Expr::binary(BinOp::Sub, lhs, rhs)
    }

    pub fn mul(lhs: Expr, rhs: Expr) -> Self {
        Expr::binary(BinOp::Mul, lhs, rhs)
    }

    pub fn call(callee: FunctionId, args: Vec<Expr>) -> Self {
        Expr::Call { callee, args }
    }

    pub fn load(ty: Type, addr: Expr) -> Self {
        Expr::Load {
            ty,
            addr: Box::new(addr),
        }
    }

    pub fn cast(ty: Type, value: Expr) -> Self {
        Expr::Cast {
            ty,
            value: Box::new(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Return(Option<Expr>),
    Store { addr: Expr, value: Expr },
    Eval(Expr),
}
