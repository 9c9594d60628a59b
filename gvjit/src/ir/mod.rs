//!
//! Program Model
//!
//! The engine executes programs held in a `Module`: a table of function and
//! global definitions addressed by `FunctionId` / `GlobalId` handles. Handles
//! give every definition reference identity; two functions with identical
//! bodies are still distinct entities.
//!
//! Function bodies may be deferred. A deferred body is fetched from the
//! module's `BodySource` the first time the engine materializes it.
//!

mod body;
mod display;

use std::fmt;

use indexmap::IndexMap;

pub use body::{BinOp, Constant, Expr, Stmt};
pub(crate) use body::{sign_extend_bits, truncate_bits};
pub use display::FunctionDisplay;

use crate::error::{JitError, Result};

/// Scalar types understood by the engine and the generic call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Ptr,
}

impl Type {
    /// Storage size in bytes on the host.
    pub fn size(self) -> usize {
        match self {
            Type::Void => 0,
            Type::Bool | Type::I8 | Type::U8 => 1,
            Type::I16 | Type::U16 => 2,
            Type::I32 | Type::U32 | Type::F32 => 4,
            Type::I64 | Type::U64 | Type::F64 => 8,
            Type::Ptr => std::mem::size_of::<usize>(),
        }
    }

    pub fn align(self) -> usize {
        self.size().max(1)
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Type::Bool
                | Type::I8
                | Type::U8
                | Type::I16
                | Type::U16
                | Type::I32
                | Type::U32
                | Type::I64
                | Type::U64
        )
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Type::I8 | Type::I16 | Type::I32 | Type::I64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, Type::F32 | Type::F64)
    }

    /// The signed integer type with the same width as a host pointer.
    pub fn pointer_sized_int() -> Type {
        if std::mem::size_of::<usize>() == 4 {
            Type::I32
        } else {
            Type::I64
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Type::Void => "void",
            Type::Bool => "bool",
            Type::I8 => "i8",
            Type::U8 => "u8",
            Type::I16 => "i16",
            Type::U16 => "u16",
            Type::I32 => "i32",
            Type::U32 => "u32",
            Type::I64 => "i64",
            Type::U64 => "u64",
            Type::F32 => "f32",
            Type::F64 => "f64",
            Type::Ptr => "ptr",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<Type>,
    pub ret: Type,
}

impl Signature {
    pub fn new(params: &[Type], ret: Type) -> Self {
        Self {
            params: params.to_vec(),
            ret,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(u32);

impl FunctionId {
    pub fn index(self) -> u32 {
        self.0
    }

    pub(crate) fn from_index(index: u32) -> Self {
        FunctionId(index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(u32);

impl GlobalId {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// A function or global, the unit the address cache is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entity {
    Function(FunctionId),
    Global(GlobalId),
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Function(id) => write!(f, "function #{}", id.0),
            Entity::Global(id) => write!(f, "global #{}", id.0),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Body {
    Ready(Vec<Stmt>),
    Deferred,
}

#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub signature: Signature,
    /// `None` for an external declaration.
    pub body: Option<Body>,
}

impl FunctionDef {
    pub fn is_declaration(&self) -> bool {
        self.body.is_none()
    }

    pub fn is_materialized(&self) -> bool {
        !matches!(self.body, Some(Body::Deferred))
    }

    /// The loaded statements, if the function has a materialized body.
    pub fn statements(&self) -> Option<&[Stmt]> {
        match &self.body {
            Some(Body::Ready(stmts)) => Some(stmts),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GlobalDef {
    pub name: String,
    pub ty: Type,
    /// `None` means zero-initialized.
    pub initializer: Option<Constant>,
    pub external: bool,
}

/// Supplies deferred function bodies on materialization.
pub trait BodySource {
    fn load(&mut self, name: &str, signature: &Signature) -> std::result::Result<Vec<Stmt>, String>;
}

impl<F> BodySource for F
where
    F: FnMut(&str, &Signature) -> std::result::Result<Vec<Stmt>, String>,
{
    fn load(
        &mut self,
        name: &str,
        signature: &Signature,
    ) -> std::result::Result<Vec<Stmt>, String> {
        self(name, signature)
    }
}

/// A program: function and global definitions plus an optional body source.
///
/// Name lookup returns the most recent definition with that name; handles
/// are never reused, so removed functions leave an empty slot behind.
#[derive(Default)]
pub struct Module {
    name: String,
    functions: Vec<Option<FunctionDef>>,
    globals: Vec<GlobalDef>,
    function_names: IndexMap<String, FunctionId>,
    global_names: IndexMap<String, GlobalId>,
    source: Option<Box<dyn BodySource>>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_body_source(&mut self, source: impl BodySource + 'static) {
        self.source = Some(Box::new(source));
    }

    pub fn define_function(
        &mut self,
        name: impl Into<String>,
        signature: Signature,
        body: Vec<Stmt>,
    ) -> FunctionId {
        self.push_function(name.into(), signature, Some(Body::Ready(body)))
    }

    /// Declares a function defined outside the module; its address comes
    /// from the engine's symbol resolver.
    pub fn declare_function(
        &mut self,
        name: impl Into<String>,
        signature: Signature,
    ) -> FunctionId {
        self.push_function(name.into(), signature, None)
    }

    /// Defines a function whose body is loaded from the body source on
    /// first materialization.
    pub fn define_lazy_function(
        &mut self,
        name: impl Into<String>,
        signature: Signature,
    ) -> FunctionId {
        self.push_function(name.into(), signature, Some(Body::Deferred))
    }

    fn push_function(
        &mut self,
        name: String,
        signature: Signature,
        body: Option<Body>,
    ) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        self.function_names.insert(name.clone(), id);
        self.functions.push(Some(FunctionDef {
            name,
            signature,
            body,
        }));
        id
    }

    /// Replaces a function's body, typically ahead of a recompilation.
    pub fn replace_body(&mut self, id: FunctionId, body: Vec<Stmt>) -> Result<()> {
        let def = self.function_mut(id)?;
        def.body = Some(Body::Ready(body));
        Ok(())
    }

    /// Takes a function out of the module. Its slot stays empty and the id
    /// is never handed out again.
    pub fn remove_function(&mut self, id: FunctionId) -> Option<FunctionDef> {
        let def = self.functions.get_mut(id.0 as usize)?.take()?;
        if self.function_names.get(&def.name) == Some(&id) {
            self.function_names.shift_remove(&def.name);
        }
        Some(def)
    }

    pub fn define_global(
        &mut self,
        name: impl Into<String>,
        ty: Type,
        initializer: Option<Constant>,
    ) -> GlobalId {
        self.push_global(name.into(), ty, initializer, false)
    }

    pub fn declare_global(&mut self, name: impl Into<String>, ty: Type) -> GlobalId {
        self.push_global(name.into(), ty, None, true)
    }

    fn push_global(
        &mut self,
        name: String,
        ty: Type,
        initializer: Option<Constant>,
        external: bool,
    ) -> GlobalId {
        let id = GlobalId(self.globals.len() as u32);
        self.global_names.insert(name.clone(), id);
        self.globals.push(GlobalDef {
            name,
            ty,
            initializer,
            external,
        });
        id
    }

    pub fn function(&self, id: FunctionId) -> Result<&FunctionDef> {
        self.functions
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(JitError::UnknownFunction(id.0))
    }

    fn function_mut(&mut self, id: FunctionId) -> Result<&mut FunctionDef> {
        self.functions
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(JitError::UnknownFunction(id.0))
    }

    pub fn global(&self, id: GlobalId) -> Result<&GlobalDef> {
        self.globals
            .get(id.0 as usize)
            .ok_or(JitError::UnknownGlobal(id.0))
    }

    pub fn function_by_name(&self, name: &str) -> Option<FunctionId> {
        self.function_names.get(name).copied()
    }

    pub fn global_by_name(&self, name: &str) -> Option<GlobalId> {
        self.global_names.get(name).copied()
    }

    /// Name of a function for diagnostics; removed handles render by index.
    pub fn function_name(&self, id: FunctionId) -> String {
        match self.function(id) {
            Ok(def) => def.name.clone(),
            Err(_) => format!("#{}", id.0),
        }
    }

    /// Loads a deferred body. Already materialized functions and external
    /// declarations are left alone. On failure the body stays deferred.
    pub fn materialize(&mut self, id: FunctionId) -> Result<()> {
        let index = id.0 as usize;
        let def = self
            .functions
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or(JitError::UnknownFunction(id.0))?;

        if def.is_materialized() {
            return Ok(());
        }

        let source = self.source.as_mut().ok_or_else(|| JitError::Materialization {
            function: def.name.clone(),
            reason: "no body source attached to module".to_string(),
        })?;

        let stmts = source
            .load(&def.name, &def.signature)
            .map_err(|reason| JitError::Materialization {
                function: def.name.clone(),
                reason,
            })?;
        def.body = Some(Body::Ready(stmts));
        Ok(())
    }

    pub fn display_function(&self, id: FunctionId) -> Result<FunctionDisplay<'_>> {
        Ok(FunctionDisplay::new(self, self.function(id)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer_body() -> Vec<Stmt> {
        vec![Stmt::Return(Some(Expr::i32(42)))]
    }

    #[test]
    fn test_handles_are_identity() {
        let mut module = Module::new("m");
        let a = module.define_function("f", Signature::new(&[], Type::I32), answer_body());
        let b = module.define_function("g", Signature::new(&[], Type::I32), answer_body());
        assert_ne!(a, b);
        assert_eq!(module.function_by_name("f"), Some(a));
        assert_eq!(module.function_by_name("g"), Some(b));
    }

    #[test]
    fn test_remove_function_leaves_slot() {
        let mut module = Module::new("m");
        let a = module.define_function("f", Signature::new(&[], Type::I32), answer_body());
        let b = module.define_function("g", Signature::new(&[], Type::I32), answer_body());

        assert!(module.remove_function(a).is_some());
        assert!(matches!(module.function(a), Err(JitError::UnknownFunction(0))));
        assert_eq!(module.function_by_name("f"), None);
        assert_eq!(module.function(b).map(|d| d.name.as_str()).ok(), Some("g"));
        assert!(module.remove_function(a).is_none());

        let c = module.define_function("f", Signature::new(&[], Type::I32), answer_body());
        assert_ne!(c, a);
        assert_eq!(c.index(), 2);
    }

    #[test]
    fn test_materialize_from_source() {
        let mut module = Module::new("m");
        module.set_body_source(|name: &str, _sig: &Signature| {
            if name == "answer" {
                Ok(vec![Stmt::Return(Some(Expr::i32(42)))])
            } else {
                Err(format!("no body for {}", name))
            }
        });
        let answer = module.define_lazy_function("answer", Signature::new(&[], Type::I32));
        let broken = module.define_lazy_function("broken", Signature::new(&[], Type::I32));

        assert!(!module.function(answer).unwrap().is_materialized());
        module.materialize(answer).unwrap();
        assert_eq!(module.function(answer).unwrap().statements().map(<[_]>::len), Some(1));

        let err = module.materialize(broken).unwrap_err();
        assert!(err.to_string().contains("no body for broken"));
        assert!(!module.function(broken).unwrap().is_materialized());
    }

    #[test]
    fn test_materialize_without_source_fails() {
        let mut module = Module::new("m");
        let lazy = module.define_lazy_function("lazy", Signature::new(&[], Type::Void));
        let err = module.materialize(lazy).unwrap_err();
        assert!(matches!(err, JitError::Materialization { .. }));
    }

    #[test]
    fn test_type_layout() {
        assert_eq!(Type::Void.size(), 0);
        assert_eq!(Type::Void.align(), 1);
        assert_eq!(Type::U16.size(), 2);
        assert_eq!(Type::Ptr.size(), std::mem::size_of::<usize>());
        assert!(Type::Bool.is_integer());
        assert!(!Type::U32.is_signed());
        assert!(Type::F32.is_float());
    }
}
