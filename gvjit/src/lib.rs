///
/// gvjit - A lazy just-in-time execution engine
///
/// Programs are held in an `ir::Module` and compiled one function at a time,
/// on first use, by an emission backend (Cranelift by default). Compiled
/// functions are called with boxed `GenericValue` arguments.
///
/// - ir: program model (types, functions, globals, bodies)
/// - value: boxed call values
/// - cache: entity -> address table and the deferred global queue
/// - backend: emission backends and the Cranelift implementation
/// - engine: compilation pipeline, invocation and recompilation
/// - symbols: external symbol resolution
/// - patch: redirecting old entry points after recompilation
/// - config: engine configuration
///
/// Entry points:
/// - `JitEngine::new` / `JitEngine::builder`: create an engine for a module
/// - `JitEngine::invoke`: call a function with boxed arguments
/// - `JitEngine::ensure_compiled`: get a function's native address
/// - `JitEngine::recompile`: rebuild a function and relink its callers
///

pub mod backend;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod ir;
pub mod patch;
pub mod symbols;
pub mod value;

pub use backend::{CraneliftBackend, EmissionBackend, GlobalArena, LazyResolver, StorageLayout};
pub use cache::{Address, AddressCache, DeferredGlobals};
pub use config::{EngineConfig, OptLevel};
pub use engine::{EmitContext, EngineBuilder, JitEngine, StubBuilder};
pub use error::{JitError, Result};
pub use ir::{Entity, FunctionId, GlobalId, Module, Signature, Type};
pub use patch::{CodePatcher, NativePatcher};
pub use symbols::{HostSymbols, SymbolResolver};
pub use value::GenericValue;
