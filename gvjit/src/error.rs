///
/// Engine error types.
///
/// Every condition the engine cannot recover from is surfaced as a
/// `JitError` to the embedding host. Contract violations (bad argument
/// lists, recursive compilation, conflicting cache writes) are distinct
/// from environmental failures (materialization, unresolved symbols,
/// backend construction) so a host can tell a bug from a broken input.
///

use thiserror::Error;

use crate::ir::Type;

pub type Result<T> = std::result::Result<T, JitError>;

#[derive(Debug, Error)]
pub enum JitError {
    #[error("Function '{function}' expects {expected} arguments, got {found}")]
    ArgumentCount {
        function: String,
        expected: usize,
        found: usize,
    },

    #[error("Argument {index} of '{function}' is declared {expected}, got a {found} value")]
    ArgumentType {
        function: String,
        index: usize,
        expected: Type,
        found: Type,
    },

    #[error("Unsupported type {ty} in {context}")]
    UnsupportedType { ty: Type, context: String },

    #[error("Recursive compilation detected: '{function}' requested while '{active}' is compiling")]
    RecursiveCompilation { function: String, active: String },

    #[error("Failed to materialize '{function}': {reason}")]
    Materialization { function: String, reason: String },

    #[error("Could not resolve external symbol '{name}'")]
    UnresolvedSymbol { name: String },

    #[error("Null address installed for {entity}")]
    NullAddress { entity: String },

    #[error("{entity} is already mapped; invalidate it before installing a new address")]
    DuplicateMapping { entity: String },

    #[error("Unknown function handle #{0}")]
    UnknownFunction(u32),

    #[error("Unknown global handle #{0}")]
    UnknownGlobal(u32),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Compilation of '{function}' failed: {message}")]
    Compile { function: String, message: String },

    #[error("Code patching failed: {0}")]
    Patch(String),

    #[error("Invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl JitError {
    pub fn compile(function: impl Into<String>, message: impl std::fmt::Display) -> Self {
        JitError::Compile {
            function: function.into(),
            message: message.to_string(),
        }
    }
}
