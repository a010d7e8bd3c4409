//! Configuration errors shared by the aggregate generator and the feature
//! graph. All of them are raised before any computation starts.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("duplicate definition '{name}'")]
    DuplicateName { name: String },

    #[error("'{name}': {op} takes {expected} operands, got {actual}")]
    Arity {
        name: String,
        op: String,
        expected: String,
        actual: usize,
    },

    #[error("'{name}' references '{operand}' before it is declared")]
    ForwardReference { name: String, operand: String },

    #[error("'{name}' references itself")]
    SelfReference { name: String },

    #[error("'{name}' would overwrite base series registered from '{owner}'")]
    ShadowsBase { name: String, owner: String },

    #[error("output name collision on '{name}': {first} and {second}")]
    NameCollision {
        name: String,
        first: String,
        second: String,
    },

    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("required input '{input}' of '{name}' cannot be resolved")]
    UnresolvedInput { name: String, input: String },

    #[error("invalid parameter for '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("catalog parse error: {0}")]
    Parse(String),
}
