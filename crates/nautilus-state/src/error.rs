//! Error types for the global store

use nautilus_core::ValueKind;

/// Result type for state operations
pub type Result<T> = std::result::Result<T, StateError>;

/// Error types for state operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StateError {
    /// Entry was declared read-only
    #[error("Global '{0}' is read-only")]
    ReadOnly(String),

    /// Key not found
    #[error("Global not found: {0}")]
    NotFound(String),

    /// Value does not conform to the declared kind
    #[error("Global '{key}' is declared {expected} but got {found}")]
    TypeMismatch {
        /// Entry name
        key: String,
        /// Declared kind
        expected: ValueKind,
        /// Kind of the rejected value
        found: ValueKind,
    },

    /// Key is empty or otherwise unusable as a binding name
    #[error("Invalid global name: '{0}'")]
    InvalidKey(String),
}
