//! Host error type

use http::StatusCode;
use nautilus_scripting::ScriptError;
use nautilus_state::StateError;
use thiserror::Error;

/// Result type for host operations
pub type Result<T, E = HostError> = std::result::Result<T, E>;

/// Errors raised while assembling or configuring a host
#[derive(Error, Debug)]
pub enum HostError {
    /// Routing, validation or registration error
    #[error(transparent)]
    Core(#[from] nautilus_core::Error),

    /// Script compilation or execution error
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// Global store error
    #[error(transparent)]
    State(#[from] StateError),

    /// Reading a script file failed
    #[error("Failed to read {path}: {source}")]
    Io {
        /// File being read
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl HostError {
    /// Status code a caller would see for this error
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            HostError::Core(err) => err.to_status_code(),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error was raised by a duplicate registration
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            HostError::Core(
                nautilus_core::Error::DuplicateRoute { .. }
                    | nautilus_core::Error::DuplicateScheme(_)
            )
        )
    }
}
