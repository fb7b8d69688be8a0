//! # Nautilus Runtime
//!
//! The script host that ties the engine together:
//! - Route registration with validation, duplicate policy and compilation
//! - Authentication schemes, script validators and claim issuers
//! - Request dispatch: routing, body limits, auth, handler invocation
//! - Host assembly from configuration
//! - Tracing subscriber setup
//!
//! ## Example
//!
//! ```rust,no_run
//! use nautilus_runtime::prelude::*;
//! use nautilus_scripting::ScriptLanguage;
//!
//! # async fn demo() -> nautilus_runtime::Result<()> {
//! let host = ScriptHost::default();
//! host.register(RouteRegistration::new("/hello", ScriptLanguage::Rhai, "response.status = 204;"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod error;
pub mod handler;
pub mod host;
pub mod logging;

pub use error::{HostError, Result};
pub use host::{
    HostOptions, RegistrationState, RouteHandle, RouteRegistration, ScriptHost,
    DEFAULT_MAX_BODY_SIZE,
};
pub use logging::init_tracing;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{HostError, Result};
    pub use crate::host::{HostOptions, RouteHandle, RouteRegistration, ScriptHost};
    pub use crate::logging::init_tracing;
    pub use nautilus_core::DuplicatePolicy;
    pub use tokio_util::sync::CancellationToken;
}
