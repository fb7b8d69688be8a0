//! # Nautilus Scripting
//!
//! Turns script source in one of several languages into a uniform
//! [`CompiledHandler`] that serves routes, validates credentials or issues
//! claims.
//!
//! ## Languages
//!
//! - **Rhai**: compiled ahead of time through the embedded Rhai engine
//! - **Basic**: statically checked, compiled to an in-repo tree program
//! - **Shell**: object-pipeline language parsed lazily and run inside
//!   pooled interpreter sessions
//!
//! OCaml, Python and JavaScript are recognized but report
//! [`ScriptError::NotImplemented`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use nautilus_scripting::prelude::*;
//! use nautilus_state::GlobalStore;
//!
//! # async fn demo() -> nautilus_scripting::Result<()> {
//! let compiler = ScriptCompiler::new(GlobalStore::new(), ModuleCatalog::new(), CompilerOptions::default());
//! let handler = compiler
//!     .compile(CompilationRequest::new(ScriptLanguage::Rhai, "response.status = 204;"))
//!     .await?;
//!
//! let ctx = ExecutionContext::new(RequestData::default());
//! let mut sink = ResponseSink::new();
//! handler.invoke(&ctx, &mut sink).await?;
//! assert_eq!(sink.status(), 204);
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

mod basic;
pub mod compiler;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod handler;
pub mod language;
pub mod modules;
mod rhai_engine;
pub mod shell;

pub use compiler::{CacheStats, CompilerOptions, HostInfo, ScriptCompiler, ScriptLimits};
pub use context::{
    BodyStream, Claim, ContextBridge, Cookie, ExecutionContext, Identity, Redirect, RequestData,
    ResponseBody, ResponseSink,
};
pub use diagnostics::{
    Diagnostic, Diagnostics, Severity, SourceLocation, StreamKind, StreamRecord, StreamReport,
};
pub use error::{Result, ScriptError};
pub use handler::{CompilationRequest, CompiledHandler, HandlerOutput, ResultKind};
pub use language::{LanguageFamily, ScriptLanguage};
pub use modules::ModuleCatalog;
pub use shell::{LifecycleState, PoolStats, SessionLease, SessionPoolConfig, SessionPoolManager};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::compiler::{CompilerOptions, ScriptCompiler, ScriptLimits};
    pub use crate::context::{
        Claim, ContextBridge, ExecutionContext, Identity, RequestData, ResponseSink,
    };
    pub use crate::diagnostics::{Diagnostic, Diagnostics, StreamReport};
    pub use crate::error::{Result, ScriptError};
    pub use crate::handler::{CompilationRequest, CompiledHandler, HandlerOutput, ResultKind};
    pub use crate::language::ScriptLanguage;
    pub use crate::modules::ModuleCatalog;
}
