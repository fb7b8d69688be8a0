//! Compilation requests and compiled handlers

use crate::basic::BasicProgram;
use crate::context::{Claim, ExecutionContext, ResponseSink};
use crate::diagnostics::Diagnostics;
use crate::error::{Result, ScriptError};
use crate::language::ScriptLanguage;
use crate::rhai_engine::RhaiProgram;
use crate::shell::ShellProgram;
use nautilus_core::{Binding, BindingTable, ValueKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// What a handler produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    /// Route handler writing to the response sink
    #[default]
    Response,
    /// Credential validator returning a boolean
    Verdict,
    /// Claim issuer returning claims
    Claims,
}

/// Input to one compilation
#[derive(Debug, Clone)]
pub struct CompilationRequest {
    /// Source language
    pub language: ScriptLanguage,
    /// Script body
    pub source: String,
    /// Name used in logs and diagnostics
    pub name: String,
    /// Library modules registered on the host
    pub imports: Vec<String>,
    /// Library source files read at compile time
    pub references: Vec<PathBuf>,
    /// Caller-supplied typed locals
    pub locals: BindingTable,
    /// Expected result
    pub result_kind: ResultKind,
    /// Lines preceding the body in its origin document
    pub line_offset: usize,
}

impl CompilationRequest {
    /// Create a route-handler request
    pub fn new(language: ScriptLanguage, source: impl Into<String>) -> Self {
        Self {
            language,
            source: source.into(),
            name: "inline".to_string(),
            imports: Vec::new(),
            references: Vec::new(),
            locals: BindingTable::new(),
            result_kind: ResultKind::Response,
            line_offset: 0,
        }
    }

    /// Set the name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add an import
    pub fn import(mut self, module: impl Into<String>) -> Self {
        self.imports.push(module.into());
        self
    }

    /// Add imports
    pub fn imports<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.imports.extend(modules.into_iter().map(Into::into));
        self
    }

    /// Add a reference file
    pub fn reference(mut self, path: impl Into<PathBuf>) -> Self {
        self.references.push(path.into());
        self
    }

    /// Add one local with an inferred kind
    pub fn local(mut self, name: impl Into<String>, value: Value) -> Self {
        self.locals.insert(Binding::new(name, value));
        self
    }

    /// Add one local with an explicit kind
    pub fn typed_local(mut self, name: impl Into<String>, value: Value, kind: ValueKind) -> Self {
        self.locals.insert(Binding::typed(name, value, kind));
        self
    }

    /// Replace all locals
    pub fn locals(mut self, locals: BindingTable) -> Self {
        self.locals = locals;
        self
    }

    /// Set the result kind
    pub fn result_kind(mut self, kind: ResultKind) -> Self {
        self.result_kind = kind;
        self
    }

    /// Set the line offset
    pub fn line_offset(mut self, offset: usize) -> Self {
        self.line_offset = offset;
        self
    }
}

/// Result of one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutput {
    /// Route handler finished; the response is in the sink
    Completed,
    /// Validator verdict
    Verdict(bool),
    /// Issued claims
    Claims(Vec<Claim>),
}

impl HandlerOutput {
    /// Interpret a script's final value for the expected result
    pub fn from_value(kind: ResultKind, value: Value, mut claims: Vec<Claim>) -> Result<Self> {
        match kind {
            ResultKind::Response => Ok(Self::Completed),
            ResultKind::Verdict => match value {
                Value::Bool(accepted) => Ok(Self::Verdict(accepted)),
                other => Err(ScriptError::type_error(format!(
                    "validator must return a boolean, got {other}"
                ))),
            },
            ResultKind::Claims => {
                claims.extend(Claim::list_from_value(&value)?);
                Ok(Self::Claims(claims))
            }
        }
    }

    /// Verdict, treating anything else as rejection
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Verdict(true))
    }

    /// Claims, empty for other outputs
    pub fn into_claims(self) -> Vec<Claim> {
        match self {
            Self::Claims(claims) => claims,
            _ => Vec::new(),
        }
    }
}

/// Compiled body, one variant per implemented language
#[derive(Debug)]
pub(crate) enum HandlerProgram {
    Rhai(RhaiProgram),
    Basic(BasicProgram),
    Shell(ShellProgram),
}

struct HandlerInner {
    language: ScriptLanguage,
    name: String,
    result_kind: ResultKind,
    parameters: Vec<(String, ValueKind)>,
    diagnostics: Diagnostics,
    program: HandlerProgram,
}

/// Uniform invocable artifact produced by compilation
///
/// Immutable and cheap to clone; every clone shares the compiled program.
#[derive(Clone)]
pub struct CompiledHandler {
    inner: Arc<HandlerInner>,
}

impl CompiledHandler {
    pub(crate) fn new(
        language: ScriptLanguage,
        name: String,
        result_kind: ResultKind,
        parameters: Vec<(String, ValueKind)>,
        diagnostics: Diagnostics,
        program: HandlerProgram,
    ) -> Self {
        Self {
            inner: Arc::new(HandlerInner {
                language,
                name,
                result_kind,
                parameters,
                diagnostics,
                program,
            }),
        }
    }

    /// Source language
    pub fn language(&self) -> ScriptLanguage {
        self.inner.language
    }

    /// Handler name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Expected result
    pub fn result_kind(&self) -> ResultKind {
        self.inner.result_kind
    }

    /// Binding signature the handler was compiled against
    pub fn parameters(&self) -> &[(String, ValueKind)] {
        &self.inner.parameters
    }

    /// Non-fatal diagnostics kept from compilation
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.inner.diagnostics
    }

    /// Whether two handles share one compiled program
    pub fn ptr_eq(&self, other: &CompiledHandler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run the handler against one request
    pub async fn invoke(
        &self,
        ctx: &ExecutionContext,
        sink: &mut ResponseSink,
    ) -> Result<HandlerOutput> {
        let started = Instant::now();
        let inner = &*self.inner;
        let kind = inner.result_kind;

        let result = match &inner.program {
            HandlerProgram::Rhai(program) => program.run(ctx, sink, kind),
            HandlerProgram::Basic(program) => program.run(ctx, sink, kind),
            HandlerProgram::Shell(program) => program.run(ctx, sink, kind).await,
        };

        match &result {
            Ok(output) => trace!(
                handler = %inner.name,
                language = %inner.language,
                request_id = %ctx.request_id,
                ?output,
                elapsed_us = started.elapsed().as_micros() as u64,
                "Handler completed"
            ),
            Err(err) => debug!(
                handler = %inner.name,
                language = %inner.language,
                request_id = %ctx.request_id,
                error = %err,
                "Handler failed"
            ),
        }
        result
    }
}

impl fmt::Debug for CompiledHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledHandler")
            .field("language", &self.inner.language)
            .field("name", &self.inner.name)
            .field("result_kind", &self.inner.result_kind)
            .field("parameters", &self.inner.parameters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_builder() {
        let request = CompilationRequest::new(ScriptLanguage::Rhai, "true")
            .name("validator:Basic")
            .import("auth")
            .local("realm", json!("ops"))
            .typed_local("retries", json!(null), ValueKind::Int)
            .result_kind(ResultKind::Verdict)
            .line_offset(3);

        assert_eq!(request.imports, vec!["auth".to_string()]);
        assert_eq!(request.locals.len(), 2);
        assert_eq!(request.locals.get("retries").unwrap().kind, ValueKind::Int);
        assert_eq!(request.result_kind, ResultKind::Verdict);
    }

    #[test]
    fn test_output_from_value() {
        assert_eq!(
            HandlerOutput::from_value(ResultKind::Verdict, json!(true), Vec::new()).unwrap(),
            HandlerOutput::Verdict(true)
        );
        assert!(HandlerOutput::from_value(ResultKind::Verdict, json!("yes"), Vec::new()).is_err());

        let claims = HandlerOutput::from_value(
            ResultKind::Claims,
            json!({"role": "admin"}),
            vec![Claim::new("tenant", "acme")],
        )
        .unwrap()
        .into_claims();
        assert_eq!(claims, vec![Claim::new("tenant", "acme"), Claim::new("role", "admin")]);

        assert_eq!(
            HandlerOutput::from_value(ResultKind::Response, json!(1), Vec::new()).unwrap(),
            HandlerOutput::Completed
        );
    }
}
