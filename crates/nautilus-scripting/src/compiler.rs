//! Language dispatch and compiled-handler cache

use crate::basic;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::{Result, ScriptError};
use crate::handler::{CompilationRequest, CompiledHandler, HandlerProgram};
use crate::language::{LanguageFamily, ScriptLanguage};
use crate::modules::ModuleCatalog;
use crate::rhai_engine::RhaiCompiler;
use crate::shell::{SessionPoolConfig, SessionPoolManager, ShellProgram};
use dashmap::DashMap;
use nautilus_core::BindingTable;
use nautilus_state::GlobalStore;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Execution limits applied to every invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptLimits {
    /// Maximum operations per invocation
    pub max_operations: u64,
    /// Maximum nested function calls
    pub max_call_depth: usize,
    /// Maximum length of any string value
    pub max_string_size: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_operations: 100_000,
            max_call_depth: 64,
            max_string_size: 1024 * 1024,
        }
    }
}

/// Name and version reported to scripts as the owning host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    /// Host name
    pub name: String,
    /// Host version
    pub version: String,
}

impl Default for HostInfo {
    fn default() -> Self {
        Self {
            name: "nautilus".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Compiler configuration
#[derive(Debug, Clone, Default)]
pub struct CompilerOptions {
    /// Execution limits
    pub limits: ScriptLimits,
    /// Shell session pool configuration
    pub pool: SessionPoolConfig,
    /// Host identity exposed to scripts
    pub host: HostInfo,
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Number of compiled handlers in cache
    pub cached_scripts: usize,
    /// Cache hits
    pub hits: u64,
    /// Cache misses
    pub misses: u64,
}

impl CacheStats {
    /// Get cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Library source resolved from an import or reference
#[derive(Debug, Clone)]
pub(crate) struct Library {
    pub(crate) name: String,
    pub(crate) source: Arc<str>,
}

/// Back-end outcome: program plus non-fatal diagnostics, or every diagnostic
pub(crate) type BackendResult = std::result::Result<(HandlerProgram, Diagnostics), Diagnostics>;

/// Turns compilation requests into cached handlers
#[derive(Debug)]
pub struct ScriptCompiler {
    globals: GlobalStore,
    modules: ModuleCatalog,
    limits: ScriptLimits,
    rhai: RhaiCompiler,
    sessions: Arc<SessionPoolManager>,
    cache: DashMap<u64, CompiledHandler>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl ScriptCompiler {
    /// Create a compiler over the shared store and module catalog
    pub fn new(globals: GlobalStore, modules: ModuleCatalog, options: CompilerOptions) -> Self {
        let sessions = Arc::new(SessionPoolManager::new(
            options.pool,
            globals.clone(),
            modules.clone(),
            options.host,
            options.limits.clone(),
        ));
        Self {
            rhai: RhaiCompiler::new(&options.limits),
            limits: options.limits,
            globals,
            modules,
            sessions,
            cache: DashMap::new(),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    /// Shared global store
    pub fn globals(&self) -> &GlobalStore {
        &self.globals
    }

    /// Library module catalog
    pub fn modules(&self) -> &ModuleCatalog {
        &self.modules
    }

    /// Shell session pool
    pub fn session_pool(&self) -> &Arc<SessionPoolManager> {
        &self.sessions
    }

    /// Compile a request into a handler
    ///
    /// Diagnostics are logged before returning. Identical requests are served
    /// from the cache.
    pub async fn compile(&self, request: CompilationRequest) -> Result<CompiledHandler> {
        let language = request.language;
        if request.source.trim().is_empty() {
            return Err(ScriptError::InvalidSource(format!(
                "'{}' has an empty script body",
                request.name
            )));
        }
        if language.family() == LanguageFamily::Unimplemented {
            return Err(ScriptError::NotImplemented { language });
        }

        debug!(%language, script = %request.name, "Compiling handler");
        let mut library_diagnostics = Diagnostics::new();
        let libraries = self
            .resolve_libraries(&request, &mut library_diagnostics)
            .await;

        let bindings = self.globals.snapshot().to_bindings().merged(&request.locals);
        let key = cache_key(&request, &libraries, &bindings);
        if let Some(handler) = self.cache.get(&key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            trace!(script = %request.name, "Handler cache hit");
            return Ok(handler.clone());
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let outcome = if library_diagnostics.has_errors() {
            Err(Diagnostics::new())
        } else {
            match language {
                ScriptLanguage::Rhai => self.rhai.compile(&request, &libraries, &bindings),
                ScriptLanguage::Basic => {
                    basic::compile(&request, &libraries, &bindings, &self.limits)
                }
                ScriptLanguage::Shell => Ok((
                    HandlerProgram::Shell(ShellProgram::new(
                        request.source.clone(),
                        request.name.clone(),
                        libraries.clone(),
                        request.line_offset,
                        Arc::clone(&self.sessions),
                    )),
                    Diagnostics::new(),
                )),
                ScriptLanguage::Ocaml | ScriptLanguage::Python | ScriptLanguage::JavaScript => {
                    return Err(ScriptError::NotImplemented { language })
                }
            }
        };

        let (program, body_diagnostics) = match outcome {
            Ok((program, diagnostics)) => (Some(program), diagnostics),
            Err(mut diagnostics) => {
                if !diagnostics.has_errors() && !library_diagnostics.has_errors() {
                    diagnostics.push(Diagnostic::error("compilation failed"));
                }
                (None, diagnostics)
            }
        };

        let mut diagnostics = body_diagnostics.with_line_offset(request.line_offset);
        diagnostics.extend(library_diagnostics);
        let warnings = diagnostics.finish(language, &request.name)?;

        let Some(program) = program else {
            return Err(ScriptError::Compilation {
                language,
                name: request.name,
                diagnostics: warnings,
            });
        };

        let handler = CompiledHandler::new(
            language,
            request.name.clone(),
            request.result_kind,
            bindings.signature(),
            warnings,
            program,
        );
        self.cache.insert(key, handler.clone());
        info!(%language, script = %request.name, "Handler compiled");
        Ok(handler)
    }

    async fn resolve_libraries(
        &self,
        request: &CompilationRequest,
        diagnostics: &mut Diagnostics,
    ) -> Vec<Library> {
        let mut libraries = Vec::new();

        for name in &request.imports {
            match self.modules.get(request.language, name) {
                Some(source) => libraries.push(Library {
                    name: name.clone(),
                    source,
                }),
                None => diagnostics.push(Diagnostic::error(format!(
                    "imported module '{name}' is not registered for {}",
                    request.language
                ))),
            }
        }

        for path in &request.references {
            match tokio::fs::read_to_string(path).await {
                Ok(source) => libraries.push(Library {
                    name: path.display().to_string(),
                    source: source.into(),
                }),
                Err(err) => diagnostics.push(Diagnostic::error(format!(
                    "failed to read reference {}: {err}",
                    path.display()
                ))),
            }
        }

        libraries
    }

    /// Cache statistics
    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            cached_scripts: self.cache.len(),
            hits: self.cache_hits.load(Ordering::Relaxed),
            misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }

    /// Drop every cached handler; handlers already handed out keep working
    pub fn clear_cache(&self) {
        self.cache.clear();
        debug!("Handler cache cleared");
    }

    /// Close the shell session pool
    pub async fn shutdown(&self) {
        self.sessions.close().await;
    }
}

fn cache_key(request: &CompilationRequest, libraries: &[Library], bindings: &BindingTable) -> u64 {
    let mut hasher = DefaultHasher::new();
    request.language.hash(&mut hasher);
    request.name.hash(&mut hasher);
    request.source.hash(&mut hasher);
    request.result_kind.hash(&mut hasher);
    request.line_offset.hash(&mut hasher);
    request.imports.hash(&mut hasher);
    for library in libraries {
        library.name.hash(&mut hasher);
        library.source.hash(&mut hasher);
    }
    bindings.signature().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ExecutionContext, RequestData, ResponseSink};
    use crate::handler::{HandlerOutput, ResultKind};
    use serde_json::json;

    fn compiler() -> ScriptCompiler {
        ScriptCompiler::new(GlobalStore::new(), ModuleCatalog::new(), CompilerOptions::default())
    }

    #[tokio::test]
    async fn test_empty_source_rejected() {
        let err = compiler()
            .compile(CompilationRequest::new(ScriptLanguage::Rhai, "   \n"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::InvalidSource(_)));
    }

    #[tokio::test]
    async fn test_unimplemented_languages() {
        let compiler = compiler();
        for language in [ScriptLanguage::Ocaml, ScriptLanguage::Python, ScriptLanguage::JavaScript] {
            let err = compiler
                .compile(CompilationRequest::new(language, "print('hi')"))
                .await
                .unwrap_err();
            assert!(matches!(err, ScriptError::NotImplemented { language: l } if l == language));
        }
    }

    #[tokio::test]
    async fn test_valid_sources_have_no_errors() {
        let compiler = compiler();
        let sources = [
            (ScriptLanguage::Rhai, "response.status = 204;"),
            (ScriptLanguage::Basic, "Response.Status = 204"),
            (ScriptLanguage::Shell, "Set-Status 204"),
        ];
        for (language, source) in sources {
            let handler = compiler
                .compile(CompilationRequest::new(language, source).name(language.as_str()))
                .await
                .unwrap();
            assert_eq!(handler.diagnostics().error_count(), 0);
            assert_eq!(handler.language(), language);

            let ctx = ExecutionContext::new(RequestData::default());
            let mut sink = ResponseSink::new();
            assert_eq!(handler.invoke(&ctx, &mut sink).await.unwrap(), HandlerOutput::Completed);
            assert_eq!(sink.status(), 204);
        }
    }

    #[tokio::test]
    async fn test_invalid_sources_have_only_errors() {
        let compiler = compiler();
        let sources = [
            (ScriptLanguage::Rhai, "let = ;"),
            (ScriptLanguage::Basic, "Dim x As Integer = \"text\""),
        ];
        for (language, source) in sources {
            let err = compiler
                .compile(CompilationRequest::new(language, source))
                .await
                .unwrap_err();
            let diagnostics = err.diagnostics().unwrap();
            assert!(diagnostics.has_errors());
            assert!(diagnostics.iter().all(|d| d.is_error()));
        }
    }

    #[tokio::test]
    async fn test_line_offset_applied() {
        let err = compiler()
            .compile(CompilationRequest::new(ScriptLanguage::Rhai, "let x = 1;\nlet = ;").line_offset(10))
            .await
            .unwrap_err();
        let first = err.diagnostics().unwrap().errors().next().unwrap();
        assert_eq!(first.location.unwrap().line, 12);
    }

    #[tokio::test]
    async fn test_imports_and_references() {
        let modules = ModuleCatalog::new();
        modules.register(ScriptLanguage::Rhai, "text", "fn shout(s) { s.to_upper() }");
        let compiler = ScriptCompiler::new(GlobalStore::new(), modules, CompilerOptions::default());

        let dir = tempfile::tempdir().unwrap();
        let reference = dir.path().join("math.rhai");
        tokio::fs::write(&reference, "fn double(x) { x * 2 }").await.unwrap();

        let handler = compiler
            .compile(
                CompilationRequest::new(ScriptLanguage::Rhai, "response.write(shout(\"hi\") + double(21));")
                    .import("text")
                    .reference(&reference),
            )
            .await
            .unwrap();

        let mut sink = ResponseSink::new();
        handler
            .invoke(&ExecutionContext::new(RequestData::default()), &mut sink)
            .await
            .unwrap();
        match sink.body() {
            crate::context::ResponseBody::Text(text) => assert_eq!(text, "HI42"),
            other => panic!("unexpected body {other:?}"),
        }

        let err = compiler
            .compile(CompilationRequest::new(ScriptLanguage::Rhai, "1").import("missing"))
            .await
            .unwrap_err();
        assert!(err.report_text().contains("'missing' is not registered"));

        let err = compiler
            .compile(CompilationRequest::new(ScriptLanguage::Basic, "Return").reference(dir.path().join("nope.bas")))
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Compilation { .. }));
    }

    #[tokio::test]
    async fn test_globals_bound_at_compile() {
        let globals = GlobalStore::new();
        globals.define("tenant", json!("acme"), true).unwrap();
        let compiler = ScriptCompiler::new(globals.clone(), ModuleCatalog::new(), CompilerOptions::default());

        let handler = compiler
            .compile(
                CompilationRequest::new(ScriptLanguage::Rhai, "tenant == \"acme\"")
                    .result_kind(ResultKind::Verdict),
            )
            .await
            .unwrap();
        assert_eq!(handler.parameters(), &[("tenant".to_string(), nautilus_core::ValueKind::String)]);

        let ctx = ExecutionContext {
            globals: globals.snapshot(),
            ..ExecutionContext::new(RequestData::default())
        };
        let output = handler.invoke(&ctx, &mut ResponseSink::new()).await.unwrap();
        assert!(output.is_accepted());
    }

    #[tokio::test]
    async fn test_cache_hits() {
        let compiler = compiler();
        let request = CompilationRequest::new(ScriptLanguage::Rhai, "response.status = 200;").name("cached");

        let first = compiler.compile(request.clone()).await.unwrap();
        let second = compiler.compile(request).await.unwrap();
        assert!(first.ptr_eq(&second));

        let stats = compiler.cache_stats();
        assert_eq!(stats.cached_scripts, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.5);

        compiler.clear_cache();
        assert_eq!(compiler.cache_stats().cached_scripts, 0);
    }
}
