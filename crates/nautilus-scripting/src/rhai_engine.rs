//! Rhai back-end
//!
//! Programs are compiled once with strict variables against the typed binding
//! table, so a misspelled global fails registration instead of a request.

use crate::compiler::{BackendResult, Library, ScriptLimits};
use crate::context::{Claim, Cookie, ExecutionContext, ResponseSink};
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::{Result, ScriptError};
use crate::handler::{CompilationRequest, HandlerOutput, HandlerProgram, ResultKind};
use nautilus_core::BindingTable;
use rhai::{Dynamic, Engine, EvalAltResult, ParseError, Position, Scope, AST};
use serde_json::Value;
use std::cell::RefCell;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Names every Rhai handler sees regardless of bindings
const INTRINSICS: [&str; 4] = ["request", "response", "identity", "claims"];

/// Response object exposed to scripts as `response`
#[derive(Debug, Clone, Default)]
struct RhaiResponse {
    status: i64,
    content_type: Option<String>,
    body: Option<String>,
    json: Option<Value>,
    file: Option<String>,
    headers: Vec<(String, String, bool)>,
    cookies: Vec<Cookie>,
    redirect: Option<(String, bool)>,
}

impl RhaiResponse {
    fn new(status: u16) -> Self {
        Self {
            status: i64::from(status),
            ..Default::default()
        }
    }

    fn write(&mut self, text: &str) {
        self.json = None;
        self.body.get_or_insert_with(String::new).push_str(text);
    }

    /// Copy everything the script set onto the sink
    fn apply_to(self, sink: &mut ResponseSink) -> Result<()> {
        let status = u16::try_from(self.status)
            .map_err(|_| ScriptError::type_error(format!("invalid status code {}", self.status)))?;
        sink.set_status(status);
        for (name, value, append) in self.headers {
            if append {
                sink.append_header(name, value);
            } else {
                sink.set_header(name, value);
            }
        }
        for cookie in self.cookies {
            sink.add_cookie(cookie);
        }
        if let Some(json) = &self.json {
            sink.set_json(json)?;
        } else if let Some(body) = self.body {
            sink.set_text(body);
        } else if let Some(path) = self.file {
            sink.set_file(path);
        }
        if let Some(content_type) = self.content_type {
            sink.set_content_type(content_type);
        }
        if let Some((location, permanent)) = self.redirect {
            sink.redirect(location, permanent);
        }
        Ok(())
    }
}

/// Handle exposed as `claims`; entries land in `PENDING_CLAIMS`
#[derive(Debug, Clone, Copy, Default)]
struct ClaimSet;

thread_local! {
    /// Claims added by the evaluation running on this thread
    static PENDING_CLAIMS: RefCell<Vec<Claim>> = RefCell::new(Vec::new());
}

fn push_claim(kind: &str, value: &Dynamic) {
    PENDING_CLAIMS.with(|pending| pending.borrow_mut().push(Claim::new(kind, value.to_string())));
}

fn take_pending_claims() -> Vec<Claim> {
    PENDING_CLAIMS.with(|pending| std::mem::take(&mut *pending.borrow_mut()))
}

/// Compiles Rhai sources into handler programs
#[derive(Debug, Clone)]
pub(crate) struct RhaiCompiler {
    engine: Arc<Engine>,
}

impl RhaiCompiler {
    /// Create a compiler with execution limits
    pub(crate) fn new(limits: &ScriptLimits) -> Self {
        let mut engine = Engine::new();

        engine.set_strict_variables(true);
        engine.set_max_expr_depths(64, 32);
        engine.set_max_operations(limits.max_operations);
        engine.set_max_call_levels(limits.max_call_depth);
        engine.set_max_string_size(limits.max_string_size);
        engine.set_max_array_size(10_000);
        engine.set_max_map_size(10_000);

        Self::register_functions(&mut engine);
        Self::register_types(&mut engine);

        Self {
            engine: Arc::new(engine),
        }
    }

    fn register_functions(engine: &mut Engine) {
        engine.register_fn("parse_json", |s: &str| -> std::result::Result<Dynamic, Box<EvalAltResult>> {
            let value: Value = serde_json::from_str(s).map_err(|e| e.to_string())?;
            rhai::serde::to_dynamic(value)
        });

        engine.register_fn("to_json", |value: Dynamic| -> std::result::Result<String, Box<EvalAltResult>> {
            let value: Value = rhai::serde::from_dynamic(&value)?;
            Ok(serde_json::to_string(&value).map_err(|e| e.to_string())?)
        });

        engine.register_fn("base64_encode", |s: &str| -> String {
            use base64::{engine::general_purpose, Engine as _};
            general_purpose::STANDARD.encode(s.as_bytes())
        });

        engine.register_fn("base64_decode", |s: &str| -> String {
            use base64::{engine::general_purpose, Engine as _};
            general_purpose::STANDARD
                .decode(s.as_bytes())
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .unwrap_or_default()
        });

        engine.register_fn("unix_time", || -> i64 {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or_default()
        });

        engine.register_fn("uuid", || -> String { uuid::Uuid::new_v4().to_string() });

        engine.register_fn("add_claim", |kind: &str, value: Dynamic| push_claim(kind, &value));

        engine.register_fn("log_debug", |msg: &str| {
            debug!(script_log = msg);
        });

        engine.register_fn("log_info", |msg: &str| {
            info!(script_log = msg);
        });

        engine.register_fn("log_warn", |msg: &str| {
            warn!(script_log = msg);
        });

        engine.register_fn("has_claim", |identity: rhai::Map, kind: &str, value: &str| -> bool {
            identity
                .get("claims")
                .and_then(|claims| claims.clone().try_cast::<rhai::Array>())
                .map(|claims| {
                    claims.into_iter().any(|claim| {
                        let Some(claim) = claim.try_cast::<rhai::Map>() else {
                            return false;
                        };
                        let field = |name: &str| {
                            claim
                                .get(name)
                                .map(|v| v.to_string())
                                .unwrap_or_default()
                        };
                        field("kind").eq_ignore_ascii_case(kind)
                            && (value == "*" || field("value") == value)
                    })
                })
                .unwrap_or(false)
        });
    }

    fn register_types(engine: &mut Engine) {
        engine
            .register_type_with_name::<RhaiResponse>("Response")
            .register_get_set(
                "status",
                |r: &mut RhaiResponse| r.status,
                |r: &mut RhaiResponse, status: i64| r.status = status,
            )
            .register_get_set(
                "content_type",
                |r: &mut RhaiResponse| r.content_type.clone().unwrap_or_default(),
                |r: &mut RhaiResponse, ct: String| r.content_type = Some(ct),
            )
            .register_get_set(
                "body",
                |r: &mut RhaiResponse| r.body.clone().unwrap_or_default(),
                |r: &mut RhaiResponse, body: String| {
                    r.json = None;
                    r.body = Some(body);
                },
            )
            .register_fn("write", |r: &mut RhaiResponse, value: Dynamic| {
                r.write(&value.to_string())
            })
            .register_fn("set_header", |r: &mut RhaiResponse, name: &str, value: &str| {
                r.headers.push((name.to_string(), value.to_string(), false))
            })
            .register_fn("append_header", |r: &mut RhaiResponse, name: &str, value: &str| {
                r.headers.push((name.to_string(), value.to_string(), true))
            })
            .register_fn("set_cookie", |r: &mut RhaiResponse, name: &str, value: &str| {
                r.cookies.push(Cookie::new(name, value))
            })
            .register_fn("redirect", |r: &mut RhaiResponse, url: &str| {
                r.redirect = Some((url.to_string(), false))
            })
            .register_fn("redirect_permanent", |r: &mut RhaiResponse, url: &str| {
                r.redirect = Some((url.to_string(), true))
            })
            .register_fn(
                "json",
                |r: &mut RhaiResponse, value: Dynamic| -> std::result::Result<(), Box<EvalAltResult>> {
                    r.json = Some(rhai::serde::from_dynamic(&value)?);
                    r.body = None;
                    Ok(())
                },
            )
            .register_fn("file", |r: &mut RhaiResponse, path: &str| {
                r.file = Some(path.to_string())
            });

        engine
            .register_type_with_name::<ClaimSet>("Claims")
            .register_fn("add", |_: &mut ClaimSet, kind: &str, value: Dynamic| {
                push_claim(kind, &value)
            })
            .register_get("len", |_: &mut ClaimSet| {
                PENDING_CLAIMS.with(|pending| pending.borrow().len() as i64)
            });
    }

    /// Compile a request against a binding table
    pub(crate) fn compile(
        &self,
        request: &CompilationRequest,
        libraries: &[Library],
        bindings: &BindingTable,
    ) -> BackendResult {
        let mut diagnostics = Diagnostics::new();
        let mut scope = Scope::new();

        for name in INTRINSICS {
            scope.push_dynamic(name, Dynamic::UNIT);
        }
        let mut parameters = Vec::new();
        for binding in bindings {
            if INTRINSICS.contains(&binding.name.as_str()) {
                diagnostics.push(Diagnostic::warning(format!(
                    "binding '{}' is shadowed by the built-in object of the same name",
                    binding.name
                )));
                continue;
            }
            // Non-constant at compile time so values are not folded into the AST
            scope.push_dynamic(binding.name.clone(), Dynamic::UNIT);
            parameters.push(binding.name.clone());
        }

        let mut ast = AST::empty();
        for library in libraries {
            match self.engine.compile(library.source.as_ref()) {
                Ok(lib_ast) => ast = ast.merge(&lib_ast.clone_functions_only()),
                Err(err) => diagnostics.push(Diagnostic::error(format!(
                    "in module '{}': {}",
                    library.name,
                    describe_parse_error(&err)
                ))),
            }
        }

        match self.engine.compile_with_scope(&scope, &request.source) {
            Ok(main) => ast = ast.merge(&main),
            Err(err) => diagnostics.push(parse_diagnostic(&err)),
        }

        if diagnostics.has_errors() {
            return Err(diagnostics);
        }

        trace!(script = %request.name, functions = ast.iter_functions().count(), "Rhai AST compiled");
        let program = RhaiProgram {
            engine: Arc::clone(&self.engine),
            ast: Arc::new(ast),
            parameters,
        };
        Ok((HandlerProgram::Rhai(program), diagnostics))
    }
}

fn describe_parse_error(err: &ParseError) -> String {
    match position_of(err.1) {
        Some((line, column)) => format!("{} ({line}:{column})", err.0),
        None => err.0.to_string(),
    }
}

fn parse_diagnostic(err: &ParseError) -> Diagnostic {
    let diagnostic = Diagnostic::error(err.0.to_string());
    match position_of(err.1) {
        Some((line, column)) => diagnostic.at(line, column),
        None => diagnostic,
    }
}

fn position_of(pos: Position) -> Option<(usize, usize)> {
    pos.line().map(|line| (line, pos.position().unwrap_or(1)))
}

impl From<Box<EvalAltResult>> for ScriptError {
    fn from(err: Box<EvalAltResult>) -> Self {
        ScriptError::Runtime {
            message: err.to_string(),
            line: err.position().line(),
        }
    }
}

/// Compiled Rhai handler body
#[derive(Debug)]
pub(crate) struct RhaiProgram {
    engine: Arc<Engine>,
    ast: Arc<AST>,
    parameters: Vec<String>,
}

impl RhaiProgram {
    pub(crate) fn run(
        &self,
        ctx: &ExecutionContext,
        sink: &mut ResponseSink,
        kind: ResultKind,
    ) -> Result<HandlerOutput> {
        let mut scope = Scope::new();

        let bindings = ctx.bindings();
        for name in &self.parameters {
            let value = match bindings.get(name) {
                Some(binding) => rhai::serde::to_dynamic(&binding.value)?,
                None => {
                    debug!(binding = %name, "Binding missing at invocation; using ()");
                    Dynamic::UNIT
                }
            };
            scope.push_constant_dynamic(name.clone(), value);
        }

        scope.push_constant_dynamic("request", rhai::serde::to_dynamic(ctx.request.to_value())?);
        let identity = match &ctx.identity {
            Some(identity) => rhai::serde::to_dynamic(identity.to_value())?,
            None => Dynamic::UNIT,
        };
        scope.push_constant_dynamic("identity", identity);
        scope.push("response", RhaiResponse::new(sink.status()));
        scope.push("claims", ClaimSet);

        // Evaluation never yields, so the thread-local collector belongs to this call
        take_pending_claims();
        let evaluated = self.engine.eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast);
        let claims = take_pending_claims();
        let result = evaluated?;

        if let Some(response) = scope.get_value::<RhaiResponse>("response") {
            response.apply_to(sink)?;
        }

        let value: Value = if result.is_unit() {
            Value::Null
        } else {
            rhai::serde::from_dynamic(&result)?
        };
        HandlerOutput::from_value(kind, value, claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Identity, RequestData};
    use nautilus_core::Binding;
    use serde_json::json;

    fn compile(source: &str, bindings: &BindingTable, kind: ResultKind) -> BackendResult {
        let compiler = RhaiCompiler::new(&ScriptLimits::default());
        let request = CompilationRequest::new(crate::ScriptLanguage::Rhai, source)
            .name("test")
            .result_kind(kind);
        compiler.compile(&request, &[], bindings)
    }

    fn compiled(source: &str, bindings: &BindingTable, kind: ResultKind) -> RhaiProgram {
        match compile(source, bindings, kind) {
            Ok((HandlerProgram::Rhai(program), _)) => program,
            Ok(_) => panic!("unexpected program variant"),
            Err(diagnostics) => panic!("compile failed: {diagnostics:?}"),
        }
    }

    fn context() -> ExecutionContext {
        let request = RequestData {
            method: "GET".to_string(),
            path: "/hello".to_string(),
            uri: "/hello?name=ann".to_string(),
            query: vec![("name".to_string(), "ann".to_string())],
            ..Default::default()
        };
        ExecutionContext::new(request)
    }

    #[test]
    fn test_status_only() {
        let program = compiled("response.status = 204;", &BindingTable::new(), ResultKind::Response);
        let mut sink = ResponseSink::new();
        let output = program.run(&context(), &mut sink, ResultKind::Response).unwrap();
        assert_eq!(output, HandlerOutput::Completed);
        assert_eq!(sink.status(), 204);
        assert!(!sink.has_body());
    }

    #[test]
    fn test_request_and_bindings() {
        let bindings = BindingTable::from_values([("greeting", json!("Hello"))]);
        let program = compiled(
            r#"
                response.content_type = "text/html";
                response.set_header("X-Handler", "rhai");
                response.write(greeting + ", " + request.query.name);
            "#,
            &bindings,
            ResultKind::Response,
        );

        let ctx = context().with_local("greeting", json!("Hi"));
        let mut sink = ResponseSink::new();
        program.run(&ctx, &mut sink, ResultKind::Response).unwrap();

        assert_eq!(sink.header("x-handler"), Some("rhai"));
        assert_eq!(sink.content_type(), Some("text/html"));
        match sink.body() {
            crate::context::ResponseBody::Text(text) => assert_eq!(text, "Hi, ann"),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_unknown_variable_fails_compile() {
        let diagnostics = compile("response.write(missing_name);", &BindingTable::new(), ResultKind::Response)
            .unwrap_err();
        assert_eq!(diagnostics.error_count(), 1);
        let error = diagnostics.errors().next().unwrap();
        assert!(error.message.contains("missing_name"));
        assert_eq!(error.location.unwrap().line, 1);
    }

    #[test]
    fn test_syntax_error_location() {
        let diagnostics = compile("let x = 1;\nlet y = ;", &BindingTable::new(), ResultKind::Response)
            .unwrap_err();
        assert!(diagnostics.errors().all(|d| d.location.map(|l| l.line) == Some(2)));
    }

    #[test]
    fn test_reserved_binding_warns() {
        let bindings = BindingTable::from_values([("request", json!(1))]);
        let (_, diagnostics) = compile("1", &bindings, ResultKind::Response).unwrap();
        assert_eq!(diagnostics.warnings().count(), 1);
    }

    #[test]
    fn test_verdict() {
        let mut bindings = BindingTable::new();
        bindings.insert(Binding::new("username", json!("")));
        bindings.insert(Binding::new("password", json!("")));
        let program = compiled(
            r#"username == "admin" && password == "s3cret""#,
            &bindings,
            ResultKind::Verdict,
        );

        let ok = context()
            .with_local("username", json!("admin"))
            .with_local("password", json!("s3cret"));
        let bad = context()
            .with_local("username", json!("admin"))
            .with_local("password", json!("nope"));

        let mut sink = ResponseSink::new();
        assert!(program.run(&ok, &mut sink, ResultKind::Verdict).unwrap().is_accepted());
        assert!(!program.run(&bad, &mut sink, ResultKind::Verdict).unwrap().is_accepted());
    }

    #[test]
    fn test_verdict_requires_bool() {
        let program = compiled("42", &BindingTable::new(), ResultKind::Verdict);
        let err = program
            .run(&context(), &mut ResponseSink::new(), ResultKind::Verdict)
            .unwrap_err();
        assert!(matches!(err, ScriptError::TypeError(_)));
    }

    #[test]
    fn test_claims() {
        let program = compiled(
            r#"
                claims.add("tenant", "acme");
                if identity.has_claim("role", "*") { claims.add("elevated", true); }
                #{ role: ["reader"] }
            "#,
            &BindingTable::new(),
            ResultKind::Claims,
        );
        let ctx = context().with_identity(
            Identity::authenticated("ann", "Basic").with_claims([Claim::new("role", "ops")]),
        );
        let claims = program
            .run(&ctx, &mut ResponseSink::new(), ResultKind::Claims)
            .unwrap()
            .into_claims();
        assert_eq!(
            claims,
            vec![
                Claim::new("tenant", "acme"),
                Claim::new("elevated", "true"),
                Claim::new("role", "reader"),
            ]
        );
    }

    #[test]
    fn test_add_claim_helper() {
        let program = compiled(
            r#"
                add_claim("role", "admin");
                claims.add("tenant", "acme");
                add_claim("level", 3);
                if claims.len != 3 { throw "claims were lost"; }
            "#,
            &BindingTable::new(),
            ResultKind::Claims,
        );
        let claims = program
            .run(&context(), &mut ResponseSink::new(), ResultKind::Claims)
            .unwrap()
            .into_claims();
        assert_eq!(
            claims,
            vec![
                Claim::new("role", "admin"),
                Claim::new("tenant", "acme"),
                Claim::new("level", "3"),
            ]
        );

        // A failed run leaves nothing behind for the next one
        let failing = compiled(r#"add_claim("role", "admin"); throw "denied";"#, &BindingTable::new(), ResultKind::Claims);
        assert!(failing
            .run(&context(), &mut ResponseSink::new(), ResultKind::Claims)
            .is_err());
        let empty = compiled("()", &BindingTable::new(), ResultKind::Claims);
        let claims = empty
            .run(&context(), &mut ResponseSink::new(), ResultKind::Claims)
            .unwrap()
            .into_claims();
        assert!(claims.is_empty());
    }

    #[test]
    fn test_runtime_error_and_limits() {
        let program = compiled("let x = 1; throw \"bad input\";", &BindingTable::new(), ResultKind::Response);
        let err = program
            .run(&context(), &mut ResponseSink::new(), ResultKind::Response)
            .unwrap_err();
        assert!(matches!(err, ScriptError::Runtime { line: Some(1), .. }));

        let program = compiled("loop { }", &BindingTable::new(), ResultKind::Response);
        let err = program
            .run(&context(), &mut ResponseSink::new(), ResultKind::Response)
            .unwrap_err();
        assert!(matches!(err, ScriptError::Runtime { .. }));
    }

    #[test]
    fn test_globals_are_read_only() {
        let bindings = BindingTable::from_values([("limit", json!(3))]);
        let program = compiled("limit = 4;", &bindings, ResultKind::Response);
        let ctx = context().with_local("limit", json!(3));
        assert!(program
            .run(&ctx, &mut ResponseSink::new(), ResultKind::Response)
            .is_err());
    }

    #[test]
    fn test_json_helpers() {
        let program = compiled(
            r#"
                let data = parse_json(request.body);
                data.count += 1;
                response.json(data);
            "#,
            &BindingTable::new(),
            ResultKind::Response,
        );
        let mut request = RequestData::default();
        request.body = bytes::Bytes::from(r#"{"count": 1}"#);
        let mut sink = ResponseSink::new();
        program
            .run(&ExecutionContext::new(request), &mut sink, ResultKind::Response)
            .unwrap();
        assert_eq!(sink.content_type(), Some("application/json"));
        match sink.body() {
            crate::context::ResponseBody::Text(text) => assert_eq!(text, r#"{"count":2}"#),
            other => panic!("unexpected body {other:?}"),
        }
    }
}
