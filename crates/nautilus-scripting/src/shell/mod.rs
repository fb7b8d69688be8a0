//! Dynamic object-pipeline shell language
//!
//! Shell handlers are not compiled ahead of time: the body is parsed on
//! first invocation and every invocation runs inside a pooled
//! [`ShellSession`]. Anything written to the error stream fails the
//! request with the full stream report.

mod ast;
mod commands;
mod interpreter;
mod lexer;
mod parser;
mod pool;
mod session;
mod value;

pub use pool::{PoolStats, SessionLease, SessionPoolConfig, SessionPoolManager};
pub use session::{LifecycleState, ShellSession};

use crate::compiler::Library;
use crate::context::{ExecutionContext, ResponseSink};
use crate::diagnostics::{StreamKind, StreamReport};
use crate::error::{Result, ScriptError};
use crate::handler::{HandlerOutput, ResultKind};
use ast::Script;
use interpreter::{Exec, Fault, Interpreter};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::warn;
use value::ShellValue;

#[derive(Debug)]
struct Parsed {
    script: Script,
    libraries: Vec<(String, Script)>,
}

struct Execution {
    result: Exec<Vec<ShellValue>>,
    report: StreamReport,
    claims: Vec<crate::context::Claim>,
    exceeded: bool,
}

/// Shell handler body bound to the session pool
#[derive(Debug)]
pub(crate) struct ShellProgram {
    source: String,
    name: String,
    libraries: Vec<Library>,
    line_offset: usize,
    sessions: Arc<SessionPoolManager>,
    parsed: OnceCell<Result<Arc<Parsed>>>,
}

impl ShellProgram {
    pub(crate) fn new(
        source: String,
        name: String,
        libraries: Vec<Library>,
        line_offset: usize,
        sessions: Arc<SessionPoolManager>,
    ) -> Self {
        Self {
            source,
            name,
            libraries,
            line_offset,
            sessions,
            parsed: OnceCell::new(),
        }
    }

    fn parsed(&self) -> Result<Arc<Parsed>> {
        self.parsed
            .get_or_init(|| {
                let parsed = self.parse();
                if let Err(err) = &parsed {
                    warn!(script = %self.name, error = %err, "Shell script failed to parse");
                }
                parsed
            })
            .clone()
    }

    fn parse(&self) -> Result<Arc<Parsed>> {
        let mut libraries = Vec::with_capacity(self.libraries.len());
        for library in &self.libraries {
            let script = parser::parse(&library.source).map_err(|diagnostic| {
                ScriptError::runtime(format!("in module '{}': {diagnostic}", library.name))
            })?;
            libraries.push((library.name.clone(), script));
        }

        let script = parser::parse(&self.source).map_err(|diagnostic| {
            let line = diagnostic.location.map_or(1, |loc| loc.line) + self.line_offset;
            ScriptError::runtime_at(diagnostic.message, line)
        })?;
        Ok(Arc::new(Parsed { script, libraries }))
    }

    pub(crate) async fn run(
        &self,
        ctx: &ExecutionContext,
        sink: &mut ResponseSink,
        kind: ResultKind,
    ) -> Result<HandlerOutput> {
        let parsed = self.parsed()?;
        let mut lease = self.sessions.acquire().await?;
        let Some(session) = lease.session_mut() else {
            return Err(ScriptError::SessionPool("lease holds no session".to_string()));
        };
        let execution = self.execute(session, &parsed, ctx, sink);
        if execution.exceeded {
            lease.invalidate();
        }
        drop(lease);

        let Execution {
            result,
            mut report,
            claims,
            ..
        } = execution;
        let output = match result {
            Ok(output) => output,
            Err(Fault::Error(err)) => {
                report.log(&self.name);
                return Err(err);
            }
            Err(Fault::Thrown { message, line }) => {
                report.push_at(StreamKind::Error, message, line);
                report.log(&self.name);
                return Err(ScriptError::ScriptFailure(report));
            }
        };
        report.log(&self.name);
        if report.is_failed() {
            return Err(ScriptError::ScriptFailure(report));
        }

        if kind == ResultKind::Response {
            write_output(sink, output)?;
            return Ok(HandlerOutput::Completed);
        }
        HandlerOutput::from_value(kind, ShellValue::collapse(output).to_json(), claims)
    }

    fn execute(
        &self,
        session: &ShellSession,
        parsed: &Parsed,
        ctx: &ExecutionContext,
        sink: &mut ResponseSink,
    ) -> Execution {
        let limits = self.sessions.limits();
        let mut interpreter = Interpreter::new(&session.variables, &session.functions, sink, limits);

        interpreter.define("request", ShellValue::from_json(&ctx.request.to_value()));
        let identity = ctx
            .identity
            .as_ref()
            .map_or(ShellValue::Null, |identity| ShellValue::from_json(&identity.to_value()));
        interpreter.define("identity", identity);
        for binding in &ctx.bindings() {
            interpreter.define(&binding.name, ShellValue::from_json(&binding.value));
        }

        let result = run_script(&mut interpreter, session, parsed);
        Execution {
            result,
            exceeded: interpreter.limit_exceeded(),
            report: std::mem::take(&mut interpreter.report),
            claims: std::mem::take(&mut interpreter.claims),
        }
    }
}

fn run_script(
    interpreter: &mut Interpreter<'_>,
    session: &ShellSession,
    parsed: &Parsed,
) -> Exec<Vec<ShellValue>> {
    for (name, library) in &parsed.libraries {
        if !session.has_module(name) {
            interpreter.run(&library.body)?;
        }
    }
    interpreter.bind_script_params(&parsed.script.params)?;
    interpreter.run(&parsed.script.body)
}

/// Success output becomes the body when the script set none
fn write_output(sink: &mut ResponseSink, output: Vec<ShellValue>) -> Result<()> {
    if output.is_empty() || sink.has_body() || sink.redirect_target().is_some() {
        return Ok(());
    }
    if output.iter().all(|item| matches!(item, ShellValue::Str(_))) {
        let text = output
            .iter()
            .map(ShellValue::to_text)
            .collect::<Vec<_>>()
            .join("\n");
        if sink.content_type().is_none() {
            sink.set_content_type("text/plain");
        }
        sink.set_text(text);
        return Ok(());
    }

    let value = ShellValue::collapse(output).to_json();
    if sink.content_type().is_some() {
        let text = serde_json::to_string(&value)
            .map_err(|err| ScriptError::type_error(format!("output is not serializable: {err}")))?;
        sink.set_text(text);
        Ok(())
    } else {
        sink.set_json(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{HostInfo, ScriptLimits};
    use crate::context::{Claim, Identity, RequestData, ResponseBody};
    use crate::language::ScriptLanguage;
    use crate::modules::ModuleCatalog;
    use nautilus_state::GlobalStore;
    use serde_json::json;

    fn sessions_with(modules: ModuleCatalog, limits: ScriptLimits) -> Arc<SessionPoolManager> {
        Arc::new(SessionPoolManager::new(
            SessionPoolConfig {
                max_sessions: Some(1),
                ..SessionPoolConfig::default()
            },
            GlobalStore::new(),
            modules,
            HostInfo::default(),
            limits,
        ))
    }

    fn program(source: &str, sessions: &Arc<SessionPoolManager>) -> ShellProgram {
        ShellProgram::new(source.to_string(), "test".to_string(), Vec::new(), 0, Arc::clone(sessions))
    }

    fn text_body(sink: &ResponseSink) -> &str {
        match sink.body() {
            ResponseBody::Text(text) => text,
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_output_becomes_body() {
        let sessions = sessions_with(ModuleCatalog::new(), ScriptLimits::default());
        let ctx = ExecutionContext::new(RequestData {
            method: "GET".to_string(),
            query: vec![("name".to_string(), "ann".to_string())],
            ..RequestData::default()
        });

        let mut sink = ResponseSink::new();
        let output = program("\"Hello, $($Request.query.name)\"\n'bye'", &sessions)
            .run(&ctx, &mut sink, ResultKind::Response)
            .await
            .unwrap();
        assert_eq!(output, HandlerOutput::Completed);
        assert_eq!(text_body(&sink), "Hello, ann\nbye");
        assert_eq!(sink.content_type(), Some("text/plain"));

        let mut sink = ResponseSink::new();
        program("@{ method = $Request.method; ok = $true }", &sessions)
            .run(&ctx, &mut sink, ResultKind::Response)
            .await
            .unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(text_body(&sink)).unwrap(),
            json!({"method": "GET", "ok": true})
        );
        assert_eq!(sink.content_type(), Some("application/json"));
    }

    #[tokio::test]
    async fn test_error_stream_fails_request() {
        let sessions = sessions_with(ModuleCatalog::new(), ScriptLimits::default());
        let ctx = ExecutionContext::new(RequestData::default());

        let err = program("Write-Warning 'first'\nWrite-Error 'database unavailable'", &sessions)
            .run(&ctx, &mut ResponseSink::new(), ResultKind::Response)
            .await
            .unwrap_err();
        let ScriptError::ScriptFailure(report) = err else {
            panic!("unexpected error {err:?}");
        };
        assert_eq!(report.records().len(), 2);
        assert!(report.format().contains("ERROR: database unavailable (line 2)"));

        let err = program("\n\nthrow 'stop here'", &sessions)
            .run(&ctx, &mut ResponseSink::new(), ResultKind::Response)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("stop here (line 3)"));

        let err = program("$x = 1 +", &sessions)
            .run(&ctx, &mut ResponseSink::new(), ResultKind::Response)
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Runtime { line: Some(1), .. }));
    }

    #[tokio::test]
    async fn test_invocations_do_not_leak_state() {
        let sessions = sessions_with(ModuleCatalog::new(), ScriptLimits::default());
        let handler = program(
            "if ($seen) { Set-Status 409 } else { Set-Status 200 }\n$seen = $true\nfunction Leak { 1 }",
            &sessions,
        );
        let ctx = ExecutionContext::new(RequestData::default());
        for _ in 0..2 {
            let mut sink = ResponseSink::new();
            handler.run(&ctx, &mut sink, ResultKind::Response).await.unwrap();
            assert_eq!(sink.status(), 200);
        }

        let mut sink = ResponseSink::new();
        let err = program("Leak", &sessions)
            .run(&ctx, &mut sink, ResultKind::Response)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("'Leak'"));
        assert_eq!(sessions.stats().created, 1);
    }

    #[tokio::test]
    async fn test_modules_and_references() {
        let modules = ModuleCatalog::new();
        modules.register(ScriptLanguage::Shell, "answers", "function Get-Answer { 42 }");
        let sessions = sessions_with(modules, ScriptLimits::default());

        let handler = ShellProgram::new(
            "Get-Answer\nDouble-It 4".to_string(),
            "modules".to_string(),
            vec![Library {
                name: "math.ps1".to_string(),
                source: Arc::from("function Double-It($n) { $n * 2 }"),
            }],
            0,
            Arc::clone(&sessions),
        );
        let mut sink = ResponseSink::new();
        handler
            .run(&ExecutionContext::new(RequestData::default()), &mut sink, ResultKind::Response)
            .await
            .unwrap();
        assert_eq!(text_body(&sink), "[42,8]");
    }

    #[tokio::test]
    async fn test_validators_and_claim_issuers() {
        let sessions = sessions_with(ModuleCatalog::new(), ScriptLimits::default());
        let ctx = ExecutionContext::new(RequestData::default())
            .with_identity(Identity::authenticated("ann", "Basic"))
            .with_local("password", json!("s3cret"));

        let verdict = program("$Identity.name -eq 'ann' -and $password -eq 's3cret'", &sessions)
            .run(&ctx, &mut ResponseSink::new(), ResultKind::Verdict)
            .await
            .unwrap();
        assert_eq!(verdict, HandlerOutput::Verdict(true));

        let claims = program("Add-Claim role admin\n@{ tenant = 'acme' }", &sessions)
            .run(&ctx, &mut ResponseSink::new(), ResultKind::Claims)
            .await
            .unwrap()
            .into_claims();
        assert_eq!(claims, vec![Claim::new("role", "admin"), Claim::new("tenant", "acme")]);
    }

    #[tokio::test]
    async fn test_limit_breaks_session() {
        let limits = ScriptLimits {
            max_operations: 500,
            ..ScriptLimits::default()
        };
        let sessions = sessions_with(ModuleCatalog::new(), limits);
        let ctx = ExecutionContext::new(RequestData::default());

        let err = program("while ($true) { }", &sessions)
            .run(&ctx, &mut ResponseSink::new(), ResultKind::Response)
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Runtime { .. }));
        assert_eq!(sessions.state(), LifecycleState::Broken);

        let mut sink = ResponseSink::new();
        program("Set-Status 204", &sessions)
            .run(&ctx, &mut sink, ResultKind::Response)
            .await
            .unwrap();
        assert_eq!(sink.status(), 204);
        assert_eq!(sessions.stats().rebuilds, 1);
    }
}
