//! Strict BASIC back-end
//!
//! A VB-style dialect with case-insensitive keywords and names, typed `Dim`
//! declarations, `Function`/`Sub` definitions and the `Request`, `Response`
//! and `Identity` host objects. Programs are parsed and type-checked when the
//! handler is registered; invocations only interpret the checked tree.

mod ast;
mod builtins;
mod checker;
mod interpreter;
mod lexer;
mod parser;

use crate::compiler::{BackendResult, Library, ScriptLimits};
use crate::context::{ExecutionContext, ResponseSink};
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::Result;
use crate::handler::{CompilationRequest, HandlerOutput, HandlerProgram, ResultKind};
use ast::{Function, Program, Stmt, Type};
use builtins::Intrinsic;
use interpreter::{Interpreter, Value};
use lexer::{Lexer, Token};
use nautilus_core::BindingTable;
use std::collections::HashMap;
use tracing::{debug, trace};

fn parse_source(source: &str) -> (Option<Program>, Diagnostics) {
    match Lexer::new(source).tokenize() {
        Ok(tokens) => {
            let (program, diagnostics) = parser::parse(tokens);
            (Some(program), diagnostics)
        }
        Err(diagnostic) => (None, std::iter::once(diagnostic).collect()),
    }
}

/// Whether a binding name can be referenced from BASIC source
fn is_identifier(name: &str) -> bool {
    match Lexer::new(name).tokenize() {
        Ok(tokens) => matches!(
            tokens.as_slice(),
            [first, _] if first.token == Token::Ident(name.to_string())
        ),
        Err(_) => false,
    }
}

/// Compile a BASIC request against a binding table
pub(crate) fn compile(
    request: &CompilationRequest,
    libraries: &[Library],
    bindings: &BindingTable,
    limits: &ScriptLimits,
) -> BackendResult {
    let mut diagnostics = Diagnostics::new();

    let mut parsed_libraries = Vec::new();
    for library in libraries {
        let (program, library_diagnostics) = parse_source(&library.source);
        let failed = library_diagnostics.has_errors();
        for diagnostic in &library_diagnostics {
            let message = match diagnostic.location {
                Some(loc) => format!(
                    "in module '{}': {} ({}:{})",
                    library.name, diagnostic.message, loc.line, loc.column
                ),
                None => format!("in module '{}': {}", library.name, diagnostic.message),
            };
            diagnostics.push(Diagnostic {
                message,
                location: None,
                ..diagnostic.clone()
            });
        }
        if let (Some(program), false) = (program, failed) {
            parsed_libraries.push((library.name.clone(), program));
        }
    }

    let (program, body_diagnostics) = parse_source(&request.source);
    diagnostics.extend(body_diagnostics);
    let Some(program) = program else {
        return Err(diagnostics);
    };
    if diagnostics.has_errors() {
        return Err(diagnostics);
    }

    let mut binding_types = HashMap::new();
    let mut parameters = Vec::new();
    for binding in bindings {
        if Intrinsic::lookup(&binding.name).is_some() {
            diagnostics.push(Diagnostic::warning(format!(
                "binding '{}' is shadowed by the built-in object of the same name",
                binding.name
            )));
            continue;
        }
        if !is_identifier(&binding.name) {
            diagnostics.push(Diagnostic::warning(format!(
                "binding '{}' is not a valid identifier and cannot be referenced",
                binding.name
            )));
            continue;
        }
        binding_types.insert(binding.name.to_ascii_lowercase(), Type::from_kind(binding.kind));
        parameters.push(binding.name.clone());
    }

    diagnostics.extend(checker::check(
        &program,
        &parsed_libraries,
        &binding_types,
        request.result_kind,
    ));
    if diagnostics.has_errors() {
        return Err(diagnostics);
    }

    let mut functions = HashMap::new();
    for function in parsed_libraries
        .into_iter()
        .flat_map(|(_, library)| library.functions)
        .chain(program.functions)
    {
        functions.insert(function.name.to_ascii_lowercase(), function);
    }

    trace!(script = %request.name, functions = functions.len(), "BASIC program checked");
    let program = BasicProgram {
        functions,
        body: program.body,
        parameters,
        limits: limits.clone(),
    };
    Ok((HandlerProgram::Basic(program), diagnostics))
}

/// Checked BASIC handler body
#[derive(Debug)]
pub(crate) struct BasicProgram {
    functions: HashMap<String, Function>,
    body: Vec<Stmt>,
    parameters: Vec<String>,
    limits: ScriptLimits,
}

impl BasicProgram {
    pub(crate) fn run(
        &self,
        ctx: &ExecutionContext,
        sink: &mut ResponseSink,
        kind: ResultKind,
    ) -> Result<HandlerOutput> {
        let bindings = ctx.bindings();
        let mut globals = HashMap::with_capacity(self.parameters.len());
        for name in &self.parameters {
            let value = match bindings.get(name) {
                Some(binding) => Value::from_json(&binding.value),
                None => {
                    debug!(binding = %name, "Binding missing at invocation; using Nothing");
                    Value::Nothing
                }
            };
            globals.insert(name.to_ascii_lowercase(), value);
        }

        let mut interpreter = Interpreter::new(&self.functions, globals, ctx, sink, &self.limits);
        let value = interpreter.run(&self.body)?;
        let claims = interpreter.into_claims();
        HandlerOutput::from_value(kind, value.to_json(), claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Claim, Identity, RequestData, ResponseBody};
    use crate::error::ScriptError;
    use crate::ScriptLanguage;
    use nautilus_core::Binding;
    use serde_json::json;
    use std::sync::Arc;

    fn compile_with(
        source: &str,
        bindings: &BindingTable,
        kind: ResultKind,
        libraries: &[Library],
    ) -> BackendResult {
        let request = CompilationRequest::new(ScriptLanguage::Basic, source)
            .name("test")
            .result_kind(kind);
        compile(&request, libraries, bindings, &ScriptLimits::default())
    }

    fn program(source: &str, bindings: &BindingTable, kind: ResultKind) -> BasicProgram {
        match compile_with(source, bindings, kind, &[]) {
            Ok((HandlerProgram::Basic(program), _)) => program,
            Ok(_) => panic!("unexpected program variant"),
            Err(diagnostics) => panic!("compile failed: {diagnostics:?}"),
        }
    }

    fn body_text(sink: &ResponseSink) -> &str {
        match sink.body() {
            ResponseBody::Text(text) => text,
            other => panic!("unexpected body {other:?}"),
        }
    }

    fn run(program: &BasicProgram, ctx: &ExecutionContext) -> (Result<HandlerOutput>, ResponseSink) {
        let mut sink = ResponseSink::new();
        let output = program.run(ctx, &mut sink, ResultKind::Response);
        (output, sink)
    }

    #[test]
    fn test_status_only() {
        let program = program("Response.Status = 204", &BindingTable::new(), ResultKind::Response);
        let (output, sink) = run(&program, &ExecutionContext::new(RequestData::default()));
        assert_eq!(output.unwrap(), HandlerOutput::Completed);
        assert_eq!(sink.status(), 204);
        assert!(!sink.has_body());
    }

    #[test]
    fn test_functions_loops_and_request() {
        let source = r#"
Function Greet(name As String) As String
    If name = "" Then
        Return "Hello, stranger"
    End If
    Return "Hello, " & name
End Function

Dim total As Integer = 0
For i As Integer = 1 To 4
    total += i
Next
Response.ContentType = "text/html"
Response.SetHeader("X-Total", CStr(total))
Response.Write(Greet(Request.Query("name")))
"#;
        let program = program(source, &BindingTable::new(), ResultKind::Response);

        let request = RequestData {
            query: vec![("name".to_string(), "ann".to_string())],
            ..Default::default()
        };
        let (output, sink) = run(&program, &ExecutionContext::new(request));
        output.unwrap();
        assert_eq!(sink.header("x-total"), Some("10"));
        assert_eq!(sink.content_type(), Some("text/html"));
        assert_eq!(body_text(&sink), "Hello, ann");

        let (_, sink) = run(&program, &ExecutionContext::new(RequestData::default()));
        assert_eq!(body_text(&sink), "Hello, stranger");
    }

    #[test]
    fn test_string_concatenation() {
        let source = r#"
Dim name As String = "ann"
Dim count As Integer = 3
Response.Write("Hi " + name & ", " & count)
"#;
        let program = program(source, &BindingTable::new(), ResultKind::Response);
        let (output, sink) = run(&program, &ExecutionContext::new(RequestData::default()));
        output.unwrap();
        assert_eq!(body_text(&sink), "Hi ann, 3");
    }

    #[test]
    fn test_verdict_from_locals() {
        let mut bindings = BindingTable::new();
        bindings.insert(Binding::new("username", json!("")));
        bindings.insert(Binding::new("password", json!("")));
        let program = program(
            r#"Return username = "admin" AndAlso password = "s3cret""#,
            &bindings,
            ResultKind::Verdict,
        );

        let ctx = ExecutionContext::new(RequestData::default())
            .with_local("username", json!("admin"))
            .with_local("password", json!("s3cret"));
        let output = program
            .run(&ctx, &mut ResponseSink::new(), ResultKind::Verdict)
            .unwrap();
        assert!(output.is_accepted());

        let ctx = ctx.with_local("password", json!("guess"));
        let output = program
            .run(&ctx, &mut ResponseSink::new(), ResultKind::Verdict)
            .unwrap();
        assert_eq!(output, HandlerOutput::Verdict(false));
    }

    #[test]
    fn test_claims() {
        let source = r#"
AddClaim("tenant", "acme")
If Identity.HasClaim("role", "ops") Then
    AddClaim("elevated", True)
End If
Return ParseJson("{""role"": [""reader""]}")
"#;
        let program = program(source, &BindingTable::new(), ResultKind::Claims);
        let ctx = ExecutionContext::new(RequestData::default()).with_identity(
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
                Claim::new("elevated", "True"),
                Claim::new("role", "reader"),
            ]
        );
    }

    #[test]
    fn test_runtime_errors_carry_lines() {
        let program = program(
            "Dim zero As Integer = 0\nResponse.Write(10 \\ zero)",
            &BindingTable::new(),
            ResultKind::Response,
        );
        let (output, _) = run(&program, &ExecutionContext::new(RequestData::default()));
        match output.unwrap_err() {
            ScriptError::Runtime { message, line } => {
                assert_eq!(line, Some(2));
                assert!(message.contains("divide by zero"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_limits() {
        let ctx = ExecutionContext::new(RequestData::default());

        let spin = program("While True\nEnd While", &BindingTable::new(), ResultKind::Response);
        let (output, _) = run(&spin, &ctx);
        assert!(matches!(output, Err(ScriptError::Runtime { .. })));

        let recurse = program(
            "Function F(n As Integer) As Integer\n  Return F(n + 1)\nEnd Function\nResponse.Write(F(1))",
            &BindingTable::new(),
            ResultKind::Response,
        );
        let (output, _) = run(&recurse, &ctx);
        let err = output.unwrap_err();
        assert!(err.to_string().contains("call depth"), "{err}");
    }

    #[test]
    fn test_json_documents() {
        let source = r#"
Dim data = Request.Json
data.count = data.count + 1
data.meta.seen = True
Response.Json(data)
"#;
        let program = program(source, &BindingTable::new(), ResultKind::Response);
        let request = RequestData {
            body: bytes::Bytes::from(r#"{"count": 1, "meta": {}}"#),
            ..Default::default()
        };
        let (output, sink) = run(&program, &ExecutionContext::new(request));
        output.unwrap();
        assert_eq!(sink.content_type(), Some("application/json"));
        assert_eq!(body_text(&sink), r#"{"count":2,"meta":{"seen":true}}"#);
    }

    #[test]
    fn test_library_functions() {
        let library = Library {
            name: "math".to_string(),
            source: Arc::from("Function Twice(n As Integer) As Integer\n  Return n * 2\nEnd Function"),
        };
        let program = match compile_with(
            "Response.Write(Twice(21))",
            &BindingTable::new(),
            ResultKind::Response,
            &[library],
        ) {
            Ok((HandlerProgram::Basic(program), _)) => program,
            other => panic!("unexpected outcome {other:?}"),
        };
        let (_, sink) = run(&program, &ExecutionContext::new(RequestData::default()));
        assert_eq!(body_text(&sink), "42");
    }

    #[test]
    fn test_binding_names() {
        let bindings = BindingTable::from_values([
            ("response", json!(1)),
            ("not-valid", json!(2)),
            ("tenant", json!("acme")),
        ]);
        let (program, diagnostics) =
            match compile_with("Response.Write(IsNothing(tenant))", &bindings, ResultKind::Response, &[]) {
                Ok((HandlerProgram::Basic(program), diagnostics)) => (program, diagnostics),
                other => panic!("unexpected outcome {other:?}"),
            };
        assert_eq!(diagnostics.warnings().count(), 2);
        assert_eq!(program.parameters, vec!["tenant".to_string()]);

        // Missing at invocation binds Nothing
        let (_, sink) = run(&program, &ExecutionContext::new(RequestData::default()));
        assert_eq!(body_text(&sink), "True");
    }

    #[test]
    fn test_syntax_errors_stop_compilation() {
        let diagnostics = compile_with(
            "If True Then\nResponse.Status = 200",
            &BindingTable::new(),
            ResultKind::Response,
            &[],
        )
        .unwrap_err();
        assert!(diagnostics.has_errors());
    }
}
