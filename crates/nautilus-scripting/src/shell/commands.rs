//! Built-in shell commands
//!
//! Commands bind named parameters, switches and positional values the
//! same way user functions do; values beyond the declared parameters are
//! collected for commands that accept them.

use crate::context::{Claim, Cookie};
use crate::diagnostics::StreamKind;
use crate::shell::interpreter::{fail, ArgValue, Exec, Flow, Interpreter};
use crate::shell::value::{self, ShellValue, Table};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Builtin {
    WriteOutput,
    WriteError,
    WriteWarning,
    WriteVerbose,
    WriteDebug,
    WriteInformation,
    ForEachObject,
    WhereObject,
    SelectObject,
    SortObject,
    MeasureObject,
    ConvertToJson,
    ConvertFromJson,
    JoinString,
    SetStatus,
    SetHeader,
    SetContentType,
    SetCookie,
    SetBody,
    SendRedirect,
    SendFile,
    AddClaim,
    GetVariable,
}

struct Signature {
    name: &'static str,
    params: &'static [&'static str],
    switches: &'static [&'static str],
    variadic: bool,
}

impl Builtin {
    /// Resolve a lowercase command name
    pub(crate) fn lookup(name: &str) -> Option<Self> {
        let builtin = match name {
            "write-output" | "echo" => Self::WriteOutput,
            "write-error" => Self::WriteError,
            "write-warning" => Self::WriteWarning,
            "write-verbose" => Self::WriteVerbose,
            "write-debug" => Self::WriteDebug,
            "write-information" | "write-host" => Self::WriteInformation,
            "foreach-object" | "foreach" | "%" => Self::ForEachObject,
            "where-object" | "where" | "?" => Self::WhereObject,
            "select-object" | "select" => Self::SelectObject,
            "sort-object" | "sort" => Self::SortObject,
            "measure-object" | "measure" => Self::MeasureObject,
            "convertto-json" => Self::ConvertToJson,
            "convertfrom-json" => Self::ConvertFromJson,
            "join-string" => Self::JoinString,
            "set-status" => Self::SetStatus,
            "set-header" => Self::SetHeader,
            "set-contenttype" => Self::SetContentType,
            "set-cookie" => Self::SetCookie,
            "set-body" => Self::SetBody,
            "send-redirect" => Self::SendRedirect,
            "send-file" => Self::SendFile,
            "add-claim" => Self::AddClaim,
            "get-variable" => Self::GetVariable,
            _ => return None,
        };
        Some(builtin)
    }

    fn signature(self) -> Signature {
        let (name, params, switches, variadic): (_, &'static [&'static str], &'static [&'static str], _) =
            match self {
                Self::WriteOutput => ("Write-Output", &["InputObject"], &[], true),
                Self::WriteError => ("Write-Error", &["Message"], &[], true),
                Self::WriteWarning => ("Write-Warning", &["Message"], &[], true),
                Self::WriteVerbose => ("Write-Verbose", &["Message"], &[], true),
                Self::WriteDebug => ("Write-Debug", &["Message"], &[], true),
                Self::WriteInformation => ("Write-Information", &["MessageData"], &[], true),
                Self::ForEachObject => ("ForEach-Object", &["Process"], &[], false),
                Self::WhereObject => ("Where-Object", &["FilterScript"], &[], false),
                Self::SelectObject => (
                    "Select-Object",
                    &["Property", "First", "Last", "Skip"],
                    &["Unique"],
                    true,
                ),
                Self::SortObject => ("Sort-Object", &["Property"], &["Descending", "Unique"], false),
                Self::MeasureObject => (
                    "Measure-Object",
                    &["Property"],
                    &["Sum", "Average", "Maximum", "Minimum"],
                    false,
                ),
                Self::ConvertToJson => ("ConvertTo-Json", &["InputObject", "Depth"], &["Compress"], false),
                Self::ConvertFromJson => ("ConvertFrom-Json", &["InputObject"], &["AsHashtable"], false),
                Self::JoinString => ("Join-String", &["Property", "Separator"], &[], false),
                Self::SetStatus => ("Set-Status", &["StatusCode"], &[], false),
                Self::SetHeader => ("Set-Header", &["Name", "Value"], &["Append"], false),
                Self::SetContentType => ("Set-ContentType", &["ContentType"], &[], false),
                Self::SetCookie => (
                    "Set-Cookie",
                    &["Name", "Value", "MaxAge", "Path"],
                    &["HttpOnly", "Secure"],
                    false,
                ),
                Self::SetBody => ("Set-Body", &["Body"], &[], false),
                Self::SendRedirect => ("Send-Redirect", &["Location"], &["Permanent"], false),
                Self::SendFile => ("Send-File", &["Path", "ContentType"], &[], false),
                Self::AddClaim => ("Add-Claim", &["Type", "Value"], &[], false),
                Self::GetVariable => ("Get-Variable", &["Name"], &["ValueOnly"], false),
            };
        Signature {
            name,
            params,
            switches,
            variadic,
        }
    }
}

/// Arguments after parameter binding
#[derive(Debug, Default)]
struct Bound {
    named: Vec<(&'static str, ShellValue)>,
    switches: Vec<&'static str>,
    rest: Vec<ShellValue>,
}

impl Bound {
    fn take(&mut self, name: &str) -> Option<ShellValue> {
        let position = self.named.iter().position(|(n, _)| *n == name)?;
        Some(self.named.remove(position).1)
    }

    fn switch(&self, name: &str) -> bool {
        self.switches.contains(&name)
    }
}

fn bind(sig: &Signature, args: Vec<ArgValue>, line: usize) -> Exec<Bound> {
    let mut bound = Bound::default();
    let mut positional = Vec::new();
    let mut args = args.into_iter().peekable();

    while let Some(arg) = args.next() {
        match arg {
            ArgValue::Flag(flag) => {
                if let Some(switch) = sig.switches.iter().find(|s| s.eq_ignore_ascii_case(&flag)) {
                    if let Some(ArgValue::Value(ShellValue::Bool(false))) = args.peek() {
                        args.next();
                    } else {
                        bound.switches.push(switch);
                    }
                    continue;
                }
                let Some(param) = sig.params.iter().find(|p| p.eq_ignore_ascii_case(&flag)) else {
                    return Err(fail(
                        format!("A parameter cannot be found that matches parameter name '{flag}'."),
                        line,
                    ));
                };
                match args.next() {
                    Some(ArgValue::Value(value)) => bound.named.push((param, value)),
                    _ => {
                        return Err(fail(
                            format!(
                                "{}: Missing an argument for parameter '{param}'.",
                                sig.name
                            ),
                            line,
                        ))
                    }
                }
            }
            ArgValue::Value(value) => positional.push(value),
        }
    }

    let mut positional = positional.into_iter();
    for param in sig.params {
        if bound.named.iter().any(|(n, _)| n == param) {
            continue;
        }
        match positional.next() {
            Some(value) => bound.named.push((param, value)),
            None => break,
        }
    }
    bound.rest = positional.collect();
    if !bound.rest.is_empty() && !sig.variadic {
        return Err(fail(
            format!(
                "{}: A positional parameter cannot be found that accepts argument '{}'.",
                sig.name,
                bound.rest[0].to_text()
            ),
            line,
        ));
    }
    Ok(bound)
}

fn message(bound: &mut Bound, param: &str) -> Option<String> {
    let mut parts: Vec<String> = bound.take(param).into_iter().map(|v| v.to_text()).collect();
    parts.extend(bound.rest.drain(..).map(|v| v.to_text()));
    (!parts.is_empty()).then(|| parts.join(" "))
}

fn text_arg(bound: &mut Bound, param: &str, command: &str, line: usize) -> Exec<String> {
    bound
        .take(param)
        .map(|v| v.to_text())
        .ok_or_else(|| fail(format!("{command}: Missing mandatory parameter '{param}'."), line))
}

fn block_arg(bound: &mut Bound, param: &str, command: &str, line: usize) -> Exec<std::sync::Arc<crate::shell::ast::Block>> {
    match bound.take(param) {
        Some(ShellValue::Block(block)) => Ok(block),
        Some(other) => Err(fail(
            format!(
                "{command}: Cannot bind parameter '{param}'. Expected a script block, got {}.",
                other.type_name()
            ),
            line,
        )),
        None => Err(fail(format!("{command}: Missing mandatory parameter '{param}'."), line)),
    }
}

fn count_arg(bound: &mut Bound, param: &str, line: usize) -> Exec<Option<usize>> {
    match bound.take(param) {
        Some(value) => value
            .to_int()
            .and_then(|n| usize::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| fail(format!("Cannot convert '{}' to a count for -{param}.", value.to_text()), line)),
        None => Ok(None),
    }
}

fn project(item: &ShellValue, property: &Option<ShellValue>) -> ShellValue {
    match property {
        Some(name) => item.member(&name.to_text()),
        None => item.clone(),
    }
}

impl Interpreter<'_> {
    pub(crate) fn run_builtin(
        &mut self,
        builtin: Builtin,
        args: Vec<ArgValue>,
        input: Option<Vec<ShellValue>>,
        line: usize,
    ) -> Exec<Vec<ShellValue>> {
        let sig = builtin.signature();
        let command = sig.name;
        let mut bound = bind(&sig, args, line)?;
        let has_input = input.is_some();
        let input = input.unwrap_or_default();

        let output = match builtin {
            Builtin::WriteOutput => {
                let mut items = Vec::new();
                if let Some(value) = bound.take("InputObject") {
                    items.extend(value.into_items());
                    for value in bound.rest.drain(..) {
                        items.extend(value.into_items());
                    }
                } else {
                    items = input;
                }
                items
            }
            Builtin::WriteError
            | Builtin::WriteWarning
            | Builtin::WriteVerbose
            | Builtin::WriteDebug
            | Builtin::WriteInformation => {
                let (kind, param) = match builtin {
                    Builtin::WriteError => (StreamKind::Error, "Message"),
                    Builtin::WriteWarning => (StreamKind::Warning, "Message"),
                    Builtin::WriteVerbose => (StreamKind::Verbose, "Message"),
                    Builtin::WriteDebug => (StreamKind::Debug, "Message"),
                    _ => (StreamKind::Information, "MessageData"),
                };
                match message(&mut bound, param) {
                    Some(text) => self.report.push_at(kind, text, line),
                    None => {
                        for item in input {
                            self.report.push_at(kind, item.to_text(), line);
                        }
                    }
                }
                Vec::new()
            }
            Builtin::ForEachObject => {
                let block = block_arg(&mut bound, "Process", command, line)?;
                let mut out = Vec::new();
                for item in input {
                    if self.invoke_block(&block, item, &mut out)? == Flow::Break {
                        break;
                    }
                }
                out
            }
            Builtin::WhereObject => {
                let block = block_arg(&mut bound, "FilterScript", command, line)?;
                let mut kept = Vec::new();
                for item in input {
                    let mut out = Vec::new();
                    let flow = self.invoke_block(&block, item.clone(), &mut out)?;
                    if ShellValue::collapse(out).is_truthy() {
                        kept.push(item);
                    }
                    if flow == Flow::Break {
                        break;
                    }
                }
                kept
            }
            Builtin::SelectObject => {
                let mut properties: Vec<String> = bound
                    .take("Property")
                    .map(|v| v.into_items().iter().map(ShellValue::to_text).collect())
                    .unwrap_or_default();
                properties.extend(bound.rest.drain(..).map(|v| v.to_text()));
                let skip = count_arg(&mut bound, "Skip", line)?.unwrap_or(0);
                let first = count_arg(&mut bound, "First", line)?;
                let last = count_arg(&mut bound, "Last", line)?;

                let mut items: Vec<ShellValue> = input.into_iter().skip(skip).collect();
                if bound.switch("Unique") {
                    let mut unique: Vec<ShellValue> = Vec::new();
                    for item in items {
                        if !unique.iter().any(|seen| value::equals(seen, &item)) {
                            unique.push(item);
                        }
                    }
                    items = unique;
                }
                if let Some(first) = first {
                    items.truncate(first);
                }
                if let Some(last) = last {
                    let start = items.len().saturating_sub(last);
                    items.drain(..start);
                }
                if properties.is_empty() {
                    items
                } else {
                    items
                        .iter()
                        .map(|item| {
                            ShellValue::Table(
                                properties
                                    .iter()
                                    .map(|p| (p.clone(), item.member(p)))
                                    .collect(),
                            )
                        })
                        .collect()
                }
            }
            Builtin::SortObject => {
                let property = bound.take("Property");
                let mut items = input;
                items.sort_by(|a, b| {
                    value::compare(&project(a, &property), &project(b, &property))
                        .unwrap_or(Ordering::Equal)
                });
                if bound.switch("Descending") {
                    items.reverse();
                }
                if bound.switch("Unique") {
                    items.dedup_by(|a, b| value::equals(a, b));
                }
                items
            }
            Builtin::MeasureObject => {
                let property = bound.take("Property");
                let values: Vec<ShellValue> = input.iter().map(|item| project(item, &property)).collect();
                let mut result = Table::new();
                result.insert("Count", ShellValue::Int(values.len() as i64));

                let wants_numbers = ["Sum", "Average", "Maximum", "Minimum"]
                    .iter()
                    .any(|s| bound.switch(s));
                if wants_numbers {
                    let mut numbers = Vec::with_capacity(values.len());
                    for value in &values {
                        numbers.push(value.to_double().ok_or_else(|| {
                            fail(
                                format!(
                                    "{command}: Input object \"{}\" is not numeric.",
                                    value.to_text()
                                ),
                                line,
                            )
                        })?);
                    }
                    let number = |d: f64| {
                        if d.fract() == 0.0 && d.abs() < i64::MAX as f64 {
                            ShellValue::Int(d as i64)
                        } else {
                            ShellValue::Double(d)
                        }
                    };
                    let sum: f64 = numbers.iter().sum();
                    if bound.switch("Sum") {
                        result.insert("Sum", number(sum));
                    }
                    if bound.switch("Average") {
                        let average = if numbers.is_empty() {
                            ShellValue::Null
                        } else {
                            ShellValue::Double(sum / numbers.len() as f64)
                        };
                        result.insert("Average", average);
                    }
                    if bound.switch("Maximum") {
                        let max = numbers.iter().copied().fold(None, |acc: Option<f64>, n| {
                            Some(acc.map_or(n, |a| a.max(n)))
                        });
                        result.insert("Maximum", max.map_or(ShellValue::Null, number));
                    }
                    if bound.switch("Minimum") {
                        let min = numbers.iter().copied().fold(None, |acc: Option<f64>, n| {
                            Some(acc.map_or(n, |a| a.min(n)))
                        });
                        result.insert("Minimum", min.map_or(ShellValue::Null, number));
                    }
                }
                vec![ShellValue::Table(result)]
            }
            Builtin::ConvertToJson => {
                let subject = match bound.take("InputObject") {
                    Some(value) => value,
                    None => ShellValue::collapse(input),
                };
                let json = subject.to_json();
                let text = if bound.switch("Compress") {
                    serde_json::to_string(&json)
                } else {
                    serde_json::to_string_pretty(&json)
                }
                .map_err(|err| fail(format!("{command}: {err}"), line))?;
                vec![ShellValue::Str(text)]
            }
            Builtin::ConvertFromJson => {
                let text = match bound.take("InputObject") {
                    Some(value) => value.to_text(),
                    None => input.iter().map(ShellValue::to_text).collect::<Vec<_>>().join("\n"),
                };
                let json: serde_json::Value = serde_json::from_str(&text).map_err(|err| {
                    fail(format!("Conversion from JSON failed with error: {err}"), line)
                })?;
                vec![ShellValue::from_json(&json)]
            }
            Builtin::JoinString => {
                let property = bound.take("Property");
                let separator = bound.take("Separator").map(|v| v.to_text()).unwrap_or_default();
                let joined = input
                    .iter()
                    .map(|item| project(item, &property).to_text())
                    .collect::<Vec<_>>()
                    .join(&separator);
                vec![ShellValue::Str(joined)]
            }
            Builtin::SetStatus => {
                let value = bound
                    .take("StatusCode")
                    .ok_or_else(|| fail(format!("{command}: Missing mandatory parameter 'StatusCode'."), line))?;
                let status = value
                    .to_int()
                    .and_then(|code| u16::try_from(code).ok())
                    .filter(|code| (100..=999).contains(code))
                    .ok_or_else(|| {
                        fail(
                            format!("{command}: '{}' is not a valid HTTP status code.", value.to_text()),
                            line,
                        )
                    })?;
                self.sink.set_status(status);
                Vec::new()
            }
            Builtin::SetHeader => {
                let name = text_arg(&mut bound, "Name", command, line)?;
                let value = text_arg(&mut bound, "Value", command, line)?;
                if bound.switch("Append") {
                    self.sink.append_header(name, value);
                } else {
                    self.sink.set_header(name, value);
                }
                Vec::new()
            }
            Builtin::SetContentType => {
                let content_type = text_arg(&mut bound, "ContentType", command, line)?;
                self.sink.set_content_type(content_type);
                Vec::new()
            }
            Builtin::SetCookie => {
                let name = text_arg(&mut bound, "Name", command, line)?;
                let value = text_arg(&mut bound, "Value", command, line)?;
                let mut cookie = Cookie::new(name, value);
                if let Some(max_age) = bound.take("MaxAge") {
                    let seconds = max_age
                        .to_int()
                        .ok_or_else(|| fail(format!("{command}: MaxAge must be a number of seconds."), line))?;
                    cookie = cookie.max_age(seconds);
                }
                if let Some(path) = bound.take("Path") {
                    cookie.path = Some(path.to_text());
                }
                if bound.switch("HttpOnly") {
                    cookie = cookie.http_only();
                }
                if bound.switch("Secure") {
                    cookie = cookie.secure();
                }
                self.sink.add_cookie(cookie);
                Vec::new()
            }
            Builtin::SetBody => {
                let body = match bound.take("Body") {
                    Some(value) => value,
                    None if has_input => ShellValue::collapse(input),
                    None => {
                        return Err(fail(format!("{command}: Missing mandatory parameter 'Body'."), line))
                    }
                };
                match body {
                    ShellValue::Str(text) => self.sink.set_text(text),
                    ShellValue::Null => self.sink.set_text(String::new()),
                    other => self
                        .sink
                        .set_json(&other.to_json())
                        .map_err(|err| fail(format!("{command}: {err}"), line))?,
                }
                Vec::new()
            }
            Builtin::SendRedirect => {
                let location = text_arg(&mut bound, "Location", command, line)?;
                self.sink.redirect(location, bound.switch("Permanent"));
                Vec::new()
            }
            Builtin::SendFile => {
                let path = text_arg(&mut bound, "Path", command, line)?;
                if let Some(content_type) = bound.take("ContentType") {
                    self.sink.set_content_type(content_type.to_text());
                }
                self.sink.set_file(path);
                Vec::new()
            }
            Builtin::AddClaim => {
                let kind = text_arg(&mut bound, "Type", command, line)?;
                let value = bound.take("Value").unwrap_or(ShellValue::Str(String::new()));
                for item in value.into_items() {
                    self.claims.push(Claim::new(kind.clone(), item.to_text()));
                }
                Vec::new()
            }
            Builtin::GetVariable => {
                let name = text_arg(&mut bound, "Name", command, line)?;
                if !self.has_variable(&name) {
                    self.report.push_at(
                        StreamKind::Error,
                        format!("Cannot find a variable with the name '{name}'."),
                        line,
                    );
                    return Ok(Vec::new());
                }
                let value = self.lookup(&name);
                if bound.switch("ValueOnly") {
                    vec![value]
                } else {
                    let mut variable = Table::new();
                    variable.insert("Name", ShellValue::Str(name));
                    variable.insert("Value", value);
                    vec![ShellValue::Table(variable)]
                }
            }
        };
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ScriptLimits;
    use crate::context::{ResponseBody, ResponseSink};
    use crate::shell::parser;
    use std::collections::HashMap;

    struct Outcome {
        output: Vec<String>,
        sink: ResponseSink,
        claims: Vec<Claim>,
        report: crate::diagnostics::StreamReport,
    }

    fn run(source: &str) -> Outcome {
        let script = parser::parse(source).unwrap();
        let variables = HashMap::new();
        let functions = HashMap::new();
        let limits = ScriptLimits::default();
        let mut sink = ResponseSink::new();
        let (output, claims, report) = {
            let mut interpreter = Interpreter::new(&variables, &functions, &mut sink, &limits);
            let output = match interpreter.run(&script.body) {
                Ok(items) => items,
                Err(fault) => panic!("script failed: {fault:?}"),
            };
            (output, interpreter.claims, interpreter.report)
        };
        Outcome {
            output: output.iter().map(ShellValue::to_text).collect(),
            sink,
            claims,
            report,
        }
    }

    #[test]
    fn test_pipeline_commands() {
        let source = r#"
1..6 | Where-Object { $_ % 2 -eq 0 } | ForEach-Object { $_ * 10 }
@(3, 1, 2) | Sort-Object -Descending | Join-String -Separator ','
(1..4 | Measure-Object -Sum).Sum
@('a', 'b', 'c', 'd') | Select-Object -First 3 | Select-Object -Last 1
"#;
        assert_eq!(run(source).output, vec!["20", "40", "60", "3,2,1", "10", "c"]);
    }

    #[test]
    fn test_objects_and_json() {
        let source = r#"
$users = @(@{ Name = 'bo'; Age = 40 }, @{ Name = 'al'; Age = 30 })
$users | Sort-Object -Property Age | ForEach-Object { $_.Name }
$users | Select-Object -Property Name | ConvertTo-Json -Compress
('{"id": 7, "tags": ["x"]}' | ConvertFrom-Json).tags[0]
"#;
        assert_eq!(
            run(source).output,
            vec!["al", "bo", r#"[{"Name":"bo"},{"Name":"al"}]"#, "x"]
        );
    }

    #[test]
    fn test_response_commands() {
        let source = r#"
Set-Status 201
Set-Header 'X-Trace' 'abc'
Set-Header -Name 'X-Trace' -Value 'def' -Append
Set-ContentType 'application/json'
Set-Cookie -Name session -Value 42 -HttpOnly
Set-Body @{ ok = $true }
"#;
        let outcome = run(source);
        let sink = outcome.sink;
        assert_eq!(sink.status(), 201);
        assert_eq!(sink.header("x-trace"), Some("abc"));
        assert_eq!(sink.content_type(), Some("application/json"));
        assert_eq!(sink.cookies()[0].name, "session");
        assert!(sink.cookies()[0].http_only);
        match sink.body() {
            ResponseBody::Bytes(bytes) => assert_eq!(&bytes[..], br#"{"ok":true}"#),
            ResponseBody::Text(text) => assert_eq!(text, r#"{"ok":true}"#),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_redirect_and_claims() {
        let outcome = run("Send-Redirect '/login' -Permanent\nAdd-Claim role admin\nAdd-Claim -Type scope -Value @('read', 'write')");
        let redirect = outcome.sink.redirect_target().unwrap();
        assert_eq!(redirect.location, "/login");
        assert!(redirect.permanent);
        assert_eq!(
            outcome.claims,
            vec![
                Claim::new("role", "admin"),
                Claim::new("scope", "read"),
                Claim::new("scope", "write"),
            ]
        );
    }

    #[test]
    fn test_streams() {
        let outcome = run("Write-Warning 'careful'\nWrite-Verbose 'detail'\nGet-Variable nothing\nWrite-Output 'done'");
        assert_eq!(outcome.output, vec!["done"]);
        let report = outcome.report;
        assert_eq!(report.channel(StreamKind::Warning).count(), 1);
        assert_eq!(report.channel(StreamKind::Verbose).count(), 1);
        let error = report.channel(StreamKind::Error).next().unwrap();
        assert!(error.message.contains("nothing"));
        assert_eq!(error.line, Some(3));
        assert!(report.is_failed());
    }

    #[test]
    fn test_binding_errors() {
        let script = parser::parse("Set-Status -Code 200").unwrap();
        let variables = HashMap::new();
        let functions = HashMap::new();
        let limits = ScriptLimits::default();
        let mut sink = ResponseSink::new();
        let mut interpreter = Interpreter::new(&variables, &functions, &mut sink, &limits);
        match interpreter.run(&script.body) {
            Err(crate::shell::interpreter::Fault::Error(err)) => {
                assert!(err.to_string().contains("'Code'"))
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
