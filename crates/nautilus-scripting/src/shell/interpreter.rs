//! Shell evaluator
//!
//! Pipelines are evaluated stage by stage over materialized item lists.
//! Variables resolve through the invocation's scope stack and then the
//! session's seed variables, which are never written.

use crate::compiler::ScriptLimits;
use crate::context::{Claim, ResponseSink};
use crate::diagnostics::StreamReport;
use crate::error::ScriptError;
use crate::shell::ast::*;
use crate::shell::commands::Builtin;
use crate::shell::value::{self, ShellValue, Table};
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::sync::Arc;

/// Why evaluation stopped early
#[derive(Debug)]
pub(crate) enum Fault {
    Error(ScriptError),
    /// `throw` statement
    Thrown { message: String, line: usize },
}

impl From<ScriptError> for Fault {
    fn from(err: ScriptError) -> Self {
        Fault::Error(err)
    }
}

pub(crate) type Exec<T> = std::result::Result<T, Fault>;

pub(crate) fn fail(message: impl Into<String>, line: usize) -> Fault {
    Fault::Error(ScriptError::runtime_at(message, line))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Normal,
    Break,
    Continue,
    Return,
}

/// Evaluated command argument
#[derive(Debug, Clone)]
pub(crate) enum ArgValue {
    Flag(String),
    Value(ShellValue),
}

pub(crate) struct Interpreter<'a> {
    session_variables: &'a HashMap<String, ShellValue>,
    session_functions: &'a HashMap<String, Arc<FunctionDef>>,
    functions: HashMap<String, Arc<FunctionDef>>,
    scopes: Vec<HashMap<String, ShellValue>>,
    pub(crate) sink: &'a mut ResponseSink,
    pub(crate) limits: &'a ScriptLimits,
    pub(crate) report: StreamReport,
    pub(crate) claims: Vec<Claim>,
    operations: u64,
    depth: usize,
    exceeded: bool,
}

impl<'a> Interpreter<'a> {
    pub(crate) fn new(
        session_variables: &'a HashMap<String, ShellValue>,
        session_functions: &'a HashMap<String, Arc<FunctionDef>>,
        sink: &'a mut ResponseSink,
        limits: &'a ScriptLimits,
    ) -> Self {
        Self {
            session_variables,
            session_functions,
            functions: HashMap::new(),
            scopes: vec![HashMap::new()],
            sink,
            limits,
            report: StreamReport::new(),
            claims: Vec::new(),
            operations: 0,
            depth: 0,
            exceeded: false,
        }
    }

    /// Whether a limit was hit; the session must not be reused
    pub(crate) fn limit_exceeded(&self) -> bool {
        self.exceeded
    }

    pub(crate) fn define(&mut self, name: &str, value: ShellValue) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_ascii_lowercase(), value);
        }
    }

    pub(crate) fn define_function(&mut self, function: Arc<FunctionDef>) {
        self.functions
            .insert(function.name.to_ascii_lowercase(), function);
    }

    /// Variables and functions defined at the top level
    pub(crate) fn into_definitions(
        mut self,
    ) -> (HashMap<String, ShellValue>, HashMap<String, Arc<FunctionDef>>) {
        let variables = self.scopes.drain(..).next().unwrap_or_default();
        (variables, self.functions)
    }

    /// Bind a `param(...)` block from values supplied by the host
    pub(crate) fn bind_script_params(&mut self, params: &[ParamDef]) -> Exec<()> {
        for param in params {
            if self.lookup(&param.name).is_null() {
                if let Some(default) = &param.default {
                    let value = self.eval(default)?;
                    self.define(&param.name, value);
                }
            }
        }
        Ok(())
    }

    /// Run a top-level block and return its success output
    pub(crate) fn run(&mut self, block: &Block) -> Exec<Vec<ShellValue>> {
        let mut out = Vec::new();
        self.exec_block(block, &mut out)?;
        Ok(out)
    }

    fn tick(&mut self, line: usize) -> Exec<()> {
        self.operations += 1;
        if self.operations > self.limits.max_operations {
            self.exceeded = true;
            return Err(fail(
                format!(
                    "Script exceeded the maximum of {} operations",
                    self.limits.max_operations
                ),
                line,
            ));
        }
        Ok(())
    }

    fn check_size(&mut self, value: ShellValue, line: usize) -> Exec<ShellValue> {
        if let ShellValue::Str(s) = &value {
            if s.len() > self.limits.max_string_size {
                return Err(self.size_fault(line));
            }
        }
        Ok(value)
    }

    fn size_fault(&mut self, line: usize) -> Fault {
        self.exceeded = true;
        fail(
            format!(
                "String length exceeds the maximum of {} bytes",
                self.limits.max_string_size
            ),
            line,
        )
    }

    /// Reject `'text' * n` before the repeated string is allocated
    fn check_repeat(&mut self, left: &ShellValue, right: &ShellValue, line: usize) -> Exec<()> {
        let ShellValue::Str(s) = left else {
            return Ok(());
        };
        let Some(count) = right.to_int().filter(|n| *n > 0) else {
            return Ok(());
        };
        let length = usize::try_from(count)
            .ok()
            .and_then(|count| s.len().checked_mul(count));
        match length {
            Some(length) if length <= self.limits.max_string_size => Ok(()),
            _ => Err(self.size_fault(line)),
        }
    }

    pub(crate) fn lookup(&self, name: &str) -> ShellValue {
        let key = name.to_ascii_lowercase();
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(&key))
            .or_else(|| self.session_variables.get(&key))
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn has_variable(&self, name: &str) -> bool {
        let key = name.to_ascii_lowercase();
        self.scopes.iter().any(|scope| scope.contains_key(&key))
            || self.session_variables.contains_key(&key)
    }

    fn exec_block(&mut self, block: &Block, out: &mut Vec<ShellValue>) -> Exec<Flow> {
        for statement in &block.statements {
            let flow = self.exec_statement(statement, out)?;
            if flow != Flow::Normal {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_statement(&mut self, statement: &Statement, out: &mut Vec<ShellValue>) -> Exec<Flow> {
        let line = statement.line;
        self.tick(line)?;

        match &statement.kind {
            StatementKind::Pipeline(pipeline) => {
                let items = self.run_pipeline(pipeline)?;
                out.extend(items);
            }
            StatementKind::Assign { target, op, value } => {
                let value = ShellValue::collapse(self.run_pipeline(value)?);
                self.assign(target, *op, value, line)?;
            }
            StatementKind::If {
                branches,
                otherwise,
            } => {
                for (condition, body) in branches {
                    if self.condition(condition)? {
                        return self.exec_block(body, out);
                    }
                }
                if let Some(body) = otherwise {
                    return self.exec_block(body, out);
                }
            }
            StatementKind::Foreach {
                variable,
                source,
                body,
            } => {
                for item in self.run_pipeline(source)? {
                    self.tick(line)?;
                    self.define(variable, item);
                    match self.exec_block(body, out)? {
                        Flow::Break => break,
                        Flow::Return => return Ok(Flow::Return),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            StatementKind::While { condition, body } => {
                while self.condition(condition)? {
                    match self.exec_block(body, out)? {
                        Flow::Break => break,
                        Flow::Return => return Ok(Flow::Return),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            StatementKind::Function(function) => self.define_function(Arc::clone(function)),
            StatementKind::Return(value) => {
                if let Some(pipeline) = value {
                    let items = self.run_pipeline(pipeline)?;
                    out.extend(items);
                }
                return Ok(Flow::Return);
            }
            StatementKind::Throw(value) => {
                let message = match value {
                    Some(pipeline) => ShellValue::collapse(self.run_pipeline(pipeline)?).to_text(),
                    None => "ScriptHalted".to_string(),
                };
                return Err(Fault::Thrown { message, line });
            }
            StatementKind::Break => return Ok(Flow::Break),
            StatementKind::Continue => return Ok(Flow::Continue),
        }
        Ok(Flow::Normal)
    }

    fn condition(&mut self, pipeline: &Pipeline) -> Exec<bool> {
        Ok(ShellValue::collapse(self.run_pipeline(pipeline)?).is_truthy())
    }

    pub(crate) fn run_pipeline(&mut self, pipeline: &Pipeline) -> Exec<Vec<ShellValue>> {
        let mut input: Option<Vec<ShellValue>> = None;
        for stage in &pipeline.stages {
            let output = match stage {
                Stage::Expr(expr) => self.eval(expr)?.into_items(),
                Stage::Command(command) => self.invoke_command(command, input.take())?,
            };
            input = Some(output);
        }
        Ok(input.unwrap_or_default())
    }

    fn invoke_command(
        &mut self,
        command: &Command,
        input: Option<Vec<ShellValue>>,
    ) -> Exec<Vec<ShellValue>> {
        let mut args = Vec::with_capacity(command.args.len());
        for arg in &command.args {
            args.push(match arg {
                Arg::Flag(name) => ArgValue::Flag(name.clone()),
                Arg::Value(expr) => ArgValue::Value(self.eval(expr)?),
            });
        }

        let key = command.name.to_ascii_lowercase();
        let function = self
            .functions
            .get(&key)
            .or_else(|| self.session_functions.get(&key))
            .cloned();
        if let Some(function) = function {
            return self.call_function(&function, args, input.unwrap_or_default(), command.line);
        }
        match Builtin::lookup(&key) {
            Some(builtin) => self.run_builtin(builtin, args, input, command.line),
            None => Err(fail(
                format!(
                    "The term '{}' is not recognized as a name of a command or function.",
                    command.name
                ),
                command.line,
            )),
        }
    }

    fn call_function(
        &mut self,
        function: &FunctionDef,
        args: Vec<ArgValue>,
        input: Vec<ShellValue>,
        line: usize,
    ) -> Exec<Vec<ShellValue>> {
        let mut named: HashMap<String, ShellValue> = HashMap::new();
        let mut positional = Vec::new();
        let mut args = args.into_iter().peekable();
        while let Some(arg) = args.next() {
            match arg {
                ArgValue::Flag(flag) => {
                    let Some(param) = function
                        .params
                        .iter()
                        .find(|p| p.name.eq_ignore_ascii_case(&flag))
                    else {
                        return Err(fail(
                            format!("A parameter cannot be found that matches parameter name '{flag}'."),
                            line,
                        ));
                    };
                    let value = match args.peek() {
                        Some(ArgValue::Value(_)) => match args.next() {
                            Some(ArgValue::Value(value)) => value,
                            _ => ShellValue::Bool(true),
                        },
                        _ => ShellValue::Bool(true),
                    };
                    named.insert(param.name.to_ascii_lowercase(), value);
                }
                ArgValue::Value(value) => positional.push(value),
            }
        }

        self.depth += 1;
        if self.depth > self.limits.max_call_depth {
            self.depth -= 1;
            self.exceeded = true;
            return Err(fail(
                format!(
                    "The script failed due to call depth overflow (maximum {})",
                    self.limits.max_call_depth
                ),
                line,
            ));
        }
        self.scopes.push(HashMap::new());
        let result = self.run_function_body(function, named, positional, input);
        self.scopes.pop();
        self.depth -= 1;
        result
    }

    fn run_function_body(
        &mut self,
        function: &FunctionDef,
        mut named: HashMap<String, ShellValue>,
        positional: Vec<ShellValue>,
        input: Vec<ShellValue>,
    ) -> Exec<Vec<ShellValue>> {
        let mut positional = positional.into_iter();
        for param in &function.params {
            let key = param.name.to_ascii_lowercase();
            let value = match named.remove(&key) {
                Some(value) => value,
                None => match positional.next() {
                    Some(value) => value,
                    None => match &param.default {
                        Some(default) => self.eval(default)?,
                        None => ShellValue::Null,
                    },
                },
            };
            self.define(&key, value);
        }
        self.define("args", ShellValue::Array(positional.collect()));
        self.define("input", ShellValue::Array(input));

        let mut out = Vec::new();
        self.exec_block(&function.body, &mut out)?;
        Ok(out)
    }

    /// Run a script block once per item with `$_` bound in the current scope
    pub(crate) fn invoke_block(
        &mut self,
        block: &Block,
        item: ShellValue,
        out: &mut Vec<ShellValue>,
    ) -> Exec<Flow> {
        let previous = self
            .scopes
            .last_mut()
            .and_then(|scope| scope.insert("_".to_string(), item));
        let result = self.exec_block(block, out);
        if let Some(scope) = self.scopes.last_mut() {
            match previous {
                Some(value) => scope.insert("_".to_string(), value),
                None => scope.remove("_"),
            };
        }
        result
    }

    pub(crate) fn eval(&mut self, expr: &Expr) -> Exec<ShellValue> {
        let line = expr.line;
        self.tick(line)?;

        let value = match &expr.kind {
            ExprKind::Null => ShellValue::Null,
            ExprKind::Bool(b) => ShellValue::Bool(*b),
            ExprKind::Int(i) => ShellValue::Int(*i),
            ExprKind::Double(d) => ShellValue::Double(*d),
            ExprKind::Str(s) => ShellValue::Str(s.clone()),
            ExprKind::Expandable(parts) => {
                let mut text = String::new();
                for part in parts {
                    match part {
                        StrPart::Text(t) => text.push_str(t),
                        StrPart::Variable(name) => text.push_str(&self.lookup(name).to_text()),
                        StrPart::SubExpr(block) => {
                            let mut out = Vec::new();
                            self.exec_block(block, &mut out)?;
                            text.push_str(&ShellValue::collapse(out).to_text());
                        }
                    }
                }
                self.check_size(ShellValue::Str(text), line)?
            }
            ExprKind::Variable(name) => self.lookup(name),
            ExprKind::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item)?);
                }
                ShellValue::Array(values)
            }
            ExprKind::Paren(pipeline) => ShellValue::collapse(self.run_pipeline(pipeline)?),
            ExprKind::SubExpr(block) => {
                let mut out = Vec::new();
                self.exec_block(block, &mut out)?;
                ShellValue::collapse(out)
            }
            ExprKind::ArrayExpr(block) => {
                let mut out = Vec::new();
                self.exec_block(block, &mut out)?;
                ShellValue::Array(out)
            }
            ExprKind::Hashtable(entries) => {
                let mut table = Table::new();
                for (key, pipeline) in entries {
                    let value = ShellValue::collapse(self.run_pipeline(pipeline)?);
                    table.insert(key.clone(), value);
                }
                ShellValue::Table(table)
            }
            ExprKind::ScriptBlock(block) => ShellValue::Block(Arc::clone(block)),
            ExprKind::Member { target, name } => self.eval(target)?.member(name),
            ExprKind::Method { target, name, args } => {
                let target = self.eval(target)?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                let result = call_method(&target, name, &values, line)?;
                self.check_size(result, line)?
            }
            ExprKind::Index { target, index } => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                match index {
                    ShellValue::Array(indices) => {
                        ShellValue::Array(indices.iter().map(|i| target.index(i)).collect())
                    }
                    index => target.index(&index),
                }
            }
            ExprKind::Cast { ty, operand } => {
                let operand = self.eval(operand)?;
                cast(*ty, operand, line)?
            }
            ExprKind::Unary { op, operand } => {
                let operand = self.eval(operand)?;
                match op {
                    UnaryOp::Not => ShellValue::Bool(!operand.is_truthy()),
                    UnaryOp::Negate => value::subtract(&ShellValue::Int(0), &operand)
                        .map_err(|message| fail(message, line))?,
                }
            }
            ExprKind::Binary { op, left, right } => match op {
                BinaryOp::And => {
                    let result = self.eval(left)?.is_truthy() && self.eval(right)?.is_truthy();
                    ShellValue::Bool(result)
                }
                BinaryOp::Or => {
                    let result = self.eval(left)?.is_truthy() || self.eval(right)?.is_truthy();
                    ShellValue::Bool(result)
                }
                _ => {
                    let left = self.eval(left)?;
                    let right = self.eval(right)?;
                    self.binary(*op, left, right, line)?
                }
            },
            ExprKind::Range { start, end } => {
                let start_value = self.eval(start)?;
                let end_value = self.eval(end)?;
                let (Some(from), Some(to)) = (start_value.to_int(), end_value.to_int()) else {
                    return Err(fail("Range bounds must be numbers", line));
                };
                if from.abs_diff(to) >= self.limits.max_operations {
                    self.exceeded = true;
                    return Err(fail("Range is larger than the operation limit", line));
                }
                let items: Vec<ShellValue> = if from <= to {
                    (from..=to).map(ShellValue::Int).collect()
                } else {
                    (to..=from).rev().map(ShellValue::Int).collect()
                };
                ShellValue::Array(items)
            }
        };
        Ok(value)
    }

    fn binary(
        &mut self,
        op: BinaryOp,
        left: ShellValue,
        right: ShellValue,
        line: usize,
    ) -> Exec<ShellValue> {
        let arithmetic = |result: Result<ShellValue, String>| result.map_err(|m| fail(m, line));

        let ordering = |l: &ShellValue, r: &ShellValue| {
            value::compare(l, r).ok_or_else(|| {
                fail(
                    format!(
                        "Cannot compare \"{}\" because it is not comparable",
                        l.to_text()
                    ),
                    line,
                )
            })
        };

        let result = match op {
            BinaryOp::Add => {
                let sum = arithmetic(value::add(&left, &right))?;
                self.check_size(sum, line)?
            }
            BinaryOp::Subtract => arithmetic(value::subtract(&left, &right))?,
            BinaryOp::Multiply => {
                self.check_repeat(&left, &right, line)?;
                let product = arithmetic(value::multiply(&left, &right))?;
                self.check_size(product, line)?
            }
            BinaryOp::Divide => arithmetic(value::divide(&left, &right))?,
            BinaryOp::Remainder => arithmetic(value::remainder(&left, &right))?,
            BinaryOp::Eq => filter(left, |l| Ok(value::equals(l, &right)))?,
            BinaryOp::Ne => filter(left, |l| Ok(!value::equals(l, &right)))?,
            BinaryOp::Gt => filter(left, |l| Ok(ordering(l, &right)?.is_gt()))?,
            BinaryOp::Ge => filter(left, |l| Ok(ordering(l, &right)?.is_ge()))?,
            BinaryOp::Lt => filter(left, |l| Ok(ordering(l, &right)?.is_lt()))?,
            BinaryOp::Le => filter(left, |l| Ok(ordering(l, &right)?.is_le()))?,
            BinaryOp::Like | BinaryOp::NotLike => {
                let pattern = wildcard(&right.to_text(), line)?;
                let negate = op == BinaryOp::NotLike;
                filter(left, |l| Ok(pattern.is_match(&l.to_text()) != negate))?
            }
            BinaryOp::Match | BinaryOp::NotMatch => {
                let pattern = regex(&right.to_text(), line)?;
                let negate = op == BinaryOp::NotMatch;
                match left {
                    ShellValue::Array(_) => {
                        filter(left, |l| Ok(pattern.is_match(&l.to_text()) != negate))?
                    }
                    scalar => {
                        let text = scalar.to_text();
                        let captures = pattern.captures(&text);
                        if let Some(captures) = &captures {
                            let mut matches = Table::new();
                            for (i, group) in captures.iter().enumerate() {
                                if let Some(group) = group {
                                    matches.insert(i.to_string(), ShellValue::Str(group.as_str().to_string()));
                                }
                            }
                            for name in pattern.capture_names().flatten() {
                                if let Some(group) = captures.name(name) {
                                    matches.insert(name, ShellValue::Str(group.as_str().to_string()));
                                }
                            }
                            self.define("matches", ShellValue::Table(matches));
                        }
                        ShellValue::Bool(captures.is_some() != negate)
                    }
                }
            }
            BinaryOp::Contains | BinaryOp::NotContains => {
                let found = left.into_items().iter().any(|item| value::equals(item, &right));
                ShellValue::Bool(found == (op == BinaryOp::Contains))
            }
            BinaryOp::In | BinaryOp::NotIn => {
                let found = right.into_items().iter().any(|item| value::equals(item, &left));
                ShellValue::Bool(found == (op == BinaryOp::In))
            }
            BinaryOp::Replace => {
                let (pattern, replacement) = match right {
                    ShellValue::Array(parts) => (
                        parts.first().map(ShellValue::to_text).unwrap_or_default(),
                        parts.get(1).map(ShellValue::to_text).unwrap_or_default(),
                    ),
                    single => (single.to_text(), String::new()),
                };
                let pattern = regex(&pattern, line)?;
                let replace = |item: &ShellValue| {
                    ShellValue::Str(pattern.replace_all(&item.to_text(), replacement.as_str()).into_owned())
                };
                match left {
                    ShellValue::Array(items) => ShellValue::Array(items.iter().map(replace).collect()),
                    scalar => self.check_size(replace(&scalar), line)?,
                }
            }
            BinaryOp::Join => {
                let separator = right.to_text();
                let joined = left
                    .into_items()
                    .iter()
                    .map(ShellValue::to_text)
                    .collect::<Vec<_>>()
                    .join(&separator);
                self.check_size(ShellValue::Str(joined), line)?
            }
            BinaryOp::Split => {
                let pattern = regex(&right.to_text(), line)?;
                ShellValue::Array(
                    pattern
                        .split(&left.to_text())
                        .map(|part| ShellValue::Str(part.to_string()))
                        .collect(),
                )
            }
            BinaryOp::Xor => ShellValue::Bool(left.is_truthy() != right.is_truthy()),
            BinaryOp::And => ShellValue::Bool(left.is_truthy() && right.is_truthy()),
            BinaryOp::Or => ShellValue::Bool(left.is_truthy() || right.is_truthy()),
        };
        Ok(result)
    }

    fn assign(&mut self, target: &Target, op: AssignOp, value: ShellValue, line: usize) -> Exec<()> {
        let combine = |current: &ShellValue, value: ShellValue| -> Exec<ShellValue> {
            match op {
                AssignOp::Set => Ok(value),
                AssignOp::Add => value::add(current, &value).map_err(|m| fail(m, line)),
                AssignOp::Subtract => value::subtract(current, &value).map_err(|m| fail(m, line)),
            }
        };

        if target.path.is_empty() {
            let current = self.lookup(&target.variable);
            let value = combine(&current, value)?;
            let value = self.check_size(value, line)?;
            self.define(&target.variable, value);
            return Ok(());
        }

        let mut path = Vec::with_capacity(target.path.len());
        for accessor in &target.path {
            path.push(match accessor {
                Accessor::Member(name) => ShellValue::Str(name.clone()),
                Accessor::Index(expr) => self.eval(expr)?,
            });
        }

        let key = target.variable.to_ascii_lowercase();
        let in_scope = self.scopes.iter().rposition(|scope| scope.contains_key(&key));
        let scope_index = match in_scope {
            Some(index) => index,
            None => {
                let Some(seed) = self.session_variables.get(&key).cloned() else {
                    return Err(fail(
                        format!("The variable '${}' cannot be indexed because it has not been set.", target.variable),
                        line,
                    ));
                };
                self.define(&key, seed);
                self.scopes.len() - 1
            }
        };
        let Some(slot) = self.scopes[scope_index].get_mut(&key) else {
            return Err(fail(format!("The variable '${}' has not been set.", target.variable), line));
        };
        let mut update = |current: &ShellValue| combine(current, value.clone());
        assign_path(slot, &path, &mut update, line)
    }
}

/// Walk `path` below `slot`, creating missing table entries, and replace the leaf
fn assign_path(
    slot: &mut ShellValue,
    path: &[ShellValue],
    update: &mut dyn FnMut(&ShellValue) -> Exec<ShellValue>,
    line: usize,
) -> Exec<()> {
    let Some((step, rest)) = path.split_first() else {
        *slot = update(slot)?;
        return Ok(());
    };
    match slot {
        ShellValue::Table(table) => {
            let name = step.to_text();
            if !table.contains_key(&name) {
                let empty = if rest.is_empty() {
                    ShellValue::Null
                } else {
                    ShellValue::Table(Table::new())
                };
                table.insert(name.clone(), empty);
            }
            match table.get_mut(&name) {
                Some(next) => assign_path(next, rest, update, line),
                None => Err(fail(format!("The property '{name}' cannot be found on this object."), line)),
            }
        }
        ShellValue::Array(items) => {
            let position = array_position(items.len(), step)
                .ok_or_else(|| fail("Index was outside the bounds of the array.", line))?;
            assign_path(&mut items[position], rest, update, line)
        }
        other => Err(fail(
            format!(
                "The property '{}' cannot be found on a {} value.",
                step.to_text(),
                other.type_name()
            ),
            line,
        )),
    }
}

/// Comparison operators filter when the left operand is a collection
fn filter(left: ShellValue, mut test: impl FnMut(&ShellValue) -> Exec<bool>) -> Exec<ShellValue> {
    match left {
        ShellValue::Array(items) => {
            let mut kept = Vec::new();
            for item in items {
                if test(&item)? {
                    kept.push(item);
                }
            }
            Ok(ShellValue::Array(kept))
        }
        scalar => Ok(ShellValue::Bool(test(&scalar)?)),
    }
}

fn array_position(len: usize, index: &ShellValue) -> Option<usize> {
    let i = index.to_int()?;
    let i = if i < 0 { len as i64 + i } else { i };
    usize::try_from(i).ok().filter(|i| *i < len)
}

fn regex(pattern: &str, line: usize) -> Exec<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|err| fail(format!("Invalid regular expression pattern: {err}"), line))
}

fn wildcard(pattern: &str, line: usize) -> Exec<Regex> {
    let mut translated = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => translated.push_str(".*"),
            '?' => translated.push('.'),
            other => translated.push_str(&regex::escape(&other.to_string())),
        }
    }
    translated.push('$');
    regex(&translated, line)
}

fn cast(ty: CastType, value: ShellValue, line: usize) -> Exec<ShellValue> {
    let invalid = |value: &ShellValue, name: &str| {
        fail(
            format!("Cannot convert value \"{}\" to type [{name}].", value.to_text()),
            line,
        )
    };
    Ok(match ty {
        CastType::Int => ShellValue::Int(value.to_int().ok_or_else(|| invalid(&value, "int"))?),
        CastType::Double => ShellValue::Double(value.to_double().ok_or_else(|| invalid(&value, "double"))?),
        CastType::String => ShellValue::Str(value.to_text()),
        CastType::Bool => ShellValue::Bool(value.is_truthy()),
        CastType::Array => ShellValue::Array(value.into_items()),
        CastType::Hashtable => match value {
            ShellValue::Table(table) => ShellValue::Table(table),
            ShellValue::Null => ShellValue::Table(Table::new()),
            other => return Err(invalid(&other, "hashtable")),
        },
    })
}

fn call_method(target: &ShellValue, name: &str, args: &[ShellValue], line: usize) -> Exec<ShellValue> {
    let arg = |i: usize| -> Exec<&ShellValue> {
        args.get(i).ok_or_else(|| {
            fail(
                format!("Cannot find an overload for \"{name}\" and the argument count: \"{}\".", args.len()),
                line,
            )
        })
    };
    let text = |i: usize| -> Exec<String> { arg(i).map(ShellValue::to_text) };
    let int = |i: usize| -> Exec<i64> {
        let value = arg(i)?;
        value
            .to_int()
            .ok_or_else(|| fail(format!("Cannot convert \"{}\" to an integer.", value.to_text()), line))
    };

    let lower = name.to_ascii_lowercase();
    let value = match (target, lower.as_str()) {
        (_, "tostring") => ShellValue::Str(target.to_text()),
        (ShellValue::Str(s), "toupper" | "toupperinvariant") => ShellValue::Str(s.to_uppercase()),
        (ShellValue::Str(s), "tolower" | "tolowerinvariant") => ShellValue::Str(s.to_lowercase()),
        (ShellValue::Str(s), "trim") => ShellValue::Str(s.trim().to_string()),
        (ShellValue::Str(s), "trimstart") => ShellValue::Str(s.trim_start().to_string()),
        (ShellValue::Str(s), "trimend") => ShellValue::Str(s.trim_end().to_string()),
        (ShellValue::Str(s), "contains") => ShellValue::Bool(s.contains(&text(0)?)),
        (ShellValue::Str(s), "startswith") => ShellValue::Bool(s.starts_with(&text(0)?)),
        (ShellValue::Str(s), "endswith") => ShellValue::Bool(s.ends_with(&text(0)?)),
        (ShellValue::Str(s), "replace") => ShellValue::Str(s.replace(&text(0)?, &text(1)?)),
        (ShellValue::Str(s), "split") => {
            let separator = text(0)?;
            let parts: Vec<ShellValue> = if separator.is_empty() {
                vec![ShellValue::Str(s.clone())]
            } else {
                s.split(separator.as_str())
                    .map(|part| ShellValue::Str(part.to_string()))
                    .collect()
            };
            ShellValue::Array(parts)
        }
        (ShellValue::Str(s), "indexof") => {
            let needle = text(0)?;
            ShellValue::Int(
                s.find(&needle)
                    .map(|byte| s[..byte].chars().count() as i64)
                    .unwrap_or(-1),
            )
        }
        (ShellValue::Str(s), "substring") => {
            let chars: Vec<char> = s.chars().collect();
            let start = usize::try_from(int(0)?).ok().filter(|start| *start <= chars.len());
            let Some(start) = start else {
                return Err(fail("startIndex cannot be larger than length of string.", line));
            };
            let end = if args.len() > 1 {
                usize::try_from(int(1)?)
                    .ok()
                    .map(|len| start + len)
                    .filter(|end| *end <= chars.len())
                    .ok_or_else(|| fail("Index and length must refer to a location within the string.", line))?
            } else {
                chars.len()
            };
            ShellValue::Str(chars[start..end].iter().collect())
        }
        (ShellValue::Table(table), "containskey") => ShellValue::Bool(table.contains_key(&text(0)?)),
        (ShellValue::Array(items), "contains") => {
            let needle = arg(0)?;
            ShellValue::Bool(items.iter().any(|item| value::equals(item, needle)))
        }
        _ => {
            return Err(fail(
                format!(
                    "Method invocation failed because [{}] does not contain a method named '{name}'.",
                    target.type_name()
                ),
                line,
            ))
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::parser;

    fn run_with(source: &str, limits: &ScriptLimits) -> (Exec<Vec<ShellValue>>, bool) {
        let script = parser::parse(source).unwrap();
        let variables = HashMap::new();
        let functions = HashMap::new();
        let mut sink = ResponseSink::new();
        let mut interpreter = Interpreter::new(&variables, &functions, &mut sink, limits);
        let result = interpreter.run(&script.body);
        let exceeded = interpreter.limit_exceeded();
        (result, exceeded)
    }

    fn output(source: &str) -> Vec<ShellValue> {
        match run_with(source, &ScriptLimits::default()).0 {
            Ok(items) => items,
            Err(fault) => panic!("script failed: {fault:?}"),
        }
    }

    fn text(items: Vec<ShellValue>) -> Vec<String> {
        items.iter().map(ShellValue::to_text).collect()
    }

    #[test]
    fn test_variables_and_strings() {
        assert_eq!(
            text(output("$name = 'ann'\n\"Hello, $name! $($name.Length * 2)\"")),
            vec!["Hello, ann! 6"]
        );
    }

    #[test]
    fn test_functions_and_scopes() {
        let source = r#"
function Add-Numbers($a, $b = 10) {
    $result = $a + $b
    return $result
}
$result = 'outer'
Add-Numbers 1 2
Add-Numbers -a 5
$result
"#;
        assert_eq!(text(output(source)), vec!["3", "15", "outer"]);
    }

    #[test]
    fn test_loops() {
        let source = r#"
$total = 0
foreach ($i in 1..10) {
    if ($i % 2 -eq 0) { continue }
    if ($i -gt 7) { break }
    $total += $i
}
$n = 0
while ($n -lt 3) { $n += 1 }
"$total $n"
"#;
        assert_eq!(text(output(source)), vec!["16 3"]);
    }

    #[test]
    fn test_collections() {
        let source = r#"
$user = @{ Name = 'ann'; Roles = @('admin', 'dev') }
$user.Age = 30
$user.Roles -contains 'ADMIN'
$user['age']
(1, 2, 3, 4) -gt 2
'a-b-c' -split '-' -join '+'
'Server01' -like 'server*'
'user=ann' -match 'user=(?<who>\w+)'
$matches.who
"#;
        assert_eq!(
            text(output(source)),
            vec!["True", "30", "3", "4", "a+b+c", "True", "True", "ann"]
        );
    }

    #[test]
    fn test_throw_is_a_distinct_fault() {
        match run_with("throw 'no access'", &ScriptLimits::default()).0 {
            Err(Fault::Thrown { message, line }) => {
                assert_eq!(message, "no access");
                assert_eq!(line, 1);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_limits_mark_exceeded() {
        let limits = ScriptLimits {
            max_operations: 1_000,
            ..ScriptLimits::default()
        };
        let (result, exceeded) = run_with("while ($true) { }", &limits);
        assert!(result.is_err());
        assert!(exceeded);

        let (result, exceeded) = run_with(
            "function Recurse($n) { Recurse ($n + 1) }\nRecurse 1",
            &ScriptLimits::default(),
        );
        assert!(result.is_err());
        assert!(exceeded);

        let (result, exceeded) = run_with("$x = 1 / 0", &ScriptLimits::default());
        assert!(result.is_err());
        assert!(!exceeded);
    }

    #[test]
    fn test_string_repeat_is_bounded_before_allocating() {
        let limits = ScriptLimits {
            max_string_size: 64,
            ..ScriptLimits::default()
        };

        let (result, exceeded) = run_with("$s = 'ab' * 9223372036854775807", &limits);
        assert!(matches!(result, Err(Fault::Error(ScriptError::Runtime { .. }))));
        assert!(exceeded);

        let (result, exceeded) = run_with("$s = 'ab' * 33", &limits);
        assert!(result.is_err());
        assert!(exceeded);

        let (result, exceeded) = run_with("'ab' * 32", &limits);
        assert_eq!(text(result.unwrap()), vec!["ab".repeat(32)]);
        assert!(!exceeded);
    }

    #[test]
    fn test_unknown_command() {
        match run_with("Get-Nothing", &ScriptLimits::default()).0 {
            Err(Fault::Error(ScriptError::Runtime { message, line })) => {
                assert!(message.contains("Get-Nothing"));
                assert_eq!(line, Some(1));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
