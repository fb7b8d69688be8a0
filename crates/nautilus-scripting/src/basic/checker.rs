//! BASIC semantic checks
//!
//! Resolves every name against locals, bindings, built-ins and functions and
//! applies strict typing: narrowing and cross-family conversions are errors.
//! Only `Object` is late-bound.

use crate::basic::ast::*;
use crate::basic::builtins::{self, Intrinsic, Signature};
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::handler::ResultKind;
use std::collections::HashMap;

/// Check a handler body and its libraries
///
/// `bindings` maps lower-cased binding names to their declared types.
/// Unused-local warnings are only reported for otherwise clean programs.
pub(crate) fn check(
    program: &Program,
    libraries: &[(String, Program)],
    bindings: &HashMap<String, Type>,
    result_kind: ResultKind,
) -> Diagnostics {
    let mut checker = Checker {
        functions: HashMap::new(),
        bindings,
        scopes: Vec::new(),
        context: Context::Body,
        for_depth: 0,
        while_depth: 0,
        result_kind,
        origin: None,
        diagnostics: Diagnostics::new(),
        unused: Vec::new(),
    };

    for (name, library) in libraries {
        checker.origin = Some(name.as_str());
        if !library.body.is_empty() {
            checker.diagnostics.push(Diagnostic::warning(format!(
                "in module '{name}': top-level statements are ignored"
            )));
        }
        checker.register(&library.functions);
    }
    checker.origin = None;
    checker.register(&program.functions);

    for (name, library) in libraries {
        checker.origin = Some(name.as_str());
        for function in &library.functions {
            checker.function(function);
        }
    }
    checker.origin = None;
    for function in &program.functions {
        checker.function(function);
    }

    checker.context = Context::Body;
    checker.scopes.push(Vec::new());
    checker.block(&program.body);
    checker.pop_scope();

    if result_kind == ResultKind::Verdict && !contains_return(&program.body) {
        checker.diagnostics.push(
            Diagnostic::warning("Validator body does not return a value on all code paths.")
                .with_code("BC42105"),
        );
    }

    let mut diagnostics = checker.diagnostics;
    if !diagnostics.has_errors() {
        for warning in checker.unused {
            diagnostics.push(warning);
        }
    }
    diagnostics
}

fn contains_return(stmts: &[Stmt]) -> bool {
    stmts.iter().any(|stmt| match &stmt.kind {
        StmtKind::Return(_) => true,
        StmtKind::If { branches, otherwise } => {
            branches.iter().any(|(_, body)| contains_return(body)) || contains_return(otherwise)
        }
        StmtKind::For { body, .. } | StmtKind::While { body, .. } => contains_return(body),
        _ => false,
    })
}

#[derive(Debug, Clone, Copy)]
enum Context {
    Body,
    /// Return type; `None` inside a `Sub`
    Function(Option<Type>),
}

struct Local {
    name: String,
    ty: Type,
    pos: Pos,
    used: bool,
}

struct Checker<'a> {
    functions: HashMap<String, &'a Function>,
    bindings: &'a HashMap<String, Type>,
    scopes: Vec<Vec<Local>>,
    context: Context,
    for_depth: usize,
    while_depth: usize,
    result_kind: ResultKind,
    origin: Option<&'a str>,
    diagnostics: Diagnostics,
    unused: Vec<Diagnostic>,
}

impl<'a> Checker<'a> {
    fn located(&self, diagnostic: Diagnostic, pos: Pos) -> Diagnostic {
        match self.origin {
            Some(module) => Diagnostic {
                message: format!(
                    "in module '{module}': {} ({}:{})",
                    diagnostic.message, pos.line, pos.column
                ),
                ..diagnostic
            },
            None => diagnostic.at(pos.line, pos.column),
        }
    }

    fn error(&mut self, pos: Pos, code: &str, message: impl Into<String>) {
        let diagnostic = self.located(Diagnostic::error(message).with_code(code), pos);
        self.diagnostics.push(diagnostic);
    }

    fn warning(&mut self, pos: Pos, code: &str, message: impl Into<String>) {
        let diagnostic = self.located(Diagnostic::warning(message).with_code(code), pos);
        self.diagnostics.push(diagnostic);
    }

    fn register(&mut self, functions: &'a [Function]) {
        for function in functions {
            let key = function.name.to_ascii_lowercase();
            if self.functions.contains_key(&key) {
                self.error(
                    function.pos,
                    "BC30269",
                    format!("'{}' has multiple definitions with identical signatures.", function.name),
                );
                continue;
            }
            if Intrinsic::lookup(&function.name).is_some() {
                self.error(
                    function.pos,
                    "BC30183",
                    format!("'{}' is a built-in object and cannot be redeclared.", function.name),
                );
                continue;
            }
            self.functions.insert(key, function);
        }
    }

    fn function(&mut self, function: &Function) {
        self.context = Context::Function(function.return_type);
        let mut params: Vec<Local> = Vec::new();
        for param in &function.params {
            if params.iter().any(|p| p.name.eq_ignore_ascii_case(&param.name)) {
                self.error(
                    param.pos,
                    "BC30237",
                    format!("Parameter already declared with name '{}'.", param.name),
                );
                continue;
            }
            params.push(Local {
                name: param.name.clone(),
                ty: param.ty,
                pos: param.pos,
                used: true,
            });
        }
        self.scopes.push(params);
        self.block(&function.body);
        self.pop_scope();
    }

    fn pop_scope(&mut self) {
        let Some(scope) = self.scopes.pop() else {
            return;
        };
        if self.origin.is_some() {
            return;
        }
        for local in scope.into_iter().filter(|l| !l.used) {
            self.unused.push(
                Diagnostic::warning(format!("Unused local variable: '{}'.", local.name))
                    .at(local.pos.line, local.pos.column)
                    .with_code("BC42024"),
            );
        }
    }

    fn declare(&mut self, name: &str, ty: Type, pos: Pos, used: bool) {
        if Intrinsic::lookup(name).is_some() {
            self.error(
                pos,
                "BC30183",
                format!("'{name}' is a built-in object and cannot be redeclared."),
            );
            return;
        }
        let exists = self
            .scopes
            .last()
            .map(|scope| scope.iter().any(|l| l.name.eq_ignore_ascii_case(name)))
            .unwrap_or(false);
        if exists {
            self.error(
                pos,
                "BC30288",
                format!("Local variable '{name}' is already declared in the current block."),
            );
            return;
        }
        if self.bindings.contains_key(&name.to_ascii_lowercase()) {
            self.warning(
                pos,
                "BC42025",
                format!("Local variable '{name}' hides the binding of the same name."),
            );
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.push(Local {
                name: name.to_string(),
                ty,
                pos,
                used,
            });
        }
    }

    fn local(&mut self, name: &str) -> Option<Type> {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(local) = scope.iter_mut().find(|l| l.name.eq_ignore_ascii_case(name)) {
                local.used = true;
                return Some(local.ty);
            }
        }
        None
    }

    fn binding(&self, name: &str) -> Option<Type> {
        self.bindings.get(&name.to_ascii_lowercase()).copied()
    }

    fn user_function(&self, name: &str) -> Option<&'a Function> {
        self.functions.get(&name.to_ascii_lowercase()).copied()
    }

    fn block(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.stmt(stmt);
        }
    }

    fn scoped_block(&mut self, stmts: &[Stmt]) {
        self.scopes.push(Vec::new());
        self.block(stmts);
        self.pop_scope();
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Dim { name, ty, init } => {
                let init_ty = init.as_ref().map(|e| (self.value(e), e.pos));
                let ty = match (*ty, init_ty) {
                    (Some(declared), Some((actual, pos))) => {
                        self.convert(actual, declared, pos);
                        declared
                    }
                    (Some(declared), None) => declared,
                    (None, Some((actual, _))) => actual,
                    (None, None) => Type::Object,
                };
                self.declare(name, ty, stmt.pos, false);
            }
            StmtKind::Assign { target, value } => {
                let target_ty = self.assign_target(target);
                let value_ty = self.value(value);
                if let Some(target_ty) = target_ty {
                    self.convert(value_ty, target_ty, value.pos);
                }
            }
            StmtKind::If { branches, otherwise } => {
                for (cond, body) in branches {
                    self.condition(cond);
                    self.scoped_block(body);
                }
                self.scoped_block(otherwise);
            }
            StmtKind::For {
                var,
                declared,
                start,
                end,
                step,
                body,
            } => {
                self.scopes.push(Vec::new());
                let bounds: Vec<(Type, Pos)> = std::iter::once(start)
                    .chain(std::iter::once(end))
                    .chain(step.iter())
                    .map(|bound| (self.value(bound), bound.pos))
                    .collect();
                let var_ty = match declared {
                    Some(ty) => {
                        self.loop_type(*ty, stmt.pos);
                        self.declare(var, *ty, stmt.pos, true);
                        *ty
                    }
                    None => self.loop_variable(var, bounds[0].0, stmt.pos),
                };
                for (ty, pos) in bounds {
                    self.convert(ty, var_ty, pos);
                }
                self.for_depth += 1;
                self.block(body);
                self.for_depth -= 1;
                self.pop_scope();
            }
            StmtKind::While { cond, body } => {
                self.condition(cond);
                self.while_depth += 1;
                self.scoped_block(body);
                self.while_depth -= 1;
            }
            StmtKind::Return(value) => self.return_stmt(value.as_ref(), stmt.pos),
            StmtKind::Exit(kind) => self.exit_stmt(*kind, stmt.pos),
            StmtKind::Call(expr) => self.call_stmt(expr),
        }
    }

    fn loop_type(&mut self, ty: Type, pos: Pos) {
        if !ty.is_numeric() && ty != Type::Object {
            self.error(
                pos,
                "BC30337",
                format!("'For' loop control variable cannot be of type '{ty}'."),
            );
        }
    }

    /// Existing local, or a new one inferred from the start value
    fn loop_variable(&mut self, var: &str, inferred: Type, pos: Pos) -> Type {
        if let Some(ty) = self.local(var) {
            self.loop_type(ty, pos);
            return ty;
        }
        if self.binding(var).is_some() {
            self.error(pos, "BC30526", format!("'{var}' is ReadOnly."));
            return Type::Object;
        }
        self.loop_type(inferred, pos);
        self.declare(var, inferred, pos, true);
        inferred
    }

    fn return_stmt(&mut self, value: Option<&Expr>, pos: Pos) {
        match (self.context, value) {
            (Context::Function(None), Some(_)) => self.error(
                pos,
                "BC30647",
                "'Return' statement in a Sub cannot return a value.",
            ),
            (Context::Function(None), None) => {}
            (Context::Function(Some(_)), None) => self.error(
                pos,
                "BC30654",
                "'Return' statement in a Function must return a value.",
            ),
            (Context::Function(Some(ty)), Some(expr)) => {
                let actual = self.value(expr);
                self.convert(actual, ty, expr.pos);
            }
            (Context::Body, value) => match (self.result_kind, value) {
                (ResultKind::Response, Some(_)) => self.error(
                    pos,
                    "BC30647",
                    "'Return' in a route handler cannot return a value; write to Response instead.",
                ),
                (ResultKind::Verdict, None) => {
                    self.error(pos, "BC30654", "A validator must return a Boolean value.")
                }
                (ResultKind::Verdict, Some(expr)) => {
                    let actual = self.value(expr);
                    self.convert(actual, Type::Boolean, expr.pos);
                }
                (ResultKind::Claims, Some(expr)) => {
                    let actual = self.value(expr);
                    if actual != Type::Object {
                        self.error(
                            expr.pos,
                            "BC30311",
                            format!("Claims must be returned as a map or an array, not '{actual}'."),
                        );
                    }
                }
                (_, None) => {}
            },
        }
    }

    fn exit_stmt(&mut self, kind: ExitKind, pos: Pos) {
        let valid = match kind {
            ExitKind::For => self.for_depth > 0,
            ExitKind::While => self.while_depth > 0,
            ExitKind::Function => matches!(self.context, Context::Function(Some(_))),
            ExitKind::Sub => matches!(self.context, Context::Function(None) | Context::Body),
        };
        if !valid {
            let (code, scope) = match kind {
                ExitKind::For => ("BC30096", "a 'For' statement"),
                ExitKind::While => ("BC30097", "a 'While' statement"),
                ExitKind::Function => ("BC30067", "a Function"),
                ExitKind::Sub => ("BC30065", "a Sub or handler body"),
            };
            self.error(pos, code, format!("'Exit {kind}' can only appear inside {scope}."));
        }
    }

    fn call_stmt(&mut self, expr: &Expr) {
        let callable = match &expr.kind {
            ExprKind::Call { .. } => true,
            ExprKind::Name(name) if self.local(name).is_none() => {
                self.user_function(name).is_some()
                    || matches!(builtins::function(name), Some(Signature::Method { .. }))
            }
            ExprKind::Member { object, member } => match intrinsic_of(object) {
                Some(intrinsic) => matches!(
                    builtins::intrinsic_member(intrinsic, member),
                    Some(Signature::Method { .. })
                ),
                None => false,
            },
            _ => false,
        };
        if !callable {
            self.error(expr.pos, "BC30454", "Expression is not a method.");
            return;
        }
        self.expr(expr);
    }

    fn assign_target(&mut self, target: &Expr) -> Option<Type> {
        match &target.kind {
            ExprKind::Name(name) => {
                if let Some(ty) = self.local(name) {
                    return Some(ty);
                }
                if Intrinsic::lookup(name).is_some() {
                    self.error(
                        target.pos,
                        "BC30068",
                        format!("'{name}' is a built-in object and cannot be assigned."),
                    );
                } else if self.binding(name).is_some() {
                    self.error(target.pos, "BC30526", format!("'{name}' is ReadOnly."));
                } else if self.user_function(name).is_some() {
                    self.error(
                        target.pos,
                        "BC30068",
                        "Expression is a value and therefore cannot be the target of an assignment.",
                    );
                } else {
                    self.error(target.pos, "BC30451", format!("'{name}' is not declared."));
                }
                None
            }
            ExprKind::Member { object, member } => {
                if let Some(intrinsic) = intrinsic_of(object) {
                    return match builtins::intrinsic_member(intrinsic, member) {
                        Some(Signature::Property { ty, writable: true }) => Some(ty),
                        Some(Signature::Property { .. }) => {
                            self.error(
                                target.pos,
                                "BC30526",
                                format!("Property '{member}' is ReadOnly."),
                            );
                            None
                        }
                        Some(Signature::Method { .. }) => {
                            self.error(
                                target.pos,
                                "BC30068",
                                "Expression is a value and therefore cannot be the target of an assignment.",
                            );
                            None
                        }
                        None => {
                            self.not_a_member(target.pos, member, intrinsic.name());
                            None
                        }
                    };
                }
                if !rooted_in_local(object, &self.scopes) {
                    self.error(
                        target.pos,
                        "BC30068",
                        "Only members of local variables can be assigned.",
                    );
                    return None;
                }
                match self.value(object) {
                    Type::Object => Some(Type::Object),
                    other => {
                        self.not_a_member(target.pos, member, &other.to_string());
                        None
                    }
                }
            }
            _ => {
                self.error(
                    target.pos,
                    "BC30068",
                    "Expression is a value and therefore cannot be the target of an assignment.",
                );
                None
            }
        }
    }

    fn not_a_member(&mut self, pos: Pos, member: &str, owner: &str) {
        self.error(pos, "BC30456", format!("'{member}' is not a member of '{owner}'."));
    }

    fn condition(&mut self, cond: &Expr) {
        let ty = self.value(cond);
        if ty != Type::Boolean && ty != Type::Object {
            self.error(
                cond.pos,
                "BC30311",
                format!("Value of type '{ty}' cannot be converted to 'Boolean'."),
            );
        }
    }

    fn convert(&mut self, from: Type, to: Type, pos: Pos) {
        use Type::*;
        match (from, to) {
            _ if from == to || from == Object || to == Object => {}
            (Integer, Double) => {}
            (Double, Integer) | (String, Integer | Double) | (Integer | Double, String) => self.error(
                pos,
                "BC30512",
                format!("Option Strict On disallows implicit conversions from '{from}' to '{to}'."),
            ),
            _ => self.error(
                pos,
                "BC30311",
                format!("Value of type '{from}' cannot be converted to '{to}'."),
            ),
        }
    }

    /// Type of an expression that must produce a value
    fn value(&mut self, expr: &Expr) -> Type {
        match self.expr(expr) {
            Some(ty) => ty,
            None => {
                self.error(expr.pos, "BC30491", "Expression does not produce a value.");
                Type::Object
            }
        }
    }

    /// Type of an expression; `None` when it produces no value
    fn expr(&mut self, expr: &Expr) -> Option<Type> {
        let ty = match &expr.kind {
            ExprKind::Integer(_) => Type::Integer,
            ExprKind::Double(_) => Type::Double,
            ExprKind::Str(_) => Type::String,
            ExprKind::Bool(_) => Type::Boolean,
            ExprKind::Nothing => Type::Object,
            ExprKind::Name(name) => return self.name(name, expr.pos),
            ExprKind::Member { object, member } => return self.member(object, member, expr.pos),
            ExprKind::Call { callee, args } => return self.call(callee, args, expr.pos),
            ExprKind::Unary { op, operand } => {
                let ty = self.value(operand);
                match (op, ty) {
                    (_, Type::Object) => Type::Object,
                    (UnaryOp::Neg, ty) if ty.is_numeric() => ty,
                    (UnaryOp::Not, Type::Boolean | Type::Integer) => ty,
                    _ => {
                        let symbol = if *op == UnaryOp::Neg { "-" } else { "Not" };
                        self.error(
                            expr.pos,
                            "BC30487",
                            format!("Operator '{symbol}' is not defined for type '{ty}'."),
                        );
                        Type::Object
                    }
                }
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let left = self.value(lhs);
                let right = self.value(rhs);
                self.binary(*op, left, right, expr.pos)
            }
        };
        Some(ty)
    }

    fn name(&mut self, name: &str, pos: Pos) -> Option<Type> {
        if let Some(ty) = self.local(name) {
            return Some(ty);
        }
        if let Some(ty) = self.binding(name) {
            return Some(ty);
        }
        if let Some(intrinsic) = Intrinsic::lookup(name) {
            self.error(
                pos,
                "BC30109",
                format!("'{}' is a built-in object and cannot be used as a value.", intrinsic.name()),
            );
            return Some(Type::Object);
        }
        if self.user_function(name).is_some() || builtins::function(name).is_some() {
            return self.call_named(name, &[], pos);
        }
        self.error(
            pos,
            "BC30451",
            format!("'{name}' is not declared. It may be inaccessible due to its protection level."),
        );
        Some(Type::Object)
    }

    fn member(&mut self, object: &Expr, member: &str, pos: Pos) -> Option<Type> {
        if let Some(intrinsic) = intrinsic_of(object) {
            return match builtins::intrinsic_member(intrinsic, member) {
                Some(Signature::Property { ty, .. }) => Some(ty),
                Some(Signature::Method {
                    params,
                    required,
                    returns,
                }) => {
                    self.arguments(params, required, &[], member, pos);
                    returns
                }
                None => {
                    self.not_a_member(pos, member, intrinsic.name());
                    Some(Type::Object)
                }
            };
        }
        match self.value(object) {
            Type::Object => Some(Type::Object),
            Type::String => match builtins::string_member(member) {
                Some(Signature::Property { ty, .. }) => Some(ty),
                Some(Signature::Method {
                    params,
                    required,
                    returns,
                }) => {
                    self.arguments(params, required, &[], member, pos);
                    returns
                }
                None => {
                    self.not_a_member(pos, member, "String");
                    Some(Type::Object)
                }
            },
            other => {
                self.not_a_member(pos, member, &other.to_string());
                Some(Type::Object)
            }
        }
    }

    fn call(&mut self, callee: &Expr, args: &[Expr], pos: Pos) -> Option<Type> {
        match &callee.kind {
            ExprKind::Name(name) if self.local(name).is_none() && self.binding(name).is_none() => {
                self.call_named(name, args, pos)
            }
            ExprKind::Member { object, member } => {
                if let Some(intrinsic) = intrinsic_of(object) {
                    return match builtins::intrinsic_member(intrinsic, member) {
                        Some(Signature::Method {
                            params,
                            required,
                            returns,
                        }) => {
                            self.arguments(params, required, args, member, pos);
                            returns
                        }
                        Some(Signature::Property { ty: Type::Object, .. }) => self.index(args),
                        Some(Signature::Property { .. }) => {
                            self.error(pos, "BC30454", "Expression is not a method.");
                            Some(Type::Object)
                        }
                        None => {
                            self.not_a_member(pos, member, intrinsic.name());
                            Some(Type::Object)
                        }
                    };
                }
                match self.value(object) {
                    Type::Object => self.index(args),
                    Type::String => match builtins::string_member(member) {
                        Some(Signature::Method {
                            params,
                            required,
                            returns,
                        }) => {
                            self.arguments(params, required, args, member, pos);
                            returns
                        }
                        Some(Signature::Property { .. }) => {
                            self.error(pos, "BC30454", "Expression is not a method.");
                            Some(Type::Object)
                        }
                        None => {
                            self.not_a_member(pos, member, "String");
                            Some(Type::Object)
                        }
                    },
                    other => {
                        self.not_a_member(pos, member, &other.to_string());
                        Some(Type::Object)
                    }
                }
            }
            _ => match self.value(callee) {
                Type::Object => self.index(args),
                other => {
                    self.error(
                        pos,
                        "BC30367",
                        format!("Class '{other}' cannot be indexed because it has no default property."),
                    );
                    Some(Type::Object)
                }
            },
        }
    }

    fn call_named(&mut self, name: &str, args: &[Expr], pos: Pos) -> Option<Type> {
        if let Some(function) = self.user_function(name) {
            let params: Vec<Type> = function.params.iter().map(|p| p.ty).collect();
            self.arguments(&params, params.len(), args, &function.name, pos);
            return function.return_type;
        }
        if let Some(Signature::Method {
            params,
            required,
            returns,
        }) = builtins::function(name)
        {
            self.arguments(params, required, args, name, pos);
            return returns;
        }
        for arg in args {
            self.value(arg);
        }
        self.error(
            pos,
            "BC30451",
            format!("'{name}' is not declared. It may be inaccessible due to its protection level."),
        );
        Some(Type::Object)
    }

    /// Late-bound indexing into an `Object`
    fn index(&mut self, args: &[Expr]) -> Option<Type> {
        for arg in args {
            self.value(arg);
        }
        Some(Type::Object)
    }

    fn arguments(&mut self, params: &[Type], required: usize, args: &[Expr], name: &str, pos: Pos) {
        if args.len() > params.len() {
            self.error(pos, "BC30057", format!("Too many arguments to '{name}'."));
        } else if args.len() < required {
            self.error(
                pos,
                "BC30455",
                format!(
                    "Argument not specified for parameter {} of '{name}'.",
                    args.len() + 1
                ),
            );
        }
        for (index, arg) in args.iter().enumerate() {
            let actual = self.value(arg);
            if let Some(expected) = params.get(index) {
                self.convert(actual, *expected, arg.pos);
            }
        }
    }

    fn binary(&mut self, op: BinaryOp, left: Type, right: Type, pos: Pos) -> Type {
        use Type::*;
        let late_bound = left == Object || right == Object;
        let numeric = left.is_numeric() && right.is_numeric();
        let widened = if left == Integer && right == Integer {
            Integer
        } else {
            Double
        };

        let result = match op {
            BinaryOp::Concat => Some(String),
            BinaryOp::Add if late_bound => Some(Object),
            BinaryOp::Add if left == String && right == String => Some(String),
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Mod if numeric => Some(widened),
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Mod if late_bound => Some(Object),
            BinaryOp::Div | BinaryOp::Pow if numeric || late_bound => Some(Double),
            BinaryOp::IntDiv if numeric || late_bound => Some(Integer),
            _ if op.is_comparison() => {
                let comparable = late_bound || numeric || left == right;
                comparable.then_some(Boolean)
            }
            BinaryOp::And | BinaryOp::Or => match (left, right) {
                (Boolean, Boolean) => Some(Boolean),
                (Integer, Integer) => Some(Integer),
                (Object, Boolean) | (Boolean, Object) => Some(Boolean),
                (Object, _) | (_, Object) => Some(Object),
                _ => None,
            },
            BinaryOp::AndAlso | BinaryOp::OrElse => {
                let ok = |t: Type| t == Boolean || t == Object;
                (ok(left) && ok(right)).then_some(Boolean)
            }
            _ => None,
        };

        match result {
            Some(ty) => ty,
            None => {
                self.error(
                    pos,
                    "BC30452",
                    format!("Operator '{op}' is not defined for types '{left}' and '{right}'."),
                );
                if op.is_comparison() || op.is_logical() {
                    Boolean
                } else {
                    Object
                }
            }
        }
    }
}

/// Host object named directly, e.g. `Response` in `Response.Status`
pub(crate) fn intrinsic_of(expr: &Expr) -> Option<Intrinsic> {
    match &expr.kind {
        ExprKind::Name(name) => Intrinsic::lookup(name),
        _ => None,
    }
}

fn rooted_in_local(expr: &Expr, scopes: &[Vec<Local>]) -> bool {
    match &expr.kind {
        ExprKind::Name(name) => scopes
            .iter()
            .any(|scope| scope.iter().any(|l| l.name.eq_ignore_ascii_case(name))),
        ExprKind::Member { object, .. } => rooted_in_local(object, scopes),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::lexer::Lexer;
    use crate::basic::parser::parse;

    fn check_source(source: &str, kind: ResultKind) -> Diagnostics {
        let bindings = HashMap::from([
            ("greeting".to_string(), Type::String),
            ("limit".to_string(), Type::Integer),
        ]);
        check_with(source, &[], &bindings, kind)
    }

    fn check_with(
        source: &str,
        libraries: &[(String, Program)],
        bindings: &HashMap<String, Type>,
        kind: ResultKind,
    ) -> Diagnostics {
        let (program, diagnostics) = parse(Lexer::new(source).tokenize().unwrap());
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        check(&program, libraries, bindings, kind)
    }

    fn codes(diagnostics: &Diagnostics) -> Vec<String> {
        diagnostics
            .iter()
            .filter_map(|d| d.code.clone())
            .collect()
    }

    #[test]
    fn test_clean_handler() {
        let source = r#"
Function Shout(s As String) As String
    Return UCase(s) & "!"
End Function

Dim count As Integer = Len(Request.Query("name"))
If count > limit Then
    Response.Status = 400
Else
    Response.Write(Shout(greeting) & " " & count)
End If
"#;
        let diagnostics = check_source(source, ResultKind::Response);
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
    }

    #[test]
    fn test_strict_conversions() {
        let diagnostics = check_source("Dim x As Integer = \"text\"", ResultKind::Response);
        assert_eq!(codes(&diagnostics), vec!["BC30512"]);

        let diagnostics = check_source("Dim b As Boolean = 1", ResultKind::Response);
        assert_eq!(codes(&diagnostics), vec!["BC30311"]);

        let diagnostics = check_source("Dim d As Double = 1\nResponse.Write(d)", ResultKind::Response);
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn test_undeclared_and_members() {
        let diagnostics = check_source(
            "Response.Write(missing)\nResponse.Colour = 1\nRequest.Path = \"/\"",
            ResultKind::Response,
        );
        assert_eq!(codes(&diagnostics), vec!["BC30451", "BC30456", "BC30526"]);
        let lines: Vec<usize> = diagnostics.iter().map(|d| d.location.unwrap().line).collect();
        assert_eq!(lines, vec![1, 2, 3]);
    }

    #[test]
    fn test_bindings_are_read_only() {
        let diagnostics = check_source("limit = 3", ResultKind::Response);
        assert_eq!(codes(&diagnostics), vec!["BC30526"]);
    }

    #[test]
    fn test_operator_and_arity_errors() {
        let diagnostics = check_source(
            "Dim x = 1 + \"a\"\nResponse.Write(Left(\"abc\"))\nResponse.Write(Len(\"a\", \"b\"))",
            ResultKind::Response,
        );
        assert_eq!(codes(&diagnostics), vec!["BC30452", "BC30455", "BC30057"]);
    }

    #[test]
    fn test_return_rules() {
        assert_eq!(
            codes(&check_source("Return 1", ResultKind::Response)),
            vec!["BC30647"]
        );
        assert!(check_source("Return greeting = \"hi\"", ResultKind::Verdict).is_empty());
        assert_eq!(
            codes(&check_source("Return 5", ResultKind::Verdict)),
            vec!["BC30311"]
        );
        assert_eq!(
            codes(&check_source("Response.Status = 401", ResultKind::Verdict)),
            vec!["BC42105"]
        );
        assert!(check_source("AddClaim(\"role\", \"admin\")\nReturn Nothing", ResultKind::Claims).is_empty());
        assert_eq!(
            codes(&check_source("Sub S()\n Return 1\nEnd Sub\nFunction F() As Integer\n Return\nEnd Function", ResultKind::Response)),
            vec!["BC30647", "BC30654"]
        );
    }

    #[test]
    fn test_exit_placement() {
        let diagnostics = check_source(
            "For i = 1 To 3\nNext\nExit For\nWhile True\n Exit While\nEnd While",
            ResultKind::Response,
        );
        assert_eq!(codes(&diagnostics), vec!["BC30096"]);
    }

    #[test]
    fn test_unused_only_when_clean() {
        let diagnostics = check_source("Dim tmp As Integer\nResponse.Status = 200", ResultKind::Response);
        assert_eq!(codes(&diagnostics), vec!["BC42024"]);
        assert!(!diagnostics.has_errors());

        let diagnostics = check_source("Dim tmp As Integer\nResponse.Status = \"x\"", ResultKind::Response);
        assert_eq!(codes(&diagnostics), vec!["BC30512"]);
    }

    #[test]
    fn test_duplicates() {
        let diagnostics = check_source(
            "Dim a = 1\nDim a = 2\nResponse.Write(a)\nSub A()\nEnd Sub\nSub a()\nEnd Sub",
            ResultKind::Response,
        );
        assert_eq!(codes(&diagnostics), vec!["BC30269", "BC30288"]);
    }

    #[test]
    fn test_library_functions() {
        let (library, _) = parse(
            Lexer::new("Function Twice(n As Integer) As Integer\n Return n * \"2\"\nEnd Function")
                .tokenize()
                .unwrap(),
        );
        let libraries = vec![("math".to_string(), library)];
        let diagnostics = check_with(
            "Response.Write(Twice(2))",
            &libraries,
            &HashMap::new(),
            ResultKind::Response,
        );
        let error = diagnostics.errors().next().unwrap();
        assert!(error.message.starts_with("in module 'math':"));
        assert!(error.location.is_none());
    }

    #[test]
    fn test_late_bound_objects() {
        let diagnostics = check_source(
            "Dim data = ParseJson(Request.Body)\ndata.count = data.count + 1\nResponse.Json(data.items(0))",
            ResultKind::Response,
        );
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
    }
}
