//! BASIC tree-walking interpreter
//!
//! Runs checked programs. Every statement and expression counts against the
//! operation limit; user function calls count against the call depth.

use crate::basic::ast::*;
use crate::basic::builtins::Intrinsic;
use crate::basic::checker::intrinsic_of;
use crate::compiler::ScriptLimits;
use crate::context::{Claim, Cookie, ExecutionContext, Identity, ResponseBody, ResponseSink};
use crate::error::{Result, ScriptError};
use serde_json::Value as Json;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Runtime value
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Value {
    Nothing,
    Integer(i64),
    Double(f64),
    Str(String),
    Boolean(bool),
    /// Arrays and maps; scalars are always unwrapped
    Json(Json),
}

impl Value {
    pub(crate) fn from_json(value: &Json) -> Self {
        match value {
            Json::Null => Self::Nothing,
            Json::Bool(b) => Self::Boolean(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Double(n.as_f64().unwrap_or_default()),
            },
            Json::String(s) => Self::Str(s.clone()),
            other => Self::Json(other.clone()),
        }
    }

    pub(crate) fn to_json(&self) -> Json {
        match self {
            Self::Nothing => Json::Null,
            Self::Integer(n) => Json::from(*n),
            Self::Double(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Self::Str(s) => Json::String(s.clone()),
            Self::Boolean(b) => Json::Bool(*b),
            Self::Json(value) => value.clone(),
        }
    }

    pub(crate) fn to_text(&self) -> String {
        match self {
            Self::Nothing => String::new(),
            Self::Integer(n) => n.to_string(),
            Self::Double(n) => n.to_string(),
            Self::Str(s) => s.clone(),
            Self::Boolean(true) => "True".to_string(),
            Self::Boolean(false) => "False".to_string(),
            Self::Json(value) => value.to_string(),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::Nothing => "Nothing",
            Self::Integer(_) => "Integer",
            Self::Double(_) => "Double",
            Self::Str(_) => "String",
            Self::Boolean(_) => "Boolean",
            Self::Json(_) => "Object",
        }
    }

    fn default_for(ty: Type) -> Self {
        match ty {
            Type::Integer => Self::Integer(0),
            Type::Double => Self::Double(0.0),
            Type::Boolean => Self::Boolean(false),
            Type::String | Type::Object => Self::Nothing,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(n) => n as f64,
            Num::Float(n) => n,
        }
    }
}

fn parse_number(text: &str) -> Option<Num> {
    let text = text.trim();
    if let Ok(n) = text.parse::<i64>() {
        return Some(Num::Int(n));
    }
    text.parse::<f64>().ok().map(Num::Float)
}

fn round_to_integer(n: f64) -> Option<i64> {
    let rounded = n.round();
    (rounded.is_finite() && rounded >= i64::MIN as f64 && rounded <= i64::MAX as f64)
        .then_some(rounded as i64)
}

/// Convert a value to a declared type
fn coerce(value: Value, ty: Type) -> std::result::Result<Value, String> {
    let invalid = |value: &Value| {
        format!(
            "Conversion from {} \"{}\" to type '{ty}' is not valid.",
            value.type_name(),
            value.to_text()
        )
    };
    match (ty, value) {
        (Type::Object, value) => Ok(value),

        (Type::Integer, Value::Integer(n)) => Ok(Value::Integer(n)),
        (Type::Integer, Value::Double(n)) => round_to_integer(n)
            .map(Value::Integer)
            .ok_or_else(|| "Arithmetic operation resulted in an overflow.".to_string()),
        (Type::Integer, Value::Boolean(b)) => Ok(Value::Integer(if b { -1 } else { 0 })),
        (Type::Integer, Value::Nothing) => Ok(Value::Integer(0)),
        (Type::Integer, Value::Str(s)) => match parse_number(&s) {
            Some(Num::Int(n)) => Ok(Value::Integer(n)),
            Some(Num::Float(n)) => round_to_integer(n)
                .map(Value::Integer)
                .ok_or_else(|| "Arithmetic operation resulted in an overflow.".to_string()),
            None => Err(invalid(&Value::Str(s))),
        },

        (Type::Double, Value::Integer(n)) => Ok(Value::Double(n as f64)),
        (Type::Double, Value::Double(n)) => Ok(Value::Double(n)),
        (Type::Double, Value::Boolean(b)) => Ok(Value::Double(if b { -1.0 } else { 0.0 })),
        (Type::Double, Value::Nothing) => Ok(Value::Double(0.0)),
        (Type::Double, Value::Str(s)) => match parse_number(&s) {
            Some(n) => Ok(Value::Double(n.as_f64())),
            None => Err(invalid(&Value::Str(s))),
        },

        (Type::String, Value::Nothing) => Ok(Value::Nothing),
        (Type::String, value) => Ok(Value::Str(value.to_text())),

        (Type::Boolean, Value::Boolean(b)) => Ok(Value::Boolean(b)),
        (Type::Boolean, Value::Integer(n)) => Ok(Value::Boolean(n != 0)),
        (Type::Boolean, Value::Double(n)) => Ok(Value::Boolean(n != 0.0)),
        (Type::Boolean, Value::Nothing) => Ok(Value::Boolean(false)),
        (Type::Boolean, Value::Str(s)) => {
            if s.trim().eq_ignore_ascii_case("true") {
                Ok(Value::Boolean(true))
            } else if s.trim().eq_ignore_ascii_case("false") {
                Ok(Value::Boolean(false))
            } else {
                match parse_number(&s) {
                    Some(n) => Ok(Value::Boolean(n.as_f64() != 0.0)),
                    None => Err(invalid(&Value::Str(s))),
                }
            }
        }

        (_, value) => Err(invalid(&value)),
    }
}

/// Case-sensitive key first, then case-insensitive
fn json_field<'v>(map: &'v serde_json::Map<String, Json>, key: &str) -> Option<&'v Json> {
    map.get(key).or_else(|| {
        map.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    })
}

fn json_field_mut<'v>(
    map: &'v mut serde_json::Map<String, Json>,
    key: &str,
) -> Option<&'v mut Json> {
    let existing = if map.contains_key(key) {
        Some(key.to_string())
    } else {
        map.keys().find(|k| k.eq_ignore_ascii_case(key)).cloned()
    };
    existing.and_then(move |k| map.get_mut(&k))
}

enum Flow {
    Next,
    Return(Value),
    ExitFor,
    ExitWhile,
    ExitFunction,
}

struct Slot {
    value: Value,
    ty: Type,
}

/// Executes one invocation of a BASIC program
pub(crate) struct Interpreter<'a> {
    functions: &'a HashMap<String, Function>,
    globals: HashMap<String, Value>,
    ctx: &'a ExecutionContext,
    sink: &'a mut ResponseSink,
    limits: &'a ScriptLimits,
    identity: Identity,
    claims: Vec<Claim>,
    operations: u64,
    depth: usize,
    scopes: Vec<HashMap<String, Slot>>,
}

impl<'a> Interpreter<'a> {
    pub(crate) fn new(
        functions: &'a HashMap<String, Function>,
        globals: HashMap<String, Value>,
        ctx: &'a ExecutionContext,
        sink: &'a mut ResponseSink,
        limits: &'a ScriptLimits,
    ) -> Self {
        Self {
            functions,
            globals,
            identity: ctx.identity.clone().unwrap_or_else(Identity::anonymous),
            ctx,
            sink,
            limits,
            claims: Vec::new(),
            operations: 0,
            depth: 0,
            scopes: Vec::new(),
        }
    }

    /// Run the handler body; returns the value of a top-level `Return`
    pub(crate) fn run(&mut self, body: &[Stmt]) -> Result<Value> {
        self.scopes = vec![HashMap::new()];
        match self.block(body)? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Value::Nothing),
        }
    }

    /// Claims added with `AddClaim`
    pub(crate) fn into_claims(self) -> Vec<Claim> {
        self.claims
    }

    fn fail(&self, pos: Pos, message: impl Into<String>) -> ScriptError {
        ScriptError::runtime_at(message, pos.line)
    }

    fn tick(&mut self, pos: Pos) -> Result<()> {
        self.operations += 1;
        if self.operations > self.limits.max_operations {
            return Err(self.fail(
                pos,
                format!(
                    "Script exceeded the maximum of {} operations",
                    self.limits.max_operations
                ),
            ));
        }
        Ok(())
    }

    fn text(&self, text: String, pos: Pos) -> Result<Value> {
        if text.len() > self.limits.max_string_size {
            return Err(self.fail(
                pos,
                format!(
                    "String exceeds the maximum length of {} bytes",
                    self.limits.max_string_size
                ),
            ));
        }
        Ok(Value::Str(text))
    }

    fn coerce(&self, value: Value, ty: Type, pos: Pos) -> Result<Value> {
        coerce(value, ty).map_err(|message| self.fail(pos, message))
    }

    fn truthy(&self, value: Value, pos: Pos) -> Result<bool> {
        match self.coerce(value, Type::Boolean, pos)? {
            Value::Boolean(b) => Ok(b),
            _ => Ok(false),
        }
    }

    fn slot(&mut self, name: &str) -> Option<&mut Slot> {
        let key = name.to_ascii_lowercase();
        self.scopes.iter_mut().rev().find_map(|scope| scope.get_mut(&key))
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        let key = name.to_ascii_lowercase();
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(&key))
            .map(|slot| slot.value.clone())
            .or_else(|| self.globals.get(&key).cloned())
    }

    fn declare(&mut self, name: &str, value: Value, ty: Type) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_ascii_lowercase(), Slot { value, ty });
        }
    }

    fn block(&mut self, stmts: &[Stmt]) -> Result<Flow> {
        for stmt in stmts {
            match self.stmt(stmt)? {
                Flow::Next => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Next)
    }

    fn scoped(&mut self, stmts: &[Stmt]) -> Result<Flow> {
        self.scopes.push(HashMap::new());
        let flow = self.block(stmts);
        self.scopes.pop();
        flow
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<Flow> {
        self.tick(stmt.pos)?;
        match &stmt.kind {
            StmtKind::Dim { name, ty, init } => {
                let ty = ty.unwrap_or(Type::Object);
                let value = match init {
                    Some(init) => {
                        let value = self.eval(init)?;
                        self.coerce(value, ty, init.pos)?
                    }
                    None => Value::default_for(ty),
                };
                self.declare(name, value, ty);
            }
            StmtKind::Assign { target, value } => {
                let value = self.eval(value)?;
                self.assign(target, value)?;
            }
            StmtKind::If { branches, otherwise } => {
                for (cond, body) in branches {
                    let value = self.eval(cond)?;
                    if self.truthy(value, cond.pos)? {
                        return self.scoped(body);
                    }
                }
                return self.scoped(otherwise);
            }
            StmtKind::For {
                var,
                declared,
                start,
                end,
                step,
                body,
            } => return self.for_loop(var, *declared, start, end, step.as_ref(), body, stmt.pos),
            StmtKind::While { cond, body } => loop {
                let value = self.eval(cond)?;
                if !self.truthy(value, cond.pos)? {
                    break;
                }
                match self.scoped(body)? {
                    Flow::Next => {}
                    Flow::ExitWhile => break,
                    flow => return Ok(flow),
                }
            },
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::Nothing,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::Exit(kind) => {
                return Ok(match kind {
                    ExitKind::For => Flow::ExitFor,
                    ExitKind::While => Flow::ExitWhile,
                    ExitKind::Function | ExitKind::Sub => Flow::ExitFunction,
                })
            }
            StmtKind::Call(expr) => {
                self.eval(expr)?;
            }
        }
        Ok(Flow::Next)
    }

    #[allow(clippy::too_many_arguments)]
    fn for_loop(
        &mut self,
        var: &str,
        declared: Option<Type>,
        start: &Expr,
        end: &Expr,
        step: Option<&Expr>,
        body: &[Stmt],
        pos: Pos,
    ) -> Result<Flow> {
        let start_value = self.eval(start)?;
        let end_value = self.eval(end)?;
        let step_value = match step {
            Some(step) => self.eval(step)?,
            None => Value::Integer(1),
        };
        let end_num = self.number(&end_value, end.pos)?.as_f64();
        let ascending = self.number(&step_value, pos)?.as_f64() >= 0.0;

        self.scopes.push(HashMap::new());
        let ty = match declared {
            Some(ty) => Some(ty),
            None => self.slot(var).map(|slot| slot.ty),
        };
        let ty = match ty {
            Some(ty) => {
                if declared.is_some() {
                    self.declare(var, Value::default_for(ty), ty);
                }
                ty
            }
            None => {
                let inferred = match start_value {
                    Value::Double(_) => Type::Double,
                    _ => Type::Integer,
                };
                self.declare(var, Value::default_for(inferred), inferred);
                inferred
            }
        };

        let mut current = self.coerce(start_value, ty, start.pos)?;
        let result = loop {
            self.tick(pos)?;
            if let Some(slot) = self.slot(var) {
                slot.value = current.clone();
            }
            let position = self.number(&current, pos)?.as_f64();
            let done = if ascending {
                position > end_num
            } else {
                position < end_num
            };
            if done {
                break Flow::Next;
            }
            match self.block(body)? {
                Flow::Next => {}
                Flow::ExitFor => break Flow::Next,
                flow => break flow,
            }
            let now = self.lookup(var).unwrap_or(Value::Nothing);
            let next = self.binary(BinaryOp::Add, now, step_value.clone(), pos)?;
            current = self.coerce(next, ty, pos)?;
        };
        self.scopes.pop();
        Ok(result)
    }

    fn assign(&mut self, target: &Expr, value: Value) -> Result<()> {
        match &target.kind {
            ExprKind::Name(name) => {
                let pos = target.pos;
                let ty = match self.slot(name) {
                    Some(slot) => slot.ty,
                    None => return Err(self.fail(pos, format!("'{name}' is ReadOnly."))),
                };
                let value = self.coerce(value, ty, pos)?;
                if let Some(slot) = self.slot(name) {
                    slot.value = value;
                }
                Ok(())
            }
            ExprKind::Member { object, member } => {
                if intrinsic_of(object) == Some(Intrinsic::Response) {
                    return self.set_response(member, value, target.pos);
                }
                let mut path = vec![member.as_str()];
                let mut root = object.as_ref();
                while let ExprKind::Member { object, member } = &root.kind {
                    path.push(member.as_str());
                    root = object.as_ref();
                }
                path.reverse();
                let ExprKind::Name(name) = &root.kind else {
                    return Err(self.fail(target.pos, "Only members of local variables can be assigned."));
                };
                self.assign_path(name, &path, value, target.pos)
            }
            _ => Err(self.fail(
                target.pos,
                "Expression is a value and therefore cannot be the target of an assignment.",
            )),
        }
    }

    fn assign_path(&mut self, name: &str, path: &[&str], value: Value, pos: Pos) -> Result<()> {
        let missing = self.fail(pos, "Object reference not set to an instance of an object.");
        let Some(slot) = self.slot(name) else {
            return Err(missing);
        };
        if slot.value == Value::Nothing {
            slot.value = Value::Json(Json::Object(serde_json::Map::new()));
        }
        let Value::Json(root) = &mut slot.value else {
            return Err(ScriptError::runtime_at(
                format!("'{name}' is not an object."),
                pos.line,
            ));
        };

        let mut node = root;
        for (index, key) in path.iter().enumerate() {
            let Json::Object(map) = node else {
                return Err(ScriptError::runtime_at(
                    format!("'{key}' cannot be set on a non-object value."),
                    pos.line,
                ));
            };
            if index == path.len() - 1 {
                match json_field_mut(map, key) {
                    Some(existing) => *existing = value.to_json(),
                    None => {
                        map.insert(key.to_string(), value.to_json());
                    }
                }
                return Ok(());
            }
            node = match json_field_mut(map, key) {
                Some(child) => child,
                None => return Err(missing),
            };
        }
        Ok(())
    }

    fn set_response(&mut self, member: &str, value: Value, pos: Pos) -> Result<()> {
        match member.to_ascii_lowercase().as_str() {
            "status" => {
                let Value::Integer(code) = self.coerce(value, Type::Integer, pos)? else {
                    return Err(self.fail(pos, "Status must be an integer."));
                };
                let status = u16::try_from(code)
                    .ok()
                    .filter(|s| (100..=999).contains(s))
                    .ok_or_else(|| self.fail(pos, format!("Invalid status code {code}.")))?;
                self.sink.set_status(status);
            }
            "contenttype" => self.sink.set_content_type(value.to_text()),
            "body" => self.sink.set_text(value.to_text()),
            other => return Err(self.fail(pos, format!("Property '{other}' is ReadOnly."))),
        }
        Ok(())
    }

    fn number(&self, value: &Value, pos: Pos) -> Result<Num> {
        match value {
            Value::Integer(n) => Ok(Num::Int(*n)),
            Value::Double(n) => Ok(Num::Float(*n)),
            Value::Boolean(b) => Ok(Num::Int(if *b { -1 } else { 0 })),
            Value::Nothing => Ok(Num::Int(0)),
            Value::Str(s) => parse_number(s).ok_or_else(|| {
                self.fail(pos, format!("Conversion from string \"{s}\" to type 'Double' is not valid."))
            }),
            Value::Json(_) => Err(self.fail(pos, "Object cannot be used as a number.")),
        }
    }

    fn eval_args(&mut self, args: &[Expr]) -> Result<Vec<Value>> {
        args.iter().map(|arg| self.eval(arg)).collect()
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value> {
        self.tick(expr.pos)?;
        let pos = expr.pos;
        match &expr.kind {
            ExprKind::Integer(n) => Ok(Value::Integer(*n)),
            ExprKind::Double(n) => Ok(Value::Double(*n)),
            ExprKind::Str(s) => Ok(Value::Str(s.clone())),
            ExprKind::Bool(b) => Ok(Value::Boolean(*b)),
            ExprKind::Nothing => Ok(Value::Nothing),
            ExprKind::Name(name) => match self.lookup(name) {
                Some(value) => Ok(value),
                None => self.call_named(name, Vec::new(), pos),
            },
            ExprKind::Member { object, member } => match intrinsic_of(object) {
                Some(intrinsic) => self.intrinsic_property(intrinsic, member, pos),
                None => {
                    let value = self.eval(object)?;
                    self.member_of(value, member, Vec::new(), pos)
                }
            },
            ExprKind::Call { callee, args } => self.call(callee, args, pos),
            ExprKind::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Neg => match self.number(&value, pos)? {
                        Num::Int(n) => n
                            .checked_neg()
                            .map(Value::Integer)
                            .ok_or_else(|| self.fail(pos, "Arithmetic operation resulted in an overflow.")),
                        Num::Float(n) => Ok(Value::Double(-n)),
                    },
                    UnaryOp::Not => match value {
                        Value::Integer(n) => Ok(Value::Integer(!n)),
                        other => Ok(Value::Boolean(!self.truthy(other, pos)?)),
                    },
                }
            }
            ExprKind::Binary { op, lhs, rhs } => match op {
                BinaryOp::AndAlso => {
                    let left = self.eval(lhs)?;
                    if !self.truthy(left, lhs.pos)? {
                        return Ok(Value::Boolean(false));
                    }
                    let right = self.eval(rhs)?;
                    Ok(Value::Boolean(self.truthy(right, rhs.pos)?))
                }
                BinaryOp::OrElse => {
                    let left = self.eval(lhs)?;
                    if self.truthy(left, lhs.pos)? {
                        return Ok(Value::Boolean(true));
                    }
                    let right = self.eval(rhs)?;
                    Ok(Value::Boolean(self.truthy(right, rhs.pos)?))
                }
                _ => {
                    let left = self.eval(lhs)?;
                    let right = self.eval(rhs)?;
                    self.binary(*op, left, right, pos)
                }
            },
        }
    }

    fn binary(&self, op: BinaryOp, left: Value, right: Value, pos: Pos) -> Result<Value> {
        let overflow = || self.fail(pos, "Arithmetic operation resulted in an overflow.");
        let divide_by_zero = || self.fail(pos, "Attempted to divide by zero.");

        match op {
            BinaryOp::Concat => return self.text(format!("{}{}", left.to_text(), right.to_text()), pos),
            BinaryOp::Add => {
                let stringy = |v: &Value| matches!(v, Value::Str(_) | Value::Nothing);
                if stringy(&left) && stringy(&right) && (matches!(left, Value::Str(_)) || matches!(right, Value::Str(_))) {
                    return self.text(format!("{}{}", left.to_text(), right.to_text()), pos);
                }
            }
            _ if op.is_comparison() => return self.compare(op, &left, &right, pos),
            BinaryOp::And | BinaryOp::Or => {
                if let (Value::Integer(a), Value::Integer(b)) = (&left, &right) {
                    return Ok(Value::Integer(if op == BinaryOp::And { a & b } else { a | b }));
                }
                let a = self.truthy(left, pos)?;
                let b = self.truthy(right, pos)?;
                return Ok(Value::Boolean(if op == BinaryOp::And { a && b } else { a || b }));
            }
            _ => {}
        }

        if matches!(left, Value::Json(_)) || matches!(right, Value::Json(_)) {
            return Err(self.fail(
                pos,
                format!(
                    "Operator '{op}' is not defined for types '{}' and '{}'.",
                    left.type_name(),
                    right.type_name()
                ),
            ));
        }

        let a = self.number(&left, pos)?;
        let b = self.number(&right, pos)?;
        match (op, a, b) {
            (BinaryOp::Add, Num::Int(a), Num::Int(b)) => a.checked_add(b).map(Value::Integer).ok_or_else(overflow),
            (BinaryOp::Sub, Num::Int(a), Num::Int(b)) => a.checked_sub(b).map(Value::Integer).ok_or_else(overflow),
            (BinaryOp::Mul, Num::Int(a), Num::Int(b)) => a.checked_mul(b).map(Value::Integer).ok_or_else(overflow),
            (BinaryOp::Mod, Num::Int(a), Num::Int(b)) => {
                if b == 0 {
                    return Err(divide_by_zero());
                }
                a.checked_rem(b).map(Value::Integer).ok_or_else(overflow)
            }
            (BinaryOp::Add, a, b) => Ok(Value::Double(a.as_f64() + b.as_f64())),
            (BinaryOp::Sub, a, b) => Ok(Value::Double(a.as_f64() - b.as_f64())),
            (BinaryOp::Mul, a, b) => Ok(Value::Double(a.as_f64() * b.as_f64())),
            (BinaryOp::Mod, a, b) => {
                if b.as_f64() == 0.0 {
                    return Err(divide_by_zero());
                }
                Ok(Value::Double(a.as_f64() % b.as_f64()))
            }
            (BinaryOp::Div, a, b) => {
                if b.as_f64() == 0.0 {
                    return Err(divide_by_zero());
                }
                Ok(Value::Double(a.as_f64() / b.as_f64()))
            }
            (BinaryOp::IntDiv, a, b) => {
                let a = round_to_integer(a.as_f64()).ok_or_else(overflow)?;
                let b = round_to_integer(b.as_f64()).ok_or_else(overflow)?;
                if b == 0 {
                    return Err(divide_by_zero());
                }
                a.checked_div(b).map(Value::Integer).ok_or_else(overflow)
            }
            (BinaryOp::Pow, a, b) => Ok(Value::Double(a.as_f64().powf(b.as_f64()))),
            _ => Err(self.fail(pos, format!("Operator '{op}' is not supported here."))),
        }
    }

    fn compare(&self, op: BinaryOp, left: &Value, right: &Value, pos: Pos) -> Result<Value> {
        if matches!(left, Value::Json(_)) || matches!(right, Value::Json(_)) {
            return match op {
                BinaryOp::Eq => Ok(Value::Boolean(left == right)),
                BinaryOp::Ne => Ok(Value::Boolean(left != right)),
                _ => Err(self.fail(pos, format!("Operator '{op}' is not defined for type 'Object'."))),
            };
        }

        let ordering = match (left, right) {
            (Value::Str(_) | Value::Nothing, Value::Str(_) | Value::Nothing) => {
                Some(left.to_text().cmp(&right.to_text()))
            }
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            _ => {
                let a = self.number(left, pos)?.as_f64();
                let b = self.number(right, pos)?.as_f64();
                a.partial_cmp(&b)
            }
        };

        let result = match ordering {
            None => op == BinaryOp::Ne,
            Some(ordering) => match op {
                BinaryOp::Eq => ordering == Ordering::Equal,
                BinaryOp::Ne => ordering != Ordering::Equal,
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                BinaryOp::Ge => ordering != Ordering::Less,
                _ => false,
            },
        };
        Ok(Value::Boolean(result))
    }

    fn call(&mut self, callee: &Expr, args: &[Expr], pos: Pos) -> Result<Value> {
        match &callee.kind {
            ExprKind::Name(name) => {
                let args = self.eval_args(args)?;
                match self.lookup(name) {
                    Some(value) => self.index(value, args, pos),
                    None => self.call_named(name, args, pos),
                }
            }
            ExprKind::Member { object, member } => {
                if let Some(intrinsic) = intrinsic_of(object) {
                    let args = self.eval_args(args)?;
                    return self.intrinsic_call(intrinsic, member, args, pos);
                }
                let value = self.eval(object)?;
                let args = self.eval_args(args)?;
                self.member_of(value, member, args, pos)
            }
            _ => {
                let value = self.eval(callee)?;
                let args = self.eval_args(args)?;
                self.index(value, args, pos)
            }
        }
    }

    fn call_named(&mut self, name: &str, args: Vec<Value>, pos: Pos) -> Result<Value> {
        let functions = self.functions;
        match functions.get(&name.to_ascii_lowercase()) {
            Some(function) => self.call_function(function, args, pos),
            None => self.builtin(name, args, pos),
        }
    }

    fn call_function(&mut self, function: &Function, args: Vec<Value>, pos: Pos) -> Result<Value> {
        if self.depth >= self.limits.max_call_depth {
            return Err(self.fail(
                pos,
                format!("Maximum call depth of {} exceeded", self.limits.max_call_depth),
            ));
        }

        let mut frame = HashMap::new();
        let mut args = args.into_iter();
        for param in &function.params {
            let value = match args.next() {
                Some(value) => self.coerce(value, param.ty, pos)?,
                None => Value::default_for(param.ty),
            };
            frame.insert(
                param.name.to_ascii_lowercase(),
                Slot {
                    value,
                    ty: param.ty,
                },
            );
        }

        let saved = std::mem::replace(&mut self.scopes, vec![frame]);
        self.depth += 1;
        let flow = self.block(&function.body);
        self.depth -= 1;
        self.scopes = saved;

        let Some(return_type) = function.return_type else {
            flow?;
            return Ok(Value::Nothing);
        };
        match flow? {
            Flow::Return(value) => self.coerce(value, return_type, pos),
            _ => Ok(Value::default_for(return_type)),
        }
    }

    /// Late-bound indexing: `items(0)`, `map("key")`
    fn index(&self, value: Value, args: Vec<Value>, pos: Pos) -> Result<Value> {
        let Some(key) = args.into_iter().next() else {
            return Ok(value);
        };
        match value {
            Value::Json(Json::Array(items)) => {
                let Value::Integer(i) = self.coerce(key, Type::Integer, pos)? else {
                    return Err(self.fail(pos, "Index must be an integer."));
                };
                usize::try_from(i)
                    .ok()
                    .and_then(|i| items.get(i))
                    .map(Value::from_json)
                    .ok_or_else(|| self.fail(pos, "Index was outside the bounds of the array."))
            }
            Value::Json(Json::Object(map)) => Ok(json_field(&map, &key.to_text())
                .map(Value::from_json)
                .unwrap_or(Value::Nothing)),
            Value::Nothing => Err(self.fail(pos, "Object reference not set to an instance of an object.")),
            other => Err(self.fail(
                pos,
                format!("'{}' cannot be indexed.", other.type_name()),
            )),
        }
    }

    /// Member access or method call on a runtime value
    fn member_of(&self, value: Value, member: &str, args: Vec<Value>, pos: Pos) -> Result<Value> {
        match value {
            Value::Str(s) => self.string_method(&s, member, args, pos),
            Value::Json(json) => {
                let lower = member.to_ascii_lowercase();
                let field = match &json {
                    Json::Object(map) => match json_field(map, member) {
                        Some(field) => Value::from_json(field),
                        None if lower == "count" || lower == "length" => Value::Integer(map.len() as i64),
                        None => Value::Nothing,
                    },
                    Json::Array(items) if lower == "count" || lower == "length" => {
                        Value::Integer(items.len() as i64)
                    }
                    _ => {
                        return Err(self.fail(pos, format!("'{member}' is not a member of 'Object'.")))
                    }
                };
                self.index(field, args, pos)
            }
            Value::Nothing => Err(self.fail(pos, "Object reference not set to an instance of an object.")),
            other => Err(self.fail(
                pos,
                format!("'{member}' is not a member of '{}'.", other.type_name()),
            )),
        }
    }

    fn string_method(&self, s: &str, member: &str, args: Vec<Value>, pos: Pos) -> Result<Value> {
        let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Nothing);
        match member.to_ascii_lowercase().as_str() {
            "length" => Ok(Value::Integer(s.chars().count() as i64)),
            "toupper" => Ok(Value::Str(s.to_uppercase())),
            "tolower" => Ok(Value::Str(s.to_lowercase())),
            "trim" => Ok(Value::Str(s.trim().to_string())),
            "contains" => Ok(Value::Boolean(s.contains(arg(0).to_text().as_str()))),
            "startswith" => Ok(Value::Boolean(s.starts_with(arg(0).to_text().as_str()))),
            "endswith" => Ok(Value::Boolean(s.ends_with(arg(0).to_text().as_str()))),
            "indexof" => {
                let needle = arg(0).to_text();
                Ok(Value::Integer(
                    s.find(&needle)
                        .map(|byte| s[..byte].chars().count() as i64)
                        .unwrap_or(-1),
                ))
            }
            "substring" => {
                let start = self.count_arg(arg(0), pos)?;
                let chars: Vec<char> = s.chars().collect();
                if start > chars.len() {
                    return Err(self.fail(pos, "startIndex cannot be larger than length of string."));
                }
                let end = match args.get(1) {
                    Some(len) => start + self.count_arg(len.clone(), pos)?,
                    None => chars.len(),
                };
                if end > chars.len() {
                    return Err(self.fail(pos, "Index and length must refer to a location within the string."));
                }
                Ok(Value::Str(chars[start..end].iter().collect()))
            }
            "replace" => {
                let from = arg(0).to_text();
                if from.is_empty() {
                    return Err(self.fail(pos, "String cannot be of zero length."));
                }
                self.text(s.replace(&from, &arg(1).to_text()), pos)
            }
            other => Err(self.fail(pos, format!("'{other}' is not a member of 'String'."))),
        }
    }

    /// Non-negative integer argument
    fn count_arg(&self, value: Value, pos: Pos) -> Result<usize> {
        match self.coerce(value, Type::Integer, pos)? {
            Value::Integer(n) if n >= 0 => Ok(n as usize),
            _ => Err(self.fail(pos, "Argument must be greater than or equal to zero.")),
        }
    }

    fn intrinsic_property(&mut self, intrinsic: Intrinsic, member: &str, pos: Pos) -> Result<Value> {
        let ctx = self.ctx;
        let request = &ctx.request;
        let value = match (intrinsic, member.to_ascii_lowercase().as_str()) {
            (Intrinsic::Request, "method") => Value::Str(request.method.clone()),
            (Intrinsic::Request, "path") => Value::Str(request.path.clone()),
            (Intrinsic::Request, "uri") => Value::Str(request.uri.clone()),
            (Intrinsic::Request, "body") => Value::Str(request.body_text()),
            (Intrinsic::Request, "remoteaddress") => request
                .remote_addr
                .clone()
                .map(Value::Str)
                .unwrap_or(Value::Nothing),
            (Intrinsic::Request, "json") => request
                .body_json()
                .map(|json| Value::from_json(&json))
                .unwrap_or(Value::Nothing),

            (Intrinsic::Response, "status") => Value::Integer(i64::from(self.sink.status())),
            (Intrinsic::Response, "contenttype") => self
                .sink
                .content_type()
                .map(|ct| Value::Str(ct.to_string()))
                .unwrap_or(Value::Nothing),
            (Intrinsic::Response, "body") => match self.sink.body() {
                ResponseBody::Text(text) => Value::Str(text.clone()),
                _ => Value::Nothing,
            },

            (Intrinsic::Identity, "name") => self
                .identity
                .name
                .clone()
                .map(Value::Str)
                .unwrap_or(Value::Nothing),
            (Intrinsic::Identity, "scheme") => self
                .identity
                .scheme
                .clone()
                .map(Value::Str)
                .unwrap_or(Value::Nothing),
            (Intrinsic::Identity, "isauthenticated") => Value::Boolean(self.identity.authenticated),

            _ => return self.intrinsic_call(intrinsic, member, Vec::new(), pos),
        };
        Ok(value)
    }

    fn intrinsic_call(
        &mut self,
        intrinsic: Intrinsic,
        member: &str,
        args: Vec<Value>,
        pos: Pos,
    ) -> Result<Value> {
        let text = |i: usize| args.get(i).map(Value::to_text).unwrap_or_default();
        let found = |v: Option<&str>| v.map(|s| Value::Str(s.to_string())).unwrap_or(Value::Nothing);
        let ctx = self.ctx;
        let request = &ctx.request;
        let lower = member.to_ascii_lowercase();

        let value = match (intrinsic, lower.as_str()) {
            (Intrinsic::Request, "query") => found(request.query(&text(0))),
            (Intrinsic::Request, "header") => found(request.header(&text(0))),
            (Intrinsic::Request, "cookie") => found(request.cookie(&text(0))),
            (Intrinsic::Request, "param") => found(request.param(&text(0))),
            (Intrinsic::Request, "form") => found(request.form_value(&text(0))),
            (Intrinsic::Request, _) => {
                let property = self.intrinsic_property(intrinsic, member, pos)?;
                return self.index(property, args, pos);
            }

            (Intrinsic::Response, "write") => {
                let text = text(0);
                let written = match self.sink.body() {
                    ResponseBody::Text(existing) => existing.len(),
                    _ => 0,
                };
                if written + text.len() > self.limits.max_string_size {
                    return Err(self.fail(pos, "Response body exceeds the maximum string size."));
                }
                self.sink.write(&text);
                Value::Nothing
            }
            (Intrinsic::Response, "setheader") => {
                self.sink.set_header(text(0), text(1));
                Value::Nothing
            }
            (Intrinsic::Response, "appendheader") => {
                self.sink.append_header(text(0), text(1));
                Value::Nothing
            }
            (Intrinsic::Response, "setcookie") => {
                self.sink.add_cookie(Cookie::new(text(0), text(1)));
                Value::Nothing
            }
            (Intrinsic::Response, "redirect") => {
                self.sink.redirect(text(0), false);
                Value::Nothing
            }
            (Intrinsic::Response, "redirectpermanent") => {
                self.sink.redirect(text(0), true);
                Value::Nothing
            }
            (Intrinsic::Response, "json") => {
                let value = args.first().map(Value::to_json).unwrap_or(Json::Null);
                self.sink.set_json(&value)?;
                Value::Nothing
            }
            (Intrinsic::Response, "file") => {
                self.sink.set_file(text(0));
                Value::Nothing
            }

            (Intrinsic::Identity, "hasclaim") => {
                let expected = args.get(1).map(Value::to_text);
                Value::Boolean(self.identity.has_claim(&text(0), expected.as_deref()))
            }
            (Intrinsic::Identity, "claim") => found(self.identity.claim(&text(0))),

            _ => {
                return Err(self.fail(
                    pos,
                    format!("'{member}' is not a member of '{}'.", intrinsic.name()),
                ))
            }
        };
        Ok(value)
    }

    fn builtin(&mut self, name: &str, args: Vec<Value>, pos: Pos) -> Result<Value> {
        let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Nothing);
        let text = |i: usize| arg(i).to_text();

        let value = match name.to_ascii_lowercase().as_str() {
            "len" => Value::Integer(text(0).chars().count() as i64),
            "ucase" => Value::Str(text(0).to_uppercase()),
            "lcase" => Value::Str(text(0).to_lowercase()),
            "trim" => Value::Str(text(0).trim().to_string()),
            "left" => {
                let n = self.count_arg(arg(1), pos)?;
                Value::Str(text(0).chars().take(n).collect())
            }
            "right" => {
                let n = self.count_arg(arg(1), pos)?;
                let chars: Vec<char> = text(0).chars().collect();
                Value::Str(chars[chars.len().saturating_sub(n)..].iter().collect())
            }
            "mid" => {
                let start = self.count_arg(arg(1), pos)?;
                if start == 0 {
                    return Err(self.fail(pos, "Argument 'Start' must be greater than zero."));
                }
                let source = text(0);
                let chars = source.chars().skip(start - 1);
                match args.get(2) {
                    Some(len) => Value::Str(chars.take(self.count_arg(len.clone(), pos)?).collect()),
                    None => Value::Str(chars.collect()),
                }
            }
            "instr" => {
                let haystack = text(0);
                let needle = text(1);
                Value::Integer(
                    haystack
                        .find(&needle)
                        .map(|byte| haystack[..byte].chars().count() as i64 + 1)
                        .unwrap_or(0),
                )
            }
            "replace" => {
                let from = text(1);
                if from.is_empty() {
                    return Ok(Value::Str(text(0)));
                }
                return self.text(text(0).replace(&from, &text(2)), pos);
            }
            "cstr" => Value::Str(text(0)),
            "cint" | "clng" => self.coerce(arg(0), Type::Integer, pos)?,
            "cdbl" => self.coerce(arg(0), Type::Double, pos)?,
            "cbool" => self.coerce(arg(0), Type::Boolean, pos)?,
            "isnothing" => Value::Boolean(arg(0) == Value::Nothing),
            "parsejson" => {
                let parsed: Json = serde_json::from_str(&text(0))
                    .map_err(|err| self.fail(pos, format!("Invalid JSON: {err}")))?;
                Value::from_json(&parsed)
            }
            "tojson" => Value::Str(arg(0).to_json().to_string()),
            "addclaim" => {
                self.claims.push(Claim::new(text(0), text(1)));
                Value::Nothing
            }
            "logdebug" => {
                debug!(script_log = %text(0));
                Value::Nothing
            }
            "loginfo" => {
                info!(script_log = %text(0));
                Value::Nothing
            }
            "logwarn" => {
                warn!(script_log = %text(0));
                Value::Nothing
            }
            "now" => Value::Integer(
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or_default(),
            ),
            "newguid" => Value::Str(uuid::Uuid::new_v4().to_string()),
            _ => return Err(self.fail(pos, format!("'{name}' is not declared."))),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce() {
        assert_eq!(coerce(Value::Str(" 42 ".into()), Type::Integer), Ok(Value::Integer(42)));
        assert_eq!(coerce(Value::Double(2.5), Type::Integer), Ok(Value::Integer(3)));
        assert_eq!(coerce(Value::Boolean(true), Type::Integer), Ok(Value::Integer(-1)));
        assert_eq!(coerce(Value::Integer(0), Type::Boolean), Ok(Value::Boolean(false)));
        assert_eq!(coerce(Value::Str("TRUE".into()), Type::Boolean), Ok(Value::Boolean(true)));
        assert_eq!(coerce(Value::Integer(7), Type::String), Ok(Value::Str("7".into())));
        assert!(coerce(Value::Str("seven".into()), Type::Integer).is_err());
        assert!(coerce(Value::Json(serde_json::json!([1])), Type::Double).is_err());
    }

    #[test]
    fn test_json_round_trip_unwraps_scalars() {
        let value = Value::from_json(&serde_json::json!({"n": 1}));
        assert!(matches!(value, Value::Json(_)));
        assert_eq!(Value::from_json(&serde_json::json!(1.5)), Value::Double(1.5));
        assert_eq!(Value::from_json(&serde_json::json!(null)), Value::Nothing);
        assert_eq!(Value::Boolean(true).to_text(), "True");
    }
}
