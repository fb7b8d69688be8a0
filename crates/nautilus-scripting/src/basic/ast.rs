//! BASIC syntax tree

use nautilus_core::ValueKind;
use std::fmt;

/// Source position (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Pos {
    pub(crate) line: usize,
    pub(crate) column: usize,
}

/// Declared types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Type {
    Integer,
    Double,
    String,
    Boolean,
    /// Late-bound; accepts and converts to anything at run time
    Object,
}

impl Type {
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "integer" | "long" | "short" | "byte" => Some(Self::Integer),
            "double" | "single" | "decimal" => Some(Self::Double),
            "string" | "char" => Some(Self::String),
            "boolean" => Some(Self::Boolean),
            "object" => Some(Self::Object),
            _ => None,
        }
    }

    /// Best-known declared type for a bound value
    pub(crate) fn from_kind(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Int => Self::Integer,
            ValueKind::Float => Self::Double,
            ValueKind::String => Self::String,
            ValueKind::Bool => Self::Boolean,
            ValueKind::Any | ValueKind::Array | ValueKind::Map => Self::Object,
        }
    }

    pub(crate) fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Double)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Integer => "Integer",
            Self::Double => "Double",
            Self::String => "String",
            Self::Boolean => "Boolean",
            Self::Object => "Object",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Program {
    pub(crate) functions: Vec<Function>,
    pub(crate) body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub(crate) struct Function {
    pub(crate) name: String,
    pub(crate) params: Vec<Param>,
    /// `None` for a `Sub`
    pub(crate) return_type: Option<Type>,
    pub(crate) body: Vec<Stmt>,
    pub(crate) pos: Pos,
}

#[derive(Debug, Clone)]
pub(crate) struct Param {
    pub(crate) name: String,
    pub(crate) ty: Type,
    pub(crate) pos: Pos,
}

#[derive(Debug, Clone)]
pub(crate) struct Stmt {
    pub(crate) kind: StmtKind,
    pub(crate) pos: Pos,
}

#[derive(Debug, Clone)]
pub(crate) enum StmtKind {
    Dim {
        name: String,
        ty: Option<Type>,
        init: Option<Expr>,
    },
    Assign {
        target: Expr,
        value: Expr,
    },
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        otherwise: Vec<Stmt>,
    },
    For {
        var: String,
        declared: Option<Type>,
        start: Expr,
        end: Expr,
        step: Option<Expr>,
        body: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    Return(Option<Expr>),
    Exit(ExitKind),
    Call(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitKind {
    For,
    While,
    Function,
    Sub,
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::For => "For",
            Self::While => "While",
            Self::Function => "Function",
            Self::Sub => "Sub",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Expr {
    pub(crate) kind: ExprKind,
    pub(crate) pos: Pos,
}

#[derive(Debug, Clone)]
pub(crate) enum ExprKind {
    Integer(i64),
    Double(f64),
    Str(String),
    Bool(bool),
    Nothing,
    Name(String),
    Member {
        object: Box<Expr>,
        member: String,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    IntDiv,
    Mod,
    Pow,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    AndAlso,
    Or,
    OrElse,
}

impl BinaryOp {
    pub(crate) fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }

    pub(crate) fn is_logical(self) -> bool {
        matches!(self, Self::And | Self::AndAlso | Self::Or | Self::OrElse)
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::IntDiv => "\\",
            Self::Mod => "Mod",
            Self::Pow => "^",
            Self::Concat => "&",
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "And",
            Self::AndAlso => "AndAlso",
            Self::Or => "Or",
            Self::OrElse => "OrElse",
        };
        f.write_str(symbol)
    }
}
