//! Shell syntax tree

use std::sync::Arc;

/// Parsed script: optional `param(...)` block and statements
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct Script {
    pub(crate) params: Vec<ParamDef>,
    pub(crate) body: Block,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct Block {
    pub(crate) statements: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Statement {
    pub(crate) kind: StatementKind,
    pub(crate) line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StatementKind {
    Pipeline(Pipeline),
    Assign {
        target: Target,
        op: AssignOp,
        value: Pipeline,
    },
    If {
        branches: Vec<(Pipeline, Block)>,
        otherwise: Option<Block>,
    },
    Foreach {
        variable: String,
        source: Pipeline,
        body: Block,
    },
    While {
        condition: Pipeline,
        body: Block,
    },
    Function(Arc<FunctionDef>),
    Return(Option<Pipeline>),
    Throw(Option<Pipeline>),
    Break,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AssignOp {
    Set,
    Add,
    Subtract,
}

/// Assignable place: `$x`, `$x.Name`, `$x[0]`
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Target {
    pub(crate) variable: String,
    pub(crate) path: Vec<Accessor>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Accessor {
    Member(String),
    Index(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FunctionDef {
    pub(crate) name: String,
    pub(crate) params: Vec<ParamDef>,
    pub(crate) body: Block,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParamDef {
    pub(crate) name: String,
    pub(crate) default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Pipeline {
    pub(crate) stages: Vec<Stage>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Stage {
    Expr(Expr),
    Command(Command),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Command {
    pub(crate) name: String,
    pub(crate) args: Vec<Arg>,
    pub(crate) line: usize,
}

/// Command argument before parameter binding
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Arg {
    /// `-Name`; binding decides whether it is a switch or takes the next value
    Flag(String),
    Value(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Expr {
    pub(crate) kind: ExprKind,
    pub(crate) line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ExprKind {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
    Expandable(Vec<StrPart>),
    Variable(String),
    /// `a, b, c`
    List(Vec<Expr>),
    /// `( pipeline )`
    Paren(Box<Pipeline>),
    /// `$( ... )`
    SubExpr(Block),
    /// `@( ... )`
    ArrayExpr(Block),
    Hashtable(Vec<(String, Pipeline)>),
    ScriptBlock(Arc<Block>),
    Member {
        target: Box<Expr>,
        name: String,
    },
    Method {
        target: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Cast {
        ty: CastType,
        operand: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Range {
        start: Box<Expr>,
        end: Box<Expr>,
    },
}

/// Piece of a double-quoted string
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StrPart {
    Text(String),
    Variable(String),
    SubExpr(Block),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CastType {
    Int,
    Double,
    String,
    Bool,
    Array,
    Hashtable,
}

impl CastType {
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "int" | "long" | "int32" | "int64" => Some(Self::Int),
            "double" | "float" | "decimal" => Some(Self::Double),
            "string" => Some(Self::String),
            "bool" | "boolean" | "switch" => Some(Self::Bool),
            "array" | "object[]" => Some(Self::Array),
            "hashtable" => Some(Self::Hashtable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    NotLike,
    Match,
    NotMatch,
    Contains,
    NotContains,
    In,
    NotIn,
    Replace,
    Join,
    Split,
    And,
    Or,
    Xor,
}

impl BinaryOp {
    /// Operator spelled `-name`
    pub(crate) fn from_dash(name: &str) -> Option<Self> {
        let op = match name.to_ascii_lowercase().as_str() {
            "eq" | "ieq" | "ceq" => Self::Eq,
            "ne" | "ine" | "cne" => Self::Ne,
            "gt" | "igt" => Self::Gt,
            "ge" | "ige" => Self::Ge,
            "lt" | "ilt" => Self::Lt,
            "le" | "ile" => Self::Le,
            "like" | "ilike" => Self::Like,
            "notlike" | "inotlike" => Self::NotLike,
            "match" | "imatch" => Self::Match,
            "notmatch" | "inotmatch" => Self::NotMatch,
            "contains" | "icontains" => Self::Contains,
            "notcontains" | "inotcontains" => Self::NotContains,
            "in" => Self::In,
            "notin" => Self::NotIn,
            "replace" | "ireplace" => Self::Replace,
            "join" => Self::Join,
            "split" => Self::Split,
            "and" => Self::And,
            "or" => Self::Or,
            "xor" => Self::Xor,
            _ => return None,
        };
        Some(op)
    }

    pub(crate) fn is_logical(self) -> bool {
        matches!(self, Self::And | Self::Or | Self::Xor)
    }
}
