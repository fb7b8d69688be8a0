//! Shell parser
//!
//! Recursive descent over the token stream. Parsing stops at the first
//! error: a shell body that does not parse never runs.

use crate::diagnostics::Diagnostic;
use crate::shell::ast::*;
use crate::shell::lexer::{Lexer, Spanned, TemplatePart, Token};
use std::sync::Arc;

type PResult<T> = Result<T, Diagnostic>;

/// Parse a complete script
pub(crate) fn parse(source: &str) -> PResult<Script> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser::new(tokens);
    parser.script()
}

fn parse_nested(source: &str, line: usize) -> PResult<Block> {
    let shift = line.saturating_sub(1);
    let tokens = Lexer::new(source)
        .tokenize()
        .map_err(|d| shift_diagnostic(d, shift))?
        .into_iter()
        .map(|mut t| {
            t.line += shift;
            t
        })
        .collect();
    let mut parser = Parser::new(tokens);
    let block = parser.statements(None)?;
    parser.expect(&Token::Eof, "UnexpectedToken", "Unexpected token in subexpression")?;
    Ok(block)
}

fn shift_diagnostic(mut diagnostic: Diagnostic, shift: usize) -> Diagnostic {
    if let Some(location) = diagnostic.location.as_mut() {
        location.line += shift;
    }
    diagnostic
}

const KEYWORDS: [&str; 11] = [
    "if", "elseif", "else", "foreach", "while", "function", "filter", "return", "throw", "break",
    "continue",
];

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    allow_comma: bool,
}

impl Parser {
    fn new(tokens: Vec<Spanned>) -> Self {
        Self {
            tokens,
            pos: 0,
            allow_comma: true,
        }
    }

    fn current(&self) -> &Spanned {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.pos.min(last)]
    }

    fn peek(&self) -> &Token {
        &self.current().token
    }

    fn line(&self) -> usize {
        self.current().line
    }

    fn advance(&mut self) -> Spanned {
        let token = self.current().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, code: &str, message: impl Into<String>) -> Diagnostic {
        let current = self.current();
        Diagnostic::error(message)
            .at(current.line, current.column)
            .with_code(code)
    }

    fn unexpected(&self) -> Diagnostic {
        self.error(
            "UnexpectedToken",
            format!(
                "Unexpected token '{}' in expression or statement.",
                self.peek().describe()
            ),
        )
    }

    fn expect(&mut self, token: &Token, code: &str, message: &str) -> PResult<Spanned> {
        if self.check(token) {
            Ok(self.advance())
        } else {
            Err(self.error(code, format!("{message}, found '{}'.", self.peek().describe())))
        }
    }

    fn skip_newlines(&mut self) {
        while self.eat(&Token::Newline) {}
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(), Token::Newline | Token::Semi) {
            self.advance();
        }
    }

    fn is_word(&self, word: &str) -> bool {
        matches!(self.peek(), Token::Word(w) if w.eq_ignore_ascii_case(word))
    }

    fn keyword(&self) -> Option<&'static str> {
        match self.peek() {
            Token::Word(w) => KEYWORDS.iter().copied().find(|k| w.eq_ignore_ascii_case(k)),
            _ => None,
        }
    }

    fn at_statement_end(&self) -> bool {
        matches!(
            self.peek(),
            Token::Newline | Token::Semi | Token::RBrace | Token::RParen | Token::Eof
        )
    }

    fn with_comma<T>(&mut self, allow: bool, parse: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        let saved = std::mem::replace(&mut self.allow_comma, allow);
        let result = parse(self);
        self.allow_comma = saved;
        result
    }

    fn script(&mut self) -> PResult<Script> {
        self.skip_separators();
        let params = if self.is_word("param") {
            self.advance();
            self.param_list()?
        } else {
            Vec::new()
        };
        let body = self.statements(None)?;
        self.expect(&Token::Eof, "UnexpectedToken", "Unexpected token")?;
        Ok(Script { params, body })
    }

    /// Statements up to `closing` (not consumed), or to the end of input
    fn statements(&mut self, closing: Option<&Token>) -> PResult<Block> {
        let mut statements = Vec::new();
        loop {
            self.skip_separators();
            match closing {
                Some(token) if self.check(token) => break,
                _ if self.check(&Token::Eof) => break,
                _ => {}
            }
            statements.push(self.statement()?);
            let terminated = matches!(self.peek(), Token::Newline | Token::Semi | Token::Eof)
                || closing.is_some_and(|t| self.check(t));
            if !terminated {
                return Err(self.unexpected());
            }
        }
        Ok(Block { statements })
    }

    fn block(&mut self) -> PResult<Block> {
        self.skip_newlines();
        self.expect(&Token::LBrace, "MissingOpenCurlyBrace", "Missing '{' to open the statement block")?;
        let block = self.statements(Some(&Token::RBrace))?;
        self.expect(&Token::RBrace, "MissingEndCurlyBrace", "Missing closing '}' in statement block")?;
        Ok(block)
    }

    fn condition(&mut self) -> PResult<Pipeline> {
        self.skip_newlines();
        self.expect(&Token::LParen, "MissingOpenParenthesis", "Missing '(' before the condition")?;
        self.skip_newlines();
        let pipeline = self.with_comma(true, Self::pipeline)?;
        self.skip_newlines();
        self.expect(
            &Token::RParen,
            "MissingEndParenthesisAfterCondition",
            "Missing closing ')' after the condition",
        )?;
        Ok(pipeline)
    }

    fn statement(&mut self) -> PResult<Statement> {
        let line = self.line();
        let kind = match self.keyword() {
            Some("if") => self.if_statement()?,
            Some("foreach") => self.foreach_statement()?,
            Some("while") => {
                self.advance();
                let condition = self.condition()?;
                let body = self.block()?;
                StatementKind::While { condition, body }
            }
            Some("function" | "filter") => self.function()?,
            Some(keyword @ ("return" | "throw")) => {
                self.advance();
                let value = if self.at_statement_end() {
                    None
                } else {
                    Some(self.pipeline()?)
                };
                if keyword == "return" {
                    StatementKind::Return(value)
                } else {
                    StatementKind::Throw(value)
                }
            }
            Some("break") => {
                self.advance();
                StatementKind::Break
            }
            Some("continue") => {
                self.advance();
                StatementKind::Continue
            }
            Some(other @ ("elseif" | "else")) => {
                return Err(self.error(
                    "UnexpectedToken",
                    format!("'{other}' is only valid after an 'if' block."),
                ))
            }
            _ => self.assignment_or_pipeline()?,
        };
        Ok(Statement { kind, line })
    }

    fn if_statement(&mut self) -> PResult<StatementKind> {
        self.advance();
        let mut branches = Vec::new();
        let condition = self.condition()?;
        branches.push((condition, self.block()?));

        let mut otherwise = None;
        loop {
            let saved = self.pos;
            self.skip_newlines();
            if self.is_word("elseif") {
                self.advance();
                let condition = self.condition()?;
                branches.push((condition, self.block()?));
            } else if self.is_word("else") {
                self.advance();
                otherwise = Some(self.block()?);
                break;
            } else {
                self.pos = saved;
                break;
            }
        }
        Ok(StatementKind::If {
            branches,
            otherwise,
        })
    }

    fn foreach_statement(&mut self) -> PResult<StatementKind> {
        self.advance();
        self.skip_newlines();
        self.expect(&Token::LParen, "MissingOpenParenthesisAfterForeach", "Missing '(' after 'foreach'")?;
        let variable = match self.advance().token {
            Token::Variable(name) => name,
            _ => {
                return Err(self.error(
                    "MissingVariableNameAfterForeach",
                    "Missing variable name after foreach.",
                ))
            }
        };
        if !self.is_word("in") {
            return Err(self.error("MissingInInForeach", "Missing 'in' after variable in foreach loop."));
        }
        self.advance();
        let source = self.with_comma(true, Self::pipeline)?;
        self.expect(
            &Token::RParen,
            "MissingEndParenthesisAfterForeach",
            "Missing closing ')' after expression in 'foreach' statement",
        )?;
        let body = self.block()?;
        Ok(StatementKind::Foreach {
            variable,
            source,
            body,
        })
    }

    fn function(&mut self) -> PResult<StatementKind> {
        self.advance();
        let name = match self.advance().token {
            Token::Word(name) => name,
            _ => return Err(self.error("MissingNameAfterKeyword", "Missing name after function keyword.")),
        };
        let mut params = if self.check(&Token::LParen) {
            self.param_list()?
        } else {
            Vec::new()
        };

        self.skip_newlines();
        self.expect(&Token::LBrace, "MissingFunctionBody", "Missing function body in function declaration")?;
        self.skip_separators();
        if self.is_word("param") {
            self.advance();
            params.extend(self.param_list()?);
        }
        let body = self.statements(Some(&Token::RBrace))?;
        self.expect(&Token::RBrace, "MissingEndCurlyBrace", "Missing closing '}' in statement block")?;
        Ok(StatementKind::Function(Arc::new(FunctionDef { name, params, body })))
    }

    /// `( [attr] $name [= default], ... )`
    fn param_list(&mut self) -> PResult<Vec<ParamDef>> {
        self.skip_newlines();
        self.expect(&Token::LParen, "MissingOpenParenthesis", "Missing '(' in parameter list")?;
        let mut params = Vec::new();
        loop {
            self.skip_newlines();
            if self.eat(&Token::RParen) {
                break;
            }
            while self.check(&Token::LBracket) {
                self.skip_attribute()?;
                self.skip_newlines();
            }
            let name = match self.advance().token {
                Token::Variable(name) => name,
                _ => return Err(self.error("InvalidFunctionParameter", "Parameter declarations need a variable name.")),
            };
            self.skip_newlines();
            let default = if self.eat(&Token::Assign) {
                self.skip_newlines();
                Some(self.with_comma(false, Self::expression)?)
            } else {
                None
            };
            params.push(ParamDef { name, default });
            self.skip_newlines();
            if !self.eat(&Token::Comma) {
                self.expect(&Token::RParen, "MissingEndParenthesisInFunctionParameterList", "Missing ')' in function parameter list")?;
                break;
            }
        }
        Ok(params)
    }

    fn skip_attribute(&mut self) -> PResult<()> {
        let mut depth = 0usize;
        loop {
            match self.advance().token {
                Token::LBracket => depth += 1,
                Token::RBracket => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                Token::Eof => return Err(self.error("EndSquareBracketExpectedAtEndOfAttribute", "Missing ']' at end of attribute or type literal.")),
                _ => {}
            }
        }
    }

    fn assignment_or_pipeline(&mut self) -> PResult<StatementKind> {
        if matches!(self.peek(), Token::Variable(_)) {
            let saved = self.pos;
            if let Some(target) = self.target() {
                let op = match self.peek() {
                    Token::Assign => Some(AssignOp::Set),
                    Token::PlusAssign => Some(AssignOp::Add),
                    Token::MinusAssign => Some(AssignOp::Subtract),
                    _ => None,
                };
                if let Some(op) = op {
                    self.advance();
                    self.skip_newlines();
                    let value = self.pipeline()?;
                    return Ok(StatementKind::Assign { target, op, value });
                }
            }
            self.pos = saved;
        }
        Ok(StatementKind::Pipeline(self.pipeline()?))
    }

    /// Assignable place, or `None` if the tokens do not form one
    fn target(&mut self) -> Option<Target> {
        let Token::Variable(variable) = self.advance().token else {
            return None;
        };
        let mut path = Vec::new();
        loop {
            match self.peek().clone() {
                Token::Member(name) => {
                    self.advance();
                    path.push(Accessor::Member(name));
                }
                Token::LBracket if !self.current().spaced => {
                    self.advance();
                    let index = self.with_comma(true, Self::expression).ok()?;
                    if !self.eat(&Token::RBracket) {
                        return None;
                    }
                    path.push(Accessor::Index(index));
                }
                _ => break,
            }
        }
        Some(Target { variable, path })
    }

    fn pipeline(&mut self) -> PResult<Pipeline> {
        let mut stages = vec![self.stage(true)?];
        while self.eat(&Token::Pipe) {
            self.skip_newlines();
            stages.push(self.stage(false)?);
        }
        Ok(Pipeline { stages })
    }

    fn stage(&mut self, first: bool) -> PResult<Stage> {
        match self.peek() {
            Token::Word(_) if self.keyword().is_none() => Ok(Stage::Command(self.command()?)),
            _ if first => Ok(Stage::Expr(self.expression()?)),
            _ => Err(self.error(
                "ExpressionsMustBeFirstInPipeline",
                "Expressions are only allowed as the first element of a pipeline.",
            )),
        }
    }

    fn command(&mut self) -> PResult<Command> {
        let start = self.advance();
        let Token::Word(name) = start.token else {
            return Err(self.unexpected());
        };
        let mut args = Vec::new();
        loop {
            match self.peek() {
                Token::Newline
                | Token::Semi
                | Token::Pipe
                | Token::RParen
                | Token::RBrace
                | Token::Eof => break,
                Token::Dash(flag) => {
                    args.push(Arg::Flag(flag.clone()));
                    self.advance();
                }
                _ => args.push(Arg::Value(self.command_argument()?)),
            }
        }
        Ok(Command {
            name,
            args,
            line: start.line,
        })
    }

    fn command_argument(&mut self) -> PResult<Expr> {
        let line = self.line();
        let first = self.argument_atom()?;
        if !self.check(&Token::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Token::Comma) {
            self.skip_newlines();
            items.push(self.argument_atom()?);
        }
        Ok(Expr {
            kind: ExprKind::List(items),
            line,
        })
    }

    fn argument_atom(&mut self) -> PResult<Expr> {
        let line = self.line();
        match self.peek().clone() {
            Token::Word(word) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Str(word),
                    line,
                })
            }
            Token::Minus => self.negative_literal(),
            _ => self.with_comma(false, Self::postfix),
        }
    }

    fn negative_literal(&mut self) -> PResult<Expr> {
        let line = self.line();
        self.advance();
        let kind = match self.advance().token {
            Token::Integer(i) => ExprKind::Int(-i),
            Token::Double(d) => ExprKind::Double(-d),
            _ => return Err(self.error("ExpectedExpression", "You must provide a value expression following the '-' operator.")),
        };
        Ok(Expr { kind, line })
    }

    fn expression(&mut self) -> PResult<Expr> {
        let mut left = self.comparison()?;
        loop {
            let op = match self.peek() {
                Token::Dash(name) => match BinaryOp::from_dash(name) {
                    Some(op) if op.is_logical() => op,
                    _ => break,
                },
                _ => break,
            };
            let line = self.line();
            self.advance();
            self.skip_newlines();
            let right = self.comparison()?;
            left = binary(op, left, right, line);
        }
        Ok(left)
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Token::Dash(name) => match BinaryOp::from_dash(name) {
                    Some(op) if !op.is_logical() => op,
                    _ => break,
                },
                _ => break,
            };
            let line = self.line();
            self.advance();
            self.skip_newlines();
            let right = self.additive()?;
            left = binary(op, left, right, line);
        }
        Ok(left)
    }

    fn additive(&mut self) -> PResult<Expr> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Subtract,
                _ => break,
            };
            let line = self.line();
            self.advance();
            self.skip_newlines();
            let right = self.multiplicative()?;
            left = binary(op, left, right, line);
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> PResult<Expr> {
        let mut left = self.range()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Multiply,
                Token::Slash => BinaryOp::Divide,
                Token::Percent => BinaryOp::Remainder,
                _ => break,
            };
            let line = self.line();
            self.advance();
            self.skip_newlines();
            let right = self.range()?;
            left = binary(op, left, right, line);
        }
        Ok(left)
    }

    fn range(&mut self) -> PResult<Expr> {
        let start = self.unary()?;
        if !self.check(&Token::DotDot) {
            return Ok(start);
        }
        let line = self.line();
        self.advance();
        let end = self.unary()?;
        Ok(Expr {
            kind: ExprKind::Range {
                start: Box::new(start),
                end: Box::new(end),
            },
            line,
        })
    }

    fn unary(&mut self) -> PResult<Expr> {
        let line = self.line();
        let next_is_number = matches!(
            self.tokens.get(self.pos + 1).map(|t| &t.token),
            Some(Token::Integer(_) | Token::Double(_))
        );
        let op = match self.peek() {
            Token::Bang => UnaryOp::Not,
            Token::Dash(name) if name.eq_ignore_ascii_case("not") => UnaryOp::Not,
            Token::Minus if next_is_number => return self.comma_list(),
            Token::Minus => UnaryOp::Negate,
            Token::LBracket => return self.cast(),
            _ => return self.comma_list(),
        };
        self.advance();
        let operand = self.unary()?;
        Ok(Expr {
            kind: ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            line,
        })
    }

    fn cast(&mut self) -> PResult<Expr> {
        let line = self.line();
        self.advance();
        let name = match self.advance().token {
            Token::Word(name) => name,
            _ => return Err(self.error("MissingTypename", "Missing type name after '['.")),
        };
        let mut ty = CastType::from_name(&name)
            .ok_or_else(|| self.error("TypeNotFound", format!("Unable to find type [{name}].")))?;
        if self.check(&Token::LBracket) {
            self.advance();
            self.expect(&Token::RBracket, "EndSquareBracketExpectedAtEndOfType", "Missing ']'")?;
            ty = CastType::Array;
        }
        self.expect(&Token::RBracket, "EndSquareBracketExpectedAtEndOfType", "Missing ']' at end of type literal")?;
        let operand = self.unary()?;
        Ok(Expr {
            kind: ExprKind::Cast {
                ty,
                operand: Box::new(operand),
            },
            line,
        })
    }

    fn comma_list(&mut self) -> PResult<Expr> {
        let line = self.line();
        let first = match self.peek() {
            Token::Minus => self.negative_literal()?,
            _ => self.postfix()?,
        };
        if !(self.allow_comma && self.check(&Token::Comma)) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Token::Comma) {
            self.skip_newlines();
            let item = match self.peek() {
                Token::Minus => self.negative_literal()?,
                _ => self.postfix()?,
            };
            items.push(item);
        }
        Ok(Expr {
            kind: ExprKind::List(items),
            line,
        })
    }

    fn postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            let line = self.line();
            match self.peek().clone() {
                Token::Member(name) => {
                    self.advance();
                    if self.check(&Token::LParen) && !self.current().spaced {
                        self.advance();
                        let args = self.method_args()?;
                        expr = Expr {
                            kind: ExprKind::Method {
                                target: Box::new(expr),
                                name,
                                args,
                            },
                            line,
                        };
                    } else {
                        expr = Expr {
                            kind: ExprKind::Member {
                                target: Box::new(expr),
                                name,
                            },
                            line,
                        };
                    }
                }
                Token::LBracket if !self.current().spaced => {
                    self.advance();
                    self.skip_newlines();
                    let index = self.with_comma(true, Self::expression)?;
                    self.skip_newlines();
                    self.expect(&Token::RBracket, "MissingEndSquareBracket", "Missing ']' after array index expression")?;
                    expr = Expr {
                        kind: ExprKind::Index {
                            target: Box::new(expr),
                            index: Box::new(index),
                        },
                        line,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn method_args(&mut self) -> PResult<Vec<Expr>> {
        let mut args = Vec::new();
        self.skip_newlines();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            self.skip_newlines();
            args.push(self.with_comma(false, Self::expression)?);
            self.skip_newlines();
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen, "MissingEndParenthesisInMethodCall", "Missing closing ')' in method call")?;
        Ok(args)
    }

    fn primary(&mut self) -> PResult<Expr> {
        let line = self.line();
        let kind = match self.peek().clone() {
            Token::Variable(name) => {
                self.advance();
                match name.to_ascii_lowercase().as_str() {
                    "true" => ExprKind::Bool(true),
                    "false" => ExprKind::Bool(false),
                    "null" => ExprKind::Null,
                    _ => ExprKind::Variable(name),
                }
            }
            Token::Integer(i) => {
                self.advance();
                ExprKind::Int(i)
            }
            Token::Double(d) => {
                self.advance();
                ExprKind::Double(d)
            }
            Token::Str(s) => {
                self.advance();
                ExprKind::Str(s)
            }
            Token::Template(parts) => {
                self.advance();
                let mut converted = Vec::with_capacity(parts.len());
                for part in parts {
                    converted.push(match part {
                        TemplatePart::Text(text) => StrPart::Text(text),
                        TemplatePart::Variable(name) => StrPart::Variable(name),
                        TemplatePart::SubExpr { source, line } => {
                            StrPart::SubExpr(parse_nested(&source, line)?)
                        }
                    });
                }
                ExprKind::Expandable(converted)
            }
            Token::LParen => {
                self.advance();
                self.skip_newlines();
                let pipeline = self.with_comma(true, Self::pipeline)?;
                self.skip_newlines();
                self.expect(&Token::RParen, "MissingEndParenthesisInExpression", "Missing closing ')' in expression")?;
                ExprKind::Paren(Box::new(pipeline))
            }
            Token::DollarParen | Token::AtParen => {
                let array = self.check(&Token::AtParen);
                self.advance();
                let block = self.with_comma(true, |p| p.statements(Some(&Token::RParen)))?;
                self.expect(&Token::RParen, "MissingEndParenthesisInSubexpression", "Missing closing ')' in subexpression")?;
                if array {
                    ExprKind::ArrayExpr(block)
                } else {
                    ExprKind::SubExpr(block)
                }
            }
            Token::AtBrace => {
                self.advance();
                self.hashtable()?
            }
            Token::LBrace => {
                self.advance();
                let block = self.with_comma(true, |p| p.statements(Some(&Token::RBrace)))?;
                self.expect(&Token::RBrace, "MissingEndCurlyBrace", "Missing closing '}' in script block")?;
                ExprKind::ScriptBlock(Arc::new(block))
            }
            Token::Newline | Token::Eof | Token::Semi | Token::RParen | Token::RBrace | Token::Pipe => {
                return Err(self.error("ExpectedExpression", "Missing expression."))
            }
            _ => return Err(self.unexpected()),
        };
        Ok(Expr { kind, line })
    }

    fn hashtable(&mut self) -> PResult<ExprKind> {
        let mut entries = Vec::new();
        loop {
            self.skip_separators();
            if self.eat(&Token::RBrace) {
                break;
            }
            let key = match self.advance().token {
                Token::Word(key) | Token::Str(key) => key,
                Token::Integer(i) => i.to_string(),
                _ => return Err(self.error("MissingHashtableKey", "Missing key before '=' in hash literal.")),
            };
            self.expect(&Token::Assign, "MissingEqualsInHashLiteral", "Missing '=' operator after key in hash literal")?;
            self.skip_newlines();
            let value = self.with_comma(true, Self::pipeline)?;
            entries.push((key, value));
            if !matches!(self.peek(), Token::Newline | Token::Semi | Token::RBrace) {
                return Err(self.error("MissingEndCurlyBrace", "The hash literal was incomplete."));
            }
        }
        Ok(ExprKind::Hashtable(entries))
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr, line: usize) -> Expr {
    Expr {
        kind: ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statements(source: &str) -> Vec<StatementKind> {
        parse(source)
            .unwrap()
            .body
            .statements
            .into_iter()
            .map(|s| s.kind)
            .collect()
    }

    #[test]
    fn test_assignment_and_pipeline() {
        let parsed = statements("$items = 1..3 | Where-Object { $_ -gt 1 }\n$items.Count");
        assert!(matches!(
            &parsed[0],
            StatementKind::Assign { target, op: AssignOp::Set, value }
                if target.variable == "items" && value.stages.len() == 2
        ));
        assert!(matches!(&parsed[1], StatementKind::Pipeline(_)));
    }

    #[test]
    fn test_command_arguments() {
        let parsed = statements("Select-Object -First 2 -Property Name, Age");
        let StatementKind::Pipeline(pipeline) = &parsed[0] else {
            panic!("expected pipeline");
        };
        let Stage::Command(command) = &pipeline.stages[0] else {
            panic!("expected command");
        };
        assert_eq!(command.name, "Select-Object");
        assert_eq!(command.args.len(), 4);
        assert_eq!(command.args[0], Arg::Flag("First".to_string()));
        assert!(matches!(&command.args[3], Arg::Value(Expr { kind: ExprKind::List(items), .. }) if items.len() == 2));
    }

    #[test]
    fn test_control_flow() {
        let source = r#"
function Get-Greeting {
    param([string]$Name = 'world')
    "Hello, $Name"
}
if ($x -eq 1) { 'one' }
elseif ($x -eq 2) { 'two' }
else { 'many' }
foreach ($i in @(1, 2)) { if ($i -gt 1) { break } }
"#;
        let parsed = statements(source);
        assert_eq!(parsed.len(), 3);
        let StatementKind::Function(function) = &parsed[0] else {
            panic!("expected function");
        };
        assert_eq!(function.params.len(), 1);
        assert!(function.params[0].default.is_some());
        assert!(matches!(&parsed[1], StatementKind::If { branches, otherwise: Some(_) } if branches.len() == 2));
    }

    #[test]
    fn test_precedence() {
        let parsed = statements("1 + 2 * 3 -eq 7 -and !$false");
        let StatementKind::Pipeline(pipeline) = &parsed[0] else {
            panic!("expected pipeline");
        };
        let Stage::Expr(expr) = &pipeline.stages[0] else {
            panic!("expected expression");
        };
        assert!(matches!(&expr.kind, ExprKind::Binary { op: BinaryOp::And, .. }));
    }

    #[test]
    fn test_errors_report_location() {
        let err = parse("if ($x) {\n  'a'\n").unwrap_err();
        assert_eq!(err.code.as_deref(), Some("MissingEndCurlyBrace"));

        let err = parse("$x = 1\n$y = (2 +").unwrap_err();
        assert_eq!(err.location.map(|l| l.line), Some(2));

        let err = parse("'a' | 'b'").unwrap_err();
        assert_eq!(err.code.as_deref(), Some("ExpressionsMustBeFirstInPipeline"));
    }
}
