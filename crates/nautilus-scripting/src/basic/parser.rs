//! BASIC recursive-descent parser
//!
//! Statement-level errors are reported and the parser resumes at the next
//! statement, so one pass yields every syntax error.

use crate::basic::ast::*;
use crate::basic::lexer::{Keyword, Spanned, Token};
use crate::diagnostics::{Diagnostic, Diagnostics};

type ParseResult<T> = Result<T, Diagnostic>;

/// Parse a token stream into a program and syntax diagnostics
pub(crate) fn parse(tokens: Vec<Spanned>) -> (Program, Diagnostics) {
    let mut parser = Parser {
        tokens,
        index: 0,
        diagnostics: Diagnostics::new(),
    };
    let program = parser.program();
    (program, parser.diagnostics)
}

struct Parser {
    tokens: Vec<Spanned>,
    index: usize,
    diagnostics: Diagnostics,
}

fn error_at(pos: Pos, code: &str, message: impl Into<String>) -> Diagnostic {
    Diagnostic::error(message)
        .at(pos.line, pos.column)
        .with_code(code)
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.index.min(self.tokens.len() - 1)].token
    }

    fn peek_next(&self) -> &Token {
        &self.tokens[(self.index + 1).min(self.tokens.len() - 1)].token
    }

    fn pos(&self) -> Pos {
        self.tokens[self.index.min(self.tokens.len() - 1)].pos
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.index < self.tokens.len() - 1 {
            self.index += 1;
        }
        token
    }

    fn at_keyword(&self, keyword: Keyword) -> bool {
        *self.peek() == Token::Keyword(keyword)
    }

    fn eat_keyword(&mut self, keyword: Keyword) -> bool {
        if self.at_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: Keyword, code: &str) -> ParseResult<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(error_at(
                self.pos(),
                code,
                format!("'{keyword:?}' expected."),
            ))
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> ParseResult<()> {
        if *self.peek() == token {
            self.advance();
            Ok(())
        } else {
            Err(error_at(
                self.pos(),
                "BC30198",
                format!("'{what}' expected but found {}.", self.peek().describe()),
            ))
        }
    }

    fn identifier(&mut self) -> ParseResult<String> {
        match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(error_at(
                self.pos(),
                "BC30203",
                format!("Identifier expected but found {}.", other.describe()),
            )),
        }
    }

    fn type_name(&mut self) -> ParseResult<Type> {
        let pos = self.pos();
        let name = self.identifier()?;
        Type::from_name(&name).ok_or_else(|| {
            error_at(pos, "BC30002", format!("Type '{name}' is not defined."))
        })
    }

    fn skip_newlines(&mut self) {
        while *self.peek() == Token::Newline {
            self.advance();
        }
    }

    fn at_statement_end(&self) -> bool {
        matches!(self.peek(), Token::Newline | Token::Eof)
    }

    fn end_of_statement(&mut self) -> ParseResult<()> {
        match self.peek() {
            Token::Newline => {
                self.advance();
                Ok(())
            }
            Token::Eof => Ok(()),
            other => Err(error_at(
                self.pos(),
                "BC30205",
                format!("End of statement expected but found {}.", other.describe()),
            )),
        }
    }

    /// Skip to the start of the next statement
    fn synchronize(&mut self) {
        while !self.at_statement_end() {
            self.advance();
        }
        self.skip_newlines();
    }

    fn report(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
        self.synchronize();
    }

    fn program(&mut self) -> Program {
        let mut program = Program::default();
        loop {
            self.skip_newlines();
            match self.peek() {
                Token::Eof => return program,
                Token::Keyword(Keyword::Function | Keyword::Sub) => match self.function() {
                    Ok(function) => program.functions.push(function),
                    Err(d) => self.report(d),
                },
                Token::Keyword(Keyword::End | Keyword::Else | Keyword::ElseIf | Keyword::Next) => {
                    let pos = self.pos();
                    let d = error_at(
                        pos,
                        "BC30087",
                        format!("{} must be preceded by a matching block statement.", self.peek().describe()),
                    );
                    self.advance();
                    self.report(d);
                }
                _ => match self.statement().and_then(|s| self.end_of_statement().map(|_| s)) {
                    Ok(stmt) => program.body.push(stmt),
                    Err(d) => self.report(d),
                },
            }
        }
    }

    fn function(&mut self) -> ParseResult<Function> {
        let pos = self.pos();
        let is_sub = self.at_keyword(Keyword::Sub);
        self.advance();
        let name = self.identifier()?;

        let mut params = Vec::new();
        if *self.peek() == Token::LParen {
            self.advance();
            if *self.peek() != Token::RParen {
                loop {
                    self.eat_keyword(Keyword::ByVal);
                    let param_pos = self.pos();
                    let param_name = self.identifier()?;
                    let ty = if self.eat_keyword(Keyword::As) {
                        self.type_name()?
                    } else {
                        Type::Object
                    };
                    params.push(Param {
                        name: param_name,
                        ty,
                        pos: param_pos,
                    });
                    if *self.peek() == Token::Comma {
                        self.advance();
                    } else {
                        break;
                    }
                }
            }
            self.expect(Token::RParen, ")")?;
        }

        let return_type = if is_sub {
            None
        } else if self.eat_keyword(Keyword::As) {
            Some(self.type_name()?)
        } else {
            Some(Type::Object)
        };
        self.end_of_statement()?;

        let body = self.block();
        self.expect_keyword(Keyword::End, if is_sub { "BC30026" } else { "BC30027" })?;
        let closer = if is_sub { Keyword::Sub } else { Keyword::Function };
        self.expect_keyword(closer, if is_sub { "BC30026" } else { "BC30027" })?;
        self.end_of_statement()?;

        Ok(Function {
            name,
            params,
            return_type,
            body,
            pos,
        })
    }

    /// Statements up to (not including) a block terminator
    fn block(&mut self) -> Vec<Stmt> {
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek() {
                Token::Eof
                | Token::Keyword(Keyword::End | Keyword::ElseIf | Keyword::Else | Keyword::Next) => {
                    return stmts
                }
                Token::Keyword(Keyword::Function | Keyword::Sub) => {
                    let d = error_at(
                        self.pos(),
                        "BC30289",
                        "Statement cannot appear within a method body.",
                    );
                    self.report(d);
                }
                _ => match self.statement().and_then(|s| self.end_of_statement().map(|_| s)) {
                    Ok(stmt) => stmts.push(stmt),
                    Err(d) => self.report(d),
                },
            }
        }
    }

    fn statement(&mut self) -> ParseResult<Stmt> {
        let pos = self.pos();
        let kind = match self.peek().clone() {
            Token::Keyword(Keyword::Dim) => {
                self.advance();
                let name = self.identifier()?;
                let ty = if self.eat_keyword(Keyword::As) {
                    Some(self.type_name()?)
                } else {
                    None
                };
                let init = if *self.peek() == Token::Eq {
                    self.advance();
                    Some(self.expr()?)
                } else {
                    None
                };
                StmtKind::Dim { name, ty, init }
            }
            Token::Keyword(Keyword::If) => return self.if_statement(),
            Token::Keyword(Keyword::For) => return self.for_statement(),
            Token::Keyword(Keyword::While) => {
                self.advance();
                let cond = self.expr()?;
                self.end_of_statement()?;
                let body = self.block();
                self.expect_keyword(Keyword::End, "BC30082")?;
                self.expect_keyword(Keyword::While, "BC30082")?;
                StmtKind::While { cond, body }
            }
            Token::Keyword(Keyword::Return) => {
                self.advance();
                if self.at_statement_end() || self.at_keyword(Keyword::Else) {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.expr()?))
                }
            }
            Token::Keyword(Keyword::Exit) => {
                self.advance();
                // Leave the line break in place so recovery resumes on the next line
                let target = if self.at_statement_end() {
                    Token::Newline
                } else {
                    self.advance()
                };
                let kind = match target {
                    Token::Keyword(Keyword::For) => ExitKind::For,
                    Token::Keyword(Keyword::While) => ExitKind::While,
                    Token::Keyword(Keyword::Function) => ExitKind::Function,
                    Token::Keyword(Keyword::Sub) => ExitKind::Sub,
                    _ => {
                        return Err(error_at(
                            pos,
                            "BC30240",
                            "'Exit' must be followed by 'For', 'While', 'Function' or 'Sub'.",
                        ))
                    }
                };
                StmtKind::Exit(kind)
            }
            Token::Ident(_) => self.assignment_or_call()?,
            other => {
                return Err(error_at(
                    pos,
                    "BC30035",
                    format!("Syntax error near {}.", other.describe()),
                ))
            }
        };
        Ok(Stmt { kind, pos })
    }

    fn assignment_or_call(&mut self) -> ParseResult<StmtKind> {
        let target = self.postfix()?;

        let compound = match (self.peek(), self.peek_next()) {
            (Token::Plus, Token::Eq) => Some(BinaryOp::Add),
            (Token::Minus, Token::Eq) => Some(BinaryOp::Sub),
            (Token::Star, Token::Eq) => Some(BinaryOp::Mul),
            (Token::Amp, Token::Eq) => Some(BinaryOp::Concat),
            _ => None,
        };
        if let Some(op) = compound {
            self.advance();
            self.advance();
            let rhs = self.expr()?;
            let pos = target.pos;
            let value = Expr {
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(target.clone()),
                    rhs: Box::new(rhs),
                },
                pos,
            };
            return Ok(StmtKind::Assign { target, value });
        }

        if *self.peek() == Token::Eq {
            self.advance();
            let value = self.expr()?;
            return match target.kind {
                ExprKind::Name(_) | ExprKind::Member { .. } => Ok(StmtKind::Assign { target, value }),
                _ => Err(error_at(
                    target.pos,
                    "BC30068",
                    "Expression is a value and therefore cannot be the target of an assignment.",
                )),
            };
        }

        match target.kind {
            ExprKind::Name(_) | ExprKind::Member { .. } | ExprKind::Call { .. } => {
                Ok(StmtKind::Call(target))
            }
            _ => Err(error_at(target.pos, "BC30454", "Expression is not a method.")),
        }
    }

    fn if_statement(&mut self) -> ParseResult<Stmt> {
        let pos = self.pos();
        self.advance();
        let cond = self.expr()?;
        self.expect_keyword(Keyword::Then, "BC30081")?;

        if !self.at_statement_end() {
            // Single-line form: If c Then stmt [Else stmt]
            let then_stmt = self.statement()?;
            let otherwise = if self.eat_keyword(Keyword::Else) {
                vec![self.statement()?]
            } else {
                Vec::new()
            };
            return Ok(Stmt {
                kind: StmtKind::If {
                    branches: vec![(cond, vec![then_stmt])],
                    otherwise,
                },
                pos,
            });
        }

        self.end_of_statement()?;
        let mut branches = vec![(cond, self.block())];
        let mut otherwise = Vec::new();
        loop {
            if self.eat_keyword(Keyword::ElseIf) {
                let cond = self.expr()?;
                self.expect_keyword(Keyword::Then, "BC30081")?;
                self.end_of_statement()?;
                branches.push((cond, self.block()));
            } else if self.eat_keyword(Keyword::Else) {
                // `Else If` on one line behaves like `ElseIf`
                if self.eat_keyword(Keyword::If) {
                    let cond = self.expr()?;
                    self.expect_keyword(Keyword::Then, "BC30081")?;
                    self.end_of_statement()?;
                    branches.push((cond, self.block()));
                    continue;
                }
                self.end_of_statement()?;
                otherwise = self.block();
            } else {
                break;
            }
        }
        self.expect_keyword(Keyword::End, "BC30081")?;
        self.expect_keyword(Keyword::If, "BC30081")?;

        Ok(Stmt {
            kind: StmtKind::If { branches, otherwise },
            pos,
        })
    }

    fn for_statement(&mut self) -> ParseResult<Stmt> {
        let pos = self.pos();
        self.advance();
        let var = self.identifier()?;
        let declared = if self.eat_keyword(Keyword::As) {
            Some(self.type_name()?)
        } else {
            None
        };
        self.expect(Token::Eq, "=")?;
        let start = self.expr()?;
        self.expect_keyword(Keyword::To, "BC30249")?;
        let end = self.expr()?;
        let step = if self.eat_keyword(Keyword::Step) {
            Some(self.expr()?)
        } else {
            None
        };
        self.end_of_statement()?;

        let body = self.block();
        self.expect_keyword(Keyword::Next, "BC30084")?;
        if let Token::Ident(name) = self.peek().clone() {
            if !name.eq_ignore_ascii_case(&var) {
                return Err(error_at(
                    self.pos(),
                    "BC30070",
                    format!("Next control variable '{name}' does not match For loop control variable '{var}'."),
                ));
            }
            self.advance();
        }

        Ok(Stmt {
            kind: StmtKind::For {
                var,
                declared,
                start,
                end,
                step,
                body,
            },
            pos,
        })
    }

    pub(crate) fn expr(&mut self) -> ParseResult<Expr> {
        self.or_expr()
    }

    fn binary(lhs: Expr, op: BinaryOp, rhs: Expr) -> Expr {
        let pos = lhs.pos;
        Expr {
            kind: ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            pos,
        }
    }

    fn or_expr(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.and_expr()?;
        loop {
            let op = match self.peek() {
                Token::Keyword(Keyword::Or) => BinaryOp::Or,
                Token::Keyword(Keyword::OrElse) => BinaryOp::OrElse,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.and_expr()?;
            lhs = Self::binary(lhs, op, rhs);
        }
    }

    fn and_expr(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.not_expr()?;
        loop {
            let op = match self.peek() {
                Token::Keyword(Keyword::And) => BinaryOp::And,
                Token::Keyword(Keyword::AndAlso) => BinaryOp::AndAlso,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.not_expr()?;
            lhs = Self::binary(lhs, op, rhs);
        }
    }

    fn not_expr(&mut self) -> ParseResult<Expr> {
        if self.at_keyword(Keyword::Not) {
            let pos = self.pos();
            self.advance();
            let operand = self.not_expr()?;
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                pos,
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.concat()?;
        loop {
            let op = match self.peek() {
                Token::Eq => BinaryOp::Eq,
                Token::Ne => BinaryOp::Ne,
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.concat()?;
            lhs = Self::binary(lhs, op, rhs);
        }
    }

    fn concat(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.additive()?;
        while *self.peek() == Token::Amp && *self.peek_next() != Token::Eq {
            self.advance();
            let rhs = self.additive()?;
            lhs = Self::binary(lhs, BinaryOp::Concat, rhs);
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.modulo()?;
        loop {
            let op = match (self.peek(), self.peek_next()) {
                (_, Token::Eq) => return Ok(lhs),
                (Token::Plus, _) => BinaryOp::Add,
                (Token::Minus, _) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.modulo()?;
            lhs = Self::binary(lhs, op, rhs);
        }
    }

    fn modulo(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.int_div()?;
        while self.eat_keyword(Keyword::Mod) {
            let rhs = self.int_div()?;
            lhs = Self::binary(lhs, BinaryOp::Mod, rhs);
        }
        Ok(lhs)
    }

    fn int_div(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.multiplicative()?;
        while *self.peek() == Token::Backslash {
            self.advance();
            let rhs = self.multiplicative()?;
            lhs = Self::binary(lhs, BinaryOp::IntDiv, rhs);
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match (self.peek(), self.peek_next()) {
                (_, Token::Eq) => return Ok(lhs),
                (Token::Star, _) => BinaryOp::Mul,
                (Token::Slash, _) => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.unary()?;
            lhs = Self::binary(lhs, op, rhs);
        }
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        if *self.peek() == Token::Minus {
            let pos = self.pos();
            self.advance();
            let operand = self.unary()?;
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                },
                pos,
            });
        }
        if *self.peek() == Token::Plus {
            self.advance();
            return self.unary();
        }
        self.power()
    }

    fn power(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.postfix()?;
        while *self.peek() == Token::Caret {
            self.advance();
            let rhs = if *self.peek() == Token::Minus {
                self.unary()?
            } else {
                self.postfix()?
            };
            lhs = Self::binary(lhs, BinaryOp::Pow, rhs);
        }
        Ok(lhs)
    }

    fn postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let member = self.identifier()?;
                    let pos = expr.pos;
                    expr = Expr {
                        kind: ExprKind::Member {
                            object: Box::new(expr),
                            member,
                        },
                        pos,
                    };
                }
                Token::LParen => {
                    self.advance();
                    let mut args = Vec::new();
                    if *self.peek() != Token::RParen {
                        loop {
                            args.push(self.expr()?);
                            if *self.peek() == Token::Comma {
                                self.advance();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(Token::RParen, ")")?;
                    let pos = expr.pos;
                    expr = Expr {
                        kind: ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        pos,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let pos = self.pos();
        if self.at_statement_end() {
            return Err(error_at(
                pos,
                "BC30201",
                format!("Expression expected but found {}.", self.peek().describe()),
            ));
        }
        let kind = match self.advance() {
            Token::Integer(n) => ExprKind::Integer(n),
            Token::Double(n) => ExprKind::Double(n),
            Token::Str(s) => ExprKind::Str(s),
            Token::Keyword(Keyword::True) => ExprKind::Bool(true),
            Token::Keyword(Keyword::False) => ExprKind::Bool(false),
            Token::Keyword(Keyword::Nothing) => ExprKind::Nothing,
            Token::Ident(name) => ExprKind::Name(name),
            Token::LParen => {
                let inner = self.expr()?;
                self.expect(Token::RParen, ")")?;
                return Ok(inner);
            }
            other => {
                return Err(error_at(
                    pos,
                    "BC30201",
                    format!("Expression expected but found {}.", other.describe()),
                ))
            }
        };
        Ok(Expr { kind, pos })
    }
}
