//! Shell tokenizer
//!
//! Whitespace is significant in a few places: `-name` is an operator or a
//! parameter only when it does not directly follow a value, and `.member`,
//! `[index]` and `(args)` bind only when nothing separates them from the
//! value on their left.

use crate::diagnostics::Diagnostic;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TemplatePart {
    Text(String),
    Variable(String),
    /// Raw source of a `$( ... )` sub-expression and where it starts
    SubExpr {
        source: String,
        line: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Variable(String),
    Word(String),
    /// `-name`: comparison operator or command parameter
    Dash(String),
    /// `.name` attached to the preceding value
    Member(String),
    Str(String),
    Template(Vec<TemplatePart>),
    Integer(i64),
    Double(f64),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    AtParen,
    AtBrace,
    DollarParen,
    Comma,
    Semi,
    Newline,
    Pipe,
    Assign,
    PlusAssign,
    MinusAssign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    DotDot,
    Eof,
}

impl Token {
    pub(crate) fn describe(&self) -> String {
        match self {
            Token::Variable(name) => format!("${name}"),
            Token::Word(word) => word.clone(),
            Token::Dash(name) => format!("-{name}"),
            Token::Member(name) => format!(".{name}"),
            Token::Str(_) | Token::Template(_) => "string".to_string(),
            Token::Integer(i) => i.to_string(),
            Token::Double(d) => d.to_string(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
            Token::LBrace => "{".to_string(),
            Token::RBrace => "}".to_string(),
            Token::LBracket => "[".to_string(),
            Token::RBracket => "]".to_string(),
            Token::AtParen => "@(".to_string(),
            Token::AtBrace => "@{".to_string(),
            Token::DollarParen => "$(".to_string(),
            Token::Comma => ",".to_string(),
            Token::Semi => ";".to_string(),
            Token::Newline => "end of line".to_string(),
            Token::Pipe => "|".to_string(),
            Token::Assign => "=".to_string(),
            Token::PlusAssign => "+=".to_string(),
            Token::MinusAssign => "-=".to_string(),
            Token::Plus => "+".to_string(),
            Token::Minus => "-".to_string(),
            Token::Star => "*".to_string(),
            Token::Slash => "/".to_string(),
            Token::Percent => "%".to_string(),
            Token::Bang => "!".to_string(),
            Token::DotDot => "..".to_string(),
            Token::Eof => "end of input".to_string(),
        }
    }

    fn ends_value(&self) -> bool {
        matches!(
            self,
            Token::Variable(_)
                | Token::Member(_)
                | Token::Str(_)
                | Token::Template(_)
                | Token::Integer(_)
                | Token::Double(_)
                | Token::RParen
                | Token::RBracket
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub(crate) token: Token,
    pub(crate) line: usize,
    pub(crate) column: usize,
    /// Whitespace separates this token from the previous one
    pub(crate) spaced: bool,
}

pub(crate) struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
}

fn is_word_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '/' | '\\')
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

impl Lexer {
    pub(crate) fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>, line: usize, column: usize) -> Diagnostic {
        Diagnostic::error(message).at(line, column)
    }

    pub(crate) fn tokenize(mut self) -> Result<Vec<Spanned>, Diagnostic> {
        let mut tokens: Vec<Spanned> = Vec::new();
        let mut spaced = true;

        loop {
            let Some(c) = self.peek() else {
                tokens.push(Spanned {
                    token: Token::Eof,
                    line: self.line,
                    column: self.column,
                    spaced,
                });
                return Ok(tokens);
            };
            let (line, column) = (self.line, self.column);

            match c {
                ' ' | '\t' | '\r' => {
                    self.bump();
                    spaced = true;
                    continue;
                }
                '`' if matches!(self.peek_at(1), Some('\n' | '\r')) => {
                    self.bump();
                    if self.peek() == Some('\r') {
                        self.bump();
                    }
                    self.bump();
                    spaced = true;
                    continue;
                }
                '#' => {
                    while !matches!(self.peek(), None | Some('\n')) {
                        self.bump();
                    }
                    continue;
                }
                '<' if self.peek_at(1) == Some('#') => {
                    self.bump();
                    self.bump();
                    loop {
                        match self.bump() {
                            Some('#') if self.peek() == Some('>') => {
                                self.bump();
                                break;
                            }
                            Some(_) => {}
                            None => return Err(self.error("Missing end of block comment '#>'", line, column)),
                        }
                    }
                    spaced = true;
                    continue;
                }
                _ => {}
            }

            let previous_ends_value = tokens.last().is_some_and(|t| t.token.ends_value());
            let token = match c {
                '\n' => {
                    self.bump();
                    Token::Newline
                }
                '$' => self.variable(line, column)?,
                '\'' => self.literal_string(line, column)?,
                '"' => self.template(line, column)?,
                '0'..='9' => self.number(line, column)?,
                '.' if self.peek_at(1) == Some('.') => {
                    self.bump();
                    self.bump();
                    Token::DotDot
                }
                '.' if previous_ends_value
                    && !spaced
                    && self.peek_at(1).is_some_and(is_word_start) =>
                {
                    self.bump();
                    Token::Member(self.take_while(is_name_char))
                }
                '-' if self.peek_at(1).is_some_and(char::is_alphabetic)
                    && (spaced || !previous_ends_value) =>
                {
                    self.bump();
                    Token::Dash(self.take_while(is_name_char))
                }
                '-' if self.peek_at(1) == Some('=') => {
                    self.bump();
                    self.bump();
                    Token::MinusAssign
                }
                '+' if self.peek_at(1) == Some('=') => {
                    self.bump();
                    self.bump();
                    Token::PlusAssign
                }
                '@' => {
                    self.bump();
                    match self.bump() {
                        Some('(') => Token::AtParen,
                        Some('{') => Token::AtBrace,
                        _ => return Err(self.error("Unexpected character '@'", line, column)),
                    }
                }
                c if is_word_start(c) => Token::Word(self.take_while(is_word_char)),
                _ => {
                    self.bump();
                    match c {
                        '(' => Token::LParen,
                        ')' => Token::RParen,
                        '{' => Token::LBrace,
                        '}' => Token::RBrace,
                        '[' => Token::LBracket,
                        ']' => Token::RBracket,
                        ',' => Token::Comma,
                        ';' => Token::Semi,
                        '|' => Token::Pipe,
                        '=' => Token::Assign,
                        '+' => Token::Plus,
                        '-' => Token::Minus,
                        '*' => Token::Star,
                        '/' => Token::Slash,
                        '%' => Token::Percent,
                        '!' => Token::Bang,
                        other => {
                            return Err(self.error(format!("Unexpected character '{other}'"), line, column))
                        }
                    }
                }
            };

            tokens.push(Spanned {
                token,
                line,
                column,
                spaced,
            });
            spaced = false;
        }
    }

    fn take_while(&mut self, accept: fn(char) -> bool) -> String {
        let mut text = String::new();
        while let Some(c) = self.peek().filter(|c| accept(*c)) {
            text.push(c);
            self.bump();
        }
        text
    }

    fn variable_name(&mut self, line: usize, column: usize) -> Result<String, Diagnostic> {
        if self.peek() == Some('{') {
            self.bump();
            let mut name = String::new();
            loop {
                match self.bump() {
                    Some('}') => break,
                    Some(c) => name.push(c),
                    None => return Err(self.error("Missing '}' in variable name", line, column)),
                }
            }
            return Ok(name);
        }

        let name = self.take_while(is_name_char);
        if name.is_empty() {
            return Err(self.error("Invalid variable reference '$'", line, column));
        }
        let scoped = ["script", "global", "local", "env"]
            .iter()
            .any(|scope| name.eq_ignore_ascii_case(scope));
        if scoped && self.peek() == Some(':') && self.peek_at(1).is_some_and(is_word_start) {
            self.bump();
            let inner = self.take_while(is_name_char);
            if name.eq_ignore_ascii_case("env") {
                return Ok(format!("env:{inner}"));
            }
            return Ok(inner);
        }
        Ok(name)
    }

    fn variable(&mut self, line: usize, column: usize) -> Result<Token, Diagnostic> {
        self.bump();
        if self.peek() == Some('(') {
            self.bump();
            return Ok(Token::DollarParen);
        }
        Ok(Token::Variable(self.variable_name(line, column)?))
    }

    fn literal_string(&mut self, line: usize, column: usize) -> Result<Token, Diagnostic> {
        self.bump();
        let mut text = String::new();
        loop {
            match self.bump() {
                Some('\'') if self.peek() == Some('\'') => {
                    self.bump();
                    text.push('\'');
                }
                Some('\'') => return Ok(Token::Str(text)),
                Some(c) => text.push(c),
                None => return Err(self.error("The string is missing the terminator: '", line, column)),
            }
        }
    }

    fn template(&mut self, line: usize, column: usize) -> Result<Token, Diagnostic> {
        self.bump();
        let mut parts = Vec::new();
        let mut text = String::new();

        loop {
            let Some(c) = self.bump() else {
                return Err(self.error("The string is missing the terminator: \"", line, column));
            };
            match c {
                '"' if self.peek() == Some('"') => {
                    self.bump();
                    text.push('"');
                }
                '"' => break,
                '`' => match self.bump() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some('0') => text.push('\0'),
                    Some(other) => text.push(other),
                    None => {
                        return Err(self.error("The string is missing the terminator: \"", line, column))
                    }
                },
                '$' if self.peek() == Some('(') => {
                    let (sub_line, sub_column) = (self.line, self.column);
                    self.bump();
                    let source = self.balanced_parens(sub_line, sub_column)?;
                    if !text.is_empty() {
                        parts.push(TemplatePart::Text(std::mem::take(&mut text)));
                    }
                    parts.push(TemplatePart::SubExpr {
                        source,
                        line: sub_line,
                    });
                }
                '$' if self.peek().is_some_and(|c| is_word_start(c) || c == '{') => {
                    let name = self.variable_name(line, column)?;
                    if !text.is_empty() {
                        parts.push(TemplatePart::Text(std::mem::take(&mut text)));
                    }
                    parts.push(TemplatePart::Variable(name));
                }
                other => text.push(other),
            }
        }

        if !text.is_empty() {
            parts.push(TemplatePart::Text(text));
        }
        match parts.as_slice() {
            [] => Ok(Token::Str(String::new())),
            [TemplatePart::Text(only)] => Ok(Token::Str(only.clone())),
            _ => Ok(Token::Template(parts)),
        }
    }

    /// Source up to the `)` matching an already consumed `(`
    fn balanced_parens(&mut self, line: usize, column: usize) -> Result<String, Diagnostic> {
        let mut depth = 1usize;
        let mut source = String::new();
        let mut quote: Option<char> = None;
        loop {
            let Some(c) = self.bump() else {
                return Err(self.error("Missing closing ')' in subexpression", line, column));
            };
            match (quote, c) {
                (Some(q), c) if c == q => quote = None,
                (Some(_), _) => {}
                (None, '\'') => quote = Some('\''),
                (None, '(') => depth += 1,
                (None, ')') => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(source);
                    }
                }
                _ => {}
            }
            source.push(c);
        }
    }

    fn number(&mut self, line: usize, column: usize) -> Result<Token, Diagnostic> {
        let mut text = self.take_while(|c| c.is_ascii_digit());
        let fractional = self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit());
        if fractional {
            self.bump();
            text.push('.');
            text.push_str(&self.take_while(|c| c.is_ascii_digit()));
            return text
                .parse()
                .map(Token::Double)
                .map_err(|_| self.error(format!("Invalid number '{text}'"), line, column));
        }
        text.parse()
            .map(Token::Integer)
            .map_err(|_| self.error(format!("The number '{text}' is too large"), line, column))
    }
}
