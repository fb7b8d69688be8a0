//! BASIC tokenizer
//!
//! Keywords and identifiers are case-insensitive. `:` separates statements
//! like a newline, `'` and `Rem` start comments, and a trailing ` _` joins a
//! line with the next.

use crate::basic::ast::Pos;
use crate::diagnostics::Diagnostic;

/// Reserved words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Keyword {
    Dim,
    As,
    If,
    Then,
    ElseIf,
    Else,
    End,
    For,
    To,
    Step,
    Next,
    While,
    Function,
    Sub,
    Return,
    Exit,
    And,
    AndAlso,
    Or,
    OrElse,
    Not,
    Mod,
    True,
    False,
    Nothing,
    ByVal,
}

impl Keyword {
    fn lookup(word: &str) -> Option<Self> {
        let keyword = match word.to_ascii_lowercase().as_str() {
            "dim" => Self::Dim,
            "as" => Self::As,
            "if" => Self::If,
            "then" => Self::Then,
            "elseif" => Self::ElseIf,
            "else" => Self::Else,
            "end" => Self::End,
            "for" => Self::For,
            "to" => Self::To,
            "step" => Self::Step,
            "next" => Self::Next,
            "while" => Self::While,
            "function" => Self::Function,
            "sub" => Self::Sub,
            "return" => Self::Return,
            "exit" => Self::Exit,
            "and" => Self::And,
            "andalso" => Self::AndAlso,
            "or" => Self::Or,
            "orelse" => Self::OrElse,
            "not" => Self::Not,
            "mod" => Self::Mod,
            "true" => Self::True,
            "false" => Self::False,
            "nothing" => Self::Nothing,
            "byval" => Self::ByVal,
            _ => return None,
        };
        Some(keyword)
    }
}

/// Token kinds
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    Integer(i64),
    Double(f64),
    Str(String),
    Keyword(Keyword),
    Plus,
    Minus,
    Star,
    Slash,
    Backslash,
    Caret,
    Amp,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    Comma,
    Dot,
    Newline,
    Eof,
}

impl Token {
    /// Short description for error messages
    pub(crate) fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("'{name}'"),
            Token::Integer(n) => n.to_string(),
            Token::Double(n) => n.to_string(),
            Token::Str(_) => "string literal".to_string(),
            Token::Keyword(k) => format!("'{k:?}'"),
            Token::Newline => "end of statement".to_string(),
            Token::Eof => "end of file".to_string(),
            other => format!("{other:?}"),
        }
    }
}

/// Token with the position it started at
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub(crate) token: Token,
    pub(crate) pos: Pos,
}

pub(crate) struct Lexer {
    chars: Vec<char>,
    index: usize,
    line: usize,
    column: usize,
}

impl Lexer {
    pub(crate) fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            index: 0,
            line: 1,
            column: 1,
        }
    }

    fn pos(&self) -> Pos {
        Pos {
            line: self.line,
            column: self.column,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.index).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.index + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.index += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn skip_to_line_end(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.advance();
        }
    }

    /// `_` preceded by whitespace and followed only by whitespace up to the
    /// line end continues the statement on the next line
    fn is_continuation(&self) -> bool {
        let preceded = self.index == 0
            || self
                .chars
                .get(self.index - 1)
                .map(|c| c.is_whitespace())
                .unwrap_or(true);
        if !preceded {
            return false;
        }
        let mut offset = 1;
        while let Some(c) = self.peek_at(offset) {
            match c {
                '\n' => return true,
                '\r' | ' ' | '\t' => offset += 1,
                _ => return false,
            }
        }
        true
    }

    /// Tokenize the whole source
    pub(crate) fn tokenize(mut self) -> Result<Vec<Spanned>, Diagnostic> {
        let mut tokens: Vec<Spanned> = Vec::new();

        loop {
            let pos = self.pos();
            let Some(c) = self.peek() else {
                tokens.push(Spanned {
                    token: Token::Eof,
                    pos,
                });
                return Ok(tokens);
            };

            let token = match c {
                ' ' | '\t' | '\r' => {
                    self.advance();
                    continue;
                }
                '\'' => {
                    self.skip_to_line_end();
                    continue;
                }
                '_' if self.is_continuation() => {
                    self.skip_to_line_end();
                    self.advance();
                    continue;
                }
                '\n' | ':' => {
                    self.advance();
                    // Collapse runs of separators
                    if matches!(tokens.last().map(|t| &t.token), Some(Token::Newline) | None) {
                        continue;
                    }
                    Token::Newline
                }
                '"' => self.string(pos)?,
                c if c.is_ascii_digit() => self.number(pos)?,
                '.' if self.peek_at(1).map(|d| d.is_ascii_digit()).unwrap_or(false) => {
                    self.number(pos)?
                }
                c if c.is_alphabetic() || c == '_' => {
                    let word = self.identifier();
                    if word.eq_ignore_ascii_case("rem") {
                        self.skip_to_line_end();
                        continue;
                    }
                    match Keyword::lookup(&word) {
                        Some(keyword) => Token::Keyword(keyword),
                        None => Token::Ident(word),
                    }
                }
                _ => {
                    self.advance();
                    match c {
                        '+' => Token::Plus,
                        '-' => Token::Minus,
                        '*' => Token::Star,
                        '/' => Token::Slash,
                        '\\' => Token::Backslash,
                        '^' => Token::Caret,
                        '&' => Token::Amp,
                        '=' => Token::Eq,
                        '(' => Token::LParen,
                        ')' => Token::RParen,
                        ',' => Token::Comma,
                        '.' => Token::Dot,
                        '<' => match self.peek() {
                            Some('>') => {
                                self.advance();
                                Token::Ne
                            }
                            Some('=') => {
                                self.advance();
                                Token::Le
                            }
                            _ => Token::Lt,
                        },
                        '>' => match self.peek() {
                            Some('=') => {
                                self.advance();
                                Token::Ge
                            }
                            _ => Token::Gt,
                        },
                        other => {
                            return Err(Diagnostic::error(format!("Character '{other}' is not valid."))
                                .at(pos.line, pos.column)
                                .with_code("BC30037"))
                        }
                    }
                }
            };

            tokens.push(Spanned { token, pos });
        }
    }

    fn identifier(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                word.push(c);
                self.advance();
            } else {
                break;
            }
        }
        // Type characters such as `name$` are accepted and dropped
        if matches!(self.peek(), Some('$' | '%' | '!' | '#')) {
            self.advance();
        }
        word
    }

    fn string(&mut self, pos: Pos) -> Result<Token, Diagnostic> {
        self.advance();
        let mut text = String::new();
        loop {
            match self.advance() {
                Some('"') if self.peek() == Some('"') => {
                    self.advance();
                    text.push('"');
                }
                Some('"') => return Ok(Token::Str(text)),
                Some('\n') | None => {
                    return Err(Diagnostic::error("String constants must end with a double quote.")
                        .at(pos.line, pos.column)
                        .with_code("BC30648"))
                }
                Some(c) => text.push(c),
            }
        }
    }

    fn number(&mut self, pos: Pos) -> Result<Token, Diagnostic> {
        let mut digits = String::new();
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                digits.push(c);
            } else if c == '.' && !is_float && self.peek_at(1).map(|d| d.is_ascii_digit()).unwrap_or(false) {
                is_float = true;
                digits.push(c);
            } else {
                break;
            }
            self.advance();
        }
        let invalid = || {
            Diagnostic::error(format!("Numeric literal '{digits}' is out of range."))
                .at(pos.line, pos.column)
                .with_code("BC30036")
        };
        if is_float {
            digits.parse().map(Token::Double).map_err(|_| invalid())
        } else {
            digits.parse().map(Token::Integer).map_err(|_| invalid())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<Token> {
        Lexer::new(source)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn test_keywords_case_insensitive() {
        assert_eq!(
            tokens("DIM x as INTEGER"),
            vec![
                Token::Keyword(Keyword::Dim),
                Token::Ident("x".to_string()),
                Token::Keyword(Keyword::As),
                Token::Ident("INTEGER".to_string()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_separators_and_continuation() {
        let toks = tokens("x = 1 ' trailing\nRem whole line\ny = 2 : z = _\n  3");
        assert_eq!(
            toks,
            vec![
                Token::Ident("x".to_string()),
                Token::Eq,
                Token::Integer(1),
                Token::Newline,
                Token::Ident("y".to_string()),
                Token::Eq,
                Token::Integer(2),
                Token::Newline,
                Token::Ident("z".to_string()),
                Token::Eq,
                Token::Integer(3),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_literals_and_operators() {
        assert_eq!(
            tokens("\"say \"\"hi\"\"\" & 2.5 <> 3 <= 4"),
            vec![
                Token::Str("say \"hi\"".to_string()),
                Token::Amp,
                Token::Double(2.5),
                Token::Ne,
                Token::Integer(3),
                Token::Le,
                Token::Integer(4),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_positions() {
        let spanned = Lexer::new("x = 1\n  Return").tokenize().unwrap();
        let ret = spanned
            .iter()
            .find(|s| s.token == Token::Keyword(Keyword::Return))
            .unwrap();
        assert_eq!(ret.pos, Pos { line: 2, column: 3 });
    }

    #[test]
    fn test_unterminated_string() {
        let err = Lexer::new("x = \"open").tokenize().unwrap_err();
        assert_eq!(err.code.as_deref(), Some("BC30648"));
        assert_eq!(err.location.unwrap().column, 5);
    }
}
