//! InfluxQL lexer
//!
//! Keywords are not distinguished here: they lex as identifiers and the
//! parser matches them case-insensitively. Double-quoted identifiers lex as
//! `QuotedIdent` so they never match a keyword. A `/` starts a regex only
//! where an operand cannot precede it.

use crate::{RelayError, Result};
use std::iter::Peekable;
use std::str::CharIndices;

/// A lexer token
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Ident(String),
    QuotedIdent(String),
    String(String),
    Number(String),
    /// Duration literal in nanoseconds
    Duration(i64),
    Regex(String),
    Comma,
    Dot,
    Semicolon,
    OpenParen,
    CloseParen,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    Neq,
    EqRegex,
    NeqRegex,
    Lt,
    Lte,
    Gt,
    Gte,
    DoubleColon,
}

impl Token {
    /// Whether this is the unquoted keyword `kw`
    pub fn is_keyword(&self, kw: &str) -> bool {
        matches!(self, Token::Ident(s) if s.eq_ignore_ascii_case(kw))
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Token::Ident(s) | Token::Number(s) => f.write_str(s),
            Token::QuotedIdent(s) => write!(f, "\"{}\"", s),
            Token::String(s) => write!(f, "'{}'", s),
            Token::Duration(d) => write!(f, "{}ns", d),
            Token::Regex(r) => write!(f, "/{}/", r),
            Token::Comma => f.write_str(","),
            Token::Dot => f.write_str("."),
            Token::Semicolon => f.write_str(";"),
            Token::OpenParen => f.write_str("("),
            Token::CloseParen => f.write_str(")"),
            Token::Plus => f.write_str("+"),
            Token::Minus => f.write_str("-"),
            Token::Star => f.write_str("*"),
            Token::Slash => f.write_str("/"),
            Token::Percent => f.write_str("%"),
            Token::Eq => f.write_str("="),
            Token::Neq => f.write_str("!="),
            Token::EqRegex => f.write_str("=~"),
            Token::NeqRegex => f.write_str("!~"),
            Token::Lt => f.write_str("<"),
            Token::Lte => f.write_str("<="),
            Token::Gt => f.write_str(">"),
            Token::Gte => f.write_str(">="),
            Token::DoubleColon => f.write_str("::"),
        }
    }
}

/// A token with its byte span in the source
#[derive(Clone, Debug, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub start: usize,
    pub end: usize,
}

/// Nanoseconds per duration unit
pub fn duration_unit(unit: &str) -> Option<i64> {
    Some(match unit {
        "ns" => 1,
        "u" | "µ" | "us" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        "m" => 60 * 1_000_000_000,
        "h" => 3_600 * 1_000_000_000,
        "d" => 86_400 * 1_000_000_000,
        "w" => 604_800 * 1_000_000_000,
        _ => return None,
    })
}

/// Tokenizes an input string
pub struct Lexer<'a> {
    input: &'a str,
    iter: Peekable<CharIndices<'a>>,
    last: Option<Token>,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Lexer<'a> {
        Lexer {
            input,
            iter: input.char_indices().peekable(),
            last: None,
        }
    }

    /// Lex the whole input
    pub fn tokenize(mut self) -> Result<Vec<Spanned>> {
        let mut tokens = Vec::new();
        while let Some(spanned) = self.scan()? {
            self.last = Some(spanned.token.clone());
            tokens.push(spanned);
        }
        Ok(tokens)
    }

    fn pos(&mut self) -> usize {
        self.iter.peek().map(|(i, _)| *i).unwrap_or(self.input.len())
    }

    fn peek(&mut self) -> Option<char> {
        self.iter.peek().map(|(_, c)| *c)
    }

    fn next_if<F: Fn(char) -> bool>(&mut self, predicate: F) -> Option<char> {
        let c = self.peek().filter(|c| predicate(*c))?;
        self.iter.next();
        Some(c)
    }

    fn next_while<F: Fn(char) -> bool>(&mut self, predicate: F) -> String {
        let mut value = String::new();
        while let Some(c) = self.next_if(&predicate) {
            value.push(c);
        }
        value
    }

    fn scan(&mut self) -> Result<Option<Spanned>> {
        loop {
            self.next_while(char::is_whitespace);
            // -- line comments
            if self.input[self.pos()..].starts_with("--") {
                self.next_while(|c| c != '\n');
                continue;
            }
            break;
        }
        let start = self.pos();
        let token = match self.peek() {
            None => return Ok(None),
            Some('\'') => self.scan_quoted('\'').map(Token::String)?,
            Some('"') => self.scan_quoted('"').map(Token::QuotedIdent)?,
            Some(c) if c.is_ascii_digit() => self.scan_number()?,
            Some(c) if c.is_alphabetic() || c == '_' => {
                Token::Ident(self.next_while(|c| c.is_alphanumeric() || c == '_'))
            }
            Some('/') if self.regex_allowed() => self.scan_regex()?,
            Some(_) => self.scan_symbol()?,
        };
        let end = self.pos();
        Ok(Some(Spanned { token, start, end }))
    }

    fn regex_allowed(&self) -> bool {
        match &self.last {
            Some(Token::EqRegex) | Some(Token::NeqRegex) | Some(Token::Comma) => true,
            Some(t) => t.is_keyword("FROM") || t.is_keyword("BY"),
            None => false,
        }
    }

    fn scan_quoted(&mut self, quote: char) -> Result<String> {
        self.iter.next();
        let mut s = String::new();
        loop {
            match self.iter.next().map(|(_, c)| c) {
                Some('\\') => match self.iter.next().map(|(_, c)| c) {
                    Some('n') => s.push('\n'),
                    Some(c) => s.push(c),
                    None => break,
                },
                Some(c) if c == quote => return Ok(s),
                Some(c) => s.push(c),
                None => break,
            }
        }
        Err(RelayError::Parse(format!("unterminated {}-quoted literal", quote)))
    }

    fn scan_regex(&mut self) -> Result<Token> {
        self.iter.next();
        let mut s = String::new();
        loop {
            match self.iter.next().map(|(_, c)| c) {
                Some('\\') => match self.iter.next().map(|(_, c)| c) {
                    Some('/') => s.push('/'),
                    Some(c) => {
                        s.push('\\');
                        s.push(c);
                    }
                    None => break,
                },
                Some('/') => return Ok(Token::Regex(s)),
                Some(c) => s.push(c),
                None => break,
            }
        }
        Err(RelayError::Parse("unterminated regex".into()))
    }

    fn scan_number(&mut self) -> Result<Token> {
        let mut num = self.next_while(|c| c.is_ascii_digit());
        let mut integral = true;
        if self.next_if(|c| c == '.').is_some() {
            integral = false;
            num.push('.');
            num.push_str(&self.next_while(|c| c.is_ascii_digit()));
        }
        if let Some(exp) = self.next_if(|c| c == 'e' || c == 'E') {
            integral = false;
            num.push(exp);
            if let Some(sign) = self.next_if(|c| c == '+' || c == '-') {
                num.push(sign);
            }
            num.push_str(&self.next_while(|c| c.is_ascii_digit()));
        }
        if integral && self.peek().map(|c| c.is_alphabetic()).unwrap_or(false) {
            let unit = self.next_while(|c| c.is_alphabetic());
            let nanos = duration_unit(&unit)
                .ok_or_else(|| RelayError::Parse(format!("invalid duration unit {}{}", num, unit)))?;
            let n: i64 = num
                .parse()
                .map_err(|_| RelayError::Parse(format!("invalid duration {}{}", num, unit)))?;
            return n
                .checked_mul(nanos)
                .map(Token::Duration)
                .ok_or_else(|| RelayError::Parse(format!("duration out of range {}{}", num, unit)));
        }
        Ok(Token::Number(num))
    }

    fn scan_symbol(&mut self) -> Result<Token> {
        let Some((_, c)) = self.iter.next() else {
            return Err(RelayError::Parse("unexpected end of input".into()));
        };
        Ok(match c {
            ',' => Token::Comma,
            '.' => Token::Dot,
            ';' => Token::Semicolon,
            '(' => Token::OpenParen,
            ')' => Token::CloseParen,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '=' if self.next_if(|c| c == '~').is_some() => Token::EqRegex,
            '=' => Token::Eq,
            '!' if self.next_if(|c| c == '=').is_some() => Token::Neq,
            '!' if self.next_if(|c| c == '~').is_some() => Token::NeqRegex,
            '<' if self.next_if(|c| c == '=').is_some() => Token::Lte,
            '<' if self.next_if(|c| c == '>').is_some() => Token::Neq,
            '<' => Token::Lt,
            '>' if self.next_if(|c| c == '=').is_some() => Token::Gte,
            '>' => Token::Gt,
            ':' if self.next_if(|c| c == ':').is_some() => Token::DoubleColon,
            c => return Err(RelayError::Parse(format!("unexpected character {}", c))),
        })
    }
}
