//! Text notation for abstract values.
//!
//! ```text
//! { layers { cli : { conn-type 3, conn-params shell : { args plain : "-i" } } } }
//! ```
//!
//! Inside braces `name value` is a named field and a bare value is a list
//! item; a brace holds one kind or the other. `label : value` selects a
//! choice alternative. Strings take the character after `\` literally and
//! `'0A FF'H` is a hex octet string.

use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

use super::value::{AsnValue, NdnError};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LBrace,
    RBrace,
    Comma,
    Colon,
    Ident(String),
    Int(i64),
    Octets(Vec<u8>),
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    peeked: Option<(usize, Token)>,
}

fn syntax(offset: usize, message: impl Into<String>) -> NdnError {
    NdnError::Syntax {
        offset,
        message: message.into(),
    }
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            src: text.as_bytes(),
            pos: 0,
            peeked: None,
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.src.len() && self.src[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Result<Option<&Token>, NdnError> {
        if self.peeked.is_none() {
            self.peeked = self.lex()?;
        }
        Ok(self.peeked.as_ref().map(|(_, t)| t))
    }

    fn next(&mut self) -> Result<Option<(usize, Token)>, NdnError> {
        match self.peeked.take() {
            Some(tok) => Ok(Some(tok)),
            None => self.lex(),
        }
    }

    fn offset(&self) -> usize {
        self.peeked.as_ref().map(|(o, _)| *o).unwrap_or(self.pos)
    }

    fn lex(&mut self) -> Result<Option<(usize, Token)>, NdnError> {
        self.skip_ws();
        let start = self.pos;
        let Some(&b) = self.src.get(self.pos) else {
            return Ok(None);
        };

        let token = match b {
            b'{' => {
                self.pos += 1;
                Token::LBrace
            }
            b'}' => {
                self.pos += 1;
                Token::RBrace
            }
            b',' => {
                self.pos += 1;
                Token::Comma
            }
            b':' => {
                self.pos += 1;
                Token::Colon
            }
            b'"' => Token::Octets(self.lex_string()?),
            b'\'' => Token::Octets(self.lex_hex()?),
            b'-' | b'0'..=b'9' => {
                self.pos += 1;
                while self.pos < self.src.len() && self.src[self.pos].is_ascii_digit() {
                    self.pos += 1;
                }
                let digits = std::str::from_utf8(&self.src[start..self.pos])
                    .map_err(|_| syntax(start, "bad integer"))?;
                let value = digits
                    .parse::<i64>()
                    .map_err(|e| syntax(start, format!("bad integer '{}': {}", digits, e)))?;
                Token::Int(value)
            }
            b if b.is_ascii_alphabetic() => {
                while self.pos < self.src.len() && is_ident_char(self.src[self.pos]) {
                    self.pos += 1;
                }
                let ident = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
                Token::Ident(ident)
            }
            other => {
                return Err(syntax(
                    start,
                    format!("unexpected character '{}'", other as char),
                ))
            }
        };
        Ok(Some((start, token)))
    }

    fn lex_string(&mut self) -> Result<Vec<u8>, NdnError> {
        let start = self.pos;
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            match self.src.get(self.pos) {
                None => return Err(syntax(start, "unterminated string")),
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(b'\\') => {
                    let Some(&escaped) = self.src.get(self.pos + 1) else {
                        return Err(syntax(start, "unterminated string"));
                    };
                    out.push(escaped);
                    self.pos += 2;
                }
                Some(&c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn lex_hex(&mut self) -> Result<Vec<u8>, NdnError> {
        let start = self.pos;
        self.pos += 1;
        let mut digits = String::new();
        loop {
            match self.src.get(self.pos) {
                None => return Err(syntax(start, "unterminated hex string")),
                Some(b'\'') => {
                    self.pos += 1;
                    break;
                }
                Some(c) if c.is_ascii_whitespace() => self.pos += 1,
                Some(&c) => {
                    digits.push(c as char);
                    self.pos += 1;
                }
            }
        }
        if self.src.get(self.pos) != Some(&b'H') {
            return Err(syntax(self.pos, "hex string must end with 'H"));
        }
        self.pos += 1;
        hex::decode(&digits).map_err(|e| syntax(start, format!("bad hex string: {}", e)))
    }
}

struct Parser<'a> {
    lexer: Lexer<'a>,
}

impl<'a> Parser<'a> {
    fn expect_next(&mut self, what: &str) -> Result<(usize, Token), NdnError> {
        let offset = self.lexer.offset();
        self.lexer
            .next()?
            .ok_or_else(|| syntax(offset, format!("expected {}, found end of input", what)))
    }

    fn value(&mut self) -> Result<AsnValue, NdnError> {
        let (offset, token) = self.expect_next("a value")?;
        match token {
            Token::Int(v) => Ok(AsnValue::Integer(v)),
            Token::Octets(data) => Ok(AsnValue::Octets(Bytes::from(data))),
            Token::LBrace => self.braces(offset),
            Token::Ident(label) => {
                let (offset, colon) = self.expect_next("':'")?;
                if colon != Token::Colon {
                    return Err(syntax(offset, format!("expected ':' after '{}'", label)));
                }
                Ok(AsnValue::Choice(label, Box::new(self.value()?)))
            }
            other => Err(syntax(offset, format!("unexpected {:?}", other))),
        }
    }

    fn braces(&mut self, open: usize) -> Result<AsnValue, NdnError> {
        let mut fields: Vec<(String, AsnValue)> = Vec::new();
        let mut items: Vec<AsnValue> = Vec::new();

        loop {
            match self.lexer.peek()? {
                None => return Err(syntax(open, "unbalanced '{'")),
                Some(Token::RBrace) => {
                    self.lexer.next()?;
                    break;
                }
                Some(Token::Ident(_)) => {
                    let Some((offset, Token::Ident(name))) = self.lexer.next()? else {
                        unreachable!("peeked an identifier");
                    };
                    if self.lexer.peek()? == Some(&Token::Colon) {
                        self.lexer.next()?;
                        let inner = self.value()?;
                        items.push(AsnValue::Choice(name, Box::new(inner)));
                    } else {
                        if self.lexer.peek()? == Some(&Token::Comma)
                            || self.lexer.peek()? == Some(&Token::RBrace)
                        {
                            return Err(syntax(offset, format!("field '{}' has no value", name)));
                        }
                        fields.push((name, self.value()?));
                    }
                }
                Some(_) => items.push(self.value()?),
            }

            if !fields.is_empty() && !items.is_empty() {
                return Err(syntax(open, "braces mix named fields and list items"));
            }

            match self.expect_next("',' or '}'")? {
                (_, Token::Comma) => continue,
                (_, Token::RBrace) => break,
                (offset, other) => {
                    return Err(syntax(offset, format!("expected ',' or '}}', found {:?}", other)))
                }
            }
        }

        if items.is_empty() {
            Ok(AsnValue::Sequence(fields))
        } else {
            Ok(AsnValue::SequenceOf(items))
        }
    }
}

/// Parse a value from text notation.
pub fn parse(text: &str) -> Result<AsnValue, NdnError> {
    let mut parser = Parser {
        lexer: Lexer::new(text),
    };
    let value = parser.value()?;
    if let Some((offset, token)) = parser.lexer.next()? {
        return Err(syntax(offset, format!("trailing {:?}", token)));
    }
    Ok(value)
}

impl FromStr for AsnValue {
    type Err = NdnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

fn printable(data: &[u8]) -> bool {
    match std::str::from_utf8(data) {
        Ok(s) => !s.chars().any(|c| c.is_control() && c != '\n' && c != '\t'),
        Err(_) => false,
    }
}

impl fmt::Display for AsnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsnValue::Integer(v) => write!(f, "{}", v),
            AsnValue::Octets(data) if printable(data) => {
                f.write_str("\"")?;
                for c in String::from_utf8_lossy(data).chars() {
                    if c == '"' || c == '\\' {
                        f.write_str("\\")?;
                    }
                    write!(f, "{}", c)?;
                }
                f.write_str("\"")
            }
            AsnValue::Octets(data) => write!(f, "'{}'H", hex::encode_upper(data)),
            AsnValue::Sequence(fields) => {
                if fields.is_empty() {
                    return f.write_str("{ }");
                }
                f.write_str("{ ")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{} {}", name, value)?;
                }
                f.write_str(" }")
            }
            AsnValue::SequenceOf(items) => {
                if items.is_empty() {
                    return f.write_str("{ }");
                }
                f.write_str("{ ")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(" }")
            }
            AsnValue::Choice(label, value) => write!(f, "{} : {}", label, value),
        }
    }
}
