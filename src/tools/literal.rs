//! Parser for Python-style literal structures: the shapes models produce when
//! they "almost" write JSON (single quotes, `True`/`None`, tuples, trailing
//! commas). Only literals are accepted; names, calls and operators other than a
//! leading sign on numbers are rejected.

use serde_json::{ Map, Number, Value };
use thiserror::Error;

const MAX_DEPTH: usize = 256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message} (line {line}, column {column})")]
pub struct LiteralError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

pub fn parse_literal(input: &str) -> Result<Value, LiteralError> {
    let mut parser = Parser { chars: input.chars().collect(), pos: 0, depth: 0 };
    parser.skip_ws();
    if parser.at_end() {
        return Err(parser.error("empty input"));
    }
    let value = parser.parse_value()?;
    parser.skip_ws();
    if !parser.at_end() {
        return Err(parser.error("unexpected trailing characters"));
    }
    Ok(value)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
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
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> LiteralError {
        let consumed = &self.chars[..self.pos.min(self.chars.len())];
        let line = consumed.iter().filter(|&&c| c == '\n').count() + 1;
        let column = consumed.iter().rev().take_while(|&&c| c != '\n').count() + 1;
        LiteralError { message: message.into(), line, column }
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.pos += 1;
            } else if c == '#' {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.pos += 1;
                }
            } else if c == '\\' && self.peek_at(1) == Some('\n') {
                self.pos += 2;
            } else {
                break;
            }
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), LiteralError> {
        self.skip_ws();
        match self.peek() {
            Some(c) if c == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(c) => Err(self.error(format!("expected '{}', found '{}'", expected, c))),
            None => Err(self.error(format!("expected '{}', found end of input", expected))),
        }
    }

    fn parse_value(&mut self) -> Result<Value, LiteralError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        let value = self.parse_value_inner();
        self.depth -= 1;
        value
    }

    fn parse_value_inner(&mut self) -> Result<Value, LiteralError> {
        self.skip_ws();
        let c = match self.peek() {
            Some(c) => c,
            None => {
                return Err(self.error("unexpected end of input"));
            }
        };

        match c {
            '{' => self.parse_brace(),
            '[' => {
                self.pos += 1;
                self.parse_sequence(']').map(Value::Array)
            }
            '(' => self.parse_paren(),
            '\'' | '"' => self.parse_strings(),
            '-' | '+' => {
                self.pos += 1;
                self.skip_ws();
                match self.peek() {
                    Some(d) if d.is_ascii_digit() || d == '.' => self.parse_number(c == '-'),
                    _ => Err(self.error(format!("'{}' may only precede a number", c))),
                }
            }
            d if d.is_ascii_digit() => self.parse_number(false),
            '.' if self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) => self.parse_number(false),
            a if a.is_alphabetic() || a == '_' => {
                if self.string_prefix_len().is_some() {
                    return self.parse_strings();
                }
                self.parse_name()
            }
            other => Err(self.error(format!("unexpected character '{}'", other))),
        }
    }

    /// Items up to `close`, separated by commas, trailing comma allowed.
    fn parse_sequence(&mut self, close: char) -> Result<Vec<Value>, LiteralError> {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.pos += 1;
                return Ok(items);
            }
            items.push(self.parse_value()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.pos += 1;
                }
                Some(c) if c == close => {
                    self.pos += 1;
                    return Ok(items);
                }
                Some(c) => {
                    return Err(self.error(format!("expected ',' or '{}', found '{}'", close, c)));
                }
                None => {
                    return Err(self.error(format!("expected '{}', found end of input", close)));
                }
            }
        }
    }

    /// A parenthesised value, or a tuple when a comma is present.
    fn parse_paren(&mut self) -> Result<Value, LiteralError> {
        self.pos += 1;
        self.skip_ws();
        if self.peek() == Some(')') {
            self.pos += 1;
            return Ok(Value::Array(Vec::new()));
        }
        let first = self.parse_value()?;
        self.skip_ws();
        match self.peek() {
            Some(')') => {
                self.pos += 1;
                Ok(first)
            }
            Some(',') => {
                self.pos += 1;
                let mut items = vec![first];
                items.extend(self.parse_sequence(')')?);
                Ok(Value::Array(items))
            }
            Some(c) => Err(self.error(format!("expected ',' or ')', found '{}'", c))),
            None => Err(self.error("expected ')', found end of input")),
        }
    }

    /// A dict, or a set (returned as an array) when the first item has no ':'.
    fn parse_brace(&mut self) -> Result<Value, LiteralError> {
        self.pos += 1;
        self.skip_ws();
        if self.peek() == Some('}') {
            self.pos += 1;
            return Ok(Value::Object(Map::new()));
        }

        let first = self.parse_value()?;
        self.skip_ws();
        if self.peek() != Some(':') {
            let mut items = vec![first];
            match self.peek() {
                Some(',') => {
                    self.pos += 1;
                    items.extend(self.parse_sequence('}')?);
                }
                Some('}') => {
                    self.pos += 1;
                }
                Some(c) => {
                    return Err(self.error(format!("expected ',', ':' or '}}', found '{}'", c)));
                }
                None => {
                    return Err(self.error("expected '}', found end of input"));
                }
            }
            return Ok(Value::Array(items));
        }

        let mut map = Map::new();
        let mut key = first;
        loop {
            self.expect(':')?;
            let value = self.parse_value()?;
            map.insert(self.key_string(key)?, value);

            self.skip_ws();
            match self.bump() {
                Some(',') => {
                    self.skip_ws();
                    if self.peek() == Some('}') {
                        self.pos += 1;
                        return Ok(Value::Object(map));
                    }
                    key = self.parse_value()?;
                }
                Some('}') => {
                    return Ok(Value::Object(map));
                }
                Some(c) => {
                    self.pos -= 1;
                    return Err(self.error(format!("expected ',' or '}}', found '{}'", c)));
                }
                None => {
                    return Err(self.error("expected '}', found end of input"));
                }
            }
        }
    }

    /// Dict keys are stringified the way a JSON encoder would.
    fn key_string(&self, key: Value) -> Result<String, LiteralError> {
        match key {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Null => Ok("null".to_string()),
            Value::Array(_) | Value::Object(_) => Err(self.error("unhashable dict key")),
        }
    }

    fn parse_name(&mut self) -> Result<Value, LiteralError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        match name.as_str() {
            "True" => Ok(Value::Bool(true)),
            "False" => Ok(Value::Bool(false)),
            "None" => Ok(Value::Null),
            _ => {
                self.pos = start;
                Err(self.error(format!("malformed node or string: name '{}'", name)))
            }
        }
    }

    fn parse_number(&mut self, negative: bool) -> Result<Value, LiteralError> {
        let start = self.pos;
        let radix_literal = self.is_radix_literal(start);
        while let Some(c) = self.peek() {
            let exponent_sign =
                (c == '+' || c == '-') &&
                matches!(self.chars.get(self.pos.wrapping_sub(1)), Some('e') | Some('E')) &&
                !radix_literal;
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || exponent_sign {
                self.pos += 1;
            } else {
                break;
            }
        }
        let source: String = self.chars[start..self.pos].iter().collect();
        if !underscores_are_separators(&source, radix_literal) {
            self.pos = start;
            return Err(self.error(format!("invalid decimal literal '{}'", source)));
        }
        let raw: String = source.chars().filter(|&c| c != '_').collect();
        let lower = raw.to_ascii_lowercase();

        if lower.ends_with('j') {
            self.pos = start;
            return Err(self.error("complex numbers are not supported"));
        }

        let radix = match lower.get(..2) {
            Some("0x") => Some(16),
            Some("0o") => Some(8),
            Some("0b") => Some(2),
            _ => None,
        };

        let number = if let Some(radix) = radix {
            i64::from_str_radix(&lower[2..], radix)
                .map(|n| Number::from(if negative { -n } else { n }))
                .map_err(|_| self.error(format!("invalid integer literal '{}'", raw)))?
        } else if lower.contains('.') || lower.contains('e') {
            let parsed: f64 = lower
                .parse()
                .map_err(|_| self.error(format!("invalid float literal '{}'", raw)))?;
            let signed = if negative { -parsed } else { parsed };
            match Number::from_f64(signed) {
                Some(n) => n,
                // Beyond f64: keep the literal text as an arbitrary-precision number.
                None => json_number(&float_as_json(&lower), negative)
                    .ok_or_else(|| self.error(format!("number out of range '{}'", raw)))?,
            }
        } else {
            if lower.len() > 1 && lower.starts_with('0') && lower.bytes().any(|b| b != b'0') {
                self.pos = start;
                return Err(self.error("leading zeros in decimal integer literals are not permitted"));
            }
            let signed = if negative { format!("-{}", lower) } else { lower.clone() };
            if let Ok(n) = signed.parse::<i64>() {
                Number::from(n)
            } else if let Ok(n) = signed.parse::<u64>() {
                Number::from(n)
            } else {
                json_number(&lower, negative).ok_or_else(||
                    self.error(format!("invalid integer literal '{}'", raw))
                )?
            }
        };
        Ok(Value::Number(number))
    }

    fn is_radix_literal(&self, start: usize) -> bool {
        self.chars.get(start) == Some(&'0') &&
            matches!(self.chars.get(start + 1), Some('x' | 'X' | 'o' | 'O' | 'b' | 'B'))
    }

    /// Length of a string prefix (`r`, `u`, `b`, `rb`, `br`) directly followed by a quote.
    fn string_prefix_len(&self) -> Option<usize> {
        let mut len = 0;
        while let Some(c) = self.peek_at(len) {
            if matches!(c, 'r' | 'R' | 'u' | 'U' | 'b' | 'B') && len < 2 {
                len += 1;
            } else {
                break;
            }
        }
        match self.peek_at(len) {
            Some('\'' | '"') if len > 0 => Some(len),
            _ => None,
        }
    }

    /// One or more adjacent string literals, concatenated.
    fn parse_strings(&mut self) -> Result<Value, LiteralError> {
        let mut out = String::new();
        loop {
            out.push_str(&self.parse_string()?);
            let save = self.pos;
            self.skip_ws();
            let next_is_string =
                matches!(self.peek(), Some('\'' | '"')) || self.string_prefix_len().is_some();
            if !next_is_string {
                self.pos = save;
                return Ok(Value::String(out));
            }
        }
    }

    fn parse_string(&mut self) -> Result<String, LiteralError> {
        let mut raw = false;
        if let Some(len) = self.string_prefix_len() {
            raw = self.chars[self.pos..self.pos + len].iter().any(|c| matches!(c, 'r' | 'R'));
            self.pos += len;
        }

        let quote = match self.bump() {
            Some(q @ ('\'' | '"')) => q,
            _ => {
                return Err(self.error("expected string"));
            }
        };
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.pos += 2;
        }

        let mut out = String::new();
        loop {
            let c = match self.bump() {
                Some(c) => c,
                None => {
                    return Err(self.error("unterminated string literal"));
                }
            };

            if c == quote {
                if !triple {
                    return Ok(out);
                }
                if self.peek() == Some(quote) && self.peek_at(1) == Some(quote) {
                    self.pos += 2;
                    return Ok(out);
                }
                out.push(c);
                continue;
            }

            if c == '\n' && !triple {
                self.pos -= 1;
                return Err(self.error("unterminated string literal"));
            }

            if c != '\\' {
                out.push(c);
                continue;
            }

            let escaped = match self.bump() {
                Some(e) => e,
                None => {
                    return Err(self.error("unterminated string literal"));
                }
            };
            if raw {
                out.push('\\');
                out.push(escaped);
                continue;
            }
            match escaped {
                '\n' => {}
                '\\' => out.push('\\'),
                '\'' => out.push('\''),
                '"' => out.push('"'),
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                'b' => out.push('\u{8}'),
                'f' => out.push('\u{c}'),
                'v' => out.push('\u{b}'),
                'a' => out.push('\u{7}'),
                '0'..='7' => {
                    let mut value = escaped.to_digit(8).unwrap_or(0);
                    for _ in 0..2 {
                        match self.peek().and_then(|d| d.to_digit(8)) {
                            Some(d) => {
                                value = value * 8 + d;
                                self.pos += 1;
                            }
                            None => {
                                break;
                            }
                        }
                    }
                    out.push(self.code_point(value)?);
                }
                'x' => out.push(self.hex_escape(2)?),
                'u' => out.push(self.hex_escape(4)?),
                'U' => out.push(self.hex_escape(8)?),
                other => {
                    out.push('\\');
                    out.push(other);
                }
            }
        }
    }

    fn hex_escape(&mut self, digits: usize) -> Result<char, LiteralError> {
        let mut value: u32 = 0;
        for _ in 0..digits {
            let d = self
                .peek()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| self.error(format!("truncated \\x/\\u escape, expected {} hex digits", digits)))?;
            value = value * 16 + d;
            self.pos += 1;
        }
        self.code_point(value)
    }

    fn code_point(&self, value: u32) -> Result<char, LiteralError> {
        char::from_u32(value).ok_or_else(|| self.error(format!("invalid code point {:#x}", value)))
    }
}

/// `_` may only sit between two digits, or directly after a `0x`/`0o`/`0b` prefix.
fn underscores_are_separators(source: &str, radix_literal: bool) -> bool {
    let chars: Vec<char> = source.chars().collect();
    chars
        .iter()
        .enumerate()
        .filter(|&(_, c)| *c == '_')
        .all(|(i, _)| {
            let prev = i.checked_sub(1).and_then(|j| chars.get(j)).copied();
            let next = chars.get(i + 1).copied();
            if radix_literal {
                next.is_some_and(|c| c.is_ascii_hexdigit()) &&
                    (i == 2 || prev.is_some_and(|c| c.is_ascii_hexdigit()))
            } else {
                next.is_some_and(|c| c.is_ascii_digit()) && prev.is_some_and(|c| c.is_ascii_digit())
            }
        })
}

/// Rewrites a Python float literal (`.5`, `1.`, `01.5e3`) into JSON number syntax.
fn float_as_json(lower: &str) -> String {
    let (mantissa, exponent) = match lower.split_once('e') {
        Some((m, e)) => (m, Some(e)),
        None => (lower, None),
    };
    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (mantissa, None),
    };
    let int_part = int_part.trim_start_matches('0');
    let mut text = if int_part.is_empty() { "0".to_string() } else { int_part.to_string() };
    if let Some(frac) = frac_part {
        text.push('.');
        text.push_str(if frac.is_empty() { "0" } else { frac });
    }
    if let Some(exp) = exponent {
        text.push('e');
        text.push_str(exp);
    }
    text
}

/// A number kept at its full source precision.
fn json_number(text: &str, negative: bool) -> Option<Number> {
    let signed = if negative { format!("-{}", text) } else { text.to_string() };
    serde_json::from_str::<Number>(&signed).ok()
}
