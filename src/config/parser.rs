//! Config file parser.
//!
//! Grammar (HOCON-like): flat `a.b = value` entries or nested groups
//! `a { b = value }`, `#` comments, quoted strings, decimal and scientific
//! numbers, durations with a unit suffix (`ms`, `s`, `min`, `h`), booleans,
//! URIs in `<…>`, lists `[…]`, maps `{key = value, …}`. Later entries
//! override earlier ones.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{Error, ErrorCode, Result};

use super::value::{ConfigValue, Settings};

/// Parses a whole config document.
pub fn parse_settings(input: &str) -> Result<Settings> {
    let mut parser = Parser::new(input);
    let mut settings = Settings::new();
    parser.parse_entries(&mut settings, "")?;
    parser.skip_trivia();
    if !parser.at_end() {
        return Err(parser.fail("trailing input"));
    }
    Ok(settings)
}

/// Parses a single value, as it would appear to the right of `=`.
/// Used by the CLI layer; an input that is not valid value syntax should be
/// treated as a bare string by the caller.
pub(crate) fn parse_value_str(input: &str) -> Result<ConfigValue> {
    let mut parser = Parser::new(input);
    parser.skip_trivia();
    let value = parser.parse_value()?;
    parser.skip_trivia();
    if !parser.at_end() {
        return Err(parser.fail("trailing input after value"));
    }
    Ok(value)
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            bytes: input.as_bytes(),
            pos: 0,
        }
    }

    fn fail(&self, message: &str) -> Error {
        let (line, column) = self.line_column();
        Error::with_message(
            ErrorCode::InvalidArgument,
            format!("config parse error at {line}:{column}: {message}"),
        )
    }

    fn line_column(&self) -> (usize, usize) {
        let mut line = 1;
        let mut column = 1;
        for &b in &self.bytes[..self.pos.min(self.bytes.len())] {
            if b == b'\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
        }
        (line, column)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn eat(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.pos += 1;
                }
                Some(b'#') => {
                    while let Some(b) = self.peek() {
                        self.pos += 1;
                        if b == b'\n' {
                            break;
                        }
                    }
                }
                _ => return,
            }
        }
    }

    /// Entries at one nesting level; `prefix` carries the dotted path of the
    /// enclosing groups.
    fn parse_entries(&mut self, settings: &mut Settings, prefix: &str) -> Result<()> {
        loop {
            self.skip_trivia();
            match self.peek() {
                None => return Ok(()),
                Some(b'}') if !prefix.is_empty() => return Ok(()),
                Some(_) => {}
            }
            let key = self.parse_key()?;
            let path = if prefix.is_empty() {
                key
            } else {
                format!("{prefix}.{key}")
            };
            self.skip_trivia();
            match self.peek() {
                Some(b'=') => {
                    self.pos += 1;
                    self.skip_trivia();
                    let value = self.parse_value()?;
                    settings.put(&path, value);
                    // Entry separators are optional; commas are tolerated.
                    self.skip_trivia();
                    self.eat(b',');
                }
                Some(b'{') => {
                    self.pos += 1;
                    self.parse_entries(settings, &path)?;
                    self.skip_trivia();
                    if !self.eat(b'}') {
                        return Err(self.fail("expected '}' closing a group"));
                    }
                }
                _ => return Err(self.fail("expected '=' or '{' after a key")),
            }
        }
    }

    fn parse_key(&mut self) -> Result<String> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.fail("expected a key"));
        }
        let key = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| self.fail("key is not valid UTF-8"))?;
        Ok(key.to_string())
    }

    fn parse_value(&mut self) -> Result<ConfigValue> {
        match self.peek() {
            Some(b'"') => self.parse_string(),
            Some(b'<') => self.parse_uri(),
            Some(b'[') => self.parse_list(),
            Some(b'{') => self.parse_map(),
            Some(b) if b == b'-' || b.is_ascii_digit() => self.parse_number(),
            Some(b) if b.is_ascii_alphabetic() => self.parse_word(),
            _ => Err(self.fail("expected a value")),
        }
    }

    fn parse_string(&mut self) -> Result<ConfigValue> {
        self.pos += 1; // opening quote
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.fail("unterminated string")),
                Some(b'"') => return Ok(ConfigValue::String(out)),
                Some(b'\\') => match self.bump() {
                    Some(b'n') => out.push('\n'),
                    Some(b't') => out.push('\t'),
                    Some(b'\\') => out.push('\\'),
                    Some(b'"') => out.push('"'),
                    _ => return Err(self.fail("invalid escape sequence")),
                },
                Some(b) => out.push(b as char),
            }
        }
    }

    fn parse_uri(&mut self) -> Result<ConfigValue> {
        self.pos += 1; // '<'
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == b'>' {
                let uri = std::str::from_utf8(&self.bytes[start..self.pos])
                    .map_err(|_| self.fail("uri is not valid UTF-8"))?
                    .to_string();
                self.pos += 1;
                return Ok(ConfigValue::Uri(uri));
            }
            self.pos += 1;
        }
        Err(self.fail("unterminated uri"))
    }

    fn parse_list(&mut self) -> Result<ConfigValue> {
        self.pos += 1; // '['
        let mut items = Vec::new();
        loop {
            self.skip_trivia();
            if self.eat(b']') {
                return Ok(ConfigValue::List(items));
            }
            items.push(self.parse_value()?);
            self.skip_trivia();
            if !self.eat(b',') {
                self.skip_trivia();
                if self.eat(b']') {
                    return Ok(ConfigValue::List(items));
                }
                return Err(self.fail("expected ',' or ']' in a list"));
            }
        }
    }

    fn parse_map(&mut self) -> Result<ConfigValue> {
        self.pos += 1; // '{'
        let mut map = BTreeMap::new();
        loop {
            self.skip_trivia();
            if self.eat(b'}') {
                return Ok(ConfigValue::Map(map));
            }
            let key = self.parse_key()?;
            self.skip_trivia();
            if !self.eat(b'=') {
                return Err(self.fail("expected '=' in a map entry"));
            }
            self.skip_trivia();
            let value = self.parse_value()?;
            map.insert(key, value);
            self.skip_trivia();
            self.eat(b',');
        }
    }

    fn parse_number(&mut self) -> Result<ConfigValue> {
        let start = self.pos;
        self.eat(b'-');
        let mut is_real = false;
        while let Some(b) = self.peek() {
            match b {
                b'0'..=b'9' => self.pos += 1,
                b'.' | b'e' | b'E' => {
                    is_real = true;
                    self.pos += 1;
                    // Allow a sign right after the exponent marker.
                    if matches!(b, b'e' | b'E') && matches!(self.peek(), Some(b'+') | Some(b'-')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
        let digits = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| self.fail("number is not valid UTF-8"))?;
        // Unit suffix turns the number into a duration.
        let suffix_start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphabetic() {
                self.pos += 1;
            } else {
                break;
            }
        }
        let suffix = std::str::from_utf8(&self.bytes[suffix_start..self.pos])
            .map_err(|_| self.fail("suffix is not valid UTF-8"))?;
        if !suffix.is_empty() {
            let magnitude: f64 = digits
                .parse()
                .map_err(|_| self.fail("invalid duration magnitude"))?;
            if magnitude < 0.0 {
                return Err(self.fail("durations cannot be negative"));
            }
            let seconds = match suffix {
                "ms" => magnitude / 1000.0,
                "s" => magnitude,
                "min" => magnitude * 60.0,
                "h" => magnitude * 3600.0,
                other => return Err(self.fail(&format!("unknown duration unit '{other}'"))),
            };
            return Ok(ConfigValue::Duration(Duration::from_secs_f64(seconds)));
        }
        if is_real {
            let x: f64 = digits.parse().map_err(|_| self.fail("invalid real"))?;
            Ok(ConfigValue::Real(x))
        } else {
            let n: i64 = digits.parse().map_err(|_| self.fail("invalid integer"))?;
            Ok(ConfigValue::Integer(n))
        }
    }

    fn parse_word(&mut self) -> Result<ConfigValue> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let word = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| self.fail("word is not valid UTF-8"))?;
        match word {
            "true" => Ok(ConfigValue::Bool(true)),
            "false" => Ok(ConfigValue::Bool(false)),
            other => Err(self.fail(&format!("unexpected word '{other}'"))),
        }
    }
}
