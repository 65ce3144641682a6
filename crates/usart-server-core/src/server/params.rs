//! Command parameter parsing
//!
//! Parameters follow the keyword as a comma separated list,
//! `KEYWORD p1,p2,...,pn`, with any number of spaces allowed before the first
//! field and after each comma. A field is read like `scanf("%u")` or
//! `scanf("%x")` would: the leading run of digits counts, anything after it
//! up to the next comma is ignored.

use super::error::ParseError;

/// Numeric base of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Radix {
    /// Base 10
    Decimal,
    /// Hexadecimal, with or without a `0x` prefix
    Hex,
}

/// Sequential reader over the parameter part of a command
#[derive(Debug, Clone)]
pub struct ParamCursor<'a> {
    rest: &'a str,
    started: bool,
    exhausted: bool,
}

impl<'a> ParamCursor<'a> {
    /// `text` is everything after the command keyword
    pub fn new(text: &'a str) -> Self {
        Self {
            rest: text,
            started: false,
            exhausted: false,
        }
    }

    /// Raw text of the next field, or `None` when no field follows
    fn next_field(&mut self) -> Option<&'a str> {
        if self.started {
            let comma = self.rest.find(',')?;
            self.rest = &self.rest[comma + 1..];
        }
        self.started = true;

        let field = self.rest.trim_start_matches(' ');
        let end = field.find(',').unwrap_or(field.len());
        self.rest = &field[end..];
        Some(&field[..end])
    }

    /// Next field as a bare word (e.g. `RX`)
    pub fn required_word(&mut self, name: &'static str) -> Result<&'a str, ParseError> {
        let field = self
            .next_field()
            .ok_or(ParseError::MissingParameter(name))?;
        let word = field.trim_end();
        if word.is_empty() {
            return Err(ParseError::MissingParameter(name));
        }
        Ok(word)
    }

    /// Next field as a number; absent or malformed fails the command
    pub fn required(&mut self, name: &'static str, radix: Radix) -> Result<u32, ParseError> {
        let field = self
            .next_field()
            .ok_or(ParseError::MissingParameter(name))?;
        parse_number(field, radix).ok_or_else(|| ParseError::Malformed {
            name,
            text: field.trim_end().to_string(),
        })
    }

    /// Next field as a number, `None` when it is absent or malformed.
    /// Once an optional field is missing, every later one is too.
    pub fn optional(&mut self, radix: Radix) -> Option<u32> {
        if self.exhausted {
            return None;
        }
        let value = self.next_field().and_then(|f| parse_number(f, radix));
        if value.is_none() {
            self.exhausted = true;
        }
        value
    }
}

/// Parse the leading digits of `field`
pub fn parse_number(field: &str, radix: Radix) -> Option<u32> {
    let field = field.trim_start_matches(' ');
    let (digits, base) = match radix {
        Radix::Decimal => (field, 10),
        Radix::Hex => {
            let stripped = field
                .strip_prefix("0x")
                .or_else(|| field.strip_prefix("0X"))
                .unwrap_or(field);
            (stripped, 16)
        }
    };
    let end = digits
        .find(|c: char| !c.is_digit(base))
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    u32::from_str_radix(&digits[..end], base).ok()
}
