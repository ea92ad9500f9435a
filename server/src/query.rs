//! Parser for the tag query language.
//!
//! The same grammar describes the tag a match advertises and the filter a
//! client submits when searching:
//!
//! ```text
//! query := field (' ' field)*
//! field := ident ':' ' ' value
//! value := '!'? ident | '!'? '"' any* '"' | int | int '-' int | '<' int | '>' int
//! ```
//!
//! A bare or quoted value is a prefix match, `!` makes it exact, a single
//! integer matches equality and the three range forms cover `[lo, hi)`,
//! everything below and everything above a bound.

use thiserror::Error;

/// One parsed field of a tag or query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Prefix match on a string category.
    String(String),
    /// Exact match on a string category.
    ExactString(String),
    /// Equality on an int category.
    Int(i32),
    /// Half-open window `[lo, hi)` on an int category. `>n` uses
    /// `i32::MAX` as an inclusive upper bound.
    Range(i32, i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("expected field identifier")]
    ExpectedIdentifier,
    #[error("expected ':'")]
    ExpectedColon,
    #[error("expected ' '")]
    ExpectedSpace,
    #[error("expected signed integer")]
    ExpectedNumber,
    #[error("expected '-' or ' '")]
    ExpectedMinusOrSpace,
    #[error("expected '<' or '>'")]
    ExpectedDirection,
    #[error("expected string")]
    ExpectedString,
}

/// Parse failure with the byte offset just past the offending character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{offset}: {kind}")]
pub struct ParseError {
    pub offset: usize,
    pub kind: ErrorKind,
}

/// Parses a full query into its fields.
pub fn parse(data: &[u8]) -> Result<Vec<Field>, ParseError> {
    let mut scanner = Scanner::new(data);
    let mut result = Vec::new();

    while scanner.advance() {
        if !is_ident_start(scanner.current) {
            return Err(scanner.error(ErrorKind::ExpectedIdentifier));
        }
        let name = scanner.ident();

        if scanner.current != Some(b':') {
            return Err(scanner.error(ErrorKind::ExpectedColon));
        }
        scanner.advance();

        if scanner.current != Some(b' ') {
            return Err(scanner.error(ErrorKind::ExpectedSpace));
        }
        scanner.advance();

        let mut exact = false;
        if scanner.current == Some(b'!') {
            exact = true;
            scanner.advance();
        }

        if scanner.current == Some(b'"') {
            let value = scanner.quoted()?;
            result.push(Field { name, value: string_value(value, exact) });
            continue;
        }

        if is_ident_start(scanner.current) {
            let value = scanner.ident();
            result.push(Field { name, value: string_value(value, exact) });
            continue;
        }

        if exact {
            return Err(scanner.error(ErrorKind::ExpectedString));
        }

        if let Some(min) = scanner.number() {
            match scanner.current {
                Some(b'-') => {
                    scanner.advance();
                    match scanner.number() {
                        Some(max) => {
                            result.push(Field { name, value: FieldValue::Range(min, max) })
                        }
                        None => return Err(scanner.error(ErrorKind::ExpectedNumber)),
                    }
                }
                Some(b' ') | None => result.push(Field { name, value: FieldValue::Int(min) }),
                _ => return Err(scanner.error(ErrorKind::ExpectedMinusOrSpace)),
            }
            continue;
        }

        let below = match scanner.current {
            Some(b'>') => false,
            Some(b'<') => true,
            _ => return Err(scanner.error(ErrorKind::ExpectedDirection)),
        };
        scanner.advance();

        match scanner.number() {
            Some(num) if below => {
                result.push(Field { name, value: FieldValue::Range(i32::MIN, num) })
            }
            Some(num) => result.push(Field { name, value: FieldValue::Range(num, i32::MAX) }),
            None => return Err(scanner.error(ErrorKind::ExpectedNumber)),
        }
    }

    Ok(result)
}

fn string_value(value: String, exact: bool) -> FieldValue {
    if exact {
        FieldValue::ExactString(value)
    } else {
        FieldValue::String(value)
    }
}

struct Scanner<'a> {
    data: &'a [u8],
    current: Option<u8>,
    progress: usize,
    previous: usize,
}

impl<'a> Scanner<'a> {
    fn new(data: &'a [u8]) -> Scanner<'a> {
        Scanner { data, current: None, progress: 0, previous: 0 }
    }

    /// Moves to the next byte; at the end `current` becomes `None`.
    fn advance(&mut self) -> bool {
        self.previous = self.progress;
        match self.data.get(self.progress) {
            Some(&byte) => {
                self.progress += 1;
                self.current = Some(byte);
                true
            }
            None => {
                self.current = None;
                false
            }
        }
    }

    fn error(&self, kind: ErrorKind) -> ParseError {
        ParseError { offset: self.progress, kind }
    }

    /// Consumes the identifier starting at the current byte.
    fn ident(&mut self) -> String {
        let start = self.previous;
        while self.advance() && is_ident(self.current) {}
        String::from_utf8_lossy(&self.data[start..self.previous]).into_owned()
    }

    /// Consumes a quoted run. The opening quote is the current byte; the
    /// content runs to the closing quote or the end of input. Escapes are
    /// kept verbatim, they only shield a quote from terminating the run.
    fn quoted(&mut self) -> Result<String, ParseError> {
        let start = self.progress;
        let mut escaped = false;
        while self.advance() && (self.current != Some(b'"') || escaped) {
            escaped = self.current == Some(b'\\');
        }
        let end = self.previous;
        self.advance();

        match std::str::from_utf8(&self.data[start..end]) {
            Ok(s) => Ok(s.to_owned()),
            Err(_) => Err(ParseError { offset: self.progress, kind: ErrorKind::ExpectedString }),
        }
    }

    /// Consumes an optionally negative integer. Returns `None` when no
    /// digit was present (a lone `-` is still consumed).
    fn number(&mut self) -> Option<i32> {
        let mut negative = false;
        if self.current == Some(b'-') {
            negative = true;
            self.advance();
        }

        let mut result: i32 = 0;
        let mut has_digit = false;
        while let Some(byte) = self.current.filter(u8::is_ascii_digit) {
            result = result.wrapping_mul(10).wrapping_add(i32::from(byte - b'0'));
            has_digit = true;
            self.advance();
        }

        if negative {
            result = result.wrapping_neg();
        }
        has_digit.then_some(result)
    }
}

fn is_ident(byte: Option<u8>) -> bool {
    is_ident_start(byte) || byte.is_some_and(|b| b.is_ascii_digit())
}

fn is_ident_start(byte: Option<u8>) -> bool {
    matches!(byte, Some(b'a'..=b'z' | b'A'..=b'Z' | b'_'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, value: FieldValue) -> Field {
        Field { name: name.to_owned(), value }
    }

    #[test]
    fn mixed_value_forms() {
        let fields =
            parse(br#"field: value string: "value" exact: !value number: 10"#).unwrap();
        assert_eq!(
            fields,
            vec![
                field("field", FieldValue::String("value".to_owned())),
                field("string", FieldValue::String("value".to_owned())),
                field("exact", FieldValue::ExactString("value".to_owned())),
                field("number", FieldValue::Int(10)),
            ]
        );
    }

    #[test]
    fn range_forms() {
        let fields = parse(b"range: -10-20 range: >-20 range: <-20").unwrap();
        assert_eq!(
            fields,
            vec![
                field("range", FieldValue::Range(-10, 20)),
                field("range", FieldValue::Range(-20, i32::MAX)),
                field("range", FieldValue::Range(i32::MIN, -20)),
            ]
        );
    }

    #[test]
    fn quoted_strings_keep_escapes_and_spaces() {
        let fields = parse(br#"name: "two words" other: "a \" quote""#).unwrap();
        assert_eq!(
            fields,
            vec![
                field("name", FieldValue::String("two words".to_owned())),
                field("other", FieldValue::String(r#"a \" quote"#.to_owned())),
            ]
        );
    }

    #[test]
    fn exact_quoted() {
        let fields = parse(br#"mode: !"capture the flag""#).unwrap();
        assert_eq!(
            fields,
            vec![field("mode", FieldValue::ExactString("capture the flag".to_owned()))]
        );
    }

    #[test]
    fn empty_query_is_empty() {
        assert_eq!(parse(b"").unwrap(), vec![]);
    }

    #[test]
    fn error_offsets() {
        let err = parse(b"field value").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExpectedColon);
        assert_eq!(err.offset, 6);

        let err = parse(b"field:value").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExpectedSpace);

        let err = parse(b"1field: x").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExpectedIdentifier);
        assert_eq!(err.offset, 1);

        let err = parse(b"num: !10").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExpectedString);

        let err = parse(b"num: 10x").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExpectedMinusOrSpace);

        let err = parse(b"num: 10-x").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExpectedNumber);

        let err = parse(b"num: ^").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExpectedDirection);

        let err = parse(b"num: >x").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExpectedNumber);
    }

    #[test]
    fn display_matches_wire_messages() {
        assert_eq!(ErrorKind::ExpectedColon.to_string(), "expected ':'");
        assert_eq!(ErrorKind::ExpectedMinusOrSpace.to_string(), "expected '-' or ' '");
        assert_eq!(ErrorKind::ExpectedNumber.to_string(), "expected signed integer");
    }
}
