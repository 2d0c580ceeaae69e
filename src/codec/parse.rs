//! Response parser: one framed response in, one attribute tree out.
//!
//! The input is a complete frame as produced by the framing scanner: a
//! single server line with its terminator removed and any announced
//! literal payloads spliced in verbatim after their `{N}` markers. Literal
//! payloads are consumed by length and never scanned, so the parser is
//! byte-clean.

#![allow(clippy::missing_errors_doc)]

use bytes::Bytes;

use crate::error::{Error, Result};

use super::{is_status_command, Attribute, Response};

/// Parses one framed response.
pub fn parse(input: &[u8]) -> Result<Response> {
    let mut parser = Parser::new(input);

    let tag = parser.read_token()?;
    if tag == "+" {
        let mut response = Response::new("+", "");
        parser.skip_space();
        let text = parser.rest_as_text();
        if !text.is_empty() {
            response.attributes.push(Attribute::Text(text));
        }
        return Ok(response);
    }

    parser.skip_space();
    let command = parser.read_token()?;
    let mut response = Response::new(tag, command);

    if is_status_command(&response.command) {
        parser.skip_space();
        if parser.peek() == Some(b'[') {
            response.attributes.push(parser.read_section()?);
            parser.skip_space();
        }
        let text = parser.rest_as_text();
        if !text.is_empty() {
            response.attributes.push(Attribute::Text(text));
        }
    } else {
        loop {
            parser.skip_space();
            if parser.at_end() {
                break;
            }
            let attribute = parser.read_attribute(false)?;
            response.attributes.push(attribute);
        }
    }

    Ok(response)
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    const fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn advance(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn skip_space(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::Parse {
            position: self.pos,
            message: message.into(),
        }
    }

    /// Reads a space-delimited token (used for the tag and command).
    fn read_token(&mut self) -> Result<String> {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if byte == b' ' {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error("expected token"));
        }
        String::from_utf8(self.input[start..self.pos].to_vec())
            .map_err(|_| self.error("token is not valid ASCII"))
    }

    /// Reads the remainder of the input as free text.
    fn rest_as_text(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.input[self.pos..]).into_owned();
        self.pos = self.input.len();
        text
    }

    fn read_attribute(&mut self, in_section: bool) -> Result<Attribute> {
        match self.peek() {
            Some(b'(') => self.read_list(in_section),
            Some(b'"') => self.read_quoted(),
            Some(b'{') => self.read_literal(),
            Some(_) => self.read_atom(in_section),
            None => Err(self.error("expected attribute")),
        }
    }

    fn read_list(&mut self, in_section: bool) -> Result<Attribute> {
        self.advance(); // (
        let mut items = Vec::new();
        loop {
            self.skip_space();
            match self.peek() {
                Some(b')') => {
                    self.advance();
                    return Ok(Attribute::List(items));
                }
                Some(_) => items.push(self.read_attribute(in_section)?),
                None => return Err(self.error("unterminated list")),
            }
        }
    }

    fn read_quoted(&mut self) -> Result<Attribute> {
        self.advance(); // "
        let mut value = Vec::new();
        loop {
            match self.advance() {
                Some(b'"') => break,
                Some(b'\\') => match self.advance() {
                    Some(byte @ (b'"' | b'\\')) => value.push(byte),
                    Some(byte) => {
                        return Err(self.error(format!("invalid escape: \\{}", byte as char)))
                    }
                    None => return Err(self.error("unterminated quoted string")),
                },
                Some(byte) => value.push(byte),
                None => return Err(self.error("unterminated quoted string")),
            }
        }
        String::from_utf8(value)
            .map(Attribute::Quoted)
            .map_err(|_| self.error("quoted string is not valid UTF-8"))
    }

    /// Reads a `{N}` or `{N+}` marker plus the N literal bytes that follow
    /// its line break.
    fn read_literal(&mut self) -> Result<Attribute> {
        self.advance(); // {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error("literal size missing"));
        }
        let size: usize = std::str::from_utf8(&self.input[start..self.pos])
            .ok()
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| self.error("invalid literal size"))?;
        if self.peek() == Some(b'+') {
            self.advance();
        }
        if self.advance() != Some(b'}') {
            return Err(self.error("expected } after literal size"));
        }
        if self.peek() == Some(b'\r') {
            self.advance();
        }
        if self.advance() != Some(b'\n') {
            return Err(self.error("expected line break after literal marker"));
        }
        if self.input.len() - self.pos < size {
            return Err(self.error(format!("literal truncated: expected {size} bytes")));
        }
        let payload = Bytes::copy_from_slice(&self.input[self.pos..self.pos + size]);
        self.pos += size;
        Ok(Attribute::Literal(payload))
    }

    /// Reads a bare atom, absorbing bracketed item specifiers such as
    /// `BODY[HEADER.FIELDS (FROM TO)]` wholesale.
    fn read_atom(&mut self, in_section: bool) -> Result<Attribute> {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            match byte {
                b' ' | b'(' | b')' | b'\r' | b'\n' => break,
                b']' if in_section => break,
                b'[' => self.absorb_brackets()?,
                _ => self.pos += 1,
            }
        }
        if self.pos == start {
            return Err(self.error("expected atom"));
        }
        String::from_utf8(self.input[start..self.pos].to_vec())
            .map(Attribute::Atom)
            .map_err(|_| self.error("atom is not valid UTF-8"))
    }

    /// Consumes a balanced `[...]` run, contents untouched.
    fn absorb_brackets(&mut self) -> Result<()> {
        let mut depth = 0usize;
        while let Some(byte) = self.advance() {
            match byte {
                b'[' => depth += 1,
                b']' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
        Err(self.error("unterminated bracket section"))
    }

    /// Reads a `[...]` response-code section of a status response.
    fn read_section(&mut self) -> Result<Attribute> {
        self.advance(); // [
        let mut entries = Vec::new();
        loop {
            self.skip_space();
            match self.peek() {
                Some(b']') => {
                    self.advance();
                    return Ok(Attribute::Section(entries));
                }
                Some(_) => entries.push(self.read_attribute(true)?),
                None => return Err(self.error("unterminated response code section")),
            }
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_greeting_with_capability_code() {
        let response = parse(b"* OK [CAPABILITY IMAP4rev1 LITERAL+] ready").unwrap();
        assert_eq!(response.tag, "*");
        assert_eq!(response.command, "OK");
        assert_eq!(response.attributes.len(), 2);
        assert_eq!(
            response.attributes[0],
            Attribute::Section(vec![
                Attribute::Atom("CAPABILITY".into()),
                Attribute::Atom("IMAP4rev1".into()),
                Attribute::Atom("LITERAL+".into()),
            ])
        );
        assert_eq!(response.attributes[1], Attribute::Text("ready".into()));
    }

    #[test]
    fn test_parse_numeric_untagged() {
        let response = parse(b"* 12 EXISTS").unwrap();
        assert_eq!(response.tag, "*");
        assert_eq!(response.command, "12");
        assert_eq!(response.attributes, vec![Attribute::Atom("EXISTS".into())]);
    }

    #[test]
    fn test_parse_fetch_with_literal() {
        let response = parse(b"* 1 FETCH (BODY[] {5}\r\nhello)").unwrap();
        assert_eq!(response.command, "1");
        assert_eq!(
            response.attributes,
            vec![
                Attribute::Atom("FETCH".into()),
                Attribute::List(vec![
                    Attribute::Atom("BODY[]".into()),
                    Attribute::Literal(Bytes::from_static(b"hello")),
                ]),
            ]
        );
    }

    #[test]
    fn test_parse_literal_is_byte_clean() {
        // A literal whose payload looks like protocol text must come
        // through untouched.
        let response = parse(b"* 1 FETCH (BODY[] {12}\r\nA) OK done\r\n)").unwrap();
        let Attribute::List(items) = &response.attributes[1] else {
            panic!("expected list");
        };
        assert_eq!(
            items[1],
            Attribute::Literal(Bytes::from_static(b"A) OK done\r\n"))
        );
    }

    #[test]
    fn test_parse_zero_length_literal() {
        let response = parse(b"* 1 FETCH (BODY[] {0}\r\n)").unwrap();
        let Attribute::List(items) = &response.attributes[1] else {
            panic!("expected list");
        };
        assert_eq!(items[1], Attribute::Literal(Bytes::new()));
    }

    #[test]
    fn test_parse_nonsync_literal_marker() {
        let response = parse(b"* 1 FETCH (BODY[] {5+}\r\nhello)").unwrap();
        let Attribute::List(items) = &response.attributes[1] else {
            panic!("expected list");
        };
        assert_eq!(items[1], Attribute::Literal(Bytes::from_static(b"hello")));
    }

    #[test]
    fn test_parse_bracketed_fetch_item() {
        let response = parse(b"* 2 FETCH (BODY[HEADER.FIELDS (FROM TO)] {2}\r\nhi)").unwrap();
        let Attribute::List(items) = &response.attributes[1] else {
            panic!("expected list");
        };
        assert_eq!(
            items[0],
            Attribute::Atom("BODY[HEADER.FIELDS (FROM TO)]".into())
        );
    }

    #[test]
    fn test_parse_quoted_string_with_escapes() {
        let response = parse(b"* LIST (\\Noselect) \"/\" \"a \\\"b\\\" c\"").unwrap();
        assert_eq!(
            response.attributes,
            vec![
                Attribute::List(vec![Attribute::Atom("\\Noselect".into())]),
                Attribute::Quoted("/".into()),
                Attribute::Quoted("a \"b\" c".into()),
            ]
        );
    }

    #[test]
    fn test_parse_tagged_no_with_code() {
        let response = parse(b"W2 NO [ALERT] bad mailbox").unwrap();
        assert_eq!(response.tag, "W2");
        assert_eq!(response.command, "NO");
        assert_eq!(
            response.attributes[0],
            Attribute::Section(vec![Attribute::Atom("ALERT".into())])
        );
        assert_eq!(response.attributes[1], Attribute::Text("bad mailbox".into()));
    }

    #[test]
    fn test_parse_continuation() {
        let response = parse(b"+ go").unwrap();
        assert!(response.is_continuation());
        assert_eq!(response.attributes, vec![Attribute::Text("go".into())]);

        let bare = parse(b"+").unwrap();
        assert!(bare.is_continuation());
        assert!(bare.attributes.is_empty());
    }

    #[test]
    fn test_parse_permanentflags_code() {
        let response = parse(b"* OK [PERMANENTFLAGS (\\Seen \\*)] limited").unwrap();
        assert_eq!(
            response.attributes[0],
            Attribute::Section(vec![
                Attribute::Atom("PERMANENTFLAGS".into()),
                Attribute::List(vec![
                    Attribute::Atom("\\Seen".into()),
                    Attribute::Atom("\\*".into()),
                ]),
            ])
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse(b"").is_err());
        assert!(parse(b"* LIST (\\Noselect").is_err());
        assert!(parse(b"* OK [ALERT oops").is_err());
        assert!(parse(b"* 1 FETCH ({5}\r\nhi)").is_err());
        assert!(parse(b"* 1 FETCH (\"open)").is_err());
    }

    #[test]
    fn test_parse_truncated_literal_is_rejected() {
        let err = parse(b"* 1 FETCH (BODY[] {10}\r\nhi)").unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }
}
