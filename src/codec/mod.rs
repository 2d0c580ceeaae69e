//! IMAP grammar codec.
//!
//! The transport core hands every complete framed response to
//! [`parse`](crate::codec::parse()) and every outgoing request to
//! [`compile`]. Both sides work on a generic attribute tree rather than a
//! fully typed per-command model: the core only needs `{tag, command,
//! attributes}` to route responses, and higher layers interpret the
//! attributes of the commands they issued.

mod compile;
mod parse;

pub use compile::{compile, compile_for_log};
pub use parse::parse;

use std::collections::BTreeMap;

use bytes::Bytes;

/// A structured outgoing request.
///
/// The tag is assigned by the command queue at enqueue time; callers leave
/// it empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Command tag. Overwritten on enqueue.
    pub tag: String,
    /// Command name, e.g. `CAPABILITY` or `UID FETCH`.
    pub command: String,
    /// Command arguments.
    pub attributes: Vec<RequestAttribute>,
}

impl Request {
    /// Creates a request with no arguments.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            tag: String::new(),
            command: command.into(),
            attributes: Vec::new(),
        }
    }

    /// Appends a bare atom argument.
    #[must_use]
    pub fn atom(mut self, value: impl Into<String>) -> Self {
        self.attributes.push(RequestAttribute::Atom(value.into()));
        self
    }

    /// Appends a string argument (sent quoted).
    #[must_use]
    pub fn string(mut self, value: impl Into<String>) -> Self {
        self.attributes.push(RequestAttribute::String(value.into()));
        self
    }

    /// Appends a literal argument (sent as `{N}` + raw bytes).
    #[must_use]
    pub fn literal(mut self, value: impl Into<Bytes>) -> Self {
        self.attributes
            .push(RequestAttribute::Literal(value.into()));
        self
    }

    /// Appends a parenthesized list argument.
    #[must_use]
    pub fn list(mut self, items: Vec<RequestAttribute>) -> Self {
        self.attributes.push(RequestAttribute::List(items));
        self
    }
}

/// One argument of an outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestAttribute {
    /// Bare atom, written as-is.
    Atom(String),
    /// String value, written quoted with escaping.
    String(String),
    /// Opaque bytes, written as a synchronizing literal.
    Literal(Bytes),
    /// Parenthesized list of nested attributes.
    List(Vec<RequestAttribute>),
}

/// A parsed (and, after [`crate::process`], post-processed) server
/// response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Response {
    /// Response tag: `*` for untagged, `+` for continuation prompts, or a
    /// command tag.
    pub tag: String,
    /// Response name. For numeric-prefixed untagged responses this is the
    /// number at parse time and the promoted name (`EXISTS`, `FETCH`, ...)
    /// after post-processing.
    pub command: String,
    /// Message number from a numeric-prefixed untagged response.
    pub nr: Option<u32>,
    /// Remaining response data.
    pub attributes: Vec<Attribute>,
    /// Uppercased response code from a bracketed section, e.g. `ALERT`.
    pub code: Option<String>,
    /// Response-code arguments following the code itself.
    pub code_args: Vec<CodeArg>,
    /// Trailing human-readable text of a status response.
    pub human_readable: Option<String>,
    /// Untagged responses collected for the completed command, one bucket
    /// per accepted response name. Attached at tagged completion.
    pub payload: BTreeMap<String, Vec<Response>>,
}

impl Response {
    /// Creates a response with the given tag and command.
    #[must_use]
    pub fn new(tag: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            command: command.into(),
            ..Self::default()
        }
    }

    /// Returns true for untagged (`*`) responses.
    #[must_use]
    pub fn is_untagged(&self) -> bool {
        self.tag == "*"
    }

    /// Returns true for continuation (`+`) prompts.
    #[must_use]
    pub fn is_continuation(&self) -> bool {
        self.tag == "+"
    }

    /// Returns true for `OK`/`NO`/`BAD`/`BYE`/`PREAUTH` responses.
    #[must_use]
    pub fn is_status(&self) -> bool {
        is_status_command(&self.command)
    }
}

/// One parsed response attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    /// Bare atom, including numbers, flags (`\Seen`) and bracketed fetch
    /// items (`BODY[]`).
    Atom(String),
    /// Quoted string, unescaped.
    Quoted(String),
    /// Literal payload, byte-exact.
    Literal(Bytes),
    /// Parenthesized list.
    List(Vec<Attribute>),
    /// Bracketed response-code section of a status response.
    Section(Vec<Attribute>),
    /// Trailing free text of a status response.
    Text(String),
}

impl Attribute {
    /// Returns the attribute's value as a string, if it has one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Atom(s) | Self::Quoted(s) | Self::Text(s) => Some(s),
            Self::Literal(b) => std::str::from_utf8(b).ok(),
            Self::List(_) | Self::Section(_) => None,
        }
    }
}

/// One response-code argument after the code itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeArg {
    /// A single value, e.g. the `3` of `[UNSEEN 3]`.
    Value(String),
    /// A parenthesized group, e.g. the flags of `[PERMANENTFLAGS (...)]`.
    List(Vec<String>),
}

pub(crate) fn is_status_command(command: &str) -> bool {
    command.eq_ignore_ascii_case("OK")
        || command.eq_ignore_ascii_case("NO")
        || command.eq_ignore_ascii_case("BAD")
        || command.eq_ignore_ascii_case("BYE")
        || command.eq_ignore_ascii_case("PREAUTH")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::manual_string_new)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = Request::new("LOGIN").string("user").literal(&b"pass"[..]);
        assert_eq!(request.command, "LOGIN");
        assert_eq!(request.attributes.len(), 2);
        assert!(request.tag.is_empty());
    }

    #[test]
    fn test_response_kinds() {
        assert!(Response::new("*", "EXISTS").is_untagged());
        assert!(Response::new("+", "").is_continuation());
        assert!(Response::new("W1", "OK").is_status());
        assert!(!Response::new("W1", "FETCH").is_status());
    }

    #[test]
    fn test_status_command_case_insensitive() {
        assert!(is_status_command("ok"));
        assert!(is_status_command("PREAUTH"));
        assert!(!is_status_command("CAPABILITY"));
    }

    #[test]
    fn test_attribute_as_str() {
        assert_eq!(Attribute::Atom("FETCH".into()).as_str(), Some("FETCH"));
        assert_eq!(
            Attribute::Literal(Bytes::from_static(b"hello")).as_str(),
            Some("hello")
        );
        assert_eq!(Attribute::List(vec![]).as_str(), None);
    }
}
