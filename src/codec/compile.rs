//! Request compiler: a structured request out, wire chunks back.
//!
//! The compiled output is split at literal boundaries: each chunk ends
//! right after a `{N}` marker's CRLF, and the announced literal bytes open
//! the next chunk. The sender transmits the first chunk immediately and
//! each following chunk in response to a server continuation prompt,
//! appending the final CRLF to the last chunk only.

use super::{Request, RequestAttribute};

/// Compiles a request into an ordered sequence of wire chunks.
///
/// No trailing CRLF is included; the sender appends it to the last chunk.
#[must_use]
pub fn compile(request: &Request) -> Vec<Vec<u8>> {
    let mut compiler = Compiler::default();
    compiler.write_str(&request.tag);
    compiler.write_byte(b' ');
    compiler.write_str(&request.command);
    for attribute in &request.attributes {
        compiler.write_byte(b' ');
        compiler.write_attribute(attribute);
    }
    compiler.finish()
}

/// Renders a request for logging.
///
/// Literal contents are elided and the arguments of `LOGIN` are masked, so
/// message bodies and credentials never reach the log output.
#[must_use]
pub fn compile_for_log(request: &Request) -> String {
    let mask_values = request.command.eq_ignore_ascii_case("LOGIN");
    let mut out = format!("{} {}", request.tag, request.command);
    for attribute in &request.attributes {
        out.push(' ');
        write_logged(&mut out, attribute, mask_values);
    }
    out
}

fn write_logged(out: &mut String, attribute: &RequestAttribute, mask: bool) {
    match attribute {
        RequestAttribute::Atom(value) => {
            if mask {
                out.push_str("\"(masked)\"");
            } else {
                out.push_str(value);
            }
        }
        RequestAttribute::String(value) => {
            if mask {
                out.push_str("\"(masked)\"");
            } else {
                out.push('"');
                out.push_str(value);
                out.push('"');
            }
        }
        RequestAttribute::Literal(bytes) => {
            out.push_str(&format!("{{{} bytes}}", bytes.len()));
        }
        RequestAttribute::List(items) => {
            out.push('(');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                write_logged(out, item, mask);
            }
            out.push(')');
        }
    }
}

#[derive(Default)]
struct Compiler {
    chunks: Vec<Vec<u8>>,
    current: Vec<u8>,
}

impl Compiler {
    fn write_byte(&mut self, byte: u8) {
        self.current.push(byte);
    }

    fn write_str(&mut self, value: &str) {
        self.current.extend_from_slice(value.as_bytes());
    }

    fn write_attribute(&mut self, attribute: &RequestAttribute) {
        match attribute {
            RequestAttribute::Atom(value) => self.write_str(value),
            RequestAttribute::String(value) => self.write_quoted(value),
            RequestAttribute::Literal(bytes) => {
                self.write_str(&format!("{{{}}}\r\n", bytes.len()));
                self.chunks.push(std::mem::take(&mut self.current));
                self.current.extend_from_slice(bytes);
            }
            RequestAttribute::List(items) => {
                self.write_byte(b'(');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.write_byte(b' ');
                    }
                    self.write_attribute(item);
                }
                self.write_byte(b')');
            }
        }
    }

    fn write_quoted(&mut self, value: &str) {
        self.write_byte(b'"');
        for byte in value.bytes() {
            if byte == b'"' || byte == b'\\' {
                self.write_byte(b'\\');
            }
            self.write_byte(byte);
        }
        self.write_byte(b'"');
    }

    fn finish(mut self) -> Vec<Vec<u8>> {
        self.chunks.push(self.current);
        self.chunks
    }
}
