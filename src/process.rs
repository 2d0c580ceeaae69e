//! Response post-processing.
//!
//! Runs after the codec parser and before routing. Promotes
//! numeric-prefixed untagged responses (`* 12 EXISTS` becomes command
//! `EXISTS` with `nr = 12`), extracts bracketed response codes
//! (`[CAPABILITY ...]`, `[ALERT]`) and the trailing human-readable text of
//! status responses.

use crate::codec::{Attribute, CodeArg, Response};

/// Post-processes a parsed response.
#[must_use]
pub fn process(mut response: Response) -> Response {
    promote_numeric(&mut response);
    if response.is_status() {
        extract_text(&mut response);
        extract_code(&mut response);
    }
    response
}

/// `* 12 EXISTS` parses with command `12`; lift the number into `nr` and
/// promote the first atom to the command name.
fn promote_numeric(response: &mut Response) {
    if response.tag != "*" {
        return;
    }
    let Ok(nr) = response.command.parse::<u32>() else {
        return;
    };
    if !matches!(response.attributes.first(), Some(Attribute::Atom(_))) {
        return;
    }
    let Attribute::Atom(name) = response.attributes.remove(0) else {
        unreachable!("first attribute checked above");
    };
    response.nr = Some(nr);
    response.command = name.to_ascii_uppercase();
}

fn extract_text(response: &mut Response) {
    if let Some(Attribute::Text(text)) = response.attributes.last() {
        response.human_readable = Some(text.clone());
    }
}

fn extract_code(response: &mut Response) {
    let Some(Attribute::Section(entries)) = response.attributes.first() else {
        return;
    };

    let mapped: Vec<CodeArg> = entries.iter().filter_map(map_entry).collect();
    let Some(CodeArg::Value(code)) = mapped.first() else {
        return;
    };
    response.code = Some(code.clone());
    response.code_args = mapped[1..].to_vec();
}

/// Atoms are uppercased and trimmed; nested lists keep their values
/// verbatim apart from trimming.
fn map_entry(entry: &Attribute) -> Option<CodeArg> {
    match entry {
        Attribute::Atom(value) | Attribute::Quoted(value) => {
            Some(CodeArg::Value(value.trim().to_ascii_uppercase()))
        }
        Attribute::List(items) => Some(CodeArg::List(
            items
                .iter()
                .filter_map(Attribute::as_str)
                .map(|value| value.trim().to_string())
                .collect(),
        )),
        Attribute::Literal(_) | Attribute::Section(_) | Attribute::Text(_) => None,
    }
}
