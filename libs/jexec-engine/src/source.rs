//! Source Preparation
//!
//! Turns submitted text into a named compilation unit. Name extraction is
//! best-effort pattern matching on the source, not a Java parser: text that
//! is unparseable or ambiguous falls back to `DEFAULT_PROGRAM_NAME`.
//!
//! String/char literals, text blocks and comments are blanked out before
//! scanning, so `System.out.println("public class X")` neither names the
//! program nor counts as a type declaration.

use jexec_common::types::{ExecutionRequest, ValidationError};
use regex::Regex;
use std::sync::OnceLock;

pub const DEFAULT_PROGRAM_NAME: &str = "Main";

const MAX_PROGRAM_NAME_LEN: usize = 128;

/// A named program ready to be written to disk and compiled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub name: String,
    pub source: String,
}

fn public_type_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"\bpublic\s+(?:(?:final|abstract|static|sealed|strictfp)\s+)*(?:class|interface|enum|record)\s+([A-Za-z_][A-Za-z0-9_]*)",
        )
        .unwrap_or_else(|e| unreachable!("static regex: {}", e))
    })
}

fn type_declaration_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\b(?:class|interface|enum|record)\s+[A-Za-z_][A-Za-z0-9_]*\s*[{<(]|\b(?:class|interface|enum)\s+[A-Za-z_][A-Za-z0-9_]*\s+(?:extends|implements)\b")
            .unwrap_or_else(|e| unreachable!("static regex: {}", e))
    })
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap_or_else(|e| unreachable!("static regex: {}", e))
    })
}

/// Name of the first public type declared in `code`, or `Main`
pub fn derive_program_name(code: &str) -> String {
    let scannable = blank_literals_and_comments(code);
    public_type_pattern()
        .captures(&scannable)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| DEFAULT_PROGRAM_NAME.to_string())
}

/// True if `code` declares at least one type
pub fn declares_type(code: &str) -> bool {
    type_declaration_pattern().is_match(&blank_literals_and_comments(code))
}

/// Wrap a bare statement sequence in a runnable class named `name`.
/// Code that already declares a type is returned unchanged.
pub fn wrap_if_bare(code: &str, name: &str) -> String {
    if declares_type(code) {
        return code.to_string();
    }

    format!(
        "public class {name} {{\n    public static void main(String[] args) throws Exception {{\n{code}\n    }}\n}}\n"
    )
}

/// Program names become file names and command arguments, so only plain
/// identifiers are accepted.
pub fn validate_program_name(name: &str) -> Result<(), ValidationError> {
    if name.len() <= MAX_PROGRAM_NAME_LEN && identifier_pattern().is_match(name) {
        Ok(())
    } else {
        Err(ValidationError::InvalidProgramName(name.to_string()))
    }
}

/// Resolve the program name and normalize the code for a request
pub fn prepare(request: &ExecutionRequest) -> Result<Program, ValidationError> {
    let name = match request.class_name.as_deref().map(str::trim) {
        Some(explicit) if !explicit.is_empty() => {
            validate_program_name(explicit)?;
            explicit.to_string()
        }
        _ => derive_program_name(&request.code),
    };

    let source = wrap_if_bare(&request.code, &name);
    Ok(Program { name, source })
}

/// Replace the contents of string literals, char literals, text blocks and
/// comments with spaces, keeping line breaks and everything else intact.
fn blank_literals_and_comments(code: &str) -> String {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Code,
        Str,
        Char,
        TextBlock,
        LineComment,
        BlockComment,
    }

    // True if the next two characters close or continue a `"""` delimiter
    fn two_quotes_follow(chars: &std::iter::Peekable<std::str::Chars<'_>>) -> bool {
        chars.clone().take(2).eq(['"', '"'])
    }

    let mut out = String::with_capacity(code.len());
    let mut state = State::Code;
    let mut chars = code.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Code => match c {
                '"' if two_quotes_follow(&chars) => {
                    chars.next();
                    chars.next();
                    state = State::TextBlock;
                    out.push_str("   ");
                }
                '"' => {
                    state = State::Str;
                    out.push(' ');
                }
                '\'' => {
                    state = State::Char;
                    out.push(' ');
                }
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    state = State::LineComment;
                    out.push_str("  ");
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = State::BlockComment;
                    out.push_str("  ");
                }
                _ => out.push(c),
            },
            State::Str | State::Char => {
                let closing = if state == State::Str { '"' } else { '\'' };
                if c == '\\' {
                    chars.next();
                    out.push_str("  ");
                } else if c == closing || c == '\n' {
                    state = State::Code;
                    out.push(if c == '\n' { '\n' } else { ' ' });
                } else {
                    out.push(' ');
                }
            }
            State::TextBlock => {
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        out.push(' ');
                        out.push(if escaped == '\n' { '\n' } else { ' ' });
                    }
                } else if c == '"' && two_quotes_follow(&chars) {
                    chars.next();
                    chars.next();
                    state = State::Code;
                    out.push_str("   ");
                } else {
                    out.push(if c == '\n' { '\n' } else { ' ' });
                }
            }
            State::LineComment => {
                if c == '\n' {
                    state = State::Code;
                    out.push('\n');
                } else {
                    out.push(' ');
                }
            }
            State::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = State::Code;
                    out.push_str("  ");
                } else {
                    out.push(if c == '\n' { '\n' } else { ' ' });
                }
            }
        }
    }

    out
}
