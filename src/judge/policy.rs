//! Header allow-list and banned-function checks for native sources.
//!
//! This is a lexical check run before anything reaches a sandbox. Comments
//! and string literals are skipped so that a banned name mentioned in
//! either does not count.

use std::collections::BTreeSet;

/// Return a diagnostic if `source` violates the policy.
pub fn check_source(
    source: &str,
    allowed_headers: Option<&[String]>,
    banned_functions: &[String],
) -> Result<(), String> {
    let code = strip_comments_and_strings(source);
    let mut problems = Vec::new();

    if let Some(allowed) = allowed_headers {
        for header in included_headers(&code) {
            if !allowed.iter().any(|a| a == &header) {
                problems.push(format!("header <{header}> is not allowed"));
            }
        }
    }

    if !banned_functions.is_empty() {
        let called = called_identifiers(&code);
        for banned in banned_functions {
            if called.contains(banned.as_str()) {
                problems.push(format!("use of banned function `{banned}`"));
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems.join("\n"))
    }
}

/// Headers named by `#include <...>` or `#include "..."` directives.
fn included_headers(code: &str) -> Vec<String> {
    code.lines()
        .filter_map(|line| {
            let rest = line.trim_start().strip_prefix('#')?.trim_start();
            let rest = rest.strip_prefix("include")?.trim();
            let (open, close) = match rest.chars().next()? {
                '<' => ('<', '>'),
                '"' => ('"', '"'),
                _ => return None,
            };
            let inner = rest.strip_prefix(open)?;
            let end = inner.find(close)?;
            Some(inner[..end].trim().to_string())
        })
        .collect()
}

/// Identifiers directly followed by `(`.
fn called_identifiers(code: &str) -> BTreeSet<&str> {
    let bytes = code.as_bytes();
    let mut called = BTreeSet::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_alphabetic() || b == b'_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let mut j = i;
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            if bytes.get(j) == Some(&b'(') {
                called.insert(&code[start..i]);
            }
        } else {
            i += 1;
        }
    }
    called
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Lex {
    Code,
    LineComment,
    BlockComment,
    Literal(char),
}

fn is_include(line: &str) -> bool {
    line.trim_start()
        .strip_prefix('#')
        .is_some_and(|rest| rest.trim_start().starts_with("include"))
}

/// Replace comments and string/char literal contents with spaces. Include
/// directives are kept verbatim so their header names survive.
fn strip_comments_and_strings(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut state = Lex::Code;

    for line in source.split_inclusive('\n') {
        if state == Lex::Code && is_include(line) {
            out.push_str(line);
            continue;
        }

        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            let blank = if c == '\n' { '\n' } else { ' ' };
            match state {
                Lex::Code => match c {
                    '/' if chars.peek() == Some(&'/') => {
                        chars.next();
                        out.push_str("  ");
                        state = Lex::LineComment;
                    }
                    '/' if chars.peek() == Some(&'*') => {
                        chars.next();
                        out.push_str("  ");
                        state = Lex::BlockComment;
                    }
                    '\'' if ends_in_number(&out) => out.push(c),
                    '"' | '\'' => {
                        out.push(c);
                        state = Lex::Literal(c);
                    }
                    _ => out.push(c),
                },
                Lex::LineComment => out.push(blank),
                Lex::BlockComment => {
                    if c == '*' && chars.peek() == Some(&'/') {
                        chars.next();
                        out.push_str("  ");
                        state = Lex::Code;
                    } else {
                        out.push(blank);
                    }
                }
                Lex::Literal(quote) => {
                    if c == '\\' && chars.next_if(|&n| n != '\n').is_some() {
                        out.push_str("  ");
                    } else if c == quote {
                        out.push(c);
                        state = Lex::Code;
                    } else {
                        out.push(blank);
                    }
                }
            }
        }

        // Line comments and unterminated literals end with the line.
        if matches!(state, Lex::LineComment | Lex::Literal(_)) {
            state = Lex::Code;
        }
    }
    out
}

/// Whether `code` ends inside a numeric literal, where `'` is a digit
/// separator (`1'000`, `0xFF'FF`) rather than the start of a char literal.
fn ends_in_number(code: &str) -> bool {
    code.chars()
        .rev()
        .take_while(char::is_ascii_alphanumeric)
        .last()
        .is_some_and(|first| first.is_ascii_digit())
}
