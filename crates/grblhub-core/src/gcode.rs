//! G-Code program ingestion.
//!
//! Turns uploaded program text into the ordered list of stripped lines the
//! command queue streams. Handles semicolon comments, parenthesis comments,
//! and blank lines. The bridge never interprets the commands themselves.

use crate::error::{GcodeError, Result};

/// Strip comments from a single g-code line.
///
/// Removes `(...)` inline comments and everything after `;`. Returns an
/// error for comments that open without closing (or close without opening)
/// on the same line; Grbl rejects multi-line comments too.
fn strip_comments(line: &str, line_number: usize) -> Result<String> {
    let mut out = String::with_capacity(line.len());
    let mut depth = 0usize;

    for c in line.chars() {
        match c {
            ';' if depth == 0 => break,
            '(' => depth += 1,
            ')' => {
                if depth == 0 {
                    return Err(GcodeError::UnexpectedTerminator { line_number }.into());
                }
                depth -= 1;
            }
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }

    if depth != 0 {
        return Err(GcodeError::UnbalancedComment { line_number }.into());
    }

    Ok(out)
}

/// Parse program text into an ordered list of stripped, non-empty lines.
pub fn parse_program(text: &str) -> Result<Vec<String>> {
    let mut lines = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let stripped = strip_comments(raw, index + 1)?;
        let trimmed = stripped.trim();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }

    Ok(lines)
}
