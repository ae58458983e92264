//! Logging helpers: single-line escaping for mesh text and secret redaction.

use std::fmt::Write;

/// Longest preview of user text written to a log line
const MAX_PREVIEW: usize = 200;

/// Escape a string for single-line logging.
///
/// Newlines, tabs and other control characters are escaped so that text from
/// the mesh cannot break log lines. Long strings are truncated with an
/// ellipsis.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Redact a secret for diagnostic output.
///
/// Secrets of eight characters or more keep their first and last two
/// characters; anything shorter is fully masked.
pub fn redact(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() < 8 {
        return "****".to_string();
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{head}****{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_newlines_and_tabs() {
        let s = "Line1\nLine2\r\tEnd";
        assert_eq!(escape_log(s), "Line1\\nLine2\\r\\tEnd");
    }

    #[test]
    fn truncates_long_text() {
        let s = "x".repeat(500);
        let esc = escape_log(&s);
        assert!(esc.ends_with('…'));
        assert_eq!(esc.chars().count(), MAX_PREVIEW + 1);
    }

    #[test]
    fn redacts_keeping_prefix_and_suffix() {
        assert_eq!(redact("large4cats"), "la****ts");
        assert_eq!(redact("short"), "****");
        assert_eq!(redact(""), "****");
    }
}
