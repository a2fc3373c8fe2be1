//! AT command line protocol
//!
//! Commands are ASCII lines terminated by `\r`; replies arrive as
//! `\r\n`-wrapped lines ending in a terminal token: `OK`, `ERROR`,
//! `+CME ERROR: <n>` or `+CMS ERROR: <n>`. Anything before the terminal
//! token is response payload; a line fragment without its terminator is
//! not a parse error, it simply stays buffered until the rest arrives.

use crate::errors::{CmeError, CmsError};

/// Command line terminator
pub const TERMINATOR: char = '\r';

/// Ctrl-Z, terminates an SMS body instead of `\r`
pub const CTRL_Z: char = '\x1a';

/// Terminal token concluding a command exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalToken {
    /// `OK`
    Ok,
    /// Bare `ERROR`
    Error,
    /// `+CME ERROR: <n>`
    Cme(CmeError),
    /// `+CMS ERROR: <n>`
    Cms(CmsError),
}

/// Append the line terminator unless the command already carries one
/// (`\r`, `\n`, or Ctrl-Z for SMS bodies).
pub fn format_command(text: &str) -> String {
    match text.chars().last() {
        Some(TERMINATOR) | Some('\n') | Some(CTRL_Z) => text.to_string(),
        _ => {
            let mut out = String::with_capacity(text.len() + 1);
            out.push_str(text);
            out.push(TERMINATOR);
            out
        }
    }
}

/// Split a receive buffer into complete lines and the trailing fragment
///
/// A line is complete once a `\r` or `\n` follows it. Empty lines (the
/// blanks between `\r\n` pairs) are dropped. The fragment must be
/// retained by the caller and re-scanned when more bytes arrive.
pub fn complete_lines(buffer: &str) -> (Vec<&str>, &str) {
    let mut lines = Vec::new();
    let mut start = 0;
    let bytes = buffer.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'\r' || b == b'\n' {
            if i > start {
                lines.push(&buffer[start..i]);
            }
            start = i + 1;
        }
    }
    (lines, &buffer[start..])
}

/// Classify a complete line as a terminal token, if it is one
pub fn classify_terminal(line: &str) -> Option<TerminalToken> {
    let line = line.trim();
    if line == "OK" {
        return Some(TerminalToken::Ok);
    }
    if line == "ERROR" {
        return Some(TerminalToken::Error);
    }
    if let Some(code) = line.strip_prefix("+CME ERROR:") {
        return Some(TerminalToken::Cme(parse_code(code, CmeError::from_code)));
    }
    if let Some(code) = line.strip_prefix("+CMS ERROR:") {
        return Some(TerminalToken::Cms(parse_code(code, CmsError::from_code)));
    }
    None
}

fn parse_code<E>(text: &str, map: impl Fn(u16) -> E) -> E {
    // Verbose mode reports a string instead of a number; either way an
    // unparsable code stays an Unknown variant rather than vanishing.
    match text.trim().parse::<u16>() {
        Ok(code) => map(code),
        Err(_) => map(u16::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminator_appended_once() {
        assert_eq!(format_command("AT"), "AT\r");
        assert_eq!(format_command("AT+CSQ\r"), "AT+CSQ\r");
        assert_eq!(format_command("body\x1a"), "body\x1a");
    }

    #[test]
    fn lines_split_with_fragment() {
        let (lines, rest) = complete_lines("\r\n+CSQ: 23,0\r\nOK\r\n+QIN");
        assert_eq!(lines, vec!["+CSQ: 23,0", "OK"]);
        assert_eq!(rest, "+QIN");
    }

    #[test]
    fn bare_fragment_yields_nothing() {
        let (lines, rest) = complete_lines("+CSQ: 2");
        assert!(lines.is_empty());
        assert_eq!(rest, "+CSQ: 2");
    }

    #[test]
    fn ok_and_error_classified() {
        assert_eq!(classify_terminal("OK"), Some(TerminalToken::Ok));
        assert_eq!(classify_terminal("ERROR"), Some(TerminalToken::Error));
        assert_eq!(classify_terminal("+CSQ: 23,0"), None);
    }

    #[test]
    fn cme_code_mapped() {
        assert_eq!(
            classify_terminal("+CME ERROR: 10"),
            Some(TerminalToken::Cme(CmeError::SimNotInserted))
        );
    }

    #[test]
    fn cms_code_mapped() {
        assert_eq!(
            classify_terminal("+CMS ERROR: 322"),
            Some(TerminalToken::Cms(CmsError::MemoryFull))
        );
    }

    #[test]
    fn unknown_and_unparsable_codes_terminate() {
        assert_eq!(
            classify_terminal("+CME ERROR: 9999"),
            Some(TerminalToken::Cme(CmeError::Unknown(9999)))
        );
        assert_eq!(
            classify_terminal("+CME ERROR: SIM busy?"),
            Some(TerminalToken::Cme(CmeError::Unknown(u16::MAX)))
        );
    }
}
