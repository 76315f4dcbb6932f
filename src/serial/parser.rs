//! Pluggable response parsing: unsolicited-message extraction plus
//! final-result-code detection over the accumulated response buffer.
//!
//! The queue engine calls [`ResponseParser::extract_unsolicited`] and then
//! [`ResponseParser::try_parse_response`] on every read, in that order, so a
//! status indication interleaved with a command's reply is always separated
//! out before the reply is matched.

use crate::error::{ConnectFailure, EquipmentError, Error};

/// An unsolicited message pulled out of the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// The registered prefix that matched.
    pub prefix: String,
    /// The full line, terminators stripped.
    pub line: String,
}

/// Result of scanning the buffer for a complete command reply.
#[derive(Debug)]
pub enum ResponseOutcome {
    /// No final result code yet; leave the buffer alone and keep reading.
    Incomplete,
    /// A success code terminated the reply. `consumed` bytes (payload plus
    /// the final code line) must be drained from the buffer front.
    Success { consumed: usize, payload: Vec<u8> },
    /// The device reported a failure code.
    Failure { consumed: usize, error: Error },
}

/// Per-protocol parsing contract plugged into the queue engine.
///
/// Both operations must be idempotent over incomplete data: bytes that do
/// not yet form a complete message are left untouched for the next read.
pub trait ResponseParser: Send {
    /// Register a prefix whose lines are demultiplexed out as unsolicited.
    fn register_unsolicited(&mut self, prefix: &str);

    /// Remove every complete unsolicited line from `buf` and return it.
    fn extract_unsolicited(&mut self, buf: &mut Vec<u8>) -> Vec<Notification>;

    /// Decide whether `buf` holds a complete command reply.
    fn try_parse_response(&mut self, buf: &[u8]) -> ResponseOutcome;
}

/// Dial-failure final codes. Anything that matches this family but is not
/// individually recognized maps to no-carrier; an intentional
/// simplification inherited from the original line discipline.
const DIAL_FAILURES: [&str; 5] = ["NO CARRIER", "BUSY", "NO ANSWER", "NO DIALTONE", "NO DIAL TONE"];

fn dial_failure(token: &str) -> ConnectFailure {
    match token {
        "BUSY" => ConnectFailure::Busy,
        "NO ANSWER" => ConnectFailure::NoAnswer,
        "NO DIALTONE" | "NO DIAL TONE" => ConnectFailure::NoDialtone,
        _ => ConnectFailure::NoCarrier,
    }
}

/// Generic V.250 line-based parser: `OK`/`CONNECT` success, `ERROR` and
/// `+CME ERROR`/`+CMS ERROR` numeric failures, dial-failure tokens.
pub struct AtParser {
    prefixes: Vec<String>,
}

impl AtParser {
    pub fn new() -> Self {
        Self {
            prefixes: Vec::new(),
        }
    }
}

impl Default for AtParser {
    fn default() -> Self {
        Self::new()
    }
}

/// A complete line: `[start, end)` covers content plus terminator, content
/// excludes the trailing `\r\n`.
struct CompleteLine {
    start: usize,
    end: usize,
    content_end: usize,
}

/// Split `buf` into `\n`-terminated lines. A trailing fragment without a
/// newline is not returned; it stays in the buffer for the next read.
fn complete_lines(buf: &[u8]) -> Vec<CompleteLine> {
    let mut lines = Vec::new();
    let mut start = 0;
    for (i, &b) in buf.iter().enumerate() {
        if b == b'\n' {
            let mut content_end = i;
            if content_end > start && buf[content_end - 1] == b'\r' {
                content_end -= 1;
            }
            lines.push(CompleteLine {
                start,
                end: i + 1,
                content_end,
            });
            start = i + 1;
        }
    }
    lines
}

/// Strip exactly one leading and one trailing `\r\n` pair, if present.
fn strip_one_crlf_pair(mut payload: &[u8]) -> &[u8] {
    if payload.starts_with(b"\r\n") {
        payload = &payload[2..];
    }
    if payload.ends_with(b"\r\n") {
        payload = &payload[..payload.len() - 2];
    }
    payload
}

fn parse_numeric_error(token: &str) -> Option<Error> {
    let rest = token
        .strip_prefix("+CME ERROR:")
        .or_else(|| token.strip_prefix("+CMS ERROR:"))?;
    let code = rest.trim().parse::<u32>().unwrap_or(100);
    Some(Error::Equipment(EquipmentError::from_code(code)))
}

impl ResponseParser for AtParser {
    fn register_unsolicited(&mut self, prefix: &str) {
        if !self.prefixes.iter().any(|p| p == prefix) {
            self.prefixes.push(prefix.to_string());
        }
    }

    fn extract_unsolicited(&mut self, buf: &mut Vec<u8>) -> Vec<Notification> {
        if self.prefixes.is_empty() {
            return Vec::new();
        }

        let mut matches: Vec<(usize, usize, Notification)> = Vec::new();
        for line in complete_lines(buf) {
            let content = &buf[line.start..line.content_end];
            let Ok(text) = std::str::from_utf8(content) else {
                continue;
            };
            let trimmed = text.trim();
            if let Some(prefix) = self.prefixes.iter().find(|p| trimmed.starts_with(p.as_str())) {
                matches.push((
                    line.start,
                    line.end,
                    Notification {
                        prefix: prefix.clone(),
                        line: trimmed.to_string(),
                    },
                ));
            }
        }

        // Drain matched ranges back-to-front so earlier offsets stay valid.
        let mut notifications: Vec<Notification> = Vec::with_capacity(matches.len());
        for (start, end, note) in matches.iter().rev() {
            buf.drain(*start..*end);
            notifications.push(note.clone());
        }
        notifications.reverse();
        notifications
    }

    fn try_parse_response(&mut self, buf: &[u8]) -> ResponseOutcome {
        for line in complete_lines(buf) {
            let content = &buf[line.start..line.content_end];
            let Ok(text) = std::str::from_utf8(content) else {
                continue;
            };
            let token = text.trim();

            if token == "OK" || token == "CONNECT" || token.starts_with("CONNECT ") {
                let payload = strip_one_crlf_pair(&buf[..line.start]).to_vec();
                return ResponseOutcome::Success {
                    consumed: line.end,
                    payload,
                };
            }

            if token == "ERROR" {
                return ResponseOutcome::Failure {
                    consumed: line.end,
                    error: Error::Equipment(EquipmentError::from_code(100)),
                };
            }

            if let Some(error) = parse_numeric_error(token) {
                return ResponseOutcome::Failure {
                    consumed: line.end,
                    error,
                };
            }

            if DIAL_FAILURES.contains(&token) {
                return ResponseOutcome::Failure {
                    consumed: line.end,
                    error: Error::Connect(dial_failure(token)),
                };
            }
        }
        ResponseOutcome::Incomplete
    }
}

/// Remove NUL bytes and non-printable control characters (except CR/LF).
/// Stale buffer data can contain garbage bytes that break line-based parsing.
pub(crate) fn sanitize_response(response: &str) -> String {
    response
        .chars()
        .filter(|&c| c == '\r' || c == '\n' || !c.is_control())
        .filter(|&c| c != '\u{FFFD}')
        .collect()
}

/// Strip residual `AT...` echo lines. Echo is disabled at init, but bytes
/// already in flight when `ATE0` lands still show up.
pub(crate) fn strip_echo(response: &str) -> String {
    response
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return false;
            }
            match trimmed.find(|c: char| c.is_ascii_alphabetic()) {
                Some(pos) => !trimmed[pos..].starts_with("AT"),
                None => true,
            }
        })
        .collect::<Vec<_>>()
        .join("\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(buf: &[u8]) -> ResponseOutcome {
        AtParser::new().try_parse_response(buf)
    }

    #[test]
    fn test_ok_response() {
        let buf = b"\r\n+CSQ: 15,99\r\n\r\nOK\r\n";
        match parse(buf) {
            ResponseOutcome::Success { consumed, payload } => {
                assert_eq!(consumed, buf.len());
                assert_eq!(payload, b"+CSQ: 15,99\r\n");
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn test_bare_ok() {
        match parse(b"\r\nOK\r\n") {
            ResponseOutcome::Success { consumed, payload } => {
                assert_eq!(consumed, 6);
                assert!(payload.is_empty());
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn test_incomplete_without_final_code() {
        assert!(matches!(
            parse(b"\r\n+CSQ: 15,99\r\n"),
            ResponseOutcome::Incomplete
        ));
        // Final code split across reads: not complete until the newline.
        assert!(matches!(parse(b"\r\nOK\r"), ResponseOutcome::Incomplete));
    }

    #[test]
    fn test_connect_token() {
        assert!(matches!(
            parse(b"\r\nCONNECT 115200\r\n"),
            ResponseOutcome::Success { .. }
        ));
    }

    #[test]
    fn test_bare_error_maps_to_unknown() {
        match parse(b"\r\nERROR\r\n") {
            ResponseOutcome::Failure { error, .. } => assert_eq!(
                error,
                Error::Equipment(EquipmentError::Unknown { code: 100 })
            ),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_cme_error_code() {
        match parse(b"\r\n+CME ERROR: 10\r\n") {
            ResponseOutcome::Failure { error, .. } => {
                assert_eq!(error, Error::Equipment(EquipmentError::SimNotInserted));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_dial_failures() {
        for (token, expected) in [
            ("NO CARRIER", ConnectFailure::NoCarrier),
            ("BUSY", ConnectFailure::Busy),
            ("NO ANSWER", ConnectFailure::NoAnswer),
            ("NO DIALTONE", ConnectFailure::NoDialtone),
            ("NO DIAL TONE", ConnectFailure::NoDialtone),
        ] {
            let buf = format!("\r\n{token}\r\n");
            match parse(buf.as_bytes()) {
                ResponseOutcome::Failure { error, .. } => {
                    assert_eq!(error, Error::Connect(expected), "token {token}");
                }
                other => panic!("expected failure for {token}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_unsolicited_extraction() {
        let mut parser = AtParser::new();
        parser.register_unsolicited("+CREG:");

        let mut buf = b"\r\n+CREG: 1\r\n\r\n+CSQ: 15,99\r\nOK\r\n".to_vec();
        let notes = parser.extract_unsolicited(&mut buf);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].prefix, "+CREG:");
        assert_eq!(notes[0].line, "+CREG: 1");
        assert_eq!(buf, b"\r\n\r\n+CSQ: 15,99\r\nOK\r\n");

        // Response still parses after extraction.
        assert!(matches!(
            parser.try_parse_response(&buf),
            ResponseOutcome::Success { .. }
        ));
    }

    #[test]
    fn test_unsolicited_partial_left_in_place() {
        let mut parser = AtParser::new();
        parser.register_unsolicited("+CREG:");

        let mut buf = b"\r\n+CREG: 1".to_vec();
        assert!(parser.extract_unsolicited(&mut buf).is_empty());
        assert_eq!(buf, b"\r\n+CREG: 1");

        // Idempotent: the same incomplete bytes survive a second pass.
        assert!(parser.extract_unsolicited(&mut buf).is_empty());
        assert_eq!(buf, b"\r\n+CREG: 1");
    }

    #[test]
    fn test_strip_echo() {
        let response = "AT+CSQ\r\n+CSQ: 15,99";
        let stripped = strip_echo(response);
        assert!(stripped.contains("+CSQ: 15,99"));
        assert!(!stripped.contains("AT+CSQ"));
    }

    #[test]
    fn test_sanitize_removes_nul() {
        let cleaned = sanitize_response("\x00+CSQ: 15,99");
        assert!(!cleaned.contains('\x00'));
        assert!(cleaned.contains("+CSQ: 15,99"));
    }
}
