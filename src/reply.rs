//! Incremental reply parsing
//!
//! graphd replies are length-implicit: one ASCII frame terminated by a
//! newline, where parentheses (outside quoted strings) must balance before
//! the newline counts as end-of-frame. Bytes arrive in arbitrary chunks, so
//! the parser keeps scan state across `feed` calls and only re-examines new
//! bytes.
//!
//! Frame shape:
//!
//! ```text
//! ok id="gw;..." dateline="g1:8100,1234" cost="tu=5 mm=3" (body ...)\n
//! error id="gw;..." cost="tu=1" SNAPSHOT "writing snapshot"\n
//! ```

use std::fmt;
use std::time::SystemTime;

use crate::error::{GraphError, Result};

// ============================================================================
// Datum: the s-expression body tree
// ============================================================================

/// Parsed reply body.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    /// Bare token: `null`, `42`, `#9202a8c0...`
    Atom(String),
    /// Quoted string with escapes resolved.
    Str(String),
    /// Parenthesized sequence.
    List(Vec<Datum>),
}

impl Datum {
    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Datum::Atom(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Datum]> {
        match self {
            Datum::List(items) => Some(items),
            _ => None,
        }
    }

    /// Atom or string payload, whichever this is.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Datum::Atom(s) | Datum::Str(s) => Some(s),
            Datum::List(_) => None,
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Atom(s) => write!(f, "{}", s),
            Datum::Str(s) => {
                write!(f, "\"")?;
                for c in s.chars() {
                    match c {
                        '"' => write!(f, "\\\"")?,
                        '\\' => write!(f, "\\\\")?,
                        '\n' => write!(f, "\\n")?,
                        _ => write!(f, "{}", c)?,
                    }
                }
                write!(f, "\"")
            }
            Datum::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}

// ============================================================================
// Reply
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// One complete parsed reply frame. Produced by [`ReplyParser`], consumed
/// exactly once by the connector that requested it.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: ReplyStatus,
    /// Error code token, present on error frames (`SNAPSHOT`, `DATELINE`...).
    pub code: Option<String>,
    /// Error message, present on error frames.
    pub message: Option<String>,
    /// Consistency watermark issued with this reply.
    pub dateline: String,
    /// Raw cost string (`tu=5 mm=3 ...`).
    pub cost: String,
    /// Echoed transaction id, if the server included one.
    pub tid: Option<String>,
    pub body: Datum,
    /// When the full frame was consumed off the wire.
    pub end_time: SystemTime,
    /// The exact frame bytes, newline included. Kept so recordings replay
    /// through this same parser.
    pub raw: Vec<u8>,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }
}

// ============================================================================
// Incremental parser
// ============================================================================

/// Incremental frame parser: `feed` bytes, poll `is_ready`, then
/// `take_reply`.
///
/// Scan state (paren depth, quote, escape) survives across feeds so each
/// byte is examined once. `reset` drops everything, including a partial
/// frame; the wire layer calls it on every teardown so a reused parser can
/// never leak a stale prefix into the next connection.
#[derive(Debug, Default)]
pub struct ReplyParser {
    buf: Vec<u8>,
    scan_pos: usize,
    depth: usize,
    in_quote: bool,
    escaped: bool,
    /// Byte length of the complete frame, once found.
    frame_len: Option<usize>,
}

impl ReplyParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and advance the completeness scan.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.frame_len.is_some() {
            return;
        }
        while self.scan_pos < self.buf.len() {
            let b = self.buf[self.scan_pos];
            self.scan_pos += 1;
            if self.in_quote {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_quote = false;
                }
                continue;
            }
            match b {
                b'"' => self.in_quote = true,
                b'(' => self.depth += 1,
                // An unbalanced ')' is caught at parse time; the scan just
                // refuses to go negative.
                b')' => self.depth = self.depth.saturating_sub(1),
                b'\n' if self.depth == 0 => {
                    self.frame_len = Some(self.scan_pos);
                    return;
                }
                _ => {}
            }
        }
    }

    /// True once a complete frame is buffered.
    pub fn is_ready(&self) -> bool {
        self.frame_len.is_some()
    }

    /// Number of buffered bytes (partial frame included).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop all buffered bytes and scan state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Parse and remove the complete frame. Errors on malformed frames;
    /// callers tear down the connection on error since framing is lost.
    pub fn take_reply(&mut self) -> Result<Reply> {
        let frame_len = self
            .frame_len
            .take()
            .ok_or_else(|| GraphError::Parse("no complete reply buffered".to_string()))?;
        let raw: Vec<u8> = self.buf.drain(..frame_len).collect();

        // Rebase scan state over any bytes that followed the frame.
        self.scan_pos = 0;
        self.depth = 0;
        self.in_quote = false;
        self.escaped = false;
        let rest = std::mem::take(&mut self.buf);
        self.feed(&rest);

        parse_frame(&raw)
    }
}

// ============================================================================
// Frame parsing (complete frames only)
// ============================================================================

#[derive(Debug, PartialEq)]
enum Token {
    Open,
    Close,
    Atom(String),
    Str(String),
    /// `name="value"` pair.
    Modifier(String, String),
}

fn tokenize(frame: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = frame.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_ascii_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '"' => {
                chars.next();
                tokens.push(Token::Str(read_quoted(&mut chars)?));
            }
            _ => {
                let mut atom = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_whitespace() || c == '(' || c == ')' || c == '"' {
                        break;
                    }
                    atom.push(c);
                    chars.next();
                }
                // `name=` immediately followed by a quote is a modifier.
                if atom.ends_with('=') && chars.peek() == Some(&'"') {
                    chars.next();
                    let value = read_quoted(&mut chars)?;
                    atom.pop();
                    tokens.push(Token::Modifier(atom, value));
                } else {
                    tokens.push(Token::Atom(atom));
                }
            }
        }
    }
    Ok(tokens)
}

fn read_quoted(chars: &mut std::iter::Peekable<std::str::Chars>) -> Result<String> {
    let mut out = String::new();
    loop {
        match chars.next() {
            Some('\\') => match chars.next() {
                Some('n') => out.push('\n'),
                Some(c) => out.push(c),
                None => return Err(GraphError::Parse("unterminated escape".to_string())),
            },
            Some('"') => return Ok(out),
            Some(c) => out.push(c),
            None => return Err(GraphError::Parse("unterminated string".to_string())),
        }
    }
}

/// Parse a datum sequence. At top level the sequence ends with the tokens;
/// inside a list it ends at the matching ')'.
fn parse_datums(
    tokens: &mut std::iter::Peekable<std::vec::IntoIter<Token>>,
    at_top: bool,
) -> Result<Vec<Datum>> {
    let mut out = Vec::new();
    loop {
        match tokens.next() {
            None => {
                if at_top {
                    return Ok(out);
                }
                return Err(GraphError::Parse("unbalanced '(' in reply".to_string()));
            }
            Some(Token::Close) => {
                if at_top {
                    return Err(GraphError::Parse("unbalanced ')' in reply".to_string()));
                }
                return Ok(out);
            }
            Some(Token::Open) => out.push(Datum::List(parse_datums(tokens, false)?)),
            Some(Token::Atom(s)) => out.push(Datum::Atom(s)),
            Some(Token::Str(s)) => out.push(Datum::Str(s)),
            Some(Token::Modifier(name, value)) => {
                return Err(GraphError::Parse(format!(
                    "modifier {}=\"{}\" inside body",
                    name, value
                )))
            }
        }
    }
}

fn parse_frame(raw: &[u8]) -> Result<Reply> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| GraphError::Parse("reply is not valid UTF-8".to_string()))?
        .trim_end_matches('\n');

    let mut tokens = tokenize(text)?.into_iter().peekable();

    let status = match tokens.next() {
        Some(Token::Atom(s)) if s == "ok" => ReplyStatus::Ok,
        Some(Token::Atom(s)) if s == "error" => ReplyStatus::Error,
        other => {
            return Err(GraphError::Parse(format!(
                "reply must start with ok/error, got {:?}",
                other
            )))
        }
    };

    let mut dateline = String::new();
    let mut cost = String::new();
    let mut tid = None;
    while let Some(Token::Modifier(_, _)) = tokens.peek() {
        if let Some(Token::Modifier(name, value)) = tokens.next() {
            match name.as_str() {
                "dateline" => dateline = value,
                "cost" => cost = value,
                "id" => tid = Some(value),
                // Unknown modifiers are skipped: the server may grow new
                // ones ahead of client upgrades.
                _ => {}
            }
        }
    }

    let mut code = None;
    let mut message = None;
    if status == ReplyStatus::Error {
        match tokens.next() {
            Some(Token::Atom(c)) => code = Some(c),
            other => {
                return Err(GraphError::Parse(format!(
                    "error reply missing code token, got {:?}",
                    other
                )))
            }
        }
        if let Some(Token::Str(_)) = tokens.peek() {
            if let Some(Token::Str(m)) = tokens.next() {
                message = Some(m);
            }
        }
    }

    let mut items = parse_datums(&mut tokens, true)?;
    let body = match items.len() {
        0 => Datum::List(vec![]),
        1 => items.remove(0),
        _ => Datum::List(items),
    };

    Ok(Reply {
        status,
        code,
        message,
        dateline,
        cost,
        tid,
        body,
        end_time: SystemTime::now(),
        raw: raw.to_vec(),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Reply {
        let mut parser = ReplyParser::new();
        parser.feed(line.as_bytes());
        assert!(parser.is_ready());
        parser.take_reply().unwrap()
    }

    #[test]
    fn ok_frame_with_modifiers() {
        let reply = parse("ok id=\"gw;1;aa;0\" dateline=\"g1:8100,42\" cost=\"tu=5 mm=3\" (\"x\" #00ff)\n");
        assert!(reply.is_ok());
        assert_eq!(reply.dateline, "g1:8100,42");
        assert_eq!(reply.cost, "tu=5 mm=3");
        assert_eq!(reply.tid.as_deref(), Some("gw;1;aa;0"));
        let body = reply.body.as_list().unwrap();
        assert_eq!(body[0], Datum::Str("x".to_string()));
        assert_eq!(body[1], Datum::Atom("#00ff".to_string()));
    }

    #[test]
    fn error_frame_with_code_and_message() {
        let reply = parse("error cost=\"tu=1\" SNAPSHOT \"writing snapshot\"\n");
        assert_eq!(reply.status, ReplyStatus::Error);
        assert_eq!(reply.code.as_deref(), Some("SNAPSHOT"));
        assert_eq!(reply.message.as_deref(), Some("writing snapshot"));
        assert_eq!(reply.cost, "tu=1");
    }

    #[test]
    fn frame_split_at_arbitrary_boundaries() {
        let line = b"ok dateline=\"d,1\" cost=\"tu=2\" ((\"a\" \"b\") (\"c\" \"d\"))\n";
        let mut parser = ReplyParser::new();
        for chunk in line.chunks(3) {
            assert!(!parser.is_ready() || chunk.is_empty());
            parser.feed(chunk);
        }
        assert!(parser.is_ready());
        let reply = parser.take_reply().unwrap();
        assert_eq!(reply.dateline, "d,1");
        assert_eq!(reply.body.as_list().unwrap().len(), 2);
    }

    #[test]
    fn newline_inside_quotes_does_not_complete() {
        let mut parser = ReplyParser::new();
        parser.feed(b"ok (\"line one\nline two");
        assert!(!parser.is_ready());
        parser.feed(b"\")\n");
        assert!(parser.is_ready());
        let reply = parser.take_reply().unwrap();
        assert_eq!(
            reply.body.as_list().unwrap()[0],
            Datum::Str("line one\nline two".to_string())
        );
    }

    #[test]
    fn newline_inside_parens_does_not_complete() {
        let mut parser = ReplyParser::new();
        parser.feed(b"ok (a b\n");
        assert!(!parser.is_ready());
        parser.feed(b"c)\n");
        assert!(parser.is_ready());
    }

    #[test]
    fn escaped_quote_inside_string() {
        let reply = parse("ok (\"she said \\\"hi\\\"\")\n");
        assert_eq!(
            reply.body.as_list().unwrap()[0],
            Datum::Str("she said \"hi\"".to_string())
        );
    }

    #[test]
    fn reset_clears_partial_frame() {
        let mut parser = ReplyParser::new();
        parser.feed(b"ok (partial");
        assert!(parser.buffered() > 0);
        parser.reset();
        assert_eq!(parser.buffered(), 0);

        // A fresh frame parses cleanly; no stale prefix survives.
        parser.feed(b"ok ()\n");
        assert!(parser.is_ready());
        assert!(parser.take_reply().unwrap().is_ok());
    }

    #[test]
    fn raw_preserves_exact_bytes() {
        let line = "ok dateline=\"d,9\" (x)\n";
        let reply = parse(line);
        assert_eq!(reply.raw, line.as_bytes());
    }

    #[test]
    fn trailing_bytes_stay_buffered() {
        let mut parser = ReplyParser::new();
        parser.feed(b"ok (a)\nok (b)\n");
        assert!(parser.is_ready());
        let first = parser.take_reply().unwrap();
        assert_eq!(first.body.as_list().unwrap()[0], Datum::Atom("a".to_string()));
        assert!(parser.is_ready());
        let second = parser.take_reply().unwrap();
        assert_eq!(second.body.as_list().unwrap()[0], Datum::Atom("b".to_string()));
    }

    #[test]
    fn malformed_status_is_parse_error() {
        let mut parser = ReplyParser::new();
        parser.feed(b"banana (x)\n");
        assert!(parser.is_ready());
        assert!(matches!(parser.take_reply(), Err(GraphError::Parse(_))));
    }

    #[test]
    fn datum_display_round_trips() {
        let datum = Datum::List(vec![
            Datum::Atom("#00ff".to_string()),
            Datum::Str("a \"b\"".to_string()),
            Datum::List(vec![Datum::Atom("null".to_string())]),
        ]);
        assert_eq!(datum.to_string(), "(#00ff \"a \\\"b\\\"\" (null))");
    }
}
