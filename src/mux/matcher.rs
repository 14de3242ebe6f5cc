//! Byte-pattern matchers used to classify new connections.
//!
//! # Responsibilities
//! - Recognise a TLS ClientHello record header
//! - Recognise HTTP/1.1 request lines by method token
//! - Recognise the HTTP/2 client preface
//! - Catch everything else
//!
//! # Design Decisions
//! - Matchers see only the buffered prefix, never the stream
//! - A matcher that needs more bytes says so instead of guessing
//! - No regex, every probe is a bounded prefix comparison

/// Outcome of probing a buffered prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// The prefix belongs to this branch.
    Matched,
    /// The prefix can never belong to this branch.
    NoMatch,
    /// More bytes are needed to decide.
    Incomplete,
}

/// A predicate over the first bytes of a connection.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Classify the bytes read so far.
    fn probe(&self, buf: &[u8]) -> MatchResult;

    /// Short label used in logs and metrics.
    fn name(&self) -> &str;
}

/// Compare `buf` against a literal prefix.
pub fn probe_prefix(buf: &[u8], pattern: &[u8]) -> MatchResult {
    if buf.len() >= pattern.len() {
        if buf.starts_with(pattern) {
            MatchResult::Matched
        } else {
            MatchResult::NoMatch
        }
    } else if pattern.starts_with(buf) {
        MatchResult::Incomplete
    } else {
        MatchResult::NoMatch
    }
}

/// Matches a TLS handshake record carrying a ClientHello.
///
/// Record layout: content type 0x16, version 0x03 0x00..=0x04, 16-bit length
/// in 1..=16384, handshake type 0x01.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsHandshake;

impl Matcher for TlsHandshake {
    fn probe(&self, buf: &[u8]) -> MatchResult {
        if let Some(&b) = buf.first() {
            if b != 0x16 {
                return MatchResult::NoMatch;
            }
        }
        if let Some(&b) = buf.get(1) {
            if b != 0x03 {
                return MatchResult::NoMatch;
            }
        }
        if let Some(&b) = buf.get(2) {
            if b > 0x04 {
                return MatchResult::NoMatch;
            }
        }
        if buf.len() >= 5 {
            let len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
            if len == 0 || len > 16 * 1024 {
                return MatchResult::NoMatch;
            }
        }
        match buf.get(5) {
            Some(0x01) => MatchResult::Matched,
            Some(_) => MatchResult::NoMatch,
            None => MatchResult::Incomplete,
        }
    }

    fn name(&self) -> &str {
        "tls"
    }
}

/// Request-line methods recognised by [`Http1Fast`].
pub const HTTP1_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "CONNECT", "TRACE",
];

/// Matches an HTTP/1.x request line by its method token.
///
/// Only the method and the following space are inspected.
#[derive(Debug, Clone)]
pub struct Http1Fast {
    tokens: Vec<Vec<u8>>,
}

impl Http1Fast {
    /// Standard methods only.
    pub fn new() -> Self {
        Self::with_extra_methods(std::iter::empty::<&str>())
    }

    /// Standard methods plus non-standard verbs such as `PATCH`.
    pub fn with_extra_methods<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tokens: Vec<Vec<u8>> = HTTP1_METHODS
            .iter()
            .map(|m| format!("{m} ").into_bytes())
            .collect();
        for method in extra {
            let token = format!("{} ", method.as_ref()).into_bytes();
            if !tokens.contains(&token) {
                tokens.push(token);
            }
        }
        Self { tokens }
    }
}

impl Default for Http1Fast {
    fn default() -> Self {
        Self::new()
    }
}

impl Matcher for Http1Fast {
    fn probe(&self, buf: &[u8]) -> MatchResult {
        let mut result = MatchResult::NoMatch;
        for token in &self.tokens {
            match probe_prefix(buf, token) {
                MatchResult::Matched => return MatchResult::Matched,
                MatchResult::Incomplete => result = MatchResult::Incomplete,
                MatchResult::NoMatch => {}
            }
        }
        result
    }

    fn name(&self) -> &str {
        "http1"
    }
}

/// The HTTP/2 connection preface sent by every h2 client.
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Matches a prior-knowledge HTTP/2 connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct Http2Preface;

impl Matcher for Http2Preface {
    fn probe(&self, buf: &[u8]) -> MatchResult {
        probe_prefix(buf, HTTP2_PREFACE)
    }

    fn name(&self) -> &str {
        "http2"
    }
}

/// Matches an arbitrary literal prefix.
#[derive(Debug, Clone)]
pub struct Prefix {
    name: String,
    pattern: Vec<u8>,
}

impl Prefix {
    pub fn new(name: impl Into<String>, pattern: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
        }
    }
}

impl Matcher for Prefix {
    fn probe(&self, buf: &[u8]) -> MatchResult {
        probe_prefix(buf, &self.pattern)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Catch-all. Register it last.
#[derive(Debug, Clone, Copy, Default)]
pub struct Any;

impl Matcher for Any {
    fn probe(&self, _buf: &[u8]) -> MatchResult {
        MatchResult::Matched
    }

    fn name(&self) -> &str {
        "any"
    }
}
