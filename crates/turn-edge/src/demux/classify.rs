//! Connection classification by peeking at the first bytes
//!
//! Matchers are consulted in priority order. A matcher that needs more bytes
//! holds the decision back, even if a later matcher already matches, so that
//! priority is honoured regardless of how the bytes arrive.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout_at, Instant};

/// Largest prefix ever inspected.
pub const MAX_PEEK: usize = 4096;

/// How long to wait before peeking again when no new bytes arrived.
const PEEK_BACKOFF: Duration = Duration::from_millis(5);

const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Longest method token accepted on an HTTP/1 request line.
const MAX_METHOD_LEN: usize = 20;

/// Protocol tag of a classified connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http1,
    Http2,
    /// Anything that is not HTTP, handed to the relay engine
    Other,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http1 => "http1",
            Protocol::Http2 => "http2",
            Protocol::Other => "other",
        }
    }

    pub fn is_http(&self) -> bool {
        matches!(self, Protocol::Http1 | Protocol::Http2)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Match,
    NoMatch,
    NeedMore,
}

/// One classification rule.
pub trait Matcher: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Inspect the bytes seen so far.
    fn inspect(&self, prefix: &[u8]) -> Verdict;
}

/// `METHOD SP request-target SP HTTP/1.x CRLF`
#[derive(Debug, Default, Clone, Copy)]
pub struct Http1RequestLine;

impl Matcher for Http1RequestLine {
    fn protocol(&self) -> Protocol {
        Protocol::Http1
    }

    fn inspect(&self, prefix: &[u8]) -> Verdict {
        // Method: uppercase token.
        let method_len = prefix.iter().take_while(|b| b.is_ascii_uppercase()).count();
        if method_len > MAX_METHOD_LEN {
            return Verdict::NoMatch;
        }
        let rest = &prefix[method_len..];
        match rest.first().copied() {
            None => return Verdict::NeedMore,
            Some(b' ') if method_len > 0 => {}
            Some(_) => return Verdict::NoMatch,
        }

        // Request target: visible ASCII up to the next space.
        let rest = &rest[1..];
        let target_len = rest.iter().take_while(|b| b.is_ascii_graphic()).count();
        let rest = &rest[target_len..];
        match rest.first().copied() {
            None => return Verdict::NeedMore,
            Some(b' ') if target_len > 0 => {}
            Some(_) => return Verdict::NoMatch,
        }

        // Version.
        match_pattern(&rest[1..], |i, b| match i {
            0..=6 => b == b"HTTP/1."[i],
            7 => b == b'0' || b == b'1',
            8 => b == b'\r',
            9 => b == b'\n',
            _ => true,
        }, 10)
    }
}

/// The HTTP/2 client connection preface.
#[derive(Debug, Default, Clone, Copy)]
pub struct Http2Preface;

impl Matcher for Http2Preface {
    fn protocol(&self) -> Protocol {
        Protocol::Http2
    }

    fn inspect(&self, prefix: &[u8]) -> Verdict {
        match_pattern(prefix, |i, b| b == HTTP2_PREFACE[i], HTTP2_PREFACE.len())
    }
}

/// Match the first `len` bytes of `data` against a per-position predicate.
fn match_pattern(data: &[u8], accept: impl Fn(usize, u8) -> bool, len: usize) -> Verdict {
    for (i, &b) in data.iter().take(len).enumerate() {
        if !accept(i, b) {
            return Verdict::NoMatch;
        }
    }
    if data.len() >= len {
        Verdict::Match
    } else {
        Verdict::NeedMore
    }
}

/// An accepted connection with its protocol tag fixed.
#[derive(Debug)]
pub struct ClassifiedConnection {
    stream: TcpStream,
    peer: SocketAddr,
    protocol: Protocol,
}

impl ClassifiedConnection {
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn into_parts(self) -> (TcpStream, SocketAddr, Protocol) {
        (self.stream, self.peer, self.protocol)
    }
}

/// Ordered set of matchers plus the peek policy.
pub struct Classifier {
    matchers: Vec<Box<dyn Matcher>>,
    timeout: Duration,
    max_peek: usize,
}

impl Classifier {
    /// Classifier with no rules; everything becomes [`Protocol::Other`].
    pub fn new(timeout: Duration) -> Self {
        Self {
            matchers: Vec::new(),
            timeout,
            max_peek: MAX_PEEK,
        }
    }

    /// HTTP/1 request line first, then the HTTP/2 preface.
    pub fn http(timeout: Duration) -> Self {
        Self::new(timeout)
            .with_matcher(Http1RequestLine)
            .with_matcher(Http2Preface)
    }

    /// Append a rule with lower priority than the existing ones.
    pub fn with_matcher(mut self, matcher: impl Matcher + 'static) -> Self {
        self.matchers.push(Box::new(matcher));
        self
    }

    pub fn with_max_peek(mut self, max_peek: usize) -> Self {
        self.max_peek = max_peek.max(1);
        self
    }

    /// Decide from a prefix. `None` means more bytes are needed; with
    /// `last` set a decision is always returned.
    pub fn decide(&self, prefix: &[u8], last: bool) -> Option<Protocol> {
        for matcher in &self.matchers {
            match matcher.inspect(prefix) {
                Verdict::Match => return Some(matcher.protocol()),
                Verdict::NeedMore if !last => return None,
                Verdict::NeedMore | Verdict::NoMatch => {}
            }
        }
        Some(Protocol::Other)
    }

    /// Decide from a prefix that filled the peek buffer.
    ///
    /// No more bytes will be inspected, so the first matcher the whole
    /// buffer is still consistent with wins.
    pub fn decide_full(&self, prefix: &[u8]) -> Protocol {
        self.matchers
            .iter()
            .find(|matcher| matcher.inspect(prefix) != Verdict::NoMatch)
            .map_or(Protocol::Other, |matcher| matcher.protocol())
    }

    /// Peek at the stream until a decision can be made. No bytes are consumed.
    pub async fn classify(&self, stream: TcpStream, peer: SocketAddr) -> ClassifiedConnection {
        let protocol = self.peek_protocol(&stream).await;
        ClassifiedConnection { stream, peer, protocol }
    }

    async fn peek_protocol(&self, stream: &TcpStream) -> Protocol {
        let mut buf = vec![0u8; self.max_peek];
        let deadline = Instant::now() + self.timeout;
        let mut seen = 0;

        loop {
            let n = match timeout_at(deadline, stream.peek(&mut buf)).await {
                Ok(Ok(n)) => n,
                Ok(Err(_)) => return Protocol::Other,
                // Timed out waiting for more.
                Err(_) => return self.decide(&buf[..seen], true).unwrap_or(Protocol::Other),
            };

            if n >= buf.len() {
                return self.decide_full(&buf[..n]);
            }

            // 0 is end of stream with nothing buffered.
            if let Some(protocol) = self.decide(&buf[..n], n == 0) {
                return protocol;
            }

            if n == seen {
                if Instant::now() + PEEK_BACKOFF >= deadline {
                    return self.decide(&buf[..n], true).unwrap_or(Protocol::Other);
                }
                sleep(PEEK_BACKOFF).await;
            }
            seen = n;
        }
    }
}

impl fmt::Debug for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier")
            .field("matchers", &self.matchers.iter().map(|m| m.protocol()).collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .field("max_peek", &self.max_peek)
            .finish()
    }
}
