//! Request-line and header parsing.

use std::fmt;

use crate::admission::RequestLine;

/// Protocol version named on the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HttpVersion {
    pub major: u32,
    pub minor: u32,
}

impl HttpVersion {
    pub const HTTP_09: HttpVersion = HttpVersion { major: 0, minor: 9 };
    pub const HTTP_10: HttpVersion = HttpVersion { major: 1, minor: 0 };
    pub const HTTP_11: HttpVersion = HttpVersion { major: 1, minor: 1 };

    fn parse(s: &str) -> Option<Self> {
        let (major, minor) = s.split_once('.')?;
        if major.is_empty()
            || minor.is_empty()
            || !major.bytes().all(|b| b.is_ascii_digit())
            || !minor.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// A request line that parsed as `METHOD SP URI [SP HTTP/x.y] CRLF`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequestLine {
    pub method: String,
    pub uri: String,
    pub version: HttpVersion,
}

/// Parse a raw request line. `None` means 400 Bad Request.
///
/// A missing version means HTTP/0.9.
pub fn parse_request_line(line: &RequestLine) -> Option<ParsedRequestLine> {
    let bytes = line.as_bytes();
    let bytes = bytes.strip_suffix(b"\n")?;
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    let text = std::str::from_utf8(bytes).ok()?;

    if text.starts_with(|c: char| c.is_ascii_whitespace()) {
        return None;
    }

    let mut parts = text.split_ascii_whitespace();
    let method = parts.next()?;
    let uri = parts.next()?;
    let version = match parts.next() {
        None => HttpVersion::HTTP_09,
        Some(token) => HttpVersion::parse(token.strip_prefix("HTTP/")?)?,
    };
    if parts.next().is_some() {
        return None;
    }

    Some(ParsedRequestLine {
        method: method.to_string(),
        uri: uri.to_string(),
        version,
    })
}

/// The few headers the engine acts on; everything else is skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSummary {
    pub content_length: Option<u64>,
    pub connection_close: bool,
    pub connection_keep_alive: bool,
}

impl HeaderSummary {
    /// Fold one header line into the summary.
    ///
    /// Returns `false` for a line that is not a valid header.
    pub fn absorb(&mut self, line: &[u8]) -> bool {
        let Ok(text) = std::str::from_utf8(line) else {
            return false;
        };
        let text = text.trim_end_matches(['\r', '\n']);
        let Some((name, value)) = text.split_once(':') else {
            return false;
        };
        let value = value.trim();

        if name.eq_ignore_ascii_case("content-length") {
            match value.parse() {
                Ok(n) => self.content_length = Some(n),
                Err(_) => return false,
            }
        } else if name.eq_ignore_ascii_case("connection") {
            for token in value.split(',').map(str::trim) {
                if token.eq_ignore_ascii_case("close") {
                    self.connection_close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    self.connection_keep_alive = true;
                }
            }
        }
        true
    }

    /// Whether the connection should stay open after the response.
    pub fn keep_alive(&self, version: HttpVersion) -> bool {
        if self.connection_close {
            return false;
        }
        version >= HttpVersion::HTTP_11 || (version == HttpVersion::HTTP_10 && self.connection_keep_alive)
    }
}
