//! Failure-symptom detection on raw request lines.
//!
//! Certain request shapes are treated as evidence that the service has
//! broken: an overlong line that was cut off mid-read, a known-bad length
//! token, and a corrupted protocol delimiter. Classification is a pure
//! predicate over the bytes; it never touches shared state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default cap on the request line, in bytes.
pub const DEFAULT_MAX_LINE_LEN: usize = 1024;

/// A request line exactly as it was read off the wire, before any parsing.
///
/// May or may not end with LF: a read that hit the length cap first leaves
/// the line unterminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    raw: Vec<u8>,
}

impl RequestLine {
    /// Wrap raw bytes.
    pub fn new(raw: impl Into<Vec<u8>>) -> Self {
        Self { raw: raw.into() }
    }

    /// Raw bytes, including any trailing CR/LF.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Byte length of the line as read.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Whether the read stopped on a newline rather than on the length cap.
    pub fn is_terminated(&self) -> bool {
        self.raw.last() == Some(&b'\n')
    }

    /// The line with its trailing CRLF/LF removed, lossily decoded for logs.
    pub fn display_trimmed(&self) -> String {
        let mut end = self.raw.len();
        if end > 0 && self.raw[end - 1] == b'\n' {
            end -= 1;
            if end > 0 && self.raw[end - 1] == b'\r' {
                end -= 1;
            }
        }
        String::from_utf8_lossy(&self.raw[..end]).into_owned()
    }
}

impl From<&str> for RequestLine {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes())
    }
}

/// Which rule flagged a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Line reached the length cap without a newline.
    Oversized,
    /// Line carries a known-bad numeric/length token.
    ForbiddenToken,
    /// Line carries a mangled protocol delimiter.
    DelimiterCorruption,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::Oversized => "oversized",
            FaultKind::ForbiddenToken => "forbidden_token",
            FaultKind::DelimiterCorruption => "delimiter_corruption",
        };
        f.write_str(name)
    }
}

/// The pattern set the detector evaluates, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRules {
    /// Lines at least this long that were not newline-terminated are faults.
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,

    /// Literal substrings that mark a known-bad client.
    #[serde(default = "default_forbidden_tokens")]
    pub forbidden_tokens: Vec<String>,

    /// Literal substrings that mark a corrupted delimiter.
    #[serde(default = "default_corrupt_delimiters")]
    pub corrupt_delimiters: Vec<String>,
}

impl Default for FaultRules {
    fn default() -> Self {
        Self {
            max_line_len: default_max_line_len(),
            forbidden_tokens: default_forbidden_tokens(),
            corrupt_delimiters: default_corrupt_delimiters(),
        }
    }
}

fn default_max_line_len() -> usize {
    DEFAULT_MAX_LINE_LEN
}

fn default_forbidden_tokens() -> Vec<String> {
    vec!["65535d".to_string()]
}

fn default_corrupt_delimiters() -> Vec<String> {
    vec!["!HTTP".to_string()]
}

/// Stateless classifier over request lines.
#[derive(Debug, Clone, Default)]
pub struct FaultDetector {
    rules: FaultRules,
}

impl FaultDetector {
    /// Create a detector with the given rules.
    pub fn new(rules: FaultRules) -> Self {
        Self { rules }
    }

    /// The rules in effect.
    pub fn rules(&self) -> &FaultRules {
        &self.rules
    }

    /// Classify a line, returning the first rule that matched.
    pub fn classify(&self, line: &RequestLine) -> Option<FaultKind> {
        let bytes = line.as_bytes();

        if line.len() >= self.rules.max_line_len && !line.is_terminated() {
            return Some(FaultKind::Oversized);
        }
        if any_substring(bytes, &self.rules.forbidden_tokens) {
            return Some(FaultKind::ForbiddenToken);
        }
        if any_substring(bytes, &self.rules.corrupt_delimiters) {
            return Some(FaultKind::DelimiterCorruption);
        }
        None
    }

    /// Boolean form of [`classify`](Self::classify).
    pub fn is_fault(&self, line: &RequestLine) -> bool {
        self.classify(line).is_some()
    }
}

fn any_substring(haystack: &[u8], needles: &[String]) -> bool {
    needles.iter().any(|needle| contains(haystack, needle.as_bytes()))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}
