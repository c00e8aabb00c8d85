//! Response serialization.

use chrono::Utc;

use super::request::HttpVersion;

/// Status codes the engine produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    RequestUriTooLarge,
}

impl Status {
    pub fn code(&self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::RequestUriTooLarge => 414,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::RequestUriTooLarge => "Request-URI Too Large",
        }
    }
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: Status,
    pub body: String,
    pub keep_alive: bool,
    /// HTTP/0.9 responses are the bare body.
    pub bare: bool,
}

impl Response {
    /// The configured body for a well-formed request.
    pub fn ok(body: &str, version: HttpVersion, keep_alive: bool) -> Self {
        Self {
            status: Status::Ok,
            body: body.to_string(),
            keep_alive,
            bare: version == HttpVersion::HTTP_09,
        }
    }

    /// An error page; always closes the connection.
    pub fn error(status: Status) -> Self {
        Self {
            status,
            body: format!("{} {}\n", status.code(), status.reason()),
            keep_alive: false,
            bare: false,
        }
    }

    /// Serialize head and body.
    pub fn to_bytes(&self) -> Vec<u8> {
        if self.bare {
            return self.body.as_bytes().to_vec();
        }

        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
        let head = format!(
            "HTTP/1.1 {} {}\r\n\
             Server: deadbrick/{}\r\n\
             Date: {}\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             Content-Length: {}\r\n\
             Connection: {}\r\n\
             \r\n",
            self.status.code(),
            self.status.reason(),
            env!("CARGO_PKG_VERSION"),
            date,
            self.body.len(),
            if self.keep_alive { "keep-alive" } else { "close" },
        );

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(self.body.as_bytes());
        bytes
    }
}
