//! Minimal HTTP/1.x engine.
//!
//! Just enough protocol to put the admission hooks in front of real
//! clients: a bounded request-line read, header skipping and a canned body.

mod connection;
mod request;
mod response;
mod server;

pub use connection::{serve_connection, ConnectionOutcome, ConnectionSettings};
pub use request::{parse_request_line, HttpVersion, ParsedRequestLine};
pub use response::{Response, Status};
pub use server::{HttpServer, ServeOutcome};
