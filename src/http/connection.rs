//! Per-connection request loop.
//!
//! Reads one request at a time, calls the admission hooks at the two fixed
//! points (after the request line, before the response), and either writes
//! the response or drops the connection without a byte.

use std::io;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use super::request::{parse_request_line, HeaderSummary, HttpVersion};
use super::response::{Response, Status};
use crate::admission::{AdmissionHooks, Decision, RejectReason, RequestLine};

/// Cap on a single header line.
const MAX_HEADER_LINE_LEN: usize = 8192;
/// Cap on the number of header lines per request.
const MAX_HEADERS: usize = 100;

/// Settings shared by every connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Request-line read cap, in bytes.
    pub max_line_len: usize,
    /// Body of every 200 response.
    pub body: String,
    /// Deadline for a whole request: line, headers and body.
    pub request_timeout: Duration,
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// Client went away or the last response was not keep-alive.
    Closed,
    /// A response was refused; nothing was written for it.
    Rejected(RejectReason),
}

/// Serve requests on `stream` until it closes or a response is refused.
pub async fn serve_connection<S>(
    stream: S,
    hooks: &dyn AdmissionHooks,
    settings: &ConnectionSettings,
) -> io::Result<ConnectionOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);

    loop {
        let deadline = Instant::now() + settings.request_timeout;

        let line = match timeout_at(
            deadline,
            read_request_line(&mut stream, settings.max_line_len),
        )
        .await
        {
            Ok(line) => line?,
            Err(_) => {
                trace!("Timed out waiting for a request line");
                None
            }
        };

        hooks.on_request_line(line.as_ref());
        let Some(line) = line else {
            return Ok(ConnectionOutcome::Closed);
        };

        trace!(request_line = %line.display_trimmed(), "Request line read");
        // A stalled header block or body ends the connection like EOF does.
        let response =
            match timeout_at(deadline, build_response(&mut stream, &line, settings)).await {
                Ok(response) => response?,
                Err(_) => {
                    trace!("Timed out reading the rest of the request");
                    return Ok(ConnectionOutcome::Closed);
                }
            };

        if let Decision::Reject(reason) = hooks.before_send_response() {
            return Ok(ConnectionOutcome::Rejected(reason));
        }

        stream.write_all(&response.to_bytes()).await?;
        stream.flush().await?;
        debug!(status = response.status.code(), "Response sent");

        if !response.keep_alive {
            stream.shutdown().await.ok();
            return Ok(ConnectionOutcome::Closed);
        }
    }
}

/// Read up to `limit` bytes, stopping after LF. `None` on immediate EOF.
async fn read_request_line<R>(reader: &mut R, limit: usize) -> io::Result<Option<RequestLine>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = read_bounded_line(reader, limit, &mut buf).await?;
    Ok((n > 0).then(|| RequestLine::new(buf)))
}

async fn read_bounded_line<R>(reader: &mut R, limit: usize, buf: &mut Vec<u8>) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    (&mut *reader).take(limit as u64).read_until(b'\n', buf).await
}

async fn build_response<R>(
    reader: &mut R,
    line: &RequestLine,
    settings: &ConnectionSettings,
) -> io::Result<Response>
where
    R: AsyncBufRead + Unpin,
{
    if line.len() >= settings.max_line_len && !line.is_terminated() {
        return Ok(Response::error(Status::RequestUriTooLarge));
    }

    let Some(parsed) = parse_request_line(line) else {
        debug!(request_line = %line.display_trimmed(), "Bad request line");
        return Ok(Response::error(Status::BadRequest));
    };

    if parsed.version == HttpVersion::HTTP_09 {
        return Ok(Response::ok(&settings.body, parsed.version, false));
    }

    let Some(headers) = read_headers(reader).await? else {
        return Ok(Response::error(Status::BadRequest));
    };

    if let Some(len) = headers.content_length {
        tokio::io::copy(&mut (&mut *reader).take(len), &mut tokio::io::sink()).await?;
    }

    trace!(method = %parsed.method, uri = %parsed.uri, version = %parsed.version, "Request parsed");
    Ok(Response::ok(
        &settings.body,
        parsed.version,
        headers.keep_alive(parsed.version),
    ))
}

/// Read header lines up to the blank line. `None` on a malformed block.
async fn read_headers<R>(reader: &mut R) -> io::Result<Option<HeaderSummary>>
where
    R: AsyncBufRead + Unpin,
{
    let mut summary = HeaderSummary::default();

    for _ in 0..=MAX_HEADERS {
        let mut buf = Vec::new();
        read_bounded_line(reader, MAX_HEADER_LINE_LEN, &mut buf).await?;

        if buf.last() != Some(&b'\n') {
            return Ok(None);
        }
        if buf == b"\r\n" || buf == b"\n" {
            return Ok(Some(summary));
        }
        if !summary.absorb(&buf) {
            return Ok(None);
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{
        AdmissionController, AvailabilityGate, FaultDetector, FaultPolicy, RejectAction,
        TokenBucket,
    };
    use crate::clock::MockClock;
    use parking_lot::Mutex;

    /// Hooks that admit everything and remember what they were shown.
    #[derive(Default)]
    struct RecordingHooks {
        lines: Mutex<Vec<Option<Vec<u8>>>>,
    }

    impl AdmissionHooks for RecordingHooks {
        fn on_request_line(&self, line: Option<&RequestLine>) {
            self.lines.lock().push(line.map(|l| l.as_bytes().to_vec()));
        }

        fn before_send_response(&self) -> Decision {
            Decision::Admit
        }
    }

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            max_line_len: 1024,
            body: "Goodbye cruel world!".to_string(),
            request_timeout: Duration::from_secs(5),
        }
    }

    fn controller(rate: f64, window: f64) -> AdmissionController<MockClock> {
        let clock = MockClock::default();
        let gate = AvailabilityGate::with_clock(
            FaultDetector::default(),
            Duration::from_secs(15),
            FaultPolicy::ResetTimer,
            clock.clone(),
        );
        AdmissionController::new(
            gate,
            TokenBucket::with_clock(rate, window, clock),
            RejectAction::CloseConnection,
        )
    }

    /// Write `request`, then collect everything the server sends.
    async fn exchange(
        hooks: &dyn AdmissionHooks,
        request: &[u8],
    ) -> (io::Result<ConnectionOutcome>, String) {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let settings = settings();

        let client_side = async {
            client.write_all(request).await.unwrap();
            client.shutdown().await.unwrap();
            let mut out = Vec::new();
            client.read_to_end(&mut out).await.unwrap();
            String::from_utf8(out).unwrap()
        };
        let server_side = serve_connection(server, hooks, &settings);

        tokio::join!(server_side, client_side)
    }

    #[tokio::test]
    async fn test_serves_well_formed_request() {
        let ctl = controller(5000.0, 5.0);
        let (outcome, text) = exchange(&ctl, b"GET / HTTP/1.0\r\nHost: x\r\n\r\n").await;

        assert_eq!(tokio_test::assert_ok!(outcome), ConnectionOutcome::Closed);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("Goodbye cruel world!"));
    }

    #[tokio::test]
    async fn test_keep_alive_serves_pipelined_requests() {
        let ctl = controller(5000.0, 5.0);
        let request = b"GET /a HTTP/1.1\r\n\r\nPOST /b HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloGET /c HTTP/1.1\r\nConnection: close\r\n\r\n";
        let (outcome, text) = exchange(&ctl, request).await;

        assert_eq!(tokio_test::assert_ok!(outcome), ConnectionOutcome::Closed);
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 3);
    }

    #[tokio::test]
    async fn test_fault_line_is_refused_silently() {
        let ctl = controller(5000.0, 5.0);
        let (outcome, text) = exchange(&ctl, b"GET /?n=65535d HTTP/1.0\r\n\r\n").await;

        assert_eq!(
            tokio_test::assert_ok!(outcome),
            ConnectionOutcome::Rejected(RejectReason::Unavailable)
        );
        assert!(text.is_empty());
        assert!(ctl.gate().is_unavailable());
    }

    #[tokio::test]
    async fn test_oversized_line_trips_gate() {
        let ctl = controller(5000.0, 5.0);
        let mut request = vec![b'A'; 2048];
        request.extend_from_slice(b"\r\n\r\n");
        let (outcome, text) = exchange(&ctl, &request).await;

        assert_eq!(
            tokio_test::assert_ok!(outcome),
            ConnectionOutcome::Rejected(RejectReason::Unavailable)
        );
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn test_bad_request_line_gets_400() {
        let ctl = controller(5000.0, 5.0);
        let (outcome, text) = exchange(&ctl, b"NONSENSE\r\n\r\n").await;

        assert_eq!(tokio_test::assert_ok!(outcome), ConnectionOutcome::Closed);
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(!ctl.gate().is_unavailable());
    }

    #[tokio::test]
    async fn test_rate_limit_drops_connection_mid_pipeline() {
        let ctl = controller(0.001, 2.0);
        let request = b"GET / HTTP/1.1\r\n\r\nGET / HTTP/1.1\r\n\r\nGET / HTTP/1.1\r\n\r\n";
        let (outcome, text) = exchange(&ctl, request).await;

        assert_eq!(
            tokio_test::assert_ok!(outcome),
            ConnectionOutcome::Rejected(RejectReason::RateLimited)
        );
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
    }

    #[tokio::test]
    async fn test_http09_gets_bare_body() {
        let ctl = controller(5000.0, 5.0);
        let (outcome, text) = exchange(&ctl, b"GET /\r\n").await;

        assert_eq!(tokio_test::assert_ok!(outcome), ConnectionOutcome::Closed);
        assert_eq!(text, "Goodbye cruel world!");
    }

    #[tokio::test]
    async fn test_immediate_eof_is_not_a_fault() {
        let ctl = controller(5000.0, 5.0);
        let (outcome, text) = exchange(&ctl, b"").await;

        assert_eq!(tokio_test::assert_ok!(outcome), ConnectionOutcome::Closed);
        assert!(text.is_empty());
        assert!(!ctl.gate().is_unavailable());
        assert_eq!(ctl.bucket().level(), 5.0);
    }

    fn short_timeout() -> ConnectionSettings {
        ConnectionSettings {
            request_timeout: Duration::from_millis(100),
            ..settings()
        }
    }

    /// Write `partial` without closing, then run the server to completion.
    async fn stall(
        hooks: &dyn AdmissionHooks,
        partial: &[u8],
    ) -> (io::Result<ConnectionOutcome>, Vec<u8>) {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let settings = short_timeout();
        client.write_all(partial).await.unwrap();

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            serve_connection(server, hooks, &settings),
        )
        .await
        .expect("connection outlived its request deadline");

        // The server half is gone, so this reads to EOF.
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        (outcome, out)
    }

    #[tokio::test]
    async fn test_idle_connection_reports_missing_line() {
        let hooks = RecordingHooks::default();
        let (outcome, out) = stall(&hooks, b"").await;

        assert_eq!(tokio_test::assert_ok!(outcome), ConnectionOutcome::Closed);
        assert!(out.is_empty());
        assert_eq!(*hooks.lines.lock(), vec![None]);
    }

    #[tokio::test]
    async fn test_stalled_headers_close_without_response() {
        let hooks = RecordingHooks::default();
        let (outcome, out) = stall(&hooks, b"GET / HTTP/1.1\r\nHost: x\r\n").await;

        assert_eq!(tokio_test::assert_ok!(outcome), ConnectionOutcome::Closed);
        assert!(out.is_empty());
        assert_eq!(*hooks.lines.lock(), vec![Some(b"GET / HTTP/1.1\r\n".to_vec())]);
    }

    #[tokio::test]
    async fn test_stalled_body_close_without_response() {
        let ctl = controller(5000.0, 5.0);
        let (outcome, out) = stall(
            &ctl,
            b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nab",
        )
        .await;

        assert_eq!(tokio_test::assert_ok!(outcome), ConnectionOutcome::Closed);
        assert!(out.is_empty());
        assert_eq!(ctl.bucket().level(), 5.0);
    }

    #[tokio::test]
    async fn test_deadline_covers_request_not_connection() {
        let hooks = RecordingHooks::default();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let settings = ConnectionSettings {
            request_timeout: Duration::from_millis(150),
            ..settings()
        };

        // Each gap fits the deadline; together they exceed it.
        let client_side = async {
            for _ in 0..4 {
                client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
                tokio::time::sleep(Duration::from_millis(60)).await;
            }
            client.write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();
            let mut out = Vec::new();
            client.read_to_end(&mut out).await.unwrap();
            String::from_utf8(out).unwrap()
        };
        let (outcome, text) = tokio::join!(serve_connection(server, &hooks, &settings), client_side);

        assert_eq!(tokio_test::assert_ok!(outcome), ConnectionOutcome::Closed);
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 5);
        assert_eq!(hooks.lines.lock().len(), 5);
    }
}
