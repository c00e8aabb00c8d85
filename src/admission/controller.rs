//! Admission controller: the two hook points an HTTP engine calls.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

use super::bucket::TokenBucket;
use super::fault::{FaultDetector, RequestLine};
use super::gate::AvailabilityGate;
use crate::clock::{Clock, SystemClock};
use crate::config::AdmissionConfig;

/// Why a response was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The gate is inside a recovery window.
    Unavailable,
    /// The token bucket is empty.
    RateLimited,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Unavailable => f.write_str("unavailable"),
            RejectReason::RateLimited => f.write_str("rate_limited"),
        }
    }
}

/// Verdict for a response that is about to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Write the response.
    Admit,
    /// Write nothing and drop the connection.
    Reject(RejectReason),
}

impl Decision {
    pub fn is_admit(&self) -> bool {
        matches!(self, Decision::Admit)
    }
}

/// What the engine does beyond dropping the connection on a reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectAction {
    /// Close only the offending connection and keep serving.
    #[default]
    CloseConnection,
    /// Stop the whole server, simulating a total outage.
    ExitProcess,
}

impl std::str::FromStr for RejectAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "close-connection" => Ok(RejectAction::CloseConnection),
            "exit-process" => Ok(RejectAction::ExitProcess),
            other => Err(format!(
                "unknown reject action '{}', expected close-connection or exit-process",
                other
            )),
        }
    }
}

/// Interface the HTTP engine is written against.
///
/// Both hooks are synchronous: they only take a short lock and read a clock.
pub trait AdmissionHooks: Send + Sync {
    /// Called after the request line is read, before it is parsed.
    ///
    /// `None` means the connection ended before any bytes arrived; the
    /// engine handles end of input itself.
    fn on_request_line(&self, line: Option<&RequestLine>);

    /// Called immediately before response bytes are written.
    fn before_send_response(&self) -> Decision;

    /// How the engine should treat a rejected response.
    fn reject_action(&self) -> RejectAction {
        RejectAction::CloseConnection
    }
}

/// Composes the availability gate and the token bucket.
pub struct AdmissionController<C: Clock = SystemClock> {
    gate: AvailabilityGate<C>,
    bucket: TokenBucket<C>,
    on_reject: RejectAction,
}

impl AdmissionController<SystemClock> {
    /// Build the gate and bucket described by `config` on the system clock.
    pub fn from_config(config: &AdmissionConfig) -> Self {
        let gate = AvailabilityGate::new(
            FaultDetector::new(config.rules.clone()),
            config.recovery_window(),
            config.fault_policy,
        );
        let bucket = TokenBucket::new(config.rate, config.window);
        Self::new(gate, bucket, config.on_reject)
    }
}

impl<C: Clock> AdmissionController<C> {
    /// Create a controller from its parts.
    pub fn new(gate: AvailabilityGate<C>, bucket: TokenBucket<C>, on_reject: RejectAction) -> Self {
        Self {
            gate,
            bucket,
            on_reject,
        }
    }

    pub fn gate(&self) -> &AvailabilityGate<C> {
        &self.gate
    }

    pub fn bucket(&self) -> &TokenBucket<C> {
        &self.bucket
    }
}

impl<C: Clock> AdmissionHooks for AdmissionController<C> {
    fn on_request_line(&self, line: Option<&RequestLine>) {
        if let Some(line) = line {
            self.gate.report_if_fault(line);
        }
    }

    fn before_send_response(&self) -> Decision {
        if let Some(remaining) = self.gate.remaining() {
            debug!(
                since = ?self.gate.unavailable_since().map(|t| t.to_rfc3339()),
                remaining_secs = remaining.as_secs_f64(),
                "Unavailable, refusing to respond"
            );
            return Decision::Reject(RejectReason::Unavailable);
        }

        // The bucket is only charged for responses the gate would let out.
        if self.bucket.try_consume() {
            warn!(rate = self.bucket.rate(), "Rate limit exceeded, refusing to respond");
            return Decision::Reject(RejectReason::RateLimited);
        }

        Decision::Admit
    }

    fn reject_action(&self) -> RejectAction {
        self.on_reject
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::gate::FaultPolicy;
    use crate::clock::MockClock;
    use std::time::Duration;

    fn controller(rate: f64, window: f64, recovery_secs: u64) -> (AdmissionController<MockClock>, MockClock) {
        let clock = MockClock::default();
        let gate = AvailabilityGate::with_clock(
            FaultDetector::default(),
            Duration::from_secs(recovery_secs),
            FaultPolicy::ResetTimer,
            clock.clone(),
        );
        let bucket = TokenBucket::with_clock(rate, window, clock.clone());
        (
            AdmissionController::new(gate, bucket, RejectAction::CloseConnection),
            clock,
        )
    }

    fn good() -> RequestLine {
        RequestLine::from("GET / HTTP/1.1\r\n")
    }

    #[test]
    fn test_rate_limit_scenario() {
        let (ctl, clock) = controller(5000.0, 5.0, 15);

        for _ in 0..5 {
            ctl.on_request_line(Some(&good()));
            assert_eq!(ctl.before_send_response(), Decision::Admit);
        }

        ctl.on_request_line(Some(&good()));
        assert_eq!(
            ctl.before_send_response(),
            Decision::Reject(RejectReason::RateLimited)
        );

        clock.advance(Duration::from_millis(1));
        assert_eq!(ctl.before_send_response(), Decision::Admit);
    }

    #[test]
    fn test_fault_scenario() {
        let (ctl, clock) = controller(5000.0, 5.0, 15);

        ctl.on_request_line(Some(&RequestLine::from("GET /65535d HTTP/1.1\r\n")));
        assert_eq!(
            ctl.before_send_response(),
            Decision::Reject(RejectReason::Unavailable)
        );

        for _ in 0..14 {
            clock.advance(Duration::from_secs(1));
            assert_eq!(
                ctl.before_send_response(),
                Decision::Reject(RejectReason::Unavailable)
            );
        }

        clock.advance(Duration::from_secs(1));
        assert_eq!(ctl.before_send_response(), Decision::Admit);
    }

    #[test]
    fn test_unavailable_rejections_do_not_drain_bucket() {
        let (ctl, clock) = controller(1.0, 2.0, 5);
        ctl.on_request_line(Some(&RequestLine::from("GET / !HTTP/1.1\r\n")));

        for _ in 0..10 {
            assert!(!ctl.before_send_response().is_admit());
        }
        assert_eq!(ctl.bucket().level(), 2.0);

        clock.advance(Duration::from_secs(5));
        assert!(ctl.before_send_response().is_admit());
    }

    #[test]
    fn test_refusal_decided_by_remaining_time() {
        let (ctl, clock) = controller(5000.0, 5.0, 15);
        ctl.on_request_line(Some(&RequestLine::from("GET / !HTTP/1.1\r\n")));

        clock.advance(Duration::from_millis(14_999));
        assert_eq!(ctl.gate().remaining(), Some(Duration::from_millis(1)));
        assert_eq!(
            ctl.before_send_response(),
            Decision::Reject(RejectReason::Unavailable)
        );

        clock.advance(Duration::from_millis(1));
        assert_eq!(ctl.before_send_response(), Decision::Admit);
        assert_eq!(ctl.gate().remaining(), None);
    }

    #[test]
    fn test_missing_line_is_not_a_fault() {
        let (ctl, _) = controller(5000.0, 5.0, 15);
        ctl.on_request_line(None);
        assert!(!ctl.gate().is_unavailable());
        assert_eq!(ctl.before_send_response(), Decision::Admit);
    }

    #[test]
    fn test_reject_action_parsing() {
        assert_eq!(
            "exit-process".parse::<RejectAction>().unwrap(),
            RejectAction::ExitProcess
        );
        assert_eq!(
            "close-connection".parse::<RejectAction>().unwrap(),
            RejectAction::CloseConnection
        );
        assert!("explode".parse::<RejectAction>().is_err());
    }

    #[test]
    fn test_reject_action_is_reported() {
        let clock = MockClock::default();
        let gate = AvailabilityGate::with_clock(
            FaultDetector::default(),
            Duration::from_secs(15),
            FaultPolicy::ResetTimer,
            clock.clone(),
        );
        let bucket = TokenBucket::with_clock(1.0, 1.0, clock);
        let ctl = AdmissionController::new(gate, bucket, RejectAction::ExitProcess);
        assert_eq!(ctl.reject_action(), RejectAction::ExitProcess);
    }

    #[test]
    fn test_from_config() {
        let config = AdmissionConfig {
            recovery_window_secs: 7,
            rate: 2.0,
            window: 3.0,
            on_reject: RejectAction::ExitProcess,
            ..AdmissionConfig::default()
        };
        let ctl = AdmissionController::from_config(&config);
        assert_eq!(ctl.gate().recovery_window(), Duration::from_secs(7));
        assert_eq!(ctl.bucket().rate(), 2.0);
        assert_eq!(ctl.bucket().capacity(), 3.0);
        assert_eq!(ctl.reject_action(), RejectAction::ExitProcess);
    }
}
