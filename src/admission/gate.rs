//! Availability gate: goes dark for a fixed window after a failure symptom.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::fault::{FaultDetector, FaultKind, RequestLine};
use crate::clock::{Clock, SystemClock};

/// Whether the gate currently lets responses out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    Available,
    Unavailable,
}

/// What a fault does to the timer when the gate is already unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultPolicy {
    /// Every detected fault restarts the recovery window.
    #[default]
    ResetTimer,
    /// The first fault of an outage fixes when it ends.
    KeepOriginal,
}

/// Mutable gate state, guarded as a unit.
#[derive(Debug, Clone)]
struct GateState {
    status: GateStatus,
    /// Set on the first outage and kept after recovery.
    became_unavailable_at: Option<Instant>,
    /// Wall-clock twin of `became_unavailable_at`, for diagnostics only.
    became_unavailable_wall: Option<DateTime<Utc>>,
}

/// Two-state outage simulator shared by every connection.
///
/// Recovery is evaluated lazily: there is no timer task, the first query at
/// or after the end of the recovery window flips the gate back.
pub struct AvailabilityGate<C: Clock = SystemClock> {
    detector: FaultDetector,
    recovery_window: Duration,
    policy: FaultPolicy,
    clock: C,
    state: Mutex<GateState>,
}

impl AvailabilityGate<SystemClock> {
    /// Create a gate on the system clock.
    pub fn new(detector: FaultDetector, recovery_window: Duration, policy: FaultPolicy) -> Self {
        Self::with_clock(detector, recovery_window, policy, SystemClock)
    }
}

impl<C: Clock> AvailabilityGate<C> {
    /// Create a gate on an explicit clock.
    pub fn with_clock(
        detector: FaultDetector,
        recovery_window: Duration,
        policy: FaultPolicy,
        clock: C,
    ) -> Self {
        Self {
            detector,
            recovery_window,
            policy,
            clock,
            state: Mutex::new(GateState {
                status: GateStatus::Available,
                became_unavailable_at: None,
                became_unavailable_wall: None,
            }),
        }
    }

    /// Classify `line` and, on a symptom, take the gate down.
    ///
    /// Returns the matched rule, if any.
    pub fn report_if_fault(&self, line: &RequestLine) -> Option<FaultKind> {
        let kind = self.detector.classify(line)?;

        let mut state = self.state.lock();
        let now = self.clock.now();
        self.recover_if_elapsed(&mut state, now);

        let restart = match (state.status, self.policy) {
            (GateStatus::Available, _) => true,
            (GateStatus::Unavailable, FaultPolicy::ResetTimer) => true,
            (GateStatus::Unavailable, FaultPolicy::KeepOriginal) => false,
        };

        if restart {
            let wall = Utc::now();
            warn!(
                fault = %kind,
                request_line = %line.display_trimmed(),
                since = %wall.to_rfc3339(),
                recovery_secs = self.recovery_window.as_secs_f64(),
                "Failure symptom detected, going unavailable"
            );
            state.status = GateStatus::Unavailable;
            // Never move the outage start backwards on a lagging reading.
            state.became_unavailable_at = Some(match state.became_unavailable_at {
                Some(prev) => prev.max(now),
                None => now,
            });
            state.became_unavailable_wall = Some(wall);
        } else {
            warn!(
                fault = %kind,
                request_line = %line.display_trimmed(),
                "Failure symptom detected while already unavailable"
            );
        }

        Some(kind)
    }

    /// Current status after applying the lazy recovery check.
    pub fn status(&self) -> GateStatus {
        let mut state = self.state.lock();
        let now = self.clock.now();
        self.recover_if_elapsed(&mut state, now);
        state.status
    }

    /// True while inside a recovery window.
    pub fn is_unavailable(&self) -> bool {
        self.status() == GateStatus::Unavailable
    }

    /// Time left in the current outage, or `None` if available.
    ///
    /// Takes the same single lock as [`status`](Self::status), so `Some` is
    /// itself the unavailable verdict.
    pub fn remaining(&self) -> Option<Duration> {
        let mut state = self.state.lock();
        let now = self.clock.now();
        self.recover_if_elapsed(&mut state, now);

        match (state.status, state.became_unavailable_at) {
            (GateStatus::Unavailable, Some(since)) => {
                Some(self.recovery_window.saturating_sub(now.saturating_duration_since(since)))
            }
            _ => None,
        }
    }

    /// Monotonic time of the most recent outage start.
    pub fn became_unavailable_at(&self) -> Option<Instant> {
        self.state.lock().became_unavailable_at
    }

    /// Wall-clock time of the most recent outage start.
    pub fn unavailable_since(&self) -> Option<DateTime<Utc>> {
        self.state.lock().became_unavailable_wall
    }

    /// The configured recovery window.
    pub fn recovery_window(&self) -> Duration {
        self.recovery_window
    }

    fn recover_if_elapsed(&self, state: &mut GateState, now: Instant) {
        if state.status != GateStatus::Unavailable {
            return;
        }
        let Some(since) = state.became_unavailable_at else {
            return;
        };
        if now.saturating_duration_since(since) >= self.recovery_window {
            info!(
                down_for_secs = now.saturating_duration_since(since).as_secs_f64(),
                "Recovery window elapsed, available again"
            );
            state.status = GateStatus::Available;
        }
    }
}
