//! Continuous token bucket capping sustained throughput.

use parking_lot::Mutex;
use std::time::Instant;
use tracing::trace;

use crate::clock::{Clock, SystemClock};

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

#[derive(Debug, Clone, Copy)]
struct BucketState {
    level: f64,
    last_refill_at: Instant,
}

/// A single global bucket.
///
/// Fractional tokens accrue in proportion to elapsed time, so bursts are
/// bounded by `capacity` and the long-run rate by `rate` per second.
/// `0 <= level <= capacity` holds after every call.
pub struct TokenBucket<C: Clock = SystemClock> {
    rate: f64,
    capacity: f64,
    clock: C,
    state: Mutex<BucketState>,
}

impl TokenBucket<SystemClock> {
    /// Create a full bucket on the system clock.
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self::with_clock(rate, capacity, SystemClock)
    }
}

impl<C: Clock> TokenBucket<C> {
    /// Create a full bucket on an explicit clock.
    pub fn with_clock(rate: f64, capacity: f64, clock: C) -> Self {
        let now = clock.now();
        Self {
            rate,
            capacity,
            clock,
            state: Mutex::new(BucketState {
                level: capacity,
                last_refill_at: now,
            }),
        }
    }

    /// Charge one token for the current attempt.
    ///
    /// Returns `true` when the limit is exceeded and the attempt must be
    /// refused. A refused attempt is not charged.
    pub fn try_consume(&self) -> bool {
        let mut state = self.state.lock();
        let now = self.clock.now();

        let elapsed = now.saturating_duration_since(state.last_refill_at);
        let refill = elapsed.as_nanos() as f64 * self.rate / NANOS_PER_SEC;
        let mut level = (state.level + refill).min(self.capacity);

        let exceeded = level < 1.0;
        if !exceeded {
            level -= 1.0;
        }

        state.level = level.clamp(0.0, self.capacity);
        // A stale reading must not rewind the refill point.
        state.last_refill_at = state.last_refill_at.max(now);

        trace!(depth = state.level, exceeded, "Token bucket charged");
        exceeded
    }

    /// Level as of the last charge. Does not refill.
    pub fn level(&self) -> f64 {
        self.state.lock().level
    }

    /// Tokens added per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Maximum level, also the burst size.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}
