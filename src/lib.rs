//! Deadbrick - a deliberately fragile HTTP service.
//!
//! Deadbrick answers every request with a fixed body until it sees a request
//! line shaped like a failure symptom. Then it goes dark for a recovery
//! window, refusing to respond at all. A global token bucket caps sustained
//! throughput on top of that. It exists to exercise client-side retries,
//! backoff and circuit breakers against a service that fails hard.

pub mod admission;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
