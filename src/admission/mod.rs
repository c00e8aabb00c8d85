//! Admission control: fault detection, time-bounded unavailability and
//! rate limiting, exposed to an HTTP engine through [`AdmissionHooks`].

mod bucket;
mod controller;
mod fault;
mod gate;

pub use bucket::TokenBucket;
pub use controller::{AdmissionController, AdmissionHooks, Decision, RejectAction, RejectReason};
pub use fault::{FaultDetector, FaultKind, FaultRules, RequestLine, DEFAULT_MAX_LINE_LEN};
pub use gate::{AvailabilityGate, FaultPolicy, GateStatus};
