//! Failure handling around the upstream API: circuit breaker, per-class
//! backoff, the retry loop and cancellation.

pub mod backoff;
pub mod cancel;
pub mod circuit_breaker;
pub mod retry;
