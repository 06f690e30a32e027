//! Public types for the synthesis orchestrator.

use std::time::Duration;

use bytes::Bytes;

use crate::resilience::cancel::CancelToken;

/// Audio for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisResult {
    /// Encoded audio as returned by the synthesis API
    pub audio: Bytes,
    /// Served from a cache tier without contacting the API
    pub was_cached: bool,
    /// Time spent calling the API, retries included. Zero for cache hits.
    pub synthesis_time: Duration,
}

impl SynthesisResult {
    #[must_use]
    pub fn synthesis_time_ms(&self) -> u64 {
        self.synthesis_time.as_millis() as u64
    }
}

/// Per-request controls for [`super::SynthesisOrchestrator::synthesize_with`].
#[derive(Debug, Clone, Default)]
pub struct SynthesizeOptions {
    /// Upper bound on the whole request, retries and backoff included.
    /// Overrides the orchestrator's default deadline.
    pub deadline: Option<Duration>,
    /// Abort in-flight attempts and backoff sleeps when cancelled
    pub cancel: Option<CancelToken>,
}

impl SynthesizeOptions {
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}
