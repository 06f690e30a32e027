//! Error taxonomy for the synthesis path.
//!
//! Every failure from the upstream API is reduced to an
//! [`ErrorClassification`], which picks the retry policy. Only the final
//! outcome crosses the orchestrator boundary as a [`SynthesisError`].

use std::time::Duration;

use thiserror::Error;

/// Class of an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClassification {
    /// HTTP 429
    RateLimited,
    /// HTTP 5xx
    ServerError,
    /// Connect failures, resets and every kind of timeout
    NetworkError,
    /// HTTP 401/403. Never retried.
    AuthError,
    Unknown,
}

impl ErrorClassification {
    /// Classify an HTTP status code from the synthesis API.
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimited,
            401 | 403 => Self::AuthError,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::AuthError)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::NetworkError => "network_error",
            Self::AuthError => "auth_error",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that know which retry policy applies to them.
pub trait Classify {
    fn classify(&self) -> ErrorClassification;

    /// Server-requested wait before the next attempt.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Final outcome of a failed `synthesize` call.
///
/// Callers are expected to fall back to text-only output on any of these.
#[derive(Error, Debug)]
pub enum SynthesisError {
    #[error("invalid synthesis request: {0}")]
    Validation(String),

    /// The breaker refused the call; the API was not contacted.
    #[error("circuit breaker open, synthesis skipped")]
    CircuitOpen { retry_after: Option<Duration> },

    #[error("synthesis failed after {attempts} attempts ({class}): {message}")]
    RetryExhausted {
        class: ErrorClassification,
        attempts: u32,
        message: String,
    },

    #[error("synthesis API rejected credentials: {0}")]
    Auth(String),

    #[error("synthesis request cancelled")]
    Cancelled,

    #[error("synthesis deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

impl SynthesisError {
    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Auth(_) => "auth",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded(_) => "deadline_exceeded",
        }
    }

    /// Whether the same request might succeed if sent again later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::RetryExhausted { .. } | Self::DeadlineExceeded(_)
        )
    }
}
