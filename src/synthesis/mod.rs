//! Upstream speech-synthesis API.
//!
//! [`SynthesisClient`] is the seam the orchestrator calls through; the
//! production implementation is [`HttpSynthesisClient`]. Every failure comes
//! back as a [`ClientError`] already carrying its [`ErrorClassification`].

mod http;

pub use http::HttpSynthesisClient;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::error::{Classify, ErrorClassification};

#[derive(Error, Debug, Clone)]
#[error("synthesis API {class}: {message}")]
pub struct ClientError {
    pub class: ErrorClassification,
    /// HTTP status, when the API answered at all
    pub status: Option<u16>,
    pub message: String,
    /// Server-provided `Retry-After`, if any
    pub retry_after: Option<Duration>,
}

impl ClientError {
    pub fn new(class: ErrorClassification, message: impl Into<String>) -> Self {
        Self {
            class,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Failure from a non-2xx response.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            class: ErrorClassification::from_status(status),
            status: Some(status),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Connect failures, resets and timeouts.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorClassification::NetworkError, message)
    }

    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

impl Classify for ClientError {
    fn classify(&self) -> ErrorClassification {
        self.class
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// Turns normalized text into encoded audio.
#[async_trait]
pub trait SynthesisClient: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Bytes, ClientError>;
}

/// Settings for [`HttpSynthesisClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub voice_id: String,
    pub model_id: String,
    /// e.g. `mp3_44100_128`
    pub output_format: String,
    pub connect_timeout: Duration,
    /// Max idle time between bytes of the response
    pub read_timeout: Duration,
    /// Whole request, connect through last body byte
    pub total_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.elevenlabs.io".to_string(),
            api_key: None,
            voice_id: "21m00Tcm4TlvDq8Ikwh2".to_string(),
            model_id: "eleven_turbo_v2".to_string(),
            output_format: "mp3_44100_128".to_string(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(45),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_errors_classify() {
        assert_eq!(ClientError::from_status(429, "slow down").classify(), ErrorClassification::RateLimited);
        assert_eq!(ClientError::from_status(502, "bad gateway").classify(), ErrorClassification::ServerError);
        assert_eq!(ClientError::from_status(401, "bad key").classify(), ErrorClassification::AuthError);
        assert_eq!(ClientError::network("reset").classify(), ErrorClassification::NetworkError);
    }

    #[test]
    fn test_error_display() {
        let err = ClientError::from_status(503, "upstream overloaded");
        assert_eq!(err.to_string(), "synthesis API server_error: upstream overloaded");
        assert_eq!(err.status, Some(503));
    }

    #[test]
    fn test_reference_timeouts() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.read_timeout, Duration::from_secs(30));
        assert_eq!(config.total_timeout, Duration::from_secs(45));
    }
}
