//! HTTP client for the text-to-speech API.
//!
//! ```text
//! POST {base_url}/v1/text-to-speech/{voice_id}?output_format=mp3_44100_128
//! xi-api-key: <key>
//! {"text": "...", "model_id": "..."}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use super::{ClientConfig, ClientError, SynthesisClient};
use crate::error::ErrorClassification;

/// Longest error body kept in a [`ClientError`] message.
const MAX_ERROR_BODY: usize = 512;

#[derive(Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    model_id: &'a str,
}

pub struct HttpSynthesisClient {
    client: Client,
    config: ClientConfig,
    url: String,
}

impl HttpSynthesisClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .timeout(config.total_timeout)
            .build()
            .map_err(|e| ClientError::new(ErrorClassification::Unknown, format!("HTTP client setup failed: {}", e)))?;

        let url = format!(
            "{}/v1/text-to-speech/{}?output_format={}",
            config.base_url.trim_end_matches('/'),
            config.voice_id,
            config.output_format
        );

        Ok(Self { client, config, url })
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl std::fmt::Debug for HttpSynthesisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSynthesisClient")
            .field("url", &self.url)
            .field("api_key", &self.config.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[async_trait]
impl SynthesisClient for HttpSynthesisClient {
    async fn synthesize(&self, text: &str) -> Result<Bytes, ClientError> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Accept", "audio/mpeg")
            .json(&TtsRequest {
                text,
                model_id: &self.config.model_id,
            });
        if let Some(ref key) = self.config.api_key {
            request = request.header("xi-api-key", key);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();

        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            let message = error_message(&body);
            debug!(status = status.as_u16(), message = %message, "Synthesis API returned an error");
            return Err(ClientError::from_status(status.as_u16(), message).with_retry_after(retry_after));
        }

        let audio = response.bytes().await.map_err(transport_error)?;
        if audio.is_empty() {
            return Err(ClientError::new(ErrorClassification::Unknown, "empty audio payload"));
        }
        Ok(audio)
    }
}

fn transport_error(e: reqwest::Error) -> ClientError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        ClientError::network(e.to_string())
    } else {
        ClientError::new(ErrorClassification::Unknown, e.to_string())
    }
}

/// Pull the human-readable message out of an error body.
///
/// The API answers `{"detail": {"message": ".."}}` or `{"detail": ".."}`;
/// anything else is kept verbatim. Capped at [`MAX_ERROR_BODY`] bytes.
fn error_message(body: &str) -> String {
    let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
    let detail = parsed.as_ref().and_then(|v| v.get("detail"));
    let mut message = match detail {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(d) => match d.get("message").and_then(|m| m.as_str()) {
            Some(m) => m.to_string(),
            None => body.to_string(),
        },
        None => body.to_string(),
    };
    if message.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
}
