// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry loop with per-class exponential backoff.
//!
//! Each failure is classified; the class picks the [`BackoffPolicy`](crate::BackoffPolicy) from a
//! [`RetryPolicies`] set. Auth failures are returned immediately. A
//! rate-limit `Retry-After` stretches the backoff up to the policy cap. Backoff
//! sleeps are timers raced against a [`CancelToken`], so cancelling a caller
//! never leaves it parked in a delay.
//!
//! # Example
//!
//! ```
//! use tts_cache::{retry, CancelToken, RetryPolicies, BackoffPolicy};
//!
//! # async fn demo() {
//! let policies = RetryPolicies::uniform(BackoffPolicy::startup());
//! let value: Result<u32, _> = retry("connect", &policies, &CancelToken::never(), || async {
//!     Ok::<_, tts_cache::StorageError>(7)
//! })
//! .await;
//! assert_eq!(value.unwrap(), 7);
//! # }
//! ```

use std::future::Future;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use super::backoff::RetryPolicies;
use super::cancel::CancelToken;
use crate::error::{Classify, ErrorClassification};

#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// The class's retry budget ran out; `last` is the final failure.
    #[error("gave up after {attempts} attempts ({class}): {last}")]
    Exhausted {
        class: ErrorClassification,
        attempts: u32,
        last: E,
    },

    /// A non-retryable failure.
    #[error("non-retryable failure: {0}")]
    Fatal(E),

    #[error("cancelled while retrying")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// The underlying failure, if there is one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Exhausted { last, .. } => Some(last),
            Self::Fatal(e) => Some(e),
            Self::Cancelled => None,
        }
    }
}

/// Run `operation` until it succeeds, its failure class runs out of retries,
/// it fails with a non-retryable class, or `cancel` fires.
///
/// The attempt counter is shared across classes: a 429 followed by a 503 is
/// retry 1 under the server-error policy.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    policies: &RetryPolicies,
    cancel: &CancelToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + std::fmt::Display,
{
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = operation() => result,
        };

        let err = match result {
            Ok(val) => {
                if attempt > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempt);
                }
                return Ok(val);
            }
            Err(err) => err,
        };

        let class = err.classify();
        let Some(policy) = policies.for_class(class) else {
            warn!(operation = operation_name, %class, "Operation '{}' failed, not retrying: {}", operation_name, err);
            return Err(RetryError::Fatal(err));
        };

        if attempt >= policy.max_retries {
            warn!(
                operation = operation_name,
                %class,
                "Operation '{}' failed after {} attempts: {}",
                operation_name,
                attempt + 1,
                err
            );
            return Err(RetryError::Exhausted {
                class,
                attempts: attempt + 1,
                last: err,
            });
        }

        let mut delay = policy.jittered_delay(attempt);
        // Honor Retry-After on 429s, up to the policy cap
        if class == ErrorClassification::RateLimited {
            if let Some(hint) = err.retry_after() {
                delay = delay.max(hint.min(policy.max_delay));
            }
        }
        warn!(
            operation = operation_name,
            %class,
            "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
            operation_name,
            attempt + 1,
            policy.max_retries + 1,
            err,
            delay
        );
        crate::metrics::record_retry(operation_name, class.as_str());

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = sleep(delay) => {}
        }
        attempt += 1;
    }
}
