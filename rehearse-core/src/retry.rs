//! Retry client — bounded exponential backoff around outbound HTTP calls
//!
//! Classification:
//! - 2xx → success, returned immediately
//! - 4xx other than 429 → returned immediately; the caller branches on status
//! - 429, 5xx, transport failure → retried
//!
//! Every call to the completion provider and the transcription provider goes
//! through [`RetryClient`].

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio_retry::RetryIf;

/// Backoff settings. Worst-case added latency is bounded by
/// `max_delay_ms * max_retries`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// The waits between attempts, one per retry.
    pub fn schedule(&self) -> std::iter::Take<Backoff> {
        Backoff::new(self.initial_delay_ms, self.max_delay_ms, self.backoff_multiplier)
            .take(self.max_retries)
    }
}

/// Delay iterator: yields `min(delay, max)` and multiplies `delay` after each step.
#[derive(Debug, Clone)]
pub struct Backoff {
    next_ms: f64,
    max_ms: u64,
    multiplier: f64,
}

impl Backoff {
    pub fn new(initial_ms: u64, max_ms: u64, multiplier: f64) -> Self {
        Self {
            next_ms: initial_ms as f64,
            max_ms,
            multiplier: multiplier.max(1.0),
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next_ms.min(self.max_ms as f64);
        self.next_ms = (self.next_ms * self.multiplier).min(self.max_ms as f64);
        Some(Duration::from_millis(current as u64))
    }
}

#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Server error: HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Request failed after {retries} retries: {last_error}")]
    Exhausted { retries: usize, last_error: String },
}

/// HTTP client wrapper that retries retryable failures according to a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryClient {
    client: Client,
    policy: RetryPolicy,
}

impl RetryClient {
    pub fn new(policy: RetryPolicy) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { client, policy })
    }

    pub fn with_client(client: Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send the request built by `build`, retrying per policy.
    ///
    /// `build` is invoked once per attempt so bodies that cannot be cloned
    /// (multipart uploads) are rebuilt each time.
    pub async fn execute<F>(&self, build: F) -> Result<Response, RetryError>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        self.execute_with(build, |_, _| {}).await
    }

    /// Like [`execute`](Self::execute), invoking `on_retry(attempt, error)`
    /// before each wait.
    pub async fn execute_with<F, R>(&self, build: F, mut on_retry: R) -> Result<Response, RetryError>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
        R: FnMut(usize, &RetryError) + Send,
    {
        let max_retries = self.policy.max_retries;
        let mut failures = 0usize;

        // Called on every failure; a wait follows only while retries remain.
        let condition = |err: &RetryError| {
            failures += 1;
            if failures <= max_retries {
                tracing::warn!(attempt = failures, error = %err, "Request failed, retrying");
                on_retry(failures, err);
            }
            true
        };

        let result = RetryIf::spawn(self.policy.schedule(), || self.attempt(&build), condition).await;

        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                tracing::error!(retries = max_retries, error = %e, "All retry attempts failed");
                Err(RetryError::Exhausted {
                    retries: max_retries,
                    last_error: e.to_string(),
                })
            }
        }
    }

    async fn attempt<F>(&self, build: &F) -> Result<Response, RetryError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let response = build(&self.client).send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
            tracing::warn!(status = status.as_u16(), "Client error, not retrying");
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(RetryError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
