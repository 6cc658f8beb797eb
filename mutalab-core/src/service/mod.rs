//! Transformation service clients.
//!
//! The remote service owns analysis, mutation and scoring; this module only
//! describes the contract ([`TransformationService`]) and provides:
//! - `HttpTransformationService`: multipart/JSON over HTTP via `reqwest`
//! - `MockTransformationService`: scripted responses for tests

pub mod http;
pub mod mock;

use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::ServiceError;
use crate::types::{AnalysisOutcome, AnalysisRequest, FilePayload, MutateOutcome, StartOutcome};

pub use http::HttpTransformationService;
pub use mock::{MockTransformationService, ServiceCall};

/// The three remote operations the experiment pipeline depends on, plus
/// fetching a produced variant.
#[async_trait]
pub trait TransformationService: Send + Sync {
    /// Upload the original file and learn which perturbations apply to it.
    async fn start(&self, file: FilePayload) -> Result<StartOutcome, ServiceError>;

    /// Apply `perturbation` to a previously uploaded original.
    async fn mutate(
        &self,
        original_artifact_ref: &str,
        perturbation: &str,
    ) -> Result<MutateOutcome, ServiceError>;

    /// Score a variant from the sandbox reports and detection rates of both files.
    async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisOutcome, ServiceError>;

    /// Fetch the bytes behind a variant download location.
    async fn download(&self, location: &str) -> Result<Bytes, ServiceError>;
}

/// Execute an async operation with exponential backoff retry on transient errors.
///
/// Retries on connection failures, timeouts, rate limiting (respecting
/// `retry_after_secs`) and 5xx responses. Permanent errors return immediately.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T, ServiceError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    with_retry_if(config, ServiceError::is_transient, operation).await
}

/// Like [`with_retry`], but only errors accepted by `retryable` are retried.
///
/// Uploads and other non-idempotent requests pass
/// [`ServiceError::is_rejected_unprocessed`] so a request the service may
/// already have acted on is never sent twice.
pub async fn with_retry_if<F, Fut, T>(
    config: &RetryConfig,
    retryable: fn(&ServiceError) -> bool,
    operation: F,
) -> Result<T, ServiceError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !retryable(&e) || attempt >= config.max_retries {
                    return Err(e);
                }
                let Some(backoff_ms) = compute_backoff(config, attempt, &e) else {
                    tracing::warn!(
                        max_backoff_ms = config.max_backoff_ms,
                        error = %e,
                        "Service asked for a longer wait than allowed, giving up"
                    );
                    return Err(e);
                };
                tracing::warn!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    backoff_ms = backoff_ms,
                    error = %e,
                    "Retrying after transient service error"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                attempt += 1;
            }
        }
    }
}

/// Compute backoff delay, respecting the server's retry-after when rate limited.
///
/// Returns `None` when the server's retry-after exceeds `max_backoff_ms`.
fn compute_backoff(config: &RetryConfig, attempt: u32, err: &ServiceError) -> Option<u64> {
    let computed = compute_exponential_backoff(config, attempt);
    if let ServiceError::RateLimited { retry_after_secs } = err {
        let requested = retry_after_secs.saturating_mul(1000);
        if requested > config.max_backoff_ms {
            return None;
        }
        return Some(requested.max(computed));
    }
    Some(computed)
}

fn compute_exponential_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    base.min(config.max_backoff_ms as f64) as u64
}
