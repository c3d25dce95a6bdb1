//! Retry wrapper for S3 requests
//!
//! `send_with_retry()` replaces `request.send()` for every S3 call:
//! - exponential backoff with jitter on 429 (Too Many Requests), 500 and 503
//!   (S3's `SlowDown` / `InternalError`) and the other 5xx gateway codes
//! - `Retry-After` header support (seconds form only)
//! - network-level send failures are retried too, since S3 calls are idempotent
//! - other statuses pass straight through to the caller

use reqwest::{Client, Request, Response};
use std::time::Duration;

/// Backoff settings
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds
    pub max_delay_ms: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 20_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), with 10-30% jitter
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay_ms as f64);
        let jitter = capped * (0.1 + rand::random::<f64>() * 0.2);
        Duration::from_millis((capped + jitter) as u64)
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Parse a `Retry-After` header given in seconds
fn parse_retry_after(response: &Response) -> Option<Duration> {
    let value = response.headers().get("retry-after")?.to_str().ok()?;
    value
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| Duration::from_secs(secs.min(120)))
}

/// Send a request, retrying transient failures.
///
/// The request is rebuilt from its method, URL, headers and in-memory body
/// for every attempt, so streaming bodies are not supported.
pub async fn send_with_retry(
    client: &Client,
    request: Request,
    policy: &RetryPolicy,
) -> Result<Response, reqwest::Error> {
    let method = request.method().clone();
    let url = request.url().clone();
    let headers = request.headers().clone();
    let body_bytes = request.body().and_then(|b| b.as_bytes()).map(|b| b.to_vec());

    let rebuild = || {
        let mut retry = client.request(method.clone(), url.clone()).headers(headers.clone());
        if let Some(ref body) = body_bytes {
            retry = retry.body(body.clone());
        }
        retry
    };

    let mut attempt = 0;
    let mut outcome = client.execute(request).await;

    loop {
        let delay = match &outcome {
            Ok(response) if is_retryable_status(response.status().as_u16()) => {
                Some(parse_retry_after(response).unwrap_or_else(|| policy.delay(attempt)))
            }
            Err(e) if e.is_connect() || e.is_timeout() => Some(policy.delay(attempt)),
            _ => None,
        };

        let Some(delay) = delay.filter(|_| attempt < policy.max_retries) else {
            return outcome;
        };

        tracing::debug!(
            "[S3] {} {} failed ({}). Retry {}/{} after {:?}",
            method,
            url.path(),
            match &outcome {
                Ok(response) => response.status().to_string(),
                Err(e) => e.to_string(),
            },
            attempt + 1,
            policy.max_retries,
            delay
        );

        tokio::time::sleep(delay).await;
        attempt += 1;
        outcome = rebuild().send().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_status() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(200));
        assert!(!is_retryable_status(403));
        assert!(!is_retryable_status(404));
    }

    #[test]
    fn test_delay_bounded() {
        let policy = RetryPolicy::default();
        for attempt in 0..12 {
            let delay = policy.delay(attempt);
            // Cap plus at most 30% jitter
            assert!(delay.as_millis() <= (policy.max_delay_ms as u128 * 13 / 10) + 1);
        }
    }

    #[test]
    fn test_delay_grows() {
        let policy = RetryPolicy::with_max_retries(5);
        assert_eq!(policy.max_retries, 5);
        // Jitter is at most 30%, so attempt 2 (4x base) always beats attempt 0
        assert!(policy.delay(2) > policy.delay(0));
    }
}
