//! Exponential backoff with jitter for transient collaborator failures.
//!
//! Retryable:
//! - network and connection failures, timeouts
//! - HTTP 429 (rate limited) and 5xx (server error), read from the typed
//!   status or from an explicit `HTTP 503` / `status: 503` message
//!
//! Everything else, including cancellation and malformed embedding
//! responses, propagates on the first failure.

use std::future::Future;
use std::time::Duration;

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use thiserror::Error;
use tracing::warn;

use crate::config::RetryConfig;
use crate::embedding::EmbeddingResponseError;
use crate::error::is_cancellation;

/// Fraction of the base delay each wait may deviate by.
const JITTER: f64 = 0.1;

/// A status code only counts when it is labelled as one.
static STATUS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:http|status)(?:\s+code)?\s*[:=]?\s*(?:429|5\d\d)\b").unwrap()
});

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "connection closed",
    "econnreset",
    "network",
    "rate limit",
    "too many requests",
    "service unavailable",
    "bad gateway",
    "temporarily unavailable",
];

/// A non-success HTTP response, kept typed so retry classification can see the status.
#[derive(Error, Debug)]
#[error("HTTP {status}: {body}")]
pub struct HttpStatusError {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            factor: 2.0,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            factor: config.backoff_factor,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let millis = self.initial_delay.as_millis() as f64 * self.factor.powi(attempt as i32);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// `base_delay(attempt)` scaled uniformly within ±10%.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let scale = rand::thread_rng().gen_range((1.0 - JITTER)..=(1.0 + JITTER));
        Duration::from_millis((base.as_millis() as f64 * scale) as u64)
    }
}

/// Whether an error looks transient.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    if is_cancellation(err) {
        return false;
    }
    for cause in err.chain() {
        if cause.downcast_ref::<EmbeddingResponseError>().is_some() {
            return false;
        }
        if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
            if e.is_timeout() || e.is_connect() {
                return true;
            }
            if let Some(status) = e.status() {
                return status.as_u16() == 429 || status.is_server_error();
            }
            if e.is_request() || e.is_body() {
                return true;
            }
        }
        if let Some(e) = cause.downcast_ref::<HttpStatusError>() {
            return e.status == 429 || (500..600).contains(&e.status);
        }
        if let Some(e) = cause.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind::*;
            if matches!(
                e.kind(),
                TimedOut | ConnectionReset | ConnectionRefused | ConnectionAborted | BrokenPipe
            ) {
                return true;
            }
        }
    }
    let message = format!("{:#}", err).to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| message.contains(m)) || STATUS_RE.is_match(&message)
}

/// Called before each wait with `(attempt, error, next_delay)`; attempt is 1-based.
pub type RetryObserver<'a> = &'a (dyn Fn(u32, &anyhow::Error, Duration) + Send + Sync);

/// Run `op`, retrying transient failures per `policy`.
///
/// Makes at most `max_retries + 1` calls. The last error, or the first
/// non-retryable one, is returned unchanged.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
    observer: Option<RetryObserver<'_>>,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_retries || !is_retryable(&err) {
                    return Err(err);
                }
                let delay = policy.jittered_delay(attempt);
                attempt += 1;
                if let Some(observer) = observer {
                    observer(attempt, &err, delay);
                }
                warn!(
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %format!("{:#}", err),
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
        }
    }

    #[test]
    fn test_base_delay_grows_and_caps() {
        let p = RetryPolicy {
            max_delay: Duration::from_millis(300),
            ..policy()
        };
        assert_eq!(p.base_delay(0), Duration::from_millis(100));
        assert_eq!(p.base_delay(1), Duration::from_millis(200));
        assert_eq!(p.base_delay(2), Duration::from_millis(300));
        assert_eq!(p.base_delay(8), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_within_ten_percent() {
        let p = policy();
        for _ in 0..200 {
            let d = p.jittered_delay(1).as_millis();
            assert!((180..=220).contains(&d), "{}", d);
        }
    }

    #[test]
    fn test_classification() {
        assert!(is_retryable(&anyhow::Error::new(HttpStatusError {
            status: 429,
            body: String::new()
        })));
        assert!(is_retryable(&anyhow::Error::new(HttpStatusError {
            status: 503,
            body: String::new()
        })));
        assert!(!is_retryable(&anyhow::Error::new(HttpStatusError {
            status: 401,
            body: String::new()
        })));
        assert!(is_retryable(&anyhow::anyhow!("request timed out")));
        assert!(is_retryable(&anyhow::anyhow!("upstream returned HTTP 502")));
        assert!(is_retryable(&anyhow::anyhow!("status: 429 slow down")));
        assert!(!is_retryable(&anyhow::anyhow!("invalid api key")));
        let cancelled = anyhow::Error::new(crate::error::Cancelled).context("network request");
        assert!(!is_retryable(&cancelled));
    }

    #[test]
    fn test_bare_numbers_are_not_statuses() {
        assert!(!is_retryable(&anyhow::anyhow!(
            "Embedding has 512 dimensions, expected 1536"
        )));
        assert!(!is_retryable(&anyhow::anyhow!("line 500: unexpected token")));
        assert!(!is_retryable(&anyhow::Error::new(
            EmbeddingResponseError::DimensionMismatch {
                got: 503,
                expected: 1536
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dimension_mismatch_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = with_retry(
            &policy(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(EmbeddingResponseError::DimensionMismatch {
                        got: 512,
                        expected: 1536,
                    }
                    .into())
                }
            },
            None,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound_and_total_wait() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();
        let c = calls.clone();
        let result: anyhow::Result<()> = with_retry(
            &policy(),
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("service unavailable"))
                }
            },
            None,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 100 + 200 + 400, each at most +10%
        let waited = started.elapsed();
        assert!(waited <= Duration::from_millis(770), "{:?}", waited);
        assert!(waited >= Duration::from_millis(625), "{:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = with_retry(
            &policy(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("bad request")) }
            },
            None,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_and_observes() {
        let calls = AtomicU32::new(0);
        let seen: Mutex<Vec<u32>> = Mutex::new(Vec::new());
        let observer = |attempt: u32, _err: &anyhow::Error, _delay: Duration| {
            seen.lock().unwrap().push(attempt);
        };
        let value = with_retry(
            &policy(),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(anyhow::anyhow!("connection reset by peer"))
                    } else {
                        Ok(42)
                    }
                }
            },
            Some(&observer as RetryObserver),
        )
        .await
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }
}
