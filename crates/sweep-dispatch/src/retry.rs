//! Bounded retry for network calls.
//!
//! Every attempt runs under its own timeout ([`RetryPolicy::request_timeout`]),
//! which is separate from the overall attempt budget. Transient failures and
//! timeouts back off exponentially with jitter; fatal failures are reported
//! at once. Either way the caller sees `Error::BackendIo`.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use sweep_core::config::RetryPolicy;
use sweep_core::error::{Error, Result};

use crate::metrics::record_transient_retry;

/// Failure classification reported by a transport.
#[derive(Debug)]
pub enum TransportError {
    /// Worth retrying: connection failures, timeouts, throttling, 5xx.
    Transient(String),
    /// Not worth retrying: auth failures, 4xx other than 429, bad payloads.
    Fatal(String),
}

impl TransportError {
    /// Classifies an HTTP status code.
    #[must_use]
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = format!("HTTP {status}: {body}");
        if is_retryable_status(status) {
            Self::Transient(message)
        } else {
            Self::Fatal(message)
        }
    }

    /// Returns true for transient failures.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient(message) => write!(f, "transient: {message}"),
            Self::Fatal(message) => write!(f, "fatal: {message}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Returns true for HTTP statuses that should be retried.
#[must_use]
pub const fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

/// Runs `call` until it succeeds, fails fatally, or the budget runs out.
///
/// # Errors
///
/// Returns `BackendIo` carrying the last failure.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, TransportError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let failure = match tokio::time::timeout(policy.request_timeout(), call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(_) => TransportError::Transient(format!(
                "timed out after {}ms",
                policy.request_timeout_ms
            )),
        };

        if !failure.is_transient() {
            return Err(Error::backend_io_with_source(
                format!("{operation} failed"),
                failure,
            ));
        }
        if attempt >= max_attempts {
            return Err(Error::backend_io_with_source(
                format!("{operation} failed after {attempt} attempts"),
                failure,
            ));
        }

        let delay = policy.backoff(attempt) + Duration::from_millis(rand_jitter());
        tracing::warn!(
            operation,
            attempt,
            max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %failure,
            "transient backend failure, retrying"
        );
        record_transient_retry(operation);
        tokio::time::sleep(delay).await;
    }
}

/// Generates random jitter for backoff (0-50ms).
pub(crate) fn rand_jitter() -> u64 {
    use std::time::SystemTime;
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    seed % 50
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff_ms: 1,
            max_backoff_ms: 5,
            request_timeout_ms: 50,
        }
    }

    #[test]
    fn status_classification() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(403));
        assert!(TransportError::from_status(500, "oops").is_transient());
        assert!(!TransportError::from_status(404, "missing").is_transient());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let value = with_retry(&policy(5), "read", || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TransportError::Transient("connection reset".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn budget_exhaustion_is_backend_io() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let err = with_retry(&policy(3), "read", || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TransportError::Transient("HTTP 503".into()))
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::BackendIo { .. }));
        assert!(err.to_string().contains("after 3 attempts"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_failures_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let err = with_retry(&policy(5), "write", || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TransportError::Fatal("HTTP 403".into()))
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::BackendIo { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out_and_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let value = with_retry(&policy(3), "read", || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok::<_, TransportError>("done")
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn jitter_is_bounded() {
        assert!(rand_jitter() < 50);
    }
}
