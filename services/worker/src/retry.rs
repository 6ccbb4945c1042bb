//! Bounded exponential-backoff retry shared by the queue and storage clients.

use crate::config::RetryConfig;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use backoff::{backoff::Backoff, ExponentialBackoff};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Error codes that AWS services return for throttled or temporarily
/// unavailable requests.
const TRANSIENT_ERROR_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestThrottled",
    "RequestThrottledException",
    "TooManyRequestsException",
    "SlowDown",
    "ServiceUnavailable",
    "InternalError",
    "RequestTimeout",
    "RequestTimeoutException",
];

/// Errors that can tell a passing hiccup from a hard failure.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

/// Retry policy for a single remote call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Growth factor between consecutive delays
    pub base_factor: f64,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Ceiling on the time spent retrying
    pub max_elapsed: Duration,
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.initial_interval,
            multiplier: self.base_factor,
            max_interval: self.max_interval,
            max_elapsed_time: Some(self.max_elapsed),
            ..Default::default()
        };
        backoff.reset();
        backoff
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_factor: config.base_factor,
            initial_interval: Duration::from_millis(config.initial_interval_ms),
            max_interval: Duration::from_secs(config.max_interval_secs),
            max_elapsed: Duration::from_secs(config.max_elapsed_secs),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy is exhausted.
///
/// Only errors reporting [`Retryable::is_transient`] are retried; the last
/// error is returned unchanged once attempts or elapsed time run out.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut backoff = policy.backoff();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let error = match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => e,
        };

        if attempt >= policy.max_attempts {
            warn!(operation, attempt, error = %error, "Retry attempts exhausted");
            return Err(error);
        }

        match backoff.next_backoff() {
            Some(delay) => {
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            None => {
                warn!(operation, attempt, error = %error, "Retry time budget exhausted");
                return Err(error);
            }
        }
    }
}

/// Classify an AWS SDK error and render it with its full context.
///
/// Dispatch failures, timeouts, unreadable responses, HTTP 5xx/429 and
/// throttling codes are transient.
pub(crate) fn classify_sdk_error<E>(err: &SdkError<E, HttpResponse>) -> (bool, String)
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let transient = match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            status >= 500
                || status == 429
                || service
                    .err()
                    .code()
                    .map(|code| TRANSIENT_ERROR_CODES.contains(&code))
                    .unwrap_or(false)
        }
        _ => false,
    };

    (transient, DisplayErrorContext(err).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use thiserror::Error;

    #[derive(Debug, Error)]
    enum TestError {
        #[error("connection reset")]
        Reset,
        #[error("access denied")]
        Denied,
    }

    impl Retryable for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, TestError::Reset)
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_factor: 2.0,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(4),
            max_elapsed: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result = with_retry(&fast_policy(3), "test", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TestError::Reset)
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<(), TestError> = with_retry(&fast_policy(3), "test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Reset)
        })
        .await;

        assert!(matches!(result, Err(TestError::Reset)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_propagate_immediately() {
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<(), TestError> = with_retry(&fast_policy(5), "test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Denied)
        })
        .await;

        assert!(matches!(result, Err(TestError::Denied)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_elapsed_ceiling_stops_retries() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy {
            max_attempts: 1000,
            base_factor: 1.0,
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(5),
            max_elapsed: Duration::from_millis(30),
        };

        let result: Result<(), TestError> = with_retry(&policy, "test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Reset)
        })
        .await;

        assert!(result.is_err());
        assert!(calls.load(Ordering::SeqCst) < 1000);
    }

    #[test]
    fn test_policy_from_config() {
        let policy = RetryPolicy::from(&RetryConfig::default());
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_factor, 2.0);
        assert_eq!(policy.max_elapsed, Duration::from_secs(300));
    }
}
