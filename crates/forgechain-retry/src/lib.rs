//! Exponential backoff with jitter plus a circuit breaker, shared by every
//! remote call the engine makes (§4.2).
//!
//! The retry loop and circuit breaker shape follow the original `retry.py`
//! (`with_retry` / `CircuitBreaker`) almost field-for-field; the backoff and
//! transient-status classification follow the teacher's
//! `llm::http_client::HttpClient::execute_with_retry`. Wall-clock checks use
//! `Instant` instead of `time.time()` floats since nothing here needs to
//! survive a process restart.

use rand::Rng;
use reqwest::StatusCode;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::warn;

/// Retry tuning, defaulting to the values in the original settings file
/// (`config.py::RetryPolicy`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
    pub circuit_breaker_failures: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(800),
            max_delay: Duration::from_secs(20),
            jitter: Duration::from_millis(250),
            circuit_breaker_failures: 6,
            circuit_breaker_cooldown: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt (1-based), exponential with a cap plus
    /// uniform jitter in `[0, jitter)`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let base = exp.min(self.max_delay);
        let jitter_ms = if self.jitter.is_zero() {
            0
        } else {
            rand::rng().random_range(0..=self.jitter.as_millis() as u64)
        };
        base + Duration::from_millis(jitter_ms)
    }
}

/// Trips after `failures` consecutive failures, refusing calls until
/// `cooldown` has elapsed since the last failure.
#[derive(Debug)]
pub struct CircuitBreaker {
    failures: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(failures: u32, cooldown: Duration) -> Self {
        Self { failures, cooldown, consecutive_failures: 0, open_until: None }
    }

    #[must_use]
    pub fn from_policy(policy: &RetryPolicy) -> Self {
        Self::new(policy.circuit_breaker_failures, policy.circuit_breaker_cooldown)
    }

    #[must_use]
    pub fn allow(&self) -> bool {
        match self.open_until {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.open_until = None;
    }

    pub fn on_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.failures {
            self.open_until = Some(Instant::now() + self.cooldown);
        }
    }
}

/// True for the HTTP status codes treated as transient and therefore
/// eligible for retry (429, 500, 502, 503, 504), matching both the original
/// `retry.py` substring check and the teacher's `map_client_error` split.
#[must_use]
pub fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Run `f` under the given policy, retrying transient failures (as judged by
/// `is_transient`) with exponential backoff and jitter, honoring an optional
/// shared circuit breaker. On a non-transient error, returns immediately.
/// On exhaustion, returns the final error.
pub async fn with_retry<T, E, Fut, F>(
    mut f: F,
    policy: &RetryPolicy,
    mut breaker: Option<&mut CircuitBreaker>,
    is_transient: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_err: Option<E> = None;

    for attempt in 1..=policy.max_attempts {
        if let Some(b) = breaker.as_deref() {
            if !b.allow() {
                tokio::time::sleep(policy.circuit_breaker_cooldown.min(Duration::from_secs(3)))
                    .await;
                continue;
            }
        }

        match f().await {
            Ok(out) => {
                if let Some(b) = breaker.as_deref_mut() {
                    b.on_success();
                }
                return Ok(out);
            }
            Err(err) => {
                if !is_transient(&err) {
                    return Err(err);
                }
                if let Some(b) = breaker.as_deref_mut() {
                    b.on_failure();
                }
                if attempt == policy.max_attempts {
                    last_err = Some(err);
                    break;
                }
                warn!(attempt, max_attempts = policy.max_attempts, "transient failure, retrying");
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                last_err = Some(err);
            }
        }
    }

    Err(last_err.expect("loop always sets last_err before exiting without returning Ok"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy { jitter: Duration::ZERO, ..RetryPolicy::default() };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(1600));
        assert_eq!(policy.delay_for_attempt(10), policy.max_delay);
    }

    #[test]
    fn circuit_breaker_opens_after_threshold() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        assert!(breaker.allow());
        breaker.on_failure();
        assert!(breaker.allow());
        breaker.on_failure();
        assert!(!breaker.allow());
    }

    #[test]
    fn circuit_breaker_resets_on_success() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.on_failure();
        breaker.on_success();
        breaker.on_failure();
        assert!(breaker.allow());
    }

    #[test]
    fn transient_status_matches_spec_set() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: Duration::ZERO,
            ..RetryPolicy::default()
        };
        let result: Result<&str, &str> = with_retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err("transient") } else { Ok("done") } }
            },
            &policy,
            None,
            |_e: &&str| true,
        )
        .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_error_returns_immediately() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let result: Result<&str, &str> = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("permanent") }
            },
            &policy,
            None,
            |_e: &&str| false,
        )
        .await;
        assert_eq!(result, Err("permanent"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
