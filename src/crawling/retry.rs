//! Bounded retries with exponential backoff.
//!
//! Attempt `k` (zero based) that fails is followed by a sleep of
//! `base * 2^k`, except after the last attempt. Cancellation and deadline
//! errors are never retried.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::scope::RunScope;

/// Errors that can tell whether they came from cancellation.
pub trait Retryable {
    /// `true` for cancellation or an exhausted enclosing deadline.
    fn is_cancellation(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        use crate::infrastructure::config::defaults;
        Self {
            max_attempts: defaults::RETRY_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(defaults::RETRY_BASE_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Backoff after the failed attempt with zero-based index `attempt`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2_u32.saturating_pow(attempt))
    }
}

/// Outcome of a failed [`RetryExecutor::execute`].
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the last attempt's error.
    Exhausted { attempts: u32, source: E },
    /// An attempt failed because the scope ended, or the scope ended during backoff.
    Interrupted { attempts: u32, source: E },
    /// The scope had already ended before the next attempt could start.
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::Interrupted { attempts, .. }
            | Self::Cancelled { attempts } => *attempts,
        }
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Exhausted { source, .. } | Self::Interrupted { source, .. } => Some(source),
            Self::Cancelled { .. } => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { attempts, source } => write!(f, "failed after {attempts} attempts: {source}"),
            Self::Interrupted { attempts, source } => {
                write!(f, "interrupted after {attempts} attempt(s): {source}")
            }
            Self::Cancelled { attempts } => write!(f, "cancelled after {attempts} attempt(s)"),
        }
    }
}

impl<E> std::error::Error for RetryError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.last_error().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Stateless and reentrant; one instance is shared by every enrichment worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `operation` until it succeeds, up to `max_attempts` times.
    ///
    /// The closure receives the one-based attempt number.
    pub async fn execute<T, E, F, Fut>(&self, scope: &RunScope, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = 0;

        loop {
            if scope.is_done() {
                return Err(RetryError::Cancelled { attempts });
            }
            attempts += 1;

            let error = match operation(attempts).await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(attempts, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if error.is_cancellation() || scope.is_done() {
                debug!(attempts, "not retrying after cancellation: {}", error);
                return Err(RetryError::Interrupted { attempts, source: error });
            }

            if attempts >= max_attempts {
                warn!(attempts, "giving up: {}", error);
                return Err(RetryError::Exhausted { attempts, source: error });
            }

            let delay = self.policy.delay_for(attempts - 1);
            warn!(
                attempt = attempts,
                max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "attempt failed, backing off: {}",
                error
            );
            if scope.sleep(delay).await.is_err() {
                return Err(RetryError::Interrupted { attempts, source: error });
            }
        }
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum FakeError {
        Transient(u32),
        Cancelled,
    }

    impl fmt::Display for FakeError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Transient(n) => write!(f, "transient failure #{n}"),
                Self::Cancelled => write!(f, "cancelled"),
            }
        }
    }

    impl Retryable for FakeError {
        fn is_cancellation(&self) -> bool {
            matches!(self, Self::Cancelled)
        }
    }

    #[test]
    fn delays_double() {
        let policy = RetryPolicy::new(4, Duration::from_secs(1));
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    }

    #[test]
    fn default_policy_is_three_attempts_one_second() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_reports_last_cause() {
        let executor = RetryExecutor::new(RetryPolicy::new(3, Duration::from_secs(1)));
        let scope = RunScope::new(Duration::from_secs(3600));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .execute(&scope, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(FakeError::Transient(attempt)) }
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.last_error(), Some(&FakeError::Transient(3)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.to_string(), "failed after 3 attempts: transient failure #3");
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_k_failures_with_doubling_gaps() {
        let base = Duration::from_secs(1);
        let executor = RetryExecutor::new(RetryPolicy::new(4, base));
        let scope = RunScope::new(Duration::from_secs(3600));
        let calls = std::sync::Mutex::new(Vec::new());

        let result = executor
            .execute(&scope, |attempt| {
                calls.lock().unwrap().push(tokio::time::Instant::now());
                async move {
                    if attempt <= 3 {
                        Err(FakeError::Transient(attempt))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 4);
        let calls = calls.into_inner().unwrap();
        assert_eq!(calls.len(), 4);
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps, vec![base, base * 2, base * 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_error_is_not_retried() {
        let executor = RetryExecutor::default();
        let scope = RunScope::new(Duration::from_secs(3600));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .execute(&scope, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FakeError::Cancelled) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Interrupted { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_scope_stops_during_backoff() {
        let executor = RetryExecutor::new(RetryPolicy::new(5, Duration::from_secs(10)));
        let scope = RunScope::new(Duration::from_secs(3600));
        let canceller = scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result: Result<(), _> = executor
            .execute(&scope, |attempt| async move { Err(FakeError::Transient(attempt)) })
            .await;

        assert!(matches!(result, Err(RetryError::Interrupted { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn already_cancelled_scope_makes_no_attempt() {
        let executor = RetryExecutor::default();
        let scope = RunScope::new(Duration::from_secs(60));
        scope.cancel();

        let result: Result<(), RetryError<FakeError>> =
            executor.execute(&scope, |_| async { Ok(()) }).await;
        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 0 })));
    }
}
