//! Run scope: a cancellation token paired with an absolute deadline.
//!
//! Every suspension point in the pipeline (extractor calls, inter-round
//! waits, backoff sleeps, channel sends) goes through [`RunScope::run`] so
//! nothing blocks past the deadline or survives cancellation.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a scoped wait ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Interrupted {
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Clone)]
pub struct RunScope {
    token: CancellationToken,
    deadline: Instant,
}

/// Roughly thirty years; used when a timeout would overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 86_400);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

impl RunScope {
    /// A fresh root scope ending `timeout` from now.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self::with_token(CancellationToken::new(), timeout)
    }

    /// A scope tied to an existing token, e.g. the process shutdown token.
    #[must_use]
    pub fn with_token(token: CancellationToken, timeout: Duration) -> Self {
        Self {
            token,
            deadline: deadline_after(timeout),
        }
    }

    /// A nested scope: cancelled with its parent, and never outliving the
    /// parent's deadline.
    #[must_use]
    pub fn child(&self, timeout: Duration) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: deadline_after(timeout).min(self.deadline),
        }
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.check().is_err()
    }

    /// Cooperative check point.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.token.is_cancelled() {
            Err(Interrupted::Cancelled)
        } else if Instant::now() >= self.deadline {
            Err(Interrupted::DeadlineExceeded)
        } else {
            Ok(())
        }
    }

    /// Drive `fut` until it completes, the token fires, or the deadline passes.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, Interrupted>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(Interrupted::Cancelled),
            result = tokio::time::timeout_at(self.deadline, fut) => {
                result.map_err(|_| Interrupted::DeadlineExceeded)
            }
        }
    }

    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        self.run(tokio::time::sleep(duration)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn run_returns_deadline_exceeded_for_slow_future() {
        let scope = RunScope::new(Duration::from_secs(1));
        let result = scope.run(tokio::time::sleep(Duration::from_secs(5))).await;
        assert_eq!(result, Err(Interrupted::DeadlineExceeded));
        assert!(scope.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_propagates_to_children() {
        let parent = RunScope::new(Duration::from_secs(60));
        let child = parent.child(Duration::from_secs(600));
        assert!(child.deadline() <= parent.deadline());

        parent.cancel();
        assert_eq!(child.check(), Err(Interrupted::Cancelled));
        assert_eq!(child.sleep(Duration::from_millis(10)).await, Err(Interrupted::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn child_deadline_does_not_end_parent() {
        let parent = RunScope::new(Duration::from_secs(60));
        let child = parent.child(Duration::from_secs(1));
        assert_eq!(child.sleep(Duration::from_secs(2)).await, Err(Interrupted::DeadlineExceeded));
        assert!(parent.check().is_ok());
    }

    #[test]
    fn huge_timeout_does_not_overflow() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
        rt.block_on(async {
            let scope = RunScope::new(Duration::MAX);
            assert!(scope.check().is_ok());
        });
    }
}
