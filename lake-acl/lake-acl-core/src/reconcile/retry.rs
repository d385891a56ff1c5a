use crate::backend::BackendResult;
use crate::error::BackendError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Attempt budget, backoff and per-operation timeout for backend calls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total calls allowed, the first one included. Zero behaves like one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub backoff: Duration,
    pub max_backoff: Duration,
    /// Reported as a transient [`BackendError::Timeout`] when exceeded.
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            timeout: None,
        }
    }
}

impl RetryPolicy {
    pub fn once() -> Self {
        Self::default()
    }

    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn budget(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay after the `retry`-th consecutive failure (0-indexed).
    pub fn backoff_for_attempt(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// Run one call, bounded by the timeout when one is set.
    pub async fn run_once<T, Fut>(&self, fut: Fut) -> BackendResult<T>
    where
        Fut: Future<Output = BackendResult<T>>,
    {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .unwrap_or(Err(BackendError::Timeout(limit))),
            None => fut.await,
        }
    }

    /// Call `op` until it succeeds, fails permanently, or the budget is spent.
    pub async fn call<T, F, Fut>(&self, what: &str, mut op: F) -> BackendResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        let budget = self.budget();
        let mut attempt = 1;
        loop {
            match self.run_once(op()).await {
                Err(e) if e.is_transient() && attempt < budget => {
                    let delay = self.backoff_for_attempt(attempt - 1);
                    warn!(
                        "{}: attempt {}/{} failed ({}), retrying in {:?}",
                        what, attempt, budget, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn busy() -> BackendError {
        BackendError::Transient {
            status: 503,
            message: "ServerBusy".to_string(),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::attempts(5).with_backoff(Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_for_attempt(40), Duration::from_secs(30));
    }

    #[test]
    fn zero_attempts_still_calls_once() {
        assert_eq!(RetryPolicy::attempts(0).budget(), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_within_budget() {
        let policy = RetryPolicy::attempts(3).with_backoff(Duration::ZERO);
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = policy
            .call("op", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(busy())
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn budget_exhaustion_returns_last_failure() {
        let policy = RetryPolicy::attempts(2).with_backoff(Duration::ZERO);
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: BackendResult<()> = policy
            .call("op", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(busy())
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let policy = RetryPolicy::attempts(3).with_backoff(Duration::ZERO);
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: BackendResult<()> = policy
            .call("op", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BackendError::NotFound("x".to_string()))
            })
            .await;
        assert!(matches!(result, Err(BackendError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let policy = RetryPolicy::once().with_timeout(Some(Duration::from_millis(10)));
        let result: BackendResult<()> = policy
            .run_once(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, BackendError::Timeout(_)));
        assert!(err.is_transient());
    }
}
