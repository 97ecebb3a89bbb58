//! Call-site timeout and retry for collaborator calls.
//!
//! Every network call gets its own `tokio::time::timeout` and is retried
//! with bounded exponential backoff. Only transient errors are retried;
//! rejections and decode failures surface immediately.

use backon::{ExponentialBuilder, Retryable};
use std::future::Future;

use medic_core::CallConfig;

use crate::collaborators::CollaboratorError;

/// Timeout plus backoff settings applied to one collaborator call.
#[derive(Debug, Clone, Default)]
pub struct CallPolicy {
    config: CallConfig,
}

impl CallPolicy {
    pub fn new(config: CallConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.config.min_delay)
            .with_max_delay(self.config.max_delay)
            .with_max_times(self.config.max_retries)
            .with_jitter()
    }

    /// Run `call` under the timeout, retrying transient failures.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        mut call: F,
    ) -> Result<T, CollaboratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let timeout = self.config.timeout;
        let attempt = || {
            let fut = call();
            async move {
                tokio::time::timeout(timeout, fut)
                    .await
                    .unwrap_or(Err(CollaboratorError::Timeout(timeout)))
            }
        };

        attempt
            .retry(self.backoff())
            .sleep(tokio::time::sleep)
            .when(CollaboratorError::is_transient)
            .notify(|err: &CollaboratorError, delay| {
                tracing::warn!(
                    operation,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Transient collaborator error, retrying"
                );
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn policy(max_retries: usize) -> CallPolicy {
        CallPolicy::new(CallConfig {
            timeout: Duration::from_millis(50),
            max_retries,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        })
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = policy(3)
            .run("poll", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CollaboratorError::Unavailable("503".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_rejection() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), _> = policy(3)
            .run("enqueue", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CollaboratorError::Rejected("bad command".into()))
            })
            .await;
        assert!(matches!(result, Err(CollaboratorError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), _> = policy(2)
            .run("poll", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CollaboratorError::RateLimited { retry_after: None })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), _> = policy(1)
            .run("poll", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(CollaboratorError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
