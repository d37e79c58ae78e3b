use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{EventStore, SinkError};

/// Pause between two connection attempts when nothing else is configured.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Fixed-interval retry policy for reaching the store at startup.
///
/// `max_attempts = None` keeps trying until the cancellation token fires,
/// which is what a sink started alongside its database wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETRY_INTERVAL,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Connects to the store and ensures its schema, retrying both together.
///
/// `connect` receives the 1-based attempt number. Every failed attempt is
/// logged and followed by `policy.interval` of sleep, unless `cancel` fires
/// first.
///
/// # Errors
/// Returns [`SinkError::Cancelled`] when `cancel` fires before a store is
/// ready, and [`SinkError::RetriesExhausted`] when a configured attempt
/// budget runs out.
pub async fn connect_with_retry<S, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut connect: F,
) -> Result<S, SinkError>
where
    S: EventStore,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<S, SinkError>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(SinkError::Cancelled { attempts: attempt });
        }
        attempt = attempt.saturating_add(1);

        let result = match connect(attempt).await {
            Ok(mut store) => store.ensure_schema().await.map(|()| store),
            Err(err) => Err(err),
        };

        let err = match result {
            Ok(store) => {
                info!(attempt, "store connected and schema ensured");
                return Ok(store);
            }
            Err(err) => err,
        };

        if policy.max_attempts.is_some_and(|max| attempt >= max) {
            return Err(SinkError::RetriesExhausted {
                attempts: attempt,
                last_error: err.to_string(),
            });
        }

        warn!(
            attempt,
            error = %err,
            retry_in_ms = u64::try_from(policy.interval.as_millis()).unwrap_or(u64::MAX),
            "store not available yet, retrying"
        );

        tokio::select! {
            () = cancel.cancelled() => {
                return Err(SinkError::Cancelled { attempts: attempt });
            }
            () = tokio::time::sleep(policy.interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;
    use crate::{StoredTraceEvent, TraceEvent};

    #[derive(Default)]
    struct CountingStore {
        schema_calls: u32,
    }

    #[async_trait]
    impl EventStore for CountingStore {
        async fn ensure_schema(&mut self) -> Result<(), SinkError> {
            self.schema_calls += 1;
            Ok(())
        }

        async fn append(&mut self, _event: &TraceEvent) -> Result<i64, SinkError> {
            Ok(1)
        }

        async fn recent(&mut self, _limit: u32) -> Result<Vec<StoredTraceEvent>, SinkError> {
            Ok(Vec::new())
        }

        async fn by_routing_key(
            &mut self,
            _routing_key: &str,
            _limit: u32,
        ) -> Result<Vec<StoredTraceEvent>, SinkError> {
            Ok(Vec::new())
        }

        async fn count(&mut self) -> Result<i64, SinkError> {
            Ok(0)
        }
    }

    type Attempt = std::future::Ready<Result<CountingStore, SinkError>>;

    fn flaky(failures: u32, calls: Arc<AtomicU32>) -> impl FnMut(u32) -> Attempt {
        move |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if attempt <= failures {
                Err(SinkError::Connectivity("connection refused".to_string()))
            } else {
                Ok(CountingStore::default())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_fourth_attempt_after_three_refusals() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let store = connect_with_retry(
            &RetryPolicy::default(),
            &CancellationToken::new(),
            flaky(3, Arc::clone(&calls)),
        )
        .await;

        let store = store.unwrap_or_else(|_| unreachable!());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(store.schema_calls, 1);
        assert!(started.elapsed() >= DEFAULT_RETRY_INTERVAL * 3);
        assert!(started.elapsed() < DEFAULT_RETRY_INTERVAL * 4);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_budget_is_honoured() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(Duration::from_millis(10)).with_max_attempts(Some(2));

        let result = connect_with_retry(
            &policy,
            &CancellationToken::new(),
            flaky(5, Arc::clone(&calls)),
        )
        .await;

        assert!(matches!(
            result,
            Err(SinkError::RetriesExhausted { attempts: 2, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trigger.cancel();
        });

        let result = connect_with_retry(
            &RetryPolicy::default(),
            &cancel,
            flaky(u32::MAX, Arc::clone(&calls)),
        )
        .await;

        assert!(matches!(result, Err(SinkError::Cancelled { attempts: 3 })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn already_cancelled_token_skips_connecting() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result =
            connect_with_retry(&RetryPolicy::default(), &cancel, flaky(0, Arc::clone(&calls)))
                .await;

        assert!(matches!(result, Err(SinkError::Cancelled { attempts: 0 })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
