//! Per-operation options shared by every store: an optional deadline and an
//! optional observer that sees each operation's outcome.
//!
//! Nothing here is global. A caller that wants metrics or audit logging
//! passes its own [`StoreObserver`]; the default does nothing.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Result, StoreError};

/// Receives one callback per completed store operation.
pub trait StoreObserver: Send + Sync {
    fn on_operation(&self, operation: &'static str, elapsed: Duration, error: Option<&StoreError>);
}

/// Ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl StoreObserver for NoopObserver {
    fn on_operation(&self, _: &'static str, _: Duration, _: Option<&StoreError>) {}
}

/// Emits one `tracing` event per operation.
///
/// Expected outcomes (`NotFound`, `Duplicate`) are logged at debug level,
/// everything else that failed at warn.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl StoreObserver for TracingObserver {
    fn on_operation(&self, operation: &'static str, elapsed: Duration, error: Option<&StoreError>) {
        let elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        match error {
            None => tracing::debug!(operation, elapsed_us, "store operation completed"),
            Some(err) if err.is_not_found() || err.is_duplicate() => {
                tracing::debug!(operation, elapsed_us, error = %err, "store operation rejected")
            }
            Some(err) => tracing::warn!(operation, elapsed_us, error = %err, "store operation failed"),
        }
    }
}

/// Options applied to every operation of a store.
#[derive(Clone)]
pub struct StoreOptions {
    /// Deadline per operation. On expiry the operation's future is dropped,
    /// which rolls back any transaction it had open.
    pub op_timeout: Option<Duration>,
    pub observer: Arc<dyn StoreObserver>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            op_timeout: None,
            observer: Arc::new(NoopObserver),
        }
    }
}

impl std::fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptions")
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl StoreOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = Some(timeout);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn StoreObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Runs one store operation under the deadline and reports it.
    pub(crate) async fn run<T, F>(&self, operation: &'static str, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let outcome = match self.op_timeout {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .unwrap_or(Err(StoreError::Timeout { operation })),
            None => work.await,
        };

        self.observer
            .on_operation(operation, started.elapsed(), outcome.as_ref().err());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(&'static str, bool)>>);

    impl StoreObserver for Recorder {
        fn on_operation(&self, operation: &'static str, _: Duration, error: Option<&StoreError>) {
            self.0.lock().unwrap().push((operation, error.is_some()));
        }
    }

    #[tokio::test]
    async fn observer_sees_every_outcome() {
        let recorder = Arc::new(Recorder::default());
        let options = StoreOptions::default().with_observer(recorder.clone());

        let ok: Result<u32> = options.run("op.ok", async { Ok(1) }).await;
        let err: Result<u32> = options
            .run("op.err", async { Err(StoreError::InvalidToken) })
            .await;

        assert_eq!(ok.unwrap(), 1);
        assert!(matches!(err, Err(StoreError::InvalidToken)));
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![("op.ok", false), ("op.err", true)]
        );
    }

    #[tokio::test]
    async fn slow_operations_time_out() {
        let options = StoreOptions::default().with_timeout(Duration::from_millis(10));
        let result: Result<()> = options
            .run("op.slow", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(StoreError::Timeout { operation: "op.slow" })));
    }

    #[test]
    fn tracing_observer_handles_unbounded_durations() {
        TracingObserver.on_operation("op.long", Duration::MAX, None);
        TracingObserver.on_operation("op.long", Duration::MAX, Some(&StoreError::InvalidToken));
    }
}
