//! Retry logic with exponential backoff for remote cache RPCs
//!
//! [`Retrier::execute`] runs an attempt under a local deadline and retries it
//! while the failure is transient and the attempt budget lasts. Delays come
//! from a pluggable [`Backoff`] strategy. An attempt that times out after
//! making observable progress (bytes moved, reported through [`Progress`]) is
//! retried immediately and does not count against the budget.

use crate::config::RetryConfig;
use crate::error::{RemoteError, Result};
use backoff::ExponentialBackoffBuilder;
use backoff::backoff::Backoff;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Produces a fresh backoff schedule for each logical operation
pub type BackoffFactory = Arc<dyn Fn() -> Box<dyn Backoff + Send> + Send + Sync>;

/// Byte counter an attempt advances as it makes progress
#[derive(Debug, Clone, Default)]
pub struct Progress(Arc<AtomicU64>);

impl Progress {
    /// Record `bytes` more bytes transferred
    pub fn advance(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::SeqCst);
    }

    /// Total bytes recorded so far across all attempts
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Executes fallible async operations with retries
#[derive(Clone)]
pub struct Retrier {
    max_attempts: usize,
    attempt_timeout: Option<Duration>,
    backoff: BackoffFactory,
}

impl std::fmt::Debug for Retrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retrier")
            .field("max_attempts", &self.max_attempts)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}

impl Retrier {
    /// Create a retrier using exponential backoff with jitter from `config`
    pub fn new(config: &RetryConfig, attempt_timeout: Option<Duration>) -> Self {
        let max_attempts = config.max_attempts.max(1);
        let config = config.clone();
        Self {
            max_attempts,
            attempt_timeout,
            backoff: Arc::new(move || -> Box<dyn Backoff + Send> {
                Box::new(create_backoff(&config))
            }),
        }
    }

    /// Replace the backoff strategy (used by tests for deterministic schedules)
    #[must_use]
    pub fn with_backoff(mut self, factory: BackoffFactory) -> Self {
        self.backoff = factory;
        self
    }

    /// Replace the attempt budget
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Attempt budget, including the first attempt
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Run `f` until it succeeds, fails permanently, or the budget is spent
    ///
    /// `f` receives a [`Progress`] handle shared by all attempts of this call.
    ///
    /// # Errors
    ///
    /// Non-retriable errors are returned unchanged; a spent budget yields
    /// `RetryExhausted` wrapping the last error.
    pub async fn execute<F, Fut, T>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut(Progress) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = (self.backoff)();
        let progress = Progress::default();
        let mut failures = 0usize;

        loop {
            let before = progress.get();
            let attempt = f(progress.clone());
            let outcome = match self.attempt_timeout {
                Some(deadline) => tokio::time::timeout(deadline, attempt)
                    .await
                    .unwrap_or_else(|_| Err(RemoteError::timeout(operation, deadline.as_secs()))),
                None => attempt.await,
            };

            let err = match outcome {
                Ok(value) => {
                    if failures > 0 {
                        debug!(
                            operation,
                            attempts = failures + 1,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !is_retryable(&err) {
                debug!(operation, error = %err, "Error is not retryable, failing immediately");
                return Err(err);
            }

            if is_timeout(&err) && progress.get() > before {
                debug!(
                    operation,
                    transferred = progress.get() - before,
                    "Attempt timed out after making progress, retrying without backoff"
                );
                continue;
            }

            failures += 1;
            if failures >= self.max_attempts {
                warn!(
                    operation,
                    attempts = failures,
                    error = %err,
                    "Operation failed after maximum retries"
                );
                return Err(RemoteError::retry_exhausted(operation, failures, err));
            }

            match backoff.next_backoff() {
                Some(delay) => {
                    warn!(
                        operation,
                        attempts = failures,
                        error = %err,
                        retry_in_ms = delay.as_millis(),
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(RemoteError::retry_exhausted(operation, failures, err)),
            }
        }
    }
}

/// Create exponential backoff from config
fn create_backoff(config: &RetryConfig) -> backoff::ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(config.initial_backoff_ms))
        .with_max_interval(Duration::from_millis(config.max_backoff_ms))
        .with_multiplier(config.backoff_multiplier)
        .with_randomization_factor(config.jitter)
        .with_max_elapsed_time(None) // the attempt budget bounds retries
        .build()
}

/// Whether an error is a per-attempt deadline expiry
fn is_timeout(err: &RemoteError) -> bool {
    match err {
        RemoteError::Timeout { .. } => true,
        RemoteError::GrpcError { source, .. } => source.code() == tonic::Code::DeadlineExceeded,
        _ => false,
    }
}

/// Determine if an error is transient
pub fn is_retryable(err: &RemoteError) -> bool {
    match err {
        RemoteError::ConnectionFailed { .. } | RemoteError::Timeout { .. } => true,

        RemoteError::GrpcError { source, .. } => matches!(
            source.code(),
            tonic::Code::Unavailable
                | tonic::Code::ResourceExhausted
                | tonic::Code::DeadlineExceeded
                | tonic::Code::Aborted
                | tonic::Code::Internal
                | tonic::Code::Unknown
        ),

        RemoteError::IoError { source, .. } => matches!(
            source.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::UnexpectedEof
        ),

        // A short stream is resumed from the received offset
        RemoteError::ByteStreamIncomplete { .. } => true,

        RemoteError::CacheNotFound { .. }
        | RemoteError::InvalidDigest(_)
        | RemoteError::DigestMismatch { .. }
        | RemoteError::MerkleError { .. }
        | RemoteError::ConfigError(_)
        | RemoteError::SerializationError { .. }
        | RemoteError::RetryExhausted { .. }
        | RemoteError::Cancelled { .. }
        | RemoteError::ChannelClosed
        | RemoteError::UploadFailed { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Backoff that records how many delays were requested
    struct CountingBackoff(Arc<AtomicUsize>);

    impl Backoff for CountingBackoff {
        fn next_backoff(&mut self) -> Option<Duration> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Some(Duration::ZERO)
        }
    }

    fn retrier(max_attempts: usize, timeout: Option<Duration>) -> (Retrier, Arc<AtomicUsize>) {
        let delays = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delays);
        let retrier = Retrier::new(&RetryConfig::default(), timeout)
            .with_max_attempts(max_attempts)
            .with_backoff(Arc::new(move || -> Box<dyn Backoff + Send> {
                Box::new(CountingBackoff(Arc::clone(&counter)))
            }));
        (retrier, delays)
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let (retrier, delays) = retrier(5, None);
        let calls = AtomicUsize::new(0);

        let value = retrier
            .execute("test", |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(RemoteError::grpc_error("test", tonic::Status::unavailable("down")))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(delays.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let (retrier, delays) = retrier(5, None);
        let calls = AtomicUsize::new(0);

        let err = retrier
            .execute("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(RemoteError::cache_not_found("abc/1")) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RemoteError::CacheNotFound { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(delays.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_budget_exhausted() {
        let (retrier, _) = retrier(3, None);
        let calls = AtomicUsize::new(0);

        let err = retrier
            .execute("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(RemoteError::connection_failed("grpc://x", "refused")) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RemoteError::RetryExhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_with_progress_does_not_consume_budget() {
        let (retrier, delays) = retrier(1, Some(Duration::from_secs(1)));
        let calls = AtomicUsize::new(0);

        let value = retrier
            .execute("test", |progress| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        progress.advance(10);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok(n)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(delays.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_progress_counts() {
        let (retrier, delays) = retrier(2, Some(Duration::from_secs(1)));

        let err = retrier
            .execute("test", |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RemoteError::RetryExhausted { attempts: 2, .. }));
        assert_eq!(delays.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backoff_stopping_ends_retries() {
        struct Never;
        impl Backoff for Never {
            fn next_backoff(&mut self) -> Option<Duration> {
                None
            }
        }

        let retrier = Retrier::new(&RetryConfig::default(), None)
            .with_backoff(Arc::new(|| -> Box<dyn Backoff + Send> { Box::new(Never) }));
        let seen = Mutex::new(0);

        let err = retrier
            .execute("test", |_| {
                *seen.lock().unwrap() += 1;
                async { Err::<(), _>(RemoteError::timeout("test", 1)) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RemoteError::RetryExhausted { attempts: 1, .. }));
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(is_retryable(&RemoteError::grpc_error(
            "x",
            tonic::Status::resource_exhausted("busy")
        )));
        assert!(!is_retryable(&RemoteError::grpc_error(
            "x",
            tonic::Status::permission_denied("no")
        )));
        assert!(!is_retryable(&RemoteError::digest_mismatch("a", "b")));
        assert!(!is_retryable(&RemoteError::cancelled("x")));
        assert!(is_retryable(&RemoteError::bytestream_incomplete(7, 3)));
    }
}
