//! Retry logic with exponential backoff.
//!
//! Provides configurable retry behavior for network operations with:
//! - Exponential backoff (delay doubles each attempt)
//! - Optional jitter
//! - An overall elapsed-time bound
//! - Cooperative cancellation between attempts

use crate::cancel::CancellationToken;
use crate::config::NetworkConfig;
use crate::error::{FetchError, Result};
use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first one).
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Exponential base (typically 2.0 for doubling).
    pub exponential_base: f64,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
    /// Upper bound on the total time spent across attempts.
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: NetworkConfig::MAX_ATTEMPTS,
            base_delay: Duration::from_secs_f64(NetworkConfig::RETRY_BASE_DELAY_SECS),
            max_delay: NetworkConfig::RETRY_MAX_DELAY,
            exponential_base: NetworkConfig::RETRY_EXPONENTIAL_BASE,
            jitter: false,
            max_elapsed: None,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum delay cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Bound the total elapsed time across all attempts.
    pub fn with_max_elapsed(mut self, bound: Option<Duration>) -> Self {
        self.max_elapsed = bound;
        self
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        // Exponential backoff: base * (exponential_base ^ attempt)
        let multiplier = self.exponential_base.powi(attempt as i32);
        let delay_secs = self.base_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            // Factor in [0.5, 1.5) keeps the mean delay and never drops near zero
            let mut rng = rand::rng();
            let jitter_factor = rng.random_range(0.5..1.5);
            (capped_secs * jitter_factor).min(self.max_delay.as_secs_f64())
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }
}

/// Statistics about a retry operation.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// Number of attempts made.
    pub attempts: u32,
    /// Total delay accumulated.
    pub total_delay: Duration,
    /// Whether the operation ultimately succeeded.
    pub success: bool,
    /// Last error message if failed.
    pub last_error: Option<String>,
}

/// Retry an async operation with exponential backoff.
///
/// Stops early when `should_retry` rejects the error, when the next delay
/// would exceed `max_elapsed`, or when `cancel` fires during a backoff
/// sleep. In every case the last error is returned as-is.
pub async fn retry_async<F, Fut, T, E>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> (std::result::Result<T, E>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut stats = RetryStats::default();
    let started = Instant::now();
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        stats.attempts = attempt + 1;

        let err = match operation().await {
            Ok(value) => {
                stats.success = true;
                if attempt > 0 {
                    debug!("Operation succeeded after {} attempts", attempt + 1);
                }
                return (Ok(value), stats);
            }
            Err(e) => e,
        };
        stats.last_error = Some(err.to_string());

        if !should_retry(&err) {
            debug!("Error is not retryable: {}", err);
            return (Err(err), stats);
        }

        if attempt + 1 >= max_attempts {
            warn!(
                "All {} retry attempts exhausted. Last error: {}",
                max_attempts, err
            );
            return (Err(err), stats);
        }

        let delay = config.calculate_delay(attempt);
        if let Some(bound) = config.max_elapsed {
            if started.elapsed() + delay > bound {
                warn!(
                    "Retry time budget of {:?} exhausted after {} attempts. Last error: {}",
                    bound,
                    attempt + 1,
                    err
                );
                return (Err(err), stats);
            }
        }
        stats.total_delay += delay;

        warn!(
            "Attempt {}/{} failed: {}. Retrying in {:?}",
            attempt + 1,
            max_attempts,
            err,
            delay
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                debug!("Cancelled during retry backoff");
                return (Err(err), stats);
            }
        }
        attempt += 1;
    }
}

/// Retry a fallible fetch step, classifying errors with
/// [`FetchError::is_retryable`].
///
/// A transient error that survives every attempt comes back wrapped in
/// [`FetchError::RetriesExhausted`]; fatal errors are returned unchanged.
/// A running attempt is dropped as soon as `cancel` fires.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    what: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempt = || {
        let pending = operation();
        async move {
            cancel
                .run_until_cancelled(pending)
                .await
                .unwrap_or_else(|cancelled| Err(cancelled.into()))
        }
    };
    let (result, stats) = retry_async(config, cancel, attempt, |e: &FetchError| {
        e.is_retryable() && !cancel.is_cancelled()
    })
    .await;

    match result {
        Ok(value) => Ok(value),
        Err(_) if cancel.is_cancelled() => Err(FetchError::Cancelled),
        Err(err) if err.is_retryable() => {
            debug!("{} failed after {} attempt(s)", what, stats.attempts);
            Err(FetchError::RetriesExhausted {
                attempts: stats.attempts,
                last: Box::new(err),
            })
        }
        Err(err) => Err(err),
    }
}
