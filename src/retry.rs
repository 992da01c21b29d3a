//! Retry utilities with exponential backoff and jitter.
//!
//! [`retry_until`] keeps going until a wall-clock deadline and lets the
//! caller mark some failures as permanent. The node joiner uses it to wait
//! out a control plane that has not finished initializing; the runtime
//! installer uses it to wait for the containerd socket.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Backoff suited to polling a control plane that is still booting
    pub fn control_plane_discovery() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

fn jittered(delay: Duration) -> Duration {
    // 0.5x to 1.5x of the delay
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
}

/// Why [`retry_until`] gave up
#[derive(Debug, PartialEq, Eq)]
pub enum RetryFailure<E> {
    /// The operation returned an error the caller classified as permanent
    Permanent(E),
    /// The deadline passed; carries the last transient error
    DeadlineExceeded {
        /// Error from the final attempt
        last: E,
        /// Number of attempts made
        attempts: u32,
    },
}

/// Execute an async operation until it succeeds, a permanent error is
/// returned, or `deadline` has elapsed since the first attempt.
///
/// `is_transient` decides per error whether another attempt is worthwhile.
/// The operation receives the time left before the deadline so it can bound
/// its own work. Sleeps never overshoot the deadline.
pub async fn retry_until<F, Fut, T, E, P>(
    config: &RetryConfig,
    deadline: Duration,
    operation_name: &str,
    is_transient: P,
    mut operation: F,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut(Duration) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let started = Instant::now();
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        let remaining = deadline.saturating_sub(started.elapsed());

        let err = match operation(remaining).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !is_transient(&err) {
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %err,
                "Operation failed permanently"
            );
            return Err(RetryFailure::Permanent(err));
        }

        let remaining = deadline.saturating_sub(started.elapsed());
        if remaining.is_zero() || (config.max_attempts > 0 && attempt >= config.max_attempts) {
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %err,
                "Operation did not succeed before deadline"
            );
            return Err(RetryFailure::DeadlineExceeded {
                last: err,
                attempts: attempt,
            });
        }

        let sleep_for = jittered(delay).min(remaining);
        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %err,
            delay_ms = sleep_for.as_millis(),
            remaining_ms = remaining.as_millis(),
            "Operation failed, retrying"
        );

        tokio::time::sleep(sleep_for).await;
        delay = config.next_delay(delay);
    }
}
