//! # Retry Policy
//!
//! Re-runs an async operation while its failures are transient.
//!
//! ## Overview
//!
//! The first attempt runs immediately. Before retry *k* (attempt *k + 1*) the
//! policy sleeps `base_delay * 2^(k-1)`, optionally scaled by a random factor
//! in `[0.8, 1.2]` so that concurrent callers that failed together do not
//! retry together. Failures the caller's predicate calls fatal are returned
//! at once; transient ones are retried until `max_attempts` attempts have
//! been made.
//!
//! ## Usage
//!
//! ```ignore
//! let policy = RetryPolicy::new(3, Duration::from_millis(100));
//! let Retried { value, attempts } = policy
//!     .run(|_attempt| store.put_once(&id), StoreError::is_transient)
//!     .await?;
//! ```

use core_async::time::{sleep, Duration};
use core_runtime::config::RetrySettings;
use rand::Rng;
use std::future::Future;
use thiserror::Error;
use tracing::debug;

/// Jitter range applied to each delay when enabled
const JITTER_FRACTION: f64 = 0.2;

/// Retry policy for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter: bool,
}

/// Successful result and the attempt that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    /// 1 when the first attempt succeeded
    pub attempts: u32,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    #[error("fatal failure on attempt {attempts}: {error}")]
    Fatal { error: E, attempts: u32 },

    #[error("still failing after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Fatal { attempts, .. } | RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal { error, .. } => error,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetrySettings::default().into()
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(settings: RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: settings.base_delay,
            jitter: settings.jitter,
        }
    }
}

impl RetryPolicy {
    /// Policy without jitter
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            jitter: false,
        }
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Un-jittered delay before retry `retry` (1-based)
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Delay actually slept before retry `retry`, jitter included
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let nominal = self.nominal_delay(retry);
        if !self.jitter || nominal.is_zero() {
            return nominal;
        }
        let factor = rand::thread_rng().gen_range((1.0 - JITTER_FRACTION)..=(1.0 + JITTER_FRACTION));
        nominal.mul_f64(factor)
    }

    /// Run `op` until it succeeds, fails fatally or runs out of attempts.
    ///
    /// `op` receives the 1-based attempt number. A zero `max_attempts` is
    /// treated as one attempt.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        mut op: F,
        is_transient: P,
    ) -> std::result::Result<Retried<T>, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => {
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                    })
                }
                Err(error) if !is_transient(&error) => {
                    return Err(RetryError::Fatal {
                        error,
                        attempts: attempt,
                    })
                }
                Err(last) if attempt >= max_attempts => {
                    debug!("Giving up after {} attempts: {}", attempt, last);
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last,
                    });
                }
                Err(error) => {
                    let delay = self.delay_for_retry(attempt);
                    debug!(
                        "Attempt {}/{} failed transiently ({}), retrying in {:?}",
                        attempt, max_attempts, error, delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum Failure {
        Busy,
        Broken,
    }

    impl std::fmt::Display for Failure {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    fn transient(f: &Failure) -> bool {
        *f == Failure::Busy
    }

    #[test]
    fn test_nominal_delay_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.nominal_delay(1), Duration::from_millis(100));
        assert_eq!(policy.nominal_delay(2), Duration::from_millis(200));
        assert_eq!(policy.nominal_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_jitter_stays_within_twenty_percent() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100)).with_jitter(true);
        for _ in 0..200 {
            let delay = policy.delay_for_retry(2);
            assert!(delay >= Duration::from_millis(159), "{:?}", delay);
            assert!(delay <= Duration::from_millis(241), "{:?}", delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10));
        let calls = &AtomicU32::new(0);

        let result = policy
            .run(
                move |_| async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n <= 2 {
                        Err(Failure::Busy)
                    } else {
                        Ok("stored")
                    }
                },
                transient,
            )
            .await
            .unwrap();

        assert_eq!(result.value, "stored");
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let calls = &AtomicU32::new(0);

        let err = policy
            .run(
                move |_| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Failure::Busy)
                },
                transient,
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            err,
            RetryError::Exhausted {
                attempts: 3,
                last: Failure::Busy
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_is_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10));
        let calls = &AtomicU32::new(0);

        let err = policy
            .run(
                move |_| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Failure::Broken)
                },
                transient,
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts(), 1);
        assert_eq!(err.into_inner(), Failure::Broken);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_follow_backoff_schedule() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let start = tokio::time::Instant::now();

        let _ = policy
            .run(|_| async { Err::<(), _>(Failure::Busy) }, transient)
            .await;

        // 100ms before the 2nd attempt, 200ms before the 3rd
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(310), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn test_zero_attempts_runs_once() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        let result = policy
            .run(|attempt| async move { Ok::<_, Failure>(attempt) }, transient)
            .await
            .unwrap();
        assert_eq!(result.value, 1);
    }
}
