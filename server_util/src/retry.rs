// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Generic backoff+predicate retry used by the answer pipeline, scoring
//! worker, and recovery service. Delays are deterministic; callers that want
//! jitter add it in their predicate's `on_retry`.

use core_protocol::error::CoreError;
use log::warn;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Copy, Clone, Debug)]
pub struct RetryOptions {
    /// Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    /// Logged on each retry.
    pub context: &'static str,
}

impl RetryOptions {
    pub const fn new(context: &'static str) -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            context,
        }
    }

    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub const fn initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// Delay before attempt `i + 1` (0-based `i`).
    fn delay(&self, i: u32) -> Duration {
        self.initial_delay
            .mul_f64(self.backoff_multiplier.powi(i as i32))
    }
}

/// Raised when all attempts are spent.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub original_error: E,
    pub attempts: u32,
    pub total_time: Duration,
}

impl<E: Debug> RetryExhausted<E> {
    pub fn into_inner(self) -> E {
        self.original_error
    }
}

/// Runs `op` until it succeeds, the predicate refuses a retry, or attempts
/// are exhausted. Non-retryable errors surface immediately inside
/// [`RetryExhausted`] with the true attempt count.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    op: F,
    options: RetryOptions,
    is_retryable: P,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Debug,
{
    retry_with_backoff_notify(op, options, is_retryable, |_, _| {}).await
}

/// Like [`retry_with_backoff`], with a hook invoked before each retry sleep
/// (attempt number is 1-based).
pub async fn retry_with_backoff_notify<T, E, F, Fut, P, N>(
    mut op: F,
    options: RetryOptions,
    is_retryable: P,
    mut on_retry: N,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    N: FnMut(u32, &E),
    E: Debug,
{
    let started = Instant::now();
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let exhausted = attempt >= options.max_retries;
                if exhausted || !is_retryable(&error) {
                    return Err(RetryExhausted {
                        original_error: error,
                        attempts: attempt + 1,
                        total_time: started.elapsed(),
                    });
                }
                let delay = options.delay(attempt);
                on_retry(attempt + 1, &error);
                warn!(
                    "{}: attempt {} failed ({:?}), retrying in {:?}",
                    options.context,
                    attempt + 1,
                    error,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Predicates for [`retry_with_backoff`].
pub mod predicate {
    use super::*;

    pub fn always<E>() -> impl Fn(&E) -> bool {
        |_| true
    }

    pub fn never<E>() -> impl Fn(&E) -> bool {
        |_| false
    }

    /// True if any of the predicates allow a retry.
    pub fn any<E, const N: usize>(preds: [Box<dyn Fn(&E) -> bool>; N]) -> impl Fn(&E) -> bool {
        move |e| preds.iter().any(|p| p(e))
    }

    /// True only if every predicate allows a retry.
    pub fn all<E, const N: usize>(preds: [Box<dyn Fn(&E) -> bool>; N]) -> impl Fn(&E) -> bool {
        move |e| preds.iter().all(|p| p(e))
    }

    /// Transient storage failures: connection loss and timeouts, never
    /// semantic failures like a rejected CAS.
    pub fn transient_database(error: &CoreError) -> bool {
        matches!(
            error,
            CoreError::StorageUnavailable(_) | CoreError::StorageTimeout(_)
        )
    }

    /// Transient network-ish failures.
    pub fn transient_network(error: &CoreError) -> bool {
        matches!(error, CoreError::Network(_) | CoreError::Timeout(_))
    }

    /// Transient HTTP statuses: 5xx, 429, 408.
    pub fn transient_http_status(status: u16) -> bool {
        status >= 500 || status == 429 || status == 408
    }
}

#[cfg(test)]
mod test {
    use crate::retry::{predicate, retry_with_backoff, RetryOptions};
    use core_protocol::error::CoreError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(CoreError::StorageUnavailable("conn refused".into()))
                    } else {
                        Ok(n)
                    }
                }
            },
            RetryOptions::new("test"),
            predicate::transient_database,
        )
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CoreError::DuplicateAnswer) }
            },
            RetryOptions::new("test"),
            predicate::transient_database,
        )
        .await;
        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_retries() {
        let calls = AtomicU32::new(0);
        let options = RetryOptions::new("test").max_retries(4);
        let result: Result<(), _> = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CoreError::Network("reset".into())) }
            },
            options,
            predicate::always(),
        )
        .await;
        let exhausted = result.unwrap_err();
        // Total attempts = max_retries + 1.
        assert_eq!(exhausted.attempts, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn deterministic_delays() {
        let options = RetryOptions::new("test")
            .max_retries(3)
            .initial_delay(Duration::from_millis(100));
        let started = tokio::time::Instant::now();
        let _: Result<(), _> = retry_with_backoff(
            || async { Err(CoreError::Network("reset".into())) },
            options,
            predicate::always(),
        )
        .await;
        // 100 + 200 + 400 ms of (paused, auto-advanced) sleeps.
        assert_eq!(started.elapsed(), Duration::from_millis(700));
    }

    #[test]
    fn combinators_and_http() {
        let is_db = predicate::any::<CoreError, 2>([
            Box::new(predicate::transient_database),
            Box::new(predicate::transient_network),
        ]);
        assert!(is_db(&CoreError::Network("x".into())));
        assert!(!is_db(&CoreError::AuthFailed));

        assert!(predicate::transient_http_status(503));
        assert!(predicate::transient_http_status(429));
        assert!(predicate::transient_http_status(408));
        assert!(!predicate::transient_http_status(404));
    }
}
