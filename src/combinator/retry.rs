//! Retry with fixed or exponential backoff.
//!
//! Retries are cancel-aware: the signal is checked before every attempt and
//! before every backoff wait, and the waits themselves reject on abort. An
//! in-flight attempt runs to its own settlement — cancellation is
//! cooperative there like everywhere else.

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::signal::CancelSignal;
use crate::time::sleep_cancellable;

/// The backoff strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Every wait is `initial_delay`.
    #[default]
    Fixed,
    /// Wait `initial_delay * 2^attempt` before attempt `attempt + 1`.
    Exponential,
}

/// Policy for [`retry`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    retries: u32,
    backoff: Backoff,
    initial_delay: Duration,
}

impl RetryPolicy {
    /// A policy allowing `retries` additional attempts after the first,
    /// with fixed 50 ms waits.
    #[must_use]
    pub fn new(retries: u32) -> Self {
        Self {
            retries,
            backoff: Backoff::Fixed,
            initial_delay: Duration::from_millis(50),
        }
    }

    /// Selects the backoff strategy.
    #[must_use]
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the delay before the first retry.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Number of retries after the first attempt.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// The wait before the attempt following `attempt` (zero-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.initial_delay,
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                self.initial_delay
                    .checked_mul(factor)
                    .unwrap_or(Duration::MAX)
            }
        }
    }
}

/// Runs `f` up to `1 + retries` times under the given signal.
///
/// The last attempt's error propagates; an abort observed between attempts
/// or during a wait rejects with the signal's reason.
pub async fn retry<T, W, F>(mut f: W, policy: RetryPolicy, signal: &CancelSignal) -> Result<T>
where
    W: FnMut(CancelSignal) -> F,
    F: Future<Output = Result<T>>,
{
    let mut last_error = None;
    for attempt in 0..=policy.retries() {
        if let Some(reason) = signal.reason() {
            return Err(Error::canceled(reason));
        }
        match f(signal.clone()).await {
            Ok(value) => return Ok(value),
            Err(error) => last_error = Some(error),
        }
        if attempt < policy.retries() {
            if let Some(reason) = signal.reason() {
                return Err(Error::canceled(reason));
            }
            sleep_cancellable(policy.delay_for(attempt), signal).await?;
        }
    }
    Err(last_error.unwrap_or_else(|| Error::user("retry: no attempt was made")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use crate::signal::CancelSource;
    use crate::types::{CancelReason, Time};
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn exponential_delays_double() {
        let policy = RetryPolicy::new(4)
            .backoff(Backoff::Exponential)
            .initial_delay(Duration::from_millis(50));
        assert_eq!(policy.delay_for(0), Duration::from_millis(50));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
    }

    #[test]
    fn fixed_delays_stay_constant() {
        let policy = RetryPolicy::new(4).initial_delay(Duration::from_millis(30));
        assert_eq!(policy.delay_for(0), Duration::from_millis(30));
        assert_eq!(policy.delay_for(3), Duration::from_millis(30));
    }

    #[test]
    fn succeeds_once_an_attempt_passes() {
        let mut rt = Runtime::lab();
        let attempts = Rc::new(Cell::new(0));
        let counter = attempts.clone();
        let out = rt.block_on(async move {
            let source = CancelSource::new();
            retry(
                move |_signal| {
                    let counter = counter.clone();
                    async move {
                        counter.set(counter.get() + 1);
                        if counter.get() < 3 {
                            Err(Error::user("flaky"))
                        } else {
                            Ok("finally")
                        }
                    }
                },
                RetryPolicy::new(5),
                &source.signal(),
            )
            .await
        });
        assert_eq!(out.expect("third attempt passes"), "finally");
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn exhausted_retries_return_the_last_error() {
        let mut rt = Runtime::lab();
        let (err, elapsed) = rt.block_on(async {
            let source = CancelSource::new();
            let err = retry(
                |_signal| async { Err::<(), _>(Error::user("always broken")) },
                RetryPolicy::new(2).initial_delay(Duration::from_millis(10)),
                &source.signal(),
            )
            .await
            .expect_err("all attempts fail");
            (err, crate::runtime::Handle::expect_current("test").now())
        });
        assert_eq!(err.to_string(), "always broken");
        // Two waits of 10 ms each happened between the three attempts.
        assert!(elapsed >= Time::from_millis(20));
    }

    #[test]
    fn abort_during_backoff_rejects_with_the_reason() {
        let mut rt = Runtime::lab();
        let err = rt.block_on(async {
            let source = CancelSource::new();
            let signal = source.signal();
            let aborter = source.clone();
            crate::runtime::Handle::expect_current("test").spawn(async move {
                crate::time::sleep(Duration::from_millis(5)).await;
                aborter.abort(CancelReason::user_abort_with("enough"));
            });
            retry(
                |_signal| async { Err::<(), _>(Error::user("failing")) },
                RetryPolicy::new(10).initial_delay(Duration::from_secs(3600)),
                &signal,
            )
            .await
            .expect_err("aborted mid-wait")
        });
        assert_eq!(
            err.cancel_reason(),
            Some(&CancelReason::user_abort_with("enough"))
        );
    }

    #[test]
    fn pre_aborted_signal_prevents_any_attempt() {
        let mut rt = Runtime::lab();
        let ran = Rc::new(Cell::new(false));
        let probe = ran.clone();
        let err = rt.block_on(async move {
            let source = CancelSource::new();
            source.abort(CancelReason::ScopeClosed);
            retry(
                move |_signal| {
                    probe.set(true);
                    async { Ok(()) }
                },
                RetryPolicy::new(3),
                &source.signal(),
            )
            .await
            .expect_err("aborted before the first attempt")
        });
        assert!(err.is_canceled());
        assert!(!ran.get());
    }
}
