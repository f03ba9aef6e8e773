//! Sleep futures, plain and cancellation-aware.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::runtime::Handle;
use crate::runtime::timer::TimerSlot;
use crate::signal::{CancelSignal, Cancelled};
use crate::types::Time;

/// A future that completes after a duration has elapsed on the runtime's
/// clock.
///
/// The deadline is computed at first poll; the timer registration is
/// released when the future resolves or is dropped, so an abandoned sleep
/// leaves nothing armed.
#[derive(Debug)]
pub struct Sleep {
    duration: Duration,
    deadline: Option<Time>,
    slot: Option<Arc<TimerSlot>>,
}

impl Sleep {
    /// Creates a sleep for the given duration.
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            deadline: None,
            slot: None,
        }
    }

    /// The absolute deadline, once the sleep has been polled.
    #[must_use]
    pub fn deadline(&self) -> Option<Time> {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let handle = Handle::expect_current("sleep");
        let now = handle.now();
        let duration = self.duration;
        let deadline = *self.deadline.get_or_insert_with(|| now + duration);
        if now >= deadline {
            if let Some(slot) = self.slot.take() {
                slot.clear();
            }
            return Poll::Ready(());
        }
        let slot = self
            .slot
            .get_or_insert_with(|| handle.register_timer(deadline));
        slot.set_waker(cx.waker());
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.clear();
        }
    }
}

/// Sleeps for the given duration on the runtime's clock.
///
/// # Panics
///
/// Panics when polled outside a runtime.
#[must_use]
pub fn sleep(duration: Duration) -> Sleep {
    Sleep::new(duration)
}

struct CancellableSleep {
    sleep: Sleep,
    cancelled: Cancelled,
}

impl Future for CancellableSleep {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        // Cancellation dominates the timer.
        if let Poll::Ready(reason) = Pin::new(&mut this.cancelled).poll(cx) {
            return Poll::Ready(Err(Error::canceled(reason)));
        }
        Pin::new(&mut this.sleep).poll(cx).map(Ok)
    }
}

/// Sleeps for the given duration unless `signal` aborts first.
///
/// An already-aborted signal rejects immediately without registering a
/// timer; an abort while pending releases the timer and rejects with the
/// signal's reason.
pub async fn sleep_cancellable(duration: Duration, signal: &CancelSignal) -> Result<()> {
    if let Some(reason) = signal.reason() {
        return Err(Error::canceled(reason));
    }
    CancellableSleep {
        sleep: sleep(duration),
        cancelled: signal.cancelled(),
    }
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use crate::signal::CancelSource;
    use crate::types::CancelReason;

    #[test]
    fn sleep_advances_the_lab_clock() {
        let mut rt = Runtime::lab();
        let (before, after) = rt.block_on(async {
            let handle = crate::runtime::Handle::expect_current("test");
            let before = handle.now();
            sleep(Duration::from_millis(150)).await;
            (before, handle.now())
        });
        assert_eq!(before, Time::ZERO);
        assert!(after >= Time::from_millis(150));
    }

    #[test]
    fn cancellable_sleep_rejects_with_the_signal_reason() {
        let mut rt = Runtime::lab();
        let err = rt.block_on(async {
            let source = CancelSource::new();
            let signal = source.signal();
            let aborter = source.clone();
            let handle = crate::runtime::Handle::expect_current("test");
            handle.spawn(async move {
                sleep(Duration::from_millis(10)).await;
                aborter.abort(CancelReason::user_abort_with("wake up"));
            });
            sleep_cancellable(Duration::from_secs(3600), &signal)
                .await
                .expect_err("abort interrupts the sleep")
        });
        assert_eq!(
            err.cancel_reason(),
            Some(&CancelReason::user_abort_with("wake up"))
        );
    }

    #[test]
    fn aborted_signal_rejects_without_scheduling() {
        let mut rt = Runtime::lab();
        let err = rt.block_on(async {
            let source = CancelSource::new();
            source.abort(CancelReason::ScopeClosed);
            sleep_cancellable(Duration::from_secs(5), &source.signal())
                .await
                .expect_err("already aborted")
        });
        assert!(err.is_canceled());
        // The lab clock never needed to move.
        assert_eq!(rt.now(), Time::ZERO);
    }

    #[test]
    fn completed_sleep_resolves_ok() {
        let mut rt = Runtime::lab();
        let out = rt.block_on(async {
            let source = CancelSource::new();
            sleep_cancellable(Duration::from_millis(5), &source.signal()).await
        });
        out.expect("un-aborted sleep completes");
    }
}
