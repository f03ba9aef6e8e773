//! Deadline-inheriting timeout.
//!
//! The effective budget is the requested duration capped by the remaining
//! ambient deadline, so nested timeouts tighten monotonically. The work
//! future runs under a cloned store frame publishing the tightened
//! deadline; when the timer fires first, the ambient scope is aborted with
//! [`CancelReason::Timeout`] and the caller receives a timeout error with
//! the stable message `Timeout after {ms} ms`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::context::{ScopeStore, WithStore};
use crate::error::{Error, Result};
use crate::runtime::Handle;
use crate::scope::Scope;
use crate::signal::{CancelSignal, CancelSource};
use crate::time::sleep::{sleep, Sleep};
use crate::types::CancelReason;

/// Where the timeout delivers its abort when the timer fires.
enum AbortTarget {
    /// Inside a scope: the scope's source, fanning out to its tasks.
    Scope(Scope),
    /// Standalone: a dedicated source handed to the work.
    Source(CancelSource),
}

impl AbortTarget {
    fn fire(&self, effective: Duration) {
        let reason = CancelReason::timeout(effective);
        match self {
            Self::Scope(scope) => scope.abort_with(reason),
            Self::Source(source) => source.abort(reason),
        }
    }
}

enum Body<F: Future> {
    /// Work wrapped in a store frame carrying the tightened deadline.
    Framed(WithStore<F>),
    /// Standalone work with no ambient frame to clone.
    Bare(Pin<Box<F>>),
}

impl<F: Future> Body<F> {
    fn poll(&mut self, cx: &mut Context<'_>) -> Poll<F::Output> {
        match self {
            Self::Framed(framed) => Pin::new(framed).poll(cx),
            Self::Bare(bare) => bare.as_mut().poll(cx),
        }
    }
}

struct TimeoutFuture<F: Future> {
    body: Body<F>,
    timer: Sleep,
    effective: Duration,
    target: AbortTarget,
}

impl<T, F: Future<Output = Result<T>>> Future for TimeoutFuture<F> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if let Poll::Ready(outcome) = this.body.poll(cx) {
            return Poll::Ready(outcome);
        }
        if Pin::new(&mut this.timer).poll(cx).is_ready() {
            this.target.fire(this.effective);
            return Poll::Ready(Err(Error::timeout(this.effective)));
        }
        Poll::Pending
    }
}

/// Runs `work` under a time budget.
///
/// `work` receives the ambient scope's signal when called inside a scope
/// (so the timer's abort cancels the scope's tasks), or a dedicated signal
/// otherwise. The timer registration is released on every outcome.
///
/// # Panics
///
/// Panics when called outside a runtime.
pub async fn timeout<T, W, F>(duration: Duration, work: W) -> Result<T>
where
    W: FnOnce(CancelSignal) -> F,
    F: Future<Output = Result<T>>,
{
    let handle = Handle::expect_current("timeout");
    let now = handle.now();
    let store = ScopeStore::current();

    let effective = match store.as_ref().and_then(|s| s.deadline_remaining(now)) {
        Some(remaining) => duration.min(remaining),
        None => duration,
    };
    let deadline = now + effective;

    let (signal, target) = match &store {
        Some(store) => (
            store.scope().signal(),
            AbortTarget::Scope(store.scope().clone()),
        ),
        None => {
            let source = CancelSource::new();
            (source.signal(), AbortTarget::Source(source))
        }
    };

    // Defer the invocation so even the work's synchronous prefix runs under
    // the tightened frame.
    let work_future = async move { work(signal).await };
    let body = match &store {
        Some(store) => Body::Framed(WithStore::new(store.with_deadline(deadline), work_future)),
        None => Body::Bare(Box::pin(work_future)),
    };

    TimeoutFuture {
        body,
        timer: sleep(effective),
        effective,
        target,
    }
    .await
}
