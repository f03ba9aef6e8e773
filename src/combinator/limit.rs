//! FIFO concurrency limiter.
//!
//! At most `concurrency` executions run at once; the rest queue in arrival
//! order. The limiter is bound to a cancel signal: aborting it fails new
//! admissions immediately and (by default) drains the queue, rejecting each
//! queued entry with the signal's reason. Work already running received the
//! same signal and is expected to cooperate.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::error::{Error, Result};
use crate::signal::CancelSignal;
use crate::types::CancelReason;

/// Options for [`Limiter::with_options`].
#[derive(Debug, Clone)]
pub struct LimitOptions {
    cancel_queued_on_abort: bool,
}

impl LimitOptions {
    /// The default option set: queued entries are rejected on abort.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cancel_queued_on_abort: true,
        }
    }

    /// Whether an abort rejects queued entries (`true` by default) or lets
    /// them run as permits free up.
    #[must_use]
    pub fn cancel_queued_on_abort(mut self, cancel: bool) -> Self {
        self.cancel_queued_on_abort = cancel;
        self
    }
}

impl Default for LimitOptions {
    fn default() -> Self {
        Self::new()
    }
}

enum WaiterState {
    Queued(Option<Waker>),
    Granted,
    Rejected(CancelReason),
    Finished,
}

struct Waiter {
    state: Mutex<WaiterState>,
}

struct LimitState {
    available: usize,
    queue: VecDeque<Arc<Waiter>>,
    closed: Option<CancelReason>,
}

/// A FIFO concurrency limiter bound to a cancel signal.
#[derive(Clone)]
pub struct Limiter {
    state: Arc<Mutex<LimitState>>,
    signal: CancelSignal,
}

impl Limiter {
    /// Builds a limiter admitting at most `concurrency` concurrent
    /// executions, with default options.
    ///
    /// # Panics
    ///
    /// Panics when `concurrency` is zero.
    #[must_use]
    pub fn new(concurrency: usize, signal: CancelSignal) -> Self {
        Self::with_options(concurrency, signal, LimitOptions::new())
    }

    /// Builds a limiter with explicit options.
    ///
    /// # Panics
    ///
    /// Panics when `concurrency` is zero.
    #[must_use]
    pub fn with_options(concurrency: usize, signal: CancelSignal, options: LimitOptions) -> Self {
        assert!(concurrency >= 1, "limit: concurrency must be at least 1");
        let state = Arc::new(Mutex::new(LimitState {
            available: concurrency,
            queue: VecDeque::new(),
            closed: None,
        }));

        let on_abort_state = state.clone();
        signal.on_abort(move |reason| {
            let drained = {
                let mut state = on_abort_state.lock().expect("limit lock poisoned");
                state.closed = Some(reason.clone());
                if options.cancel_queued_on_abort {
                    state.queue.drain(..).collect::<Vec<_>>()
                } else {
                    Vec::new()
                }
            };
            for waiter in drained {
                let previous = std::mem::replace(
                    &mut *waiter.state.lock().expect("limit lock poisoned"),
                    WaiterState::Rejected(reason.clone()),
                );
                if let WaiterState::Queued(Some(waker)) = previous {
                    waker.wake();
                }
            }
        });

        Self { state, signal }
    }

    /// Runs `work` once a permit is available.
    ///
    /// The permit is released when the work settles or when this future is
    /// dropped mid-flight.
    pub async fn run<T, W, F>(&self, work: W) -> Result<T>
    where
        W: FnOnce(CancelSignal) -> F,
        F: Future<Output = Result<T>>,
    {
        Acquire {
            limiter: self,
            waiter: None,
        }
        .await?;
        let _permit = Permit { limiter: self };
        work(self.signal.clone()).await
    }

    /// Hands the freed permit to the next live queued waiter, or returns it
    /// to the pool.
    fn release(&self) {
        loop {
            let next = {
                let mut state = self.state.lock().expect("limit lock poisoned");
                match state.queue.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        state.available += 1;
                        return;
                    }
                }
            };
            let previous = std::mem::replace(
                &mut *next.state.lock().expect("limit lock poisoned"),
                WaiterState::Granted,
            );
            match previous {
                WaiterState::Queued(waker) => {
                    if let Some(waker) = waker {
                        waker.wake();
                    }
                    return;
                }
                // A dead waiter; pass the permit on.
                _ => {}
            }
        }
    }

    #[cfg(test)]
    fn available(&self) -> usize {
        self.state.lock().expect("limit lock poisoned").available
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("limit lock poisoned");
        f.debug_struct("Limiter")
            .field("available", &state.available)
            .field("queued", &state.queue.len())
            .field("closed", &state.closed.is_some())
            .finish()
    }
}

struct Permit<'a> {
    limiter: &'a Limiter,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

struct Acquire<'a> {
    limiter: &'a Limiter,
    waiter: Option<Arc<Waiter>>,
}

impl Future for Acquire<'_> {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if let Some(waiter) = this.waiter.clone() {
            let mut state = waiter.state.lock().expect("limit lock poisoned");
            return match &mut *state {
                WaiterState::Granted => {
                    *state = WaiterState::Finished;
                    drop(state);
                    this.waiter = None;
                    Poll::Ready(Ok(()))
                }
                WaiterState::Rejected(reason) => {
                    let reason = reason.clone();
                    drop(state);
                    this.waiter = None;
                    Poll::Ready(Err(Error::canceled(reason)))
                }
                WaiterState::Queued(waker) => {
                    *waker = Some(cx.waker().clone());
                    Poll::Pending
                }
                WaiterState::Finished => Poll::Ready(Err(Error::new(
                    crate::error::ErrorKind::Internal,
                )
                .with_message("limit waiter polled after completion"))),
            };
        }

        let mut state = this.limiter.state.lock().expect("limit lock poisoned");
        if let Some(reason) = state.closed.clone() {
            return Poll::Ready(Err(Error::canceled(reason)));
        }
        if state.available > 0 {
            state.available -= 1;
            return Poll::Ready(Ok(()));
        }
        let waiter = Arc::new(Waiter {
            state: Mutex::new(WaiterState::Queued(Some(cx.waker().clone()))),
        });
        state.queue.push_back(waiter.clone());
        drop(state);
        this.waiter = Some(waiter);
        Poll::Pending
    }
}

impl Drop for Acquire<'_> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            {
                let mut state = self.limiter.state.lock().expect("limit lock poisoned");
                state.queue.retain(|queued| !Arc::ptr_eq(queued, &waiter));
            }
            let previous = std::mem::replace(
                &mut *waiter.state.lock().expect("limit lock poisoned"),
                WaiterState::Finished,
            );
            if matches!(previous, WaiterState::Granted) {
                // Granted but never observed; pass the permit on.
                self.limiter.release();
            }
        }
    }
}
