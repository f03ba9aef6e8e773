//! One-shot broadcast cancellation.
//!
//! A [`CancelSource`] is the aborting side of the primitive; a
//! [`CancelSignal`] is the observing side. Aborting is idempotent and the
//! first abort fixes the reason. Observers can register one-shot listeners,
//! poll the aborted state, or await the [`CancelSignal::cancelled`] future.
//!
//! Listeners are invoked exactly once, in registration order, with no
//! internal lock held, so a listener may freely abort further sources
//! (parent-to-child cascades do exactly that).

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::types::CancelReason;

type AbortListener = Box<dyn FnOnce(&CancelReason)>;

/// Identifies a registered abort listener for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct SignalState {
    reason: Option<CancelReason>,
    listeners: Vec<(ListenerId, AbortListener)>,
    wakers: Vec<(u64, Waker)>,
    next_key: u64,
}

struct SignalInner {
    state: Mutex<SignalState>,
}

impl SignalInner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SignalState {
                reason: None,
                listeners: Vec::new(),
                wakers: Vec::new(),
                next_key: 1,
            }),
        })
    }
}

/// The aborting side of a one-shot broadcast cancellation primitive.
#[derive(Clone)]
pub struct CancelSource {
    inner: Arc<SignalInner>,
}

impl CancelSource {
    /// Creates a new, un-aborted source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: SignalInner::new(),
        }
    }

    /// Returns an observer handle for this source.
    #[must_use]
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            inner: self.inner.clone(),
        }
    }

    /// Aborts the source with the given reason.
    ///
    /// Idempotent: only the first call takes effect and fixes the reason.
    /// Listeners run in registration order and pending `cancelled()` futures
    /// are woken.
    pub fn abort(&self, reason: CancelReason) {
        let (listeners, wakers) = {
            let mut state = self.inner.state.lock().expect("signal lock poisoned");
            if state.reason.is_some() {
                return;
            }
            state.reason = Some(reason.clone());
            (
                std::mem::take(&mut state.listeners),
                std::mem::take(&mut state.wakers),
            )
        };
        for (_, listener) in listeners {
            listener(&reason);
        }
        for (_, waker) in wakers {
            waker.wake();
        }
    }

    /// Returns true if the source has been aborted.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.signal().is_aborted()
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSource")
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}

/// The observing side of a one-shot broadcast cancellation primitive.
#[derive(Clone)]
pub struct CancelSignal {
    inner: Arc<SignalInner>,
}

impl CancelSignal {
    /// Returns true if the owning source has been aborted.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner
            .state
            .lock()
            .expect("signal lock poisoned")
            .reason
            .is_some()
    }

    /// Returns the abort reason, when the source has been aborted.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner
            .state
            .lock()
            .expect("signal lock poisoned")
            .reason
            .clone()
    }

    /// Registers a one-shot abort listener.
    ///
    /// If the source is already aborted, the listener is invoked immediately
    /// (synchronously) with the stored reason and the returned id is inert.
    pub fn on_abort(&self, listener: impl FnOnce(&CancelReason) + 'static) -> ListenerId {
        let already = {
            let mut state = self.inner.state.lock().expect("signal lock poisoned");
            match &state.reason {
                Some(reason) => Some(reason.clone()),
                None => {
                    let id = ListenerId(state.next_key);
                    state.next_key += 1;
                    state.listeners.push((id, Box::new(listener)));
                    return id;
                }
            }
        };
        if let Some(reason) = already {
            listener(&reason);
        }
        ListenerId(0)
    }

    /// Removes a previously registered abort listener.
    ///
    /// A no-op if the listener already fired or was already removed.
    pub fn remove_listener(&self, id: ListenerId) {
        let mut state = self.inner.state.lock().expect("signal lock poisoned");
        state.listeners.retain(|(lid, _)| *lid != id);
    }

    /// Returns a future that resolves with the abort reason.
    #[must_use]
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            signal: self.clone(),
            key: None,
        }
    }

    /// Returns true if both handles observe the identical source.
    #[must_use]
    pub fn same_source(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}

/// Future returned by [`CancelSignal::cancelled`].
///
/// Resolves with the abort reason once the source aborts.
pub struct Cancelled {
    signal: CancelSignal,
    key: Option<u64>,
}

impl Future for Cancelled {
    type Output = CancelReason;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let mut state = this.signal.inner.state.lock().expect("signal lock poisoned");
        if let Some(reason) = &state.reason {
            return Poll::Ready(reason.clone());
        }
        match this.key {
            Some(key) => {
                if let Some(entry) = state.wakers.iter_mut().find(|(k, _)| *k == key) {
                    entry.1.clone_from(cx.waker());
                }
            }
            None => {
                let key = state.next_key;
                state.next_key += 1;
                state.wakers.push((key, cx.waker().clone()));
                this.key = Some(key);
            }
        }
        Poll::Pending
    }
}

impl Drop for Cancelled {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            if let Ok(mut state) = self.signal.inner.state.lock() {
                state.wakers.retain(|(k, _)| *k != key);
            }
        }
    }
}
