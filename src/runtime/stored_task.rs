//! Type-erased future storage.
//!
//! `StoredTask` wraps a spawned future whose result has already been routed
//! elsewhere (task records, scope close hooks), so the executor only ever
//! sees `()`-output futures.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A type-erased future stored in the executor.
pub(crate) struct StoredTask {
    future: Pin<Box<dyn Future<Output = ()>>>,
    polls: u64,
}

impl StoredTask {
    pub(crate) fn new<F>(future: F) -> Self
    where
        F: Future<Output = ()> + 'static,
    {
        Self {
            future: Box::pin(future),
            polls: 0,
        }
    }

    /// Polls the stored task once.
    pub(crate) fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        self.polls += 1;
        self.future.as_mut().poll(cx)
    }
}

impl std::fmt::Debug for StoredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredTask")
            .field("polls", &self.polls)
            .finish_non_exhaustive()
    }
}
