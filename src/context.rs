//! Ambient scope storage.
//!
//! A [`ScopeStore`] is the per-scope record threaded through asynchronous
//! continuations: the owning scope, the inherited deadline, and the
//! strict-cancellation watch configuration. The combinator that creates a
//! scope wraps its body (and every task it spawns) in [`WithStore`], whose
//! `poll` installs the frame before resuming the inner future and restores
//! the previous frame afterwards — on ready, pending, and unwind paths alike.
//! Nested installs therefore restore correctly, and any continuation created
//! inside a frame observes that frame via [`ScopeStore::current`].

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::scope::Scope;
use crate::strict::StrictWatch;
use crate::types::Time;

thread_local! {
    static CURRENT_STORE: RefCell<Option<Rc<ScopeStore>>> = const { RefCell::new(None) };
}

/// The per-scope record held in ambient context.
pub(crate) struct ScopeStore {
    scope: Scope,
    deadline: Option<Time>,
    watch: Option<Rc<StrictWatch>>,
}

impl ScopeStore {
    /// Returns the innermost store, or `None` outside any scope.
    pub(crate) fn current() -> Option<Rc<Self>> {
        CURRENT_STORE.with(|cell| cell.borrow().clone())
    }

    /// Returns the scope of the innermost store, if any.
    pub(crate) fn current_scope() -> Option<Scope> {
        Self::current().map(|store| store.scope.clone())
    }

    /// Creates a store for a freshly opened scope, inheriting the deadline
    /// and watch configuration of the current frame.
    pub(crate) fn for_scope(scope: Scope) -> Rc<Self> {
        let inherited = Self::current();
        Rc::new(Self {
            scope,
            deadline: inherited.as_ref().and_then(|s| s.deadline),
            watch: inherited.as_ref().and_then(|s| s.watch.clone()),
        })
    }

    /// Creates a store for a scope with an explicit watch configuration.
    pub(crate) fn for_scope_with_watch(scope: Scope, watch: Rc<StrictWatch>) -> Rc<Self> {
        let inherited = Self::current();
        Rc::new(Self {
            scope,
            deadline: inherited.as_ref().and_then(|s| s.deadline),
            watch: Some(watch),
        })
    }

    /// Clones this store with a tightened deadline.
    ///
    /// The scope is unchanged; nested timeouts install such a clone so their
    /// children observe the capped budget.
    pub(crate) fn with_deadline(self: &Rc<Self>, deadline: Time) -> Rc<Self> {
        Rc::new(Self {
            scope: self.scope.clone(),
            deadline: Some(deadline),
            watch: self.watch.clone(),
        })
    }

    /// The scope this store belongs to.
    pub(crate) fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The absolute deadline published by an enclosing timeout, if any.
    pub(crate) fn deadline(&self) -> Option<Time> {
        self.deadline
    }

    /// The strict-cancellation watch configuration, if armed.
    pub(crate) fn watch(&self) -> Option<Rc<StrictWatch>> {
        self.watch.clone()
    }

    /// Remaining time until the published deadline, clamped to zero.
    pub(crate) fn deadline_remaining(&self, now: Time) -> Option<Duration> {
        self.deadline.map(|dl| dl.duration_since(now))
    }
}

/// Restores the previous frame when dropped, surviving unwinds.
struct StoreGuard {
    prev: Option<Rc<ScopeStore>>,
}

impl StoreGuard {
    fn install(store: Rc<ScopeStore>) -> Self {
        let prev = CURRENT_STORE.with(|cell| cell.borrow_mut().replace(store));
        Self { prev }
    }
}

impl Drop for StoreGuard {
    fn drop(&mut self) {
        CURRENT_STORE.with(|cell| {
            *cell.borrow_mut() = self.prev.take();
        });
    }
}

/// A future that runs its inner future under a scope store frame.
pub(crate) struct WithStore<F> {
    store: Rc<ScopeStore>,
    inner: Pin<Box<F>>,
}

impl<F: Future> WithStore<F> {
    pub(crate) fn new(store: Rc<ScopeStore>, inner: F) -> Self {
        Self {
            store,
            inner: Box::pin(inner),
        }
    }
}

impl<F: Future> Future for WithStore<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let _guard = StoreGuard::install(this.store.clone());
        this.inner.as_mut().poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ScopeKind;

    fn test_scope() -> Scope {
        Scope::detached_for_test(ScopeKind::Plain)
    }

    #[test]
    fn no_store_outside_any_frame() {
        assert!(ScopeStore::current().is_none());
    }

    #[test]
    fn guard_restores_previous_frame_on_drop() {
        let outer = ScopeStore::for_scope(test_scope());
        let inner = ScopeStore::for_scope(test_scope());

        let g1 = StoreGuard::install(outer.clone());
        assert!(Rc::ptr_eq(&ScopeStore::current().unwrap(), &outer));
        {
            let _g2 = StoreGuard::install(inner.clone());
            assert!(Rc::ptr_eq(&ScopeStore::current().unwrap(), &inner));
        }
        assert!(Rc::ptr_eq(&ScopeStore::current().unwrap(), &outer));
        drop(g1);
        assert!(ScopeStore::current().is_none());
    }

    #[test]
    fn child_frame_inherits_deadline() {
        let outer = ScopeStore::for_scope(test_scope()).with_deadline(Time::from_millis(100));
        let _g = StoreGuard::install(outer);
        let child = ScopeStore::for_scope(test_scope());
        assert_eq!(child.deadline(), Some(Time::from_millis(100)));
    }

    #[test]
    fn deadline_remaining_clamps_to_zero() {
        let store = ScopeStore::for_scope(test_scope()).with_deadline(Time::from_millis(10));
        assert_eq!(
            store.deadline_remaining(Time::from_millis(4)),
            Some(Duration::from_millis(6))
        );
        assert_eq!(
            store.deadline_remaining(Time::from_millis(40)),
            Some(Duration::ZERO)
        );
    }
}
