//! The context handed to combinator callbacks.
//!
//! `task(...)` starts a scope-bound task: its signal is the scope's signal,
//! so closing the scope cancels it, and it is registered in the scope's
//! entries for the combinator's completion rule. The helpers (`sleep`,
//! `timeout`, `retry`, `limit`) are all bound to the same signal.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::combinator::limit::{Limiter, LimitOptions};
use crate::combinator::retry::RetryPolicy;
use crate::combinator::{join_all, join_all_settled, race_settled, retry};
use crate::context::ScopeStore;
use crate::error::Result;
use crate::runtime::Handle;
use crate::scope::Scope;
use crate::signal::CancelSignal;
use crate::task::{run_task, TaskHandle, TaskOptions, TaskRecord};
use crate::time::{sleep_cancellable, timeout};

/// The shared core of both context flavors.
pub(crate) struct CtxCore {
    scope: Scope,
    #[allow(dead_code)]
    store: Rc<ScopeStore>,
}

impl Clone for CtxCore {
    fn clone(&self) -> Self {
        Self {
            scope: self.scope.clone(),
            store: self.store.clone(),
        }
    }
}

impl CtxCore {
    pub(crate) fn new(scope: Scope, store: Rc<ScopeStore>) -> Self {
        Self { scope, store }
    }

    fn start<T, W, F>(&self, name: Option<Arc<str>>, work: W) -> TaskHandle<T>
    where
        W: FnOnce(CancelSignal) -> F,
        F: Future<Output = Result<T>> + 'static,
        T: 'static,
    {
        let mut options = TaskOptions::new().signal(self.scope.signal());
        if let Some(name) = name {
            options = options.name(name);
        }
        run_task(work, options)
    }

    fn deadline_remaining(&self) -> Option<Duration> {
        let store = ScopeStore::current()?;
        let now = Handle::expect_current("deadline_remaining").now();
        store.deadline_remaining(now)
    }
}

/// Context for `sync`, `branch`, `spawn`, and `spawn_scope` callbacks.
///
/// Tasks started through it may have heterogeneous output types; each is
/// individually awaitable through its returned [`TaskHandle`].
pub struct Ctx {
    core: CtxCore,
}

impl Clone for Ctx {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl Ctx {
    pub(crate) fn new(scope: Scope, store: Rc<ScopeStore>) -> Self {
        Self {
            core: CtxCore::new(scope, store),
        }
    }

    /// Starts a scope-bound task.
    pub fn task<T, W, F>(&self, work: W) -> TaskHandle<T>
    where
        W: FnOnce(CancelSignal) -> F,
        F: Future<Output = Result<T>> + 'static,
        T: 'static,
    {
        self.core.start(None, work)
    }

    /// Starts a named scope-bound task.
    pub fn task_named<T, W, F>(&self, name: impl Into<Arc<str>>, work: W) -> TaskHandle<T>
    where
        W: FnOnce(CancelSignal) -> F,
        F: Future<Output = Result<T>> + 'static,
        T: 'static,
    {
        self.core.start(Some(name.into()), work)
    }

    /// The scope this context belongs to.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.core.scope
    }

    /// The scope's cancellation signal.
    #[must_use]
    pub fn signal(&self) -> CancelSignal {
        self.core.scope.signal()
    }

    /// Sleeps unless the scope is cancelled first.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        sleep_cancellable(duration, &self.signal()).await
    }

    /// Runs `work` under a time budget capped by the inherited deadline.
    pub async fn timeout<T, W, F>(&self, duration: Duration, work: W) -> Result<T>
    where
        W: FnOnce(CancelSignal) -> F,
        F: Future<Output = Result<T>>,
    {
        timeout(duration, work).await
    }

    /// Retries `f` under the scope's signal.
    pub async fn retry<T, W, F>(&self, f: W, policy: RetryPolicy) -> Result<T>
    where
        W: FnMut(CancelSignal) -> F,
        F: Future<Output = Result<T>>,
    {
        retry(f, policy, &self.signal()).await
    }

    /// Builds a FIFO concurrency limiter bound to the scope's signal.
    #[must_use]
    pub fn limit(&self, concurrency: usize) -> Limiter {
        Limiter::new(concurrency, self.signal())
    }

    /// Builds a limiter with explicit options.
    #[must_use]
    pub fn limit_with(&self, concurrency: usize, options: LimitOptions) -> Limiter {
        Limiter::with_options(concurrency, self.signal(), options)
    }

    /// Awaits every handle; the first rejection wins.
    pub async fn all<T: Unpin>(&self, tasks: Vec<TaskHandle<T>>) -> Result<Vec<T>> {
        join_all(tasks).await
    }

    /// Awaits the first handle to settle.
    pub async fn race<T>(&self, tasks: Vec<TaskHandle<T>>) -> Result<T> {
        race_settled(tasks).await
    }

    /// Awaits every handle, collecting all outcomes.
    pub async fn all_settled<T: Unpin>(&self, tasks: Vec<TaskHandle<T>>) -> Vec<Result<T>> {
        join_all_settled(tasks).await
    }

    /// Remaining time until the inherited deadline, if one is set.
    #[must_use]
    pub fn deadline_remaining(&self) -> Option<Duration> {
        self.core.deadline_remaining()
    }
}

impl std::fmt::Debug for Ctx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ctx")
            .field("scope", &self.core.scope.id())
            .finish_non_exhaustive()
    }
}

/// A typed settlement record for `race`/`rush` entrants.
pub(crate) struct RaceSlot<T> {
    pub(crate) record: Arc<TaskRecord>,
    pub(crate) value: Arc<Mutex<Option<T>>>,
}

/// Context for `race` and `rush` callbacks.
///
/// Every task started through it shares the output type `T`: whichever
/// settles first supplies the combinator's outcome.
pub struct RaceCtx<T> {
    core: CtxCore,
    slots: Rc<RefCell<Vec<RaceSlot<T>>>>,
}

impl<T> Clone for RaceCtx<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            slots: self.slots.clone(),
        }
    }
}

impl<T: 'static> RaceCtx<T> {
    pub(crate) fn new(
        scope: Scope,
        store: Rc<ScopeStore>,
        slots: Rc<RefCell<Vec<RaceSlot<T>>>>,
    ) -> Self {
        Self {
            core: CtxCore::new(scope, store),
            slots,
        }
    }

    fn start_entrant<W, F>(&self, name: Option<Arc<str>>, work: W) -> TaskHandle<T>
    where
        W: FnOnce(CancelSignal) -> F,
        F: Future<Output = Result<T>> + 'static,
    {
        let handle = self.core.start(name, work);
        self.slots.borrow_mut().push(RaceSlot {
            record: handle.record(),
            value: handle.value_slot(),
        });
        handle
    }

    /// Starts a scope-bound entrant.
    pub fn task<W, F>(&self, work: W) -> TaskHandle<T>
    where
        W: FnOnce(CancelSignal) -> F,
        F: Future<Output = Result<T>> + 'static,
    {
        self.start_entrant(None, work)
    }

    /// Starts a named scope-bound entrant.
    pub fn task_named<W, F>(&self, name: impl Into<Arc<str>>, work: W) -> TaskHandle<T>
    where
        W: FnOnce(CancelSignal) -> F,
        F: Future<Output = Result<T>> + 'static,
    {
        self.start_entrant(Some(name.into()), work)
    }

    /// The scope this context belongs to.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.core.scope
    }

    /// The scope's cancellation signal.
    #[must_use]
    pub fn signal(&self) -> CancelSignal {
        self.core.scope.signal()
    }

    /// Sleeps unless the scope is cancelled first.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        sleep_cancellable(duration, &self.signal()).await
    }

    /// Runs `work` under a time budget capped by the inherited deadline.
    pub async fn timeout<U, W, F>(&self, duration: Duration, work: W) -> Result<U>
    where
        W: FnOnce(CancelSignal) -> F,
        F: Future<Output = Result<U>>,
    {
        timeout(duration, work).await
    }

    /// Retries `f` under the scope's signal.
    pub async fn retry<U, W, F>(&self, f: W, policy: RetryPolicy) -> Result<U>
    where
        W: FnMut(CancelSignal) -> F,
        F: Future<Output = Result<U>>,
    {
        retry(f, policy, &self.signal()).await
    }

    /// Builds a FIFO concurrency limiter bound to the scope's signal.
    #[must_use]
    pub fn limit(&self, concurrency: usize) -> Limiter {
        Limiter::new(concurrency, self.signal())
    }

    /// Remaining time until the inherited deadline, if one is set.
    #[must_use]
    pub fn deadline_remaining(&self) -> Option<Duration> {
        self.core.deadline_remaining()
    }
}

impl<T> std::fmt::Debug for RaceCtx<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaceCtx")
            .field("scope", &self.core.scope.id())
            .field("entrants", &self.slots.borrow().len())
            .finish_non_exhaustive()
    }
}
