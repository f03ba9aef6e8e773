//! Task lifecycle: creation, transitions, cancel hooks, and the awaitable
//! handle.
//!
//! A task makes exactly one transition out of `Running`. Cancellation is
//! driven solely by the task's owned cancel source: parent signals abort
//! that source through a bridge listener, and the abort cancels the record
//! synchronously — lifecycle hook first, then the status flip, then user
//! `on_cancel` handlers in registration order, and only then are awaiters
//! woken. The work future keeps being driven until it observes its signal
//! and settles; its settlement is tracked separately from the status so the
//! strict-cancellation watchdog can tell a cooperative task from one that
//! ignores its signal.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::context::{ScopeStore, WithStore};
use crate::error::{Error, ErrorKind, Result};
use crate::runtime::Handle;
use crate::scope::ScopeInner;
use crate::signal::{CancelSignal, CancelSource};
use crate::strict::{self, Violation};
use crate::trace::{self, TaskEvent};
use crate::types::{CancelReason, TaskId, TaskStatus, Time};

static SETTLE_SEQ: AtomicU64 = AtomicU64::new(1);

/// Optional lifecycle hooks observed at terminal transitions.
///
/// Hooks fire before the terminal flag flips; a panicking hook is isolated
/// and never alters the task outcome.
#[derive(Default)]
pub struct LifecycleHooks {
    on_complete: Option<Box<dyn FnOnce(Duration)>>,
    on_fail: Option<Box<dyn FnOnce(&Error)>>,
    on_cancel: Option<Box<dyn FnOnce(&CancelReason)>>,
}

impl LifecycleHooks {
    /// Creates an empty hook set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Observes successful completion with the task's running duration.
    #[must_use]
    pub fn on_complete(mut self, hook: impl FnOnce(Duration) + 'static) -> Self {
        self.on_complete = Some(Box::new(hook));
        self
    }

    /// Observes failure with the task's error.
    #[must_use]
    pub fn on_fail(mut self, hook: impl FnOnce(&Error) + 'static) -> Self {
        self.on_fail = Some(Box::new(hook));
        self
    }

    /// Observes cancellation with the stored reason, before user `on_cancel`
    /// handlers run.
    #[must_use]
    pub fn on_cancel(mut self, hook: impl FnOnce(&CancelReason) + 'static) -> Self {
        self.on_cancel = Some(Box::new(hook));
        self
    }
}

impl std::fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("on_complete", &self.on_complete.is_some())
            .field("on_fail", &self.on_fail.is_some())
            .field("on_cancel", &self.on_cancel.is_some())
            .finish()
    }
}

/// Options for [`run_task`].
#[derive(Debug, Default)]
pub struct TaskOptions {
    signal: Option<CancelSignal>,
    name: Option<Arc<str>>,
    hooks: LifecycleHooks,
    parent: Option<Arc<str>>,
}

impl TaskOptions {
    /// Creates the default option set: unnamed, unbound, no hooks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the task to a parent signal: abort of the signal cancels the
    /// task.
    #[must_use]
    pub fn signal(mut self, signal: CancelSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Names the task for diagnostics. Never affects behavior, but errors
    /// passing through the task are annotated with the name.
    #[must_use]
    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attaches lifecycle hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Names the parent task; cancellation arriving through the parent
    /// signal is then normalized to [`CancelReason::ParentCanceled`].
    #[must_use]
    pub fn parent_task(mut self, name: impl Into<Arc<str>>) -> Self {
        self.parent = Some(name.into());
        self
    }
}

/// A settled view of a task, for awaiters.
pub(crate) enum Settled {
    Completed,
    Failed(Error),
    Canceled(CancelReason),
}

struct RecordState {
    status: TaskStatus,
    transitioning: bool,
    reason: Option<CancelReason>,
    error: Option<Error>,
    cancel_hooks: Vec<Box<dyn FnOnce(&CancelReason)>>,
    waiters: Vec<Waker>,
    lifecycle: LifecycleHooks,
    scope: Option<Weak<ScopeInner>>,
    started_at: Time,
    ended_at: Option<Time>,
    settle_seq: Option<u64>,
}

/// The type-erased shared task record.
pub(crate) struct TaskRecord {
    id: TaskId,
    name: Option<Arc<str>>,
    state: Mutex<RecordState>,
}

impl TaskRecord {
    pub(crate) fn new(
        id: TaskId,
        name: Option<Arc<str>>,
        lifecycle: LifecycleHooks,
        now: Time,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name,
            state: Mutex::new(RecordState {
                status: TaskStatus::Running,
                transitioning: false,
                reason: None,
                error: None,
                cancel_hooks: Vec::new(),
                waiters: Vec::new(),
                lifecycle,
                scope: None,
                started_at: now,
                ended_at: None,
                settle_seq: None,
            }),
        })
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn name(&self) -> Option<Arc<str>> {
        self.name.clone()
    }

    pub(crate) fn status(&self) -> TaskStatus {
        self.state.lock().expect("task lock poisoned").status
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub(crate) fn settle_seq(&self) -> Option<u64> {
        self.state.lock().expect("task lock poisoned").settle_seq
    }

    pub(crate) fn ended_at(&self) -> Option<Time> {
        self.state.lock().expect("task lock poisoned").ended_at
    }

    pub(crate) fn cancel_reason(&self) -> Option<CancelReason> {
        self.state.lock().expect("task lock poisoned").reason.clone()
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.state.lock().expect("task lock poisoned").error.clone()
    }

    pub(crate) fn attach_scope(&self, scope: Weak<ScopeInner>) {
        self.state.lock().expect("task lock poisoned").scope = Some(scope);
    }

    /// Registers an awaiter; deduplicates by `will_wake`.
    fn add_waiter(&self, waker: &Waker) {
        let mut state = self.state.lock().expect("task lock poisoned");
        if !state.waiters.iter().any(|w| w.will_wake(waker)) {
            state.waiters.push(waker.clone());
        }
    }

    /// Polls the settled view, registering the waker while running.
    pub(crate) fn poll_settled(&self, waker: &Waker) -> Option<Settled> {
        let snapshot = {
            let state = self.state.lock().expect("task lock poisoned");
            match state.status {
                TaskStatus::Running => None,
                TaskStatus::Completed => Some(Settled::Completed),
                TaskStatus::Failed => Some(Settled::Failed(
                    state
                        .error
                        .clone()
                        .unwrap_or_else(|| Error::new(ErrorKind::Internal)),
                )),
                TaskStatus::Canceled => Some(Settled::Canceled(
                    state.reason.clone().unwrap_or(CancelReason::ScopeClosed),
                )),
            }
        };
        if snapshot.is_none() {
            self.add_waiter(waker);
        }
        snapshot
    }

    /// Appends a cancel hook, or runs it synchronously when the task is
    /// already canceled. Ignored on other terminal states.
    pub(crate) fn on_cancel_hook(&self, hook: impl FnOnce(&CancelReason) + 'static) {
        let run_now = {
            let mut state = self.state.lock().expect("task lock poisoned");
            match state.status {
                TaskStatus::Running => {
                    state.cancel_hooks.push(Box::new(hook));
                    return;
                }
                TaskStatus::Canceled => state.reason.clone(),
                TaskStatus::Completed | TaskStatus::Failed => None,
            }
        };
        if let Some(reason) = run_now {
            run_isolated(move || hook(&reason));
        }
    }

    /// `Running -> Completed`. The value slot must already hold the result.
    pub(crate) fn complete(&self, now: Time) {
        let Some((hook, started)) = self.begin_transition(|lc| lc.on_complete.take()) else {
            return;
        };
        if let Some(hook) = hook {
            run_isolated(move || hook(now.duration_since(started)));
        }
        let waiters = self.finish_transition(|state| {
            state.status = TaskStatus::Completed;
        }, now);
        self.emit_updated(TaskStatus::Completed, now);
        wake_all(waiters);
        self.notify_scope(None);
    }

    /// `Running -> Failed`. Annotates the error with the task name.
    pub(crate) fn fail(&self, error: Error, now: Time) {
        let error = match &self.name {
            Some(name) => error.with_task_name(name.clone()),
            None => error,
        };
        let Some((hook, _)) = self.begin_transition(|lc| lc.on_fail.take()) else {
            return;
        };
        if let Some(hook) = hook {
            let snapshot = error.clone();
            run_isolated(move || hook(&snapshot));
        }
        let stored = error.clone();
        let waiters = self.finish_transition(move |state| {
            state.status = TaskStatus::Failed;
            state.error = Some(stored);
        }, now);
        self.emit_updated(TaskStatus::Failed, now);
        wake_all(waiters);
        self.notify_scope(Some(error));
    }

    /// `Running -> Canceled`. Lifecycle hook, flip, event, user hooks,
    /// awaiter wake — in that order.
    pub(crate) fn cancel(&self, reason: CancelReason, now: Time) {
        let Some((hook, _)) = self.begin_transition(|lc| lc.on_cancel.take()) else {
            return;
        };
        if let Some(hook) = hook {
            let snapshot = reason.clone();
            run_isolated(move || hook(&snapshot));
        }
        let stored = reason.clone();
        let (waiters, hooks) = {
            let mut state = self.state.lock().expect("task lock poisoned");
            state.status = TaskStatus::Canceled;
            state.reason = Some(stored);
            state.ended_at = Some(now);
            state.settle_seq = Some(SETTLE_SEQ.fetch_add(1, Ordering::Relaxed));
            state.transitioning = false;
            (
                std::mem::take(&mut state.waiters),
                std::mem::take(&mut state.cancel_hooks),
            )
        };
        self.emit_updated(TaskStatus::Canceled, now);
        if hooks.is_empty() {
            strict::check(Violation::IgnoredCancellation {
                task: self.id,
                name: self.name.clone(),
            });
        }
        for hook in hooks {
            let snapshot = reason.clone();
            run_isolated(move || hook(&snapshot));
        }
        wake_all(waiters);
        self.notify_scope(None);
    }

    /// Guards and begins a terminal transition, handing back the requested
    /// lifecycle hook and the start time. `None` if already terminal.
    fn begin_transition<H>(
        &self,
        take: impl FnOnce(&mut LifecycleHooks) -> Option<H>,
    ) -> Option<(Option<H>, Time)> {
        let mut state = self.state.lock().expect("task lock poisoned");
        if state.status != TaskStatus::Running || state.transitioning {
            return None;
        }
        state.transitioning = true;
        let hook = take(&mut state.lifecycle);
        Some((hook, state.started_at))
    }

    fn finish_transition(
        &self,
        apply: impl FnOnce(&mut RecordState),
        now: Time,
    ) -> Vec<Waker> {
        let mut state = self.state.lock().expect("task lock poisoned");
        apply(&mut state);
        state.ended_at = Some(now);
        state.settle_seq = Some(SETTLE_SEQ.fetch_add(1, Ordering::Relaxed));
        state.transitioning = false;
        std::mem::take(&mut state.waiters)
    }

    fn emit_updated(&self, status: TaskStatus, now: Time) {
        let started = self.state.lock().expect("task lock poisoned").started_at;
        trace::emit(|| TaskEvent::TaskUpdated {
            task: self.id,
            status,
            started_at: started,
            ended_at: Some(now),
        });
    }

    fn notify_scope(&self, failure: Option<Error>) {
        let scope = self
            .state
            .lock()
            .expect("task lock poisoned")
            .scope
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(scope) = scope {
            scope.task_settled(failure);
        }
    }
}

impl std::fmt::Debug for TaskRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

fn wake_all(waiters: Vec<Waker>) {
    for waker in waiters {
        waker.wake();
    }
}

/// Runs a hook with panic isolation; a panicking hook never alters the task
/// outcome.
fn run_isolated(f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!("task hook panicked; the task outcome is unaffected");
    }
}

/// Polls the inner future, converting a panic into a payload.
struct CatchUnwind<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> CatchUnwind<F> {
    fn new(inner: F) -> Self {
        Self {
            inner: Box::pin(inner),
        }
    }
}

impl<F: Future> Future for CatchUnwind<F> {
    type Output = std::thread::Result<F::Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match catch_unwind(AssertUnwindSafe(|| this.inner.as_mut().poll(cx))) {
            Ok(Poll::Ready(value)) => Poll::Ready(Ok(value)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => Poll::Ready(Err(payload)),
        }
    }
}

/// The awaitable handle to a task.
///
/// Awaiting resolves with the work's value, or rejects with its error; on
/// cancellation the rejection carries the structured [`CancelReason`]. The
/// handle also exposes the synchronous state the bare future cannot:
/// [`status`](TaskHandle::status), [`name`](TaskHandle::name),
/// [`error`](TaskHandle::error), and [`on_cancel`](TaskHandle::on_cancel).
pub struct TaskHandle<T> {
    record: Arc<TaskRecord>,
    value: Arc<Mutex<Option<T>>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn from_parts(record: Arc<TaskRecord>, value: Arc<Mutex<Option<T>>>) -> Self {
        Self { record, value }
    }

    /// The task's identifier.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.record.id()
    }

    /// The diagnostic name, if one was given.
    #[must_use]
    pub fn name(&self) -> Option<Arc<str>> {
        self.record.name()
    }

    /// The current lifecycle status.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.record.status()
    }

    /// The cancel reason, once the task has been canceled.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.record.cancel_reason()
    }

    /// A snapshot of the result, once the task has completed.
    ///
    /// `None` while running, after a non-success transition, or after the
    /// value was consumed by awaiting the handle.
    #[must_use]
    pub fn result(&self) -> Option<T>
    where
        T: Clone,
    {
        self.value.lock().expect("task lock poisoned").clone()
    }

    /// The error the task would reject with, once terminal and unsuccessful.
    #[must_use]
    pub fn error(&self) -> Option<Error> {
        match self.record.status() {
            TaskStatus::Failed => self.record.error(),
            TaskStatus::Canceled => {
                let reason = self.record.cancel_reason()?;
                let err = Error::canceled(reason);
                Some(match self.record.name() {
                    Some(name) => err.with_task_name(name),
                    None => err,
                })
            }
            TaskStatus::Running | TaskStatus::Completed => None,
        }
    }

    /// Registers a cancellation cleanup handler.
    ///
    /// Handlers run in registration order, before any awaiter observes the
    /// rejection, and at most once. Registering on an already-canceled task
    /// invokes the handler synchronously with the stored reason.
    pub fn on_cancel(&self, handler: impl FnOnce(&CancelReason) + 'static) {
        self.record.on_cancel_hook(handler);
    }

    pub(crate) fn record(&self) -> Arc<TaskRecord> {
        self.record.clone()
    }

    pub(crate) fn value_slot(&self) -> Arc<Mutex<Option<T>>> {
        self.value.clone()
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.record.poll_settled(cx.waker()) {
            None => Poll::Pending,
            Some(Settled::Completed) => {
                let taken = self.value.lock().expect("task lock poisoned").take();
                match taken {
                    Some(value) => Poll::Ready(Ok(value)),
                    None => Poll::Ready(Err(Error::new(ErrorKind::Internal)
                        .with_message("task result already consumed"))),
                }
            }
            Some(Settled::Failed(error)) => Poll::Ready(Err(error)),
            Some(Settled::Canceled(reason)) => {
                let err = Error::canceled(reason);
                Poll::Ready(Err(match self.record.name() {
                    Some(name) => err.with_task_name(name),
                    None => err,
                }))
            }
        }
    }
}

/// Starts an asynchronous task on the current runtime.
///
/// `work` receives the task's owned [`CancelSignal`] and is expected to
/// observe it cooperatively. When `options.signal` is supplied, aborting it
/// cancels the task; if it is already aborted the task is born canceled and
/// `work` is never invoked. When the ambient scope's signal is the identical
/// source passed in `options.signal`, the task is registered as scope-bound.
///
/// # Panics
///
/// Panics outside [`Runtime::block_on`](crate::runtime::Runtime::block_on).
pub fn run_task<T, W, F>(work: W, options: TaskOptions) -> TaskHandle<T>
where
    W: FnOnce(CancelSignal) -> F,
    F: Future<Output = Result<T>> + 'static,
    T: 'static,
{
    let handle = Handle::expect_current("run_task");
    let now = handle.now();
    let id = handle.allocate_task_id();
    let TaskOptions {
        signal: parent_signal,
        name,
        hooks,
        parent,
    } = options;

    if parent_signal.is_none() && ScopeStore::current().is_none() {
        strict::check(Violation::UnstructuredTask {
            task: id,
            name: name.clone(),
        });
    }

    let record = TaskRecord::new(id, name.clone(), hooks, now);
    let value: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));

    let parent_scope = ScopeStore::current().map(|store| store.scope().id());
    trace::emit(|| TaskEvent::TaskRegistered {
        task: id,
        name: name.clone(),
        parent_scope,
    });

    // Born canceled: the parent signal was already aborted.
    if let Some(parent_sig) = &parent_signal {
        if let Some(parent_reason) = parent_sig.reason() {
            let reason = match &parent {
                Some(parent_name) => CancelReason::parent_canceled(Some(parent_name.clone())),
                None => parent_reason,
            };
            record.cancel(reason, now);
            return TaskHandle::from_parts(record, value);
        }
    }

    let source = CancelSource::new();
    let owned_signal = source.signal();

    // The owned source drives the cancel transition.
    {
        let record = record.clone();
        let handle = handle.clone();
        owned_signal.on_abort(move |reason| {
            record.cancel(reason.clone(), handle.now());
        });
    }

    // Scope-bound registration requires the identical source.
    let mut work_settled: Option<Arc<AtomicBool>> = None;
    if let (Some(parent_sig), Some(store)) = (&parent_signal, ScopeStore::current()) {
        if store.scope().signal().same_source(parent_sig) {
            work_settled = Some(store.scope().register_entry(record.clone()));
        }
    }

    // Parent abort bridges into the owned source; a named parent normalizes
    // the reason.
    if let Some(parent_sig) = &parent_signal {
        let source = source.clone();
        let parent = parent.clone();
        parent_sig.on_abort(move |reason| {
            let reason = match &parent {
                Some(parent_name) => CancelReason::parent_canceled(Some(parent_name.clone())),
                None => reason.clone(),
            };
            source.abort(reason);
        });
    }

    let work_future = work(owned_signal);
    let wrapper = {
        let record = record.clone();
        let value = value.clone();
        let handle = handle.clone();
        async move {
            let outcome = CatchUnwind::new(work_future).await;
            if let Some(flag) = &work_settled {
                flag.store(true, Ordering::SeqCst);
            }
            let now = handle.now();
            match outcome {
                Ok(Ok(result)) => {
                    *value.lock().expect("task lock poisoned") = Some(result);
                    record.complete(now);
                }
                Ok(Err(error)) => record.fail(error, now),
                Err(payload) => record.fail(Error::panicked(payload.as_ref()), now),
            }
        }
    };

    match ScopeStore::current() {
        Some(store) => handle.spawn_with_id(id, WithStore::new(store, wrapper)),
        None => handle.spawn_with_id(id, wrapper),
    }
    TaskHandle::from_parts(record, value)
}
