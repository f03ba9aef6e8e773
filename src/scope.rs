//! Scopes: bounded regions of execution that own a cancellation source and
//! track the tasks bound to them.
//!
//! A scope closes exactly once. Closing aborts the scope's source with
//! [`CancelReason::ScopeClosed`] unless something already aborted it, which
//! cancels every still-running scope-bound task synchronously. Entries keep
//! a `work_settled` flag alongside the task record: a canceled task's status
//! flips immediately, but its work future keeps running until it observes
//! its signal — the gap between the two is what the strict-cancellation
//! watchdog measures.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Waker;

use crate::context::{ScopeStore, WithStore};
use crate::error::{Error, Result};
use crate::signal::{CancelSignal, CancelSource};
use crate::strict::{self, Violation};
use crate::task::TaskRecord;
use crate::trace::{self, TaskEvent};
use crate::types::{CancelReason, ScopeId, TaskId, Time};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// The combinator family a scope was opened by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    /// All-must-succeed (`sync`).
    Sync,
    /// First-settle wins, losers cancelled (`race`).
    Race,
    /// First-settle result, losers awaited (`rush`).
    Rush,
    /// Fire-and-hold in an enclosing scope (`branch`).
    Branch,
    /// Parent-linked leaf task (`spawn`).
    Spawn,
    /// A plain scope opened by `run_in_scope` or the strict wrapper.
    Plain,
}

impl std::fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Race => write!(f, "race"),
            Self::Rush => write!(f, "rush"),
            Self::Branch => write!(f, "branch"),
            Self::Spawn => write!(f, "spawn"),
            Self::Plain => write!(f, "scope"),
        }
    }
}

pub(crate) struct ScopeEntry {
    pub(crate) record: Arc<TaskRecord>,
    pub(crate) work_settled: Arc<AtomicBool>,
}

struct ScopeState {
    entries: Vec<ScopeEntry>,
    waiters: Vec<Waker>,
    first_failure: Option<Error>,
    closed: bool,
}

/// Shared scope record.
pub(crate) struct ScopeInner {
    id: ScopeId,
    kind: ScopeKind,
    source: CancelSource,
    signal: CancelSignal,
    state: Mutex<ScopeState>,
}

impl ScopeInner {
    /// Records a settled entry: stores the first non-cancellation failure
    /// and wakes every scope waiter.
    pub(crate) fn task_settled(&self, failure: Option<Error>) {
        let waiters = {
            let mut state = self.state.lock().expect("scope lock poisoned");
            if let Some(error) = failure {
                if !error.is_canceled() && state.first_failure.is_none() {
                    state.first_failure = Some(error);
                }
            }
            std::mem::take(&mut state.waiters)
        };
        for waker in waiters {
            waker.wake();
        }
    }
}

/// A bounded region of execution owning a cancellation source.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    /// Opens a scope, bridging the parent's signal when one is given:
    /// parent abort aborts this scope with the parent's reason, unchanged.
    pub(crate) fn new(kind: ScopeKind, parent: Option<&Scope>) -> Self {
        let source = CancelSource::new();
        let signal = source.signal();
        let scope = Self {
            inner: Arc::new(ScopeInner {
                id: ScopeId(NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed)),
                kind,
                source,
                signal,
                state: Mutex::new(ScopeState {
                    entries: Vec::new(),
                    waiters: Vec::new(),
                    first_failure: None,
                    closed: false,
                }),
            }),
        };
        if let Some(parent) = parent {
            let child = scope.inner.source.clone();
            parent.signal().on_abort(move |reason| {
                child.abort(reason.clone());
            });
        }
        let (id, kind) = (scope.id(), scope.kind());
        trace::emit(|| TaskEvent::ScopeOpened { scope: id, kind });
        scope
    }

    #[cfg(test)]
    pub(crate) fn detached_for_test(kind: ScopeKind) -> Self {
        Self::new(kind, None)
    }

    /// The scope's identifier.
    #[must_use]
    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    /// The combinator family that opened this scope.
    #[must_use]
    pub fn kind(&self) -> ScopeKind {
        self.inner.kind
    }

    /// The scope's cancellation signal; scope-bound tasks share this source.
    #[must_use]
    pub fn signal(&self) -> CancelSignal {
        self.inner.signal.clone()
    }

    /// Aborts the scope with a default user-abort reason.
    pub fn abort(&self) {
        self.abort_with(CancelReason::user_abort());
    }

    /// Aborts the scope with a caller-supplied reason; the reason propagates
    /// to scope-bound tasks and child scopes unchanged.
    pub fn abort_with(&self, reason: CancelReason) {
        self.inner.source.abort(reason);
    }

    /// Closes the scope exactly once: aborts with
    /// [`CancelReason::ScopeClosed`] unless already aborted, then emits the
    /// close event.
    pub(crate) fn close(&self) {
        {
            let mut state = self.inner.state.lock().expect("scope lock poisoned");
            if state.closed {
                return;
            }
            state.closed = true;
        }
        if !self.inner.signal.is_aborted() {
            self.inner.source.abort(CancelReason::ScopeClosed);
        }
        let (id, kind) = (self.id(), self.kind());
        trace::emit(|| TaskEvent::ScopeClosed { scope: id, kind });
    }

    /// Registers a scope-bound task, returning its `work_settled` flag.
    pub(crate) fn register_entry(&self, record: Arc<TaskRecord>) -> Arc<AtomicBool> {
        record.attach_scope(Arc::downgrade(&self.inner));
        let flag = Arc::new(AtomicBool::new(false));
        let mut state = self.inner.state.lock().expect("scope lock poisoned");
        state.entries.push(ScopeEntry {
            record,
            work_settled: flag.clone(),
        });
        flag
    }

    /// True when every scope-bound task has reached a terminal status.
    pub(crate) fn entries_terminal(&self) -> bool {
        self.inner
            .state
            .lock()
            .expect("scope lock poisoned")
            .entries
            .iter()
            .all(|entry| entry.record.is_terminal())
    }

    /// Takes the first recorded non-cancellation failure, if any.
    pub(crate) fn take_first_failure(&self) -> Option<Error> {
        self.inner
            .state
            .lock()
            .expect("scope lock poisoned")
            .first_failure
            .take()
    }

    /// Registers a waiter woken whenever a scope-bound task settles.
    pub(crate) fn add_waiter(&self, waker: &Waker) {
        let mut state = self.inner.state.lock().expect("scope lock poisoned");
        if !state.waiters.iter().any(|w| w.will_wake(waker)) {
            state.waiters.push(waker.clone());
        }
    }

    /// Non-terminal entries at this moment: `(task, name)` pairs.
    pub(crate) fn orphans(&self) -> Vec<(TaskId, Option<Arc<str>>)> {
        self.inner
            .state
            .lock()
            .expect("scope lock poisoned")
            .entries
            .iter()
            .filter(|entry| !entry.record.is_terminal())
            .map(|entry| (entry.record.id(), entry.record.name()))
            .collect()
    }

    /// Entries whose work future has not yet settled: `(task, name,
    /// canceled_at)` triples for the strict-cancellation watchdog.
    pub(crate) fn unsettled_work(&self) -> Vec<(TaskId, Option<Arc<str>>, Option<Time>)> {
        self.inner
            .state
            .lock()
            .expect("scope lock poisoned")
            .entries
            .iter()
            .filter(|entry| !entry.work_settled.load(Ordering::SeqCst))
            .map(|entry| {
                (
                    entry.record.id(),
                    entry.record.name(),
                    entry.record.ended_at(),
                )
            })
            .collect()
    }

}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("aborted", &self.inner.signal.is_aborted())
            .finish_non_exhaustive()
    }
}

/// Runs `f` inside a fresh scope and closes the scope on the way out.
///
/// When `parent` is supplied, the parent's abort propagates to this scope
/// with the parent's reason. On exit — resolve or reject — strict mode (when
/// enabled) warns for every task still non-terminal, then the scope closes,
/// cancelling any such stragglers, and `f`'s outcome is returned.
pub async fn run_in_scope<T, F, Fut>(f: F, parent: Option<&Scope>) -> Result<T>
where
    F: FnOnce(Scope) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let scope = Scope::new(ScopeKind::Plain, parent);
    let store = ScopeStore::for_scope(scope.clone());
    if let Some(watch) = store.watch() {
        strict::arm_watch(&scope, &watch);
    }
    let body_scope = scope.clone();
    let result = WithStore::new(store, async move { f(body_scope).await }).await;

    let mut strict_failure = None;
    if strict::is_enabled() {
        for (task, name) in scope.orphans() {
            let err = strict::check_reportable(Violation::OrphanedTask {
                task,
                name,
                scope: scope.id(),
            });
            if let Some(err) = err {
                strict_failure.get_or_insert(err);
            }
        }
    }
    scope.close();
    match strict_failure {
        Some(err) => Err(err),
        None => result,
    }
}
