//! Debug lifecycle events and the subscriber registry.
//!
//! Each event represents an observable action in the scope/task lifecycle.
//! Emission is zero-cost while debugging is disabled: one relaxed atomic
//! load guards event construction, so no event is built and no subscriber
//! is consulted. Subscriber panics are caught and logged; they never reach
//! the code that emitted the event.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::scope::ScopeKind;
use crate::types::{ScopeId, TaskId, TaskStatus, Time};

/// A lifecycle event emitted by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// A scope was opened by a combinator or `run_in_scope`.
    ScopeOpened {
        /// The scope's identifier.
        scope: ScopeId,
        /// The combinator family that opened it.
        kind: ScopeKind,
    },
    /// A scope closed.
    ScopeClosed {
        /// The scope's identifier.
        scope: ScopeId,
        /// The combinator family that opened it.
        kind: ScopeKind,
    },
    /// A task was created.
    TaskRegistered {
        /// The task's identifier.
        task: TaskId,
        /// The diagnostic name, if one was given.
        name: Option<Arc<str>>,
        /// The scope the task was created under, if any.
        parent_scope: Option<ScopeId>,
    },
    /// A task made a terminal transition.
    TaskUpdated {
        /// The task's identifier.
        task: TaskId,
        /// The new status.
        status: TaskStatus,
        /// When the task started running.
        started_at: Time,
        /// When the task reached the new status.
        ended_at: Option<Time>,
    },
}

impl TaskEvent {
    /// Stable, grep-friendly taxonomy name.
    #[must_use]
    pub const fn stable_name(&self) -> &'static str {
        match self {
            Self::ScopeOpened { .. } => "scope_opened",
            Self::ScopeClosed { .. } => "scope_closed",
            Self::TaskRegistered { .. } => "task_registered",
            Self::TaskUpdated { .. } => "task_updated",
        }
    }
}

type Subscriber = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

static ENABLED: AtomicBool = AtomicBool::new(false);
static NEXT_SUBSCRIBER: AtomicU64 = AtomicU64::new(1);
static SUBSCRIBERS: Mutex<Vec<(u64, Subscriber)>> = Mutex::new(Vec::new());

fn subscribers() -> std::sync::MutexGuard<'static, Vec<(u64, Subscriber)>> {
    SUBSCRIBERS.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Enables debug event emission process-wide.
pub fn enable_task_debug() {
    ENABLED.store(true, Ordering::Relaxed);
}

/// Disables debug event emission; events are no longer built.
pub fn disable_task_debug() {
    ENABLED.store(false, Ordering::Relaxed);
}

/// A registered subscription; call
/// [`unsubscribe`](DebugSubscription::unsubscribe) to remove the callback.
#[derive(Debug)]
pub struct DebugSubscription {
    id: u64,
}

impl DebugSubscription {
    /// Removes the subscribed callback.
    pub fn unsubscribe(self) {
        subscribers().retain(|(id, _)| *id != self.id);
    }
}

/// Registers a callback invoked for every emitted event.
///
/// The callback only fires while debugging is enabled (see
/// [`enable_task_debug`]). Panicking callbacks are caught and logged.
pub fn subscribe_task_debug(
    callback: impl Fn(&TaskEvent) + Send + Sync + 'static,
) -> DebugSubscription {
    let id = NEXT_SUBSCRIBER.fetch_add(1, Ordering::Relaxed);
    subscribers().push((id, Arc::new(callback)));
    DebugSubscription { id }
}

/// Emits an event when debugging is enabled. The closure only runs on the
/// enabled path, so disabled emission costs a single atomic load.
pub(crate) fn emit(build: impl FnOnce() -> TaskEvent) {
    if !ENABLED.load(Ordering::Relaxed) {
        return;
    }
    let event = build();
    tracing::debug!(event = event.stable_name(), detail = ?event, "task debug event");
    let snapshot: Vec<Subscriber> = subscribers().iter().map(|(_, s)| s.clone()).collect();
    for subscriber in snapshot {
        if catch_unwind(AssertUnwindSafe(|| subscriber(&event))).is_err() {
            tracing::warn!(
                event = event.stable_name(),
                "task debug subscriber panicked; continuing"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    // These tests mutate the process-wide flag; they serialize through the
    // shared guard in test_util. Subscribers filter on synthetic marker
    // scope ids so events from concurrently running tests are ignored.

    fn is_marker(event: &TaskEvent, marker: u64) -> bool {
        matches!(
            event,
            TaskEvent::ScopeOpened { scope, .. } | TaskEvent::ScopeClosed { scope, .. }
                if scope.as_u64() == marker
        )
    }

    #[test]
    fn disabled_emission_never_builds_the_event() {
        let _serial = crate::test_util::serial_guard();
        disable_task_debug();
        let built = AtomicUsize::new(0);
        emit(|| {
            built.fetch_add(1, Ordering::SeqCst);
            TaskEvent::ScopeOpened {
                scope: ScopeId(990_001),
                kind: ScopeKind::Sync,
            }
        });
        assert_eq!(built.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscribers_observe_events_while_enabled() {
        let _serial = crate::test_util::serial_guard();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = subscribe_task_debug(move |event| {
            if is_marker(event, 990_002) {
                sink.lock().expect("sink").push(event.stable_name());
            }
        });
        enable_task_debug();
        emit(|| TaskEvent::ScopeOpened {
            scope: ScopeId(990_002),
            kind: ScopeKind::Race,
        });
        emit(|| TaskEvent::ScopeClosed {
            scope: ScopeId(990_002),
            kind: ScopeKind::Race,
        });
        disable_task_debug();
        sub.unsubscribe();
        assert_eq!(
            *seen.lock().expect("sink"),
            vec!["scope_opened", "scope_closed"]
        );
    }

    #[test]
    fn panicking_subscriber_does_not_stop_emission() {
        let _serial = crate::test_util::serial_guard();
        let hits = Arc::new(AtomicUsize::new(0));
        let panicky = subscribe_task_debug(|event| {
            if is_marker(event, 990_003) {
                panic!("subscriber bug");
            }
        });
        let counter = hits.clone();
        let sub = subscribe_task_debug(move |event| {
            if is_marker(event, 990_003) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        enable_task_debug();
        emit(|| TaskEvent::ScopeOpened {
            scope: ScopeId(990_003),
            kind: ScopeKind::Rush,
        });
        disable_task_debug();
        panicky.unsubscribe();
        sub.unsubscribe();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
