//! The executor: `block_on`, the spawner, and the thread-current handle.
//!
//! The runtime owns every spawned future; wakers only ever touch the shared
//! ready queue, the timer heap, and the clock. Spawns performed while a task
//! is being polled land in a thread-local injection queue that the loop
//! drains before picking the next task, so a spawn is visible to the
//! scheduler in the same iteration.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;

use super::clock::Clock;
use super::scheduler::Scheduler;
use super::stored_task::StoredTask;
use super::timer::TimerSlot;
use crate::types::{Time, TaskId};

thread_local! {
    static CURRENT: RefCell<Option<Handle>> = const { RefCell::new(None) };
    static INJECTED: RefCell<Vec<(TaskId, StoredTask)>> = const { RefCell::new(Vec::new()) };
}

pub(crate) struct Shared {
    sched: Mutex<Scheduler>,
    idle: Condvar,
    timers: Mutex<super::timer::TimerHeap>,
    clock: Clock,
    next_task: AtomicU64,
}

impl Shared {
    fn new(clock: Clock) -> Arc<Self> {
        Arc::new(Self {
            sched: Mutex::new(Scheduler::new()),
            idle: Condvar::new(),
            timers: Mutex::new(super::timer::TimerHeap::new()),
            clock,
            next_task: AtomicU64::new(1),
        })
    }

    fn schedule(&self, task: TaskId) {
        let newly = self
            .sched
            .lock()
            .expect("scheduler lock poisoned")
            .schedule(task);
        if newly {
            self.idle.notify_one();
        }
    }

    fn waker_for(self: &Arc<Self>, task: TaskId) -> Waker {
        Waker::from(Arc::new(TaskWaker {
            task,
            shared: self.clone(),
        }))
    }

    /// Parks until the timeout elapses or a wake arrives. Returns promptly
    /// if something is already queued.
    fn park(&self, timeout: Option<Duration>) {
        let sched = self.sched.lock().expect("scheduler lock poisoned");
        if !sched.is_empty() {
            return;
        }
        match timeout {
            Some(dur) => {
                let _ = self
                    .idle
                    .wait_timeout(sched, dur)
                    .expect("scheduler lock poisoned");
            }
            None => {
                let _guard = self.idle.wait(sched).expect("scheduler lock poisoned");
            }
        }
    }
}

struct TaskWaker {
    task: TaskId,
    shared: Arc<Shared>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.shared.schedule(self.task);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.shared.schedule(self.task);
    }
}

/// A cloneable handle to the running executor.
///
/// Installed thread-locally for the duration of [`Runtime::block_on`];
/// spawning and timer registration go through the current handle.
#[derive(Clone)]
pub(crate) struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// The handle of the runtime currently driving this thread, if any.
    pub(crate) fn current() -> Option<Self> {
        CURRENT.with(|cell| cell.borrow().clone())
    }

    /// Like [`Handle::current`], panicking with a pointed message otherwise.
    pub(crate) fn expect_current(what: &str) -> Self {
        Self::current().unwrap_or_else(|| {
            panic!("{what} must be called from within a runtime (inside Runtime::block_on)")
        })
    }

    /// Current logical time.
    pub(crate) fn now(&self) -> Time {
        self.shared.clock.now()
    }

    /// Spawns a background future onto the executor.
    pub(crate) fn spawn(&self, future: impl Future<Output = ()> + 'static) -> TaskId {
        let id = self.allocate_task_id();
        self.spawn_with_id(id, future);
        id
    }

    /// Reserves a task id without spawning anything yet.
    pub(crate) fn allocate_task_id(&self) -> TaskId {
        TaskId(self.shared.next_task.fetch_add(1, Ordering::Relaxed))
    }

    /// Spawns a background future under a pre-allocated id.
    pub(crate) fn spawn_with_id(&self, id: TaskId, future: impl Future<Output = ()> + 'static) {
        INJECTED.with(|queue| queue.borrow_mut().push((id, StoredTask::new(future))));
        self.shared.schedule(id);
    }

    /// Registers a timer deadline, returning the slot to park a waker in.
    pub(crate) fn register_timer(&self, deadline: Time) -> Arc<TimerSlot> {
        self.shared
            .timers
            .lock()
            .expect("timer lock poisoned")
            .register(deadline)
    }
}

/// Restores the previous thread-current handle when dropped.
struct EnterGuard {
    prev: Option<Handle>,
}

impl EnterGuard {
    fn install(handle: Handle) -> Self {
        CURRENT.with(|cell| {
            let mut current = cell.borrow_mut();
            assert!(
                current.is_none(),
                "cannot nest Runtime::block_on on the same thread"
            );
            *current = Some(handle);
        });
        Self { prev: None }
    }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        CURRENT.with(|cell| {
            *cell.borrow_mut() = self.prev.take();
        });
        INJECTED.with(|queue| queue.borrow_mut().clear());
    }
}

/// Builder for a [`Runtime`].
#[derive(Debug, Default, Clone)]
pub struct RuntimeBuilder {
    virtual_clock: bool,
}

impl RuntimeBuilder {
    /// Creates a builder with the default (wall clock) configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects the virtual clock: idle periods advance time directly to the
    /// next timer deadline instead of sleeping.
    #[must_use]
    pub fn virtual_clock(mut self, enabled: bool) -> Self {
        self.virtual_clock = enabled;
        self
    }

    /// Builds the runtime.
    #[must_use]
    pub fn build(self) -> Runtime {
        let clock = if self.virtual_clock {
            Clock::virtual_clock()
        } else {
            Clock::wall()
        };
        Runtime {
            shared: Shared::new(clock),
        }
    }
}

/// The single-threaded cooperative runtime.
pub struct Runtime {
    shared: Arc<Shared>,
}

impl Runtime {
    /// Creates a wall-clock runtime.
    #[must_use]
    pub fn new() -> Self {
        RuntimeBuilder::new().build()
    }

    /// Creates a virtual-clock runtime for deterministic, instant execution
    /// of timer-driven scenarios.
    #[must_use]
    pub fn lab() -> Self {
        RuntimeBuilder::new().virtual_clock(true).build()
    }

    /// Current logical time of this runtime's clock.
    #[must_use]
    pub fn now(&self) -> Time {
        self.shared.clock.now()
    }

    /// Drives `future` to completion on this thread.
    ///
    /// Every task spawned while the future runs is driven alongside it;
    /// tasks still pending when the root future resolves are dropped.
    ///
    /// # Panics
    ///
    /// Panics when nested inside another `block_on` on the same thread, and
    /// on a virtual-clock runtime that stalls with no runnable tasks and no
    /// pending timers (a genuine deadlock).
    pub fn block_on<F: Future>(&mut self, future: F) -> F::Output {
        let _enter = EnterGuard::install(Handle {
            shared: self.shared.clone(),
        });
        let mut tasks: HashMap<u64, StoredTask> = HashMap::new();
        let mut future = pin!(future);
        self.shared.schedule(TaskId::ROOT);

        let output = loop {
            let injected: Vec<_> =
                INJECTED.with(|queue| queue.borrow_mut().drain(..).collect());
            for (id, task) in injected {
                tasks.insert(id.as_u64(), task);
            }

            let now = self.shared.clock.now();
            let due = self
                .shared
                .timers
                .lock()
                .expect("timer lock poisoned")
                .pop_due(now);
            for waker in due {
                waker.wake();
            }

            let popped = self.shared.sched.lock().expect("scheduler lock poisoned").pop();
            let Some(id) = popped else {
                let next_deadline = self
                    .shared
                    .timers
                    .lock()
                    .expect("timer lock poisoned")
                    .peek_deadline();
                match next_deadline {
                    Some(deadline) => {
                        if self.shared.clock.is_virtual() {
                            self.shared.clock.advance_to(deadline);
                        } else {
                            self.shared.park(Some(deadline.duration_since(now)));
                        }
                    }
                    None => {
                        assert!(
                            !self.shared.clock.is_virtual(),
                            "runtime stalled: no runnable tasks and no pending timers"
                        );
                        self.shared.park(None);
                    }
                }
                continue;
            };

            if id == TaskId::ROOT {
                let waker = self.shared.waker_for(id);
                let mut cx = Context::from_waker(&waker);
                if let Poll::Ready(out) = future.as_mut().poll(&mut cx) {
                    break out;
                }
            } else if let Some(task) = tasks.get_mut(&id.as_u64()) {
                let waker = self.shared.waker_for(id);
                let mut cx = Context::from_waker(&waker);
                if task.poll(&mut cx).is_ready() {
                    tasks.remove(&id.as_u64());
                }
            }
        };

        drop(tasks);
        self.shared
            .sched
            .lock()
            .expect("scheduler lock poisoned")
            .clear();
        self.shared
            .timers
            .lock()
            .expect("timer lock poisoned")
            .clear();
        output
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("virtual", &self.shared.clock.is_virtual())
            .finish_non_exhaustive()
    }
}
