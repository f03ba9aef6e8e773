//! Strict mode: misuse checks and the cancellation watchdog.
//!
//! Strict mode makes the easy-to-ignore failure modes of unstructured async
//! loud. Checks fire at exactly four points:
//!
//! 1. a task started with no signal and no ambient scope (unstructured);
//! 2. a task cancelled with zero `on_cancel` handlers (ignored cancellation);
//! 3. non-terminal tasks found when a scope exits (orphans);
//! 4. `branch` used without a parent scope.
//!
//! Two policies: warn (structured `tracing` warning plus the registered
//! callback) and panic, which surfaces a [`StrictModeError`]. Sites with a
//! `Result` channel return the error instead of panicking.

use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::context::{ScopeStore, WithStore};
use crate::error::{Error, Result};
use crate::runtime::Handle;
use crate::scope::{Scope, ScopeKind};
use crate::types::{ScopeId, TaskId};

/// A strict-mode violation surfaced under the panic policy.
#[derive(Debug, Clone, thiserror::Error)]
#[error("strict mode violation: {message}")]
pub struct StrictModeError {
    message: String,
}

impl StrictModeError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The violation description.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// What happens when a strict-mode check fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrictPolicy {
    /// Emit a warning and continue.
    #[default]
    Warn,
    /// Panic with a [`StrictModeError`] (or return it where a `Result`
    /// channel exists).
    Panic,
}

/// Options for [`enable_strict_mode`].
#[derive(Default)]
pub struct StrictOptions {
    policy: StrictPolicy,
    on_warn: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl StrictOptions {
    /// The default option set: warn policy, no callback.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects the policy.
    #[must_use]
    pub fn policy(mut self, policy: StrictPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Registers a callback invoked with every warning message.
    #[must_use]
    pub fn on_warn(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_warn = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for StrictOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrictOptions")
            .field("policy", &self.policy)
            .field("on_warn", &self.on_warn.is_some())
            .finish()
    }
}

const MODE_OFF: u8 = 0;
const MODE_WARN: u8 = 1;
const MODE_PANIC: u8 = 2;

static MODE: AtomicU8 = AtomicU8::new(MODE_OFF);
static ON_WARN: Mutex<Option<Arc<dyn Fn(&str) + Send + Sync>>> = Mutex::new(None);

/// Enables strict mode process-wide.
pub fn enable_strict_mode(options: StrictOptions) {
    *ON_WARN.lock().unwrap_or_else(PoisonError::into_inner) = options.on_warn;
    let mode = match options.policy {
        StrictPolicy::Warn => MODE_WARN,
        StrictPolicy::Panic => MODE_PANIC,
    };
    MODE.store(mode, Ordering::Relaxed);
}

/// Disables strict mode.
pub fn disable_strict_mode() {
    MODE.store(MODE_OFF, Ordering::Relaxed);
    *ON_WARN.lock().unwrap_or_else(PoisonError::into_inner) = None;
}

pub(crate) fn is_enabled() -> bool {
    MODE.load(Ordering::Relaxed) != MODE_OFF
}

/// A strict-mode violation, described at its check site.
#[derive(Debug, Clone)]
pub(crate) enum Violation {
    /// `run_task` with no signal and no ambient scope.
    UnstructuredTask {
        task: TaskId,
        name: Option<Arc<str>>,
    },
    /// A task cancelled with zero `on_cancel` handlers.
    IgnoredCancellation {
        task: TaskId,
        name: Option<Arc<str>>,
    },
    /// A non-terminal task found at scope exit.
    OrphanedTask {
        task: TaskId,
        name: Option<Arc<str>>,
        scope: ScopeId,
    },
    /// `branch` used without a parent scope.
    BranchWithoutParent,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnstructuredTask { task, name } => write!(
                f,
                "task {task}{} started outside any scope and without a signal",
                display_name(name)
            ),
            Self::IgnoredCancellation { task, name } => write!(
                f,
                "task {task}{} was canceled with no on_cancel handler",
                display_name(name)
            ),
            Self::OrphanedTask { task, name, scope } => write!(
                f,
                "scope {scope} exited while task {task}{} was still running",
                display_name(name)
            ),
            Self::BranchWithoutParent => {
                write!(f, "branch used without a parent scope; running degraded")
            }
        }
    }
}

fn display_name(name: &Option<Arc<str>>) -> String {
    match name {
        Some(name) => format!(" ({name})"),
        None => String::new(),
    }
}

fn emit_warning(message: &str) {
    tracing::warn!(target: "taskscope::strict", "{message}");
    let callback = ON_WARN
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    if let Some(callback) = callback {
        callback(message);
    }
}

/// Applies the active policy at a check site with no `Result` channel.
pub(crate) fn check(violation: Violation) {
    match MODE.load(Ordering::Relaxed) {
        MODE_WARN => emit_warning(&violation.to_string()),
        MODE_PANIC => {
            let err = StrictModeError::new(violation.to_string());
            panic!("{err}");
        }
        _ => {}
    }
}

/// Applies the active policy where the caller can return an error instead
/// of panicking. Returns `Some` under the panic policy.
pub(crate) fn check_reportable(violation: Violation) -> Option<Error> {
    match MODE.load(Ordering::Relaxed) {
        MODE_WARN => {
            emit_warning(&violation.to_string());
            None
        }
        MODE_PANIC => {
            let message = StrictModeError::new(violation.to_string()).to_string();
            emit_warning(&message);
            Some(Error::strict(message))
        }
        _ => None,
    }
}

/// Watch configuration carried on the scope store by
/// [`with_strict_cancellation`]; inherited by every scope opened inside.
#[derive(Debug, Clone)]
pub(crate) struct StrictWatch {
    pub(crate) warn_after: Duration,
}

/// Arms the development-only watchdog: once the scope aborts, any entry
/// whose work has not settled within `warn_after` gets a single warning
/// naming the task and the elapsed time.
pub(crate) fn arm_watch(scope: &Scope, watch: &Rc<StrictWatch>) {
    if !cfg!(debug_assertions) {
        return;
    }
    let warn_after = watch.warn_after;
    let watched = scope.clone();
    scope.signal().on_abort(move |_reason| {
        if watched.unsettled_work().is_empty() {
            return;
        }
        let Some(handle) = Handle::current() else {
            return;
        };
        let watched = watched.clone();
        handle.spawn(async move {
            crate::time::sleep(warn_after).await;
            let now = Handle::expect_current("cancellation watchdog").now();
            for (task, name, canceled_at) in watched.unsettled_work() {
                let elapsed = canceled_at.map_or(Duration::ZERO, |at| now.duration_since(at));
                emit_warning(&format!(
                    "task {task}{} has not settled {} ms after cancellation",
                    display_name(&name),
                    elapsed.as_millis()
                ));
            }
        });
    });
}

/// Options for [`with_strict_cancellation`].
#[derive(Debug, Clone)]
pub struct StrictCancellationOptions {
    warn_after: Duration,
}

impl StrictCancellationOptions {
    /// The default watchdog delay: two seconds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            warn_after: Duration::from_secs(2),
        }
    }

    /// How long a cancelled task may keep running before it is reported.
    #[must_use]
    pub fn warn_after(mut self, warn_after: Duration) -> Self {
        self.warn_after = warn_after;
        self
    }
}

impl Default for StrictCancellationOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `f` in a scope that watches cancelled tasks.
///
/// Scopes opened inside inherit the watch through the ambient store, so a
/// `sync`/`race` closing deep inside the body still arms the watchdog for
/// its own entries. The watchdog is development-only: release builds
/// (without `debug_assertions`) never arm the timer.
pub async fn with_strict_cancellation<T, F, Fut>(
    f: F,
    options: StrictCancellationOptions,
) -> Result<T>
where
    F: FnOnce(Scope) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let parent = ScopeStore::current_scope();
    let scope = Scope::new(ScopeKind::Plain, parent.as_ref());
    let watch = Rc::new(StrictWatch {
        warn_after: options.warn_after,
    });
    let store = ScopeStore::for_scope_with_watch(scope.clone(), watch.clone());
    arm_watch(&scope, &watch);
    let body_scope = scope.clone();
    let result = WithStore::new(store, async move { f(body_scope).await }).await;
    scope.close();
    result
}
