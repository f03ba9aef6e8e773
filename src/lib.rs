//! Taskscope: structured concurrency for asynchronous Rust.
//!
//! # Overview
//!
//! Taskscope is built on the principle that no asynchronous work should
//! outlive the scope that started it. Every task belongs to a scope; when a
//! scope ends — normally, by failure, or by first-result — every task still
//! bound to it is cancelled before control returns to the caller.
//!
//! # Core Guarantees
//!
//! - **No orphan tasks**: every task started through a scope context is owned
//!   by that scope; the scope cancels stragglers when it closes
//! - **Cancel-correctness**: cancellation is a broadcast signal with a
//!   structured reason, never a silent drop; cleanup hooks run before any
//!   awaiter observes the rejection
//! - **First-failure wins**: a combinator rejects with the error that closed
//!   its scope, not with the consequent sibling cancellations
//! - **Deadline inheritance**: nested timeouts tighten monotonically through
//!   the ambient scope store
//! - **Deterministic testing**: a virtual-clock runtime executes timer-driven
//!   scenarios instantly and reproducibly
//!
//! # Module Structure
//!
//! - [`types`]: Core types (identifiers, logical time, cancel reasons, status)
//! - [`signal`]: One-shot broadcast cancellation source/signal
//! - [`runtime`]: Single-threaded cooperative executor and timer driver
//! - [`task`]: Task lifecycle, cancel hooks, and the awaitable handle
//! - [`scope`]: Scope records and [`run_in_scope`]
//! - [`time`]: Sleep and deadline-inheriting timeout
//! - [`combinator`]: `sync`, `race`, `rush`, `branch`, `spawn`, helpers
//! - [`trace`]: Debug lifecycle events and the subscriber registry
//! - [`strict`]: Strict-mode checks and the cancellation watchdog
//! - [`error`]: Error types
//! - [`test_util`]: Logging init and deterministic test runners

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod combinator;
pub(crate) mod context;
pub mod error;
pub mod runtime;
pub mod scope;
pub mod signal;
pub mod strict;
pub mod task;
pub mod test_util;
pub mod time;
pub mod trace;
pub mod types;

pub use combinator::{
    branch, join_all, join_all_settled, race, race_settled, rush, spawn, spawn_detached,
    spawn_scope, sync, Backoff, Ctx, Limiter, LimitOptions, RaceCtx, RetryPolicy,
};
pub use error::{Error, ErrorKind, Result};
pub use runtime::{Runtime, RuntimeBuilder};
pub use scope::{run_in_scope, Scope, ScopeKind};
pub use signal::{CancelSignal, CancelSource, ListenerId};
pub use strict::{
    enable_strict_mode, with_strict_cancellation, StrictCancellationOptions, StrictModeError,
    StrictOptions, StrictPolicy,
};
pub use task::{run_task, LifecycleHooks, TaskHandle, TaskOptions};
pub use time::{sleep, sleep_cancellable, timeout, Sleep};
pub use trace::{enable_task_debug, subscribe_task_debug, DebugSubscription, TaskEvent};
pub use types::{CancelReason, ScopeId, TaskId, TaskStatus, Time};
