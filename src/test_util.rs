//! Test utilities.
//!
//! Shared helpers for unit and integration tests:
//! - consistent tracing-based logging initialization
//! - a deterministic runner over the virtual-clock runtime
//! - a process-wide guard serializing tests that mutate global flags
//!   (strict mode, debug events)

use std::future::Future;
use std::sync::{Mutex, MutexGuard, Once, PoisonError};

use crate::runtime::Runtime;

static INIT_LOGGING: Once = Once::new();
static SERIAL: Mutex<()> = Mutex::new(());

/// Initializes test logging with trace-level output.
///
/// Safe to call multiple times; only the first call takes effect.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Serializes tests that mutate process-wide flags.
///
/// Poisoning is ignored: a panicking strict-mode test must not wedge the
/// rest of the suite.
pub fn serial_guard() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs async test code on a fresh virtual-clock runtime.
///
/// Timer-driven scenarios execute instantly and deterministically.
pub fn run_test<F, Fut>(f: F) -> Fut::Output
where
    F: FnOnce() -> Fut,
    Fut: Future,
{
    init_test_logging();
    Runtime::lab().block_on(f())
}
