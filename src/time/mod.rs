//! Sleep and timeout primitives.
//!
//! Both are clock-agnostic: they register deadlines with the running
//! executor, which resolves them against the wall clock in production and
//! the virtual clock in the lab runtime.

pub mod sleep;
pub mod timeout;

pub use sleep::{sleep, sleep_cancellable, Sleep};
pub use timeout::timeout;
