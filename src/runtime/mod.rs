//! Single-threaded cooperative executor.
//!
//! Scheduling is cooperative on an event loop: work suspends at await
//! points, and all internal state mutation happens between suspensions. The
//! executor owns the stored task futures; shared state visible to wakers is
//! limited to the ready queue, the timer heap, and the clock.
//!
//! Two clock modes with identical scheduling behavior:
//! - wall clock ([`Runtime::new`]): idle waits park until the next timer
//!   deadline or an external wake
//! - virtual clock ([`Runtime::lab`]): idle advances time directly to the
//!   next deadline, so timer-driven scenarios execute instantly and
//!   deterministically

pub(crate) mod clock;
pub(crate) mod executor;
pub(crate) mod scheduler;
pub(crate) mod stored_task;
pub(crate) mod timer;

pub use executor::{Runtime, RuntimeBuilder};
pub(crate) use executor::Handle;
