//! Structured cancellation reasons.
//!
//! Cancellation in Taskscope is a first-class protocol, not a silent drop.
//! Every abort carries a reason describing why the work was asked to stop;
//! the first abort of a source fixes the reason for all observers.

use core::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The reason for a cancellation.
///
/// User-supplied reasons pass through the propagation machinery unchanged;
/// the crate itself only produces reasons at well-defined sites: timeouts,
/// scope closure, and parent-to-child bridging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// A timeout fired after the given effective budget.
    Timeout {
        /// The effective budget that elapsed (after deadline inheritance).
        after: Duration,
    },
    /// User code aborted the scope, with an optional message.
    UserAbort {
        /// Free-form context supplied by the aborting caller.
        message: Option<Arc<str>>,
    },
    /// The owning scope closed.
    ScopeClosed,
    /// The parent was cancelled; carries the parent task's name when known.
    ParentCanceled {
        /// Diagnostic name of the parent task, if it had one.
        parent: Option<Arc<str>>,
    },
}

impl CancelReason {
    /// Creates a timeout reason for the given effective budget.
    #[must_use]
    pub const fn timeout(after: Duration) -> Self {
        Self::Timeout { after }
    }

    /// Creates a user-abort reason without a message.
    #[must_use]
    pub const fn user_abort() -> Self {
        Self::UserAbort { message: None }
    }

    /// Creates a user-abort reason with a message.
    #[must_use]
    pub fn user_abort_with(message: impl Into<Arc<str>>) -> Self {
        Self::UserAbort {
            message: Some(message.into()),
        }
    }

    /// Creates a parent-canceled reason naming the parent task.
    #[must_use]
    pub fn parent_canceled(parent: Option<Arc<str>>) -> Self {
        Self::ParentCanceled { parent }
    }

    /// Returns true if this reason is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if this reason is a scope closure.
    #[must_use]
    pub const fn is_scope_closed(&self) -> bool {
        matches!(self, Self::ScopeClosed)
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { after } => write!(f, "timeout after {} ms", after.as_millis()),
            Self::UserAbort { message: None } => write!(f, "user abort"),
            Self::UserAbort {
                message: Some(msg),
            } => write!(f, "user abort: {msg}"),
            Self::ScopeClosed => write!(f, "scope closed"),
            Self::ParentCanceled { parent: None } => write!(f, "parent canceled"),
            Self::ParentCanceled {
                parent: Some(name),
            } => write!(f, "parent canceled: {name}"),
        }
    }
}
