//! Error types and error handling strategy for Taskscope.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Cancellation is an error kind carrying the structured [`CancelReason`],
//!   not an exception bolted on afterwards
//! - Hook and subscriber panics are isolated and never alter a task outcome

use core::fmt;
use std::sync::Arc;

use crate::types::CancelReason;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Operation was cancelled; the structured reason is attached.
    Canceled,
    /// A timeout elapsed before the work completed.
    Timeout,
    /// A first-settle combinator was given a callback that started no tasks.
    NoTasks,
    /// The task's work panicked.
    Panicked,
    /// A strict-mode violation surfaced under the throw policy.
    Strict,
    /// User-provided error.
    User,
    /// Internal invariant violation (bug).
    Internal,
}

/// The main error type for Taskscope operations.
///
/// Carries a kind, an optional deterministic message, the cancel reason when
/// the kind is [`ErrorKind::Canceled`], the name of the task the error passed
/// through (when that task was named), and an optional source chain.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    reason: Option<CancelReason>,
    task: Option<Arc<str>>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            reason: None,
            task: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self.kind, ErrorKind::Canceled)
    }

    /// Returns true if this error is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// Returns the cancel reason, when this error carries one.
    #[must_use]
    pub const fn cancel_reason(&self) -> Option<&CancelReason> {
        self.reason.as_ref()
    }

    /// Returns the name of the task this error passed through, if any.
    #[must_use]
    pub fn task_name(&self) -> Option<&str> {
        self.task.as_deref()
    }

    /// Adds deterministic message text to the error.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Annotates the error with the name of the task it passed through.
    ///
    /// The first annotation wins; re-annotating through an outer task keeps
    /// the innermost name.
    #[must_use]
    pub fn with_task_name(mut self, name: Arc<str>) -> Self {
        if self.task.is_none() {
            self.task = Some(name);
        }
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Creates a cancellation error from a structured reason.
    #[must_use]
    pub fn canceled(reason: CancelReason) -> Self {
        let mut err = Self::new(ErrorKind::Canceled).with_message(format!("canceled: {reason}"));
        err.reason = Some(reason);
        err
    }

    /// Creates a timeout error for the given effective budget.
    ///
    /// The message shape is stable: `Timeout after {ms} ms`.
    #[must_use]
    pub fn timeout(effective: std::time::Duration) -> Self {
        Self::new(ErrorKind::Timeout)
            .with_message(format!("Timeout after {} ms", effective.as_millis()))
    }

    /// Creates the error for a first-settle combinator whose callback started
    /// no tasks. The message shape is stable:
    /// `{combinator}: callback did not start any tasks`.
    #[must_use]
    pub fn no_tasks(combinator: &str) -> Self {
        Self::new(ErrorKind::NoTasks)
            .with_message(format!("{combinator}: callback did not start any tasks"))
    }

    /// Creates a user error from a message.
    #[must_use]
    pub fn user(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::User).with_message(message)
    }

    /// Creates an error from a panic payload.
    #[must_use]
    pub(crate) fn panicked(payload: &(dyn std::any::Any + Send)) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned());
        match detail {
            Some(msg) => Self::new(ErrorKind::Panicked).with_message(format!("panicked: {msg}")),
            None => Self::new(ErrorKind::Panicked).with_message("panicked"),
        }
    }

    /// Creates a strict-mode error from a violation message.
    #[must_use]
    pub(crate) fn strict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Strict).with_message(message)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{msg}")?,
            None => write!(f, "{:?}", self.kind)?,
        }
        if let Some(task) = &self.task {
            write!(f, " (task {task})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<crate::strict::StrictModeError> for Error {
    fn from(e: crate::strict::StrictModeError) -> Self {
        Self::strict(e.to_string())
    }
}

/// A specialized Result type for Taskscope operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;
    use std::time::Duration;

    #[derive(Debug)]
    struct Underlying;

    impl fmt::Display for Underlying {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "underlying")
        }
    }

    impl std::error::Error for Underlying {}

    #[test]
    fn display_without_message() {
        let err = Error::new(ErrorKind::Internal);
        assert_eq!(err.to_string(), "Internal");
    }

    #[test]
    fn timeout_message_is_stable() {
        let err = Error::timeout(Duration::from_millis(100));
        assert_eq!(err.to_string(), "Timeout after 100 ms");
        assert!(err.is_timeout());
    }

    #[test]
    fn no_tasks_message_is_stable() {
        let err = Error::no_tasks("race");
        assert_eq!(err.to_string(), "race: callback did not start any tasks");
        assert_eq!(err.kind(), ErrorKind::NoTasks);
    }

    #[test]
    fn canceled_carries_reason() {
        let err = Error::canceled(CancelReason::ScopeClosed);
        assert!(err.is_canceled());
        assert_eq!(err.cancel_reason(), Some(&CancelReason::ScopeClosed));
    }

    #[test]
    fn task_name_first_annotation_wins() {
        let err = Error::user("boom")
            .with_task_name(Arc::from("inner"))
            .with_task_name(Arc::from("outer"));
        assert_eq!(err.task_name(), Some("inner"));
        assert_eq!(err.to_string(), "boom (task inner)");
    }

    #[test]
    fn source_chain_is_exposed() {
        let err = Error::user("outer").with_source(Underlying);
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
    }
}
