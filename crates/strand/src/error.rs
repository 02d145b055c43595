//! Error types for the strand runtime.

use std::any::Any;
use std::fmt;

use thiserror::Error;

/// Result alias used throughout the runtime.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can surface from runtime operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The enclosing cancel scope has been cancelled.
    ///
    /// This never surfaces past the scope that initiated the cancellation;
    /// it is either translated to [`Error::TimedOut`] or absorbed at that
    /// scope's boundary.
    #[error("the enclosing cancel scope has been cancelled")]
    Cancelled,

    /// A scope's deadline expired.
    #[error("the operation timed out")]
    TimedOut,

    /// Two or more tasks in a group failed.
    #[error(transparent)]
    Group(#[from] ExceptionGroup),

    /// A task was spawned into a group that is no longer accepting tasks.
    #[error("this task group is not active; no new tasks can be spawned")]
    NotActive,

    /// A resource was closed while another task was waiting on it.
    #[error("the resource was closed by another task")]
    ClosedResource,

    /// A task or offloaded callable panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// An application-level failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether this error is a cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

const SEPARATOR: &str = "----------------------------";

/// Raised when multiple failures were collected by a task group.
///
/// Holds the individual failures in the order the group's join observed
/// them. A group that collected exactly one failure re-raises it unwrapped
/// instead of producing an `ExceptionGroup`.
#[derive(Debug)]
pub struct ExceptionGroup {
    exceptions: Vec<Error>,
}

impl ExceptionGroup {
    pub(crate) fn new(exceptions: Vec<Error>) -> Self {
        Self { exceptions }
    }

    /// The individual failures, in observation order.
    pub fn exceptions(&self) -> &[Error] {
        &self.exceptions
    }

    /// The number of collected failures.
    pub fn len(&self) -> usize {
        self.exceptions.len()
    }

    /// Always false for a group produced by a task group join.
    pub fn is_empty(&self) -> bool {
        self.exceptions.is_empty()
    }
}

impl fmt::Display for ExceptionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} exceptions were raised in the task group:",
            self.exceptions.len()
        )?;
        for exception in &self.exceptions {
            write!(f, "\n{SEPARATOR}\n{exception}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ExceptionGroup {}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Cancelled;
        assert_eq!(err.to_string(), "the enclosing cancel scope has been cancelled");

        let err = Error::Panicked("something went wrong".to_string());
        assert_eq!(err.to_string(), "task panicked: something went wrong");

        let err = Error::NotActive;
        assert_eq!(
            err.to_string(),
            "this task group is not active; no new tasks can be spawned"
        );
    }

    #[test]
    fn test_exception_group_display() {
        let group = ExceptionGroup::new(vec![
            Error::Other(anyhow::anyhow!("first failure")),
            Error::TimedOut,
        ]);

        let rendered = group.to_string();
        assert!(rendered.starts_with("2 exceptions were raised in the task group:"));
        assert!(rendered.contains("first failure"));
        assert!(rendered.contains("the operation timed out"));
    }

    #[test]
    fn test_exception_group_preserves_order() {
        let group = ExceptionGroup::new(vec![
            Error::Other(anyhow::anyhow!("a")),
            Error::Other(anyhow::anyhow!("b")),
        ]);

        let messages: Vec<String> =
            group.exceptions().iter().map(ToString::to_string).collect();
        assert_eq!(messages, vec!["a", "b"]);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom".to_string())), "boom");
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(42_u32)), "unknown panic");
    }
}
