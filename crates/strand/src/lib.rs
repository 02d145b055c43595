//! strand — structured concurrency on a single-threaded cooperative event
//! loop.
//!
//! This crate provides:
//! - [`run`] - drive an event loop to completion
//! - [`CancelScope`] / [`open_cancel_scope`] - nested cancellable regions
//!   with deadlines and shielding
//! - [`fail_after`] / [`move_on_after`] - deadline-bounded scopes
//! - [`TaskGroup`] / [`create_task_group`] - scope-anchored nurseries that
//!   await all children and aggregate failures
//! - [`run_in_thread`] / [`run_async_from_thread`] - thread offload
//! - [`Lock`], [`Event`], [`Semaphore`], [`Queue`] - checkpointed
//!   synchronization primitives
//!
//! # Model
//!
//! Tasks on one loop run serially; context switches happen only at
//! suspension points, and every suspension point begins with a cancellation
//! checkpoint. Cancellation is requested on *scopes*, never on tasks
//! directly: cancelling a scope reaches exactly the tasks currently
//! executing inside it, stopping at shielded subscopes, and surfaces at the
//! affected tasks' next checkpoints. A task group does not return until all
//! of its children have terminated, whatever they terminated with.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! let outcome = strand::run(|| async {
//!     strand::fail_after(Duration::from_millis(100), false, |_scope| async {
//!         strand::sleep(Duration::from_secs(1)).await
//!     })
//!     .await
//! });
//! assert!(matches!(outcome, Err(strand::Error::TimedOut)));
//! ```

pub mod channel;
pub mod error;
pub mod executor;
#[cfg(unix)]
pub mod net;
pub mod pool;
mod registry;
pub mod scope;
#[cfg(unix)]
pub mod signal;
pub mod sync;
pub mod task;
mod timer;

pub use channel::{bounded, unbounded, Queue, Receiver, Sender};
pub use error::{Error, ExceptionGroup, Result};
pub use executor::{run, run_with_config, sleep, wait_all_tasks_blocked};
#[cfg(unix)]
pub use net::{wait_socket_readable, wait_socket_writable};
pub use pool::{run_async_from_thread, run_in_thread};
pub use registry::TaskId;
pub use scope::{
    check_cancelled, current_effective_deadline, fail_after, move_on_after, open_cancel_scope,
    CancelScope,
};
#[cfg(unix)]
pub use signal::{receive_signals, SignalReceiver};
pub use sync::{Event, Lock, LockGuard, Semaphore, SemaphorePermit};
pub use task::{create_task_group, TaskGroup};

/// Configuration for the event loop.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Log loop lifecycle events at debug level.
    pub debug: bool,
    /// Name prefix for offload worker threads.
    pub thread_name_prefix: String,
    /// Stack size for offload worker threads (bytes).
    pub stack_size: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            debug: false,
            thread_name_prefix: "strand".to_string(),
            stack_size: None,
        }
    }
}

impl RuntimeConfig {
    /// Create a new configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable debug logging of loop lifecycle events.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Set the name prefix for offload worker threads.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the stack size for offload worker threads.
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_config_default() {
        let config = RuntimeConfig::default();
        assert!(!config.debug);
        assert_eq!(config.thread_name_prefix, "strand");
        assert!(config.stack_size.is_none());
    }

    #[test]
    fn test_runtime_config_builder() {
        let config = RuntimeConfig::new()
            .with_debug(true)
            .with_thread_name_prefix("custom")
            .with_stack_size(1024 * 1024);

        assert!(config.debug);
        assert_eq!(config.thread_name_prefix, "custom");
        assert_eq!(config.stack_size, Some(1024 * 1024));
    }
}
