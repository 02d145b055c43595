//! Per-task bookkeeping for the cooperative loop.
//!
//! The registry is the runtime's replacement for task-local storage: for
//! every managed task it keeps a control block (pending cancellation,
//! blocked flag, diagnostic name) and, separately, the task's *current*
//! cancel scope. The scope map follows strict stack discipline: an entry is
//! inserted when a task opens its outermost scope, overwritten on nested
//! entry, and deleted when the outermost scope exits.
//!
//! All state here is confined to the loop thread. Code running on worker
//! threads never touches the registry; it communicates back through the
//! channels in [`crate::pool`].

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use tokio::sync::Notify;
use tracing::trace;

use crate::scope::ScopeInner;

/// Unique identifier of a task on the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) tokio::task::Id);

impl TaskId {
    /// The identity of the task this code is running in, if any.
    pub fn current() -> Option<TaskId> {
        tokio::task::try_id().map(TaskId)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Control block for a managed task.
pub(crate) struct TaskControl {
    /// Set when a cancel scope has requested this task's cancellation and
    /// the task has not yet observed it.
    cancel_requested: Cell<bool>,
    /// Wakes the task's parked suspension point, if any.
    cancel_notify: Notify,
    /// True while the task is parked inside a checkpointed suspension.
    blocked: Cell<bool>,
    name: Option<String>,
}

impl TaskControl {
    fn new(name: Option<&str>) -> Self {
        Self {
            cancel_requested: Cell::new(false),
            cancel_notify: Notify::new(),
            blocked: Cell::new(false),
            name: name.map(str::to_owned),
        }
    }

    /// Flag the task for cancellation and wake its suspension point.
    pub(crate) fn request_cancel(&self) {
        trace!(task = self.name().unwrap_or("<unnamed>"), "cancellation requested");
        self.cancel_requested.set(true);
        self.cancel_notify.notify_one();
    }

    /// Consume a pending cancellation request.
    pub(crate) fn take_cancel(&self) -> bool {
        self.cancel_requested.replace(false)
    }

    /// Drop a pending cancellation request without delivering it.
    pub(crate) fn discard_cancel(&self) {
        self.cancel_requested.set(false);
    }

    /// Wait until a cancellation request arrives, consuming it.
    pub(crate) async fn cancelled(&self) {
        loop {
            if self.take_cancel() {
                return;
            }
            self.cancel_notify.notified().await;
        }
    }

    pub(crate) fn is_blocked(&self) -> bool {
        self.blocked.get()
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

#[derive(Default)]
struct Registry {
    /// Current cancel scope per task; an entry exists only while the task
    /// has at least one open scope.
    scopes: HashMap<TaskId, Rc<ScopeInner>>,
    /// Control blocks for every managed task.
    tasks: HashMap<TaskId, Rc<TaskControl>>,
}

thread_local! {
    static REGISTRY: RefCell<Registry> = RefCell::new(Registry::default());
}

/// Add a task to the registry, creating its control block.
pub(crate) fn register(task: TaskId, name: Option<&str>) -> Rc<TaskControl> {
    let control = Rc::new(TaskControl::new(name));
    REGISTRY.with(|registry| {
        registry
            .borrow_mut()
            .tasks
            .insert(task, Rc::clone(&control));
    });
    control
}

/// Remove a task's control block and scope binding.
pub(crate) fn deregister(task: TaskId) {
    REGISTRY.with(|registry| {
        let mut registry = registry.borrow_mut();
        registry.tasks.remove(&task);
        registry.scopes.remove(&task);
    });
}

pub(crate) fn control(task: TaskId) -> Option<Rc<TaskControl>> {
    REGISTRY.with(|registry| registry.borrow().tasks.get(&task).cloned())
}

pub(crate) fn current_control() -> Option<Rc<TaskControl>> {
    TaskId::current().and_then(control)
}

/// The task's current (innermost) cancel scope.
pub(crate) fn current_scope(task: TaskId) -> Option<Rc<ScopeInner>> {
    REGISTRY.with(|registry| registry.borrow().scopes.get(&task).cloned())
}

/// Rebind the task's current scope. `None` deletes the entry: the
/// outermost scope has exited.
pub(crate) fn set_current_scope(task: TaskId, scope: Option<Rc<ScopeInner>>) {
    REGISTRY.with(|registry| {
        let mut registry = registry.borrow_mut();
        match scope {
            Some(scope) => {
                registry.scopes.insert(task, scope);
            }
            None => {
                registry.scopes.remove(&task);
            }
        }
    });
}

/// Snapshot of every managed task and its control block.
pub(crate) fn tasks() -> Vec<(TaskId, Rc<TaskControl>)> {
    REGISTRY.with(|registry| {
        registry
            .borrow()
            .tasks
            .iter()
            .map(|(task, control)| (*task, Rc::clone(control)))
            .collect()
    })
}

/// True when the registry holds no task state (test hook).
#[cfg(test)]
pub(crate) fn is_empty() -> bool {
    REGISTRY.with(|registry| {
        let registry = registry.borrow();
        registry.scopes.is_empty() && registry.tasks.is_empty()
    })
}

/// Deregisters a task when dropped, so teardown also covers panics.
pub(crate) struct Deregistration {
    task: TaskId,
}

impl Deregistration {
    pub(crate) fn new(task: TaskId) -> Self {
        Self { task }
    }
}

impl Drop for Deregistration {
    fn drop(&mut self) {
        deregister(self.task);
    }
}

/// Marks a task blocked for the duration of a suspension.
pub(crate) struct BlockedGuard {
    control: Rc<TaskControl>,
}

impl BlockedGuard {
    pub(crate) fn enter(control: &Rc<TaskControl>) -> Self {
        control.blocked.set(true);
        Self {
            control: Rc::clone(control),
        }
    }
}

impl Drop for BlockedGuard {
    fn drop(&mut self) {
        self.control.blocked.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_control_cancel_flag() {
        let control = TaskControl::new(None);
        assert!(!control.take_cancel());

        control.request_cancel();
        assert!(control.take_cancel());
        // The request is consumed.
        assert!(!control.take_cancel());
    }

    #[test]
    fn test_task_control_discard() {
        let control = TaskControl::new(Some("worker"));
        control.request_cancel();
        control.discard_cancel();
        assert!(!control.take_cancel());
        assert_eq!(control.name(), Some("worker"));
    }

    #[test]
    fn test_blocked_guard_resets_on_drop() {
        let control = Rc::new(TaskControl::new(None));
        assert!(!control.is_blocked());
        {
            let _guard = BlockedGuard::enter(&control);
            assert!(control.is_blocked());
        }
        assert!(!control.is_blocked());
    }
}
