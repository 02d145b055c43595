//! Deadline timers for cancel scopes.
//!
//! A scope with a finite deadline arms an auxiliary loop task that sleeps
//! until the deadline and then cancels the scope. The timer is disarmed
//! when the scope block exits, so a pending timer can never cancel a scope
//! that has already been left.

use std::rc::Rc;

use tokio::task::JoinHandle;

use crate::scope::ScopeInner;

pub(crate) struct DeadlineTimer {
    task: JoinHandle<()>,
}

impl DeadlineTimer {
    /// Arm a timer for the scope's deadline, or `None` for unbounded
    /// scopes. A deadline already in the past fires at the host task's
    /// first suspension.
    pub(crate) fn arm(scope: &Rc<ScopeInner>) -> Option<Self> {
        let deadline = scope.deadline?;
        let scope = Rc::clone(scope);
        let task = tokio::task::spawn_local(async move {
            tokio::time::sleep_until(deadline.into()).await;
            scope.deadline_expired();
        });
        Some(Self { task })
    }

    /// Disarm the timer. Aborting an already-fired timer is a no-op.
    pub(crate) fn disarm(self) {
        self.task.abort();
    }
}
