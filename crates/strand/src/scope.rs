//! Cancel scopes: nested cancellable regions with deadlines and shielding.
//!
//! This module provides:
//! - `CancelScope` - a handle to a node in the scope tree
//! - `open_cancel_scope` - scoped acquisition around an async body
//! - `fail_after` / `move_on_after` - deadline-bounded scopes
//! - `check_cancelled` - the cancellation checkpoint
//!
//! # Semantics
//!
//! Each task owns a stack of scopes; the innermost one is the task's
//! *current* scope. Cancelling a scope is idempotent and never raises by
//! itself: affected tasks observe the cancellation at their next
//! checkpoint, and a parked suspension point is woken early. A scope whose
//! deadline fired reports [`Error::TimedOut`] at its boundary; a scope that
//! was cancelled explicitly absorbs the cancellation there, so `Cancelled`
//! never travels above the scope that initiated it.
//!
//! Shielding cuts delivery: cancellation originating *above* a shielded
//! scope does not cross into it, while cancelling the shielded scope itself
//! (or any of its descendants) still works.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! let outcome = strand::run(|| async {
//!     strand::fail_after(Duration::from_millis(50), false, |_scope| async {
//!         strand::sleep(Duration::from_secs(5)).await
//!     })
//!     .await
//! });
//! assert!(matches!(outcome, Err(strand::Error::TimedOut)));
//! ```

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tracing::trace;

use crate::error::{Error, Result};
use crate::registry::{self, BlockedGuard, TaskId};
use crate::timer::DeadlineTimer;

/// Shared state of one node in the scope tree.
pub(crate) struct ScopeInner {
    pub(crate) host: TaskId,
    pub(crate) deadline: Option<Instant>,
    pub(crate) shield: bool,
    pub(crate) parent: Option<Rc<ScopeInner>>,
    /// Write-once: flips to true on the first `cancel` and never back.
    cancel_called: Cell<bool>,
    /// Set by the deadline timer before it cancels the scope.
    timer_fired: Cell<bool>,
}

impl ScopeInner {
    fn new(
        host: TaskId,
        deadline: Option<Instant>,
        shield: bool,
        parent: Option<Rc<ScopeInner>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            host,
            deadline,
            shield,
            parent,
            cancel_called: Cell::new(false),
            timer_fired: Cell::new(false),
        })
    }

    pub(crate) fn cancel_called(&self) -> bool {
        self.cancel_called.get()
    }

    pub(crate) fn timer_fired(&self) -> bool {
        self.timer_fired.get()
    }

    /// Called by the deadline timer when the scope's deadline passes.
    pub(crate) fn deadline_expired(&self) {
        self.timer_fired.set(true);
        trace!(host = %self.host, "cancel scope deadline expired");
        self.cancel();
    }

    /// Idempotently mark the scope cancelled and wake the host task, unless
    /// the caller *is* the host (which observes at its next checkpoint).
    pub(crate) fn cancel(&self) {
        if self.cancel_called.replace(true) {
            return;
        }
        trace!(host = %self.host, "cancel scope cancelled");
        if TaskId::current() == Some(self.host) {
            return;
        }
        self.deliver_to(self.host);
    }

    /// Request cancellation of `task` unless a shielded scope stands
    /// between its current scope and this one.
    ///
    /// The walk runs from the task's current scope toward the root and
    /// stops at the first scope that is either this one (deliver) or
    /// shielded (absorb). A task whose chain does not contain this scope is
    /// left alone.
    pub(crate) fn deliver_to(&self, task: TaskId) {
        let mut scope = registry::current_scope(task);
        while let Some(current) = scope {
            if std::ptr::eq(Rc::as_ptr(&current), self) {
                if let Some(control) = registry::control(task) {
                    control.request_cancel();
                }
                return;
            }
            if current.shield {
                return;
            }
            scope = current.parent.clone();
        }
    }
}

/// Handle to a cancel scope.
///
/// Handles are cheap to clone and remain valid after the scope's block has
/// exited, which allows inspecting `cancel_called` from the outside.
#[derive(Clone)]
pub struct CancelScope {
    pub(crate) inner: Rc<ScopeInner>,
}

impl CancelScope {
    /// Cancel all work inside this scope.
    ///
    /// Idempotent. The call itself never fails; cancellation surfaces at
    /// the next suspension point inside the affected tasks.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// The scope's deadline, or `None` when unbounded.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Whether cancellation from enclosing scopes is kept out.
    pub fn shield(&self) -> bool {
        self.inner.shield
    }

    /// Whether `cancel` has been called on this scope.
    pub fn cancel_called(&self) -> bool {
        self.inner.cancel_called()
    }
}

impl fmt::Debug for CancelScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelScope")
            .field("deadline", &self.inner.deadline)
            .field("shield", &self.inner.shield)
            .field("cancel_called", &self.inner.cancel_called())
            .finish()
    }
}

/// Fail with [`Error::Cancelled`] if the current task's current scope has
/// been cancelled and is not shielded.
pub fn check_cancelled() -> Result<()> {
    if let Some(task) = TaskId::current() {
        if let Some(scope) = registry::current_scope(task) {
            if scope.cancel_called() && !scope.shield {
                return Err(Error::Cancelled);
            }
        }
    }
    Ok(())
}

/// Full cancellation checkpoint: consume a pending cancellation request,
/// then consult the current scope.
pub(crate) fn checkpoint() -> Result<()> {
    if let Some(control) = registry::current_control() {
        if control.take_cancel() {
            return Err(Error::Cancelled);
        }
    }
    check_cancelled()
}

/// Run a blocking operation as a checkpointed suspension point.
///
/// Checkpoints on entry, then races the operation against a cancellation
/// request for the current task. Cancellation wins ties.
pub(crate) async fn checkpointed<F: Future>(op: F) -> Result<F::Output> {
    checkpoint()?;
    match registry::current_control() {
        None => Ok(op.await),
        Some(control) => {
            let _blocked = BlockedGuard::enter(&control);
            tokio::select! {
                biased;
                _ = control.cancelled() => Err(Error::Cancelled),
                output = op => Ok(output),
            }
        }
    }
}

/// Open a cancel scope around `body`.
///
/// Pushes a new scope on the current task's stack, arms a deadline timer
/// when `deadline` is finite, runs `body` with a handle to the scope, and
/// on exit pops the stack and disarms the timer.
///
/// Returns `Ok(Some(value))` when the body completed and no cancellation
/// applied, `Ok(None)` when the scope absorbed its own explicit
/// cancellation, and `Err(TimedOut)` when the scope's own deadline fired.
/// Any other failure from the body propagates unchanged; in particular a
/// body failure wins over a concurrent deadline expiry.
pub async fn open_cancel_scope<F, Fut, T>(
    deadline: Option<Instant>,
    shield: bool,
    body: F,
) -> Result<Option<T>>
where
    F: FnOnce(CancelScope) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let host = current_task()?;
    let parent = registry::current_scope(host);
    let scope = ScopeInner::new(host, deadline, shield, parent);
    registry::set_current_scope(host, Some(Rc::clone(&scope)));
    let timer = DeadlineTimer::arm(&scope);

    let outcome = AssertUnwindSafe(body(CancelScope {
        inner: Rc::clone(&scope),
    }))
    .catch_unwind()
    .await;

    if let Some(timer) = timer {
        timer.disarm();
    }
    registry::set_current_scope(host, scope.parent.clone());

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(payload) => resume_unwind(payload),
    };

    if scope.cancel_called() {
        discard_stale_cancel(&scope, host);
    }

    match outcome {
        Err(Error::Cancelled) => {
            if scope.timer_fired() {
                Err(Error::TimedOut)
            } else if scope.cancel_called() {
                // The cancellation originated here; it goes no further.
                Ok(None)
            } else {
                Err(Error::Cancelled)
            }
        }
        Ok(value) => {
            if scope.timer_fired() {
                // The deadline fired but delivery never surfaced in the
                // body, e.g. a shielded subscope ran to completion.
                Err(Error::TimedOut)
            } else {
                Ok(Some(value))
            }
        }
        Err(error) => Err(error),
    }
}

/// Drop an undelivered cancellation request once the scope that caused it
/// has exited. The request is kept when an enclosing scope is itself
/// cancelled, since delivery then still has a recipient.
fn discard_stale_cancel(scope: &ScopeInner, host: TaskId) {
    let mut ancestor = scope.parent.clone();
    while let Some(current) = ancestor {
        if current.cancel_called() {
            return;
        }
        ancestor = current.parent.clone();
    }
    if let Some(control) = registry::control(host) {
        control.discard_cancel();
    }
}

fn current_task() -> Result<TaskId> {
    TaskId::current()
        .filter(|task| registry::control(*task).is_some())
        .ok_or_else(|| Error::Other(anyhow::anyhow!("cancel scopes require a task started by `run`")))
}

/// Deadline-bounded scope that lets [`Error::TimedOut`] propagate.
///
/// The deadline is `now + delay`; the timeout surfaces only if the body was
/// still running when it expired.
pub async fn fail_after<F, Fut, T>(delay: Duration, shield: bool, body: F) -> Result<Option<T>>
where
    F: FnOnce(CancelScope) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    open_cancel_scope(Some(Instant::now() + delay), shield, body).await
}

/// Deadline-bounded scope that swallows its own timeout.
///
/// Returns `Ok(None)` when the scope's deadline fired, distinguishing that
/// from a `TimedOut` raised by a nested scope, which propagates unchanged.
pub async fn move_on_after<F, Fut, T>(delay: Duration, shield: bool, body: F) -> Result<Option<T>>
where
    F: FnOnce(CancelScope) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let entered: Rc<RefCell<Option<CancelScope>>> = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&entered);
    let result = open_cancel_scope(Some(Instant::now() + delay), shield, move |scope| {
        *slot.borrow_mut() = Some(scope.clone());
        body(scope)
    })
    .await;

    match result {
        Err(Error::TimedOut)
            if entered
                .borrow()
                .as_ref()
                .is_some_and(CancelScope::cancel_called) =>
        {
            Ok(None)
        }
        other => other,
    }
}

/// The earliest deadline on the current task's scope chain, or `None` when
/// execution is unbounded.
pub fn current_effective_deadline() -> Option<Instant> {
    let task = TaskId::current()?;
    let mut deadline: Option<Instant> = None;
    let mut scope = registry::current_scope(task);
    while let Some(current) = scope {
        deadline = match (deadline, current.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        scope = current.parent.clone();
    }
    deadline
}
