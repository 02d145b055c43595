//! Task groups: scope-anchored nurseries with structured termination.
//!
//! A `TaskGroup` owns an implicit cancel scope. Children spawned through it
//! inherit that scope, the group's block does not return until every child
//! has terminated, and the first failure cancels the whole group. When more
//! than one failure is collected, they surface together as an
//! [`ExceptionGroup`]; a single failure is re-raised unwrapped.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! let outcome = strand::run(|| async {
//!     strand::create_task_group(|group| async move {
//!         group.spawn(async {
//!             strand::sleep(Duration::from_millis(10)).await?;
//!             Ok(())
//!         })?;
//!         group.spawn(async { Ok(()) })?;
//!         Ok(())
//!     })
//!     .await
//! });
//! assert!(matches!(outcome, Ok(Some(()))));
//! ```

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{panic_message, Error, ExceptionGroup, Result};
use crate::registry::{self, BlockedGuard, Deregistration, TaskId};
use crate::scope::{open_cancel_scope, CancelScope};

struct GroupInner {
    scope: CancelScope,
    host: TaskId,
    /// True between open and the start of the final join.
    active: Cell<bool>,
    children: RefCell<HashMap<TaskId, JoinHandle<Result<()>>>>,
}

/// A scope-anchored nursery for spawning child tasks.
///
/// Handles are cheap to clone and may be passed into children, but only the
/// task that opened the group joins it: the enclosing
/// [`create_task_group`] block does not return until every child has
/// terminated.
#[derive(Clone)]
pub struct TaskGroup {
    inner: Rc<GroupInner>,
}

impl TaskGroup {
    /// The cancel scope bounding this group.
    pub fn cancel_scope(&self) -> CancelScope {
        self.inner.scope.clone()
    }

    /// Schedule a child task executing `future`.
    ///
    /// The child inherits the group's cancel scope before it first runs.
    /// Fails with [`Error::NotActive`] once the group has begun joining or
    /// its scope has been cancelled.
    pub fn spawn<Fut>(&self, future: Fut) -> Result<()>
    where
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.spawn_inner(None, future)
    }

    /// Like [`TaskGroup::spawn`], with a diagnostic name for the child.
    pub fn spawn_named<Fut>(&self, name: &str, future: Fut) -> Result<()>
    where
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.spawn_inner(Some(name), future)
    }

    fn spawn_inner<Fut>(&self, name: Option<&str>, future: Fut) -> Result<()>
    where
        Fut: Future<Output = Result<()>> + 'static,
    {
        if !self.inner.active.get() || self.inner.scope.cancel_called() {
            return Err(Error::NotActive);
        }
        let group = Rc::clone(&self.inner);
        let handle = tokio::task::spawn_local(run_wrapped(group, future));
        let child = TaskId(handle.id());
        // Bind the child to the group's scope at schedule time, before it
        // first runs.
        registry::register(child, name);
        registry::set_current_scope(child, Some(Rc::clone(&self.inner.scope.inner)));
        self.inner.children.borrow_mut().insert(child, handle);
        trace!(task = %child, name = name.unwrap_or_default(), "spawned child task");
        Ok(())
    }
}

async fn run_wrapped<Fut>(group: Rc<GroupInner>, future: Fut) -> Result<()>
where
    Fut: Future<Output = Result<()>>,
{
    let task = TaskId::current().expect("child tasks run on the loop");
    let _registration = Deregistration::new(task);
    let result = match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(Error::Panicked(panic_message(payload))),
    };
    match result {
        Ok(()) => {
            group.children.borrow_mut().remove(&task);
            Ok(())
        }
        Err(error) => {
            // Any failure, including a cancellation that did not originate
            // here, tears the whole group down. The join collects it.
            group.scope.cancel();
            Err(error)
        }
    }
}

/// Open a task group around `body`.
///
/// The body receives a [`TaskGroup`] handle. When it returns, the group
/// joins: children parked at a suspension point are woken if the group's
/// scope has been cancelled, every child is awaited, and failures are
/// classified — child cancellations are dropped silently, anything else is
/// collected in observation order. With two or more failures the block
/// fails with an [`ExceptionGroup`]; with exactly one, that failure is
/// re-raised unwrapped.
///
/// `Ok(None)` marks a group whose own scope was cancelled before the body
/// produced a value.
pub async fn create_task_group<F, Fut, T>(body: F) -> Result<Option<T>>
where
    F: FnOnce(TaskGroup) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    open_cancel_scope(None, false, |scope| async move {
        let host = scope.inner.host;
        let group = TaskGroup {
            inner: Rc::new(GroupInner {
                scope: scope.clone(),
                host,
                active: Cell::new(true),
                children: RefCell::new(HashMap::new()),
            }),
        };
        trace!(host = %host, "task group opened");

        let body_outcome = match AssertUnwindSafe(body(group.clone())).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => Err(Error::Panicked(panic_message(payload))),
        };

        let mut failures = Vec::new();
        let body_value = match body_outcome {
            Ok(value) => Some(value),
            Err(Error::Cancelled) => {
                // Propagate the cancellation to the children; the body
                // itself contributes no failure.
                group.inner.scope.cancel();
                None
            }
            Err(error) => {
                failures.push(error);
                group.inner.scope.cancel();
                None
            }
        };

        group.inner.active.set(false);
        join(&group, &mut failures).await;

        match (failures.len(), body_value) {
            (0, Some(value)) => Ok(value),
            (0, None) => Err(Error::Cancelled),
            (1, _) => Err(failures.remove(0)),
            _ => {
                debug!(count = failures.len(), "task group collected multiple failures");
                Err(Error::Group(ExceptionGroup::new(failures)))
            }
        }
    })
    .await
}

/// Await every child, classifying terminal states.
///
/// The child-await itself is not a checkpoint: a cancellation of the host
/// arriving mid-join cancels the group's scope (waking parked children) and
/// otherwise stays pending, so the structural guarantee that all children
/// terminate before the block returns always holds.
async fn join(group: &TaskGroup, failures: &mut Vec<Error>) {
    let host_control = registry::control(group.inner.host);

    while let Some((child, mut handle)) = next_child(&group.inner) {
        let completion = loop {
            if group.inner.scope.cancel_called() {
                group.inner.scope.inner.deliver_to(child);
                let remaining: Vec<TaskId> =
                    group.inner.children.borrow().keys().copied().collect();
                for task in remaining {
                    group.inner.scope.inner.deliver_to(task);
                }
            }
            let _blocked = host_control.as_ref().map(BlockedGuard::enter);
            match &host_control {
                None => break (&mut handle).await,
                Some(control) => {
                    tokio::select! {
                        biased;
                        _ = control.cancelled() => {
                            group.inner.scope.cancel();
                            continue;
                        }
                        completion = &mut handle => break completion,
                    }
                }
            }
        };

        match completion {
            Ok(Ok(())) => {}
            Ok(Err(Error::Cancelled)) => {
                trace!(task = %child, "child task cancelled");
            }
            Ok(Err(error)) => {
                debug!(task = %child, %error, "child task failed");
                failures.push(error);
            }
            Err(join_error) if join_error.is_panic() => {
                failures.push(Error::Panicked(panic_message(join_error.into_panic())));
            }
            Err(_) => {}
        }
    }
}

fn next_child(group: &GroupInner) -> Option<(TaskId, JoinHandle<Result<()>>)> {
    let mut children = group.children.borrow_mut();
    let child = children.keys().next().copied()?;
    children.remove(&child).map(|handle| (child, handle))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::executor::{run, sleep};

    #[test]
    fn test_group_with_no_children() {
        let outcome = run(|| async {
            create_task_group(|_group| async move { Ok(42) }).await
        });
        assert!(matches!(outcome, Ok(Some(42))));
    }

    #[test]
    fn test_spawn_outside_block_fails() {
        let outcome = run(|| async {
            let escaped: Rc<RefCell<Option<TaskGroup>>> = Rc::new(RefCell::new(None));
            let slot = Rc::clone(&escaped);
            create_task_group(|group| async move {
                *slot.borrow_mut() = Some(group);
                Ok(())
            })
            .await?;

            let group = escaped.borrow_mut().take().expect("group handle escaped");
            let result = group.spawn(async { Ok(()) });
            assert!(matches!(result, Err(Error::NotActive)));
            Ok(())
        });
        assert!(outcome.is_ok());
    }

    #[test]
    fn test_children_removed_after_join() {
        let outcome = run(|| async {
            let escaped: Rc<RefCell<Option<TaskGroup>>> = Rc::new(RefCell::new(None));
            let slot = Rc::clone(&escaped);
            create_task_group(|group| async move {
                *slot.borrow_mut() = Some(group.clone());
                for _ in 0..4 {
                    group.spawn(async {
                        sleep(Duration::from_millis(5)).await?;
                        Ok(())
                    })?;
                }
                Ok(())
            })
            .await?;

            let group = escaped.borrow_mut().take().expect("group handle escaped");
            assert!(group.inner.children.borrow().is_empty());
            assert!(!group.inner.active.get());
            Ok(())
        });
        assert!(outcome.is_ok());
    }

    #[test]
    fn test_spawn_named_child() {
        let outcome = run(|| async {
            create_task_group(|group| async move {
                group.spawn_named("worker", async { Ok(()) })?;
                Ok(())
            })
            .await
        });
        assert!(matches!(outcome, Ok(Some(()))));
    }

    #[test]
    fn test_child_panic_is_collected() {
        let outcome = run(|| async {
            create_task_group(|group| async move {
                group.spawn(async { panic!("child blew up") })?;
                Ok(())
            })
            .await
        });
        match outcome {
            Err(Error::Panicked(message)) => assert!(message.contains("child blew up")),
            other => panic!("expected a panic failure, got {other:?}"),
        }
    }
}
