//! Event loop entry points.
//!
//! [`run`] builds a fresh single-threaded event loop, drives `entry` on it
//! as the root task, and returns its value or re-raises its failure. Tasks
//! on one loop run serially; context switches happen only at suspension
//! points, and every suspension point offered here begins with a
//! cancellation checkpoint.

use std::future::Future;
use std::panic::resume_unwind;
use std::time::Duration;

use anyhow::anyhow;
use tracing::debug;

use crate::error::{Error, Result};
use crate::pool::LoopDispatcher;
use crate::registry::{self, Deregistration, TaskId};
use crate::scope::checkpointed;
use crate::RuntimeConfig;

/// Drive an event loop to completion.
///
/// Creates a new loop, runs `entry` as its root task, and tears the loop
/// down when it finishes. Cannot be called from inside a running loop.
///
/// # Example
///
/// ```rust
/// let value = strand::run(|| async { Ok(1 + 1) }).unwrap();
/// assert_eq!(value, 2);
/// ```
pub fn run<F, Fut, T>(entry: F) -> Result<T>
where
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = Result<T>> + 'static,
    T: 'static,
{
    run_with_config(RuntimeConfig::default(), entry)
}

/// Like [`run`], with explicit configuration.
pub fn run_with_config<F, Fut, T>(config: RuntimeConfig, entry: F) -> Result<T>
where
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = Result<T>> + 'static,
    T: 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|error| Error::Other(error.into()))?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async move {
        if config.debug {
            debug!(?config, "starting event loop");
        }
        let _dispatcher = LoopDispatcher::install(config);
        let root = tokio::task::spawn_local(async move {
            let task = TaskId::current().expect("the root task runs on the loop");
            registry::register(task, Some("main"));
            let _registration = Deregistration::new(task);
            entry().await
        });
        match root.await {
            Ok(outcome) => outcome,
            Err(error) if error.is_panic() => resume_unwind(error.into_panic()),
            Err(_) => Err(Error::Other(anyhow!("the main task was aborted"))),
        }
    })
}

/// Suspend the current task for `delay`.
///
/// Checkpoints on entry. A zero delay still yields to the loop once, which
/// gives other runnable tasks a chance to execute.
pub async fn sleep(delay: Duration) -> Result<()> {
    if delay.is_zero() {
        checkpointed(tokio::task::yield_now()).await
    } else {
        checkpointed(tokio::time::sleep(delay)).await
    }
}

/// Wait until every managed task other than the caller is parked at a
/// suspension point. Testing aid.
pub async fn wait_all_tasks_blocked() -> Result<()> {
    let caller = TaskId::current();
    loop {
        let all_blocked = registry::tasks()
            .into_iter()
            .filter(|(task, _)| Some(*task) != caller)
            .all(|(_, control)| control.is_blocked());
        if all_blocked {
            return Ok(());
        }
        sleep(Duration::ZERO).await?;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Instant;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::scope::open_cancel_scope;
    use crate::task::create_task_group;

    #[test]
    fn test_run_returns_entry_value() {
        let value = run(|| async { Ok("done") }).unwrap();
        assert_eq!(value, "done");
    }

    #[test]
    fn test_run_propagates_entry_failure() {
        let outcome: Result<()> = run(|| async { Err(Error::Other(anyhow!("entry failed"))) });
        assert!(matches!(outcome, Err(Error::Other(_))));
    }

    #[test]
    fn test_run_with_config() {
        let config = RuntimeConfig::new()
            .with_debug(true)
            .with_thread_name_prefix("loop-test");
        let value = run_with_config(config, || async { Ok(7) }).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_sleep_takes_roughly_the_requested_time() {
        run(|| async {
            let started = Instant::now();
            sleep(Duration::from_millis(50)).await?;
            assert!(started.elapsed() >= Duration::from_millis(45));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_sleep_zero_yields() {
        run(|| async {
            sleep(Duration::ZERO).await?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_wait_all_tasks_blocked() {
        run(|| async {
            let entered = Rc::new(Cell::new(false));
            let observed = Rc::clone(&entered);
            create_task_group(|group| async move {
                group.spawn(async move {
                    entered.set(true);
                    sleep(Duration::from_millis(100)).await
                })?;
                wait_all_tasks_blocked().await?;
                // The child has started and is parked in its sleep.
                assert!(observed.get());
                group.cancel_scope().cancel();
                Ok(())
            })
            .await?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_registry_is_clean_after_run() {
        run(|| async {
            open_cancel_scope(None, false, |_scope| async {
                create_task_group(|group| async move {
                    group.spawn(async { sleep(Duration::from_millis(5)).await })?;
                    Ok(())
                })
                .await?;
                Ok(())
            })
            .await?;
            Ok(())
        })
        .unwrap();
        assert!(registry::is_empty());
    }
}
