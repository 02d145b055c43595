//! Thread offload: running blocking callables off the loop, and calling
//! back into the loop from worker threads.
//!
//! [`run_in_thread`] checkpoints cancellation *before* dispatching, then
//! hands the callable to a dedicated worker thread and suspends until the
//! result comes back over a loop-thread-safe channel. A thread that is
//! already running cannot be cancelled; cancelling the waiting scope
//! abandons the result and leaves the thread to finish detached.
//!
//! Worker threads are "exposed" to the loop that spawned them:
//! [`run_async_from_thread`] marshals a closure onto the loop's dispatcher
//! task, runs the produced future there, and parks the worker on a
//! completion cell until the value crosses back.

use std::cell::RefCell;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use anyhow::anyhow;
use parking_lot::{Condvar, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::{panic_message, Error, Result};
use crate::registry::{self, Deregistration, TaskId};
use crate::scope::{checkpoint, checkpointed};
use crate::RuntimeConfig;

/// A closure marshaled from a worker thread onto the loop.
type Job = Box<dyn FnOnce() + Send>;

thread_local! {
    /// On the loop thread, installed by `run`; on worker threads, installed
    /// by `run_in_thread` before the callable executes.
    static LOOP_HANDLE: RefCell<Option<LoopHandle>> = RefCell::new(None);
}

#[derive(Clone)]
struct LoopHandle {
    jobs: mpsc::UnboundedSender<Job>,
    config: RuntimeConfig,
}

fn loop_handle() -> Option<LoopHandle> {
    LOOP_HANDLE.with(|slot| slot.borrow().clone())
}

/// Receives jobs from worker threads and spawns them on the loop.
/// Installed for the lifetime of `run`.
pub(crate) struct LoopDispatcher {
    task: JoinHandle<()>,
}

impl LoopDispatcher {
    pub(crate) fn install(config: RuntimeConfig) -> Self {
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();
        LOOP_HANDLE.with(|slot| {
            *slot.borrow_mut() = Some(LoopHandle { jobs, config });
        });
        let task = tokio::task::spawn_local(async move {
            while let Some(job) = queue.recv().await {
                job();
            }
        });
        Self { task }
    }
}

impl Drop for LoopDispatcher {
    fn drop(&mut self) {
        LOOP_HANDLE.with(|slot| {
            *slot.borrow_mut() = None;
        });
        self.task.abort();
    }
}

/// Run a blocking callable on a worker thread, suspending the current task
/// until its result arrives.
///
/// Checkpoints before dispatching: a scope that is already cancelled
/// rejects the offload without spawning a thread. The worker is named from
/// [`RuntimeConfig::thread_name_prefix`] and panics in the callable surface
/// as [`Error::Panicked`].
pub async fn run_in_thread<F, T>(func: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    checkpoint()?;
    let handle = loop_handle()
        .ok_or_else(|| Error::Other(anyhow!("run_in_thread requires a running event loop")))?;

    let (result_tx, result_rx) = oneshot::channel();
    let mut builder =
        thread::Builder::new().name(format!("{}-worker", handle.config.thread_name_prefix));
    if let Some(stack_size) = handle.config.stack_size {
        builder = builder.stack_size(stack_size);
    }
    trace!("offloading callable to a worker thread");

    let worker_handle = handle.clone();
    builder
        .spawn(move || {
            // Expose the loop to the worker so the callable can use
            // `run_async_from_thread`.
            LOOP_HANDLE.with(|slot| {
                *slot.borrow_mut() = Some(worker_handle);
            });
            let result = match catch_unwind(AssertUnwindSafe(func)) {
                Ok(value) => Ok(value),
                Err(payload) => Err(Error::Panicked(panic_message(payload))),
            };
            let _ = result_tx.send(result);
        })
        .map_err(|error| Error::Other(error.into()))?;

    match checkpointed(result_rx).await? {
        Ok(result) => result,
        Err(_closed) => Err(Error::Other(anyhow!(
            "worker thread exited without delivering a result"
        ))),
    }
}

/// Completion cell a worker thread parks on while the loop produces a value.
struct Completion<T> {
    result: Mutex<Option<Result<T>>>,
    done: Condvar,
}

impl<T> Completion<T> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn complete(&self, result: Result<T>) {
        *self.result.lock() = Some(result);
        self.done.notify_all();
    }

    fn wait(&self) -> Result<T> {
        let mut slot = self.result.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            self.done.wait(&mut slot);
        }
    }
}

/// Call an async function on the event loop from a worker thread and block
/// until its value crosses back.
///
/// Only valid on threads that have been exposed to a loop, i.e. threads
/// spawned by [`run_in_thread`]. Calling it from the loop thread itself
/// would deadlock and is rejected.
pub fn run_async_from_thread<F, Fut, T>(func: F) -> Result<T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + 'static,
    T: Send + 'static,
{
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(Error::Other(anyhow!(
            "run_async_from_thread must be called from a worker thread, not the event loop"
        )));
    }
    let handle = loop_handle().ok_or_else(|| {
        Error::Other(anyhow!("this thread has not been exposed to an event loop"))
    })?;

    let completion = Arc::new(Completion::new());
    let remote = Arc::clone(&completion);
    let job: Job = Box::new(move || {
        tokio::task::spawn_local(async move {
            let task = TaskId::current().expect("loop jobs run on the loop");
            registry::register(task, Some("from-thread"));
            let _registration = Deregistration::new(task);
            remote.complete(func().await);
        });
    });
    handle.jobs.send(job).map_err(|_| Error::ClosedResource)?;
    completion.wait()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::executor::{run, sleep};
    use crate::scope::open_cancel_scope;

    #[test]
    fn test_run_in_thread_returns_value() {
        let value = run(|| async { run_in_thread(|| 21 * 2).await }).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_run_in_thread_propagates_panic() {
        let outcome: Result<()> =
            run(|| async { run_in_thread(|| panic!("worker blew up")).await });
        match outcome {
            Err(Error::Panicked(message)) => assert!(message.contains("worker blew up")),
            other => panic!("expected a panic failure, got {other:?}"),
        }
    }

    #[test]
    fn test_run_in_thread_rejected_when_cancelled() {
        let outcome = run(|| async {
            open_cancel_scope(None, false, |scope| async move {
                scope.cancel();
                // The checkpoint fires before any thread is spawned.
                run_in_thread(|| -> () { unreachable!("must not dispatch") }).await
            })
            .await
        });
        assert!(matches!(outcome, Ok(None)));
    }

    #[test]
    fn test_run_async_from_thread_round_trip() {
        let value = run(|| async {
            run_in_thread(|| {
                run_async_from_thread(|| async {
                    sleep(Duration::from_millis(5)).await?;
                    Ok("made it")
                })
            })
            .await?
        })
        .unwrap();
        assert_eq!(value, "made it");
    }

    #[test]
    fn test_run_async_from_thread_rejected_on_loop() {
        let outcome = run(|| async { run_async_from_thread(|| async { Ok(()) }) });
        assert!(matches!(outcome, Err(Error::Other(_))));
    }
}
