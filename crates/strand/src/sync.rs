//! Synchronization primitives.
//!
//! Thin wrappers over the loop's lock, event, and semaphore: each
//! potentially-blocking entry is a checkpointed suspension point, so a
//! cancelled scope interrupts waiters instead of leaving them parked.

use std::cell::Cell;
use std::rc::Rc;

use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::scope::checkpointed;

/// A mutual-exclusion lock for tasks.
///
/// # Example
///
/// ```rust
/// use strand::Lock;
///
/// strand::run(|| async {
///     let lock = Lock::new();
///     {
///         let _guard = lock.acquire().await?;
///         assert!(lock.locked());
///     }
///     assert!(!lock.locked());
///     Ok(())
/// })
/// .unwrap();
/// ```
pub struct Lock {
    inner: tokio::sync::Mutex<()>,
}

impl Lock {
    pub fn new() -> Self {
        Self {
            inner: tokio::sync::Mutex::new(()),
        }
    }

    /// Acquire the lock, suspending until it is free. Checkpoints on entry.
    pub async fn acquire(&self) -> Result<LockGuard<'_>> {
        let guard = checkpointed(self.inner.lock()).await?;
        Ok(LockGuard { _guard: guard })
    }

    /// Whether the lock is currently held.
    pub fn locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the lock when dropped.
pub struct LockGuard<'a> {
    _guard: tokio::sync::MutexGuard<'a, ()>,
}

struct EventInner {
    set: Cell<bool>,
    notify: Notify,
}

/// A one-shot event flag.
///
/// Waiters suspend until some task sets the event; once set it stays set.
#[derive(Clone)]
pub struct Event {
    inner: Rc<EventInner>,
}

impl Event {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(EventInner {
                set: Cell::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Set the event, waking all waiters. Setting it again is a no-op.
    pub fn set(&self) {
        if !self.inner.set.replace(true) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.set.get()
    }

    /// Wait until the event is set. Checkpoints on entry; returns
    /// immediately when the event is already set.
    pub async fn wait(&self) -> Result<()> {
        checkpointed(async {
            while !self.inner.set.get() {
                self.inner.notify.notified().await;
            }
        })
        .await
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

/// A counting semaphore.
pub struct Semaphore {
    inner: tokio::sync::Semaphore,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            inner: tokio::sync::Semaphore::new(permits),
        }
    }

    /// Acquire a permit, suspending while none are available. Checkpoints
    /// on entry; fails with [`Error::ClosedResource`] once the semaphore is
    /// closed.
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>> {
        let permit = checkpointed(self.inner.acquire())
            .await?
            .map_err(|_| Error::ClosedResource)?;
        Ok(SemaphorePermit { _permit: permit })
    }

    /// Currently available permits.
    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }

    /// Close the semaphore; pending and future acquisitions fail with
    /// [`Error::ClosedResource`].
    pub fn close(&self) {
        self.inner.close();
    }
}

/// Returns its permit to the semaphore when dropped.
pub struct SemaphorePermit<'a> {
    _permit: tokio::sync::SemaphorePermit<'a>,
}
