//! Queues for inter-task communication.
//!
//! This module provides typed multi-producer multi-consumer queues:
//!
//! - **Bounded**: `put` suspends while the buffer is full
//! - **Unbounded**: `put` never suspends
//!
//! Both `put` and `get` are checkpointed suspension points, and operating
//! on a queue that was closed — including while a task is parked on it —
//! fails with [`Error::ClosedResource`].
//!
//! # Example
//!
//! ```rust
//! use strand::channel::bounded;
//!
//! strand::run(|| async {
//!     let (tx, rx) = bounded::<i32>(4);
//!     tx.send(42).await?;
//!     assert_eq!(rx.recv().await?, 42);
//!     Ok(())
//! })
//! .unwrap();
//! ```

use crate::error::{Error, Result};
use crate::scope::checkpointed;

/// Create a bounded queue with the given capacity (at least one slot).
pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = async_channel::bounded(capacity.max(1));
    (Sender { inner: tx }, Receiver { inner: rx })
}

/// Create an unbounded queue.
pub fn unbounded<T>() -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = async_channel::unbounded();
    (Sender { inner: tx }, Receiver { inner: rx })
}

/// Sending half of a queue. Clone for multiple producers.
pub struct Sender<T> {
    inner: async_channel::Sender<T>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Sender<T> {
    /// Send a value, suspending while the queue is full. Checkpoints on
    /// entry; fails with [`Error::ClosedResource`] if the queue is closed.
    pub async fn send(&self, value: T) -> Result<()> {
        checkpointed(self.inner.send(value))
            .await?
            .map_err(|_| Error::ClosedResource)
    }

    /// Close the queue. Receivers can still drain buffered values.
    pub fn close(&self) -> bool {
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Number of values currently buffered.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Receiving half of a queue. Clone for multiple consumers.
pub struct Receiver<T> {
    inner: async_channel::Receiver<T>,
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Receiver<T> {
    /// Receive the next value, suspending while the queue is empty.
    /// Checkpoints on entry; fails with [`Error::ClosedResource`] once the
    /// queue is closed and drained.
    pub async fn recv(&self) -> Result<T> {
        checkpointed(self.inner.recv())
            .await?
            .map_err(|_| Error::ClosedResource)
    }

    pub fn close(&self) -> bool {
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// A combined queue handle that can both put and get.
pub struct Queue<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
        }
    }
}

impl<T> Queue<T> {
    /// Create a new unbounded queue.
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    /// Create a bounded queue with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self { sender, receiver }
    }

    /// Put a value on the queue.
    pub async fn put(&self, value: T) -> Result<()> {
        self.sender.send(value).await
    }

    /// Get the next value from the queue.
    pub async fn get(&self) -> Result<T> {
        self.receiver.recv().await
    }

    /// Close the queue.
    pub fn close(&self) {
        self.sender.close();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }

    /// Get the sending half.
    pub fn sender(&self) -> Sender<T> {
        self.sender.clone()
    }

    /// Get the receiving half.
    pub fn receiver(&self) -> Receiver<T> {
        self.receiver.clone()
    }

    /// Split the queue into its halves.
    pub fn split(self) -> (Sender<T>, Receiver<T>) {
        (self.sender, self.receiver)
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::executor::run;

    #[test]
    fn test_bounded_send_recv() {
        run(|| async {
            let (tx, rx) = bounded::<i32>(10);
            for value in 0..5 {
                tx.send(value).await?;
            }
            for value in 0..5 {
                assert_eq!(rx.recv().await?, value);
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_queue_close_drains_then_fails() {
        run(|| async {
            let queue = Queue::new();
            queue.put(1).await?;
            queue.put(2).await?;
            queue.close();

            // Buffered values can still be drained.
            assert_eq!(queue.get().await?, 1);
            assert_eq!(queue.get().await?, 2);

            assert!(matches!(queue.get().await, Err(Error::ClosedResource)));
            assert!(matches!(queue.put(3).await, Err(Error::ClosedResource)));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_multiple_senders() {
        run(|| async {
            let (tx1, rx) = unbounded::<i32>();
            let tx2 = tx1.clone();
            tx1.send(1).await?;
            tx2.send(2).await?;

            let mut values = vec![rx.recv().await?, rx.recv().await?];
            values.sort_unstable();
            assert_eq!(values, vec![1, 2]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_queue_len() {
        run(|| async {
            let queue = Queue::with_capacity(10);
            assert!(queue.is_empty());
            queue.put("a").await?;
            queue.put("b").await?;
            assert_eq!(queue.len(), 2);
            queue.get().await?;
            assert_eq!(queue.len(), 1);
            Ok(())
        })
        .unwrap();
    }
}
