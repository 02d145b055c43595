//! Operating-system signal reception.

use futures::future::select_all;
use tokio::signal::unix::{signal, SignalKind};
use tracing::trace;

use crate::error::{Error, Result};
use crate::scope::checkpointed;

/// Receive the given signals as a lazy stream of raw signal numbers.
///
/// Handlers are installed when this returns and removed when the receiver
/// is dropped. Duplicate signal numbers are registered once.
///
/// # Example
///
/// ```rust,no_run
/// strand::run(|| async {
///     let mut signals = strand::receive_signals(&[libc::SIGHUP, libc::SIGUSR1])?;
///     let signum = signals.receive().await?;
///     println!("received signal {signum}");
///     Ok(())
/// })
/// .unwrap();
/// ```
pub fn receive_signals(signals: &[i32]) -> Result<SignalReceiver> {
    let mut streams: Vec<(i32, tokio::signal::unix::Signal)> = Vec::with_capacity(signals.len());
    for &signum in signals {
        if streams.iter().any(|(existing, _)| *existing == signum) {
            continue;
        }
        let stream =
            signal(SignalKind::from_raw(signum)).map_err(|error| Error::Other(error.into()))?;
        streams.push((signum, stream));
    }
    trace!(count = streams.len(), "installed signal handlers");
    Ok(SignalReceiver { streams })
}

/// Yields the numbers of received signals.
pub struct SignalReceiver {
    streams: Vec<(i32, tokio::signal::unix::Signal)>,
}

impl SignalReceiver {
    /// Wait for the next signal. Checkpoints on entry.
    pub async fn receive(&mut self) -> Result<i32> {
        checkpointed(async {
            if self.streams.is_empty() {
                return futures::future::pending().await;
            }
            let waits = self
                .streams
                .iter_mut()
                .map(|(signum, stream)| {
                    let signum = *signum;
                    Box::pin(async move { stream.recv().await.map(|_| signum) })
                })
                .collect::<Vec<_>>();
            let (received, _, _) = select_all(waits).await;
            received.ok_or(Error::ClosedResource)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::run;

    #[test]
    fn test_receive_signals_deduplicates() {
        run(|| async {
            let receiver = receive_signals(&[libc::SIGUSR1, libc::SIGUSR1, libc::SIGUSR2])?;
            assert_eq!(receiver.streams.len(), 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_receive_delivers_raised_signal() {
        run(|| async {
            let mut receiver = receive_signals(&[libc::SIGUSR2])?;
            unsafe {
                libc::raise(libc::SIGUSR2);
            }
            let signum = receiver.receive().await?;
            assert_eq!(signum, libc::SIGUSR2);
            Ok(())
        })
        .unwrap();
    }
}
