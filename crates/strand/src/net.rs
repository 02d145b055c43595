//! Socket readiness waits.
//!
//! One-shot waits for a descriptor to become readable or writable. The
//! interest registration lives only for the duration of the call, the
//! entry is a cancellation checkpoint, and a descriptor closed by another
//! task while the wait was parked surfaces as [`Error::ClosedResource`].

use std::os::unix::io::{AsRawFd, RawFd};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::error::{Error, Result};
use crate::scope::checkpointed;

struct Fd(RawFd);

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Wait until the socket is readable.
pub async fn wait_socket_readable<S: AsRawFd>(socket: &S) -> Result<()> {
    wait_ready(socket.as_raw_fd(), Interest::READABLE).await
}

/// Wait until the socket is writable.
pub async fn wait_socket_writable<S: AsRawFd>(socket: &S) -> Result<()> {
    wait_ready(socket.as_raw_fd(), Interest::WRITABLE).await
}

async fn wait_ready(fd: RawFd, interest: Interest) -> Result<()> {
    let wait = async {
        let registration =
            AsyncFd::with_interest(Fd(fd), interest).map_err(|_| Error::ClosedResource)?;
        let ready = if interest.is_readable() {
            registration.readable().await.map(drop)
        } else {
            registration.writable().await.map(drop)
        };
        ready.map_err(|_| Error::ClosedResource)
    };
    checkpointed(wait).await??;

    // The descriptor may have been closed while the wait was parked.
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
        return Err(Error::ClosedResource);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    use super::*;
    use crate::executor::run;

    #[test]
    fn test_wait_readable_after_write() {
        run(|| async {
            let (mut writer, reader) = UnixStream::pair().map_err(anyhow::Error::from)?;
            reader
                .set_nonblocking(true)
                .map_err(anyhow::Error::from)?;
            writer.write_all(b"ping").map_err(anyhow::Error::from)?;
            wait_socket_readable(&reader).await?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_wait_writable_on_fresh_socket() {
        run(|| async {
            let (writer, _reader) = UnixStream::pair().map_err(anyhow::Error::from)?;
            writer
                .set_nonblocking(true)
                .map_err(anyhow::Error::from)?;
            wait_socket_writable(&writer).await?;
            Ok(())
        })
        .unwrap();
    }
}
