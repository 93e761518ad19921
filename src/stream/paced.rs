//! Cancellable socket wrapper feeding the TLS layer.
//!
//! `PacedIo` is the byte source/sink the TLS session is bound to. Reads
//! observe a shared cancellation flag: while a flag is attached, the read
//! never parks indefinitely but wakes on an adaptive timer (10 ms seed,
//! ×1.5 growth, 1 s ceiling) purely to re-observe the flag. A set flag
//! surfaces as a cancellation I/O error that the request job recognizes.

use std::future::Future;
use std::io;
#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Sleep;
use tracing::trace;

use crate::error::cancelled_io;

/// Initial adaptive read timeout.
const READ_TIMEOUT_SEED: Duration = Duration::from_millis(10);

/// Ceiling for the adaptive read timeout.
const READ_TIMEOUT_CEIL: Duration = Duration::from_secs(1);

/// Seed for the send-queue drain poll in [`PacedIo::wait_until_written`].
const DRAIN_TIMEOUT_SEED: Duration = Duration::from_millis(10);

fn grow_timeout(current: Duration) -> Duration {
    READ_TIMEOUT_CEIL.min(current + current / 2)
}

/// A non-blocking socket owned by exactly one task at a time, with
/// cancellation observed on every read.
#[pin_project]
#[derive(Debug)]
pub(crate) struct PacedIo {
    #[pin]
    socket: TcpStream,
    cancel: Option<Arc<AtomicBool>>,
    read_timeout: Duration,
    timer: Option<Pin<Box<Sleep>>>,
}

impl PacedIo {
    pub(crate) fn new(socket: TcpStream, cancel: Option<Arc<AtomicBool>>) -> Self {
        Self {
            socket,
            cancel,
            read_timeout: READ_TIMEOUT_SEED,
            timer: None,
        }
    }

    /// Attach the cancellation flag of the request currently driving this
    /// socket. Pooled sockets get re-bound here on every reuse.
    pub(crate) fn set_cancel(&mut self, cancel: Option<Arc<AtomicBool>>) {
        self.cancel = cancel;
    }

    pub(crate) fn get_ref(&self) -> &TcpStream {
        &self.socket
    }

    #[cfg(unix)]
    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Wait until the kernel has drained this socket's send queue.
    ///
    /// Used after the request bytes are written so the caller can mark the
    /// send as complete before blocking on the response. Polls `SIOCOUTQ`
    /// and, between polls, awaits readability under an exponentially
    /// growing timeout; incoming data means the peer already started
    /// answering, so the wait ends early. Where the OS cannot report the
    /// queue length this is a no-op.
    pub(crate) async fn wait_until_written(&self) -> io::Result<()> {
        #[cfg(target_os = "linux")]
        {
            let fd = self.socket.as_raw_fd();
            let mut timeout = DRAIN_TIMEOUT_SEED;

            loop {
                let mut queued: libc::c_int = 0;
                #[allow(unsafe_code)]
                // Safety: TIOCOUTQ writes the send-queue length into
                // `queued`; the fd is owned by self.socket for the whole
                // call.
                let rc = unsafe { libc::ioctl(fd, libc::TIOCOUTQ, &mut queued) };
                if rc != 0 {
                    return Err(io::Error::last_os_error());
                }
                if queued == 0 {
                    return Ok(());
                }

                trace!(queued, "send queue not drained, waiting");
                match tokio::time::timeout(timeout, self.socket.readable()).await {
                    Ok(ready) => {
                        ready?;
                        // The peer started answering.
                        return Ok(());
                    }
                    Err(_) => timeout *= 2,
                }
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            Ok(())
        }
    }
}

impl AsyncRead for PacedIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let mut socket = this.socket;

        let Some(cancel) = this.cancel.as_ref() else {
            return socket.poll_read(cx, buf);
        };

        loop {
            if cancel.load(Ordering::Relaxed) {
                *this.timer = None;
                return Poll::Ready(Err(cancelled_io()));
            }

            match socket.as_mut().poll_read(cx, buf) {
                Poll::Ready(result) => {
                    *this.timer = None;
                    return Poll::Ready(result);
                }
                Poll::Pending => {
                    let timer = this
                        .timer
                        .get_or_insert_with(|| Box::pin(tokio::time::sleep(*this.read_timeout)));
                    match timer.as_mut().poll(cx) {
                        Poll::Ready(()) => {
                            // Wake purely to re-observe the flag.
                            *this.read_timeout = grow_timeout(*this.read_timeout);
                            *this.timer = None;
                        }
                        Poll::Pending => return Poll::Pending,
                    }
                }
            }
        }
    }
}

impl AsyncWrite for PacedIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        self.project().socket.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        self.project().socket.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        self.project().socket.poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<Result<usize, io::Error>> {
        self.project().socket.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.socket.is_write_vectored()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::error::is_cancelled_io;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::join!(
            async { TcpStream::connect(addr).await.unwrap() },
            async { listener.accept().await.unwrap().0 }
        )
    }

    #[test]
    fn timeout_growth_is_capped() {
        let mut timeout = READ_TIMEOUT_SEED;
        for _ in 0..32 {
            timeout = grow_timeout(timeout);
        }
        assert_eq!(timeout, READ_TIMEOUT_CEIL);
        assert_eq!(
            grow_timeout(Duration::from_millis(10)),
            Duration::from_millis(15)
        );
    }

    #[tokio::test]
    async fn read_passes_data_through() {
        let (client, mut server) = pair().await;
        let mut io = PacedIo::new(client, Some(Arc::new(AtomicBool::new(false))));

        server.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn read_is_pending_until_data_arrives() {
        let (client, mut server) = pair().await;
        let mut io = PacedIo::new(client, None);

        let mut buf = [0u8; 5];
        let mut read = std::pin::pin!(io.read_exact(&mut buf));
        assert!(futures::poll!(read.as_mut()).is_pending());

        server.write_all(b"hello").await.unwrap();
        read.await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn cancel_flag_interrupts_blocked_read() {
        let (client, _server) = pair().await;
        let cancel = Arc::new(AtomicBool::new(false));
        let mut io = PacedIo::new(client, Some(cancel.clone()));

        let read = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            io.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.store(true, Ordering::Relaxed);

        let err = read.await.unwrap().unwrap_err();
        assert!(is_cancelled_io(&err));
    }

    #[tokio::test]
    async fn cancel_set_upfront_fails_on_first_poll() {
        use futures::FutureExt as _;

        let (client, mut server) = pair().await;
        let cancel = Arc::new(AtomicBool::new(true));
        let mut io = PacedIo::new(client, Some(cancel));

        server.write_all(b"ignored").await.unwrap();

        // The flag is checked before the socket: the very first poll
        // resolves without consuming a byte.
        let mut buf = [0u8; 7];
        let err = io
            .read(&mut buf)
            .now_or_never()
            .expect("cancelled read must resolve on the first poll")
            .unwrap_err();
        assert!(is_cancelled_io(&err));
    }
}
