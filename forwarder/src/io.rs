//! Connection IO deadlines.

use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep_until, Instant, Sleep};

pin_project! {
    /// Applies activity-reset deadlines to a stream.
    ///
    /// The read deadline re-arms whenever bytes arrive, so it bounds both
    /// in-request reads and the keep-alive gap between requests. The write
    /// deadline re-arms on every completed write. Expiry surfaces as
    /// [`io::ErrorKind::TimedOut`], which tears the connection down.
    pub struct TimeoutIo<S> {
        #[pin]
        inner: S,
        read_timeout: Duration,
        write_timeout: Duration,
        #[pin]
        read_deadline: Sleep,
        #[pin]
        write_deadline: Sleep,
    }
}

impl<S> TimeoutIo<S> {
    pub fn new(inner: S, read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            inner,
            read_timeout,
            write_timeout,
            read_deadline: sleep_until(Instant::now() + read_timeout),
            write_deadline: sleep_until(Instant::now() + write_timeout),
        }
    }
}

impl<S: AsyncRead> AsyncRead for TimeoutIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read_deadline
                    .as_mut()
                    .reset(Instant::now() + *this.read_timeout);
                Poll::Ready(result)
            }
            Poll::Pending => {
                ready!(this.read_deadline.poll(cx));
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "read deadline elapsed",
                )))
            }
        }
    }
}

impl<S: AsyncWrite> AsyncWrite for TimeoutIo<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();
        match this.inner.poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline
                    .as_mut()
                    .reset(Instant::now() + *this.write_timeout);
                Poll::Ready(result)
            }
            Poll::Pending => {
                ready!(this.write_deadline.poll(cx));
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "write deadline elapsed",
                )))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn idle_read_times_out() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut io = Box::pin(TimeoutIo::new(
            client,
            Duration::from_millis(50),
            Duration::from_secs(5),
        ));

        // Activity within the deadline keeps the stream alive.
        server.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // Silence does not.
        let err = io.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn writes_pass_through() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut io = Box::pin(TimeoutIo::new(
            client,
            Duration::from_secs(5),
            Duration::from_millis(50),
        ));
        io.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}
