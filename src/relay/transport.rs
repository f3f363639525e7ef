//! Bidirectional relay with per-operation deadlines

use std::{
    future::Future,
    io::{self, ErrorKind},
    ops::{Deref, DerefMut},
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

use log::trace;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    time::{sleep, Sleep},
};

/// Size of a relay copy buffer. Large enough to carry any UDP datagram in a
/// single read.
const RELAY_BUFFER_SIZE: usize = 1 << 16;

/// Maximum number of buffers kept in the free list
const BUFFER_POOL_MAX_SIZE: usize = 64;

/// A connection wrapper arming a fresh deadline for every read and write.
/// The deadline starts counting when an operation first suspends and is
/// cleared as soon as it completes, so an active relay never times out.
pub struct TimeoutConn<S> {
    inner: S,
    timeout: Duration,
    read_delay: Option<Pin<Box<Sleep>>>,
    write_delay: Option<Pin<Box<Sleep>>>,
}

impl<S> TimeoutConn<S> {
    pub fn new(inner: S, timeout: Duration) -> TimeoutConn<S> {
        TimeoutConn {
            inner,
            timeout,
            read_delay: None,
            write_delay: None,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TimeoutConn<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(r) => {
                this.read_delay = None;
                Poll::Ready(r)
            }
            Poll::Pending => {
                let timeout = this.timeout;
                let delay = this.read_delay.get_or_insert_with(|| Box::pin(sleep(timeout)));
                match delay.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        this.read_delay = None;
                        Poll::Ready(Err(io::Error::new(ErrorKind::TimedOut, "read timed out")))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimeoutConn<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(r) => {
                this.write_delay = None;
                Poll::Ready(r)
            }
            Poll::Pending => {
                let timeout = this.timeout;
                let delay = this.write_delay.get_or_insert_with(|| Box::pin(sleep(timeout)));
                match delay.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        this.write_delay = None;
                        Poll::Ready(Err(io::Error::new(ErrorKind::TimedOut, "write timed out")))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Free list of relay buffers, bounding allocation under connection churn
struct BufferPool {
    free: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
    fn new() -> BufferPool {
        BufferPool {
            free: Mutex::new(Vec::new()),
        }
    }

    fn take(self: &Arc<BufferPool>) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; RELAY_BUFFER_SIZE].into_boxed_slice());
        PooledBuffer {
            buf: Some(buf),
            pool: self.clone(),
        }
    }
}

struct PooledBuffer {
    buf: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = self.buf.take().expect("buffer already returned");
        let mut free = self.pool.free.lock().unwrap();
        if free.len() < BUFFER_POOL_MAX_SIZE {
            free.push(buf);
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_ref().expect("buffer already returned")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().expect("buffer already returned")
    }
}

/// Relays bytes between two connections until either direction finishes
#[derive(Clone)]
pub struct Transporter {
    pool: Arc<BufferPool>,
}

impl Default for Transporter {
    fn default() -> Transporter {
        Transporter::new()
    }
}

impl Transporter {
    pub fn new() -> Transporter {
        Transporter {
            pool: Arc::new(BufferPool::new()),
        }
    }

    /// Copies `a -> b` and `b -> a` concurrently and returns when either
    /// direction completes. EOF and timeouts count as normal termination,
    /// every other error surfaces. Both connections are dropped on return,
    /// closing them.
    pub async fn transport<A, B>(&self, a: A, b: B) -> io::Result<()>
    where
        A: AsyncRead + AsyncWrite + Send + Unpin,
        B: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (mut ar, mut aw) = tokio::io::split(a);
        let (mut br, mut bw) = tokio::io::split(b);

        let mut a_to_b = self.pool.take();
        let mut b_to_a = self.pool.take();

        let result = tokio::select! {
            r = copy_buffered(&mut ar, &mut bw, &mut a_to_b) => r,
            r = copy_buffered(&mut br, &mut aw, &mut b_to_a) => r,
        };

        trace!("relay finished: {:?}", result);

        match result {
            Err(ref err) if err.kind() == ErrorKind::TimedOut => Ok(()),
            r => r.map(drop),
        }
    }
}

async fn copy_buffered<R, W>(r: &mut R, w: &mut W, buf: &mut [u8]) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;
    loop {
        let n = r.read(buf).await?;
        if n == 0 {
            return Ok(copied);
        }
        w.write_all(&buf[..n]).await?;
        copied += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn transport_relays_both_directions() {
        let (mut client, near) = duplex(1024);
        let (far, mut upstream) = duplex(1024);

        let transporter = Transporter::new();
        let relay = tokio::spawn(async move { transporter.transport(near, far).await });

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // closing one peer terminates the relay cleanly
        drop(client);
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn transport_finishes_when_one_side_closes() {
        let (client, near) = duplex(1024);
        let (far, upstream) = duplex(1024);

        let transporter = Transporter::new();
        drop(client);

        transporter.transport(near, far).await.unwrap();
        drop(upstream);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_conn_read_deadline_fires() {
        let (_keep_open, idle) = duplex(16);
        let mut conn = TimeoutConn::new(idle, Duration::from_millis(100));

        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_conn_resets_between_reads() {
        let (mut tx, rx) = duplex(16);
        let mut conn = TimeoutConn::new(rx, Duration::from_millis(100));

        tx.write_all(b"a").await.unwrap();
        let mut buf = [0u8; 1];
        conn.read_exact(&mut buf).await.unwrap();

        tx.write_all(b"b").await.unwrap();
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"b");
    }

    #[tokio::test(start_paused = true)]
    async fn transport_collapses_timeout_to_clean_termination() {
        let (_client, near) = duplex(16);
        let (far, _upstream) = duplex(16);

        let transporter = Transporter::new();
        let near = TimeoutConn::new(near, Duration::from_millis(50));
        let far = TimeoutConn::new(far, Duration::from_millis(50));

        transporter.transport(near, far).await.unwrap();
    }
}
