//! Relay engine
//!
//! Copies bytes in both directions between two endpoints. Each direction runs
//! on its own task with a pooled large buffer and reports on a shared channel.
//! `relay` returns with the first reported outcome, after cancelling and
//! awaiting the other direction so neither its task nor its buffer outlive
//! the call.
//!
//! A relay on which neither direction moves for [`RelayLimits::idle`] ends
//! with `TimedOut`; so does a single write blocked longer than
//! [`RelayLimits::write`].

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::config::Timeouts;
use crate::error::{Error, Result};

use super::pool::{BufferPool, SizeClass};

/// Relay direction, named from the point of view of the first endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// First endpoint → second endpoint
    Upload,
    /// Second endpoint → first endpoint
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
        }
    }
}

/// Time bounds of one relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayLimits {
    /// Longest both directions may sit without moving a byte
    pub idle: Duration,
    /// Longest a single write may stay blocked
    pub write: Duration,
}

impl RelayLimits {
    pub fn from_timeouts(timeouts: &Timeouts) -> Self {
        Self {
            idle: timeouts.ttl,
            write: timeouts.write,
        }
    }
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self::from_timeouts(&Timeouts::global())
    }
}

/// Last time either direction moved bytes
struct Activity {
    last: Mutex<Instant>,
}

impl Activity {
    fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    fn elapsed(&self) -> Duration {
        self.last.lock().elapsed()
    }
}

/// Relay between `a` and `b` using the process-wide buffer pool and limits.
///
/// A clean end-of-stream on either side is reported as `Ok(())`. Both
/// endpoints are closed when this returns.
pub async fn relay<A, B>(a: A, b: B) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    relay_with(a, b, RelayLimits::default()).await
}

/// Relay between `a` and `b` with explicit limits
pub async fn relay_with<A, B>(a: A, b: B, limits: RelayLimits) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    relay_with_pool(a, b, BufferPool::global(), limits).await
}

/// Relay between `a` and `b`, borrowing buffers from `pool`
pub async fn relay_with_pool<A, B>(
    a: A,
    b: B,
    pool: Arc<BufferPool>,
    limits: RelayLimits,
) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    // Capacity 2: neither direction ever blocks on reporting
    let (tx, mut rx) = mpsc::channel(2);
    let activity = Arc::new(Activity::new());

    let upload = tokio::spawn(copy_direction(
        a_read,
        b_write,
        pool.clone(),
        limits,
        activity.clone(),
        Direction::Upload,
        tx.clone(),
    ));
    let download = tokio::spawn(copy_direction(
        b_read,
        a_write,
        pool,
        limits,
        activity,
        Direction::Download,
        tx,
    ));

    let first = rx.recv().await;

    // Stop whichever direction is still running; its halves and buffer are
    // dropped by the time the join completes.
    upload.abort();
    download.abort();
    let _ = upload.await;
    let _ = download.await;

    match first {
        Some((direction, Ok(n))) => {
            debug!("Relay finished: {} completed after {} bytes", direction, n);
            Ok(())
        }
        Some((direction, Err(e))) => {
            debug!("Relay finished: {} failed: {}", direction, e);
            Err(Error::Io(e))
        }
        None => Err(Error::Io(io::Error::new(
            io::ErrorKind::Other,
            "relay task terminated without reporting",
        ))),
    }
}

async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    pool: Arc<BufferPool>,
    limits: RelayLimits,
    activity: Arc<Activity>,
    direction: Direction,
    tx: mpsc::Sender<(Direction, io::Result<u64>)>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = copy_buffered(&mut reader, &mut writer, &pool, limits, &activity).await;
    let _ = tx.send((direction, result)).await;
}

async fn copy_buffered<R, W>(
    reader: &mut R,
    writer: &mut W,
    pool: &Arc<BufferPool>,
    limits: RelayLimits,
    activity: &Activity,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.acquire(SizeClass::Large);
    let mut total = 0u64;

    loop {
        let read = loop {
            let remaining = limits.idle.saturating_sub(activity.elapsed());
            if remaining.is_zero() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "relay idle"));
            }
            // `read` is cancel-safe; the other direction may have moved meanwhile
            if let Ok(read) = tokio::time::timeout(remaining, reader.read(&mut buf[..])).await {
                break read;
            }
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        activity.touch();

        let write = async {
            writer.write_all(&buf[..n]).await?;
            // Flush to ensure data is sent immediately
            writer.flush().await
        };
        tokio::time::timeout(limits.write, write)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "relay write stalled"))??;
        activity.touch();

        total += n as u64;
    }

    // Propagate the half-close; the peer may already be gone
    let _ = writer.shutdown().await;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};
    use std::time::Duration;

    use tokio::io::{duplex, ReadBuf};

    /// Never yields data; records when it is dropped
    struct PendingStream {
        dropped: Arc<AtomicBool>,
    }

    impl AsyncRead for PendingStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for PendingStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl Drop for PendingStream {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    /// Fails every read with a connection reset
    struct ResetStream;

    impl AsyncRead for ResetStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
        }
    }

    impl AsyncWrite for ResetStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Pending
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[tokio::test]
    async fn test_relay_preserves_bytes_both_ways() {
        let (mut client, relay_a) = duplex(8 * 1024);
        let (relay_b, mut server) = duplex(8 * 1024);
        let task = tokio::spawn(relay(relay_a, relay_b));

        let up = pattern(100_000, 1);
        let down = pattern(50_000, 7);

        let (client_res, server_res) = tokio::join!(
            async {
                client.write_all(&up).await.unwrap();
                let mut got = vec![0u8; down.len()];
                client.read_exact(&mut got).await.unwrap();
                got
            },
            async {
                let mut got = vec![0u8; up.len()];
                server.read_exact(&mut got).await.unwrap();
                server.write_all(&down).await.unwrap();
                got
            }
        );
        assert_eq!(server_res, up);
        assert_eq!(client_res, down);

        // Clean close after everything is flushed is not an error
        client.shutdown().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());

        // EOF was propagated to the other side before the relay returned
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_relay_stops_blocked_direction() {
        let dropped = Arc::new(AtomicBool::new(false));
        let pool = Arc::new(BufferPool::new());
        let (client, relay_a) = duplex(1024);
        let blocked = PendingStream {
            dropped: dropped.clone(),
        };

        let task = tokio::spawn(relay_with_pool(
            relay_a,
            blocked,
            pool.clone(),
            RelayLimits::default(),
        ));
        drop(client);

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("relay must not wait for the blocked direction")
            .unwrap();
        assert!(result.is_ok());
        assert!(dropped.load(Ordering::SeqCst));
        // no buffer outlives the relay; the second direction may have
        // reused the first one's buffer
        let idle = pool.stats().idle_for(SizeClass::Large);
        assert!((1..=2).contains(&idle), "idle large buffers: {}", idle);
    }

    #[tokio::test]
    async fn test_relay_reports_reset() {
        let (_client, relay_a) = duplex(1024);
        let result = tokio::time::timeout(Duration::from_secs(5), relay(relay_a, ResetStream))
            .await
            .unwrap();
        match result {
            Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("expected reset, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_idle_relay_times_out() {
        let (_client, relay_a) = duplex(1024);
        let (relay_b, _server) = duplex(1024);
        let limits = RelayLimits {
            idle: Duration::from_millis(100),
            write: Duration::from_secs(1),
        };

        let result = tokio::time::timeout(Duration::from_secs(5), relay_with(relay_a, relay_b, limits))
            .await
            .expect("idle relay never ended");
        match result {
            Err(e) => assert!(e.is_timeout(), "unexpected error: {}", e),
            Ok(()) => panic!("idle relay ended cleanly"),
        }
    }

    #[tokio::test]
    async fn test_one_way_traffic_keeps_relay_alive() {
        let (mut client, relay_a) = duplex(1024);
        let (relay_b, mut server) = duplex(1024);
        let limits = RelayLimits {
            idle: Duration::from_millis(150),
            write: Duration::from_secs(1),
        };
        let task = tokio::spawn(relay_with(relay_a, relay_b, limits));

        // the download direction stays silent longer than `idle`
        for _ in 0..8 {
            client.write_all(b"tick").await.unwrap();
            let mut got = [0u8; 4];
            server.read_exact(&mut got).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!task.is_finished());

        client.shutdown().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
