//! Frame multiplexer
//!
//! Runs many streams over one byte connection. Per session there is one
//! reader task (decodes frames and routes them to streams), one writer task
//! (encodes frames from two queues: control frames first, then data frames in
//! order) and one keep-alive task.
//!
//! Initiator stream ids are odd on the client and even on the server and
//! only ever grow, so an id is never reused while the session lives.
//!
//! Each stream may have at most `stream_window` data frames in flight. The
//! receiver credits frames back with `WindowUpdate` as the application reads
//! them, so the reader task never waits on a slow stream.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Sleep};
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace, warn};

use crate::common::{Conn, Result};
use crate::config::Timeouts;
use crate::error::{Error, Phase};

use super::frame::{read_frame, Frame, FrameType, MAX_FRAME_PAYLOAD};
use super::{BoxedStream, Session, Stream, StreamId};

/// Which end of the physical connection this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_id(self) -> u64 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether `id` was allocated by the peer of `self`
    fn is_peer_id(self, id: StreamId) -> bool {
        match self {
            Role::Client => id % 2 == 0,
            Role::Server => id % 2 == 1,
        }
    }
}

/// Multiplexer tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    pub ping_interval: Duration,
    pub ping_retries: u32,
    /// Streams opened by the peer and not yet accepted
    pub accept_backlog: usize,
    /// Data frames a stream may have in flight before the receiver credits them back
    pub stream_window: usize,
    /// Outgoing data frames buffered per session
    pub send_queue: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self::from_timeouts(&Timeouts::global())
    }
}

impl MuxConfig {
    pub fn from_timeouts(timeouts: &Timeouts) -> Self {
        Self {
            ping_interval: timeouts.ping,
            ping_retries: timeouts.ping_retries,
            accept_backlog: 128,
            stream_window: 64,
            send_queue: 256,
        }
    }

    fn silence_limit(&self) -> Duration {
        self.ping_interval * (self.ping_retries + 1)
    }
}

// ============================================================================
// Shared session state
// ============================================================================

struct StreamState {
    remote_fin: AtomicBool,
    reset: AtomicBool,
    /// Data frames we may still send before the peer credits more
    send_credit: AtomicUsize,
    /// Data frames received from the peer and not yet credited back
    unacked: AtomicUsize,
    /// Writer parked on `send_credit`
    writer: Mutex<Option<Waker>>,
}

impl StreamState {
    fn wake_writer(&self) {
        if let Some(waker) = self.writer.lock().take() {
            waker.wake();
        }
    }
}

struct StreamSlot {
    data_tx: Option<mpsc::UnboundedSender<Bytes>>,
    state: Arc<StreamState>,
}

struct Shared {
    role: Role,
    config: MuxConfig,
    next_id: AtomicU64,
    /// Highest id the peer has opened so far
    max_peer_id: AtomicU64,
    streams: Mutex<HashMap<StreamId, StreamSlot>>,
    pending_opens: Mutex<HashMap<StreamId, oneshot::Sender<Result<()>>>>,
    control_tx: mpsc::UnboundedSender<Frame>,
    data_tx: mpsc::Sender<Frame>,
    closed: AtomicBool,
    cancel: CancellationToken,
    /// Session handle plus live streams; the session closes when it drops to zero
    refs: AtomicUsize,
    last_seen: Mutex<Instant>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

impl Shared {
    fn next_stream_id(&self) -> Result<StreamId> {
        let id = self.next_id.fetch_add(2, Ordering::SeqCst);
        StreamId::try_from(id)
            .map_err(|_| Error::Config("stream identifiers exhausted".into()))
    }

    fn send_control(&self, frame: Frame) {
        let _ = self.control_tx.send(frame);
    }

    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn release(&self) {
        if self.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shutdown("no remaining handles");
        }
    }

    /// Tear the session down; idempotent
    fn shutdown(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(
            "Mux session {:?} -> {:?} closing: {}",
            self.local_addr, self.remote_addr, reason
        );
        self.cancel.cancel();

        // Dropping the senders wakes every blocked reader
        let slots: Vec<_> = self.streams.lock().drain().collect();
        for (_, slot) in slots {
            slot.state.wake_writer();
        }
        let pending: Vec<_> = self.pending_opens.lock().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(Error::SessionClosed));
        }
    }

    /// Forget a stream the peer reset or that broke its window
    fn drop_stream(&self, id: StreamId) {
        let slot = self.streams.lock().remove(&id);
        if let Some(slot) = slot {
            slot.state.reset.store(true, Ordering::SeqCst);
            slot.state.wake_writer();
        }
    }

    fn register(self: &Arc<Self>, id: StreamId) -> MuxStream {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let state = Arc::new(StreamState {
            remote_fin: AtomicBool::new(false),
            reset: AtomicBool::new(false),
            send_credit: AtomicUsize::new(self.config.stream_window),
            unacked: AtomicUsize::new(0),
            writer: Mutex::new(None),
        });
        self.streams.lock().insert(
            id,
            StreamSlot {
                data_tx: Some(data_tx),
                state: state.clone(),
            },
        );
        self.refs.fetch_add(1, Ordering::SeqCst);

        MuxStream {
            id,
            shared: Arc::clone(self),
            state,
            rx: data_rx,
            pending: Bytes::new(),
            consumed: 0,
            tx: PollSender::new(self.data_tx.clone()),
            write_closed: false,
            deadline: None,
        }
    }

    /// Route one inbound frame. Never waits, so one stalled stream cannot
    /// hold up the others.
    fn dispatch(self: &Arc<Self>, frame: Frame, accept_tx: &mpsc::Sender<MuxStream>) -> Result<()> {
        let id = frame.stream_id;
        match frame.frame_type {
            FrameType::Open => {
                let previous = self.max_peer_id.load(Ordering::SeqCst);
                if !self.role.is_peer_id(id) || u64::from(id) <= previous {
                    warn!("Mux: refusing stream {} (id not acceptable)", id);
                    self.send_control(Frame::reset(id));
                    return Ok(());
                }
                self.max_peer_id.store(u64::from(id), Ordering::SeqCst);

                let stream = self.register(id);
                // ack goes out before the stream can be handed to the application
                self.send_control(Frame::open_ack(id));
                if let Err(e) = accept_tx.try_send(stream) {
                    warn!("Mux: accept backlog full, resetting stream {}", id);
                    let stream = match e {
                        mpsc::error::TrySendError::Full(s) | mpsc::error::TrySendError::Closed(s) => s,
                    };
                    stream.refuse();
                }
            }
            FrameType::OpenAck => {
                if let Some(tx) = self.pending_opens.lock().remove(&id) {
                    let _ = tx.send(Ok(()));
                }
            }
            FrameType::Data if frame.payload.is_empty() => {}
            FrameType::Data => {
                let overflow = {
                    let streams = self.streams.lock();
                    let Some(slot) = streams.get(&id) else {
                        trace!("Mux: data for unknown stream {}", id);
                        return Ok(());
                    };
                    if slot.state.unacked.fetch_add(1, Ordering::SeqCst) >= self.config.stream_window {
                        true
                    } else {
                        if let Some(tx) = &slot.data_tx {
                            // a dropped receiver only means the stream is gone
                            let _ = tx.send(frame.payload);
                        }
                        false
                    }
                };
                if overflow {
                    warn!("Mux: stream {} overran its window, resetting", id);
                    self.drop_stream(id);
                    self.send_control(Frame::reset(id));
                }
            }
            FrameType::WindowUpdate => {
                let credit = frame.credit()? as usize;
                let state = self.streams.lock().get(&id).map(|slot| slot.state.clone());
                if let Some(state) = state {
                    state.send_credit.fetch_add(credit, Ordering::SeqCst);
                    state.wake_writer();
                }
            }
            FrameType::Close => {
                if let Some(slot) = self.streams.lock().get_mut(&id) {
                    slot.state.remote_fin.store(true, Ordering::SeqCst);
                    slot.data_tx = None;
                }
            }
            FrameType::Reset => {
                if let Some(tx) = self.pending_opens.lock().remove(&id) {
                    let _ = tx.send(Err(Error::rejected(Phase::Connect, "stream refused")));
                }
                self.drop_stream(id);
            }
            FrameType::Ping => self.send_control(Frame::pong()),
            FrameType::Pong => {}
        }
        Ok(())
    }
}

// ============================================================================
// Session tasks
// ============================================================================

async fn read_loop(shared: Arc<Shared>, mut reader: ReadHalf<Conn>, accept_tx: mpsc::Sender<MuxStream>) {
    let reason = loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = shared.cancel.cancelled() => break "closed locally".to_string(),
        };
        match frame {
            Ok(Some(frame)) => {
                shared.touch();
                if let Err(e) = shared.dispatch(frame, &accept_tx) {
                    break e.to_string();
                }
            }
            Ok(None) => break "peer closed the connection".to_string(),
            Err(e) => break format!("read failed: {}", e),
        }
    };
    shared.shutdown(&reason);
}

async fn write_loop(
    shared: Arc<Shared>,
    mut writer: WriteHalf<Conn>,
    mut control_rx: mpsc::UnboundedReceiver<Frame>,
    mut data_rx: mpsc::Receiver<Frame>,
) {
    let mut buf = BytesMut::with_capacity(MAX_FRAME_PAYLOAD * 2);
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            Some(frame) = control_rx.recv() => frame,
            Some(frame) = data_rx.recv() => frame,
            else => break,
        };

        buf.clear();
        frame.encode(&mut buf);
        let result = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            shared.shutdown(&format!("write failed: {}", e));
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn keepalive_loop(shared: Arc<Shared>) {
    let period = shared.config.ping_interval;
    let limit = shared.config.silence_limit();
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shared.cancel.cancelled() => return,
        }
        let silent = shared.last_seen.lock().elapsed();
        if silent > limit {
            warn!("Mux: peer silent for {:?}, closing session", silent);
            shared.shutdown("keep-alive timeout");
            return;
        }
        shared.send_control(Frame::ping());
    }
}

// ============================================================================
// MuxSession
// ============================================================================

/// A multiplexed session over one byte connection
pub struct MuxSession {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
}

impl MuxSession {
    /// Start a session over `conn`; spawns the reader, writer and keep-alive tasks
    pub fn new(
        conn: Conn,
        role: Role,
        config: MuxConfig,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::channel(config.send_queue);
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);

        let shared = Arc::new(Shared {
            role,
            next_id: AtomicU64::new(role.first_id()),
            max_peer_id: AtomicU64::new(0),
            streams: Mutex::new(HashMap::new()),
            pending_opens: Mutex::new(HashMap::new()),
            control_tx,
            data_tx,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            refs: AtomicUsize::new(1),
            last_seen: Mutex::new(Instant::now()),
            local_addr,
            remote_addr,
            config,
        });

        let (reader, writer) = tokio::io::split(conn);
        tokio::spawn(read_loop(shared.clone(), reader, accept_tx));
        tokio::spawn(write_loop(shared.clone(), writer, control_rx, data_rx));
        tokio::spawn(keepalive_loop(shared.clone()));

        debug!("Mux session started ({:?}) {:?} -> {:?}", role, local_addr, remote_addr);

        Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Number of streams currently tracked by the session
    pub fn num_streams(&self) -> usize {
        self.shared.streams.lock().len()
    }

    async fn open(&self, wait_for_ack: bool) -> Result<MuxStream> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed);
        }

        let id = self.shared.next_stream_id()?;
        let ack_rx = if wait_for_ack {
            let (tx, rx) = oneshot::channel();
            self.shared.pending_opens.lock().insert(id, tx);
            Some(rx)
        } else {
            None
        };

        let stream = self.shared.register(id);
        // Open travels on the data queue so it precedes the stream's data
        self.shared
            .data_tx
            .send(Frame::open(id))
            .await
            .map_err(|_| Error::SessionClosed)?;
        trace!("Mux: opened stream {}", id);

        if let Some(rx) = ack_rx {
            match rx.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(Error::SessionClosed),
            }
        }
        Ok(stream)
    }

    /// Typed variant of [`Session::accept_stream`]
    pub async fn accept(&self) -> Result<MuxStream> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed);
        }
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            stream = rx.recv() => stream.ok_or(Error::SessionClosed),
            _ = self.shared.cancel.cancelled() => Err(Error::SessionClosed),
        }
    }
}

#[async_trait]
impl Session for MuxSession {
    async fn open_stream(&self) -> Result<BoxedStream> {
        Ok(Box::new(self.open(false).await?))
    }

    async fn open_stream_sync(&self) -> Result<BoxedStream> {
        Ok(Box::new(self.open(true).await?))
    }

    async fn accept_stream(&self) -> Result<BoxedStream> {
        Ok(Box::new(self.accept().await?))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.remote_addr
    }

    async fn close(&self) -> Result<()> {
        self.shared.shutdown("closed by owner");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.shared.release();
    }
}

// ============================================================================
// MuxStream
// ============================================================================

/// One stream of a [`MuxSession`]
pub struct MuxStream {
    id: StreamId,
    shared: Arc<Shared>,
    state: Arc<StreamState>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    /// Received bytes not yet handed to the reader
    pending: Bytes,
    /// Frames read since the last window update
    consumed: usize,
    tx: PollSender<Frame>,
    write_closed: bool,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl MuxStream {
    /// Reject a stream the peer opened
    fn refuse(mut self) {
        self.write_closed = true;
        self.shared.streams.lock().remove(&self.id);
        self.shared.send_control(Frame::reset(self.id));
    }

    fn deadline_passed(&mut self, cx: &mut Context<'_>) -> bool {
        match self.deadline.as_mut() {
            Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
            None => false,
        }
    }

    /// Count one consumed frame and credit the peer once half the window is used
    fn consume_frame(&mut self) {
        self.consumed += 1;
        if self.consumed >= (self.shared.config.stream_window / 2).max(1) {
            let credit = std::mem::take(&mut self.consumed);
            self.state.unacked.fetch_sub(credit, Ordering::SeqCst);
            self.shared
                .send_control(Frame::window_update(self.id, credit as u32));
        }
    }

    fn session_closed_error() -> io::Error {
        Error::SessionClosed.into()
    }
}

impl Stream for MuxStream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline.map(|at| Box::pin(tokio::time::sleep_until(at)));
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.deadline.as_ref().map_or(false, |d| d.is_elapsed()) {
            return Poll::Ready(Err(io::ErrorKind::TimedOut.into()));
        }

        if this.pending.is_empty() {
            if this.state.reset.load(Ordering::SeqCst) {
                return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(data)) => {
                    this.consume_frame();
                    this.pending = data;
                }
                Poll::Ready(None) => {
                    if this.state.reset.load(Ordering::SeqCst) {
                        return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
                    }
                    if !this.state.remote_fin.load(Ordering::SeqCst)
                        && this.shared.closed.load(Ordering::SeqCst)
                    {
                        return Poll::Ready(Err(Self::session_closed_error()));
                    }
                    // EOF
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => {
                    if this.deadline_passed(cx) {
                        return Poll::Ready(Err(io::ErrorKind::TimedOut.into()));
                    }
                    return Poll::Pending;
                }
            }
        }

        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending[..n]);
        this.pending.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.state.reset.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
        }
        if this.shared.closed.load(Ordering::SeqCst) {
            return Poll::Ready(Err(Self::session_closed_error()));
        }
        if this.write_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if this.deadline.as_ref().map_or(false, |d| d.is_elapsed()) {
            return Poll::Ready(Err(io::ErrorKind::TimedOut.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if this.state.send_credit.load(Ordering::SeqCst) == 0 {
            *this.state.writer.lock() = Some(cx.waker().clone());
            // re-check after parking so a concurrent wake is not lost
            let ready = this.state.send_credit.load(Ordering::SeqCst) > 0
                || this.state.reset.load(Ordering::SeqCst)
                || this.shared.closed.load(Ordering::SeqCst);
            if ready {
                cx.waker().wake_by_ref();
            } else if this.deadline_passed(cx) {
                return Poll::Ready(Err(io::ErrorKind::TimedOut.into()));
            }
            return Poll::Pending;
        }

        match this.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let n = buf.len().min(MAX_FRAME_PAYLOAD);
                let frame = Frame::data(this.id, Bytes::copy_from_slice(&buf[..n]));
                match this.tx.send_item(frame) {
                    Ok(()) => {
                        this.state.send_credit.fetch_sub(1, Ordering::SeqCst);
                        Poll::Ready(Ok(n))
                    }
                    Err(_) => Poll::Ready(Err(Self::session_closed_error())),
                }
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(Self::session_closed_error())),
            Poll::Pending => {
                if this.deadline_passed(cx) {
                    return Poll::Ready(Err(io::ErrorKind::TimedOut.into()));
                }
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // frames are flushed by the session writer
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.write_closed || this.state.reset.load(Ordering::SeqCst) {
            return Poll::Ready(Ok(()));
        }
        if this.shared.closed.load(Ordering::SeqCst) {
            return Poll::Ready(Err(Self::session_closed_error()));
        }

        match this.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                this.write_closed = true;
                match this.tx.send_item(Frame::close(this.id)) {
                    Ok(()) => Poll::Ready(Ok(())),
                    Err(_) => Poll::Ready(Err(Self::session_closed_error())),
                }
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(Self::session_closed_error())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.shared.streams.lock().remove(&self.id);

        let needs_close = !self.write_closed
            && !self.state.reset.load(Ordering::SeqCst)
            && !self.shared.closed.load(Ordering::SeqCst);
        if needs_close {
            // must stay behind queued data, so it goes on the data queue
            let frame = Frame::close(self.id);
            if let Err(mpsc::error::TrySendError::Full(frame)) = self.shared.data_tx.try_send(frame) {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let tx = self.shared.data_tx.clone();
                    handle.spawn(async move {
                        let _ = tx.send(frame).await;
                    });
                }
            }
        }

        self.shared.release();
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("id", &self.id)
            .field("write_closed", &self.write_closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn pair_with(config: MuxConfig) -> (MuxSession, MuxSession) {
        let (a, b) = duplex(64 * 1024);
        let client = MuxSession::new(Box::new(a), Role::Client, config.clone(), None, None);
        let server = MuxSession::new(Box::new(b), Role::Server, config, None, None);
        (client, server)
    }

    fn pair() -> (MuxSession, MuxSession) {
        pair_with(MuxConfig::default())
    }

    #[tokio::test]
    async fn test_open_accept_echo() {
        let (client, server) = pair();
        let server = Arc::new(server);

        let echo = {
            let server = server.clone();
            tokio::spawn(async move {
                for _ in 0..3 {
                    let mut stream = server.accept().await.unwrap();
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 1024];
                        loop {
                            let n = stream.read(&mut buf).await.unwrap();
                            if n == 0 {
                                break;
                            }
                            stream.write_all(&buf[..n]).await.unwrap();
                        }
                        stream.shutdown().await.unwrap();
                    });
                }
            })
        };

        let mut streams = Vec::new();
        for _ in 0..3 {
            streams.push(client.open(true).await.unwrap());
        }
        let ids: Vec<_> = streams.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![1, 3, 5]);

        for (i, stream) in streams.iter_mut().enumerate() {
            let msg = format!("hello from stream {}", i);
            stream.write_all(msg.as_bytes()).await.unwrap();
            let mut got = vec![0u8; msg.len()];
            stream.read_exact(&mut got).await.unwrap();
            assert_eq!(got, msg.as_bytes());
        }

        for mut stream in streams {
            stream.shutdown().await.unwrap();
            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        }
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_large_transfer_is_chunked_in_order() {
        let (client, server) = pair();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        let reader = tokio::spawn(async move {
            let mut stream = server.accept().await.unwrap();
            let mut got = Vec::new();
            stream.read_to_end(&mut got).await.unwrap();
            got
        });

        let mut stream = client.open_stream().await.unwrap();
        stream.write_all(&payload).await.unwrap();
        stream.shutdown().await.unwrap();

        assert_eq!(reader.await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_closing_one_stream_keeps_siblings() {
        let (client, server) = pair();

        let mut a = client.open(true).await.unwrap();
        let mut b = client.open(true).await.unwrap();
        let mut sa = server.accept().await.unwrap();
        let mut sb = server.accept().await.unwrap();
        assert_eq!(client.num_streams(), 2);

        a.shutdown().await.unwrap();
        drop(a);
        let mut rest = Vec::new();
        sa.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        b.write_all(b"still here").await.unwrap();
        let mut got = [0u8; 10];
        sb.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"still here");
        sb.write_all(b"ack").await.unwrap();
        let mut got = [0u8; 3];
        b.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ack");
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_session_close_fails_stream_operations() {
        let (client, server) = pair();
        let server = Arc::new(server);

        let mut stream = client.open(true).await.unwrap();
        let _peer = server.accept().await.unwrap();

        let pending_accept = {
            let server = server.clone();
            tokio::spawn(async move { server.accept().await })
        };

        Session::close(&client).await.unwrap();
        assert!(client.is_closed());

        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        let err = stream.write(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(matches!(client.open(false).await, Err(Error::SessionClosed)));

        // the peer notices the physical connection going away
        let accepted = tokio::time::timeout(Duration::from_secs(5), pending_accept)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(accepted, Err(Error::SessionClosed)));
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_unread_stream_does_not_stall_siblings() {
        let (client, server) = pair();

        let mut a = client.open(true).await.unwrap();
        let mut b = client.open(true).await.unwrap();
        let mut sa = server.accept().await.unwrap();
        let mut sb = server.accept().await.unwrap();

        // more than a full window; the writer parks once its credit runs out
        let total = 80 * MAX_FRAME_PAYLOAD;
        let flood = tokio::spawn(async move {
            a.write_all(&vec![7u8; total]).await.unwrap();
            a
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        b.write_all(b"hi").await.unwrap();
        let mut got = [0u8; 2];
        tokio::time::timeout(Duration::from_secs(2), sb.read_exact(&mut got))
            .await
            .expect("sibling stream starved")
            .unwrap();
        assert_eq!(&got, b"hi");

        // opens still complete, so control frames keep flowing
        let c = tokio::time::timeout(Duration::from_secs(2), client.open(true))
            .await
            .expect("open stalled")
            .unwrap();
        let _sc = server.accept().await.unwrap();
        assert_eq!(c.id(), 5);

        // draining the unread stream releases the parked writer
        let mut drained = vec![0u8; total];
        sa.read_exact(&mut drained).await.unwrap();
        assert!(drained.iter().all(|&byte| byte == 7));
        tokio::time::timeout(Duration::from_secs(2), flood)
            .await
            .expect("writer never got credit back")
            .unwrap();
    }

    #[tokio::test]
    async fn test_small_window_transfer() {
        let config = MuxConfig {
            stream_window: 2,
            ..MuxConfig::default()
        };
        let (client, server) = pair_with(config);
        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 249) as u8).collect();

        let reader = tokio::spawn(async move {
            let mut stream = server.accept().await.unwrap();
            let mut got = Vec::new();
            stream.read_to_end(&mut got).await.unwrap();
            got
        });

        let mut stream = client.open_stream().await.unwrap();
        stream.write_all(&payload).await.unwrap();
        stream.shutdown().await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .expect("transfer stalled")
            .unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn test_window_overrun_resets_stream() {
        let config = MuxConfig {
            stream_window: 2,
            ..MuxConfig::default()
        };
        let (a, mut raw) = duplex(64 * 1024);
        let client = MuxSession::new(Box::new(a), Role::Client, config, None, None);

        // a peer that ignores its window
        let mut wire = BytesMut::new();
        Frame::open(2).encode(&mut wire);
        for _ in 0..3 {
            Frame::data(2, Bytes::from_static(b"x")).encode(&mut wire);
        }
        raw.write_all(&wire).await.unwrap();

        let mut stream = client.accept().await.unwrap();
        loop {
            let frame = read_frame(&mut raw).await.unwrap().unwrap();
            if frame.frame_type == FrameType::Reset {
                assert_eq!(frame.stream_id, 2);
                break;
            }
        }

        let mut rest = Vec::new();
        let err = stream.read_to_end(&mut rest).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_ids_never_reused() {
        let (client, server) = pair();
        let mut last = 0;
        for _ in 0..5 {
            let stream = client.open(true).await.unwrap();
            let _peer = server.accept().await.unwrap();
            assert!(stream.id() > last);
            assert_eq!(stream.id() % 2, 1);
            last = stream.id();
        }

        let from_server = server.open(true).await.unwrap();
        assert_eq!(from_server.id() % 2, 0);
        let accepted = client.accept().await.unwrap();
        assert_eq!(accepted.id(), from_server.id());
    }

    #[tokio::test]
    async fn test_deadline() {
        let (client, server) = pair();
        let mut stream = client.open(true).await.unwrap();
        let _peer = server.accept().await.unwrap();

        stream.set_deadline(Some(Instant::now() + Duration::from_millis(50)));
        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        stream.set_deadline(None);
        stream.write_all(b"ok").await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_peer_closes_session() {
        let config = MuxConfig {
            ping_interval: Duration::from_millis(30),
            ping_retries: 1,
            ..MuxConfig::default()
        };
        // the far end of the pipe never answers
        let (a, _silent) = duplex(64 * 1024);
        let client = MuxSession::new(Box::new(a), Role::Client, config, None, None);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(client.is_closed());
        assert!(matches!(client.open(false).await, Err(Error::SessionClosed)));
    }

    #[tokio::test]
    async fn test_pings_keep_session_alive() {
        let config = MuxConfig {
            ping_interval: Duration::from_millis(30),
            ping_retries: 1,
            ..MuxConfig::default()
        };
        let (client, server) = pair_with(config);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!client.is_closed());
        assert!(!server.is_closed());
    }
}
