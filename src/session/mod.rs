//! Session Layer
//!
//! A [`Session`] is one physical connection carrying many independent
//! [`Stream`]s. Concrete mediums (QUIC, KCP, the in-crate frame multiplexer)
//! implement these traits; the rest of the crate only depends on them.
//!
//! Rules every implementation follows:
//! - open/accept may run concurrently with traffic on other streams
//! - closing a stream never affects its siblings
//! - closing the session fails pending and future stream operations with
//!   [`Error::SessionClosed`](crate::Error::SessionClosed)
//! - only the session closes the physical connection

pub mod frame;
mod mux;

pub use mux::{MuxConfig, MuxSession, MuxStream, Role};

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::common::Result;

/// Stream identifier, unique within its session and never reused
pub type StreamId = u32;

/// One logical, ordered, reliable byte channel inside a session
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {
    fn id(&self) -> StreamId;

    /// Reads and writes pending past `deadline` fail with `TimedOut`.
    /// `None` clears the deadline.
    fn set_deadline(&mut self, deadline: Option<Instant>);
}

pub type BoxedStream = Box<dyn Stream>;

/// A physical connection able to carry multiple streams
#[async_trait]
pub trait Session: Send + Sync {
    /// Open a stream without waiting for the peer; failures surface on first I/O
    async fn open_stream(&self) -> Result<BoxedStream>;

    /// Open a stream and wait until the peer has accepted it
    async fn open_stream_sync(&self) -> Result<BoxedStream>;

    /// Wait for the peer to open a stream
    async fn accept_stream(&self) -> Result<BoxedStream>;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn remote_addr(&self) -> Option<SocketAddr>;

    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}
