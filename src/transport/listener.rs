//! Listeners
//!
//! [`KeepAliveListener`] is the one TCP listener type of the crate: every
//! accepted connection gets OS-level keep-alive with the configured period.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::common::{Address, Conn, Result};
use crate::error::Error;
use crate::options::ListenerOptions;

/// Listener trait for accepting incoming connections
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accept a new connection
    async fn accept(&self) -> Result<(Conn, SocketAddr)>;

    /// Get the local bound address
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Stop accepting and release the socket. Pending and later `accept`
    /// calls fail.
    async fn close(&self) -> Result<()>;
}

/// TCP listener enabling keep-alive on accepted connections
pub struct KeepAliveListener {
    // `None` once closed; accepts in flight hold their own clone
    listener: Mutex<Option<Arc<TcpListener>>>,
    keep_alive: Duration,
    close_notify: Notify,
}

impl KeepAliveListener {
    /// Resolve and bind `options.addr`
    pub async fn bind(options: &ListenerOptions) -> Result<Self> {
        let addr: Address = options.addr.parse()?;
        let socket_addr = addr.resolve().await?;
        let listener = TcpListener::bind(socket_addr).await?;
        Ok(Self::new(listener, options.keep_alive))
    }

    pub fn new(listener: TcpListener, keep_alive: Duration) -> Self {
        Self {
            listener: Mutex::new(Some(Arc::new(listener))),
            keep_alive,
            close_notify: Notify::new(),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// Accept the raw TCP stream with keep-alive applied.
    ///
    /// Accept errors are returned unchanged; retrying is up to the caller.
    pub async fn accept_tcp(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        let notified = self.close_notify.notified();
        tokio::pin!(notified);
        // register before checking the flag so a concurrent close is never missed
        notified.as_mut().enable();
        let listener = self.listener.lock().clone().ok_or_else(listener_closed)?;

        let (stream, peer) = tokio::select! {
            result = listener.accept() => result?,
            _ = &mut notified => return Err(listener_closed()),
        };

        let keepalive = TcpKeepalive::new().with_time(self.keep_alive);
        SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        // Disable Nagle's algorithm for lower latency
        stream.set_nodelay(true)?;

        Ok((stream, peer))
    }
}

fn listener_closed() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, "listener closed")
}

#[async_trait]
impl Listener for KeepAliveListener {
    async fn accept(&self) -> Result<(Conn, SocketAddr)> {
        let (stream, peer) = self.accept_tcp().await?;
        Ok((Box::new(stream), peer))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        match self.listener.lock().as_ref() {
            Some(listener) => listener.local_addr().map_err(Error::Io),
            None => Err(Error::Io(listener_closed())),
        }
    }

    async fn close(&self) -> Result<()> {
        let listener = self.listener.lock().take();
        self.close_notify.notify_waiters();
        drop(listener);
        Ok(())
    }
}
