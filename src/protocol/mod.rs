//! Proxy Protocol Layer
//!
//! Responsibilities:
//! - Ask the proxy for a logical connection to a final target
//! - Carry per-request credentials
//! - Parse the proxy's verdict
//!
//! A [`Connector`] runs after the transporter handshake and never dials the
//! proxy server itself.

pub mod tunnel;

pub use tunnel::{ReplyStatus, TunnelConnector, TunnelReply, TunnelRequest};

use async_trait::async_trait;

use crate::common::{Address, Conn, Result};
use crate::options::ConnectOptions;
use crate::transport::Connection;

/// Requests a tunnel to `addr` over an established connection
#[async_trait]
pub trait Connector: Send + Sync {
    /// Returns the connection application data should be relayed through.
    ///
    /// For a plain connection that is the connection itself; for a
    /// multiplexed one it is a fresh stream of the session.
    async fn connect(&self, conn: Connection, addr: &Address, opts: &ConnectOptions) -> Result<Conn>;
}
