//! Forwarder - client-side execution flow
//!
//! ```text
//! local accept → (reuse or establish) proxy connection
//!              → Connector.connect(target)
//!              → Bidirectional Relay
//! ```

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::client::Client;
use crate::common::{Address, Conn, Result};
use crate::options::{ConnectOptions, DialOptions, HandshakeOptions};
use crate::server::{Handler, HandlerContext};
use crate::session::Session;
use crate::transport::{dial_and_handshake, relay_with, Connection, RelayLimits};

/// Tunnels every accepted connection to a fixed target through the proxy.
///
/// With a multiplexing transporter one session is shared by all
/// connections and re-established once it closes; otherwise each
/// connection gets its own dial and handshake.
pub struct Forwarder {
    client: Client,
    server: Address,
    target: Address,
    dial: DialOptions,
    handshake: HandshakeOptions,
    connect: ConnectOptions,
    session: Mutex<Option<Arc<dyn Session>>>,
}

impl Forwarder {
    pub fn new(client: Client, server: Address, target: Address) -> Self {
        Self {
            client,
            handshake: HandshakeOptions::default().with_addr(server.to_string()),
            server,
            target,
            dial: DialOptions::default(),
            connect: ConnectOptions::default(),
            session: Mutex::new(None),
        }
    }

    pub fn with_dial_options(mut self, opts: DialOptions) -> Self {
        self.dial = opts;
        self
    }

    pub fn with_handshake_options(mut self, opts: HandshakeOptions) -> Self {
        self.handshake = opts;
        self
    }

    pub fn with_connect_options(mut self, opts: ConnectOptions) -> Self {
        self.connect = opts;
        self
    }

    async fn establish(&self) -> Result<Connection> {
        dial_and_handshake(
            self.client.transporter().as_ref(),
            &self.server,
            &self.dial,
            &self.handshake,
        )
        .await
    }

    /// A connection ready for one connect request
    pub async fn connection(&self) -> Result<Connection> {
        if !self.client.multiplex() {
            return self.establish().await;
        }

        let mut cached = self.session.lock().await;
        if let Some(session) = cached.as_ref() {
            if !session.is_closed() {
                return Ok(Connection::Mux(session.clone()));
            }
            debug!("Session to {} closed, re-establishing", self.server);
        }

        let connection = self.establish().await?;
        if let Connection::Mux(session) = &connection {
            *cached = Some(session.clone());
            info!("Session to {} established", self.server);
        }
        Ok(connection)
    }
}

#[async_trait]
impl Handler for Forwarder {
    async fn handle(&self, conn: Conn, ctx: HandlerContext) -> Result<()> {
        let start = Instant::now();

        let connection = self.connection().await?;
        let tunnel = self.client.connect(connection, &self.target, &self.connect).await?;
        info!(
            "[{}] {} -> {} via {}",
            ctx.tag, ctx.peer, self.target, self.server
        );

        let result = relay_with(conn, tunnel, RelayLimits::from_timeouts(&ctx.timeouts)).await;
        info!(
            "[{}] Closed: {} -> {} ({:?})",
            ctx.tag,
            ctx.peer,
            self.target,
            start.elapsed()
        );
        result
    }
}
