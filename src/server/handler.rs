//! Server-side tunnel handlers

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::common::{Conn, Result};
use crate::error::{Error, Phase};
use crate::options::{DialOptions, HandlerOptions};
use crate::protocol::tunnel::{read_request, write_reply, ReplyStatus, TunnelReply, TunnelRequest};
use crate::session::{BoxedStream, MuxConfig, MuxSession, Role, Session, Stream};
use crate::storage::{user_key, Storage};
use crate::transport::mux::server_preamble;
use crate::transport::{relay_with, RelayLimits, TcpTransporter, Transporter};

use super::{Handler, HandlerContext};

/// Read the connect request, reach the target and answer the client.
///
/// Returns the target connection on success; on failure the client has
/// already been told why.
async fn open_tunnel<S>(conn: &mut S, ctx: &HandlerContext, check_user: bool) -> Result<Conn>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let request = tokio::time::timeout(ctx.timeouts.handshake, read_request(conn))
        .await
        .map_err(|_| Error::Timeout(Phase::Handshake))??;
    let TunnelRequest { target, user } = request;

    if check_user {
        if let Some(storage) = ctx.storage.as_deref() {
            let credentials = user
                .as_ref()
                .map(|u| (u.username.as_str(), u.password.as_deref()));
            if let Err(reason) = authorize(storage, credentials) {
                write_reply(conn, &TunnelReply::failure(ReplyStatus::NotAllowed, reason)).await?;
                return Err(Error::rejected(Phase::Connect, reason));
            }
        }
    }

    debug!("[{}] #{} connecting to {}", ctx.tag, ctx.id, target);
    let dial = DialOptions::from_timeouts(&ctx.timeouts).with_timeout(ctx.timeouts.connect);
    match TcpTransporter.dial(&target, &dial).await {
        Ok(upstream) => {
            write_reply(conn, &TunnelReply::success()).await?;
            info!("[{}] #{} {} -> {}", ctx.tag, ctx.id, ctx.peer, target);
            Ok(upstream)
        }
        Err(e) => {
            write_reply(conn, &TunnelReply::from_error(&e)).await?;
            Err(e)
        }
    }
}

fn authorize(storage: &dyn Storage, user: Option<(&str, Option<&str>)>) -> std::result::Result<(), &'static str> {
    let Some((name, password)) = user else {
        return Err("authentication required");
    };
    match storage.get(&user_key(name)) {
        Ok(Some(expected)) if Some(expected.as_str()) == password => Ok(()),
        Ok(_) => Err("invalid credentials"),
        Err(e) => {
            warn!("User lookup for {} failed: {}", name, e);
            Err("user lookup failed")
        }
    }
}

async fn tunnel(mut conn: Conn, ctx: HandlerContext) -> Result<()> {
    let upstream = open_tunnel(&mut conn, &ctx, true).await?;
    let result = relay_with(conn, upstream, RelayLimits::from_timeouts(&ctx.timeouts)).await;
    debug!("[{}] #{} relay finished: {:?}", ctx.tag, ctx.id, result.as_ref().err());
    result
}

/// Serve one multiplexed stream. The request must arrive and the target must
/// answer before the stream deadline; the relay then runs unbounded by it.
async fn stream_tunnel(mut stream: BoxedStream, ctx: HandlerContext) -> Result<()> {
    let id = stream.id();
    stream.set_deadline(Some(Instant::now() + ctx.timeouts.read + ctx.timeouts.connect));
    let upstream = open_tunnel(&mut stream, &ctx, false).await?;
    stream.set_deadline(None);

    let result = relay_with(stream, upstream, RelayLimits::from_timeouts(&ctx.timeouts)).await;
    debug!(
        "[{}] #{} stream {} relay finished: {:?}",
        ctx.tag,
        ctx.id,
        id,
        result.as_ref().err()
    );
    result
}

// ============================================================================
// Plain medium
// ============================================================================

/// One tunnel per TCP connection.
///
/// When the server has a storage attached, each request must carry a user
/// whose password matches `user:<name>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TunnelHandler;

impl TunnelHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Handler for TunnelHandler {
    async fn handle(&self, conn: Conn, ctx: HandlerContext) -> Result<()> {
        tunnel(conn, ctx).await
    }
}

// ============================================================================
// Multiplexed medium
// ============================================================================

/// One session per TCP connection, one tunnel per stream.
///
/// Credentials are checked once, in the session preamble.
#[derive(Debug, Default)]
pub struct MuxTunnelHandler {
    config: Option<MuxConfig>,
}

impl MuxTunnelHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: MuxConfig) -> Self {
        self.config = Some(config);
        self
    }
}

#[async_trait]
impl Handler for MuxTunnelHandler {
    /// Handler timeouts, when given, fix the session keep-alive settings
    fn init(&mut self, opts: &HandlerOptions) -> Result<()> {
        if self.config.is_none() {
            if let Some(timeouts) = &opts.timeouts {
                self.config = Some(MuxConfig::from_timeouts(timeouts));
            }
        }
        Ok(())
    }

    async fn handle(&self, mut conn: Conn, ctx: HandlerContext) -> Result<()> {
        let user = tokio::time::timeout(
            ctx.timeouts.handshake,
            server_preamble(&mut conn, ctx.storage.as_deref()),
        )
        .await
        .map_err(|_| Error::Timeout(Phase::Handshake))??;

        let config = self
            .config
            .clone()
            .unwrap_or_else(|| MuxConfig::from_timeouts(&ctx.timeouts));
        let session = Arc::new(MuxSession::new(
            conn,
            Role::Server,
            config,
            Some(ctx.local),
            Some(ctx.peer),
        ));
        info!("[{}] #{} session from {} (user: {:?})", ctx.tag, ctx.id, ctx.peer, user);

        let mut streams = 0u64;
        loop {
            let stream = match session.accept_stream().await {
                Ok(stream) => stream,
                Err(Error::SessionClosed) => break,
                Err(e) => return Err(e),
            };
            streams += 1;

            let ctx = ctx.clone();
            tokio::spawn(async move {
                let tag = ctx.tag.clone();
                let id = ctx.id;
                if let Err(e) = stream_tunnel(stream, ctx).await {
                    warn!("[{}] #{} stream {} error: {}", tag, id, streams, e);
                }
            });
        }

        debug!("[{}] #{} session closed after {} streams", ctx.tag, ctx.id, streams);
        Ok(())
    }
}
