//! Tunnel connect request
//!
//! ```text
//! request: version(1) | alen(2, BE) | addr | ulen(1) | user | plen(1) | pass
//! reply:   status(1)  | rlen(1) | reason
//! ```
//!
//! `addr` is `host:port`. After a successful reply the connection carries the
//! tunnelled bytes unchanged.

use std::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::debug;

use crate::common::wire::{put_credentials, read_short_str, read_status, write_status};
use crate::common::{Address, Conn, Result};
use crate::error::{Error, Phase};
use crate::options::{ConnectOptions, UserInfo};
use crate::session::Stream;
use crate::transport::Connection;

use super::Connector;

const TUNNEL_VERSION: u8 = 0x01;

/// Outcome reported by the proxy
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Success = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    HostUnreachable = 0x03,
    ConnectionRefused = 0x04,
}

impl ReplyStatus {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x00 => Ok(Self::Success),
            0x01 => Ok(Self::GeneralFailure),
            0x02 => Ok(Self::NotAllowed),
            0x03 => Ok(Self::HostUnreachable),
            0x04 => Ok(Self::ConnectionRefused),
            _ => Err(Error::malformed(format!("unknown reply status 0x{:02x}", v))),
        }
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplyStatus::Success => "success",
            ReplyStatus::GeneralFailure => "general failure",
            ReplyStatus::NotAllowed => "not allowed",
            ReplyStatus::HostUnreachable => "host unreachable",
            ReplyStatus::ConnectionRefused => "connection refused",
        };
        f.write_str(s)
    }
}

/// A decoded connect request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub target: Address,
    pub user: Option<UserInfo>,
}

/// A proxy verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelReply {
    pub status: ReplyStatus,
    pub reason: String,
}

impl TunnelReply {
    pub fn success() -> Self {
        Self {
            status: ReplyStatus::Success,
            reason: String::new(),
        }
    }

    pub fn failure(status: ReplyStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    /// Map an error from reaching the target onto a reply
    pub fn from_error(err: &Error) -> Self {
        let status = match err {
            Error::InvalidAddress(_) => ReplyStatus::HostUnreachable,
            Error::Transport { source, .. } | Error::Io(source)
                if source.kind() == std::io::ErrorKind::ConnectionRefused =>
            {
                ReplyStatus::ConnectionRefused
            }
            Error::Timeout(_) => ReplyStatus::HostUnreachable,
            _ => ReplyStatus::GeneralFailure,
        };
        Self::failure(status, err.to_string())
    }
}

// ============================================================================
// Wire encoding
// ============================================================================

/// Write a connect request for `target`
pub async fn write_request<S>(conn: &mut S, target: &str, user: Option<&UserInfo>) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let alen = u16::try_from(target.len())
        .map_err(|_| Error::InvalidAddress(format!("target too long: {} bytes", target.len())))?;

    let mut buf = Vec::with_capacity(8 + target.len());
    buf.push(TUNNEL_VERSION);
    buf.extend_from_slice(&alen.to_be_bytes());
    buf.extend_from_slice(target.as_bytes());
    put_credentials(
        &mut buf,
        user.map(|u| (u.username.as_str(), u.password.as_deref().unwrap_or(""))),
    )?;

    conn.write_all(&buf).await?;
    conn.flush().await?;
    Ok(())
}

/// Read and decode a connect request
pub async fn read_request<S>(conn: &mut S) -> Result<TunnelRequest>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let version = conn.read_u8().await?;
    if version != TUNNEL_VERSION {
        return Err(Error::malformed(format!("unsupported tunnel version {}", version)));
    }

    let alen = conn.read_u16().await? as usize;
    let mut addr = vec![0u8; alen];
    conn.read_exact(&mut addr).await?;
    let addr = String::from_utf8(addr).map_err(|_| Error::malformed("target is not UTF-8"))?;
    let target: Address = addr.parse()?;

    let username = read_short_str(conn).await?;
    let password = read_short_str(conn).await?;
    let user = if username.is_empty() {
        None
    } else if password.is_empty() {
        Some(UserInfo::new(username))
    } else {
        Some(UserInfo::with_password(username, password))
    };

    Ok(TunnelRequest { target, user })
}

pub async fn write_reply<S>(conn: &mut S, reply: &TunnelReply) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    write_status(conn, reply.status as u8, &reply.reason).await
}

pub async fn read_reply<S>(conn: &mut S) -> Result<TunnelReply>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let (status, reason) = read_status(conn).await?;
    Ok(TunnelReply {
        status: ReplyStatus::from_u8(status)?,
        reason,
    })
}

// ============================================================================
// Connector
// ============================================================================

/// Connector speaking the tunnel connect request
#[derive(Debug, Default, Clone, Copy)]
pub struct TunnelConnector;

impl TunnelConnector {
    pub fn new() -> Self {
        Self
    }

    async fn request(&self, conn: Connection, target: &str, opts: &ConnectOptions) -> Result<Conn> {
        match conn {
            Connection::Plain(mut conn) => {
                exchange(&mut conn, target, opts).await?;
                Ok(conn)
            }
            Connection::Mux(session) => {
                let mut stream = session.open_stream_sync().await?;
                // a stalled exchange fails on the stream itself
                stream.set_deadline(Some(Instant::now() + opts.timeout));
                exchange(&mut stream, target, opts).await?;
                stream.set_deadline(None);
                Ok(Box::new(stream))
            }
        }
    }
}

/// Send the request and wait for a successful reply
async fn exchange<S>(conn: &mut S, target: &str, opts: &ConnectOptions) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    write_request(conn, target, opts.user.as_ref())
        .await
        .map_err(in_connect_phase)?;
    let reply = read_reply(conn).await.map_err(in_connect_phase)?;

    if reply.status != ReplyStatus::Success {
        let reason = if reply.reason.is_empty() {
            reply.status.to_string()
        } else {
            reply.reason
        };
        return Err(Error::rejected(Phase::Connect, reason));
    }

    debug!("Tunnel to {} established", target);
    Ok(())
}

fn in_connect_phase(err: Error) -> Error {
    match err {
        Error::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Error::malformed("connection closed before the reply")
        }
        Error::Io(e) => Error::transport(Phase::Connect, e),
        other => other,
    }
}

#[async_trait]
impl Connector for TunnelConnector {
    async fn connect(&self, conn: Connection, addr: &Address, opts: &ConnectOptions) -> Result<Conn> {
        let target = opts.addr.clone().unwrap_or_else(|| addr.to_string());
        tokio::time::timeout(opts.timeout, self.request(conn, &target, opts))
            .await
            .map_err(|_| Error::Timeout(Phase::Connect))?
    }
}
