//! Multiplexed transporter
//!
//! Dials TCP, exchanges a short preamble and then runs a [`MuxSession`] over
//! the connection. Preamble layout:
//!
//! ```text
//! client -> server: magic "BRW" | version(1) | ulen(1) | user | plen(1) | pass
//! server -> client: status(1) | rlen(1) | reason
//! ```
//!
//! `ulen == 0` means no credentials. Status `0x00` accepts the session.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::common::wire::{put_credentials, read_short_str, read_status, write_status};
use crate::common::{Address, Conn, Result};
use crate::error::{Error, Phase};
use crate::options::{DialOptions, HandshakeOptions, UserInfo};
use crate::session::{MuxConfig, MuxSession, Role};
use crate::storage::{user_key, Storage};

use super::tcp::dial_tcp;
use super::{Connection, Transporter};

const MAGIC: &[u8; 3] = b"BRW";
const VERSION: u8 = 1;

const STATUS_OK: u8 = 0x00;
const STATUS_AUTH_FAILED: u8 = 0x01;
const STATUS_BAD_VERSION: u8 = 0x02;

/// TCP dial plus frame multiplexer session
#[derive(Debug, Clone, Default)]
pub struct MuxTransporter {
    config: MuxConfig,
}

impl MuxTransporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: MuxConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl Transporter for MuxTransporter {
    async fn dial(&self, addr: &Address, opts: &DialOptions) -> Result<Conn> {
        Ok(Box::new(dial_tcp(addr, opts).await?))
    }

    async fn handshake(&self, mut conn: Conn, opts: &HandshakeOptions) -> Result<Connection> {
        tokio::time::timeout(opts.timeout, client_preamble(&mut conn, opts.user.as_ref()))
            .await
            .map_err(|_| Error::Timeout(Phase::Handshake))??;

        let remote = opts
            .addr
            .as_deref()
            .and_then(|addr| addr.parse::<SocketAddr>().ok());
        let session = MuxSession::new(conn, Role::Client, self.config.clone(), None, remote);
        Ok(Connection::Mux(Arc::new(session)))
    }

    fn multiplex(&self) -> bool {
        true
    }
}

/// Client half of the preamble
pub async fn client_preamble<S>(conn: &mut S, user: Option<&UserInfo>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut request = Vec::with_capacity(64);
    request.extend_from_slice(MAGIC);
    request.push(VERSION);
    put_credentials(
        &mut request,
        user.map(|u| (u.username.as_str(), u.password.as_deref().unwrap_or(""))),
    )?;
    conn.write_all(&request)
        .await
        .map_err(|e| Error::transport(Phase::Handshake, e))?;
    conn.flush()
        .await
        .map_err(|e| Error::transport(Phase::Handshake, e))?;

    let (status, reason) = read_status(conn).await.map_err(in_handshake_phase)?;
    match status {
        STATUS_OK => Ok(()),
        STATUS_AUTH_FAILED | STATUS_BAD_VERSION => Err(Error::rejected(Phase::Handshake, reason)),
        other => Err(Error::malformed(format!("unknown handshake status 0x{:02x}", other))),
    }
}

/// Server half of the preamble.
///
/// Without a storage every client is accepted. With one, a client that sends a
/// user must present the password stored under `user:<name>`; anonymous
/// clients are refused.
pub async fn server_preamble<S>(conn: &mut S, storage: Option<&dyn Storage>) -> Result<Option<String>>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut head = [0u8; 4];
    conn.read_exact(&mut head)
        .await
        .map_err(|e| Error::transport(Phase::Handshake, e))?;
    if &head[..3] != MAGIC {
        return Err(Error::malformed("bad session preamble"));
    }
    if head[3] != VERSION {
        write_status(conn, STATUS_BAD_VERSION, "unsupported version")
            .await
            .map_err(in_handshake_phase)?;
        return Err(Error::malformed(format!("unsupported preamble version {}", head[3])));
    }

    let username = read_short_str(conn).await.map_err(in_handshake_phase)?;
    let password = read_short_str(conn).await.map_err(in_handshake_phase)?;

    let verdict = match storage {
        None => Ok(()),
        Some(_) if username.is_empty() => Err("authentication required"),
        Some(storage) => match storage.get(&user_key(&username))? {
            Some(expected) if expected == password => Ok(()),
            _ => Err("invalid credentials"),
        },
    };

    match verdict {
        Ok(()) => {
            write_status(conn, STATUS_OK, "")
                .await
                .map_err(in_handshake_phase)?;
            debug!("Session preamble accepted (user: {:?})", username);
            Ok((!username.is_empty()).then_some(username))
        }
        Err(reason) => {
            write_status(conn, STATUS_AUTH_FAILED, reason)
                .await
                .map_err(in_handshake_phase)?;
            Err(Error::rejected(Phase::Handshake, reason))
        }
    }
}

fn in_handshake_phase(err: Error) -> Error {
    match err {
        Error::Io(e) => Error::transport(Phase::Handshake, e),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_anonymous_without_storage() {
        let (mut client, mut server) = duplex(1024);
        let (c, s) = tokio::join!(
            client_preamble(&mut client, None),
            server_preamble(&mut server, None)
        );
        c.unwrap();
        assert_eq!(s.unwrap(), None);
    }

    #[tokio::test]
    async fn test_user_checked_against_storage() {
        let storage = MemoryStorage::new().with_user("alice", "secret");

        let (mut client, mut server) = duplex(1024);
        let good = UserInfo::with_password("alice", "secret");
        let (c, s) = tokio::join!(
            client_preamble(&mut client, Some(&good)),
            server_preamble(&mut server, Some(&storage))
        );
        c.unwrap();
        assert_eq!(s.unwrap().as_deref(), Some("alice"));

        let (mut client, mut server) = duplex(1024);
        let bad = UserInfo::with_password("alice", "guess");
        let (c, s) = tokio::join!(
            client_preamble(&mut client, Some(&bad)),
            server_preamble(&mut server, Some(&storage))
        );
        match c {
            Err(Error::Rejected { phase, reason }) => {
                assert_eq!(phase, Phase::Handshake);
                assert_eq!(reason, "invalid credentials");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert!(s.unwrap_err().is_rejected());
    }

    #[tokio::test]
    async fn test_anonymous_refused_when_storage_attached() {
        let storage = MemoryStorage::new().with_user("alice", "secret");
        let (mut client, mut server) = duplex(1024);
        let (c, _) = tokio::join!(
            client_preamble(&mut client, None),
            server_preamble(&mut server, Some(&storage))
        );
        assert!(c.unwrap_err().is_rejected());
    }

    #[tokio::test]
    async fn test_garbage_preamble() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        assert!(matches!(
            server_preamble(&mut server, None).await,
            Err(Error::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_handshake_yields_session() {
        let (client, mut server) = duplex(64 * 1024);
        let accept = tokio::spawn(async move {
            server_preamble(&mut server, None).await.unwrap();
            server
        });

        let transporter = MuxTransporter::new();
        assert!(transporter.multiplex());
        let connection = transporter
            .handshake(Box::new(client), &HandshakeOptions::default().with_addr("127.0.0.1:9"))
            .await
            .unwrap();
        let session = connection.session().unwrap();
        assert!(!session.is_closed());
        assert_eq!(session.remote_addr(), Some("127.0.0.1:9".parse().unwrap()));
        let _server = accept.await.unwrap();
    }
}
