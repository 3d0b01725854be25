//! TCP transporter, optionally wrapped in TLS

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::common::{Address, Conn, Result};
use crate::error::{Error, Phase};
use crate::options::{DialOptions, HandshakeOptions};

use super::{Connection, Transporter};

/// Connect to `addr` within `opts.timeout`, with Nagle disabled
pub(crate) async fn dial_tcp(addr: &Address, opts: &DialOptions) -> Result<TcpStream> {
    let connect = async {
        match addr {
            Address::Socket(socket_addr) => TcpStream::connect(socket_addr).await,
            Address::Domain(domain, port) => TcpStream::connect((domain.as_str(), *port)).await,
        }
    };

    let stream = tokio::time::timeout(opts.timeout, connect)
        .await
        .map_err(|_| Error::Timeout(Phase::Dial))?
        .map_err(|e| Error::transport(Phase::Dial, e))?;

    // Disable Nagle's algorithm for lower latency
    stream.set_nodelay(true)?;
    debug!("Dialed {} ({:?})", addr, stream.peer_addr().ok());
    Ok(stream)
}

/// Plain TCP to the proxy server. One tunnel per connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransporter;

impl TcpTransporter {
    pub fn new() -> Self {
        Self
    }

    async fn tls_handshake(
        &self,
        conn: Conn,
        config: Arc<ClientConfig>,
        opts: &HandshakeOptions,
    ) -> Result<Conn> {
        let host = match (&opts.host, &opts.addr) {
            (Some(host), _) => host.clone(),
            (None, Some(addr)) => addr.parse::<Address>()?.host(),
            (None, None) => {
                return Err(Error::Config("TLS handshake needs a host or an address".into()))
            }
        };
        let server_name = ServerName::try_from(host.clone())
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", host, e)))?;

        let stream = TlsConnector::from(config)
            .connect(server_name, conn)
            .await
            .map_err(|e| Error::transport(Phase::Handshake, e))?;
        debug!("TLS established with {}", host);
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl Transporter for TcpTransporter {
    async fn dial(&self, addr: &Address, opts: &DialOptions) -> Result<Conn> {
        Ok(Box::new(dial_tcp(addr, opts).await?))
    }

    async fn handshake(&self, conn: Conn, opts: &HandshakeOptions) -> Result<Connection> {
        let Some(config) = opts.tls_config.clone() else {
            return Ok(Connection::Plain(conn));
        };

        let conn = tokio::time::timeout(opts.timeout, self.tls_handshake(conn, config, opts))
            .await
            .map_err(|_| Error::Timeout(Phase::Handshake))??;
        Ok(Connection::Plain(conn))
    }

    fn multiplex(&self) -> bool {
        false
    }
}
