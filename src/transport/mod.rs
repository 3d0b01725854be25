//! Transport Layer
//!
//! Responsibilities:
//! - Reach the proxy server (`dial`) and run the medium's handshake
//! - Report whether the handshake produced a multiplexed session
//! - Accept inbound connections with keep-alive ([`listener`])
//! - Pump bytes between two endpoints ([`relay`]) using pooled buffers ([`pool`])
//!
//! Target selection is NOT done here; that is the Connector's job.

pub mod listener;
pub mod mux;
pub mod pool;
pub mod relay;
mod tcp;

pub use listener::{KeepAliveListener, Listener};
pub use mux::MuxTransporter;
pub use pool::{BufferPool, PooledBuf, SizeClass};
pub use relay::{relay, relay_with, relay_with_pool, RelayLimits};
pub use tcp::TcpTransporter;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::common::{Address, Conn, Result};
use crate::options::{DialOptions, HandshakeOptions};
use crate::session::Session;

/// Result of a transporter handshake
pub enum Connection {
    /// One byte stream; each tunnel needs its own dial
    Plain(Conn),
    /// A session able to carry many tunnels
    Mux(Arc<dyn Session>),
}

impl Connection {
    pub fn is_multiplexed(&self) -> bool {
        matches!(self, Connection::Mux(_))
    }

    pub fn session(&self) -> Option<&Arc<dyn Session>> {
        match self {
            Connection::Mux(session) => Some(session),
            Connection::Plain(_) => None,
        }
    }
}

impl From<Conn> for Connection {
    fn from(conn: Conn) -> Self {
        Connection::Plain(conn)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connection::Plain(_) => write!(f, "Connection::Plain"),
            Connection::Mux(session) => write!(
                f,
                "Connection::Mux({:?}, closed: {})",
                session.remote_addr(),
                session.is_closed()
            ),
        }
    }
}

/// Establishes the link to a proxy server
///
/// Implementations own the medium: `dial` only proves reachability,
/// `handshake` runs whatever the medium needs before tunnels can be requested.
#[async_trait]
pub trait Transporter: Send + Sync {
    /// Open a raw connection to the proxy server at `addr`
    async fn dial(&self, addr: &Address, opts: &DialOptions) -> Result<Conn>;

    /// Run the medium handshake over a dialed connection
    async fn handshake(&self, conn: Conn, opts: &HandshakeOptions) -> Result<Connection>;

    /// Whether `handshake` yields a session that multiplexes tunnels
    fn multiplex(&self) -> bool;
}

/// Dial and handshake, retrying both as a unit.
///
/// Makes `1 + opts.retry` attempts with `opts.interval` between them and
/// returns the last error when all of them fail.
pub async fn dial_and_handshake(
    transporter: &dyn Transporter,
    addr: &Address,
    dial: &DialOptions,
    handshake: &HandshakeOptions,
) -> Result<Connection> {
    let attempts = handshake.retry.saturating_add(1);
    let mut attempt = 1;
    loop {
        let result = match transporter.dial(addr, dial).await {
            Ok(conn) => transporter.handshake(conn, handshake).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(connection) => return Ok(connection),
            Err(e) if attempt < attempts => {
                warn!("Attempt {}/{} to {} failed: {}", attempt, attempts, addr, e);
                attempt += 1;
                if !handshake.interval.is_zero() {
                    tokio::time::sleep(handshake.interval).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::error::{Error, Phase};

    /// Fails the first `failures` handshakes
    struct Flaky {
        failures: u32,
        dials: AtomicU32,
    }

    #[async_trait]
    impl Transporter for Flaky {
        async fn dial(&self, _addr: &Address, _opts: &DialOptions) -> Result<Conn> {
            let (a, _b) = tokio::io::duplex(64);
            self.dials.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(a))
        }

        async fn handshake(&self, conn: Conn, _opts: &HandshakeOptions) -> Result<Connection> {
            if self.dials.load(Ordering::SeqCst) <= self.failures {
                return Err(Error::rejected(Phase::Handshake, "not yet"));
            }
            Ok(Connection::Plain(conn))
        }

        fn multiplex(&self) -> bool {
            false
        }
    }

    fn target() -> Address {
        "127.0.0.1:1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_single_attempt_by_default() {
        let flaky = Flaky {
            failures: 1,
            dials: AtomicU32::new(0),
        };
        let result = dial_and_handshake(
            &flaky,
            &target(),
            &DialOptions::default(),
            &HandshakeOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(Error::Rejected { .. })));
        assert_eq!(flaky.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_with_interval() {
        let flaky = Flaky {
            failures: 2,
            dials: AtomicU32::new(0),
        };
        let opts = HandshakeOptions::default()
            .with_retry(2)
            .with_interval(Duration::from_millis(20));

        let started = tokio::time::Instant::now();
        let connection = dial_and_handshake(&flaky, &target(), &DialOptions::default(), &opts)
            .await
            .unwrap();
        assert!(!connection.is_multiplexed());
        assert_eq!(flaky.dials.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
