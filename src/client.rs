//! Client: one transporter plus one connector

use std::sync::Arc;

use crate::common::{Address, Conn, Result};
use crate::options::{ConnectOptions, DialOptions, HandshakeOptions};
use crate::protocol::Connector;
use crate::transport::{Connection, Transporter};

/// Tunnel client.
///
/// Each call forwards to the matching component unchanged; retry policy
/// lives in [`dial_and_handshake`](crate::transport::dial_and_handshake).
#[derive(Clone)]
pub struct Client {
    transporter: Arc<dyn Transporter>,
    connector: Arc<dyn Connector>,
}

impl Client {
    pub fn new(transporter: Arc<dyn Transporter>, connector: Arc<dyn Connector>) -> Self {
        Self {
            transporter,
            connector,
        }
    }

    pub async fn dial(&self, addr: &Address, opts: &DialOptions) -> Result<Conn> {
        self.transporter.dial(addr, opts).await
    }

    pub async fn handshake(&self, conn: Conn, opts: &HandshakeOptions) -> Result<Connection> {
        self.transporter.handshake(conn, opts).await
    }

    pub async fn connect(&self, conn: Connection, addr: &Address, opts: &ConnectOptions) -> Result<Conn> {
        self.connector.connect(conn, addr, opts).await
    }

    /// Whether handshakes yield sessions that can carry many connects
    pub fn multiplex(&self) -> bool {
        self.transporter.multiplex()
    }

    pub fn transporter(&self) -> &Arc<dyn Transporter> {
        &self.transporter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::error::{Error, Phase};

    #[derive(Default)]
    struct Counting {
        dials: AtomicUsize,
        handshakes: AtomicUsize,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl Transporter for Arc<Counting> {
        async fn dial(&self, _addr: &Address, _opts: &DialOptions) -> Result<Conn> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (a, _b) = tokio::io::duplex(16);
            Ok(Box::new(a))
        }

        async fn handshake(&self, conn: Conn, _opts: &HandshakeOptions) -> Result<Connection> {
            self.handshakes.fetch_add(1, Ordering::SeqCst);
            Ok(Connection::Plain(conn))
        }

        fn multiplex(&self) -> bool {
            false
        }
    }

    #[async_trait]
    impl Connector for Arc<Counting> {
        async fn connect(&self, _conn: Connection, _addr: &Address, _opts: &ConnectOptions) -> Result<Conn> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Err(Error::rejected(Phase::Connect, "counted"))
        }
    }

    #[tokio::test]
    async fn test_client_delegates_once_per_call() {
        let counting = Arc::new(Counting::default());
        let client = Client::new(Arc::new(counting.clone()), Arc::new(counting.clone()));
        let addr = Address::domain("proxy.example", 1080);

        let conn = client.dial(&addr, &DialOptions::default()).await.unwrap();
        let connection = client
            .handshake(conn, &HandshakeOptions::default())
            .await
            .unwrap();
        let err = client
            .connect(connection, &addr, &ConnectOptions::default())
            .await
            .err()
            .expect("connect should fail");

        assert!(err.is_rejected());
        assert!(!client.multiplex());
        assert_eq!(counting.dials.load(Ordering::SeqCst), 1);
        assert_eq!(counting.handshakes.load(Ordering::SeqCst), 1);
        assert_eq!(counting.connects.load(Ordering::SeqCst), 1);
    }
}
