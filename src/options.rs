//! Option bundles for every configurable operation
//!
//! Each bundle is a plain struct whose `Default` holds the documented default
//! for every field. Bundles are built by chaining `with_*` setters:
//!
//! ```
//! use std::time::Duration;
//! use burrow::options::DialOptions;
//!
//! let opts = DialOptions::default().with_timeout(Duration::from_secs(3));
//! assert_eq!(opts.timeout, Duration::from_secs(3));
//! ```
//!
//! Setters only touch the field they name, so composing them in any order
//! yields the same bundle.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_rustls::rustls::ClientConfig;

use crate::config::Timeouts;
use crate::storage::Storage;

// ============================================================================
// Shared parameter types
// ============================================================================

/// User credentials carried by handshake and connect requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub username: String,
    pub password: Option<String>,
}

impl UserInfo {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: None,
        }
    }

    pub fn with_password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Some(password.into()),
        }
    }
}

/// KCP medium parameters, interpreted only by a KCP medium implementation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KcpConfig {
    pub mtu: u16,
    pub send_window: u16,
    pub recv_window: u16,
    pub no_delay: bool,
    /// Internal update interval in milliseconds
    pub interval: u32,
    pub resend: u32,
    pub no_congestion: bool,
    pub data_shards: u16,
    pub parity_shards: u16,
}

impl Default for KcpConfig {
    fn default() -> Self {
        Self {
            mtu: 1350,
            send_window: 1024,
            recv_window: 1024,
            no_delay: false,
            interval: 50,
            resend: 0,
            no_congestion: false,
            data_shards: 10,
            parity_shards: 3,
        }
    }
}

/// QUIC medium parameters, interpreted only by a QUIC medium implementation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuicConfig {
    pub keep_alive: bool,
    pub idle_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_incoming_streams: u32,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            keep_alive: true,
            idle_timeout: crate::config::DEFAULT_TTL,
            handshake_timeout: crate::config::DEFAULT_HANDSHAKE_TIMEOUT,
            max_incoming_streams: 100,
        }
    }
}

// ============================================================================
// Client-side bundles
// ============================================================================

/// Options for `Transporter::dial`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialOptions {
    pub timeout: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self::from_timeouts(&Timeouts::global())
    }
}

impl DialOptions {
    pub fn from_timeouts(timeouts: &Timeouts) -> Self {
        Self {
            timeout: timeouts.dial,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Options for `Transporter::handshake`
#[derive(Debug, Clone)]
pub struct HandshakeOptions {
    /// Proxy server address
    pub addr: Option<String>,
    /// Host name presented to the server (TLS SNI)
    pub host: Option<String>,
    pub user: Option<UserInfo>,
    pub timeout: Duration,
    /// Pause between attempts
    pub interval: Duration,
    /// Extra attempts after the first one fails
    pub retry: u32,
    pub tls_config: Option<Arc<ClientConfig>>,
    pub kcp_config: Option<KcpConfig>,
    pub quic_config: Option<QuicConfig>,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self::from_timeouts(&Timeouts::global())
    }
}

impl HandshakeOptions {
    pub fn from_timeouts(timeouts: &Timeouts) -> Self {
        Self {
            addr: None,
            host: None,
            user: None,
            timeout: timeouts.handshake,
            interval: Duration::ZERO,
            retry: 0,
            tls_config: None,
            kcp_config: None,
            quic_config: None,
        }
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_user(mut self, user: UserInfo) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    pub fn with_kcp_config(mut self, config: KcpConfig) -> Self {
        self.kcp_config = Some(config);
        self
    }

    pub fn with_quic_config(mut self, config: QuicConfig) -> Self {
        self.quic_config = Some(config);
        self
    }
}

/// Options for `Connector::connect`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Address the target is known by on the proxy side, if it differs
    pub addr: Option<String>,
    pub timeout: Duration,
    pub user: Option<UserInfo>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::from_timeouts(&Timeouts::global())
    }
}

impl ConnectOptions {
    pub fn from_timeouts(timeouts: &Timeouts) -> Self {
        Self {
            addr: None,
            timeout: timeouts.connect,
            user: None,
        }
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user(mut self, user: UserInfo) -> Self {
        self.user = Some(user);
        self
    }
}

// ============================================================================
// Server-side bundles
// ============================================================================

/// Options for binding a keep-alive listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerOptions {
    pub addr: String,
    pub keep_alive: Duration,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self::from_timeouts(&Timeouts::global())
    }
}

impl ListenerOptions {
    pub fn from_timeouts(timeouts: &Timeouts) -> Self {
        Self {
            addr: String::new(),
            keep_alive: timeouts.keep_alive,
        }
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn with_keep_alive(mut self, period: Duration) -> Self {
        self.keep_alive = period;
        self
    }
}

/// Options handed to `Handler::init`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerOptions {
    /// Tag used to prefix log lines
    pub tag: String,
    /// Overrides the server-wide table for this handler only
    pub timeouts: Option<Timeouts>,
}

impl HandlerOptions {
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = Some(timeouts);
        self
    }
}

/// Server-wide options applied by `Server::serve`
#[derive(Clone, Default)]
pub struct ServerOptions {
    pub addr: Option<String>,
    pub storage: Option<Arc<dyn Storage>>,
    /// Timeouts for handlers that do not carry their own
    pub timeouts: Timeouts,
}

impl ServerOptions {
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("addr", &self.addr)
            .field("storage", &self.storage.is_some())
            .field("timeouts", &self.timeouts)
            .finish()
    }
}
