//! Runtime - configuration-driven proxy assembly
//!
//! The runtime is responsible for:
//! - Picking the transporter and handler for the configured medium
//! - Registering the listen address with a [`Server`]
//! - Managing lifecycle

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::client::Client;
use crate::common::{Address, Result};
use crate::config::Timeouts;
use crate::error::Error;
use crate::options::{
    ConnectOptions, DialOptions, HandlerOptions, HandshakeOptions, ListenerOptions,
    ServerOptions, UserInfo,
};
use crate::protocol::TunnelConnector;
use crate::server::{MuxTunnelHandler, Server, TunnelHandler};
use crate::storage::{MemoryStorage, Storage};
use crate::transport::{MuxTransporter, TcpTransporter, Transporter};

use super::forward::Forwarder;

const GROUP: &str = "proxy";

/// Which end of the tunnel this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Server,
    Client,
}

/// How client and server talk to each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Medium {
    /// One TCP connection per tunnel
    #[default]
    Tcp,
    /// Many tunnels multiplexed over one TCP connection
    Mux,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub name: String,
    pub password: String,
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub mode: Mode,
    #[serde(default)]
    pub medium: Medium,
    /// Local listen address
    pub listen: String,
    /// Proxy server address (client mode)
    #[serde(default)]
    pub server: Option<String>,
    /// Final destination of every tunnel (client mode)
    #[serde(default)]
    pub target: Option<String>,
    /// Accepted users (server mode); empty means no authentication
    #[serde(default)]
    pub users: Vec<Credential>,
    /// Credentials presented to the server (client mode)
    #[serde(default)]
    pub user: Option<Credential>,
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl RuntimeConfig {
    /// Server-mode configuration using the process-wide timeouts
    pub fn server(listen: impl Into<String>, medium: Medium) -> Self {
        Self {
            mode: Mode::Server,
            medium,
            listen: listen.into(),
            server: None,
            target: None,
            users: Vec::new(),
            user: None,
            timeouts: Timeouts::global(),
        }
    }

    /// Client-mode configuration using the process-wide timeouts
    pub fn client(
        listen: impl Into<String>,
        server: impl Into<String>,
        target: impl Into<String>,
        medium: Medium,
    ) -> Self {
        Self {
            mode: Mode::Client,
            server: Some(server.into()),
            target: Some(target.into()),
            ..Self::server(listen, medium)
        }
    }

    pub fn with_user(mut self, name: impl Into<String>, password: impl Into<String>) -> Self {
        let credential = Credential {
            name: name.into(),
            password: password.into(),
        };
        match self.mode {
            Mode::Server => self.users.push(credential),
            Mode::Client => self.user = Some(credential),
        }
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

/// Runtime manages the proxy lifecycle
pub struct Runtime {
    config: RuntimeConfig,
    server: Server,
}

impl Runtime {
    /// Validate the configuration; nothing is bound until [`start`](Self::start)
    pub fn from_config(config: RuntimeConfig) -> Result<Self> {
        if config.mode == Mode::Client {
            for (name, value) in [("server", &config.server), ("target", &config.target)] {
                let value = value
                    .as_deref()
                    .ok_or_else(|| Error::Config(format!("client mode needs a {} address", name)))?;
                value.parse::<Address>()?;
            }
        }
        Ok(Self {
            config,
            server: Server::new(),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Bind the listen address and start serving. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let config = &self.config;
        let listener_opts = ListenerOptions::from_timeouts(&config.timeouts).with_addr(&config.listen);
        let handler_opts = HandlerOptions::default()
            .with_tag(format!("{:?}/{:?}", config.mode, config.medium).to_lowercase());

        let addr = match (config.mode, config.medium) {
            (Mode::Server, Medium::Tcp) => {
                self.server
                    .add(GROUP, &listener_opts, TunnelHandler::new(), handler_opts)
                    .await?
            }
            (Mode::Server, Medium::Mux) => {
                self.server
                    .add(GROUP, &listener_opts, MuxTunnelHandler::new(), handler_opts)
                    .await?
            }
            (Mode::Client, _) => {
                let forwarder = self.build_forwarder()?;
                self.server
                    .add(GROUP, &listener_opts, forwarder, handler_opts)
                    .await?
            }
        };

        let mut server_opts = ServerOptions::default()
            .with_addr(addr.to_string())
            .with_timeouts(config.timeouts.clone());
        if config.mode == Mode::Server && !config.users.is_empty() {
            let storage = config
                .users
                .iter()
                .fold(MemoryStorage::new(), |storage, c| storage.with_user(&c.name, &c.password));
            server_opts = server_opts.with_storage(Arc::new(storage) as Arc<dyn Storage>);
        }
        self.server.serve(server_opts)?;

        info!(
            "Running in {:?} mode over {:?} on {}",
            config.mode, config.medium, addr
        );
        Ok(addr)
    }

    fn build_forwarder(&self) -> Result<Forwarder> {
        let config = &self.config;
        let server: Address = config
            .server
            .as_deref()
            .ok_or_else(|| Error::Config("client mode needs a server address".into()))?
            .parse()?;
        let target: Address = config
            .target
            .as_deref()
            .ok_or_else(|| Error::Config("client mode needs a target address".into()))?
            .parse()?;

        let transporter: Arc<dyn Transporter> = match config.medium {
            Medium::Tcp => Arc::new(TcpTransporter::new()),
            Medium::Mux => Arc::new(MuxTransporter::new()),
        };
        let client = Client::new(transporter, Arc::new(TunnelConnector::new()));

        let mut handshake =
            HandshakeOptions::from_timeouts(&config.timeouts).with_addr(server.to_string());
        let mut connect = ConnectOptions::from_timeouts(&config.timeouts);
        if let Some(user) = &config.user {
            let info = UserInfo::with_password(user.name.clone(), user.password.clone());
            handshake = handshake.with_user(info.clone());
            connect = connect.with_user(info);
        }

        Ok(Forwarder::new(client, server, target)
            .with_dial_options(DialOptions::from_timeouts(&config.timeouts))
            .with_handshake_options(handshake)
            .with_connect_options(connect))
    }

    /// Start, then serve until Ctrl+C
    pub async fn run(&self) -> Result<()> {
        self.start().await?;

        tokio::signal::ctrl_c().await?;
        info!("Shutting down...");

        self.close().await
    }

    pub async fn close(&self) -> Result<()> {
        self.server.close().await
    }
}
