//! Burrow - relay core of a tunneling proxy
//!
//! # Architecture
//!
//! ```text
//! client side:  Transporter.dial → Transporter.handshake → Connector.connect → relay
//! server side:  Listener.accept → Handler.handle (handshake, reach target) → relay
//! ```
//!
//! ## Core Principles
//!
//! - The transport medium is pluggable: plain TCP (optionally TLS) or a
//!   session multiplexing many streams over one connection
//! - Every endpoint is a [`Conn`], so the relay never knows the medium
//! - The relay stops both directions before it returns
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Conn, Address
//! ├── transport/       # Transporters, keep-alive listener, relay, buffer pool
//! ├── session/         # Session/Stream contract and the frame multiplexer
//! ├── protocol/        # Connectors: tunnel connect request
//! ├── server/          # Listener registry, dispatch, tunnel handlers
//! ├── client.rs        # Transporter + Connector
//! └── app/             # Runtime: server or client mode proxy
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod transport;
pub mod session;
pub mod protocol;
pub mod client;
pub mod server;
pub mod app;

// Supporting modules
pub mod config;
pub mod options;
pub mod storage;

// Re-exports for convenience
pub use common::{Address, Conn};
pub use error::{Error, Phase, Result};
pub use config::Timeouts;

// Architecture re-exports
pub use app::{Runtime, RuntimeConfig};
pub use client::Client;
pub use protocol::Connector;
pub use server::{Handler, HandlerContext, Server};
pub use session::{Session, Stream};
pub use storage::{MemoryStorage, Storage};
pub use transport::{relay, Connection, Listener, Transporter};
