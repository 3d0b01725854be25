//! Application Layer
//!
//! This module contains:
//! - Runtime: builds a tunnel server or client from a [`RuntimeConfig`]
//! - Forwarder: client-side flow (local accept → tunnel → relay)

mod forward;
mod runtime;

pub use forward::Forwarder;
pub use runtime::{Credential, Medium, Mode, Runtime, RuntimeConfig};
