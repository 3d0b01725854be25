//! Common types
//!
//! - Conn: unified async connection handle
//! - Address: dial/bind target representation
//! - wire: length-prefixed strings and status replies

mod address;
mod stream;
pub(crate) mod wire;

pub use address::Address;
pub use stream::{AsyncReadWrite, Conn};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
