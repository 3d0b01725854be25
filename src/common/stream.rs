//! Connection handle abstraction
//!
//! Every layer hands connections around as a [`Conn`]: a boxed byte stream that
//! may be a raw TCP socket, a TLS stream or a multiplexed stream. The relay
//! engine only ever sees this minimal capability set.

use tokio::io::{AsyncRead, AsyncWrite};

/// The connection handle type used throughout the crate.
pub type Conn = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Combined trait for async read + write
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
