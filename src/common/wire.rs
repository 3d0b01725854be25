//! Byte-level helpers shared by the session preamble and the tunnel request
//!
//! ```text
//! short string: len(1) | bytes
//! status reply: status(1) | rlen(1) | reason
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Append `s` with a one-byte length prefix
pub fn put_short_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = u8::try_from(s.len())
        .map_err(|_| Error::Config(format!("credential longer than 255 bytes: {}", s.len())))?;
    buf.push(len);
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Append a user/password pair; `None` encodes as two empty strings
pub fn put_credentials(buf: &mut Vec<u8>, user: Option<(&str, &str)>) -> Result<()> {
    let (name, password) = user.unwrap_or(("", ""));
    put_short_str(buf, name)?;
    put_short_str(buf, password)
}

pub async fn read_short_str<S>(conn: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let len = conn.read_u8().await? as usize;
    let mut buf = vec![0u8; len];
    conn.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| Error::malformed("credential is not UTF-8"))
}

/// Write a status reply; the reason is cut to 255 bytes
pub async fn write_status<S>(conn: &mut S, status: u8, reason: &str) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let reason = &reason.as_bytes()[..reason.len().min(255)];
    let mut buf = Vec::with_capacity(2 + reason.len());
    buf.push(status);
    buf.push(reason.len() as u8);
    buf.extend_from_slice(reason);
    conn.write_all(&buf).await?;
    conn.flush().await?;
    Ok(())
}

/// Read a status reply as (status, reason)
pub async fn read_status<S>(conn: &mut S) -> Result<(u8, String)>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut head = [0u8; 2];
    conn.read_exact(&mut head).await?;
    let mut reason = vec![0u8; head[1] as usize];
    conn.read_exact(&mut reason).await?;
    Ok((head[0], String::from_utf8_lossy(&reason).into_owned()))
}
