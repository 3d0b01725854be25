//! Multiplexing frames
//!
//! Each frame has a 7-byte header: type(1) + stream_id(4) + payload_len(2),
//! followed by the payload.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

use super::StreamId;

/// Frame header size
pub const FRAME_HEADER_SIZE: usize = 7;

/// Maximum payload carried by one frame
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

/// Frame types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Open a new stream
    Open = 0x01,
    /// Stream accepted by the peer
    OpenAck = 0x02,
    Data = 0x03,
    /// Graceful half-close of the sender's side
    Close = 0x04,
    /// Abrupt termination, or refusal of an Open
    Reset = 0x05,
    Ping = 0x06,
    Pong = 0x07,
    /// Receiver consumed frames; payload is the u32 number of frames credited back
    WindowUpdate = 0x08,
}

impl FrameType {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(Self::Open),
            0x02 => Ok(Self::OpenAck),
            0x03 => Ok(Self::Data),
            0x04 => Ok(Self::Close),
            0x05 => Ok(Self::Reset),
            0x06 => Ok(Self::Ping),
            0x07 => Ok(Self::Pong),
            0x08 => Ok(Self::WindowUpdate),
            _ => Err(Error::malformed(format!("unknown frame type: 0x{:02x}", v))),
        }
    }
}

/// A multiplexing frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub stream_id: StreamId,
    pub payload: Bytes,
}

impl Frame {
    fn control(frame_type: FrameType, stream_id: StreamId) -> Self {
        Self {
            frame_type,
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn open(stream_id: StreamId) -> Self {
        Self::control(FrameType::Open, stream_id)
    }

    pub fn open_ack(stream_id: StreamId) -> Self {
        Self::control(FrameType::OpenAck, stream_id)
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            stream_id,
            payload,
        }
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::control(FrameType::Close, stream_id)
    }

    pub fn reset(stream_id: StreamId) -> Self {
        Self::control(FrameType::Reset, stream_id)
    }

    pub fn ping() -> Self {
        Self::control(FrameType::Ping, 0)
    }

    pub fn pong() -> Self {
        Self::control(FrameType::Pong, 0)
    }

    pub fn window_update(stream_id: StreamId, credit: u32) -> Self {
        Self {
            frame_type: FrameType::WindowUpdate,
            stream_id,
            payload: Bytes::copy_from_slice(&credit.to_be_bytes()),
        }
    }

    /// Credit carried by a `WindowUpdate` frame
    pub fn credit(&self) -> Result<u32> {
        let bytes: [u8; 4] = self.payload[..]
            .try_into()
            .map_err(|_| Error::malformed("window update without a 4-byte credit"))?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Append the encoded frame to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        debug_assert!(self.payload.len() <= MAX_FRAME_PAYLOAD);
        dst.reserve(FRAME_HEADER_SIZE + self.payload.len());
        dst.put_u8(self.frame_type as u8);
        dst.put_u32(self.stream_id);
        dst.put_u16(self.payload.len() as u16);
        dst.put_slice(&self.payload);
    }
}

/// Parse a frame header into (type, stream id, payload length)
pub fn decode_header(header: &[u8; FRAME_HEADER_SIZE]) -> Result<(FrameType, StreamId, usize)> {
    let frame_type = FrameType::from_u8(header[0])?;
    let stream_id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    let len = u16::from_be_bytes([header[5], header[6]]) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(Error::malformed(format!("frame payload too large: {} bytes", len)));
    }
    Ok((frame_type, stream_id, len))
}

/// Read one frame. Returns `None` on a clean EOF at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    }

    let (frame_type, stream_id, len) = decode_header(&header)?;
    let mut payload = BytesMut::zeroed(len);
    reader.read_exact(&mut payload).await?;

    Ok(Some(Frame {
        frame_type,
        stream_id,
        payload: payload.freeze(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_on_the_wire() {
        let mut wire = BytesMut::new();
        Frame::data(42, Bytes::from_static(b"hello world")).encode(&mut wire);
        Frame::close(42).encode(&mut wire);
        assert_eq!(&wire[..FRAME_HEADER_SIZE], &[0x03, 0, 0, 0, 42, 0, 11]);

        let mut reader = &wire[..];
        let data = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(data.frame_type, FrameType::Data);
        assert_eq!(data.stream_id, 42);
        assert_eq!(&data.payload[..], b"hello world");

        let close = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(close, Frame::close(42));

        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_window_update_credit() {
        let mut wire = BytesMut::new();
        Frame::window_update(7, 32).encode(&mut wire);
        assert_eq!(&wire[..], &[0x08, 0, 0, 0, 7, 0, 4, 0, 0, 0, 32]);

        let mut reader = &wire[..];
        let frame = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame.credit().unwrap(), 32);
        assert!(Frame::ping().credit().is_err());
    }

    #[test]
    fn test_reject_bad_header() {
        assert!(matches!(
            decode_header(&[0x09, 0, 0, 0, 1, 0, 0]),
            Err(Error::Malformed(_))
        ));
        assert!(matches!(
            decode_header(&[0x03, 0, 0, 0, 1, 0xff, 0xff]),
            Err(Error::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_an_error() {
        let mut wire = BytesMut::new();
        Frame::data(1, Bytes::from_static(b"abcdef")).encode(&mut wire);
        let mut reader = &wire[..wire.len() - 2];
        assert!(read_frame(&mut reader).await.is_err());
    }
}
